// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! What a simulated node looks like from the inside

use crate::cluster::ChangePayload;
use crate::cluster::ConfigurationChange;
use std::collections::BTreeMap;

const KERNEL_VERSION: &str = "4.18.0-305.el8.x86_64";
const RT_KERNEL_VERSION: &str = "4.18.0-305.rt7.72.el8.x86_64";

const BASE_CMDLINE: &[&str] = &[
    "BOOT_IMAGE=(hd0,gpt3)/ostree/rhcos-0/vmlinuz-4.18.0-305.el8.x86_64",
    "rw",
    "ostree=/ostree/boot.1/rhcos/0",
    "ignition.platform.id=metal",
    "root=UUID=6a7cc4b6-8b0a-4c0a-9a9d-6f0c6b1f3b52",
    "rootflags=prjquota",
];

const INSTALLER_KEY: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIGs4 core@installer";

/// Everything the verifier's probes can see on a node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeFacts {
    pub kernel_arguments: Vec<String>,
    pub kernel_type: String,
    /// installed packages, by name, with their full version string
    pub packages: BTreeMap<String, String>,
    /// `core`'s authorized keys
    pub authorized_keys: Vec<String>,
}

impl NodeFacts {
    /// A freshly installed node with nothing applied on top
    pub fn base() -> NodeFacts {
        let packages = ["kernel", "kernel-core", "kernel-modules"]
            .iter()
            .map(|name| {
                (name.to_string(), format!("{}-{}", name, KERNEL_VERSION))
            })
            .collect();
        NodeFacts {
            kernel_arguments: Vec::new(),
            kernel_type: String::from("default"),
            packages,
            authorized_keys: vec![String::from(INSTALLER_KEY)],
        }
    }

    /// The node that results from applying `changes` on top of the base.
    ///
    /// With `ignore_kernel_arguments` set, kernel arguments are silently
    /// dropped, as by a rollout mechanism with a bug.
    pub fn render<'a, I>(changes: I, ignore_kernel_arguments: bool) -> NodeFacts
    where
        I: IntoIterator<Item = &'a ConfigurationChange>,
    {
        let mut facts = NodeFacts::base();
        for change in changes {
            match change.payload() {
                ChangePayload::KernelArguments(args) => {
                    if !ignore_kernel_arguments {
                        facts.kernel_arguments.extend(
                            args.iter()
                                .map(|a| a.trim().to_owned())
                                .filter(|a| !a.is_empty()),
                        );
                    }
                }
                ChangePayload::KernelType(kernel_type) => {
                    facts.kernel_type = kernel_type.clone();
                }
                ChangePayload::Extensions(extensions) => {
                    for name in extensions {
                        facts.install(name);
                        if name == "kernel-devel" {
                            facts.install("kernel-headers");
                        }
                    }
                }
                ChangePayload::AuthorizedKey { user, key } => {
                    if user == "core" {
                        facts.authorized_keys.push(key.clone());
                    }
                }
            }
        }
        if facts.kernel_type == "realtime" {
            for name in ["kernel", "kernel-core", "kernel-modules"] {
                facts.packages.remove(name);
            }
            for name in ["kernel-rt-core", "kernel-rt-modules"] {
                let version = format!("{}-{}", name, RT_KERNEL_VERSION);
                facts.packages.insert(name.to_owned(), version);
            }
        }
        facts
    }

    fn install(&mut self, name: &str) {
        let version = if name.starts_with("kernel-") {
            format!("{}-{}", name, KERNEL_VERSION)
        } else {
            format!("{}-1.0.0-1.el8.x86_64", name)
        };
        self.packages.insert(name.to_owned(), version);
    }

    /// Whether moving from `self` to `next` takes a reboot.  Only changes
    /// to authorized keys can be applied live.
    pub fn requires_reboot(&self, next: &NodeFacts) -> bool {
        self.kernel_arguments != next.kernel_arguments
            || self.kernel_type != next.kernel_type
            || self.packages != next.packages
    }

    pub fn cmdline(&self) -> String {
        BASE_CMDLINE
            .iter()
            .copied()
            .chain(self.kernel_arguments.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A failed command: exit status, stdout, stderr
pub type CommandFailure = (i32, String, String);

/// Run one of the read-only commands the verifier uses.
pub fn exec(
    facts: &NodeFacts,
    uptime: f64,
    argv: &[String],
) -> Result<String, CommandFailure> {
    let args: Vec<&str> = argv.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["cat", path] => cat(facts, uptime, path),
        ["chroot", "/rootfs", "rpm", "-q", names @ ..] if !names.is_empty() => {
            rpm_query(facts, names)
        }
        ["chroot", "/rootfs", "rpm", "-qa", names @ ..] => {
            Ok(rpm_query_all(facts, names))
        }
        [command, ..] => Err((
            127,
            String::new(),
            format!("{}: command not found\n", command),
        )),
        [] => Err((126, String::new(), String::from("empty command\n"))),
    }
}

fn cat(
    facts: &NodeFacts,
    uptime: f64,
    path: &str,
) -> Result<String, CommandFailure> {
    match path {
        "/rootfs/proc/cmdline" => Ok(format!("{}\n", facts.cmdline())),
        "/rootfs/proc/uptime" => {
            Ok(format!("{:.2} {:.2}\n", uptime, uptime * 3.5))
        }
        "/rootfs/home/core/.ssh/authorized_keys" => {
            let mut contents = facts.authorized_keys.join("\n");
            contents.push('\n');
            Ok(contents)
        }
        _ => Err((
            1,
            String::new(),
            format!("cat: {}: No such file or directory\n", path),
        )),
    }
}

/// `rpm -q`: fails if any named package is missing.
fn rpm_query(
    facts: &NodeFacts,
    names: &[&str],
) -> Result<String, CommandFailure> {
    let mut stdout = String::new();
    let mut missing = false;
    for name in names {
        match facts.packages.get(*name) {
            Some(version) => stdout.push_str(&format!("{}\n", version)),
            None => {
                missing = true;
                stdout.push_str(&format!(
                    "package {} is not installed\n",
                    name
                ));
            }
        }
    }
    if missing {
        Err((1, stdout, String::new()))
    } else {
        Ok(stdout)
    }
}

/// `rpm -qa`: lists whichever of the named packages are installed.
fn rpm_query_all(facts: &NodeFacts, names: &[&str]) -> String {
    facts
        .packages
        .iter()
        .filter(|(name, _)| names.is_empty() || names.contains(&name.as_str()))
        .map(|(_, version)| format!("{}\n", version))
        .collect()
}
