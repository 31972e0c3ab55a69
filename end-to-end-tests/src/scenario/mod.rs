// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The configuration changes the verifier knows how to roll out and check
//!
//! A [`ScenarioSpec`] pairs one [`ChangePayload`] with the command that shows
//! its effect on the node and the tokens that command must print.  Running
//! one is the job of [`runner::ScenarioRunner`].

pub mod runner;

use crate::cluster::ChangePayload;
use crate::facts::split_kernel_arguments;
use crate::facts::Expectation;
use crate::facts::Matcher;

pub use runner::ChangeLease;
pub use runner::ScenarioPhase;
pub use runner::ScenarioReport;
pub use runner::ScenarioRunner;

/// Key added by the no-reboot scenario
pub const TEST_AUTHORIZED_KEY: &str =
    "test adding authorized key without node reboot";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScenarioSpec {
    pub name: &'static str,
    /// prefix for the generated configuration change name
    pub change_prefix: &'static str,
    pub payload: ChangePayload,
    /// command whose output must contain every expected token once the
    /// change is applied
    pub apply_probe: Vec<String>,
    /// command whose output must contain none of the expected tokens once
    /// the change is removed
    pub rollback_probe: Vec<String>,
    pub expectation: Expectation,
    /// whether the node must stay up across the whole apply and rollback
    pub forbids_reboot: bool,
}

fn argv(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| String::from(*w)).collect()
}

impl ScenarioSpec {
    /// Add kernel arguments, one of which holds a value with a space in it.
    pub fn kernel_arguments() -> ScenarioSpec {
        let kargs = argv(&["foo=bar", "foo=baz", " baz=test bar=hello world"]);
        let probe = argv(&["cat", "/rootfs/proc/cmdline"]);
        ScenarioSpec {
            name: "kernel-arguments",
            change_prefix: "kargs",
            expectation: Expectation::new(
                Matcher::KernelArgument,
                split_kernel_arguments(&kargs),
            ),
            payload: ChangePayload::KernelArguments(kargs),
            apply_probe: probe.clone(),
            rollback_probe: probe,
            forbids_reboot: false,
        }
    }

    /// Switch the node to the realtime kernel.
    pub fn kernel_type() -> ScenarioSpec {
        let probe =
            argv(&["chroot", "/rootfs", "rpm", "-qa", "kernel-rt-core"]);
        ScenarioSpec {
            name: "kernel-type",
            change_prefix: "kerneltype",
            payload: ChangePayload::KernelType(String::from("realtime")),
            apply_probe: probe.clone(),
            rollback_probe: probe,
            expectation: Expectation::new(
                Matcher::Substring,
                argv(&["kernel-rt-core"]),
            ),
            forbids_reboot: false,
        }
    }

    /// Install extensions.  `kernel-devel` pulls in `kernel-headers`.
    ///
    /// `rpm -q` fails for any package that is missing, so after rollback the
    /// packages are listed with `rpm -qa` instead, which succeeds with empty
    /// output.
    pub fn extensions() -> ScenarioSpec {
        let packages = ["usbguard", "kernel-devel", "kernel-headers"];
        let mut apply_probe = argv(&["chroot", "/rootfs", "rpm", "-q"]);
        apply_probe.extend(argv(&packages));
        let mut rollback_probe = argv(&["chroot", "/rootfs", "rpm", "-qa"]);
        rollback_probe.extend(argv(&packages));
        ScenarioSpec {
            name: "extensions",
            change_prefix: "extensions",
            payload: ChangePayload::Extensions(argv(&[
                "usbguard",
                "kernel-devel",
            ])),
            apply_probe,
            rollback_probe,
            expectation: Expectation::new(Matcher::Substring, argv(&packages)),
            forbids_reboot: false,
        }
    }

    /// Add an SSH key for `core`, which must not reboot the node.
    pub fn no_reboot() -> ScenarioSpec {
        let probe = argv(&["cat", "/rootfs/home/core/.ssh/authorized_keys"]);
        ScenarioSpec {
            name: "no-reboot",
            change_prefix: "authorized-key",
            payload: ChangePayload::AuthorizedKey {
                user: String::from("core"),
                key: String::from(TEST_AUTHORIZED_KEY),
            },
            apply_probe: probe.clone(),
            rollback_probe: probe,
            expectation: Expectation::new(
                Matcher::Substring,
                argv(&[TEST_AUTHORIZED_KEY]),
            ),
            forbids_reboot: true,
        }
    }

    /// Every scenario, in the order a full run executes them
    pub fn builtin() -> Vec<ScenarioSpec> {
        vec![
            ScenarioSpec::kernel_arguments(),
            ScenarioSpec::kernel_type(),
            ScenarioSpec::extensions(),
            ScenarioSpec::no_reboot(),
        ]
    }

    pub fn find(name: &str) -> Option<ScenarioSpec> {
        ScenarioSpec::builtin().into_iter().find(|s| s.name == name)
    }
}
