// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Checking what is actually on the node
//!
//! Commands run through a [`NodeExecutor`] and are never retried: by the
//! time facts are checked the pool has converged, so a failed command is a
//! failed scenario rather than a sign to wait longer.

use crate::cluster::NodeExecutor;
use crate::error::ScenarioError;
use slog::debug;
use slog::Logger;
use std::sync::Arc;

/// Command that prints the node's uptime in seconds as its first field
pub fn uptime_command() -> Vec<String> {
    vec![String::from("cat"), String::from("/rootfs/proc/uptime")]
}

pub struct NodeFactVerifier {
    log: Logger,
    executor: Arc<dyn NodeExecutor>,
}

impl NodeFactVerifier {
    pub fn new(log: &Logger, executor: Arc<dyn NodeExecutor>) -> Self {
        NodeFactVerifier { log: log.clone(), executor }
    }

    /// Run `argv` on `node` and return its stdout.
    pub async fn run(
        &self,
        node: &str,
        argv: &[String],
    ) -> Result<String, ScenarioError> {
        let output = self.executor.exec(node, argv).await?;
        debug!(self.log, "ran command on node";
            "node" => node,
            "command" => argv.join(" "),
            "output" => &output,
        );
        Ok(output)
    }

    /// Returns how long `node` has been up, in seconds.
    pub async fn uptime(&self, node: &str) -> Result<f64, ScenarioError> {
        let output = self.run(node, &uptime_command()).await?;
        parse_uptime(&output).ok_or_else(|| ScenarioError::AssertionMismatch {
            what: format!("uptime of node {}", node),
            expected: String::from("seconds as a decimal number"),
            observed: output,
        })
    }
}

/// Parses the first field of `/proc/uptime`.
pub fn parse_uptime(output: &str) -> Option<f64> {
    output.split_whitespace().next()?.parse().ok()
}

/// Fails unless `after >= before`.
///
/// Uptime only goes down across a reboot, so this is how a scenario shows
/// that the node did not reboot between two checkpoints.
pub fn check_uptime_monotonic(
    node: &str,
    checkpoint: &str,
    before: f64,
    after: f64,
) -> Result<(), ScenarioError> {
    if after >= before {
        Ok(())
    } else {
        Err(ScenarioError::AssertionMismatch {
            what: format!("uptime of node {} {}", node, checkpoint),
            expected: format!("at least {}s (no reboot)", before),
            observed: format!("{}s", after),
        })
    }
}

/// Split kernel arguments the way they end up on the kernel command line.
///
/// Each input may hold several space-separated arguments.  Double quotes
/// group words into one argument.  A bare word (one without `=`) that
/// follows a `key=value` argument in the same input continues that
/// argument's value, so `" baz=test bar=hello world"` yields `baz=test` and
/// `bar=hello world`.
pub fn split_kernel_arguments<S: AsRef<str>>(args: &[S]) -> Vec<String> {
    let mut tokens = Vec::new();
    for arg in args {
        let mut current: Option<String> = None;
        for word in split_words(arg.as_ref()) {
            let continues = !word.contains('=')
                && matches!(&current, Some(token) if token.contains('='));
            if continues {
                if let Some(token) = current.as_mut() {
                    token.push(' ');
                    token.push_str(&word);
                }
            } else {
                tokens.extend(current.replace(word));
            }
        }
        tokens.extend(current);
    }
    tokens
}

fn split_words(s: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut quoted = false;
    for c in s.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                word.push(c);
            }
            c if c.is_whitespace() && !quoted => {
                if !word.is_empty() {
                    words.push(std::mem::take(&mut word));
                }
            }
            c => word.push(c),
        }
    }
    if !word.is_empty() {
        words.push(word);
    }
    words
}

/// Returns true if `token` appears in `cmdline` delimited by whitespace (or
/// the ends of the line) on both sides.
///
/// The command line carries no grouping of its own: the kernel reads
/// `bar=hello world` as `bar=hello` followed by a separate `world`.  So a
/// token that is the leading words of a multi-word argument is reported as
/// present, exactly as the kernel would see it.
pub fn contains_kernel_argument(cmdline: &str, token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    cmdline.match_indices(token).any(|(start, _)| {
        let end = start + token.len();
        let delimited_before = cmdline[..start]
            .chars()
            .next_back()
            .map_or(true, char::is_whitespace);
        let delimited_after =
            cmdline[end..].chars().next().map_or(true, char::is_whitespace);
        delimited_before && delimited_after
    })
}

/// How a token is looked for in command output
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Matcher {
    /// whitespace-delimited, as on the kernel command line
    KernelArgument,
    /// plain substring, as for package names and key material
    Substring,
}

impl Matcher {
    pub fn matches(&self, output: &str, token: &str) -> bool {
        match self {
            Matcher::KernelArgument => contains_kernel_argument(output, token),
            Matcher::Substring => output.contains(token),
        }
    }
}

/// Tokens that must appear in a probe's output once a change is applied,
/// and must not appear once it is rolled back
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expectation {
    pub matcher: Matcher,
    pub tokens: Vec<String>,
}

impl Expectation {
    pub fn new(matcher: Matcher, tokens: Vec<String>) -> Self {
        Expectation { matcher, tokens }
    }

    pub fn missing<'a>(&'a self, output: &str) -> Vec<&'a str> {
        self.tokens
            .iter()
            .filter(|t| !self.matcher.matches(output, t))
            .map(String::as_str)
            .collect()
    }

    pub fn present<'a>(&'a self, output: &str) -> Vec<&'a str> {
        self.tokens
            .iter()
            .filter(|t| self.matcher.matches(output, t))
            .map(String::as_str)
            .collect()
    }

    /// Fails unless every token is in `output`.
    pub fn check_present(
        &self,
        what: &str,
        output: &str,
    ) -> Result<(), ScenarioError> {
        let missing = self.missing(output);
        if missing.is_empty() {
            return Ok(());
        }
        Err(ScenarioError::AssertionMismatch {
            what: what.to_owned(),
            expected: format!(
                "{:?} present (missing {:?})",
                self.tokens, missing
            ),
            observed: output.to_owned(),
        })
    }

    /// Fails if any token is in `output`.
    pub fn check_absent(
        &self,
        what: &str,
        output: &str,
    ) -> Result<(), ScenarioError> {
        let present = self.present(output);
        if present.is_empty() {
            return Ok(());
        }
        Err(ScenarioError::AssertionMismatch {
            what: what.to_owned(),
            expected: format!(
                "none of {:?} (found {:?})",
                self.tokens, present
            ),
            observed: output.to_owned(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    const CMDLINE: &str = "BOOT_IMAGE=(hd0,gpt3)/ostree/vmlinuz rw \
        ostree=/ostree/boot.1/rhcos/0 root=UUID=00000000 \
        foo=bar foo=baz baz=test bar=hello world";
    const ARGS: [&str; 3] = ["foo=bar", "foo=baz", " baz=test bar=hello world"];

    #[test]
    fn test_split_kernel_arguments() {
        let tokens = split_kernel_arguments(&ARGS);
        assert_eq!(
            tokens.iter().map(String::as_str).collect::<BTreeSet<_>>(),
            BTreeSet::from([
                "foo=bar",
                "foo=baz",
                "baz=test",
                "bar=hello world"
            ])
        );
        assert_eq!(tokens.len(), 4);
    }

    #[test]
    fn test_split_kernel_arguments_quotes_and_flags() {
        assert_eq!(
            split_kernel_arguments(&["nosmt quiet", "dyndbg=\"file a.c +p\""]),
            vec!["nosmt", "quiet", "dyndbg=\"file a.c +p\""]
        );
        assert!(split_kernel_arguments(&["   "]).is_empty());
    }

    #[test]
    fn test_contains_kernel_argument_respects_boundaries() {
        assert!(contains_kernel_argument(CMDLINE, "foo=bar"));
        assert!(contains_kernel_argument(CMDLINE, "bar=hello world"));
        assert!(contains_kernel_argument(CMDLINE, "rw"));
        assert!(!contains_kernel_argument(CMDLINE, "foo=ba"));
        assert!(!contains_kernel_argument(CMDLINE, "oo=bar"));
        assert!(!contains_kernel_argument(CMDLINE, "hello wor"));
        assert!(!contains_kernel_argument(CMDLINE, "bar=hello worl"));
        assert!(!contains_kernel_argument(CMDLINE, ""));
    }

    #[test]
    fn test_contains_kernel_argument_sees_words_as_the_kernel_does() {
        // Nothing on the command line groups "world" with "bar=hello".
        assert!(contains_kernel_argument(CMDLINE, "bar=hello"));
        assert!(contains_kernel_argument(CMDLINE, "world"));
        assert!(contains_kernel_argument(CMDLINE, "baz=test bar=hello"));
        assert!(!contains_kernel_argument(
            "root=UUID=1 bar=hello-world",
            "bar=hello"
        ));
    }

    #[test]
    fn test_expectation_present_and_absent() {
        let expectation = Expectation::new(
            Matcher::KernelArgument,
            split_kernel_arguments(&ARGS),
        );
        expectation.check_present("kargs", CMDLINE).expect("all present");
        let error = expectation
            .check_absent("kargs", CMDLINE)
            .expect_err("tokens are present");
        assert_eq!(error.kind(), "assertion-mismatch");

        let rolled_back = "BOOT_IMAGE=(hd0,gpt3)/ostree/vmlinuz rw";
        expectation.check_absent("kargs", rolled_back).expect("none present");
        assert_eq!(expectation.missing(rolled_back).len(), 4);
    }

    #[test]
    fn test_substring_expectation() {
        let expectation = Expectation::new(
            Matcher::Substring,
            vec![String::from("usbguard"), String::from("kernel-headers")],
        );
        let output = "usbguard-1.0.0-8.el8.x86_64\nkernel-devel-4.18.0\n";
        assert_eq!(expectation.missing(output), vec!["kernel-headers"]);
        assert_eq!(expectation.present(output), vec!["usbguard"]);
        assert!(expectation.check_present("packages", output).is_err());
    }

    #[test]
    fn test_parse_uptime() {
        assert_eq!(parse_uptime("3517.52 13860.73\n"), Some(3517.52));
        assert_eq!(parse_uptime("12 34"), Some(12.0));
        assert_eq!(parse_uptime(""), None);
        assert_eq!(parse_uptime("up 3 days"), None);
    }

    #[test]
    fn test_uptime_monotonic() {
        check_uptime_monotonic("master-0", "after apply", 100.0, 100.0)
            .expect("equal uptime is not a reboot");
        check_uptime_monotonic("master-0", "after apply", 100.0, 160.5)
            .expect("uptime increased");
        let error =
            check_uptime_monotonic("master-0", "after rollback", 100.0, 4.2)
                .expect_err("uptime decreased");
        assert!(error.to_string().contains("after rollback"));
    }

    proptest! {
        /// Joining simple `key=value` arguments with spaces and splitting
        /// them again gives back the same arguments.
        #[test]
        fn test_split_simple_arguments(
            args in prop::collection::vec("[a-z]{1,8}=[a-z0-9]{1,8}", 0..8)
        ) {
            let joined = args.join(" ");
            prop_assert_eq!(split_kernel_arguments(&[joined]), args);
        }

        /// Every token split out of some arguments is found in a command
        /// line built by joining those arguments.
        #[test]
        fn test_split_tokens_found_in_cmdline(
            args in prop::collection::vec(
                "[a-z]{1,6}(=[a-z]{1,6})?( [a-z]{1,6})?",
                1..6,
            )
        ) {
            let cmdline = format!("BOOT_IMAGE=/vmlinuz {} rw", args.join(" "));
            for token in split_kernel_arguments(&args) {
                prop_assert!(
                    contains_kernel_argument(&cmdline, &token),
                    "{:?} not found in {:?}", token, cmdline
                );
            }
        }
    }
}
