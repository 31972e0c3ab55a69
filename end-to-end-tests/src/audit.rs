// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Checks on the configuration daemon's logs

use crate::cluster::ClusterError;
use crate::cluster::DaemonLogReader;
use slog::info;
use slog::warn;
use slog::Logger;
use std::fmt;

/// Logged by the daemon when it cannot refresh its service account token
pub const TOKEN_ROTATION_FAILURE: &str = "Unable to rotate token";

/// One offending log line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditFinding {
    pub pod: String,
    pub node: Option<String>,
    pub line: String,
}

impl fmt::Display for AuditFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node {
            Some(node) => {
                write!(f, "{} (node {}): {}", self.pod, node, self.line)
            }
            None => write!(f, "{}: {}", self.pod, self.line),
        }
    }
}

/// Scan every daemon's log for token rotation failures.
///
/// Returns every matching line.  An empty result means the audit passed.
pub async fn audit_daemon_tokens(
    log: &Logger,
    reader: &dyn DaemonLogReader,
) -> Result<Vec<AuditFinding>, ClusterError> {
    let logs = reader.daemon_logs().await?;
    let findings: Vec<AuditFinding> = logs
        .iter()
        .flat_map(|daemon| {
            daemon
                .contents
                .lines()
                .filter(|line| line.contains(TOKEN_ROTATION_FAILURE))
                .map(move |line| AuditFinding {
                    pod: daemon.pod.clone(),
                    node: daemon.node.clone(),
                    line: line.trim().to_owned(),
                })
        })
        .collect();

    if findings.is_empty() {
        info!(log, "daemon token audit passed"; "pods" => logs.len());
    } else {
        for finding in &findings {
            warn!(log, "daemon failed to rotate its token";
                "pod" => &finding.pod,
                "line" => &finding.line,
            );
        }
    }
    Ok(findings)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cluster::DaemonLog;
    use async_trait::async_trait;
    use sno_test_utils::dev::test_setup_log;

    struct FixedLogs(Vec<DaemonLog>);

    #[async_trait]
    impl DaemonLogReader for FixedLogs {
        async fn daemon_logs(&self) -> Result<Vec<DaemonLog>, ClusterError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_audit_finds_rotation_failures() {
        let logctx = test_setup_log("test_audit_finds_rotation_failures");
        let reader = FixedLogs(vec![
            DaemonLog {
                pod: String::from("machine-config-daemon-abcde"),
                node: Some(String::from("master-0")),
                contents: String::from(
                    "I0101 starting daemon\n\
                     E0101 Unable to rotate token: permission denied\n\
                     I0101 update complete\n",
                ),
            },
            DaemonLog {
                pod: String::from("machine-config-daemon-fghij"),
                node: None,
                contents: String::from("I0101 starting daemon\n"),
            },
        ]);

        let findings = audit_daemon_tokens(&logctx.log, &reader)
            .await
            .expect("logs are readable");
        assert_eq!(
            findings,
            vec![AuditFinding {
                pod: String::from("machine-config-daemon-abcde"),
                node: Some(String::from("master-0")),
                line: String::from(
                    "E0101 Unable to rotate token: permission denied"
                ),
            }]
        );
        assert!(findings[0].to_string().contains("(node master-0)"));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_audit_clean_logs() {
        let logctx = test_setup_log("test_audit_clean_logs");
        let reader = FixedLogs(vec![DaemonLog {
            pod: String::from("machine-config-daemon-abcde"),
            node: None,
            contents: String::from("I0101 rotated token\n"),
        }]);
        let findings = audit_daemon_tokens(&logctx.log, &reader)
            .await
            .expect("logs are readable");
        assert!(findings.is_empty());
        logctx.cleanup_successful();
    }
}
