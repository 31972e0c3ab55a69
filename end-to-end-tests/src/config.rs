// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing the verifier's configuration file

use serde::Deserialize;
use serde::Deserializer;
use sno_test_utils::dev::ConfigLogging;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read \"{path}\": {err}")]
    Read {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("parse \"{path}\": {err}")]
    Parse {
        path: PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

/// Configuration for one run of the verifier
///
/// Every field is optional in the file; the defaults target the control
/// plane pool of a single-node cluster.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// pool whose rendered configuration is tracked
    pub pool: String,
    /// role label put on submitted changes and used to find the node
    pub role: String,
    /// time between observations while waiting for convergence
    #[serde(deserialize_with = "deserialize_duration")]
    pub poll_interval: Duration,
    /// upper bound on each wait for the pool and node to converge
    #[serde(deserialize_with = "deserialize_duration")]
    pub convergence_timeout: Duration,
    /// upper bound on waiting for a change to be rendered into the pool
    #[serde(deserialize_with = "deserialize_duration")]
    pub render_timeout: Duration,
    /// end a wait as soon as the daemon reports `Degraded` or
    /// `Unreconcilable`, instead of waiting for the timeout
    pub fail_fast_on_degraded: bool,
    pub daemon: DaemonPodConfig,
    pub log: ConfigLogging,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            pool: String::from("master"),
            role: String::from("master"),
            poll_interval: Duration::from_secs(2),
            convergence_timeout: Duration::from_secs(20 * 60),
            render_timeout: Duration::from_secs(20 * 60),
            fail_fast_on_degraded: false,
            daemon: DaemonPodConfig::default(),
            log: ConfigLogging::default(),
        }
    }
}

impl RunConfig {
    /// Load a `RunConfig` from the given TOML file.
    pub fn from_file(path: &Path) -> Result<RunConfig, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|err| {
            ConfigError::Read { path: path.to_owned(), err }
        })?;
        toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.to_owned(), err })
    }
}

/// Where the configuration daemon runs, for exec and log access
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonPodConfig {
    pub namespace: String,
    pub selector: String,
    pub container: String,
}

impl Default for DaemonPodConfig {
    fn default() -> Self {
        DaemonPodConfig {
            namespace: String::from("openshift-machine-config-operator"),
            selector: String::from("k8s-app=machine-config-daemon"),
            container: String::from("machine-config-daemon"),
        }
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod test {
    use super::*;
    use sno_test_utils::dev::ConfigLoggingIfExists;
    use sno_test_utils::dev::ConfigLoggingLevel;
    use std::fs;

    fn read_config(
        label: &str,
        contents: &str,
    ) -> Result<RunConfig, ConfigError> {
        let mut path = std::env::temp_dir();
        path.push(format!("sno-e2e-config.{}.{}", std::process::id(), label));
        fs::write(&path, contents).expect("write to tempfile failed");

        let result = RunConfig::from_file(&path);
        fs::remove_file(&path).expect("failed to remove temporary file");
        result
    }

    #[test]
    fn test_config_nonexistent() {
        let error = RunConfig::from_file(Path::new("/nonexistent"))
            .expect_err("expected config to fail from /nonexistent");
        assert!(matches!(error, ConfigError::Read { .. }));
        assert!(error.to_string().starts_with("read \"/nonexistent\": "));
    }

    #[test]
    fn test_config_bad_toml() {
        let error =
            read_config("bad_toml", "pool =").expect_err("expected failure");
        assert!(matches!(error, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_config_empty() {
        let config = read_config("empty", "").expect("empty config is valid");
        assert_eq!(config, RunConfig::default());
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.convergence_timeout, Duration::from_secs(1200));
    }

    #[test]
    fn test_config_full() {
        let config = read_config(
            "full",
            r#"
            pool = "worker"
            role = "worker"
            poll_interval = "500ms"
            convergence_timeout = "5m"
            render_timeout = "90s"
            fail_fast_on_degraded = true

            [daemon]
            namespace = "mco"
            selector = "app=mcd"
            container = "daemon"

            [log]
            mode = "file"
            level = "debug"
            path = "/var/tmp/sno-e2e.log"
            if_exists = "truncate"
            "#,
        )
        .expect("valid config");

        assert_eq!(config.pool, "worker");
        assert_eq!(config.role, "worker");
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.convergence_timeout, Duration::from_secs(300));
        assert_eq!(config.render_timeout, Duration::from_secs(90));
        assert!(config.fail_fast_on_degraded);
        assert_eq!(
            config.daemon,
            DaemonPodConfig {
                namespace: String::from("mco"),
                selector: String::from("app=mcd"),
                container: String::from("daemon"),
            }
        );
        assert_eq!(
            config.log,
            ConfigLogging::File {
                level: ConfigLoggingLevel::Debug,
                path: String::from("/var/tmp/sno-e2e.log"),
                if_exists: ConfigLoggingIfExists::Truncate,
            }
        );
    }

    #[test]
    fn test_config_partial_daemon_section() {
        let config = read_config(
            "partial_daemon",
            r#"
            [daemon]
            container = "daemon"
            "#,
        )
        .expect("valid config");
        assert_eq!(config.daemon.container, "daemon");
        assert_eq!(
            config.daemon.namespace,
            DaemonPodConfig::default().namespace
        );
    }

    #[test]
    fn test_config_bad_duration() {
        let error = read_config("bad_duration", "poll_interval = \"soon\"")
            .expect_err("expected failure");
        assert!(matches!(error, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_config_unknown_field() {
        let error = read_config("unknown_field", "nodes = 3")
            .expect_err("expected failure");
        assert!(error.to_string().contains("unknown field"));
    }
}
