// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logging configuration and construction of root loggers

use serde::Deserialize;
use slog::o;
use slog::Drain;
use slog::Level;
use slog::Logger;
use std::fs::OpenOptions;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

/// Placeholder path meaning "pick a per-test file under the temp directory"
pub const UNUSED_PATH: &str = "UNUSED";

/// Name recorded in every bunyan-formatted log record
const LOG_NAME: &str = "sno-e2e";

#[derive(Debug, thiserror::Error)]
#[error("open log file \"{path}\": {err}")]
pub struct LogInitError {
    path: String,
    #[source]
    err: std::io::Error,
}

/// Where log records go and at what level
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode")]
pub enum ConfigLogging {
    /// Human-readable records on stderr
    #[serde(rename = "stderr-terminal")]
    StderrTerminal { level: ConfigLoggingLevel },
    /// Bunyan-formatted JSON records appended to (or replacing) a file
    #[serde(rename = "file")]
    File {
        level: ConfigLoggingLevel,
        path: String,
        if_exists: ConfigLoggingIfExists,
    },
}

impl Default for ConfigLogging {
    fn default() -> Self {
        ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Info }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigLoggingIfExists {
    Fail,
    Truncate,
    Append,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigLoggingLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl From<ConfigLoggingLevel> for Level {
    fn from(config_level: ConfigLoggingLevel) -> Level {
        match config_level {
            ConfigLoggingLevel::Trace => Level::Trace,
            ConfigLoggingLevel::Debug => Level::Debug,
            ConfigLoggingLevel::Info => Level::Info,
            ConfigLoggingLevel::Warn => Level::Warning,
            ConfigLoggingLevel::Error => Level::Error,
            ConfigLoggingLevel::Critical => Level::Critical,
        }
    }
}

impl ConfigLogging {
    /// Create the root logger based on the requested configuration.
    pub fn to_logger(&self) -> Result<Logger, LogInitError> {
        match self {
            ConfigLogging::StderrTerminal { level } => {
                let decorator = slog_term::TermDecorator::new().build();
                let drain =
                    slog_term::FullFormat::new(decorator).build().fuse();
                Ok(async_root_logger(*level, drain))
            }

            ConfigLogging::File { level, path, if_exists } => {
                let mut open_options = OpenOptions::new();
                open_options.write(true);
                open_options.create(true);

                match if_exists {
                    ConfigLoggingIfExists::Fail => {
                        open_options.create_new(true);
                    }
                    ConfigLoggingIfExists::Append => {
                        open_options.append(true);
                    }
                    ConfigLoggingIfExists::Truncate => {
                        open_options.truncate(true);
                    }
                }

                let file = open_log_file(&open_options, Path::new(path))?;
                let drain =
                    slog_bunyan::with_name(LOG_NAME, file).build().fuse();
                Ok(async_root_logger(*level, drain))
            }
        }
    }
}

// We use an async drain for every root logger so that log calls made from
// inside the tokio runtime never block on the terminal or on file I/O.
fn async_root_logger<T>(level: ConfigLoggingLevel, drain: T) -> Logger
where
    T: Drain + Send + 'static,
    <T as Drain>::Err: std::fmt::Debug,
{
    let pid = std::process::id();
    let level_drain = slog::LevelFilter(drain, Level::from(level)).fuse();
    let async_drain = slog_async::Async::new(level_drain).build().fuse();
    Logger::root(async_drain, o!("pid" => pid))
}

fn open_log_file(
    open_options: &OpenOptions,
    path: &Path,
) -> Result<std::fs::File, LogInitError> {
    let init_error =
        |err| LogInitError { path: path.display().to_string(), err };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(init_error)?;
    }
    let file = open_options.open(path).map_err(init_error)?;

    // Record a message to stderr so that a reader who doesn't already know
    // how logging is configured knows where the rest of the log messages went.
    eprintln!("note: configured to log to \"{}\"", path.display());
    Ok(file)
}

static TEST_LOGGER_ID: AtomicU32 = AtomicU32::new(0);

/// A logger for one test, plus whatever is needed to clean up after it
pub struct LogContext {
    pub log: Logger,
    log_path: Option<PathBuf>,
}

impl LogContext {
    /// Build the logger described by `log_config` for test `test_name`.
    ///
    /// A file configuration whose path is [`UNUSED_PATH`] is redirected to
    /// a unique file under the temporary directory.
    pub fn new(test_name: &str, log_config: &ConfigLogging) -> LogContext {
        let (log_config, log_path) = match log_config {
            ConfigLogging::File { level, path, if_exists }
                if path == UNUSED_PATH =>
            {
                let id = TEST_LOGGER_ID.fetch_add(1, Ordering::SeqCst);
                let log_path = std::env::temp_dir().join(format!(
                    "{}-{}.{}.{}.log",
                    LOG_NAME,
                    test_name,
                    std::process::id(),
                    id
                ));
                let config = ConfigLogging::File {
                    level: *level,
                    path: log_path.display().to_string(),
                    if_exists: *if_exists,
                };
                (config, Some(log_path))
            }
            // A path the caller chose is theirs to keep.
            _ => (log_config.clone(), None),
        };

        let log = log_config
            .to_logger()
            .unwrap_or_else(|e| panic!("failed to set up test log: {}", e))
            .new(o!("test_name" => test_name.to_owned()));
        LogContext { log, log_path }
    }

    /// Removes the per-test log file created for [`UNUSED_PATH`], if any.
    /// Call this only when the test passed: on failure the file is left
    /// behind for debugging.
    pub fn cleanup_successful(self) {
        if let Some(path) = &self.log_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_config_stderr_terminal() {
        let config: ConfigLogging = toml::from_str(
            r#"
            mode = "stderr-terminal"
            level = "debug"
            "#,
        )
        .expect("valid config");
        assert_eq!(
            config,
            ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Debug }
        );
    }

    #[test]
    fn test_config_file() {
        let config: ConfigLogging = toml::from_str(
            r#"
            mode = "file"
            level = "warn"
            path = "/var/tmp/sno-e2e.log"
            if_exists = "append"
            "#,
        )
        .expect("valid config");
        assert_eq!(
            config,
            ConfigLogging::File {
                level: ConfigLoggingLevel::Warn,
                path: String::from("/var/tmp/sno-e2e.log"),
                if_exists: ConfigLoggingIfExists::Append,
            }
        );
    }

    #[test]
    fn test_config_bad_mode() {
        let error = toml::from_str::<ConfigLogging>(
            r#"
            mode = "syslog"
            level = "info"
            "#,
        )
        .expect_err("expected failure");
        assert!(error.to_string().contains("unknown variant"));
    }

    #[test]
    fn test_log_context_cleanup_removes_file() {
        let logctx = crate::dev::test_setup_log("log_context_cleanup");
        let path = logctx.log_path.clone().expect("file-backed log context");
        slog::info!(logctx.log, "hello");
        assert!(path.exists());
        logctx.cleanup_successful();
        assert!(!path.exists());
    }

    #[test]
    fn test_log_context_cleanup_keeps_chosen_file() {
        let path = std::env::temp_dir().join(format!(
            "{}-chosen.{}.log",
            LOG_NAME,
            std::process::id()
        ));
        let config = ConfigLogging::File {
            level: ConfigLoggingLevel::Info,
            path: path.display().to_string(),
            if_exists: ConfigLoggingIfExists::Append,
        };
        let logctx = LogContext::new("log_context_chosen_file", &config);
        assert!(logctx.log_path.is_none());
        slog::info!(logctx.log, "hello");
        logctx.cleanup_successful();
        assert!(path.exists());
        std::fs::remove_file(&path).expect("removing chosen log file");
    }
}
