// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities intended for the verifier's harness and the test suite.

pub mod log;
pub mod poll;

pub use log::ConfigLogging;
pub use log::ConfigLoggingIfExists;
pub use log::ConfigLoggingLevel;
pub use log::LogContext;

/// Set up a [`LogContext`] appropriate for a test named `test_name`
///
/// Log output goes to a per-test file under the temporary directory so that
/// it does not interleave with the test harness's own output.  The file is
/// removed by [`LogContext::cleanup_successful()`].
pub fn test_setup_log(test_name: &str) -> LogContext {
    let log_config = ConfigLogging::File {
        level: ConfigLoggingLevel::Trace,
        path: String::from(log::UNUSED_PATH),
        if_exists: ConfigLoggingIfExists::Fail,
    };

    LogContext::new(test_name, &log_config)
}
