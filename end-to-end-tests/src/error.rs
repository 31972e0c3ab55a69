// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Errors that fail (or, for cleanup, taint) a scenario

use crate::cluster::ClusterError;
use crate::cluster::ExecError;
use std::time::Duration;
use thiserror::Error;

/// Why a scenario failed
///
/// Every variant carries what was expected and what was last observed, so a
/// report is useful without digging through the logs.
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// the rollout mechanism never rendered a configuration containing the
    /// change
    #[error(
        "pool {pool} never rendered a configuration including {change} \
         (waited {elapsed:?}){}",
        detail_suffix(.last_observed)
    )]
    RenderedConfigNotFound {
        pool: String,
        change: String,
        elapsed: Duration,
        last_observed: Option<String>,
    },

    /// the pool or its node did not reach the target in time
    #[error(
        "pool {pool} is still not updated to {target}, \
         waited {elapsed:?}{}",
        detail_suffix(.last_observed)
    )]
    ConvergenceTimeout {
        pool: String,
        target: String,
        elapsed: Duration,
        last_observed: Option<String>,
    },

    /// the daemon reported a failed rollout and the run is configured to
    /// stop waiting when that happens
    #[error(
        "node {node} reported {state} while pool {pool} was converging \
         on {target} (after {elapsed:?}){}",
        detail_suffix(.reason)
    )]
    Degraded {
        pool: String,
        target: String,
        node: String,
        state: String,
        reason: Option<String>,
        elapsed: Duration,
    },

    /// a verification command could not be run
    #[error("verification command failed")]
    ExecFailed(#[from] ExecError),

    /// the node's facts are not what the scenario expects
    #[error("{what}: expected {expected}, observed {observed:?}")]
    AssertionMismatch { what: String, expected: String, observed: String },

    /// the verifier could not delete its own configuration change; the
    /// cluster may be left dirty
    #[error("failed to delete configuration change {change}")]
    CleanupFailed {
        change: String,
        #[source]
        source: ClusterError,
    },

    /// a single read or write of cluster state failed outside of any wait
    #[error("{action}")]
    Cluster {
        action: String,
        #[source]
        source: ClusterError,
    },
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(detail) => format!(": {}", detail),
        None => String::new(),
    }
}

impl ScenarioError {
    pub fn cluster(action: impl Into<String>, source: ClusterError) -> Self {
        ScenarioError::Cluster { action: action.into(), source }
    }

    /// A short, stable label for this kind of failure, used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            ScenarioError::RenderedConfigNotFound { .. } => {
                "rendered-config-not-found"
            }
            ScenarioError::ConvergenceTimeout { .. } => "convergence-timeout",
            ScenarioError::Degraded { .. } => "degraded",
            ScenarioError::ExecFailed(_) => "exec-failed",
            ScenarioError::AssertionMismatch { .. } => "assertion-mismatch",
            ScenarioError::CleanupFailed { .. } => "cleanup-failed",
            ScenarioError::Cluster { .. } => "cluster",
        }
    }
}
