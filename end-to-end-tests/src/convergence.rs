// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Waiting for a single-node pool to finish rolling out a configuration

use crate::cluster::ClusterError;
use crate::cluster::NodeState;
use crate::error::ScenarioError;
use crate::pool::PoolStateReader;
use slog::debug;
use slog::info;
use slog::Logger;
use sno_test_utils::dev::poll::wait_for_condition_with_policy;
use sno_test_utils::dev::poll::CondCheckError;
use sno_test_utils::dev::poll::ErrorClass;
use sno_test_utils::dev::poll::PollError;
use sno_test_utils::dev::poll::RetryPolicy;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// A pool and the rendered configuration it should reach
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConvergenceTarget {
    pub pool: String,
    pub rendered: String,
}

impl PoolConvergenceTarget {
    pub fn new(pool: &str, rendered: &str) -> Self {
        PoolConvergenceTarget {
            pool: pool.to_owned(),
            rendered: rendered.to_owned(),
        }
    }
}

/// Everything short of convergence that one observation can turn up
///
/// All of these are retried except [`NotConverged::Failed`], which ends the
/// wait only when the run asks to fail fast.
#[derive(Debug, Error)]
pub enum NotConverged {
    #[error("reading cluster state: {0}")]
    Read(#[from] ClusterError),
    #[error(
        "pool reports {current:?} as its current configuration \
         (updated: {updated}, degraded: {degraded})"
    )]
    PoolBehind { current: Option<String>, updated: bool, degraded: bool },
    #[error(
        "node {node} is on {current:?} (desired {desired:?}) in state {state}"
    )]
    NodeBehind {
        node: String,
        current: Option<String>,
        desired: Option<String>,
        state: String,
    },
    #[error("node {node} reports {state}")]
    Failed { node: String, state: String, reason: Option<String> },
}

/// How a convergence wait treats what it observes
pub fn convergence_policy(
    interval: Duration,
    timeout: Duration,
    fail_fast_on_degraded: bool,
) -> RetryPolicy<NotConverged> {
    RetryPolicy::retry_all(interval, timeout).with_classifier(move |e| {
        match e {
            NotConverged::Failed { .. } if fail_fast_on_degraded => {
                ErrorClass::Permanent
            }
            _ => ErrorClass::Transient,
        }
    })
}

/// Make one observation of the pool and its node.
///
/// Succeeds only when the pool reports `target` as current and updated, and
/// the node is converged on it.
pub async fn check_converged(
    reader: &PoolStateReader,
    target: &PoolConvergenceTarget,
) -> Result<NodeState, NotConverged> {
    let pool = reader.pool_status(&target.pool).await?;
    let node = reader.node_state().await?;

    if let Some(state) = node.daemon_state.as_ref().filter(|s| s.is_failed()) {
        return Err(NotConverged::Failed {
            node: node.name.clone(),
            state: state.to_string(),
            reason: node.reason.clone(),
        });
    }

    if !node.is_converged(&target.rendered) {
        return Err(NotConverged::NodeBehind {
            node: node.name.clone(),
            current: node.current_config.clone(),
            desired: node.desired_config.clone(),
            state: node
                .daemon_state
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_else(|| String::from("<none>")),
        });
    }

    // The pool's own `Updated` condition lags the node; until it is set the
    // rollout is still in progress as far as the pool is concerned.
    if pool.current.as_deref() != Some(target.rendered.as_str())
        || !pool.updated
    {
        return Err(NotConverged::PoolBehind {
            current: pool.current,
            updated: pool.updated,
            degraded: pool.degraded,
        });
    }

    Ok(node)
}

/// Wait for the pool and its single node to converge on `target`.
pub async fn wait_for_single_node_pool_complete(
    log: &Logger,
    reader: &PoolStateReader,
    target: &PoolConvergenceTarget,
    policy: &RetryPolicy<NotConverged>,
) -> Result<NodeState, ScenarioError> {
    let start = Instant::now();
    info!(log, "waiting for pool to converge";
        "pool" => &target.pool,
        "target" => &target.rendered,
        "interval" => ?policy.interval(),
        "timeout" => ?policy.timeout(),
    );

    let result = wait_for_condition_with_policy(
        || async {
            check_converged(reader, target).await.map_err(|e| {
                debug!(log, "not converged yet"; "observed" => %e);
                CondCheckError::Failed(e)
            })
        },
        policy,
    )
    .await;

    match result {
        Ok(node) => {
            info!(log, "pool converged";
                "pool" => &target.pool,
                "target" => &target.rendered,
                "node" => &node.name,
                "elapsed" => ?start.elapsed(),
            );
            Ok(node)
        }
        Err(PollError::TimedOut { elapsed, last_error }) => {
            Err(ScenarioError::ConvergenceTimeout {
                pool: target.pool.clone(),
                target: target.rendered.clone(),
                elapsed,
                last_observed: last_error.map(|e| e.to_string()),
            })
        }
        Err(PollError::PermanentError(NotConverged::Failed {
            node,
            state,
            reason,
        })) => Err(ScenarioError::Degraded {
            pool: target.pool.clone(),
            target: target.rendered.clone(),
            node,
            state,
            reason,
            elapsed: start.elapsed(),
        }),
        // Only `Failed` is ever classified as permanent.  Report anything
        // else the same way as running out of time.
        Err(PollError::PermanentError(other)) => {
            Err(ScenarioError::ConvergenceTimeout {
                pool: target.pool.clone(),
                target: target.rendered.clone(),
                elapsed: start.elapsed(),
                last_observed: Some(other.to_string()),
            })
        }
    }
}
