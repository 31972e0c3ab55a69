// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reading rendered configurations and node state for one pool

use crate::cluster::ClusterError;
use crate::cluster::ConfigStore;
use crate::cluster::NodeState;
use crate::cluster::PoolStatus;
use crate::error::ScenarioError;
use slog::debug;
use slog::Logger;
use sno_test_utils::dev::poll::wait_for_condition_with_policy;
use sno_test_utils::dev::poll::CondCheckError;
use sno_test_utils::dev::poll::PollError;
use sno_test_utils::dev::poll::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Why a change has not (yet) shown up in the pool's rendered configuration
#[derive(Debug, Error)]
enum NotRendered {
    #[error("reading pool: {0}")]
    Read(#[from] ClusterError),
    #[error("pool is rendering {desired:?} from {sources:?}")]
    Pending { desired: Option<String>, sources: Vec<String> },
}

pub struct PoolStateReader {
    log: Logger,
    store: Arc<dyn ConfigStore>,
    role: String,
    render_interval: Duration,
    render_timeout: Duration,
}

impl PoolStateReader {
    pub fn new(
        log: &Logger,
        store: Arc<dyn ConfigStore>,
        role: &str,
        render_interval: Duration,
        render_timeout: Duration,
    ) -> PoolStateReader {
        PoolStateReader {
            log: log.clone(),
            store,
            role: role.to_owned(),
            render_interval,
            render_timeout,
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub async fn pool_status(
        &self,
        pool: &str,
    ) -> Result<PoolStatus, ClusterError> {
        self.store.pool_status(pool).await
    }

    /// Returns the rendered configuration the pool currently reports as
    /// applied.  This is a single read.
    pub async fn current_pool_configuration(
        &self,
        pool: &str,
    ) -> Result<String, ClusterError> {
        let status = self.store.pool_status(pool).await?;
        status.current.ok_or_else(|| ClusterError::Malformed {
            kind: "pool",
            name: pool.to_owned(),
            message: String::from("no current rendered configuration"),
        })
    }

    /// Waits until the pool's desired rendered configuration was rendered
    /// from a set of sources including `change_name`, and returns its name.
    ///
    /// Read errors along the way are retried; only the render timeout ends
    /// the wait.
    pub async fn resolve_rendered_configuration(
        &self,
        pool: &str,
        change_name: &str,
    ) -> Result<String, ScenarioError> {
        let policy =
            RetryPolicy::retry_all(self.render_interval, self.render_timeout);
        let result = wait_for_condition_with_policy(
            || async {
                let status = self
                    .store
                    .pool_status(pool)
                    .await
                    .map_err(NotRendered::from)?;
                match status.desired {
                    Some(desired)
                        if status
                            .desired_sources
                            .iter()
                            .any(|s| s == change_name) =>
                    {
                        Ok(desired)
                    }
                    desired => Err(CondCheckError::Failed(
                        NotRendered::Pending {
                            desired,
                            sources: status.desired_sources,
                        },
                    )),
                }
            },
            &policy,
        )
        .await;

        match result {
            Ok(rendered) => {
                debug!(self.log, "resolved rendered configuration";
                    "pool" => pool,
                    "change" => change_name,
                    "rendered" => &rendered,
                );
                Ok(rendered)
            }
            Err(error) => {
                let elapsed = match &error {
                    PollError::TimedOut { elapsed, .. } => *elapsed,
                    PollError::PermanentError(_) => Duration::ZERO,
                };
                Err(ScenarioError::RenderedConfigNotFound {
                    pool: pool.to_owned(),
                    change: change_name.to_owned(),
                    elapsed,
                    last_observed: error.last_error().map(|e| e.to_string()),
                })
            }
        }
    }

    /// Returns the state of the only node with this reader's role.
    ///
    /// The verifier is built for single-node pools.  Zero nodes, or more than
    /// one, is an error rather than something to pick from.
    pub async fn node_state(&self) -> Result<NodeState, ClusterError> {
        let mut nodes = self.store.nodes_with_role(&self.role).await?;
        if nodes.len() != 1 {
            return Err(ClusterError::NodeCount {
                role: self.role.clone(),
                count: nodes.len(),
            });
        }
        let node = nodes.remove(0);
        if !node.ready {
            return Err(ClusterError::Unavailable(format!(
                "node {} is not ready",
                node.name
            )));
        }
        Ok(node)
    }
}
