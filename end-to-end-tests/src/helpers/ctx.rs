// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::audit::audit_daemon_tokens;
use crate::audit::AuditFinding;
use crate::cluster::kube::KubeCluster;
use crate::cluster::ClusterError;
use crate::cluster::ConfigStore;
use crate::cluster::DaemonLogReader;
use crate::cluster::NodeExecutor;
use crate::config::RunConfig;
use crate::convergence::convergence_policy;
use crate::facts::NodeFactVerifier;
use crate::pool::PoolStateReader;
use crate::scenario::ScenarioRunner;
use crate::sim::SimCluster;
use crate::sim::SimConfig;
use crate::sim::SimMode;
use slog::Logger;
use std::sync::Arc;

/// Everything a run needs: configuration, a logger, and the clients for the
/// cluster under test
#[derive(Clone)]
pub struct Context {
    pub log: Logger,
    pub config: RunConfig,
    pub store: Arc<dyn ConfigStore>,
    pub executor: Arc<dyn NodeExecutor>,
    pub daemon_logs: Arc<dyn DaemonLogReader>,
}

impl Context {
    pub fn new(
        log: &Logger,
        config: RunConfig,
        store: Arc<dyn ConfigStore>,
        executor: Arc<dyn NodeExecutor>,
        daemon_logs: Arc<dyn DaemonLogReader>,
    ) -> Context {
        Context { log: log.clone(), config, store, executor, daemon_logs }
    }

    /// Connect to the cluster named by the ambient kubeconfig.
    pub async fn kube(
        log: &Logger,
        config: RunConfig,
    ) -> Result<Context, ClusterError> {
        let cluster =
            Arc::new(KubeCluster::connect(log, config.daemon.clone()).await?);
        Ok(Context::new(
            log,
            config,
            cluster.clone(),
            cluster.clone(),
            cluster,
        ))
    }

    /// Run against `cluster` instead of a real control plane.
    pub fn sim(
        log: &Logger,
        config: RunConfig,
        cluster: Arc<SimCluster>,
    ) -> Context {
        Context::new(log, config, cluster.clone(), cluster.clone(), cluster)
    }

    /// Build a simulated single-node cluster shaped like `config`.
    pub fn sim_cluster(log: &Logger, config: &RunConfig) -> Arc<SimCluster> {
        Arc::new(SimCluster::new(
            log,
            SimConfig {
                pool: config.pool.clone(),
                role: config.role.clone(),
                mode: SimMode::Auto,
                tick: config.poll_interval,
                ..SimConfig::default()
            },
        ))
    }

    pub fn pool_reader(&self) -> PoolStateReader {
        PoolStateReader::new(
            &self.log,
            self.store.clone(),
            &self.config.role,
            self.config.poll_interval,
            self.config.render_timeout,
        )
    }

    pub fn fact_verifier(&self) -> NodeFactVerifier {
        NodeFactVerifier::new(&self.log, self.executor.clone())
    }

    pub fn runner(&self) -> ScenarioRunner {
        ScenarioRunner::new(
            &self.log,
            &self.config.pool,
            self.store.clone(),
            self.pool_reader(),
            self.fact_verifier(),
            convergence_policy(
                self.config.poll_interval,
                self.config.convergence_timeout,
                self.config.fail_fast_on_degraded,
            ),
        )
    }

    pub async fn audit_daemon_tokens(
        &self,
    ) -> Result<Vec<AuditFinding>, ClusterError> {
        audit_daemon_tokens(&self.log, self.daemon_logs.as_ref()).await
    }
}
