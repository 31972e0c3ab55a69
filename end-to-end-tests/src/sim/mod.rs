// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated single-node cluster
//!
//! [`SimCluster`] stands in for the control plane, the rollout mechanism, and
//! the node itself.  It implements [`ConfigStore`], [`NodeExecutor`] and
//! [`DaemonLogReader`], so the whole verifier can run against it.
//!
//! The simulated rollout mechanism moves one step at a time.  In
//! [`SimMode::Auto`] every read of pool status is one step, so the rollout
//! progresses exactly as fast as somebody is watching it.  In
//! [`SimMode::Explicit`] nothing happens until [`SimCluster::step()`] is
//! called.  One step:
//!
//! 1. advances the node's uptime by [`SimConfig::tick`];
//! 2. lets the pool catch up with a node that finished its rollout on the
//!    previous step;
//! 3. renders a new configuration for the pool if configuration changes were
//!    created or deleted since the last render;
//! 4. moves the node's daemon along `Done -> Working -> Done`, applying the
//!    rendered configuration (and rebooting if that takes a reboot) on the
//!    way back to `Done`.
//!
//! Rendered configuration names are derived from the names of the changes
//! they were rendered from, so deleting a change returns the pool to exactly
//! the name it had before.  Faults can be injected to make each of these
//! steps misbehave.

mod node;

pub use node::NodeFacts;

use crate::cluster::ClusterError;
use crate::cluster::ConfigStore;
use crate::cluster::ConfigurationChange;
use crate::cluster::DaemonLog;
use crate::cluster::DaemonLogReader;
use crate::cluster::DaemonState;
use crate::cluster::ExecError;
use crate::cluster::NodeExecutor;
use crate::cluster::NodeState;
use crate::cluster::PoolStatus;
use crate::cluster::command_to_string;
use async_trait::async_trait;
use sha2::Digest;
use sha2::Sha256;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;

/// How the simulated rollout mechanism advances
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimMode {
    /// one step per read of pool status
    Auto,
    /// one step per call to [`SimCluster::step()`]
    Explicit,
}

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub pool: String,
    pub role: String,
    pub node: String,
    pub mode: SimMode,
    /// simulated time that passes on the node per step
    pub tick: Duration,
    /// uptime of the node when the simulation starts
    pub initial_uptime: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            pool: String::from("master"),
            role: String::from("master"),
            node: String::from("master-0"),
            mode: SimMode::Auto,
            tick: Duration::from_secs(2),
            initial_uptime: Duration::from_secs(3600),
        }
    }
}

/// Misbehaviour to inject
#[derive(Debug, Default)]
struct Faults {
    /// reads to let through before `failing_reads` start
    reads_before_failure: usize,
    failing_reads: usize,
    failing_deletes: usize,
    stall_rendering: bool,
    stall_rollout: bool,
    degrade: Option<DegradeFault>,
    reboot_on_every_rollout: bool,
    ignore_kernel_arguments: bool,
    extra_nodes: usize,
}

#[derive(Debug)]
struct DegradeFault {
    reason: String,
    /// the rendered configuration whose rollout is degraded, once known
    target: Option<String>,
}

struct SimNode {
    name: String,
    current: String,
    desired: String,
    state: DaemonState,
    reason: Option<String>,
    uptime: f64,
    facts: NodeFacts,
}

impl SimNode {
    fn transition(&mut self, log: &Logger, next: DaemonState) {
        if !self.state.can_transition_to(&next) {
            error!(log, "refusing invalid daemon state transition";
                "from" => %self.state,
                "to" => %next,
            );
            return;
        }
        debug!(log, "daemon state transition";
            "from" => %self.state,
            "to" => %next,
        );
        self.state = next;
    }

    fn annotations(&self) -> NodeState {
        NodeState {
            name: self.name.clone(),
            ready: true,
            current_config: Some(self.current.clone()),
            desired_config: Some(self.desired.clone()),
            daemon_state: Some(self.state.clone()),
            reason: self.reason.clone(),
        }
    }
}

struct SimState {
    /// changes created through the store, by name
    changes: BTreeMap<String, ConfigurationChange>,
    /// node contents for every configuration rendered so far
    rendered: BTreeMap<String, NodeFacts>,
    render_pending: bool,
    pool_current: String,
    pool_desired: String,
    desired_sources: Vec<String>,
    node: SimNode,
    daemon_log: Vec<String>,
    reads: usize,
    faults: Faults,
}

pub struct SimCluster {
    log: Logger,
    config: SimConfig,
    state: Mutex<SimState>,
}

/// Name of the configuration every pool starts from
fn base_source(role: &str) -> String {
    format!("00-{}", role)
}

fn rendered_name(pool: &str, sources: &[String]) -> String {
    let mut hasher = Sha256::new();
    for source in sources {
        hasher.update(source.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hex::encode(hasher.finalize());
    format!("rendered-{}-{}", pool, &digest[..32])
}

impl SimCluster {
    pub fn new(log: &Logger, config: SimConfig) -> SimCluster {
        let log = log.new(o!("component" => "SimCluster"));
        let sources = vec![base_source(&config.role)];
        let rendered = rendered_name(&config.pool, &sources);
        let node = SimNode {
            name: config.node.clone(),
            current: rendered.clone(),
            desired: rendered.clone(),
            state: DaemonState::Done,
            reason: None,
            uptime: config.initial_uptime.as_secs_f64(),
            facts: NodeFacts::base(),
        };
        info!(log, "simulated cluster ready";
            "pool" => &config.pool,
            "node" => &config.node,
            "rendered" => &rendered,
            "mode" => ?config.mode,
        );
        let state = SimState {
            changes: BTreeMap::new(),
            rendered: BTreeMap::from([(rendered.clone(), NodeFacts::base())]),
            render_pending: false,
            pool_current: rendered.clone(),
            pool_desired: rendered,
            desired_sources: sources,
            node,
            daemon_log: vec![String::from(
                "I0101 00:00:00.000000 1 start.go:108] Version: v4.9.0 \
                 (starting machine-config-daemon)",
            )],
            reads: 0,
            faults: Faults::default(),
        };
        SimCluster { log, config, state: Mutex::new(state) }
    }

    /// Advance the simulated rollout by one step.
    pub async fn step(&self) {
        let mut state = self.state.lock().await;
        self.step_locked(&mut state);
    }

    fn step_locked(&self, state: &mut SimState) {
        let log = &self.log;
        state.node.uptime += self.config.tick.as_secs_f64();

        // The pool lags the node by one step.
        if state.node.state == DaemonState::Done
            && state.node.current == state.pool_desired
            && state.pool_current != state.node.current
        {
            info!(log, "pool updated"; "rendered" => &state.node.current);
            state.pool_current = state.node.current.clone();
        }

        if state.render_pending && !state.faults.stall_rendering {
            self.render(state);
        }

        if !state.faults.stall_rollout {
            self.advance_daemon(state);
        }
    }

    fn render(&self, state: &mut SimState) {
        let role = &self.config.role;
        let changes: Vec<&ConfigurationChange> =
            state.changes.values().filter(|c| c.role() == role).collect();
        let mut sources = vec![base_source(role)];
        sources.extend(changes.iter().map(|c| c.name().to_owned()));
        let rendered = rendered_name(&self.config.pool, &sources);
        let facts = NodeFacts::render(
            changes.iter().copied(),
            state.faults.ignore_kernel_arguments,
        );
        info!(self.log, "rendered configuration";
            "rendered" => &rendered,
            "sources" => ?sources,
        );
        state.rendered.entry(rendered.clone()).or_insert(facts);
        state.pool_desired = rendered.clone();
        state.desired_sources = sources;
        state.node.desired = rendered;
        state.render_pending = false;
    }

    fn advance_daemon(&self, state: &mut SimState) {
        let log = &self.log;
        let degraded_target =
            state.faults.degrade.as_ref().and_then(|d| d.target.clone());
        let node = &mut state.node;
        match node.state {
            DaemonState::Done if node.desired != node.current => {
                if let Some(degrade) = state.faults.degrade.as_mut() {
                    if degrade.target.is_none() {
                        degrade.target = Some(node.desired.clone());
                    }
                }
                node.transition(log, DaemonState::Working);
            }
            DaemonState::Working
                if degraded_target.as_deref() == Some(node.desired.as_str()) =>
            {
                node.reason =
                    state.faults.degrade.as_ref().map(|d| d.reason.clone());
                node.transition(log, DaemonState::Degraded);
            }
            DaemonState::Working => {
                let Some(facts) = state.rendered.get(&node.desired) else {
                    node.reason = Some(format!(
                        "rendered configuration {} not found",
                        node.desired
                    ));
                    node.transition(log, DaemonState::Unreconcilable);
                    return;
                };
                if state.faults.reboot_on_every_rollout
                    || node.facts.requires_reboot(facts)
                {
                    info!(log, "rebooting node"; "node" => &node.name);
                    node.uptime = self.config.tick.as_secs_f64() / 2.0;
                }
                node.facts = facts.clone();
                node.current = node.desired.clone();
                node.reason = None;
                node.transition(log, DaemonState::Done);
                state
                    .daemon_log
                    .push(format!("I0101 update complete: {}", node.current));
            }
            DaemonState::Degraded | DaemonState::Unreconcilable
                if degraded_target.as_deref() != Some(node.desired.as_str()) =>
            {
                node.transition(log, DaemonState::Working);
            }
            _ => (),
        }
    }

    /// Count a read and decide whether it should fail.
    fn read_fault(&self, state: &mut SimState) -> Result<(), ClusterError> {
        state.reads += 1;
        let faults = &mut state.faults;
        if faults.failing_reads > 0 {
            if faults.reads_before_failure > 0 {
                faults.reads_before_failure -= 1;
            } else {
                faults.failing_reads -= 1;
                return Err(ClusterError::Unavailable(format!(
                    "simulated read failure (read {})",
                    state.reads
                )));
            }
        }
        Ok(())
    }

    /// After `skip` more successful reads, fail the next `count` reads.
    pub async fn fail_reads_after(&self, skip: usize, count: usize) {
        let mut state = self.state.lock().await;
        state.faults.reads_before_failure = skip;
        state.faults.failing_reads = count;
    }

    /// Fail the next `count` deletes.
    pub async fn fail_deletes(&self, count: usize) {
        self.state.lock().await.faults.failing_deletes = count;
    }

    /// Stop (or resume) rendering new configurations.
    pub async fn stall_rendering(&self, stalled: bool) {
        self.state.lock().await.faults.stall_rendering = stalled;
    }

    /// Stop (or resume) the node's daemon.
    pub async fn stall_rollout(&self, stalled: bool) {
        self.state.lock().await.faults.stall_rollout = stalled;
    }

    /// Make the next rollout end in `Degraded` with `reason`.  The node
    /// stays degraded until it is asked to roll out something else.
    pub async fn degrade_next_rollout(&self, reason: &str) {
        self.state.lock().await.faults.degrade =
            Some(DegradeFault { reason: reason.to_owned(), target: None });
    }

    /// Reboot the node on every rollout, whether it needs it or not.
    pub async fn reboot_on_every_rollout(&self, reboot: bool) {
        self.state.lock().await.faults.reboot_on_every_rollout = reboot;
    }

    /// Drop kernel arguments from configurations rendered from now on.
    pub async fn ignore_kernel_arguments(&self, ignore: bool) {
        self.state.lock().await.faults.ignore_kernel_arguments = ignore;
    }

    /// Report `count` additional nodes with the pool's role.
    pub async fn extra_nodes(&self, count: usize) {
        self.state.lock().await.faults.extra_nodes = count;
    }

    /// Append a line to the daemon's log.
    pub async fn log_daemon_line(&self, line: &str) {
        self.state.lock().await.daemon_log.push(line.to_owned());
    }

    /// Names of the configuration changes that currently exist
    pub async fn config_names(&self) -> Vec<String> {
        self.state.lock().await.changes.keys().cloned().collect()
    }

    pub async fn pool_current(&self) -> String {
        self.state.lock().await.pool_current.clone()
    }

    pub async fn node_annotations(&self) -> NodeState {
        self.state.lock().await.node.annotations()
    }

    pub async fn node_facts(&self) -> NodeFacts {
        self.state.lock().await.node.facts.clone()
    }
}

#[async_trait]
impl ConfigStore for SimCluster {
    async fn create_config(
        &self,
        change: &ConfigurationChange,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        if state.changes.contains_key(change.name()) {
            return Err(ClusterError::AlreadyExists {
                kind: "MachineConfig",
                name: change.name().to_owned(),
            });
        }
        state.changes.insert(change.name().to_owned(), change.clone());
        state.render_pending = true;
        Ok(())
    }

    async fn delete_config(&self, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        if state.faults.failing_deletes > 0 {
            state.faults.failing_deletes -= 1;
            return Err(ClusterError::Unavailable(String::from(
                "simulated delete failure",
            )));
        }
        if state.changes.remove(name).is_none() {
            return Err(ClusterError::NotFound {
                kind: "MachineConfig",
                name: name.to_owned(),
            });
        }
        state.render_pending = true;
        Ok(())
    }

    async fn pool_status(
        &self,
        pool: &str,
    ) -> Result<PoolStatus, ClusterError> {
        let mut state = self.state.lock().await;
        self.read_fault(&mut state)?;
        if pool != self.config.pool {
            return Err(ClusterError::NotFound {
                kind: "MachineConfigPool",
                name: pool.to_owned(),
            });
        }
        if self.config.mode == SimMode::Auto {
            self.step_locked(&mut state);
        }
        Ok(PoolStatus {
            name: pool.to_owned(),
            current: Some(state.pool_current.clone()),
            desired: Some(state.pool_desired.clone()),
            desired_sources: state.desired_sources.clone(),
            updated: state.pool_current == state.pool_desired
                && state.node.state == DaemonState::Done,
            degraded: state.node.state.is_failed(),
        })
    }

    async fn nodes_with_role(
        &self,
        role: &str,
    ) -> Result<Vec<NodeState>, ClusterError> {
        let mut state = self.state.lock().await;
        self.read_fault(&mut state)?;
        if role != self.config.role {
            return Ok(Vec::new());
        }
        let mut nodes = vec![state.node.annotations()];
        for i in 0..state.faults.extra_nodes {
            let mut extra = state.node.annotations();
            extra.name = format!("{}-extra-{}", self.config.node, i);
            nodes.push(extra);
        }
        Ok(nodes)
    }
}

#[async_trait]
impl NodeExecutor for SimCluster {
    async fn exec(
        &self,
        node: &str,
        argv: &[String],
    ) -> Result<String, ExecError> {
        let state = self.state.lock().await;
        if node != state.node.name {
            return Err(ExecError::Transport {
                node: node.to_owned(),
                command: command_to_string(argv),
                message: String::from("no daemon pod on node"),
            });
        }
        self::node::exec(&state.node.facts, state.node.uptime, argv).map_err(
            |(status, stdout, stderr)| ExecError::CommandFailure {
                node: node.to_owned(),
                command: command_to_string(argv),
                status: status.to_string(),
                stdout,
                stderr,
            },
        )
    }
}

#[async_trait]
impl DaemonLogReader for SimCluster {
    async fn daemon_logs(&self) -> Result<Vec<DaemonLog>, ClusterError> {
        let state = self.state.lock().await;
        Ok(vec![DaemonLog {
            pod: format!("machine-config-daemon-{}", self.config.node),
            node: Some(self.config.node.clone()),
            contents: state.daemon_log.join("\n"),
        }])
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cluster::ChangePayload;
    use sno_test_utils::dev::test_setup_log;

    fn explicit(log: &Logger) -> SimCluster {
        SimCluster::new(
            log,
            SimConfig { mode: SimMode::Explicit, ..SimConfig::default() },
        )
    }

    fn kernel_type() -> ConfigurationChange {
        ConfigurationChange::with_name(
            "kerneltype-1",
            "master",
            ChangePayload::KernelType(String::from("realtime")),
        )
    }

    #[test]
    fn test_rendered_name_depends_only_on_sources() {
        let a = vec![String::from("00-master"), String::from("kargs-1")];
        assert_eq!(rendered_name("master", &a), rendered_name("master", &a));
        assert_ne!(
            rendered_name("master", &a),
            rendered_name("master", &a[..1])
        );
        assert!(rendered_name("master", &a).starts_with("rendered-master-"));
    }

    #[tokio::test]
    async fn test_explicit_rollout_and_rollback() {
        let logctx = test_setup_log("test_explicit_rollout_and_rollback");
        let sim = explicit(&logctx.log);
        let old = sim.pool_current().await;

        sim.create_config(&kernel_type()).await.expect("created");
        // nothing moves in explicit mode without a step
        let status = sim.pool_status("master").await.expect("pool");
        assert_eq!(status.desired.as_deref(), Some(old.as_str()));

        sim.step().await; // render, Done -> Working
        let status = sim.pool_status("master").await.expect("pool");
        let new = status.desired.clone().expect("desired");
        assert_ne!(new, old);
        assert!(status.desired_sources.contains(&String::from("kerneltype-1")));
        assert_eq!(
            sim.node_annotations().await.daemon_state,
            Some(DaemonState::Working)
        );

        sim.step().await; // Working -> Done, reboot
        let node = sim.node_annotations().await;
        assert!(node.is_converged(&new));
        assert!(sim.node_facts().await.packages.contains_key("kernel-rt-core"));
        assert_eq!(sim.pool_current().await, old);

        sim.step().await; // pool catches up
        assert_eq!(sim.pool_current().await, new);

        sim.delete_config("kerneltype-1").await.expect("deleted");
        for _ in 0..3 {
            sim.step().await;
        }
        assert_eq!(sim.pool_current().await, old);
        assert_eq!(sim.node_facts().await, NodeFacts::base());
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_degraded_until_rolled_back() {
        let logctx = test_setup_log("test_degraded_until_rolled_back");
        let sim = explicit(&logctx.log);
        let old = sim.pool_current().await;
        sim.degrade_next_rollout("failed to pull extension").await;

        sim.create_config(&kernel_type()).await.expect("created");
        for _ in 0..5 {
            sim.step().await;
        }
        let node = sim.node_annotations().await;
        assert_eq!(node.daemon_state, Some(DaemonState::Degraded));
        assert_eq!(node.reason.as_deref(), Some("failed to pull extension"));
        assert_eq!(node.current_config.as_deref(), Some(old.as_str()));

        sim.delete_config("kerneltype-1").await.expect("deleted");
        for _ in 0..4 {
            sim.step().await;
        }
        assert!(sim.node_annotations().await.is_converged(&old));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_store_errors() {
        let logctx = test_setup_log("test_store_errors");
        let sim = explicit(&logctx.log);
        sim.create_config(&kernel_type()).await.expect("created");
        assert!(matches!(
            sim.create_config(&kernel_type()).await,
            Err(ClusterError::AlreadyExists { .. })
        ));
        assert!(matches!(
            sim.delete_config("kargs-0").await,
            Err(ClusterError::NotFound { .. })
        ));
        assert!(matches!(
            sim.pool_status("worker").await,
            Err(ClusterError::NotFound { .. })
        ));
        assert!(sim.nodes_with_role("worker").await.expect("ok").is_empty());

        sim.fail_deletes(1).await;
        assert!(sim.delete_config("kerneltype-1").await.is_err());
        sim.delete_config("kerneltype-1").await.expect("second try");
        assert!(sim.config_names().await.is_empty());

        sim.fail_reads_after(1, 2).await;
        assert!(sim.nodes_with_role("master").await.is_ok());
        assert!(sim.nodes_with_role("master").await.is_err());
        assert!(sim.pool_status("master").await.is_err());
        assert!(sim.pool_status("master").await.is_ok());
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_exec_only_on_known_node() {
        let logctx = test_setup_log("test_exec_only_on_known_node");
        let sim = explicit(&logctx.log);
        let argv =
            vec![String::from("cat"), String::from("/rootfs/proc/uptime")];
        assert!(sim.exec("master-0", &argv).await.is_ok());
        assert!(matches!(
            sim.exec("master-1", &argv).await,
            Err(ExecError::Transport { .. })
        ));
        logctx.cleanup_successful();
    }
}
