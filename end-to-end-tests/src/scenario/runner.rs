// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running a scenario: submit, converge, verify, delete, converge back,
//! verify again
//!
//! A scenario never stops at its first failure.  Once its configuration
//! change exists, the change is deleted and the pool is waited on until it
//! returns to the rendered configuration it started from, whatever happened
//! before.  Otherwise a failed scenario would leave its change behind and
//! every scenario after it would be checking the wrong thing.

use super::ScenarioSpec;
use crate::cluster::ClusterError;
use crate::cluster::ConfigStore;
use crate::cluster::ConfigurationChange;
use crate::cluster::DaemonState;
use crate::cluster::NodeState;
use crate::convergence::wait_for_single_node_pool_complete;
use crate::convergence::NotConverged;
use crate::convergence::PoolConvergenceTarget;
use crate::error::ScenarioError;
use crate::facts::check_uptime_monotonic;
use crate::facts::NodeFactVerifier;
use crate::pool::PoolStateReader;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use sno_test_utils::dev::poll::RetryPolicy;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// How far a scenario got
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ScenarioPhase {
    Init,
    Submitted,
    AwaitingRender,
    AwaitingConvergence,
    Verified,
    RollbackSubmitted,
    AwaitingRollbackConvergence,
    RollbackVerified,
    Done,
}

impl fmt::Display for ScenarioPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScenarioPhase::Init => "init",
            ScenarioPhase::Submitted => "submitted",
            ScenarioPhase::AwaitingRender => "awaiting-render",
            ScenarioPhase::AwaitingConvergence => "awaiting-convergence",
            ScenarioPhase::Verified => "verified",
            ScenarioPhase::RollbackSubmitted => "rollback-submitted",
            ScenarioPhase::AwaitingRollbackConvergence => {
                "awaiting-rollback-convergence"
            }
            ScenarioPhase::RollbackVerified => "rollback-verified",
            ScenarioPhase::Done => "done",
        };
        f.write_str(s)
    }
}

/// Outcome of one scenario
#[derive(Debug)]
pub struct ScenarioReport {
    pub scenario: String,
    pub change_name: Option<String>,
    /// rendered configuration the pool was on before the change
    pub old_rendered: Option<String>,
    /// rendered configuration that included the change
    pub new_rendered: Option<String>,
    /// last phase entered
    pub phase: ScenarioPhase,
    pub elapsed: Duration,
    /// every failure, with the phase it happened in
    pub failures: Vec<(ScenarioPhase, ScenarioError)>,
    /// set if the change could not be deleted; does not fail the scenario
    pub cleanup_error: Option<ScenarioError>,
}

impl ScenarioReport {
    fn new(scenario: &str) -> ScenarioReport {
        ScenarioReport {
            scenario: scenario.to_owned(),
            change_name: None,
            old_rendered: None,
            new_rendered: None,
            phase: ScenarioPhase::Init,
            elapsed: Duration::ZERO,
            failures: Vec::new(),
            cleanup_error: None,
        }
    }

    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    /// Returns the first failure of the given kind, if any.
    pub fn failure(&self, kind: &str) -> Option<&ScenarioError> {
        self.failures.iter().map(|(_, e)| e).find(|e| e.kind() == kind)
    }

    fn fail(&mut self, error: ScenarioError) {
        self.failures.push((self.phase, error));
    }
}

/// Render an error followed by each of its sources.
pub fn error_chain(error: &dyn std::error::Error) -> String {
    let mut s = error.to_string();
    let mut source = error.source();
    while let Some(e) = source {
        s.push_str(": ");
        s.push_str(&e.to_string());
        source = e.source();
    }
    s
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (reached {}, {:.1?}",
            if self.passed() { "PASS" } else { "FAIL" },
            self.scenario,
            self.phase,
            self.elapsed,
        )?;
        if let Some(change) = &self.change_name {
            write!(f, ", change {}", change)?;
        }
        write!(f, ")")?;
        for (phase, error) in &self.failures {
            write!(
                f,
                "\n  [{}] {}: {}",
                phase,
                error.kind(),
                error_chain(error)
            )?;
        }
        if let Some(error) = &self.cleanup_error {
            write!(f, "\n  [cleanup] {}", error_chain(error))?;
        }
        Ok(())
    }
}

/// A configuration change that exists in the cluster and must be deleted
///
/// [`ChangeLease::release()`] deletes it.  Dropping a lease without releasing
/// it leaves the change behind, which is logged.
pub struct ChangeLease {
    log: Logger,
    store: Arc<dyn ConfigStore>,
    change: ConfigurationChange,
    released: bool,
}

impl ChangeLease {
    /// Create `change` in the cluster.
    pub async fn acquire(
        log: &Logger,
        store: Arc<dyn ConfigStore>,
        change: ConfigurationChange,
    ) -> Result<ChangeLease, ClusterError> {
        store.create_config(&change).await?;
        info!(log, "created configuration change";
            "change" => change.name(),
            "kind" => change.payload().kind(),
        );
        Ok(ChangeLease { log: log.clone(), store, change, released: false })
    }

    pub fn change(&self) -> &ConfigurationChange {
        &self.change
    }

    /// Delete the change.  This is attempted exactly once.
    pub async fn release(mut self) -> Result<(), ScenarioError> {
        self.released = true;
        let name = self.change.name();
        match self.store.delete_config(name).await {
            Ok(()) => {
                info!(self.log, "deleted configuration change";
                    "change" => name
                );
                Ok(())
            }
            Err(source) => {
                warn!(self.log, "failed to delete configuration change";
                    "change" => name,
                    "error" => %source,
                );
                Err(ScenarioError::CleanupFailed {
                    change: name.to_owned(),
                    source,
                })
            }
        }
    }
}

impl Drop for ChangeLease {
    fn drop(&mut self) {
        if !self.released {
            warn!(self.log, "configuration change was never deleted";
                "change" => self.change.name(),
            );
        }
    }
}

/// Uptime checkpoints for a scenario that must not reboot the node
#[derive(Default)]
struct Uptimes {
    baseline: Option<f64>,
    after_apply: Option<f64>,
}

impl Uptimes {
    /// The latest checkpoint taken so far
    fn latest(&self) -> Option<f64> {
        self.after_apply.or(self.baseline)
    }
}

/// Runs scenarios one at a time against one pool
pub struct ScenarioRunner {
    log: Logger,
    pool: String,
    store: Arc<dyn ConfigStore>,
    reader: PoolStateReader,
    facts: NodeFactVerifier,
    policy: RetryPolicy<NotConverged>,
}

impl ScenarioRunner {
    pub fn new(
        log: &Logger,
        pool: &str,
        store: Arc<dyn ConfigStore>,
        reader: PoolStateReader,
        facts: NodeFactVerifier,
        policy: RetryPolicy<NotConverged>,
    ) -> ScenarioRunner {
        ScenarioRunner {
            log: log.new(o!("pool" => pool.to_owned())),
            pool: pool.to_owned(),
            store,
            reader,
            facts,
            policy,
        }
    }

    pub fn reader(&self) -> &PoolStateReader {
        &self.reader
    }

    /// Run each scenario in turn.  A failed scenario does not stop the rest.
    pub async fn run_all(&self, specs: &[ScenarioSpec]) -> Vec<ScenarioReport> {
        let mut reports = Vec::with_capacity(specs.len());
        for spec in specs {
            reports.push(self.run(spec).await);
        }
        reports
    }

    pub async fn run(&self, spec: &ScenarioSpec) -> ScenarioReport {
        let start = Instant::now();
        let log = self.log.new(o!("scenario" => spec.name));
        let mut report = ScenarioReport::new(spec.name);
        info!(log, "starting scenario");

        self.run_phases(&log, spec, &mut report).await;

        report.elapsed = start.elapsed();
        if report.passed() {
            info!(log, "scenario passed"; "elapsed" => ?report.elapsed);
        } else {
            warn!(log, "scenario failed";
                "elapsed" => ?report.elapsed,
                "failures" => report.failures.len(),
            );
        }
        report
    }

    async fn run_phases(
        &self,
        log: &Logger,
        spec: &ScenarioSpec,
        report: &mut ScenarioReport,
    ) {
        // Everything about the starting point is read before the change is
        // created, so it can't already reflect the change.
        let (node, old_rendered) = match self.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(error) => return report.fail(error),
        };
        report.old_rendered = Some(old_rendered.clone());
        let mut uptimes = Uptimes::default();
        if spec.forbids_reboot {
            match self.facts.uptime(&node).await {
                Ok(uptime) => uptimes.baseline = Some(uptime),
                Err(error) => return report.fail(error),
            }
        }

        let change = ConfigurationChange::new(
            spec.change_prefix,
            self.reader.role(),
            spec.payload.clone(),
        );
        report.change_name = Some(change.name().to_owned());
        let lease =
            match ChangeLease::acquire(log, self.store.clone(), change).await {
                Ok(lease) => lease,
                Err(source) => {
                    return report.fail(ScenarioError::cluster(
                        "creating configuration change",
                        source,
                    ))
                }
            };
        report.phase = ScenarioPhase::Submitted;
        let log = log.new(o!("change" => lease.change().name().to_owned()));

        if let Err(error) =
            self.apply(&log, spec, &lease, &node, &mut uptimes, report).await
        {
            warn!(log, "apply failed, rolling back anyway";
                "error" => %error,
            );
            report.fail(error);
        }

        report.phase = ScenarioPhase::RollbackSubmitted;
        if let Err(error) = lease.release().await {
            report.cleanup_error = Some(error);
        }

        if let Err(error) = self
            .roll_back(&log, spec, &node, &old_rendered, &uptimes, report)
            .await
        {
            report.fail(error);
            return;
        }
        report.phase = ScenarioPhase::Done;
    }

    async fn snapshot(&self) -> Result<(String, String), ScenarioError> {
        let node = self.reader.node_state().await.map_err(|source| {
            ScenarioError::cluster("reading node state", source)
        })?;
        let current = self
            .reader
            .current_pool_configuration(&self.pool)
            .await
            .map_err(|source| {
                ScenarioError::cluster("reading pool configuration", source)
            })?;
        Ok((node.name, current))
    }

    async fn apply(
        &self,
        log: &Logger,
        spec: &ScenarioSpec,
        lease: &ChangeLease,
        node: &str,
        uptimes: &mut Uptimes,
        report: &mut ScenarioReport,
    ) -> Result<(), ScenarioError> {
        report.phase = ScenarioPhase::AwaitingRender;
        let new_rendered = self
            .reader
            .resolve_rendered_configuration(&self.pool, lease.change().name())
            .await?;
        info!(log, "change rendered"; "rendered" => &new_rendered);
        report.new_rendered = Some(new_rendered.clone());

        report.phase = ScenarioPhase::AwaitingConvergence;
        let target = PoolConvergenceTarget::new(&self.pool, &new_rendered);
        let converged = wait_for_single_node_pool_complete(
            log,
            &self.reader,
            &target,
            &self.policy,
        )
        .await?;
        check_annotations(&converged, &new_rendered)?;

        let output = self.facts.run(node, &spec.apply_probe).await?;
        spec.expectation.check_present(
            &format!("{} after apply", spec.name),
            &output,
        )?;

        if let Some(baseline) = uptimes.baseline {
            let uptime = self.facts.uptime(node).await?;
            check_uptime_monotonic(node, "after apply", baseline, uptime)?;
            uptimes.after_apply = Some(uptime);
        }

        report.phase = ScenarioPhase::Verified;
        info!(log, "change verified on node"; "node" => node);
        Ok(())
    }

    async fn roll_back(
        &self,
        log: &Logger,
        spec: &ScenarioSpec,
        node: &str,
        old_rendered: &str,
        uptimes: &Uptimes,
        report: &mut ScenarioReport,
    ) -> Result<(), ScenarioError> {
        report.phase = ScenarioPhase::AwaitingRollbackConvergence;
        let target = PoolConvergenceTarget::new(&self.pool, old_rendered);
        let converged = wait_for_single_node_pool_complete(
            log,
            &self.reader,
            &target,
            &self.policy,
        )
        .await?;
        check_annotations(&converged, old_rendered)?;

        let current = self
            .reader
            .current_pool_configuration(&self.pool)
            .await
            .map_err(|source| {
                ScenarioError::cluster("reading pool configuration", source)
            })?;
        if current != old_rendered {
            return Err(ScenarioError::AssertionMismatch {
                what: format!("pool {} after rollback", self.pool),
                expected: old_rendered.to_owned(),
                observed: current,
            });
        }

        let output = self.facts.run(node, &spec.rollback_probe).await?;
        spec.expectation.check_absent(
            &format!("{} after rollback", spec.name),
            &output,
        )?;

        if let Some(before) = uptimes.latest() {
            let uptime = self.facts.uptime(node).await?;
            check_uptime_monotonic(node, "after rollback", before, uptime)?;
        }

        report.phase = ScenarioPhase::RollbackVerified;
        info!(log, "rollback verified on node"; "node" => node);
        Ok(())
    }
}

/// Check the node's own account of what it is running.
fn check_annotations(
    node: &NodeState,
    rendered: &str,
) -> Result<(), ScenarioError> {
    if node.current_config.as_deref() != Some(rendered) {
        return Err(ScenarioError::AssertionMismatch {
            what: format!("current configuration of node {}", node.name),
            expected: rendered.to_owned(),
            observed: format!("{:?}", node.current_config),
        });
    }
    if node.daemon_state != Some(DaemonState::Done) {
        return Err(ScenarioError::AssertionMismatch {
            what: format!("daemon state of node {}", node.name),
            expected: DaemonState::Done.to_string(),
            observed: format!("{:?}", node.daemon_state),
        });
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_phases_are_ordered() {
        assert!(ScenarioPhase::Init < ScenarioPhase::Submitted);
        assert!(ScenarioPhase::Verified < ScenarioPhase::RollbackSubmitted);
        assert!(ScenarioPhase::RollbackVerified < ScenarioPhase::Done);
        assert_eq!(
            ScenarioPhase::AwaitingRollbackConvergence.to_string(),
            "awaiting-rollback-convergence"
        );
    }

    #[test]
    fn test_report_display() {
        let mut report = ScenarioReport::new("kernel-type");
        report.change_name = Some(String::from("kerneltype-1"));
        report.phase = ScenarioPhase::Done;
        assert!(report.passed());
        assert!(report.to_string().starts_with("PASS kernel-type"));

        report.phase = ScenarioPhase::AwaitingConvergence;
        report.fail(ScenarioError::AssertionMismatch {
            what: String::from("packages"),
            expected: String::from("kernel-rt-core"),
            observed: String::new(),
        });
        report.cleanup_error = Some(ScenarioError::CleanupFailed {
            change: String::from("kerneltype-1"),
            source: ClusterError::Unavailable(String::from("apiserver down")),
        });
        assert!(!report.passed());
        assert!(report.failure("assertion-mismatch").is_some());
        assert!(report.failure("degraded").is_none());

        let text = report.to_string();
        assert!(text.starts_with("FAIL kernel-type"));
        assert!(text.contains("[awaiting-convergence] assertion-mismatch"));
        assert!(text.contains("apiserver down"), "{}", text);
    }

    #[test]
    fn test_check_annotations() {
        let mut node = NodeState {
            name: String::from("master-0"),
            ready: true,
            current_config: Some(String::from("rendered-master-a")),
            desired_config: Some(String::from("rendered-master-a")),
            daemon_state: Some(DaemonState::Done),
            reason: None,
        };
        check_annotations(&node, "rendered-master-a").expect("converged");
        assert!(check_annotations(&node, "rendered-master-b").is_err());
        node.daemon_state = Some(DaemonState::Working);
        assert!(check_annotations(&node, "rendered-master-a").is_err());
    }
}
