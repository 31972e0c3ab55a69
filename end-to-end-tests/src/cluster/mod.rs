// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces to the control plane under test
//!
//! The verifier never talks to the rollout mechanism directly.  It creates
//! and deletes its own configuration objects through a [`ConfigStore`],
//! observes pools and nodes through the same store, and inspects the node
//! through a [`NodeExecutor`].  Everything behind these traits is eventually
//! consistent and may change between any two calls.

pub mod kube;

use crate::helpers::generate_name;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Label selecting which pool a configuration object applies to
pub const ROLE_LABEL: &str = "machineconfiguration.openshift.io/role";

/// Node annotation naming the rendered configuration the node is running
pub const CURRENT_CONFIG_ANNOTATION: &str =
    "machineconfiguration.openshift.io/currentConfig";
/// Node annotation naming the rendered configuration the node should run
pub const DESIRED_CONFIG_ANNOTATION: &str =
    "machineconfiguration.openshift.io/desiredConfig";
/// Node annotation holding the daemon's [`DaemonState`]
pub const DAEMON_STATE_ANNOTATION: &str =
    "machineconfiguration.openshift.io/state";
/// Node annotation explaining a degraded or unreconcilable state
pub const DAEMON_REASON_ANNOTATION: &str =
    "machineconfiguration.openshift.io/reason";

/// What a [`ConfigurationChange`] asks for on top of the neutral base
/// payload.  Exactly one of these per change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangePayload {
    KernelArguments(Vec<String>),
    KernelType(String),
    Extensions(Vec<String>),
    AuthorizedKey { user: String, key: String },
}

impl ChangePayload {
    pub fn kind(&self) -> &'static str {
        match self {
            ChangePayload::KernelArguments(_) => "kernel-arguments",
            ChangePayload::KernelType(_) => "kernel-type",
            ChangePayload::Extensions(_) => "extensions",
            ChangePayload::AuthorizedKey { .. } => "authorized-key",
        }
    }
}

/// A configuration object created by the verifier
///
/// Fields are private and there are no setters: once a change has been
/// submitted, reasoning about which rendered configuration contains it
/// depends on it never being modified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigurationChange {
    name: String,
    role: String,
    payload: ChangePayload,
}

impl ConfigurationChange {
    /// Make a change with a unique name starting with `prefix`, targeting
    /// the pool for `role`.
    pub fn new(prefix: &str, role: &str, payload: ChangePayload) -> Self {
        ConfigurationChange::with_name(generate_name(prefix), role, payload)
    }

    pub fn with_name(
        name: impl Into<String>,
        role: &str,
        payload: ChangePayload,
    ) -> Self {
        ConfigurationChange {
            name: name.into(),
            role: role.to_owned(),
            payload,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn payload(&self) -> &ChangePayload {
        &self.payload
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(ROLE_LABEL.to_owned(), self.role.clone())])
    }
}

/// State reported by the node's configuration daemon
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DaemonState {
    Done,
    Working,
    Degraded,
    Unreconcilable,
    /// a value this verifier does not know about
    Unknown(String),
}

impl DaemonState {
    pub fn from_annotation(value: &str) -> DaemonState {
        match value {
            "Done" => DaemonState::Done,
            "Working" => DaemonState::Working,
            "Degraded" => DaemonState::Degraded,
            "Unreconcilable" => DaemonState::Unreconcilable,
            other => DaemonState::Unknown(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DaemonState::Done => "Done",
            DaemonState::Working => "Working",
            DaemonState::Degraded => "Degraded",
            DaemonState::Unreconcilable => "Unreconcilable",
            DaemonState::Unknown(other) => other,
        }
    }

    /// Returns true for states in which the daemon has given up applying
    /// its desired configuration.
    pub fn is_failed(&self) -> bool {
        matches!(self, DaemonState::Degraded | DaemonState::Unreconcilable)
    }

    /// Whether the daemon may move directly from `self` to `next`.
    ///
    /// Staying in the same state is always allowed.  Nothing is known about
    /// transitions into or out of an unrecognised state, so they are
    /// rejected.
    pub fn can_transition_to(&self, next: &DaemonState) -> bool {
        use DaemonState::*;
        match (self, next) {
            (Unknown(a), Unknown(b)) => a == b,
            (Unknown(_), _) | (_, Unknown(_)) => false,
            (Done, Done)
            | (Working, Working)
            | (Degraded, Degraded)
            | (Unreconcilable, Unreconcilable) => true,
            (Done, Working | Degraded | Unreconcilable) => true,
            (Working, Done | Degraded | Unreconcilable) => true,
            (Degraded, Done | Working) => true,
            (Degraded, Unreconcilable) => false,
            (Unreconcilable, Done | Working) => true,
            (Unreconcilable, Degraded) => false,
        }
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the verifier can observe about one node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeState {
    pub name: String,
    pub ready: bool,
    pub current_config: Option<String>,
    pub desired_config: Option<String>,
    pub daemon_state: Option<DaemonState>,
    pub reason: Option<String>,
}

impl NodeState {
    /// Build a `NodeState` from a node's annotations.
    pub fn from_annotations(
        name: impl Into<String>,
        ready: bool,
        annotations: &BTreeMap<String, String>,
    ) -> NodeState {
        NodeState {
            name: name.into(),
            ready,
            current_config: annotations.get(CURRENT_CONFIG_ANNOTATION).cloned(),
            desired_config: annotations.get(DESIRED_CONFIG_ANNOTATION).cloned(),
            daemon_state: annotations
                .get(DAEMON_STATE_ANNOTATION)
                .map(|s| DaemonState::from_annotation(s)),
            reason: annotations
                .get(DAEMON_REASON_ANNOTATION)
                .filter(|s| !s.is_empty())
                .cloned(),
        }
    }

    pub fn is_converged(&self, target: &str) -> bool {
        is_converged(self, target)
    }
}

/// The one definition of "this node has finished rolling out `target`".
///
/// Both halves matter.  A node still reports its old configuration while it
/// is mid-transition, and a node can report `Done` against a stale
/// configuration just before it notices the new one.
pub fn is_converged(node: &NodeState, target: &str) -> bool {
    node.current_config.as_deref() == Some(target)
        && node.daemon_state == Some(DaemonState::Done)
}

/// What the verifier can observe about one pool
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStatus {
    pub name: String,
    /// rendered configuration the pool reports as applied
    pub current: Option<String>,
    /// rendered configuration the pool is rolling out
    pub desired: Option<String>,
    /// names of the configuration objects `desired` was rendered from
    pub desired_sources: Vec<String>,
    pub updated: bool,
    pub degraded: bool,
}

/// Output of one daemon instance's log
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DaemonLog {
    pub pod: String,
    pub node: Option<String>,
    pub contents: String,
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("expected exactly one node with role {role:?}, found {count}")]
    NodeCount { role: String, count: usize },

    #[error("malformed {kind} {name:?}: {message}")]
    Malformed { kind: &'static str, name: String, message: String },

    #[error("control plane unavailable: {0}")]
    Unavailable(String),

    #[error("cluster API request failed")]
    Kube(#[from] ::kube::Error),
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to run [{command}] on node {node}: {message}")]
    Transport { node: String, command: String, message: String },

    #[error(
        "[{command}] on node {node} failed with status {status}: \
         stdout: {stdout} stderr: {stderr}"
    )]
    CommandFailure {
        node: String,
        command: String,
        status: String,
        stdout: String,
        stderr: String,
    },
}

pub fn command_to_string(argv: &[String]) -> String {
    argv.join(" ")
}

/// Create, delete, and read the objects the rollout mechanism acts on
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn create_config(
        &self,
        change: &ConfigurationChange,
    ) -> Result<(), ClusterError>;

    async fn delete_config(&self, name: &str) -> Result<(), ClusterError>;

    async fn pool_status(&self, pool: &str) -> Result<PoolStatus, ClusterError>;

    async fn nodes_with_role(
        &self,
        role: &str,
    ) -> Result<Vec<NodeState>, ClusterError>;
}

/// Run read-only commands in a node's root context
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Returns the command's stdout.  A non-zero exit is an error.
    async fn exec(&self, node: &str, argv: &[String])
        -> Result<String, ExecError>;
}

/// Fetch the logs of every configuration daemon instance
#[async_trait]
pub trait DaemonLogReader: Send + Sync {
    async fn daemon_logs(&self) -> Result<Vec<DaemonLog>, ClusterError>;
}
