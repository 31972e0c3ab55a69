// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A real cluster, reached through the Kubernetes API
//!
//! Configuration changes are `MachineConfig` objects and pools are
//! `MachineConfigPool` objects, both cluster-scoped and accessed untyped.
//! Commands run inside the configuration daemon's pod on the node, which has
//! the node's root filesystem mounted at `/rootfs`.

use super::command_to_string;
use super::ChangePayload;
use super::ClusterError;
use super::ConfigStore;
use super::ConfigurationChange;
use super::DaemonLog;
use super::DaemonLogReader;
use super::ExecError;
use super::NodeExecutor;
use super::NodeState;
use super::PoolStatus;
use crate::config::DaemonPodConfig;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::Api;
use kube::api::AttachParams;
use kube::api::DeleteParams;
use kube::api::DynamicObject;
use kube::api::ListParams;
use kube::api::LogParams;
use kube::api::PostParams;
use kube::discovery::ApiResource;
use kube::Client;
use serde::Deserialize;
use slog::debug;
use slog::info;
use slog::o;
use slog::Logger;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;

const GROUP: &str = "machineconfiguration.openshift.io";
const VERSION: &str = "v1";
const IGNITION_VERSION: &str = "3.2.0";

fn machine_config_resource() -> ApiResource {
    ApiResource {
        group: GROUP.to_string(),
        version: VERSION.to_string(),
        api_version: format!("{}/{}", GROUP, VERSION),
        kind: String::from("MachineConfig"),
        plural: String::from("machineconfigs"),
    }
}

fn machine_config_pool_resource() -> ApiResource {
    ApiResource {
        group: GROUP.to_string(),
        version: VERSION.to_string(),
        api_version: format!("{}/{}", GROUP, VERSION),
        kind: String::from("MachineConfigPool"),
        plural: String::from("machineconfigpools"),
    }
}

/// Build the `MachineConfig` for `change`: an empty ignition config plus
/// the one thing the change asks for.
pub fn machine_config_manifest(
    change: &ConfigurationChange,
) -> serde_json::Value {
    let mut config = serde_json::json!({
        "ignition": { "version": IGNITION_VERSION },
    });
    let mut spec = serde_json::Map::new();
    match change.payload() {
        ChangePayload::KernelArguments(args) => {
            spec.insert("kernelArguments".into(), serde_json::json!(args));
        }
        ChangePayload::KernelType(kernel_type) => {
            spec.insert("kernelType".into(), serde_json::json!(kernel_type));
        }
        ChangePayload::Extensions(extensions) => {
            spec.insert("extensions".into(), serde_json::json!(extensions));
        }
        ChangePayload::AuthorizedKey { user, key } => {
            config["passwd"] = serde_json::json!({
                "users": [{ "name": user, "sshAuthorizedKeys": [key] }],
            });
        }
    }
    spec.insert("config".into(), config);

    serde_json::json!({
        "apiVersion": format!("{}/{}", GROUP, VERSION),
        "kind": "MachineConfig",
        "metadata": {
            "name": change.name(),
            "labels": change.labels(),
        },
        "spec": spec,
    })
}

#[derive(Debug, Default, Deserialize)]
struct PoolFields {
    #[serde(default)]
    spec: PoolSpec,
    #[serde(default)]
    status: PoolStatusFields,
}

#[derive(Debug, Default, Deserialize)]
struct PoolSpec {
    configuration: Option<PoolConfiguration>,
}

#[derive(Debug, Default, Deserialize)]
struct PoolStatusFields {
    configuration: Option<PoolConfiguration>,
    #[serde(default)]
    conditions: Vec<PoolCondition>,
}

#[derive(Debug, Deserialize)]
struct PoolConfiguration {
    name: Option<String>,
    #[serde(default)]
    source: Vec<ObjectReference>,
}

#[derive(Debug, Deserialize)]
struct ObjectReference {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PoolCondition {
    #[serde(rename = "type")]
    type_: String,
    status: String,
}

/// Interpret the untyped body of a `MachineConfigPool`.
///
/// The desired configuration and its sources come from
/// `.spec.configuration`; the current configuration is the one in the
/// status, which is only updated once every node in the pool has finished
/// rolling it out.
pub fn parse_pool_status(
    name: &str,
    data: &serde_json::Value,
) -> Result<PoolStatus, ClusterError> {
    let fields: PoolFields =
        serde_json::from_value(data.clone()).map_err(|e| {
            ClusterError::Malformed {
                kind: "MachineConfigPool",
                name: name.to_owned(),
                message: e.to_string(),
            }
        })?;
    let condition = |type_: &str| {
        fields
            .status
            .conditions
            .iter()
            .any(|c| c.type_ == type_ && c.status == "True")
    };
    let (desired, desired_sources) = match &fields.spec.configuration {
        Some(c) => (
            c.name.clone(),
            c.source.iter().map(|s| s.name.clone()).collect(),
        ),
        None => (None, Vec::new()),
    };
    Ok(PoolStatus {
        name: name.to_owned(),
        current: fields
            .status
            .configuration
            .as_ref()
            .and_then(|c| c.name.clone()),
        desired,
        desired_sources,
        updated: condition("Updated"),
        degraded: condition("Degraded"),
    })
}

/// What the verifier needs to know about a `Node`
pub fn node_state(node: &Node) -> NodeState {
    let name = node.metadata.name.clone().unwrap_or_default();
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions.iter().any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);
    let annotations =
        node.metadata.annotations.clone().unwrap_or_default();
    NodeState::from_annotations(name, ready, &annotations)
}

/// Exit status of a finished exec, or `None` if it succeeded
pub fn exec_failure_status(status: &Status) -> Option<String> {
    if status.status.as_deref() != Some("Failure") {
        return None;
    }
    let exit_code = status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes.iter().find(|c| c.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|c| c.message.clone());
    Some(
        exit_code
            .or_else(|| status.message.clone())
            .unwrap_or_else(|| String::from("unknown")),
    )
}

pub struct KubeCluster {
    log: Logger,
    client: Client,
    daemon: DaemonPodConfig,
}

impl KubeCluster {
    pub fn new(log: &Logger, client: Client, daemon: DaemonPodConfig) -> Self {
        KubeCluster {
            log: log.new(o!("component" => "KubeCluster")),
            client,
            daemon,
        }
    }

    /// Connect using the ambient kubeconfig or in-cluster configuration.
    pub async fn connect(
        log: &Logger,
        daemon: DaemonPodConfig,
    ) -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        Ok(KubeCluster::new(log, client, daemon))
    }

    fn machine_configs(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &machine_config_resource())
    }

    fn pools(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &machine_config_pool_resource())
    }

    fn daemon_pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.daemon.namespace)
    }

    /// Find the daemon pod running on `node`.
    async fn daemon_pod_on(&self, node: &str) -> Result<String, ClusterError> {
        let params = ListParams::default()
            .labels(&self.daemon.selector)
            .fields(&format!("spec.nodeName={}", node));
        let pods = self.daemon_pods().list(&params).await?;
        pods.items
            .into_iter()
            .find_map(|pod| pod.metadata.name)
            .ok_or_else(|| ClusterError::NotFound {
                kind: "daemon pod on node",
                name: node.to_owned(),
            })
    }
}

#[async_trait]
impl ConfigStore for KubeCluster {
    async fn create_config(
        &self,
        change: &ConfigurationChange,
    ) -> Result<(), ClusterError> {
        let object: DynamicObject =
            serde_json::from_value(machine_config_manifest(change)).map_err(
                |e| ClusterError::Malformed {
                    kind: "MachineConfig",
                    name: change.name().to_owned(),
                    message: e.to_string(),
                },
            )?;
        let params = PostParams::default();
        match self.machine_configs().create(&params, &object).await {
            Ok(_) => {
                debug!(self.log, "created MachineConfig";
                    "name" => change.name()
                );
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                Err(ClusterError::AlreadyExists {
                    kind: "MachineConfig",
                    name: change.name().to_owned(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_config(&self, name: &str) -> Result<(), ClusterError> {
        let params = DeleteParams::default();
        match self.machine_configs().delete(name, &params).await {
            Ok(_) => {
                debug!(self.log, "deleted MachineConfig"; "name" => name);
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                Err(ClusterError::NotFound {
                    kind: "MachineConfig",
                    name: name.to_owned(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn pool_status(
        &self,
        pool: &str,
    ) -> Result<PoolStatus, ClusterError> {
        match self.pools().get(pool).await {
            Ok(object) => parse_pool_status(pool, &object.data),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                Err(ClusterError::NotFound {
                    kind: "MachineConfigPool",
                    name: pool.to_owned(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn nodes_with_role(
        &self,
        role: &str,
    ) -> Result<Vec<NodeState>, ClusterError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let params = ListParams::default()
            .labels(&format!("node-role.kubernetes.io/{}", role));
        let list = nodes.list(&params).await?;
        Ok(list.items.iter().map(node_state).collect())
    }
}

/// Read one of an exec session's output streams to the end.  Bytes that are
/// not UTF-8 are replaced rather than dropping the output.
async fn read_stream<R>(stream: Option<R>) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut output = Vec::new();
    if let Some(mut stream) = stream {
        stream.read_to_end(&mut output).await?;
    }
    Ok(String::from_utf8_lossy(&output).into_owned())
}

#[async_trait]
impl NodeExecutor for KubeCluster {
    async fn exec(
        &self,
        node: &str,
        argv: &[String],
    ) -> Result<String, ExecError> {
        let command = command_to_string(argv);
        let transport = |message: String| ExecError::Transport {
            node: node.to_owned(),
            command: command.clone(),
            message,
        };

        let pod = self
            .daemon_pod_on(node)
            .await
            .map_err(|e| transport(e.to_string()))?;
        debug!(self.log, "running command";
            "node" => node,
            "pod" => &pod,
            "command" => &command,
        );
        let params = AttachParams::default()
            .container(&self.daemon.container)
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut attached = self
            .daemon_pods()
            .exec(&pod, argv.to_vec(), &params)
            .await
            .map_err(|e| transport(e.to_string()))?;

        let status = attached.take_status();
        let (stdout, stderr) = tokio::join!(
            read_stream(attached.stdout()),
            read_stream(attached.stderr()),
        );
        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        attached.join().await.map_err(|e| transport(e.to_string()))?;
        let stdout = stdout
            .map_err(|e| transport(format!("reading stdout: {}", e)))?;
        let stderr = stderr
            .map_err(|e| transport(format!("reading stderr: {}", e)))?;

        match status.as_ref().and_then(exec_failure_status) {
            None => Ok(stdout),
            Some(status) => Err(ExecError::CommandFailure {
                node: node.to_owned(),
                command,
                status,
                stdout,
                stderr,
            }),
        }
    }
}

#[async_trait]
impl DaemonLogReader for KubeCluster {
    async fn daemon_logs(&self) -> Result<Vec<DaemonLog>, ClusterError> {
        let pods = self.daemon_pods();
        let list = pods
            .list(&ListParams::default().labels(&self.daemon.selector))
            .await?;
        let params = LogParams {
            container: Some(self.daemon.container.clone()),
            ..Default::default()
        };
        let mut logs = Vec::with_capacity(list.items.len());
        for pod in list.items {
            let Some(name) = pod.metadata.name else { continue };
            let contents = pods.logs(&name, &params).await?;
            logs.push(DaemonLog {
                pod: name,
                node: pod.spec.and_then(|s| s.node_name),
                contents,
            });
        }
        info!(self.log, "fetched daemon logs"; "pods" => logs.len());
        Ok(logs)
    }
}
