//! Join and unjoin pipelines
//!
//! Each pipeline is a [`Workflow`](crate::workflow::Workflow) over a shared
//! [`TaskContext`] built fresh per reconcile for one node/cluster pair. Every
//! step must tolerate re-running from scratch on the next reconcile; there is
//! no rollback.

pub mod join;
pub mod unjoin;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agent::{AgentClient, ExecOutcome, Operation};
use crate::api::certs::CertStore;
use crate::api::{retry_on_conflict, ClusterApi, GlobalNode, NodeState, Store, VirtualCluster};
use crate::config::Settings;
use crate::workflow::TaskError;

pub use join::join_workflow;
pub use unjoin::unjoin_workflow;

/// Everything one pipeline invocation needs; snapshots plus client handles.
/// Constructed fresh per reconcile, never persisted.
pub struct TaskContext {
    /// Snapshot of the node being moved
    pub node: GlobalNode,
    /// Snapshot of the cluster claiming or releasing it
    pub cluster: VirtualCluster,
    pub store: Arc<Store>,
    pub cluster_api: Arc<dyn ClusterApi>,
    pub certs: Arc<dyn CertStore>,
    pub agent: Arc<AgentClient>,
    pub settings: Settings,
    pub cancel: CancellationToken,
}

impl TaskContext {
    /// Invocation of the helper script with one subcommand
    pub fn helper(&self, subcommand: &str) -> Operation {
        Operation::command("bash")
            .arg(&self.settings.helper_script)
            .arg(subcommand)
    }

    /// Run one operation against this node's agent, failing the task on a
    /// non-success outcome
    pub async fn run_on_node(&self, op: &Operation) -> Result<ExecOutcome, TaskError> {
        self.run_on_host(&self.node.spec.node_ip, op).await
    }

    pub async fn run_on_host(&self, host: &str, op: &Operation) -> Result<ExecOutcome, TaskError> {
        self.agent
            .run(host, op, &self.cancel)
            .await
            .map_err(|e| TaskError(anyhow::Error::new(e)))
    }

    /// Commit the node's pool state and owning-cluster reference, retrying on
    /// version conflicts
    pub async fn mark_node(&self, state: NodeState, owner: Option<&str>) -> Result<(), TaskError> {
        let store = self.store.clone();
        let name = self.node.name.clone();
        let owner = owner.map(str::to_string);

        retry_on_conflict(|| {
            let store = store.clone();
            let name = name.clone();
            let owner = owner.clone();
            async move {
                let mut node = store
                    .nodes
                    .get(&name)
                    .ok_or(crate::api::StoreError::NotFound(name))?;
                node.spec.state = state;
                node.status.virtual_cluster = owner.unwrap_or_default();
                store.nodes.update(node).map(|_| ())
            }
        })
        .await
        .map_err(|e| TaskError(anyhow::Error::new(e)))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::agent::transport::{AgentCall, AgentTarget};
    use crate::api::certs::MemoryCertStore;
    use crate::api::MemoryClusterApi;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Transport that answers every call with success and records the
    /// operations in order
    pub struct RecordingCall {
        pub calls: Mutex<Vec<String>>,
        /// Descriptions (prefix match) that should fail instead
        pub fail_on: Mutex<Vec<String>>,
        /// Canned log text keyed by description prefix
        pub logs: Mutex<Vec<(String, String)>>,
        /// Side effect invoked with each call's description, simulating what
        /// the remote command would do (e.g. the kubelet registering)
        pub on_call: Mutex<Option<Box<dyn Fn(&str) + Send + Sync>>>,
    }

    impl RecordingCall {
        pub fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_on: Mutex::new(Vec::new()),
                logs: Mutex::new(Vec::new()),
                on_call: Mutex::new(None),
            }
        }

        pub fn set_on_call(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
            *self.on_call.lock().unwrap() = Some(Box::new(hook));
        }

        pub fn fail_on(&self, prefix: impl Into<String>) {
            self.fail_on.lock().unwrap().push(prefix.into());
        }

        pub fn log_for(&self, prefix: impl Into<String>, log: impl Into<String>) {
            self.logs.lock().unwrap().push((prefix.into(), log.into()));
        }

        pub fn recorded(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentCall for RecordingCall {
        async fn call(
            &self,
            _target: &AgentTarget,
            op: &Operation,
            _cancel: &CancellationToken,
        ) -> ExecOutcome {
            let desc = op.describe();
            self.calls.lock().unwrap().push(desc.clone());

            if let Some(hook) = self.on_call.lock().unwrap().as_ref() {
                hook(&desc);
            }

            if self
                .fail_on
                .lock()
                .unwrap()
                .iter()
                .any(|p| desc.starts_with(p.as_str()))
            {
                return ExecOutcome::from_close("1".to_string(), String::new());
            }

            let log = self
                .logs
                .lock()
                .unwrap()
                .iter()
                .find(|(p, _)| desc.starts_with(p.as_str()))
                .map(|(_, l)| l.clone())
                .unwrap_or_default();
            ExecOutcome::from_close("0".to_string(), log)
        }
    }

    pub struct Fixture {
        pub store: Arc<Store>,
        pub cluster_api: Arc<MemoryClusterApi>,
        pub certs: Arc<MemoryCertStore>,
        pub call: Arc<RecordingCall>,
        pub settings: Settings,
    }

    impl Fixture {
        pub fn new() -> Self {
            let settings = {
                let mut s = Settings::default();
                s.agent_token = "dG9rZW4=".to_string();
                s.host_master_node_ip = "10.0.0.100".to_string();
                s.node_ready_timeout_secs = 1;
                s
            };
            let certs = Arc::new(MemoryCertStore::new());
            certs.put_cluster_ca("tenant-a", b"PEM".to_vec());
            Self {
                store: Arc::new(Store::new()),
                cluster_api: Arc::new(MemoryClusterApi::new()),
                certs,
                call: Arc::new(RecordingCall::new()),
                settings,
            }
        }

        pub fn context(&self, node: GlobalNode, cluster: VirtualCluster) -> Arc<TaskContext> {
            Arc::new(TaskContext {
                node,
                cluster,
                store: self.store.clone(),
                cluster_api: self.cluster_api.clone(),
                certs: self.certs.clone(),
                agent: Arc::new(AgentClient::new(self.call.clone(), &self.settings)),
                settings: self.settings.clone(),
                cancel: CancellationToken::new(),
            })
        }
    }
}
