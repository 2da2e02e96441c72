//! Membership reconciliation for one VirtualCluster at a time
//!
//! Desired membership comes from the cluster spec; actual membership is
//! whatever node objects its own API reports. The controller computes the
//! join and unjoin sets order-independently, resolves every name against the
//! GlobalNode collection (an unresolved name fails the whole reconcile), and
//! fans the pipelines out under a bounded admission limit. One node's failure
//! never cancels its siblings; failures are aggregated into one batch error
//! and the reconcile requeues.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::agent::AgentClient;
use crate::api::certs::CertStore;
use crate::api::kubeconfig::KubeconfigError;
use crate::api::rest::RestClusterApi;
use crate::api::{
    retry_on_conflict, ApiError, ClusterApi, GlobalNode, Kubeconfig, Phase, Store, StoreError,
    VirtualCluster,
};
use crate::config::Settings;
use crate::flows::{join_workflow, unjoin_workflow, TaskContext};

use super::events::EventRecorder;
use super::ports::{HostPortManager, PortError};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("declared node '{0}' does not exist in the node pool")]
    UnresolvedNode(String),

    #[error("cluster kubeconfig invalid: {0}")]
    Kubeconfig(#[from] KubeconfigError),

    #[error("virtual cluster api: {0}")]
    Api(#[from] ApiError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("{} node pipeline(s) failed: {}", failures.len(), summarize(failures))]
    Batch { failures: Vec<NodeFailure> },
}

/// One node's pipeline failure, kept for the aggregated batch error
#[derive(Debug)]
pub struct NodeFailure {
    pub node: String,
    pub error: String,
}

fn summarize(failures: &[NodeFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.node, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Produces the API handle for one virtual cluster; the seam that lets tests
/// substitute an in-memory API
pub trait ClusterApiFactory: Send + Sync {
    fn api_for(&self, cluster: &VirtualCluster) -> Result<Arc<dyn ClusterApi>, ReconcileError>;
}

/// Production factory: decode the embedded kubeconfig, build a REST client
pub struct KubeconfigApiFactory;

impl ClusterApiFactory for KubeconfigApiFactory {
    fn api_for(&self, cluster: &VirtualCluster) -> Result<Arc<dyn ClusterApi>, ReconcileError> {
        let config = Kubeconfig::from_base64(&cluster.spec.kubeconfig)?;
        let api = RestClusterApi::new(&config)?;
        Ok(Arc::new(api))
    }
}

/// Join/unjoin sets for one reconcile, order-independent
pub fn membership_diff(desired: &[String], actual: &[String]) -> (Vec<String>, Vec<String>) {
    let desired_set: HashSet<&str> = desired.iter().map(String::as_str).collect();
    let actual_set: HashSet<&str> = actual.iter().map(String::as_str).collect();

    let mut join: Vec<String> = desired_set
        .difference(&actual_set)
        .map(|n| n.to_string())
        .collect();
    let mut unjoin: Vec<String> = actual_set
        .difference(&desired_set)
        .map(|n| n.to_string())
        .collect();
    join.sort();
    unjoin.sort();
    (join, unjoin)
}

enum PipelineKind {
    Join,
    Unjoin,
}

pub struct NodeController {
    store: Arc<Store>,
    certs: Arc<dyn CertStore>,
    agent: Arc<AgentClient>,
    api_factory: Arc<dyn ClusterApiFactory>,
    events: Arc<EventRecorder>,
    ports: Arc<HostPortManager>,
    settings: Settings,
}

impl NodeController {
    pub fn new(
        store: Arc<Store>,
        certs: Arc<dyn CertStore>,
        agent: Arc<AgentClient>,
        api_factory: Arc<dyn ClusterApiFactory>,
        events: Arc<EventRecorder>,
        ports: Arc<HostPortManager>,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            certs,
            agent,
            api_factory,
            events,
            ports,
            settings,
        }
    }

    /// Reconcile one cluster by name. A cluster that disappeared is not an
    /// error; everything else surfaces for the caller's requeue.
    pub async fn reconcile_cluster(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ReconcileError> {
        let Some(cluster) = self.store.clusters.get(name) else {
            debug!("cluster '{}' gone, nothing to reconcile", name);
            return Ok(());
        };

        let api = self.api_factory.api_for(&cluster)?;

        if !cluster.is_deleting() {
            self.ensure_host_port(&cluster);
        }

        let desired = cluster.desired_node_names();
        let actual: Vec<String> = api
            .list_nodes()
            .await?
            .into_iter()
            .map(|n| n.name)
            .collect();
        let (join_set, unjoin_set) = membership_diff(&desired, &actual);

        if join_set.is_empty() && unjoin_set.is_empty() {
            if cluster.is_deleting() {
                self.release_host_port(&cluster);
            }
            if matches!(cluster.status.phase, Phase::Updating | Phase::Deleting) {
                self.advance_phase(&cluster, settled_phase(&cluster), "membership settled")
                    .await?;
            }
            return Ok(());
        }

        info!(
            "cluster '{}': {} to join, {} to unjoin",
            cluster.name,
            join_set.len(),
            unjoin_set.len()
        );

        // Resolve every affected name before touching anything; a stale
        // declaration fails the whole diff rather than half-applying it.
        let mut batch: Vec<(GlobalNode, PipelineKind)> = Vec::new();
        for name in &join_set {
            batch.push((self.resolve(name)?, PipelineKind::Join));
        }
        for name in &unjoin_set {
            batch.push((self.resolve(name)?, PipelineKind::Unjoin));
        }

        // A deleting cluster keeps its Deleting phase while the batch drains;
        // anything else reports Updating.
        let in_flight_phase = if cluster.is_deleting() {
            Phase::Deleting
        } else {
            Phase::Updating
        };
        self.advance_phase(&cluster, in_flight_phase, "node batch dispatched")
            .await?;
        self.events.normal(
            &format!("virtualcluster/{}", cluster.name),
            "Updating",
            format!("joining {:?}, unjoining {:?}", join_set, unjoin_set),
        );

        self.dispatch(&cluster, api, batch, cancel).await?;

        // The batch drained clean: a teardown no longer needs its host port.
        if cluster.is_deleting() {
            self.release_host_port(&cluster);
        }
        self.advance_phase(&cluster, settled_phase(&cluster), "node batch drained")
            .await?;
        Ok(())
    }

    /// Reserve a host port for the cluster's exposed endpoint. An empty
    /// candidate pool means the operator runs without port brokering, so
    /// nothing is reported then.
    fn ensure_host_port(&self, cluster: &VirtualCluster) {
        if self.ports.allocation_for(&cluster.name).is_some() {
            return;
        }
        match self.ports.allocate(&cluster.name) {
            Ok(port) => self.events.normal(
                &format!("virtualcluster/{}", cluster.name),
                "HostPortAllocated",
                format!("host port {} reserved", port),
            ),
            Err(PortError::Exhausted(0)) => {}
            Err(e) => self.events.warning(
                &format!("virtualcluster/{}", cluster.name),
                "HostPortUnavailable",
                e.to_string(),
            ),
        }
    }

    fn release_host_port(&self, cluster: &VirtualCluster) {
        if let Some(port) = self.ports.release(&cluster.name) {
            self.events.normal(
                &format!("virtualcluster/{}", cluster.name),
                "HostPortReleased",
                format!("host port {} returned to the pool", port),
            );
        }
    }

    fn resolve(&self, name: &str) -> Result<GlobalNode, ReconcileError> {
        self.store
            .nodes
            .get(name)
            .ok_or_else(|| ReconcileError::UnresolvedNode(name.to_string()))
    }

    /// Fan the batch out, at most `node_task_concurrency` pipelines at once.
    /// Per-node errors are collected and combined; siblings keep running.
    async fn dispatch(
        &self,
        cluster: &VirtualCluster,
        api: Arc<dyn ClusterApi>,
        batch: Vec<(GlobalNode, PipelineKind)>,
        cancel: &CancellationToken,
    ) -> Result<(), ReconcileError> {
        let limiter = Arc::new(Semaphore::new(self.settings.node_task_concurrency));
        let (failure_tx, mut failure_rx) = mpsc::channel::<NodeFailure>(batch.len().max(1));

        let mut handles = Vec::with_capacity(batch.len());
        for (node, kind) in batch {
            let limiter = limiter.clone();
            let failure_tx = failure_tx.clone();
            let ctx = Arc::new(TaskContext {
                node,
                cluster: cluster.clone(),
                store: self.store.clone(),
                cluster_api: api.clone(),
                certs: self.certs.clone(),
                agent: self.agent.clone(),
                settings: self.settings.clone(),
                cancel: cancel.clone(),
            });

            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await.expect("limiter closed");
                let node_name = ctx.node.name.clone();

                let result = match kind {
                    PipelineKind::Join => join_workflow().run(ctx).await,
                    PipelineKind::Unjoin => unjoin_workflow().run(ctx).await,
                };
                if let Err(e) = result {
                    let _ = failure_tx
                        .send(NodeFailure {
                            node: node_name,
                            error: e.to_string(),
                        })
                        .await;
                }
            }));
        }
        drop(failure_tx);

        // Completion barrier: every pipeline finishes before we judge the batch.
        for handle in handles {
            if let Err(e) = handle.await {
                error!("node pipeline task panicked: {}", e);
            }
        }

        let mut failures = Vec::new();
        while let Some(failure) = failure_rx.recv().await {
            failures.push(failure);
        }

        if failures.is_empty() {
            Ok(())
        } else {
            for failure in &failures {
                self.events.warning(
                    &format!("virtualcluster/{}", cluster.name),
                    "NodePipelineFailed",
                    format!("{}: {}", failure.node, failure.error),
                );
            }
            Err(ReconcileError::Batch { failures })
        }
    }

    /// Commit a phase transition with the usual conflict retry
    async fn advance_phase(
        &self,
        cluster: &VirtualCluster,
        phase: Phase,
        reason: &str,
    ) -> Result<(), ReconcileError> {
        if cluster.status.phase == phase {
            return Ok(());
        }

        info!("cluster '{}' phase -> {:?} ({})", cluster.name, phase, reason);

        let store = self.store.clone();
        let name = cluster.name.clone();
        let reason = reason.to_string();
        retry_on_conflict(move || {
            let store = store.clone();
            let name = name.clone();
            let reason = reason.clone();
            async move {
                let mut cluster = store
                    .clusters
                    .get(&name)
                    .ok_or(StoreError::NotFound(name))?;
                cluster.status.phase = phase;
                cluster.status.reason = reason;
                cluster.status.update_time = Some(Utc::now());
                store.clusters.update(cluster).map(|_| ())
            }
        })
        .await?;
        Ok(())
    }

    /// Periodic driver: sweep every cluster each interval until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.settings.reconcile_interval_secs);
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for cluster in self.store.clusters.list() {
                        if cancel.is_cancelled() {
                            break;
                        }
                        if let Err(e) = self.reconcile_cluster(&cluster.name, &cancel).await {
                            error!("reconcile of '{}' failed, will requeue: {}", cluster.name, e);
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    info!("node controller stopping");
                    return;
                }
            }
        }
    }
}

/// Phase a drained batch settles into
fn settled_phase(cluster: &VirtualCluster) -> Phase {
    if cluster.is_deleting() {
        Phase::AllNodeDeleted
    } else {
        Phase::AllNodeReady
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_diff_basic() {
        let (join, unjoin) =
            membership_diff(&names(&["A", "B", "C"]), &names(&["B", "C", "D"]));
        assert_eq!(join, vec!["A"]);
        assert_eq!(unjoin, vec!["D"]);
    }

    #[test]
    fn test_diff_is_order_independent() {
        let (join_a, unjoin_a) =
            membership_diff(&names(&["A", "B", "C"]), &names(&["B", "C", "D"]));
        let (join_b, unjoin_b) =
            membership_diff(&names(&["C", "A", "B"]), &names(&["D", "C", "B"]));
        assert_eq!(join_a, join_b);
        assert_eq!(unjoin_a, unjoin_b);
    }

    #[test]
    fn test_diff_empty_sides() {
        let (join, unjoin) = membership_diff(&[], &names(&["A"]));
        assert!(join.is_empty());
        assert_eq!(unjoin, vec!["A"]);

        let (join, unjoin) = membership_diff(&names(&["A"]), &[]);
        assert_eq!(join, vec!["A"]);
        assert!(unjoin.is_empty());
    }

    #[test]
    fn test_diff_identical_sets_are_settled() {
        let (join, unjoin) = membership_diff(&names(&["A", "B"]), &names(&["B", "A"]));
        assert!(join.is_empty());
        assert!(unjoin.is_empty());
    }

    #[test]
    fn test_batch_error_names_every_failed_node() {
        let err = ReconcileError::Batch {
            failures: vec![
                NodeFailure {
                    node: "n1".to_string(),
                    error: "connect refused".to_string(),
                },
                NodeFailure {
                    node: "n2".to_string(),
                    error: "not ready in time".to_string(),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("n1: connect refused"));
        assert!(text.contains("n2: not ready in time"));
        assert!(text.starts_with("2 node pipeline(s) failed"));
    }
}
