//! Unjoin pipeline: release a host from a virtual cluster and hand it back
//! to the host cluster
//!
//! The rejoin-to-host part is a nested two-step sequence: fetch a fresh join
//! command from a host-cluster master's agent, then execute it on the node.
//! The fetched command rides the workflow artifact between the two steps.

use std::sync::Arc;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::agent::Operation;
use crate::api::NodeState;
use crate::workflow::{Artifact, Task, TaskError, TaskResult, Workflow};

use super::TaskContext;

/// Shape of the command `kubeadm token create --print-join-command` emits
const JOIN_COMMAND_PATTERN: &str = r"kubeadm join[^\r\n]*";

/// Build the unjoin workflow for the context's node/cluster pair
pub fn unjoin_workflow() -> Workflow<TaskContext> {
    Workflow::new(
        "unjoin",
        vec![
            Task::step("check-environment", true, check_environment),
            Task::step("remove-node-object", false, remove_node_object),
            Task::step("remote-unjoin", true, remote_unjoin),
            Task::sequence(
                "rejoin-host-cluster",
                true,
                vec![
                    Task::step("fetch-host-join-command", true, fetch_host_join_command),
                    Task::step("execute-host-join", true, execute_host_join),
                ],
            ),
            Task::step("mark-node-free", false, mark_node_free),
        ],
    )
}

async fn check_environment(ctx: Arc<TaskContext>, artifact: Artifact) -> TaskResult {
    ctx.run_on_node(&ctx.helper("check")).await?;
    Ok(artifact)
}

/// Remove the worker node object from the virtual cluster's own API; an
/// already-removed node is fine
async fn remove_node_object(ctx: Arc<TaskContext>, artifact: Artifact) -> TaskResult {
    match ctx.cluster_api.delete_node(&ctx.node.name).await {
        Ok(()) => Ok(artifact),
        Err(e) if e.is_not_found() => {
            debug!("node object '{}' already gone", ctx.node.name);
            Ok(artifact)
        }
        Err(e) => Err(TaskError(anyhow::Error::new(e))),
    }
}

async fn remote_unjoin(ctx: Arc<TaskContext>, artifact: Artifact) -> TaskResult {
    info!(
        "unjoining node '{}' from '{}'",
        ctx.node.name, ctx.cluster.name
    );
    ctx.run_on_node(&ctx.helper("unjoin")).await?;
    Ok(artifact)
}

/// Ask a host-cluster master's agent for a fresh bootstrap join command and
/// stash it in the artifact for the next step
async fn fetch_host_join_command(ctx: Arc<TaskContext>, mut artifact: Artifact) -> TaskResult {
    if ctx.settings.host_master_node_ip.is_empty() {
        warn!("no host master configured, released node stays unregistered");
        artifact.host_join_command = None;
        return Ok(artifact);
    }

    let op = Operation::command("kubeadm")
        .arg("token")
        .arg("create")
        .arg("--print-join-command");
    let outcome = ctx
        .run_on_host(&ctx.settings.host_master_node_ip, &op)
        .await?;

    let pattern = Regex::new(JOIN_COMMAND_PATTERN)
        .map_err(|e| TaskError::msg(format!("bad join-command pattern: {}", e)))?;
    let command = pattern
        .find(&outcome.log)
        .map(|m| m.as_str().trim().to_string())
        .ok_or_else(|| {
            TaskError::msg(format!(
                "no join command in master output: {:?}",
                outcome.log
            ))
        })?;

    artifact.host_join_command = Some(command);
    Ok(artifact)
}

async fn execute_host_join(ctx: Arc<TaskContext>, artifact: Artifact) -> TaskResult {
    let Some(command) = artifact.host_join_command.clone() else {
        return Ok(artifact);
    };

    info!("rejoining '{}' to the host cluster", ctx.node.name);
    let op = Operation::command("sh").arg("-c").arg(command);
    ctx.run_on_node(&op).await?;
    Ok(artifact)
}

async fn mark_node_free(ctx: Arc<TaskContext>, artifact: Artifact) -> TaskResult {
    ctx.mark_node(NodeState::Free, None).await?;
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ClusterApi, GlobalNode, VirtualCluster, WorkerNode};
    use crate::flows::testutil::Fixture;

    fn seeded_fixture() -> (Fixture, GlobalNode, VirtualCluster) {
        let fixture = Fixture::new();

        let mut node = GlobalNode::new("n1", "10.0.0.1");
        node.spec.state = NodeState::InUse;
        node.status.virtual_cluster = "tenant-a".to_string();
        let node = fixture.store.nodes.insert(node).unwrap();

        let cluster = fixture
            .store
            .clusters
            .insert(VirtualCluster::new("tenant-a"))
            .unwrap();

        fixture.cluster_api.put_node(WorkerNode::new("n1").ready());
        fixture.call.log_for(
            "cmd kubeadm token create",
            "kubeadm join 10.0.0.100:6443 --token abc.def --discovery-token-ca-cert-hash sha256:123\n",
        );

        (fixture, node, cluster)
    }

    #[tokio::test]
    async fn test_unjoin_frees_node_and_removes_object() {
        let (fixture, node, cluster) = seeded_fixture();
        let ctx = fixture.context(node, cluster);

        unjoin_workflow().run(ctx).await.unwrap();

        let stored = fixture.store.nodes.get("n1").unwrap();
        assert_eq!(stored.spec.state, NodeState::Free);
        assert!(stored.status.virtual_cluster.is_empty());
        assert!(fixture
            .cluster_api
            .get_node("n1")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_unjoin_executes_fetched_join_command() {
        let (fixture, node, cluster) = seeded_fixture();
        let ctx = fixture.context(node, cluster);

        unjoin_workflow().run(ctx).await.unwrap();

        let recorded = fixture.call.recorded();
        assert!(recorded
            .iter()
            .any(|c| c.starts_with("cmd kubeadm token create --print-join-command")));
        assert!(recorded
            .iter()
            .any(|c| c.starts_with("cmd sh -c kubeadm join 10.0.0.100:6443")));
    }

    #[tokio::test]
    async fn test_unjoin_without_host_master_skips_rejoin() {
        let (mut fixture, node, cluster) = seeded_fixture();
        fixture.settings.host_master_node_ip = String::new();
        let ctx = fixture.context(node, cluster);

        unjoin_workflow().run(ctx).await.unwrap();

        let recorded = fixture.call.recorded();
        assert!(!recorded.iter().any(|c| c.starts_with("cmd kubeadm token")));
        assert!(!recorded.iter().any(|c| c.starts_with("cmd sh -c")));
        assert_eq!(
            fixture.store.nodes.get("n1").unwrap().spec.state,
            NodeState::Free
        );
    }

    #[tokio::test]
    async fn test_unjoin_tolerates_missing_node_object() {
        let (fixture, node, cluster) = seeded_fixture();
        fixture.cluster_api.delete_node("n1").await.unwrap();
        let ctx = fixture.context(node, cluster);

        unjoin_workflow().run(ctx).await.unwrap();
        assert_eq!(
            fixture.store.nodes.get("n1").unwrap().spec.state,
            NodeState::Free
        );
    }

    #[tokio::test]
    async fn test_unjoin_fails_when_master_output_has_no_command() {
        let (fixture, node, cluster) = seeded_fixture();
        fixture.call.logs.lock().unwrap().clear();
        let ctx = fixture.context(node, cluster);

        let err = unjoin_workflow().run(ctx).await.unwrap_err();
        assert_eq!(err.task, "rejoin-host-cluster");

        // The node was never marked free.
        assert_eq!(
            fixture.store.nodes.get("n1").unwrap().spec.state,
            NodeState::InUse
        );
    }
}
