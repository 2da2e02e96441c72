//! Join pipeline: move one free host into a virtual cluster
//!
//! Remote steps are retryable; the wait-for-ready poll and the API-side steps
//! are not — their retry comes from the reconcile requeue. Each step is safe
//! to re-run against an already-joined node.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{debug, info};

use crate::agent::Operation;
use crate::api::NodeState;
use crate::workflow::{Artifact, Task, TaskError, TaskResult, Workflow};

use super::TaskContext;

/// Remote file name the CA certificate lands under
const CA_FILE_NAME: &str = "ca.crt";

/// DNS address handed to the join script when the cluster has no DNS service
/// yet; the script rewrites it once CoreDNS comes up
const FALLBACK_DNS_ADDRESS: &str = "127.0.0.1";

const READY_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// How many times an API-side label write retries a version conflict
const LABEL_UPDATE_ATTEMPTS: usize = 5;

/// Build the join workflow for the context's node/cluster pair
pub fn join_workflow() -> Workflow<TaskContext> {
    Workflow::new(
        "join",
        vec![
            Task::step("check-environment", true, check_environment),
            Task::step("reset-node", true, reset_node),
            Task::step("clean-stale-node-object", false, clean_stale_node_object),
            Task::step("upload-ca-cert", true, upload_ca_cert),
            Task::step("upload-kubeconfig", true, upload_kubeconfig),
            Task::step("upload-kubelet-config", true, upload_kubelet_config),
            Task::step("remote-join", true, remote_join),
            Task::step("wait-node-ready", false, wait_node_ready),
            Task::step("update-node-labels", false, update_node_labels),
            Task::step("mark-node-in-use", false, mark_node_in_use),
        ],
    )
}

async fn check_environment(ctx: Arc<TaskContext>, artifact: Artifact) -> TaskResult {
    ctx.run_on_node(&ctx.helper("check")).await?;
    Ok(artifact)
}

/// kubeadm-style reset so a previously joined host starts clean
async fn reset_node(ctx: Arc<TaskContext>, artifact: Artifact) -> TaskResult {
    ctx.run_on_node(&ctx.helper("unjoin")).await?;
    Ok(artifact)
}

/// Drop any node object left over from an earlier membership of the same host
async fn clean_stale_node_object(ctx: Arc<TaskContext>, artifact: Artifact) -> TaskResult {
    match ctx.cluster_api.delete_node(&ctx.node.name).await {
        Ok(()) => {
            debug!("removed stale node object '{}'", ctx.node.name);
            Ok(artifact)
        }
        Err(e) if e.is_not_found() => Ok(artifact),
        Err(e) => Err(TaskError(anyhow::Error::new(e))),
    }
}

async fn upload_ca_cert(ctx: Arc<TaskContext>, artifact: Artifact) -> TaskResult {
    let ca = ctx
        .certs
        .cluster_ca(&ctx.cluster.name)
        .await
        .map_err(|e| TaskError(anyhow::Error::new(e)))?;

    let op = Operation::upload(CA_FILE_NAME, &ctx.settings.agent_tmp_path, ca);
    ctx.run_on_node(&op).await?;
    Ok(artifact)
}

/// Ship the cluster's own kubeconfig so the kubelet can register against the
/// nested API server
async fn upload_kubeconfig(ctx: Arc<TaskContext>, artifact: Artifact) -> TaskResult {
    let raw = BASE64
        .decode(ctx.cluster.spec.kubeconfig.trim())
        .map_err(|e| TaskError::msg(format!("cluster kubeconfig is not base64: {}", e)))?;
    if raw.is_empty() {
        return Err(TaskError::msg(format!(
            "cluster '{}' has no embedded kubeconfig",
            ctx.cluster.name
        )));
    }

    let op = Operation::upload(
        &ctx.settings.kubelet_kubeconfig_name,
        &ctx.settings.agent_tmp_path,
        raw,
    );
    ctx.run_on_node(&op).await?;
    Ok(artifact)
}

async fn upload_kubelet_config(ctx: Arc<TaskContext>, artifact: Artifact) -> TaskResult {
    let data = tokio::fs::read(&ctx.settings.kubelet_config_path)
        .await
        .map_err(|e| {
            TaskError::msg(format!(
                "cannot read kubelet config {}: {}",
                ctx.settings.kubelet_config_path, e
            ))
        })?;

    let op = Operation::upload(
        &ctx.settings.kubelet_config_name,
        &ctx.settings.agent_tmp_path,
        data,
    );
    ctx.run_on_node(&op).await?;
    Ok(artifact)
}

async fn remote_join(ctx: Arc<TaskContext>, artifact: Artifact) -> TaskResult {
    let dns = match ctx.cluster_api.dns_service_address().await {
        Ok(Some(addr)) => addr,
        Ok(None) => FALLBACK_DNS_ADDRESS.to_string(),
        Err(e) => return Err(TaskError(anyhow::Error::new(e))),
    };

    info!(
        "joining node '{}' into '{}' (dns {})",
        ctx.node.name, ctx.cluster.name, dns
    );
    ctx.run_on_node(&ctx.helper("join").arg(dns)).await?;
    Ok(artifact)
}

/// Bounded poll for the kubelet to register and report Ready. "Not found" and
/// "not yet ready" are the same non-terminal answer. If the first window
/// expires, restart the container runtime and kubelet once and grant a
/// doubled second window before giving up.
async fn wait_node_ready(ctx: Arc<TaskContext>, artifact: Artifact) -> TaskResult {
    let window = Duration::from_secs(ctx.settings.node_ready_timeout_secs);

    if poll_ready(&ctx, window).await? {
        return Ok(artifact);
    }

    info!(
        "node '{}' not ready after {:?}, restarting runtime services",
        ctx.node.name, window
    );
    ctx.run_on_node(&Operation::command("systemctl").arg("restart").arg("containerd"))
        .await?;
    ctx.run_on_node(&Operation::command("systemctl").arg("restart").arg("kubelet"))
        .await?;

    if poll_ready(&ctx, window * 2).await? {
        return Ok(artifact);
    }

    Err(TaskError::msg(format!(
        "node '{}' did not become ready in time",
        ctx.node.name
    )))
}

async fn poll_ready(ctx: &TaskContext, window: Duration) -> Result<bool, TaskError> {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        if ctx.cancel.is_cancelled() {
            return Err(TaskError::msg("canceled while waiting for node ready"));
        }

        match ctx.cluster_api.get_node(&ctx.node.name).await {
            Ok(node) if node.ready => return Ok(true),
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(TaskError(anyhow::Error::new(e))),
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(READY_POLL_INTERVAL.min(deadline - now)).await;
    }
}

/// Stamp the cluster-declared labels, the node's own labels, and the pool
/// state label onto the registered node object
async fn update_node_labels(ctx: Arc<TaskContext>, artifact: Artifact) -> TaskResult {
    for _ in 0..LABEL_UPDATE_ATTEMPTS {
        let mut node = ctx
            .cluster_api
            .get_node(&ctx.node.name)
            .await
            .map_err(|e| TaskError(anyhow::Error::new(e)))?;

        for (k, v) in &ctx.cluster.spec.labels {
            node.labels.insert(k.clone(), v.clone());
        }
        for (k, v) in &ctx.node.spec.labels {
            node.labels.insert(k.clone(), v.clone());
        }
        node.labels.insert(
            ctx.settings.state_label_key.clone(),
            NodeState::InUse.label_value().to_string(),
        );

        match ctx.cluster_api.update_node(node).await {
            Ok(_) => return Ok(artifact),
            Err(e) if e.is_conflict() => continue,
            Err(e) => return Err(TaskError(anyhow::Error::new(e))),
        }
    }

    Err(TaskError::msg(format!(
        "label update for '{}' kept conflicting",
        ctx.node.name
    )))
}

async fn mark_node_in_use(ctx: Arc<TaskContext>, artifact: Artifact) -> TaskResult {
    ctx.mark_node(NodeState::InUse, Some(&ctx.cluster.name))
        .await?;
    Ok(artifact)
}
