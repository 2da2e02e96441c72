//! The virtual cluster's own API, seen through a narrow seam
//!
//! Pipelines and the node controller only ever need a handful of operations
//! against a virtual cluster's API server: list/get/delete worker nodes,
//! relabel one, and resolve the cluster DNS address. `ClusterApi` captures
//! exactly that. Production traffic goes through the REST implementation in
//! `rest.rs`; tests and local simulation use `MemoryClusterApi`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from a virtual cluster API
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("node '{0}' not found")]
    NotFound(String),

    #[error("conflict updating '{0}': object changed since read")]
    Conflict(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("unexpected response ({status}): {body}")]
    Status { status: u16, body: String },
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Conflict(_))
    }
}

/// A worker node object as the virtual cluster reports it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerNode {
    pub name: String,

    #[serde(rename = "resourceVersion", default)]
    pub resource_version: u64,

    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// Collapsed from the node's Ready condition
    #[serde(default)]
    pub ready: bool,
}

impl WorkerNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_version: 0,
            labels: HashMap::new(),
            ready: false,
        }
    }

    pub fn ready(mut self) -> Self {
        self.ready = true;
        self
    }
}

/// Operations against one virtual cluster's API server
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<WorkerNode>, ApiError>;

    async fn get_node(&self, name: &str) -> Result<WorkerNode, ApiError>;

    async fn delete_node(&self, name: &str) -> Result<(), ApiError>;

    /// Write back a node read earlier; conflicts on version mismatch
    async fn update_node(&self, node: WorkerNode) -> Result<WorkerNode, ApiError>;

    /// Cluster IP of the DNS service, when it exists
    async fn dns_service_address(&self) -> Result<Option<String>, ApiError>;
}

/// In-memory `ClusterApi` used by tests and local simulation
#[derive(Default)]
pub struct MemoryClusterApi {
    nodes: DashMap<String, WorkerNode>,
    version_counter: AtomicU64,
    dns_address: RwLock<Option<String>>,
}

impl MemoryClusterApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> u64 {
        self.version_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Seed or replace a node, as the kubelet registering would
    pub fn put_node(&self, mut node: WorkerNode) {
        node.resource_version = self.next_version();
        self.nodes.insert(node.name.clone(), node);
    }

    pub fn set_dns_address(&self, addr: impl Into<String>) {
        *self.dns_address.write().expect("dns lock") = Some(addr.into());
    }
}

#[async_trait]
impl ClusterApi for MemoryClusterApi {
    async fn list_nodes(&self) -> Result<Vec<WorkerNode>, ApiError> {
        Ok(self.nodes.iter().map(|r| r.clone()).collect())
    }

    async fn get_node(&self, name: &str) -> Result<WorkerNode, ApiError> {
        self.nodes
            .get(name)
            .map(|r| r.clone())
            .ok_or_else(|| ApiError::NotFound(name.to_string()))
    }

    async fn delete_node(&self, name: &str) -> Result<(), ApiError> {
        self.nodes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ApiError::NotFound(name.to_string()))
    }

    async fn update_node(&self, mut node: WorkerNode) -> Result<WorkerNode, ApiError> {
        let mut entry = self
            .nodes
            .get_mut(&node.name)
            .ok_or_else(|| ApiError::NotFound(node.name.clone()))?;

        if entry.resource_version != node.resource_version {
            return Err(ApiError::Conflict(node.name.clone()));
        }

        node.resource_version = self.next_version();
        *entry = node.clone();
        Ok(node)
    }

    async fn dns_service_address(&self) -> Result<Option<String>, ApiError> {
        Ok(self.dns_address.read().expect("dns lock").clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_api_round_trip() {
        let api = MemoryClusterApi::new();
        api.put_node(WorkerNode::new("n1").ready());

        let listed = api.list_nodes().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].ready);

        api.delete_node("n1").await.unwrap();
        assert!(api.get_node("n1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_memory_api_update_conflicts() {
        let api = MemoryClusterApi::new();
        api.put_node(WorkerNode::new("n1"));

        let first = api.get_node("n1").await.unwrap();
        let second = api.get_node("n1").await.unwrap();

        api.update_node(first).await.unwrap();
        assert!(api.update_node(second).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_dns_address_defaults_to_none() {
        let api = MemoryClusterApi::new();
        assert_eq!(api.dns_service_address().await.unwrap(), None);

        api.set_dns_address("10.96.0.10");
        assert_eq!(
            api.dns_service_address().await.unwrap().as_deref(),
            Some("10.96.0.10")
        );
    }
}
