//! VirtualCluster resource - a nested control plane plus its declared membership
//!
//! The spec names the hosts that should serve as workers; the status phase is a
//! coarse progress signal advanced by the node controller around each
//! join/unjoin batch, never rolled back mid-batch.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::store::Resource;

/// Lifecycle phase of a VirtualCluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Phase {
    /// Created, control plane not yet provisioned
    #[default]
    Pending,
    /// Control plane being provisioned
    Preparing,
    /// Control plane up, no node batch run yet
    Initialized,
    /// A join/unjoin batch is in flight
    Updating,
    /// The last batch drained and all members are ready
    AllNodeReady,
    /// Fully provisioned
    Completed,
    /// Teardown requested; membership drains to empty
    Deleting,
    /// Teardown drained every member
    AllNodeDeleted,
}

/// Desired membership entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAssignment {
    /// GlobalNode name
    #[serde(rename = "nodeName")]
    pub node_name: String,
}

/// VirtualCluster specification
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VirtualClusterSpec {
    /// Declared worker membership, in operator-supplied order
    #[serde(rename = "nodeInfos", default)]
    pub node_infos: Vec<NodeAssignment>,

    /// Labels every member should carry inside the virtual cluster
    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// Base64-encoded kubeconfig reaching this cluster's own API
    #[serde(default)]
    pub kubeconfig: String,
}

/// VirtualCluster status
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VirtualClusterStatus {
    #[serde(default)]
    pub phase: Phase,

    /// Human-readable reason for the current phase
    #[serde(default)]
    pub reason: String,

    /// When the status last changed
    #[serde(rename = "updateTime", skip_serializing_if = "Option::is_none")]
    pub update_time: Option<DateTime<Utc>>,
}

/// A nested control plane and its declared worker membership
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualCluster {
    pub name: String,

    #[serde(rename = "resourceVersion", default)]
    pub resource_version: u64,

    pub spec: VirtualClusterSpec,

    #[serde(default)]
    pub status: VirtualClusterStatus,
}

impl VirtualCluster {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_version: 0,
            spec: VirtualClusterSpec::default(),
            status: VirtualClusterStatus::default(),
        }
    }

    /// Declare the desired member set
    pub fn with_nodes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.node_infos = names
            .into_iter()
            .map(|n| NodeAssignment { node_name: n.into() })
            .collect();
        self
    }

    /// Embed the base64 kubeconfig for this cluster's own API
    pub fn with_kubeconfig(mut self, encoded: impl Into<String>) -> Self {
        self.spec.kubeconfig = encoded.into();
        self
    }

    /// Names the operator wants as members; empty while tearing down
    pub fn desired_node_names(&self) -> Vec<String> {
        if self.is_deleting() {
            return Vec::new();
        }
        self.spec
            .node_infos
            .iter()
            .map(|n| n.node_name.clone())
            .collect()
    }

    pub fn is_deleting(&self) -> bool {
        matches!(
            self.status.phase,
            Phase::Deleting | Phase::AllNodeDeleted
        )
    }
}

impl Resource for VirtualCluster {
    fn name(&self) -> &str {
        &self.name
    }

    fn resource_version(&self) -> u64 {
        self.resource_version
    }

    fn set_resource_version(&mut self, version: u64) {
        self.resource_version = version;
    }
}
