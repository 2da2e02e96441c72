//! GlobalNode resource - one host in the cluster-wide pool
//!
//! A GlobalNode records a physical or virtual host that can be bound into a
//! virtual cluster. It is created when the host is registered into the pool,
//! mutated by the join/unjoin pipelines and the health monitor, and never
//! deleted by this subsystem.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::store::Resource;

/// Pool state of a GlobalNode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Available for allocation to any virtual cluster
    #[default]
    Free,
    /// Shared between clusters (reserved, not driven by this subsystem)
    Shared,
    /// Claimed by the virtual cluster named in `status.virtual_cluster`
    InUse,
}

impl NodeState {
    /// Label value written onto joined/unjoined nodes
    pub fn label_value(&self) -> &'static str {
        match self {
            NodeState::Free => "free",
            NodeState::Shared => "shared",
            NodeState::InUse => "in_use",
        }
    }
}

/// Condition type reported on a GlobalNode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeConditionType {
    Ready,
    NotReady,
}

/// A single observed condition with heartbeat bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: NodeConditionType,

    /// Last heartbeat received from the host's agent
    #[serde(rename = "lastHeartbeatTime")]
    pub last_heartbeat_time: DateTime<Utc>,

    /// When the condition type last flipped
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl NodeCondition {
    /// A fresh Ready condition stamped now
    pub fn ready_now() -> Self {
        let now = Utc::now();
        Self {
            condition_type: NodeConditionType::Ready,
            last_heartbeat_time: now,
            last_transition_time: now,
        }
    }
}

/// GlobalNode specification
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GlobalNodeSpec {
    /// Address the host's helper agent is reachable at
    #[serde(rename = "nodeIP")]
    pub node_ip: String,

    /// Pool state
    #[serde(default)]
    pub state: NodeState,

    /// Labels applied to the node object when it joins a cluster
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// GlobalNode status
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GlobalNodeStatus {
    /// Name of the virtual cluster currently claiming this host, if any
    #[serde(rename = "virtualCluster", default)]
    pub virtual_cluster: String,

    /// Observed conditions; the first entry is the authoritative one
    #[serde(default)]
    pub conditions: Vec<NodeCondition>,
}

/// A host in the cluster-wide pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalNode {
    /// Unique host name
    pub name: String,

    /// Store bookkeeping for optimistic concurrency
    #[serde(rename = "resourceVersion", default)]
    pub resource_version: u64,

    pub spec: GlobalNodeSpec,

    #[serde(default)]
    pub status: GlobalNodeStatus,
}

impl GlobalNode {
    /// Register a new free host
    pub fn new(name: impl Into<String>, node_ip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_version: 0,
            spec: GlobalNodeSpec {
                node_ip: node_ip.into(),
                state: NodeState::Free,
                labels: HashMap::new(),
            },
            status: GlobalNodeStatus::default(),
        }
    }

    /// Attach labels the join pipeline should apply
    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.spec.labels = labels;
        self
    }

    /// Record a heartbeat observation on the authoritative condition
    pub fn touch_heartbeat(&mut self, at: DateTime<Utc>) {
        match self.status.conditions.first_mut() {
            Some(cond) => cond.last_heartbeat_time = at,
            None => {
                let mut cond = NodeCondition::ready_now();
                cond.last_heartbeat_time = at;
                self.status.conditions.push(cond);
            }
        }
    }
}

impl Resource for GlobalNode {
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
