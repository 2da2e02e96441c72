//! Data model and API seams
//!
//! GlobalNodes and VirtualClusters live in a versioned in-memory store with
//! optimistic concurrency; each virtual cluster's own API is reached through
//! the `ClusterApi` trait, either in memory or over REST via the kubeconfig
//! embedded in the VirtualCluster object.

pub mod certs;
pub mod cluster;
pub mod kubeconfig;
pub mod node;
pub mod rest;
pub mod store;
pub mod virtual_api;

pub use cluster::{NodeAssignment, Phase, VirtualCluster};
pub use kubeconfig::Kubeconfig;
pub use node::{GlobalNode, NodeCondition, NodeConditionType, NodeState};
pub use store::{retry_on_conflict, Store, StoreError};
pub use virtual_api::{ApiError, ClusterApi, MemoryClusterApi, WorkerNode};
