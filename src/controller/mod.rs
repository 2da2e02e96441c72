//! Controllers: reconciliation, health sweeps, port allocation, events

pub mod events;
pub mod health;
pub mod node_controller;
pub mod ports;

pub use events::{Event, EventRecorder, EventType};
pub use health::NodeHealthMonitor;
pub use node_controller::{
    membership_diff, ClusterApiFactory, KubeconfigApiFactory, NodeController, ReconcileError,
};
pub use ports::{HostPortManager, PortError};
