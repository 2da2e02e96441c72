//! Host-exposed port allocation per virtual cluster
//!
//! The pool document mirrors the ConfigMap the operator ships: a candidate
//! port list plus allocation records. Allocate scans for the first port with
//! no record; Release drops the first record matching the cluster name. Both
//! run under one process-wide lock. Mutations are NOT written back to the
//! backing store, so allocations are lost on restart; callers must treat
//! them as advisory.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::AgentClient;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("port pool exhausted ({0} candidates, all allocated)")]
    Exhausted(usize),

    #[error("no free candidate port verified reachable on host")]
    NoneVerified,
}

/// One allocation record: port → owning cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterPort {
    pub port: u16,
    pub cluster: String,
}

/// Pool document as stored in the operator's ConfigMap
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PortsPool {
    #[serde(rename = "portsPool", default)]
    pub ports_pool: Vec<u16>,

    #[serde(rename = "clusterPorts", default)]
    pub cluster_ports: Vec<ClusterPort>,
}

/// Process-wide port allocator; owned by the controller instance, not a
/// global
pub struct HostPortManager {
    pool: Mutex<PortsPool>,
}

impl HostPortManager {
    pub fn new(candidates: Vec<u16>) -> Self {
        Self {
            pool: Mutex::new(PortsPool {
                ports_pool: candidates,
                cluster_ports: Vec::new(),
            }),
        }
    }

    /// Load from the pool document's YAML form
    pub fn from_yaml(doc: &str) -> Result<Self, serde_yaml::Error> {
        let pool: PortsPool = serde_yaml::from_str(doc)?;
        Ok(Self {
            pool: Mutex::new(pool),
        })
    }

    /// First candidate port with no allocation record, claimed for `cluster`
    pub fn allocate(&self, cluster: &str) -> Result<u16, PortError> {
        let mut pool = self.pool.lock().expect("port pool lock");
        let candidates = pool.ports_pool.len();

        let free = pool
            .ports_pool
            .iter()
            .copied()
            .find(|p| !pool.cluster_ports.iter().any(|cp| cp.port == *p));

        match free {
            Some(port) => {
                pool.cluster_ports.push(ClusterPort {
                    port,
                    cluster: cluster.to_string(),
                });
                debug!("allocated host port {} to '{}'", port, cluster);
                Ok(port)
            }
            None => Err(PortError::Exhausted(candidates)),
        }
    }

    /// Drop the first record held by `cluster`; returns the released port
    pub fn release(&self, cluster: &str) -> Option<u16> {
        let mut pool = self.pool.lock().expect("port pool lock");
        let idx = pool.cluster_ports.iter().position(|cp| cp.cluster == cluster)?;
        let record = pool.cluster_ports.remove(idx);
        debug!("released host port {} from '{}'", record.port, cluster);
        Some(record.port)
    }

    /// Snapshot of current allocation records
    pub fn allocations(&self) -> Vec<ClusterPort> {
        self.pool.lock().expect("port pool lock").cluster_ports.clone()
    }

    /// Port already held by `cluster`, if any
    pub fn allocation_for(&self, cluster: &str) -> Option<u16> {
        self.pool
            .lock()
            .expect("port pool lock")
            .cluster_ports
            .iter()
            .find(|cp| cp.cluster == cluster)
            .map(|cp| cp.port)
    }

    /// Allocate a port that the host's agent also reports free. Candidates
    /// that fail the remote probe are skipped, not claimed.
    pub async fn allocate_verified(
        &self,
        cluster: &str,
        agent: &AgentClient,
        host: &str,
        cancel: &CancellationToken,
    ) -> Result<u16, PortError> {
        let candidates: Vec<u16> = {
            let pool = self.pool.lock().expect("port pool lock");
            pool.ports_pool
                .iter()
                .copied()
                .filter(|p| !pool.cluster_ports.iter().any(|cp| cp.port == *p))
                .collect()
        };
        if candidates.is_empty() {
            let total = self.pool.lock().expect("port pool lock").ports_pool.len();
            return Err(PortError::Exhausted(total));
        }

        for port in candidates {
            if !agent.check_port_free(host, port, cancel).await {
                warn!("candidate port {} busy on {}, skipping", port, host);
                continue;
            }

            // Re-check under the lock; another reconcile may have claimed it
            // while the probe was in flight.
            let mut pool = self.pool.lock().expect("port pool lock");
            if pool.cluster_ports.iter().any(|cp| cp.port == port) {
                continue;
            }
            pool.cluster_ports.push(ClusterPort {
                port,
                cluster: cluster.to_string(),
            });
            debug!("allocated verified host port {} to '{}'", port, cluster);
            return Ok(port);
        }

        Err(PortError::NoneVerified)
    }
}
