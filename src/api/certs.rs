//! Certificate source for virtual-cluster CA material
//!
//! Certificate generation happens elsewhere; the join pipeline only needs the
//! CA bytes for a named cluster so it can ship them to the joining host.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("no certificate stored for cluster '{0}'")]
    NotFound(String),
}

/// Opaque cert/key material by cluster name
#[async_trait]
pub trait CertStore: Send + Sync {
    /// CA certificate bytes for the named cluster
    async fn cluster_ca(&self, cluster: &str) -> Result<Vec<u8>, CertError>;
}

/// In-memory cert store, fed at startup or by tests
#[derive(Default)]
pub struct MemoryCertStore {
    certs: DashMap<String, Vec<u8>>,
}

impl MemoryCertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_cluster_ca(&self, cluster: impl Into<String>, ca: Vec<u8>) {
        self.certs.insert(cluster.into(), ca);
    }
}

#[async_trait]
impl CertStore for MemoryCertStore {
    async fn cluster_ca(&self, cluster: &str) -> Result<Vec<u8>, CertError> {
        self.certs
            .get(cluster)
            .map(|r| r.clone())
            .ok_or_else(|| CertError::NotFound(cluster.to_string()))
    }
}
