//! Versioned object store with optimistic concurrency
//!
//! The host-side API is modeled as two independent collections (GlobalNodes,
//! VirtualClusters) related only by name lookup. Every write compares resource
//! versions; a stale write fails with `StoreError::Conflict` and callers
//! re-read and retry via `retry_on_conflict`, mirroring the usual
//! read-modify-write discipline against a Kubernetes API.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;

use super::cluster::VirtualCluster;
use super::node::GlobalNode;

/// Objects the store can hold
pub trait Resource: Clone + Send + Sync + 'static {
    fn name(&self) -> &str;
    fn resource_version(&self) -> u64;
    fn set_resource_version(&mut self, version: u64);
}

/// Errors surfaced by store operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("object '{0}' not found")]
    NotFound(String),

    #[error("object '{0}' already exists")]
    AlreadyExists(String),

    #[error("conflict writing '{0}': object changed since read")]
    Conflict(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// One named, versioned collection
pub struct Collection<T: Resource> {
    items: DashMap<String, T>,
    version_counter: AtomicU64,
}

impl<T: Resource> Default for Collection<T> {
    fn default() -> Self {
        Self {
            items: DashMap::new(),
            version_counter: AtomicU64::new(1),
        }
    }
}

impl<T: Resource> Collection<T> {
    fn next_version(&self) -> u64 {
        self.version_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Insert a new object, assigning its first resource version
    pub fn insert(&self, mut obj: T) -> Result<T, StoreError> {
        let name = obj.name().to_string();
        if self.items.contains_key(&name) {
            return Err(StoreError::AlreadyExists(name));
        }
        obj.set_resource_version(self.next_version());
        self.items.insert(name, obj.clone());
        Ok(obj)
    }

    /// Snapshot one object by name
    pub fn get(&self, name: &str) -> Option<T> {
        self.items.get(name).map(|r| r.clone())
    }

    /// Snapshot every object
    pub fn list(&self) -> Vec<T> {
        self.items.iter().map(|r| r.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Write back an object read earlier; fails on version mismatch
    pub fn update(&self, mut obj: T) -> Result<T, StoreError> {
        let name = obj.name().to_string();
        let mut entry = self
            .items
            .get_mut(&name)
            .ok_or_else(|| StoreError::NotFound(name.clone()))?;

        if entry.resource_version() != obj.resource_version() {
            return Err(StoreError::Conflict(name));
        }

        obj.set_resource_version(self.next_version());
        *entry = obj.clone();
        Ok(obj)
    }

    /// Remove an object; administrative only, the controllers never call this
    pub fn remove(&self, name: &str) -> Option<T> {
        self.items.remove(name).map(|(_, v)| v)
    }
}

/// The host-side API surface: two collections related by name lookup
#[derive(Default)]
pub struct Store {
    pub nodes: Collection<GlobalNode>,
    pub clusters: Collection<VirtualCluster>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }
}

const CONFLICT_RETRY_ATTEMPTS: usize = 5;
const CONFLICT_RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Re-run a read-modify-write closure while it fails with a version conflict
///
/// Any other error is returned immediately. The closure must re-read the
/// object on every invocation or it will conflict forever.
pub async fn retry_on_conflict<T, F, Fut>(mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut last = None;
    for attempt in 0..CONFLICT_RETRY_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_conflict() => {
                tracing::debug!("conflict retry {}: {}", attempt + 1, err);
                last = Some(err);
                tokio::time::sleep(CONFLICT_RETRY_BACKOFF).await;
            }
            Err(err) => return Err(err),
        }
    }
    Err(last.expect("at least one attempt ran"))
}
