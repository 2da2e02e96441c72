//! Heartbeat evaluation with flap-resistant hysteresis
//!
//! On every cycle each GlobalNode's most recent heartbeat is compared against
//! a staleness threshold. The transition rules are asymmetric: a node must be
//! observed stale for `required_not_ready` consecutive cycles before it is
//! marked NotReady, while a single fresh heartbeat flips it back to Ready at
//! once and zeroes its counter. Counters live only in this instance's memory;
//! a restart costs at most one extra full threshold run before a stale node
//! is flagged again.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{retry_on_conflict, GlobalNode, NodeConditionType, Store, StoreError};

/// Default sweep interval
pub const CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// Heartbeats older than this are stale
const HEARTBEAT_STALENESS: Duration = Duration::from_secs(10);

/// Consecutive stale cycles before committing NotReady
const REQUIRED_NOT_READY_CYCLES: u32 = 5;

/// Per-node evaluations in flight at once
const EVAL_WORKERS: usize = 8;

pub struct NodeHealthMonitor {
    store: Arc<Store>,
    staleness: chrono::Duration,
    required_not_ready: u32,
    /// Consecutive-stale counters keyed by node name
    counters: DashMap<String, u32>,
}

impl NodeHealthMonitor {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            staleness: chrono::Duration::from_std(HEARTBEAT_STALENESS)
                .unwrap_or_else(|_| chrono::Duration::seconds(10)),
            required_not_ready: REQUIRED_NOT_READY_CYCLES,
            counters: DashMap::new(),
        }
    }

    #[cfg(test)]
    fn with_threshold(store: Arc<Store>, required_not_ready: u32) -> Self {
        let mut monitor = Self::new(store);
        monitor.required_not_ready = required_not_ready;
        monitor
    }

    /// One full sweep over every node, evaluated at `now`
    pub async fn evaluate_all(&self, now: DateTime<Utc>) {
        let nodes = self.store.nodes.list();
        stream::iter(nodes)
            .for_each_concurrent(EVAL_WORKERS, |node| async move {
                if let Err(e) = self.evaluate(node, now).await {
                    warn!("health evaluation failed: {}", e);
                }
            })
            .await;
    }

    async fn evaluate(&self, node: GlobalNode, now: DateTime<Utc>) -> Result<(), StoreError> {
        // A node that has never reported a heartbeat has nothing to judge;
        // readiness is only derived from observed conditions.
        let Some(condition) = node.status.conditions.first() else {
            debug!("node '{}' has no conditions yet, skipping", node.name);
            return Ok(());
        };
        let current = condition.condition_type;
        let fresh = now - condition.last_heartbeat_time <= self.staleness;

        if fresh {
            self.counters.insert(node.name.clone(), 0);
            if current != NodeConditionType::Ready {
                info!("node '{}' heartbeat recovered, marking Ready", node.name);
                self.commit(&node.name, NodeConditionType::Ready, now).await?;
            }
            return Ok(());
        }

        let stale_cycles = {
            let mut counter = self.counters.entry(node.name.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        debug!(
            "node '{}' stale for {} consecutive cycle(s)",
            node.name, stale_cycles
        );

        if stale_cycles >= self.required_not_ready && current != NodeConditionType::NotReady {
            warn!(
                "node '{}' stale for {} cycles, marking NotReady",
                node.name, stale_cycles
            );
            self.commit(&node.name, NodeConditionType::NotReady, now).await?;
        }
        Ok(())
    }

    /// Commit a condition flip with the usual conflict retry
    async fn commit(
        &self,
        name: &str,
        condition: NodeConditionType,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let store = self.store.clone();
        let name = name.to_string();
        retry_on_conflict(move || {
            let store = store.clone();
            let name = name.clone();
            async move {
                let mut node = store
                    .nodes
                    .get(&name)
                    .ok_or(StoreError::NotFound(name))?;
                // The condition may have vanished between list and commit;
                // there is nothing to flip then.
                let Some(cond) = node.status.conditions.first_mut() else {
                    return Ok(());
                };
                cond.condition_type = condition;
                cond.last_transition_time = now;
                store.nodes.update(node).map(|_| ())
            }
        })
        .await
    }

    /// Periodic driver; returns on cancellation
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.evaluate_all(Utc::now()).await,
                _ = cancel.cancelled() => {
                    info!("health monitor stopping");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(store: &Store, heartbeat: DateTime<Utc>) {
        let mut node = GlobalNode::new("n1", "10.0.0.1");
        node.touch_heartbeat(heartbeat);
        store.nodes.insert(node).unwrap();
    }

    fn condition_of(store: &Store) -> NodeConditionType {
        store
            .nodes
            .get("n1")
            .unwrap()
            .status
            .conditions
            .first()
            .unwrap()
            .condition_type
    }

    #[tokio::test]
    async fn test_fresh_heartbeat_is_never_marked_not_ready() {
        let store = Arc::new(Store::new());
        let now = Utc::now();
        seeded(&store, now - chrono::Duration::seconds(2));

        let monitor = NodeHealthMonitor::with_threshold(store.clone(), 3);
        for _ in 0..10 {
            monitor.evaluate_all(now).await;
        }
        assert_eq!(condition_of(&store), NodeConditionType::Ready);
    }

    #[tokio::test]
    async fn test_below_threshold_retains_previous_status() {
        let store = Arc::new(Store::new());
        let now = Utc::now();
        seeded(&store, now - chrono::Duration::seconds(60));

        let monitor = NodeHealthMonitor::with_threshold(store.clone(), 3);
        monitor.evaluate_all(now).await;
        monitor.evaluate_all(now).await;

        // Two stale cycles of three: still Ready.
        assert_eq!(condition_of(&store), NodeConditionType::Ready);
    }

    #[tokio::test]
    async fn test_threshold_flips_status_exactly_once() {
        let store = Arc::new(Store::new());
        let now = Utc::now();
        seeded(&store, now - chrono::Duration::seconds(60));

        let monitor = NodeHealthMonitor::with_threshold(store.clone(), 3);
        for _ in 0..3 {
            monitor.evaluate_all(now).await;
        }
        assert_eq!(condition_of(&store), NodeConditionType::NotReady);

        let version_after_flip = store.nodes.get("n1").unwrap().resource_version;
        monitor.evaluate_all(now).await;
        monitor.evaluate_all(now).await;

        // Still NotReady, and no further writes happened.
        assert_eq!(condition_of(&store), NodeConditionType::NotReady);
        assert_eq!(
            store.nodes.get("n1").unwrap().resource_version,
            version_after_flip
        );
    }

    #[tokio::test]
    async fn test_fresh_heartbeat_recovers_immediately() {
        let store = Arc::new(Store::new());
        let now = Utc::now();
        seeded(&store, now - chrono::Duration::seconds(60));

        let monitor = NodeHealthMonitor::with_threshold(store.clone(), 3);
        for _ in 0..3 {
            monitor.evaluate_all(now).await;
        }
        assert_eq!(condition_of(&store), NodeConditionType::NotReady);

        // One fresh heartbeat: Ready on the very next cycle.
        let mut node = store.nodes.get("n1").unwrap();
        node.touch_heartbeat(now);
        store.nodes.update(node).unwrap();

        monitor.evaluate_all(now).await;
        assert_eq!(condition_of(&store), NodeConditionType::Ready);

        // And the counter restarted: two stale cycles don't flip it back.
        monitor.evaluate_all(now + chrono::Duration::seconds(60)).await;
        monitor.evaluate_all(now + chrono::Duration::seconds(60)).await;
        assert_eq!(condition_of(&store), NodeConditionType::Ready);
    }

    #[tokio::test]
    async fn test_node_without_conditions_is_left_alone() {
        let store = Arc::new(Store::new());
        let inserted = store.nodes.insert(GlobalNode::new("n1", "10.0.0.1")).unwrap();

        // A registered host that never heartbeat is not this subsystem's
        // verdict to make: no condition is fabricated, nothing is written.
        let monitor = NodeHealthMonitor::with_threshold(store.clone(), 1);
        for _ in 0..5 {
            monitor.evaluate_all(Utc::now()).await;
        }

        let node = store.nodes.get("n1").unwrap();
        assert!(node.status.conditions.is_empty());
        assert_eq!(node.resource_version, inserted.resource_version);
    }
}
