//! Rebalance state, published by the driver's internal poll thread and read by the
//! listener thread. The driver thread never calls back into user code directly: it only
//! writes into a shared, mutex-guarded [`RebalanceState`] via [`RebalanceContext`], an
//! `rdkafka::ConsumerContext` implementation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use rdkafka::consumer::{ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::{ClientContext, TopicPartitionList};
use tracing::info;

/// A snapshot of partitions grouped by topic.
pub type TopicPartitions = BTreeMap<String, BTreeSet<i32>>;

/// A point-in-time read of [`RebalanceManager`]'s state, cheap to clone and safe to hold
/// across a `batch_poll` iteration without re-locking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceSnapshot {
    pub assigned: TopicPartitions,
    pub revoked: TopicPartitions,
    pub lost: TopicPartitions,
    pub changed: bool,
    pub active: bool,
}

impl RebalanceSnapshot {
    /// Union of revoked and lost partitions (§4.2: `revoked_partitions` in the design).
    pub fn revoked_partitions(&self) -> TopicPartitions {
        let mut out = self.revoked.clone();
        for (topic, partitions) in &self.lost {
            out.entry(topic.clone()).or_default().extend(partitions);
        }
        out
    }

    pub fn lost_partitions(&self) -> &TopicPartitions {
        &self.lost
    }

    pub fn is_revoked(&self, topic: &str, partition: i32) -> bool {
        self.revoked_partitions()
            .get(topic)
            .is_some_and(|ps| ps.contains(&partition))
    }
}

#[derive(Debug, Default)]
struct RebalanceState {
    assigned: TopicPartitions,
    revoked: TopicPartitions,
    lost: TopicPartitions,
    changed: bool,
    active: bool,
}

/// Receives the three driver rebalance callbacks and records assigned/revoked/lost
/// partitions, exposing change/active flags. Invoked only from the driver's internal
/// thread; all mutation happens behind one mutex.
#[derive(Clone, Default)]
pub struct RebalanceManager {
    state: Arc<Mutex<RebalanceState>>,
}

impl RebalanceManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RebalanceState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn on_partitions_assigned(&self, tpl: &TopicPartitionList) {
        let mut state = self.lock();
        for elem in tpl.elements() {
            state
                .assigned
                .entry(elem.topic().to_string())
                .or_default()
                .insert(elem.partition());
        }
        state.changed = true;
        state.active = true;
    }

    pub fn on_partitions_revoked(&self, tpl: &TopicPartitionList) {
        let mut state = self.lock();
        for elem in tpl.elements() {
            let topic = elem.topic().to_string();
            state.assigned.entry(topic.clone()).or_default().remove(&elem.partition());
            state.revoked.entry(topic).or_default().insert(elem.partition());
        }
        state.changed = true;
        state.active = true;
    }

    pub fn on_partitions_lost(&self, tpl: &TopicPartitionList) {
        let mut state = self.lock();
        for elem in tpl.elements() {
            let topic = elem.topic().to_string();
            state.assigned.entry(topic.clone()).or_default().remove(&elem.partition());
            state.lost.entry(topic.clone()).or_default().insert(elem.partition());
            state.revoked.entry(topic).or_default().insert(elem.partition());
        }
        state.changed = true;
        state.active = true;
    }

    /// Reset only the `changed` flag, so the next poll cycle can detect a fresh rebalance.
    /// Revoked/lost partitions are left alone: they still need to reach the listener as
    /// revocation jobs before anything forgets them.
    pub fn clear_changed(&self) {
        self.lock().changed = false;
    }

    /// Drop the accumulated revoked/lost partitions. Call only after the listener has
    /// turned them into revocation jobs; assigned set is left untouched.
    pub fn clear_revocations(&self) {
        let mut state = self.lock();
        state.revoked.clear();
        state.lost.clear();
    }

    pub fn active(&self) -> bool {
        self.lock().active
    }

    pub fn snapshot(&self) -> RebalanceSnapshot {
        let state = self.lock();
        RebalanceSnapshot {
            assigned: state.assigned.clone(),
            revoked: state.revoked.clone(),
            lost: state.lost.clone(),
            changed: state.changed,
            active: state.active,
        }
    }
}

/// `rdkafka::ConsumerContext` implementation bridging driver-thread rebalance callbacks
/// into a [`RebalanceManager`]. Deliberately does no work beyond publishing state: no
/// locking beyond the manager's own mutex, no calls back into application code.
#[derive(Clone, Default)]
pub struct RebalanceContext {
    manager: RebalanceManager,
}

impl RebalanceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn manager(&self) -> &RebalanceManager {
        &self.manager
    }
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn post_rebalance(&self, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                info!(partitions = tpl.count(), "rebalance: partitions assigned");
                self.manager.on_partitions_assigned(tpl);
            }
            Rebalance::Revoke(tpl) => {
                info!(partitions = tpl.count(), "rebalance: partitions revoked");
                self.manager.on_partitions_revoked(tpl);
            }
            Rebalance::Error(e) => {
                info!(error = %e, "rebalance: error reported by driver");
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        if let Err(e) = result {
            info!(error = %e, "commit callback reported an error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tpl(pairs: &[(&str, i32)]) -> TopicPartitionList {
        let mut list = TopicPartitionList::new();
        for (t, p) in pairs {
            list.add_partition(t, *p);
        }
        list
    }

    #[test]
    fn lost_is_subset_of_revoked() {
        let mgr = RebalanceManager::new();
        mgr.on_partitions_lost(&tpl(&[("t", 1)]));
        let snap = mgr.snapshot();
        assert!(snap.lost_partitions()["t"].contains(&1));
        assert!(snap.revoked_partitions()["t"].contains(&1));
    }

    #[test]
    fn clear_changed_resets_flag_but_not_active() {
        let mgr = RebalanceManager::new();
        mgr.on_partitions_assigned(&tpl(&[("t", 0)]));
        assert!(mgr.snapshot().changed);
        assert!(mgr.active());
        mgr.clear_changed();
        let snap = mgr.snapshot();
        assert!(!snap.changed);
        assert!(snap.active);
    }

    #[test]
    fn clear_revocations_drops_revoked_and_lost_but_not_changed() {
        let mgr = RebalanceManager::new();
        mgr.on_partitions_revoked(&tpl(&[("t", 1)]));
        assert!(mgr.snapshot().changed);
        mgr.clear_revocations();
        let snap = mgr.snapshot();
        assert!(snap.revoked.is_empty());
        assert!(snap.lost.is_empty());
        assert!(snap.changed);
    }

    #[test]
    fn revoked_then_assigned_elsewhere_is_not_duplicated_in_assigned() {
        let mgr = RebalanceManager::new();
        mgr.on_partitions_assigned(&tpl(&[("t", 1)]));
        mgr.on_partitions_revoked(&tpl(&[("t", 1)]));
        let snap = mgr.snapshot();
        assert!(!snap.assigned.get("t").is_some_and(|s| s.contains(&1)));
    }
}
