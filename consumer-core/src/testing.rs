//! Test doubles shared by this crate's own unit tests and by downstream crates exercising
//! the core against a fake driver instead of a live broker. Gated behind `test-util` so it
//! never ships in a production binary.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use rdkafka::error::{KafkaError, RDKafkaErrorCode};

use crate::driver::{DriverRecord, KafkaDriver, MessageRef, SeekOffset, Tpl};
use crate::rebalance::RebalanceSnapshot;

enum Event {
    Record(DriverRecord),
    Error(KafkaError),
}

/// Cheap shared read handle onto a counter, so a test can assert on it after the `Arc<D>`
/// it came from has been moved into a `Client`.
#[derive(Clone)]
pub struct CounterHandle(Arc<AtomicU32>);

impl CounterHandle {
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Shared handle onto the two bits of [`FakeDriver`] state a test needs to mutate after the
/// driver has already been moved into a `Client` (same idea as [`CounterHandle`], just
/// covering the queued records and the rebalance snapshot instead of a single counter).
#[derive(Clone, Default)]
pub struct FakeDriverHandle {
    events: Arc<Mutex<VecDeque<Event>>>,
    rebalance: Arc<Mutex<RebalanceSnapshot>>,
}

impl FakeDriverHandle {
    pub fn enqueue_record(&self, topic: &str, partition: i32, offset: i64) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(Event::Record(DriverRecord {
                topic: topic.to_string(),
                partition,
                offset,
                key: None,
                payload: Some(format!("payload-{offset}").into_bytes()),
                headers: Vec::new(),
                timestamp_ms: None,
            }));
    }

    /// Simulate a revocation, mirroring what `RebalanceManager::on_partitions_revoked`
    /// would publish.
    pub fn trigger_revoke(&self, topic: &str, partitions: &[i32]) {
        let mut snapshot = self.rebalance.lock().unwrap_or_else(|p| p.into_inner());
        snapshot
            .revoked
            .entry(topic.to_string())
            .or_default()
            .extend(partitions);
        snapshot.changed = true;
        snapshot.active = true;
    }
}

/// An in-memory [`KafkaDriver`]: records are queued up front with `enqueue_record`/
/// `enqueue_error` and handed back in order by `poll`, one at a time. Everything else
/// (pause/resume/seek/commit) just records the call and succeeds, unless a specific test
/// has configured otherwise.
#[derive(Default)]
pub struct FakeDriver {
    events: Arc<Mutex<VecDeque<Event>>>,
    assignment: Mutex<Tpl>,
    assignment_lost: AtomicBool,
    rebalance: Arc<Mutex<RebalanceSnapshot>>,
    close_count: Arc<AtomicU32>,
    pause_calls: Mutex<Vec<(String, i32)>>,
    resume_calls: Mutex<Vec<(String, i32)>>,
    seek_calls: Mutex<Vec<(MessageRef, i64)>>,
    store_offset_calls: Mutex<Vec<MessageRef>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_record(&self, topic: &str, partition: i32, offset: i64) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(Event::Record(DriverRecord {
                topic: topic.to_string(),
                partition,
                offset,
                key: None,
                payload: Some(format!("payload-{offset}").into_bytes()),
                headers: Vec::new(),
                timestamp_ms: None,
            }));
    }

    pub fn enqueue_record_with(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        key: Option<Vec<u8>>,
        timestamp_ms: Option<i64>,
    ) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(Event::Record(DriverRecord {
                topic: topic.to_string(),
                partition,
                offset,
                key,
                payload: Some(format!("payload-{offset}").into_bytes()),
                headers: Vec::new(),
                timestamp_ms,
            }));
    }

    /// Queue a `poll` failure classifiable via [`crate::driver::classify_kafka_error`].
    pub fn enqueue_error(&self, code: RDKafkaErrorCode) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(Event::Error(KafkaError::MessageConsumption(code)));
    }

    pub fn close_count_handle(&self) -> CounterHandle {
        CounterHandle(self.close_count.clone())
    }

    /// A handle sharing this driver's queued records and rebalance snapshot, so a test can
    /// keep driving it (e.g. `enqueue_record`/`trigger_revoke` across poll cycles) after the
    /// `FakeDriver` itself has been moved into a `Client`.
    pub fn driver_handle(&self) -> FakeDriverHandle {
        FakeDriverHandle {
            events: self.events.clone(),
            rebalance: self.rebalance.clone(),
        }
    }

    pub fn set_assignment_lost(&self, lost: bool) {
        self.assignment_lost.store(lost, Ordering::SeqCst);
    }

    pub fn set_assignment(&self, tpl: Tpl) {
        *self.assignment.lock().unwrap_or_else(|p| p.into_inner()) = tpl;
    }

    pub fn set_rebalance_snapshot(&self, snapshot: RebalanceSnapshot) {
        *self.rebalance.lock().unwrap_or_else(|p| p.into_inner()) = snapshot;
    }

    /// Simulate a revocation: marks the snapshot changed with the given partitions revoked,
    /// mirroring what `RebalanceManager::on_partitions_revoked` would publish.
    pub fn trigger_revoke(&self, topic: &str, partitions: &[i32]) {
        let mut snapshot = self.rebalance.lock().unwrap_or_else(|p| p.into_inner());
        snapshot
            .revoked
            .entry(topic.to_string())
            .or_default()
            .extend(partitions);
        snapshot.changed = true;
        snapshot.active = true;
    }

    pub fn pause_calls(&self) -> Vec<(String, i32)> {
        self.pause_calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn resume_calls(&self) -> Vec<(String, i32)> {
        self.resume_calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn seek_calls(&self) -> Vec<(MessageRef, i64)> {
        self.seek_calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn store_offset_calls(&self) -> Vec<MessageRef> {
        self.store_offset_calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl KafkaDriver for FakeDriver {
    fn subscribe(&self, _topics: &[String]) -> Result<(), KafkaError> {
        Ok(())
    }

    fn poll(&self, _timeout: std::time::Duration) -> Result<Option<DriverRecord>, KafkaError> {
        match self.events.lock().unwrap_or_else(|p| p.into_inner()).pop_front() {
            Some(Event::Record(r)) => Ok(Some(r)),
            Some(Event::Error(e)) => Err(e),
            None => Ok(None),
        }
    }

    fn pause(&self, tpl: &Tpl) -> Result<(), KafkaError> {
        let mut calls = self.pause_calls.lock().unwrap_or_else(|p| p.into_inner());
        calls.extend(tpl.0.iter().cloned());
        Ok(())
    }

    fn resume(&self, tpl: &Tpl) -> Result<(), KafkaError> {
        let mut calls = self.resume_calls.lock().unwrap_or_else(|p| p.into_inner());
        calls.extend(tpl.0.iter().cloned());
        Ok(())
    }

    fn seek(&self, msg: &MessageRef, offset: SeekOffset) -> Result<(), KafkaError> {
        let resolved = match offset {
            SeekOffset::Exact(o) => o,
            SeekOffset::Latest => -1,
            SeekOffset::Timestamp(_) => {
                unreachable!("timestamp offsets are resolved before calling seek")
            }
        };
        self.seek_calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((msg.clone(), resolved));
        Ok(())
    }

    fn store_offset(&self, msg: &MessageRef) -> Result<(), KafkaError> {
        self.store_offset_calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(msg.clone());
        Ok(())
    }

    fn commit(&self, _tpl: Option<&Tpl>, _async: bool) -> Result<(), KafkaError> {
        Ok(())
    }

    fn assignment(&self) -> Tpl {
        self.assignment.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn assignment_lost(&self) -> bool {
        self.assignment_lost.load(Ordering::SeqCst)
    }

    fn offsets_for_times(
        &self,
        tpl: &[(String, i32, i64)],
        _timeout: std::time::Duration,
    ) -> Result<Vec<(String, i32, Option<i64>)>, KafkaError> {
        Ok(tpl
            .iter()
            .map(|(topic, partition, _)| (topic.clone(), *partition, Some(0)))
            .collect())
    }

    fn unsubscribe(&self) {}

    fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        "fake"
    }

    fn rebalance_snapshot(&self) -> RebalanceSnapshot {
        self.rebalance.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn clear_rebalance_changed(&self) {
        self.rebalance.lock().unwrap_or_else(|p| p.into_inner()).changed = false;
    }

    fn clear_rebalance_revocations(&self) {
        let mut snapshot = self.rebalance.lock().unwrap_or_else(|p| p.into_inner());
        snapshot.revoked.clear();
        snapshot.lost.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_returns_records_in_enqueued_order_then_none() {
        let driver = FakeDriver::new();
        driver.enqueue_record("t", 0, 1);
        driver.enqueue_record("t", 0, 2);
        let first = driver.poll(std::time::Duration::from_millis(0)).unwrap();
        assert_eq!(first.unwrap().offset, 1);
        let second = driver.poll(std::time::Duration::from_millis(0)).unwrap();
        assert_eq!(second.unwrap().offset, 2);
        assert!(driver.poll(std::time::Duration::from_millis(0)).unwrap().is_none());
    }

    #[test]
    fn enqueued_error_surfaces_from_poll() {
        let driver = FakeDriver::new();
        driver.enqueue_error(RDKafkaErrorCode::NetworkException);
        let err = driver.poll(std::time::Duration::from_millis(0)).unwrap_err();
        assert_eq!(err.rdkafka_error_code(), Some(RDKafkaErrorCode::NetworkException));
    }

    #[test]
    fn pause_and_resume_record_calls() {
        let driver = FakeDriver::new();
        let mut tpl = Tpl::new();
        tpl.push("t", 0);
        driver.pause(&tpl).unwrap();
        assert_eq!(driver.pause_calls(), vec![("t".to_string(), 0)]);
        driver.resume(&tpl).unwrap();
        assert_eq!(driver.resume_calls(), vec![("t".to_string(), 0)]);
    }

    #[test]
    fn trigger_revoke_marks_snapshot_changed() {
        let driver = FakeDriver::new();
        driver.trigger_revoke("t", &[0, 1]);
        let snap = driver.rebalance_snapshot();
        assert!(snap.changed);
        assert!(snap.is_revoked("t", 0));
        assert!(snap.is_revoked("t", 1));
    }

    #[test]
    fn clear_rebalance_changed_does_not_drop_revoked_partitions() {
        let driver = FakeDriver::new();
        driver.trigger_revoke("t", &[0]);
        driver.clear_rebalance_changed();
        let snap = driver.rebalance_snapshot();
        assert!(!snap.changed);
        assert!(snap.is_revoked("t", 0), "revoked set must survive until explicitly cleared");
        driver.clear_rebalance_revocations();
        assert!(!driver.rebalance_snapshot().is_revoked("t", 0));
    }
}
