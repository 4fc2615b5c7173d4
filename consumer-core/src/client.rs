//! Thread-safe façade over a [`KafkaDriver`], enforcing invariants the driver cannot
//! self-enforce: no use after close, serialized pause/resume/seek, retry-with-backoff on
//! transient errors, and the cooperative-sticky pre-close rebalance wait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rdkafka::error::KafkaError;

use crate::buffer::{Message, MessagesBuffer, RawMessagesBuffer};
use crate::config::SubscriptionGroupConfig;
use crate::driver::{classify_kafka_error, KafkaDriver, MessageRef, SeekOffset, Tpl};
use crate::error::{ClientError, DriverErrorKind};
use crate::monitor::{Monitor, MonitorEvent};
use crate::rebalance::RebalanceSnapshot;
use crate::runtime::Runtime;
use crate::time_tracker::TimeTracker;

/// How long `Client::stop` will wait for the first rebalance under cooperative-sticky
/// before giving up and closing anyway (§5).
pub const COOPERATIVE_STICKY_MAX_WAIT: Duration = Duration::from_secs(60);

const MAX_POLL_RETRIES: u32 = 20;
const SEEK_RESOLUTION_TIMEOUT: Duration = Duration::from_millis(2000);
const SEEK_RESOLUTION_ATTEMPTS: u32 = 3;

/// Non-generic back-reference surface an [`crate::executor::Executor`]/`ConsumerInstance`
/// holds onto a [`Client`] without needing to name its driver type parameter.
pub trait ClientHandle: Send + Sync {
    fn pause(&self, topic: &str, partition: i32, offset: Option<i64>) -> Result<(), ClientError>;
    fn resume(&self, topic: &str, partition: i32) -> Result<(), ClientError>;
    fn seek(&self, msg: &Message, offset: SeekOffset) -> Result<(), ClientError>;
    fn mark_as_consumed(&self, msg: &Message) -> Result<bool, ClientError>;
    fn mark_as_consumed_sync(&self, msg: &Message) -> Result<bool, ClientError>;
}

/// Result of one `batch_poll` call: the built message batches plus, if the driver reported
/// a rebalance during this poll, the snapshot taken at the moment it was observed. The
/// listener must consume `rebalance` into revocation jobs itself and then call
/// `Client::clear_revocations` — the driver's own revoked/lost accounting is left untouched
/// by `batch_poll` so nothing is lost between detection and the listener acting on it.
pub struct PollOutcome {
    pub messages: MessagesBuffer,
    pub rebalanced: bool,
    pub rebalance: RebalanceSnapshot,
}

struct PausedEntry {
    offset: Option<i64>,
}

/// Thread-safe wrapper around a [`KafkaDriver`]. One instance per Listener; may be rebuilt
/// via [`Client::reset`] on a fatal poll error.
pub struct Client<D: KafkaDriver> {
    pub id: String,
    driver: RwLock<Arc<D>>,
    rebuild: Box<dyn Fn() -> Result<D, KafkaError> + Send + Sync>,
    config: SubscriptionGroupConfig,
    monitor: Arc<dyn Monitor>,
    runtime: Runtime,
    /// Serializes pause/resume/seek; `close` is additionally gated by `runtime.shutdown_guard`.
    op_mutex: Mutex<()>,
    paused_tpls: Mutex<HashMap<(String, i32), PausedEntry>>,
    closed: AtomicBool,
}

impl<D: KafkaDriver> Client<D> {
    pub fn new(
        id: impl Into<String>,
        driver: D,
        rebuild: impl Fn() -> Result<D, KafkaError> + Send + Sync + 'static,
        config: SubscriptionGroupConfig,
        monitor: Arc<dyn Monitor>,
        runtime: Runtime,
    ) -> Result<Self, KafkaError> {
        let topics: Vec<String> = config.topics.iter().map(|t| t.name.clone()).collect();
        driver.subscribe(&topics)?;
        Ok(Client {
            id: id.into(),
            driver: RwLock::new(Arc::new(driver)),
            rebuild: Box::new(rebuild),
            config,
            monitor,
            runtime,
            op_mutex: Mutex::new(()),
            paused_tpls: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn driver(&self) -> Arc<D> {
        self.driver.read().clone()
    }

    fn report(&self, caller: &'static str, kind: DriverErrorKind, message: String) {
        self.monitor.notify(MonitorEvent::ErrorOccurred {
            caller,
            error: message,
            kind,
        });
    }

    /// Loops calling `poll` until the time budget is exhausted, `max_messages` is reached,
    /// a rebalance is observed (records are then pruned/deduplicated), or a poll returns
    /// nothing. Single-threaded: only ever called from the Listener thread.
    pub fn batch_poll(&self) -> Result<PollOutcome, ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        let driver = self.driver();
        // Resets only the `changed` flag so this cycle can detect a fresh rebalance;
        // any revoked/lost partitions already accumulated (e.g. from between poll cycles)
        // are left for the listener to still consume below.
        driver.clear_rebalance_changed();

        let mut raw = RawMessagesBuffer::new();
        let mut tracker = TimeTracker::start(self.config.max_wait_time);
        let mut rebalanced = false;
        let mut rebalance = RebalanceSnapshot::default();

        loop {
            if tracker.expired() || raw.len() >= self.config.max_messages {
                break;
            }
            match driver.poll(tracker.remaining()) {
                Ok(Some(record)) => {
                    raw.push(record);
                }
                Ok(None) => break,
                Err(e) => {
                    let kind = classify_kafka_error(&e);
                    match self.handle_poll_error(&driver, kind, &e, &mut tracker)? {
                        PollErrorAction::Continue => continue,
                        PollErrorAction::EmptyOk => break,
                    }
                }
            }

            let snapshot = driver.rebalance_snapshot();
            if snapshot.changed {
                rebalanced = true;
                self.prune_revoked(&mut raw, &snapshot);
                raw.dedup();
                rebalance = snapshot;
                break;
            }
        }

        Ok(PollOutcome {
            messages: MessagesBuffer::from_raw(&mut raw),
            rebalanced,
            rebalance,
        })
    }

    /// Drop the revoked/lost partitions the driver has accumulated, once the listener has
    /// turned `PollOutcome::rebalance` into revocation jobs. Must not be called before that.
    pub fn clear_revocations(&self) {
        self.driver().clear_rebalance_revocations();
    }

    fn prune_revoked(&self, raw: &mut RawMessagesBuffer, snapshot: &RebalanceSnapshot) {
        for (topic, partitions) in snapshot.revoked_partitions() {
            for partition in partitions {
                raw.remove_partition(&topic, partition);
            }
        }
    }

    fn handle_poll_error(
        &self,
        driver: &Arc<D>,
        kind: DriverErrorKind,
        err: &KafkaError,
        tracker: &mut TimeTracker,
    ) -> Result<PollErrorAction, ClientError> {
        if kind == DriverErrorKind::UnknownTopicOrPart {
            if self.config.auto_create_topics() {
                return Ok(PollErrorAction::EmptyOk);
            }
            if self.runtime.stopping() {
                return Err(ClientError::driver(kind, err.to_string()));
            }
        }
        if kind.reports_early() && tracker.attempts() == 0 {
            self.report("connection.client.poll", kind, err.to_string());
        }
        if kind == DriverErrorKind::CoordinatorLoadInProgress {
            std::thread::sleep(Duration::from_secs(1));
            tracker.checkpoint();
            return Ok(PollErrorAction::Continue);
        }
        if !kind.is_retryable() {
            return Err(ClientError::driver(kind, err.to_string()));
        }
        tracker.checkpoint();
        if tracker.attempts() > MAX_POLL_RETRIES {
            return Err(ClientError::RetriesExhausted {
                attempts: tracker.attempts(),
                message: err.to_string(),
            });
        }
        let backoff = tracker.backoff(Duration::from_millis(50), Duration::from_secs(5));
        std::thread::sleep(backoff.min(tracker.remaining()));
        let _ = driver;
        Ok(PollErrorAction::Continue)
    }

    pub fn store_offset(&self, msg: &Message) -> Result<bool, ClientError> {
        let driver = self.driver();
        let msg_ref = MessageRef {
            topic: msg.topic.clone(),
            partition: msg.partition,
            offset: msg.offset,
        };
        match driver.store_offset(&msg_ref) {
            Ok(()) => Ok(true),
            Err(e) => {
                let kind = classify_kafka_error(&e);
                match kind {
                    DriverErrorKind::AssignmentLost => Ok(false),
                    DriverErrorKind::Other if is_state_error(&e) => Ok(false),
                    _ => Err(ClientError::driver(kind, e.to_string())),
                }
            }
        }
    }

    pub fn commit_offsets(&self, r#async: bool) -> Result<bool, ClientError> {
        let driver = self.driver();
        loop {
            match driver.commit(None, r#async) {
                Ok(()) => return Ok(true),
                Err(e) => {
                    let kind = classify_kafka_error(&e);
                    match kind {
                        DriverErrorKind::AssignmentLost | DriverErrorKind::UnknownMemberId => {
                            return Ok(false)
                        }
                        DriverErrorKind::NoOffset => return Ok(true),
                        DriverErrorKind::CoordinatorLoadInProgress => {
                            std::thread::sleep(Duration::from_secs(1));
                            continue;
                        }
                        _ => return Err(ClientError::driver(kind, e.to_string())),
                    }
                }
            }
        }
    }

    pub fn seek(&self, msg: &Message, offset: SeekOffset) -> Result<(), ClientError> {
        let _guard = self.op_mutex.lock().unwrap_or_else(|p| p.into_inner());
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        let driver = self.driver();
        let msg_ref = MessageRef {
            topic: msg.topic.clone(),
            partition: msg.partition,
            offset: msg.offset,
        };
        let resolved = match offset {
            SeekOffset::Timestamp(ts) => {
                let mut attempt = 0;
                let mut found = None;
                while attempt < SEEK_RESOLUTION_ATTEMPTS {
                    let resolved = driver
                        .offsets_for_times(
                            &[(msg.topic.clone(), msg.partition, ts)],
                            SEEK_RESOLUTION_TIMEOUT,
                        )
                        .map_err(|e| {
                            ClientError::driver(classify_kafka_error(&e), e.to_string())
                        })?;
                    if let Some((_, _, Some(o))) = resolved.into_iter().next() {
                        found = Some(o);
                        break;
                    }
                    attempt += 1;
                }
                match found {
                    Some(o) => SeekOffset::Exact(o),
                    None => return Err(ClientError::InvalidTimeBasedOffset),
                }
            }
            other => other,
        };
        driver
            .seek(&msg_ref, resolved)
            .map_err(|e| ClientError::driver(classify_kafka_error(&e), e.to_string()))
    }

    pub fn pause(&self, topic: &str, partition: i32, offset: Option<i64>) -> Result<(), ClientError> {
        let _guard = self.op_mutex.lock().unwrap_or_else(|p| p.into_inner());
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut tpl = Tpl::new();
        tpl.push(topic, partition);
        self.driver()
            .pause(&tpl)
            .map_err(|e| ClientError::driver(classify_kafka_error(&e), e.to_string()))?;
        self.paused_tpls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert((topic.to_string(), partition), PausedEntry { offset });
        self.monitor.notify(MonitorEvent::ClientPause {
            topic: topic.to_string(),
            partition,
            offset,
        });
        Ok(())
    }

    pub fn resume(&self, topic: &str, partition: i32) -> Result<(), ClientError> {
        let _guard = self.op_mutex.lock().unwrap_or_else(|p| p.into_inner());
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut tpl = Tpl::new();
        tpl.push(topic, partition);
        self.driver()
            .resume(&tpl)
            .map_err(|e| ClientError::driver(classify_kafka_error(&e), e.to_string()))?;
        self.paused_tpls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&(topic.to_string(), partition));
        self.monitor
            .notify(MonitorEvent::ClientResume { topic: topic.to_string(), partition });
        Ok(())
    }

    pub fn is_paused(&self, topic: &str, partition: i32) -> bool {
        self.paused_tpls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(&(topic.to_string(), partition))
    }

    /// Waits up to [`COOPERATIVE_STICKY_MAX_WAIT`] for the first rebalance under
    /// cooperative-sticky (works around a native-library crash on close-during-rebalance),
    /// then closes, serialized by the runtime-wide shutdown mutex.
    pub fn stop(&self) {
        if self.config.is_cooperative_sticky() {
            let deadline = Instant::now() + COOPERATIVE_STICKY_MAX_WAIT;
            let driver = self.driver();
            while !driver.rebalance_snapshot().active && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(50));
            }
        }
        self.close();
    }

    /// Idempotent; at most one `close` ever reaches the driver, serialized process-wide.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _guard = self.runtime.shutdown_guard();
        self.driver().close();
    }

    /// Closes and rebuilds the underlying driver, preserving this client's identity.
    pub fn reset(&self) -> Result<(), KafkaError> {
        {
            let _guard = self.runtime.shutdown_guard();
            self.driver().close();
        }
        let new_driver = (self.rebuild)()?;
        let topics: Vec<String> = self.config.topics.iter().map(|t| t.name.clone()).collect();
        new_driver.subscribe(&topics)?;
        *self.driver.write() = Arc::new(new_driver);
        self.paused_tpls.lock().unwrap_or_else(|p| p.into_inner()).clear();
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// One 100ms poll swallowing all driver errors, to keep rebalance callbacks pumping
    /// during shutdown without doing real work.
    pub fn ping(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.driver().poll(Duration::from_millis(100));
    }

    pub fn mark_as_consumed(&self, msg: &Message) -> Result<bool, ClientError> {
        let stored = self.store_offset(msg)?;
        Ok(stored && !self.driver().assignment_lost())
    }

    pub fn mark_as_consumed_sync(&self, msg: &Message) -> Result<bool, ClientError> {
        if !self.mark_as_consumed(msg)? {
            return Ok(false);
        }
        self.commit_offsets(false)
    }

    pub fn rebalance_snapshot(&self) -> RebalanceSnapshot {
        self.driver().rebalance_snapshot()
    }

    /// Currently assigned (topic, partition) pairs, used by the Listener to notice
    /// partitions that went silent this poll cycle and owe an `on_idle` call.
    pub fn assignment(&self) -> Tpl {
        self.driver().assignment()
    }

    pub fn config(&self) -> &SubscriptionGroupConfig {
        &self.config
    }
}

enum PollErrorAction {
    Continue,
    EmptyOk,
}

fn is_state_error(err: &KafkaError) -> bool {
    // `rdkafka` surfaces a generic "state" error (operation invalid for the consumer's
    // current state, e.g. calling store_offset before the first assignment) without a
    // dedicated RDKafkaErrorCode; we fall back to matching the message the driver gives us.
    err.to_string().to_lowercase().contains("state")
}

impl<D: KafkaDriver> ClientHandle for Client<D> {
    fn pause(&self, topic: &str, partition: i32, offset: Option<i64>) -> Result<(), ClientError> {
        Client::pause(self, topic, partition, offset)
    }

    fn resume(&self, topic: &str, partition: i32) -> Result<(), ClientError> {
        Client::resume(self, topic, partition)
    }

    fn seek(&self, msg: &Message, offset: SeekOffset) -> Result<(), ClientError> {
        Client::seek(self, msg, offset)
    }

    fn mark_as_consumed(&self, msg: &Message) -> Result<bool, ClientError> {
        Client::mark_as_consumed(self, msg)
    }

    fn mark_as_consumed_sync(&self, msg: &Message) -> Result<bool, ClientError> {
        Client::mark_as_consumed_sync(self, msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::TracingMonitor;
    use crate::testing::FakeDriver;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn config() -> SubscriptionGroupConfig {
        SubscriptionGroupConfig::try_new(
            "g1",
            vec![crate::config::TopicConfig::new("t")],
            BTreeMap::new(),
            "test-client",
            1,
            Duration::from_millis(200),
            5,
            Duration::from_millis(100),
            Duration::from_millis(1000),
            true,
            Duration::from_millis(1000),
            true,
        )
        .unwrap()
    }

    fn make_client(driver: FakeDriver) -> Client<FakeDriver> {
        Client::new(
            "client-1",
            driver,
            || Ok(FakeDriver::new()),
            config(),
            Arc::new(TracingMonitor::new()),
            Runtime::for_test(),
        )
        .unwrap()
    }

    #[test]
    fn batch_poll_respects_max_messages() {
        let driver = FakeDriver::new();
        for i in 0..10 {
            driver.enqueue_record("t", 0, i);
        }
        let client = make_client(driver);
        let outcome = client.batch_poll().unwrap();
        assert_eq!(outcome.messages.len(), 5);
    }

    #[test]
    fn close_is_idempotent() {
        let driver = FakeDriver::new();
        let closes = driver.close_count_handle();
        let client = make_client(driver);
        client.close();
        client.close();
        assert_eq!(closes.get(), 1);
    }

    #[test]
    fn pause_then_resume_clears_cached_tpl() {
        let driver = FakeDriver::new();
        let client = make_client(driver);
        client.pause("t", 0, Some(5)).unwrap();
        assert!(client.is_paused("t", 0));
        client.resume("t", 0).unwrap();
        assert!(!client.is_paused("t", 0));
    }

    #[test]
    fn mark_as_consumed_sync_fails_fast_when_assignment_lost() {
        let driver = FakeDriver::new();
        driver.set_assignment_lost(true);
        let client = make_client(driver);
        let msg = Message {
            topic: "t".into(),
            partition: 0,
            offset: 1,
            key: None,
            raw_payload: None,
            headers: Vec::new(),
            timestamp_ms: None,
        };
        assert_eq!(client.mark_as_consumed_sync(&msg).unwrap(), false);
    }
}
