//! Per-(topic, partition) bookkeeping: in-flight job count, pause timer, revocation flag,
//! and the retry/throttle state strategies hang their backoff decisions on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

/// Per-(topic, partition) coordination state. The counter and pause timer are atomic so the
/// listener (incrementing) and a worker (decrementing, pausing) never need to coordinate
/// through a lock for the common path; `revoked` is likewise a flag, not a lock.
pub struct Coordinator {
    pub topic: String,
    pub partition: i32,
    running_jobs: AtomicU32,
    /// Millis-since-epoch of the instant pause expires; `i64::MIN` means "not paused".
    pause_until_ms: AtomicI64,
    revoked: AtomicBool,
    last_processed_offset: AtomicI64,
    retry_count: AtomicU32,
    /// Throttle-specific: resume offset once the current interval's delivery limit is hit.
    throttle_state: Mutex<Option<ThrottleState>>,
}

const NOT_PAUSED: i64 = i64::MIN;

#[derive(Debug, Clone, Copy)]
struct ThrottleState {
    delivered_in_interval: u32,
    interval_started_at: Instant,
}

impl Coordinator {
    pub fn new(topic: String, partition: i32) -> Self {
        Coordinator {
            topic,
            partition,
            running_jobs: AtomicU32::new(0),
            pause_until_ms: AtomicI64::new(NOT_PAUSED),
            revoked: AtomicBool::new(false),
            last_processed_offset: AtomicI64::new(-1),
            retry_count: AtomicU32::new(0),
            throttle_state: Mutex::new(None),
        }
    }

    /// Reset per-batch counters at the start of a new batch (§4.4 `start(messages)`); the
    /// running-job counter itself is incremented per emitted job by the listener, not here.
    pub fn start_batch(&self) {
        self.retry_count.store(0, Ordering::SeqCst);
    }

    pub fn increment(&self) {
        self.running_jobs.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement(&self) {
        self.running_jobs.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn running_jobs(&self) -> u32 {
        self.running_jobs.load(Ordering::SeqCst)
    }

    /// True once all scheduled work for this partition has completed, or it was revoked
    /// (revocation short-circuits regardless of the counter, per §4.4).
    pub fn finished(&self) -> bool {
        self.revoked.load(Ordering::SeqCst) || self.running_jobs() == 0
    }

    pub fn pause(&self, until: Instant, reference: Instant) {
        let delta_ms = until.saturating_duration_since(reference).as_millis();
        let target = i64::try_from(delta_ms).unwrap_or(i64::MAX);
        self.pause_until_ms.store(target, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.pause_until_ms.load(Ordering::SeqCst) != NOT_PAUSED
    }

    /// If paused and the pause has expired relative to `now` (expressed as millis elapsed
    /// since the same `reference` instant `pause` was called with), clears the pause and
    /// returns this coordinator's (topic, partition).
    pub fn try_resume(&self, elapsed_ms: i64) -> Option<(String, i32)> {
        let until = self.pause_until_ms.load(Ordering::SeqCst);
        if until == NOT_PAUSED || elapsed_ms < until {
            return None;
        }
        self.pause_until_ms.store(NOT_PAUSED, Ordering::SeqCst);
        Some((self.topic.clone(), self.partition))
    }

    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }

    pub fn revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }

    pub fn mark_processed(&self, offset: i64) {
        self.last_processed_offset
            .fetch_max(offset, Ordering::SeqCst);
    }

    pub fn last_processed_offset(&self) -> i64 {
        self.last_processed_offset.load(Ordering::SeqCst)
    }

    pub fn next_retry(&self) -> u32 {
        self.retry_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    /// Record one delivery against the throttle window starting at `now`; returns true if
    /// the delivery stays within `limit` for the current `interval`, false if the caller
    /// should pause. A new interval starts once the previous one has elapsed.
    pub fn throttle_tick(&self, now: Instant, limit: u32, interval: Duration) -> bool {
        let mut state = self
            .throttle_state
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        match state.as_mut() {
            Some(s) if now.duration_since(s.interval_started_at) < interval => {
                s.delivered_in_interval += 1;
                s.delivered_in_interval <= limit
            }
            _ => {
                *state = Some(ThrottleState {
                    delivered_in_interval: 1,
                    interval_started_at: now,
                });
                1 <= limit
            }
        }
    }
}

/// Owns the mapping (topic, partition) -> [`Coordinator`] for one Listener.
#[derive(Default)]
pub struct CoordinatorsBuffer {
    coordinators: RwLock<HashMap<(String, i32), std::sync::Arc<Coordinator>>>,
}

impl CoordinatorsBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_or_create(&self, topic: &str, partition: i32) -> std::sync::Arc<Coordinator> {
        if let Some(existing) = self
            .coordinators
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(topic.to_string(), partition))
        {
            return existing.clone();
        }
        let mut write = self
            .coordinators
            .write()
            .unwrap_or_else(|p| p.into_inner());
        write
            .entry((topic.to_string(), partition))
            .or_insert_with(|| {
                std::sync::Arc::new(Coordinator::new(topic.to_string(), partition))
            })
            .clone()
    }

    pub fn find(&self, topic: &str, partition: i32) -> Option<std::sync::Arc<Coordinator>> {
        self.coordinators
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(topic.to_string(), partition))
            .cloned()
    }

    pub fn remove(&self, topic: &str, partition: i32) {
        self.coordinators
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&(topic.to_string(), partition));
    }

    /// Yield every partition whose pause has expired relative to `elapsed_ms`, clearing
    /// each pause as it is yielded.
    pub fn for_each_resumable(&self, elapsed_ms: i64, mut f: impl FnMut(&str, i32)) {
        let coordinators: Vec<_> = self
            .coordinators
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        for coordinator in coordinators {
            if let Some((topic, partition)) = coordinator.try_resume(elapsed_ms) {
                f(&topic, partition);
            }
        }
    }

    pub fn iter(&self) -> Vec<std::sync::Arc<Coordinator>> {
        self.coordinators
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Drop every tracked coordinator, e.g. when a Listener rebuilds its `Client` after a
    /// fatal poll error and starts the assignment over from scratch.
    pub fn clear(&self) {
        self.coordinators
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }
}
