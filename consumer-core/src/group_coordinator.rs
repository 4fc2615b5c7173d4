//! Cross-subscription-group rendezvous (§4.9). Several `Listener`s in the same process can
//! belong to the same Kafka consumer group; this object stops any one of them from closing
//! its `Client` while a sibling subscription group is still mid-rebalance, since the native
//! library has been observed to crash when one group member closes during another's
//! rebalance window.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Shared countdown of active subscription groups within one consumer group. Cloned (it's
/// an `Arc` wrapper) into every `Listener` that belongs to the same consumer group.
#[derive(Clone)]
pub struct ConsumerGroupCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    remaining: AtomicUsize,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl ConsumerGroupCoordinator {
    /// `members` is the number of subscription groups sharing this consumer group.
    pub fn new(members: usize) -> Self {
        ConsumerGroupCoordinator {
            inner: Arc::new(Inner {
                remaining: AtomicUsize::new(members),
                lock: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Called once by a Listener's shutdown sequence when it has finished its own drain.
    /// Idempotent only in the sense that calling it more times than `members` saturates at
    /// zero rather than underflowing; a well-behaved caller calls it exactly once.
    pub fn finish_work(&self, _listener_id: &str) {
        let _guard = self.inner.lock.lock().unwrap_or_else(|p| p.into_inner());
        let prev = self.inner.remaining.load(Ordering::SeqCst);
        if prev > 0 {
            self.inner.remaining.store(prev - 1, Ordering::SeqCst);
        }
        self.inner.condvar.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.remaining.load(Ordering::SeqCst) == 0
    }

    /// Block until every member has called `finish_work`, or `timeout` elapses. Returns
    /// whether the group actually finished (as opposed to timing out).
    pub fn wait(&self, timeout: std::time::Duration) -> bool {
        let guard = self.inner.lock.lock().unwrap_or_else(|p| p.into_inner());
        if self.is_shutdown() {
            return true;
        }
        let (_guard, result) = self
            .inner
            .condvar
            .wait_timeout_while(guard, timeout, |_| !self.is_shutdown())
            .unwrap_or_else(|p| p.into_inner());
        !result.timed_out()
    }

    /// RAII guard that calls `finish_work` on drop, for use in a listener's cleanup path
    /// regardless of which branch of the shutdown sequence it takes.
    pub fn unlock_guard(&self, listener_id: impl Into<String>) -> UnlockGuard {
        UnlockGuard {
            coordinator: self.clone(),
            listener_id: listener_id.into(),
            done: false,
        }
    }
}

pub struct UnlockGuard {
    coordinator: ConsumerGroupCoordinator,
    listener_id: String,
    done: bool,
}

impl UnlockGuard {
    /// Call explicitly to unlock before the guard's scope ends (still safe to let the
    /// `Drop` impl run afterward; it's a no-op the second time).
    pub fn unlock(&mut self) {
        if !self.done {
            self.coordinator.finish_work(&self.listener_id);
            self.done = true;
        }
    }
}

impl Drop for UnlockGuard {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn shutdown_true_once_every_member_finishes() {
        let coord = ConsumerGroupCoordinator::new(2);
        assert!(!coord.is_shutdown());
        coord.finish_work("listener-1");
        assert!(!coord.is_shutdown());
        coord.finish_work("listener-2");
        assert!(coord.is_shutdown());
    }

    #[test]
    fn wait_returns_immediately_when_already_shutdown() {
        let coord = ConsumerGroupCoordinator::new(0);
        assert!(coord.wait(Duration::from_millis(10)));
    }

    #[test]
    fn wait_times_out_when_a_member_never_finishes() {
        let coord = ConsumerGroupCoordinator::new(1);
        assert!(!coord.wait(Duration::from_millis(20)));
    }

    #[test]
    fn unlock_guard_finishes_work_on_drop() {
        let coord = ConsumerGroupCoordinator::new(1);
        {
            let _guard = coord.unlock_guard("listener-1");
        }
        assert!(coord.is_shutdown());
    }

    #[test]
    fn count_saturates_at_zero_instead_of_underflowing() {
        let coord = ConsumerGroupCoordinator::new(1);
        coord.finish_work("listener-1");
        coord.finish_work("listener-1");
        assert!(coord.is_shutdown());
    }
}
