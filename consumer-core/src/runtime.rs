//! Explicit runtime object replacing ad hoc global mutable state: process-wide
//! running/stopping/quieting/quiet/stopped flags, the process-wide client shutdown mutex,
//! and (via [`lifecycle::Handle`]) health/liveness reporting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use lifecycle::{ComponentOptions, Handle};

/// Process-wide status, injected into every component that needs to observe or drive
/// shutdown. `running -> stopping -> (quieting -> quiet)? -> stopped` is monotonic: once a
/// later state is entered, earlier ones are never re-entered.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

struct Inner {
    handle: Handle,
    stopping: AtomicBool,
    quieting: AtomicBool,
    quiet: AtomicBool,
    stopped: AtomicBool,
    /// Serializes `Client::close` across every client this process creates (§4.1).
    shutdown_mutex: Mutex<()>,
    /// Shared monotonic anchor so a `Coordinator::pause` on a worker thread and the
    /// corresponding `CoordinatorsBuffer::for_each_resumable` on the listener thread agree
    /// on what "elapsed" means, without either side needing its own `Instant::now()` call
    /// at a different moment.
    started_at: Instant,
}

impl Runtime {
    /// Build a runtime around an existing [`lifecycle::Handle`]. The handle's own
    /// cancellation token is treated as the authoritative `stopping` signal: this runtime's
    /// `stopping` flag tracks it, but also exposes the finer-grained quiet-mode states the
    /// driver loop needs beyond plain graceful shutdown.
    pub fn new(handle: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                handle,
                stopping: AtomicBool::new(false),
                quieting: AtomicBool::new(false),
                quiet: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                shutdown_mutex: Mutex::new(()),
                started_at: Instant::now(),
            }),
        }
    }

    /// Monotonic anchor instant this runtime was created at (§5 pause/resume consistency).
    pub fn started_at(&self) -> Instant {
        self.inner.started_at
    }

    /// Milliseconds elapsed since this runtime was created.
    pub fn elapsed_ms(&self) -> i64 {
        i64::try_from(self.inner.started_at.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    /// A runtime with a throwaway lifecycle manager behind it, for unit tests. The manager
    /// is never monitored; its handle works standalone (events are silently dropped, which
    /// mirrors production behavior before `Manager::monitor` is called).
    #[cfg(any(test, feature = "test-util"))]
    pub fn for_test() -> Self {
        let mut manager = lifecycle::Manager::builder("consumer-core-test")
            .with_trap_signals(false)
            .with_prestop_check(false)
            .build();
        let handle = manager.register("runtime", ComponentOptions::new());
        Self::new(handle)
    }

    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    pub fn running(&self) -> bool {
        !self.stopping() && !self.stopped()
    }

    pub fn stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst) || self.inner.handle.is_shutting_down()
    }

    /// Begin a graceful shutdown. Idempotent.
    pub fn begin_stopping(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
    }

    pub fn quieting(&self) -> bool {
        self.inner.quieting.load(Ordering::SeqCst)
    }

    pub fn quiet(&self) -> bool {
        self.inner.quiet.load(Ordering::SeqCst)
    }

    /// Enter quiet mode: keep polling, drain in-flight work, schedule no new consumption.
    pub fn begin_quieting(&self) {
        self.inner.quieting.store(true, Ordering::SeqCst);
    }

    /// Mark quiet mode as fully drained (no in-flight work left).
    pub fn mark_quiet(&self) {
        self.inner.quiet.store(true, Ordering::SeqCst);
    }

    pub fn stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn mark_stopped(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }

    /// Lock held for the duration of one `Client::close` call, process-wide.
    pub fn shutdown_guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.inner
            .shutdown_mutex
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_transition() {
        let rt = Runtime::for_test();
        assert!(rt.running());
        rt.begin_stopping();
        assert!(!rt.running());
        assert!(rt.stopping());
        rt.begin_quieting();
        rt.mark_quiet();
        assert!(rt.quiet());
        rt.mark_stopped();
        assert!(rt.stopped());
    }

    #[test]
    fn shutdown_guard_serializes() {
        let rt = Runtime::for_test();
        let _g = rt.shutdown_guard();
        // A second, nested attempt from the same thread would deadlock; we just check the
        // guard is obtainable and drops cleanly.
        drop(_g);
        let _g2 = rt.shutdown_guard();
    }
}
