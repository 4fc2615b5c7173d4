//! Component handle and lifecycle events.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub(crate) const HEALTH_STARTING: i64 = 0;
pub(crate) const HEALTH_UNHEALTHY: i64 = -1;

#[derive(Debug)]
pub(crate) enum ComponentEvent {
    Failure { tag: String, reason: String },
    ShutdownRequested { tag: String },
    WorkCompleted { tag: String },
    Died { tag: String },
}

/// RAII handle for a registered component. Clone and pass to tasks or worker threads.
///
/// **Drop guard:** when the last clone of a handle is dropped, the manager is notified. If
/// shutdown is already in progress ([`is_shutting_down`](Handle::is_shutting_down)), the drop
/// is treated as normal completion (equivalent to [`work_completed`](Handle::work_completed)).
/// If shutdown is not in progress, the drop signals "component died" and triggers shutdown.
/// So for long-running components that exit when they see shutdown, just return (drop the
/// handle); no need to call `work_completed()`. Call `work_completed()` for one-shot/finite
/// work or when signaling done without dropping.
#[derive(Clone)]
pub struct Handle {
    pub(crate) inner: Arc<HandleInner>,
}

pub(crate) struct HandleInner {
    pub(crate) tag: String,
    pub(crate) shutdown_token: CancellationToken,
    pub(crate) event_tx: Arc<OnceLock<mpsc::Sender<ComponentEvent>>>,
    pub(crate) healthy_until_ms: Arc<AtomicI64>,
    pub(crate) liveness_deadline: Option<Duration>,
    pub(crate) completed: AtomicBool,
    pub(crate) process_scope_signalled: AtomicBool,
}

fn terminal_event(tag: &str, shutdown_token: &CancellationToken) -> ComponentEvent {
    if shutdown_token.is_cancelled() {
        ComponentEvent::WorkCompleted {
            tag: tag.to_string(),
        }
    } else {
        ComponentEvent::Died {
            tag: tag.to_string(),
        }
    }
}

/// RAII guard tying lifecycle signaling to a specific scope (typically a `process()`-style
/// method) rather than the handle's last-clone drop. Obtained via [`Handle::process_scope`].
/// On drop, sends the same terminal event `HandleInner`'s own drop would — completion if
/// shutdown is in progress, otherwise "died" — but only once: if the owning handle (or
/// another scope guard from the same handle) already signalled, this is a no-op.
pub struct ProcessScopeGuard {
    handle: Handle,
}

impl Drop for ProcessScopeGuard {
    fn drop(&mut self) {
        let inner = &self.handle.inner;
        if inner.process_scope_signalled.swap(true, Ordering::SeqCst) {
            return;
        }
        if inner.completed.load(Ordering::SeqCst) {
            return;
        }
        self.handle
            .send(terminal_event(&inner.tag, &inner.shutdown_token));
    }
}

impl Handle {
    fn send(&self, event: ComponentEvent) {
        if let Some(tx) = self.inner.event_tx.get() {
            drop(tx.try_send(event));
        }
    }

    /// Future that resolves when shutdown begins. Use in `tokio::select!` to detect shutdown.
    pub fn shutdown_recv(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.inner.shutdown_token.cancelled()
    }

    /// Clone of the underlying cancellation token, for passing to sub-tasks.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.shutdown_token.clone()
    }

    /// Returns true if shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown_token.is_cancelled()
    }

    /// Signal a fatal error; triggers global shutdown.
    pub fn signal_failure(&self, reason: impl Into<String>) {
        self.send(ComponentEvent::Failure {
            tag: self.inner.tag.clone(),
            reason: reason.into(),
        });
    }

    /// Request a clean shutdown (non-fatal).
    pub fn request_shutdown(&self) {
        self.send(ComponentEvent::ShutdownRequested {
            tag: self.inner.tag.clone(),
        });
    }

    /// Mark this component as finished. Required for one-shot/finite work (e.g. a restart
    /// pass) or when signaling done without dropping the handle. Optional for long-running
    /// components that exit on shutdown: dropping the handle during shutdown already counts
    /// as completion.
    pub fn work_completed(&self) {
        self.inner.completed.store(true, Ordering::SeqCst);
        self.send(ComponentEvent::WorkCompleted {
            tag: self.inner.tag.clone(),
        });
    }

    /// Report healthy; must be called more often than the configured liveness deadline.
    pub fn report_healthy(&self) {
        if let Some(deadline) = self.inner.liveness_deadline {
            let now_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as i64;
            let until = now_ms.saturating_add(deadline.as_millis() as i64);
            self.inner.healthy_until_ms.store(until, Ordering::Relaxed);
        }
    }

    /// Report this component as unhealthy for liveness.
    pub fn report_unhealthy(&self) {
        self.inner
            .healthy_until_ms
            .store(HEALTH_UNHEALTHY, Ordering::Relaxed);
    }

    /// Same as [`report_healthy`](Handle::report_healthy); safe to call from sync/blocking
    /// contexts (e.g. rdkafka driver callbacks, worker threads with no tokio runtime).
    pub fn report_healthy_blocking(&self) {
        self.report_healthy();
    }

    /// Tie lifecycle signaling to the scope this guard lives in (typically the body of a
    /// `process()`-style method) instead of this handle's last-clone drop. Useful when the
    /// handle is held on a long-lived struct but the component's "real" lifetime is a single
    /// method call — the guard fires when that call returns, not whenever the struct happens
    /// to be dropped later.
    pub fn process_scope(&self) -> ProcessScopeGuard {
        ProcessScopeGuard {
            handle: self.clone(),
        }
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if self.completed.load(Ordering::SeqCst) || self.process_scope_signalled.load(Ordering::SeqCst)
        {
            return;
        }
        let event = terminal_event(&self.tag, &self.shutdown_token);
        if let Some(tx) = self.event_tx.get() {
            drop(tx.try_send(event));
        }
    }
}
