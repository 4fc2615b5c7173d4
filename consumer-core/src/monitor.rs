//! The structured-event sink the core emits to (§6). Default implementation logs via
//! `tracing` and mirrors counters/histograms via `common_metrics`, matching the split the
//! teacher's crates use elsewhere in this workspace (`tracing` for humans, the shared
//! metrics facade for Prometheus, with its label filter applied consistently).

use std::time::Duration;

use crate::error::DriverErrorKind;

/// One structured event the core can emit. Named after the dotted event names in §6 so a
/// log line or a trace span can carry the same name an operator would grep for.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    ListenerBeforeFetchLoop { group_id: String },
    ListenerFetchLoop { group_id: String },
    ListenerFetchLoopReceived {
        group_id: String,
        client_id: String,
        messages: usize,
        elapsed: Duration,
    },
    ListenerFetchLoopError { group_id: String, error: String },
    ClientPause { topic: String, partition: i32, offset: Option<i64> },
    ClientResume { topic: String, partition: i32 },
    ErrorOccurred { caller: &'static str, error: String, kind: DriverErrorKind },
    WorkerProcess { group_id: String, hook: &'static str },
    WorkerProcessed { group_id: String, hook: &'static str },
    WorkerCompleted { group_id: String },
    ConsumerConsumingRetry { topic: String, partition: i32, attempt: u32 },
    DeadLetterQueueDispatched { topic: String, partition: i32, offset: i64 },
    FilteringThrottled { topic: String, partition: i32 },
    FilteringSeek { topic: String, partition: i32, offset: i64 },
    AppRunning,
    AppStopping,
    AppStopped,
    AppQuieting,
    AppQuiet,
    ProcessNoticeSignal { signal: &'static str },
    StatisticsEmitted,
    ConsumerHookError { hook: &'static str, error: String },
    WorkerProcessError { error: String },
}

impl MonitorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MonitorEvent::ListenerBeforeFetchLoop { .. } => "connection.listener.before_fetch_loop",
            MonitorEvent::ListenerFetchLoop { .. } => "connection.listener.fetch_loop",
            MonitorEvent::ListenerFetchLoopReceived { .. } => {
                "connection.listener.fetch_loop.received"
            }
            MonitorEvent::ListenerFetchLoopError { .. } => "connection.listener.fetch_loop.error",
            MonitorEvent::ClientPause { .. } => "client.pause",
            MonitorEvent::ClientResume { .. } => "client.resume",
            MonitorEvent::ErrorOccurred { .. } => "error.occurred",
            MonitorEvent::WorkerProcess { .. } => "worker.process",
            MonitorEvent::WorkerProcessed { .. } => "worker.processed",
            MonitorEvent::WorkerCompleted { .. } => "worker.completed",
            MonitorEvent::ConsumerConsumingRetry { .. } => "consumer.consuming.retry",
            MonitorEvent::DeadLetterQueueDispatched { .. } => "dead_letter_queue.dispatched",
            MonitorEvent::FilteringThrottled { .. } => "filtering.throttled",
            MonitorEvent::FilteringSeek { .. } => "filtering.seek",
            MonitorEvent::AppRunning => "app.running",
            MonitorEvent::AppStopping => "app.stopping",
            MonitorEvent::AppStopped => "app.stopped",
            MonitorEvent::AppQuieting => "app.quieting",
            MonitorEvent::AppQuiet => "app.quiet",
            MonitorEvent::ProcessNoticeSignal { .. } => "process.notice_signal",
            MonitorEvent::StatisticsEmitted => "statistics.emitted",
            MonitorEvent::ConsumerHookError { .. } => "consumer.hook.error",
            MonitorEvent::WorkerProcessError { .. } => "worker.process.error",
        }
    }
}

/// Sink the core emits structured events to. Kept intentionally small (one method) so a
/// caller can fan out to logging, metrics, and a DLQ-adjacent alerting pipeline from a
/// single implementation without this crate knowing about any of them.
pub trait Monitor: Send + Sync {
    fn notify(&self, event: MonitorEvent);
}

/// Default [`Monitor`]: logs each event via `tracing` and records a counter (and, for
/// latency-bearing events, a histogram) via `common_metrics`.
#[derive(Default)]
pub struct TracingMonitor;

impl TracingMonitor {
    pub fn new() -> Self {
        Self
    }
}

impl Monitor for TracingMonitor {
    fn notify(&self, event: MonitorEvent) {
        let name = event.name();
        let labels = [("event".to_string(), name.to_string())];
        common_metrics::inc("consumer_core_events_total", &labels, 1);
        match &event {
            MonitorEvent::ListenerFetchLoopReceived {
                group_id,
                client_id,
                messages,
                elapsed,
            } => {
                common_metrics::histogram(
                    "consumer_core_fetch_loop_messages",
                    &labels,
                    *messages as f64,
                );
                tracing::debug!(
                    event = name,
                    group_id,
                    client_id,
                    messages,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "fetch loop received messages"
                );
            }
            MonitorEvent::ErrorOccurred { caller, error, kind } => {
                tracing::warn!(event = name, caller, error, ?kind, "error occurred");
            }
            MonitorEvent::ListenerFetchLoopError { group_id, error } => {
                tracing::error!(event = name, group_id, error, "fetch loop error, restarting client");
            }
            MonitorEvent::ConsumerHookError { hook, error } => {
                tracing::warn!(event = name, hook, error, "consumer hook error");
            }
            MonitorEvent::WorkerProcessError { error } => {
                tracing::error!(event = name, error, "worker process error");
            }
            MonitorEvent::ClientPause { topic, partition, offset } => {
                tracing::debug!(event = name, topic, partition, offset, "client paused partition");
            }
            MonitorEvent::ClientResume { topic, partition } => {
                tracing::debug!(event = name, topic, partition, "client resumed partition");
            }
            MonitorEvent::DeadLetterQueueDispatched { topic, partition, offset } => {
                tracing::warn!(event = name, topic, partition, offset, "dispatched message to dlq");
            }
            _ => {
                tracing::trace!(event = name, "consumer core event");
            }
        }
    }
}
