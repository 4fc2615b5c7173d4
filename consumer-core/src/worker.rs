//! Drains the `JobsQueue` (§4.6) on a fixed pool of OS threads, applying each topic's
//! `TopicStrategy` around a `ConsumerInstance`'s lifecycle hooks (§4.5). Every hook call is
//! wrapped in `catch_unwind` (§7 "worker internal error"): a panicking hook is reported and
//! the worker thread keeps running.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::buffer::Message;
use crate::client::ClientHandle;
use crate::dlq::DlqDispatcher;
use crate::driver::SeekOffset;
use crate::error::WorkerError;
use crate::executor::{ConsumerInstance, Executor, TopicStrategy};
use crate::jobs::{Job, JobKind, JobsQueue};
use crate::monitor::{Monitor, MonitorEvent};
use crate::runtime::Runtime;

/// Per-topic `TopicStrategy` lookup, built once per Listener from its
/// `SubscriptionGroupConfig` (`TopicConfig::strategy`).
pub type StrategyTable = HashMap<String, TopicStrategy>;

/// A fixed pool of worker threads draining one `JobsQueue`. Workers aren't scoped to a
/// subscription group; any worker services any group's job (§5 scheduling model).
pub struct WorkerPool {
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        concurrency: usize,
        queue: Arc<JobsQueue>,
        strategies: Arc<StrategyTable>,
        dlq: Arc<dyn DlqDispatcher>,
        monitor: Arc<dyn Monitor>,
        runtime: Runtime,
    ) -> Self {
        let handles = (0..concurrency)
            .map(|idx| {
                let queue = queue.clone();
                let strategies = strategies.clone();
                let dlq = dlq.clone();
                let monitor = monitor.clone();
                let runtime = runtime.clone();
                std::thread::Builder::new()
                    .name(format!("consumer-worker-{idx}"))
                    .spawn(move || worker_loop(&queue, &strategies, &dlq, monitor.as_ref(), &runtime))
                    .expect("failed to spawn consumer worker thread")
            })
            .collect();
        WorkerPool { handles }
    }

    /// Block until every worker thread exits. Callers must `JobsQueue::close` first, or
    /// every worker is still blocked in `pop` and this never returns.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    queue: &JobsQueue,
    strategies: &StrategyTable,
    dlq: &Arc<dyn DlqDispatcher>,
    monitor: &dyn Monitor,
    runtime: &Runtime,
) {
    while let Some(job) = queue.pop() {
        let group_id = job.group_id.clone();
        process_job(job, strategies, dlq, monitor, runtime);
        queue.complete(&group_id);
    }
}

fn job_kind_label(kind: &JobKind) -> &'static str {
    match kind {
        JobKind::Consume { .. } => "on_consume",
        JobKind::Idle => "on_idle",
        JobKind::Revoked => "on_revoked",
        JobKind::Shutdown => "on_shutdown",
    }
}

fn process_job(
    job: Job,
    strategies: &StrategyTable,
    dlq: &Arc<dyn DlqDispatcher>,
    monitor: &dyn Monitor,
    runtime: &Runtime,
) {
    let Job {
        group_id,
        executor,
        kind,
        ..
    } = job;
    let hook = job_kind_label(&kind);
    monitor.notify(MonitorEvent::WorkerProcess {
        group_id: group_id.clone(),
        hook,
    });

    match kind {
        JobKind::Consume { messages } => {
            let strategy = strategies
                .get(&executor.topic)
                .unwrap_or(&TopicStrategy::Plain);
            process_consume(&executor, strategy, messages, dlq, monitor, runtime);
            executor.coordinator.decrement();
        }
        JobKind::Idle => {
            run_void_hook(&executor, monitor, "on_idle", |i| i.on_idle());
        }
        JobKind::Revoked => {
            if executor.has_instance() {
                run_void_hook(&executor, monitor, "on_revoked", |i| i.on_revoked());
            }
        }
        JobKind::Shutdown => {
            if executor.has_instance() {
                run_void_hook(&executor, monitor, "on_shutdown", |i| i.on_shutdown());
            }
        }
    }

    monitor.notify(MonitorEvent::WorkerProcessed {
        group_id: group_id.clone(),
        hook,
    });
    monitor.notify(MonitorEvent::WorkerCompleted { group_id });
}

fn process_consume(
    executor: &Executor,
    strategy: &TopicStrategy,
    messages: Vec<Message>,
    dlq: &Arc<dyn DlqDispatcher>,
    monitor: &dyn Monitor,
    runtime: &Runtime,
) {
    if messages.is_empty() {
        return;
    }
    let client = executor.client();

    match strategy {
        TopicStrategy::Plain | TopicStrategy::LongRunningJob => {
            consume_batch(executor, &messages, monitor);
        }
        TopicStrategy::Throttling { limit, interval } => {
            consume_throttled(
                executor,
                &messages,
                *limit,
                *interval,
                client.as_deref(),
                monitor,
                runtime,
            );
        }
        TopicStrategy::Expiring { ttl } => {
            consume_expiring(executor, &messages, *ttl, monitor);
        }
        TopicStrategy::Delaying { delay } => {
            consume_delaying(executor, &messages, *delay, client.as_deref(), monitor, runtime);
        }
        TopicStrategy::Dlq {
            max_retries,
            pause_timeout,
            pause_max_timeout,
        } => {
            consume_with_dlq(
                executor,
                &messages,
                *max_retries,
                *pause_timeout,
                *pause_max_timeout,
                client.as_deref(),
                dlq,
                monitor,
                runtime,
            );
        }
    }
}

/// Plain lifecycle around one batch: `on_before_consume` -> `on_consume` -> `on_after_consume`.
/// A consume error is reported and swallowed here; strategies needing retry/DLQ behavior
/// call `call_consume` directly instead of this helper.
fn consume_batch(executor: &Executor, messages: &[Message], monitor: &dyn Monitor) {
    run_void_hook(executor, monitor, "on_before_consume", |i| {
        i.on_before_consume(messages)
    });
    match call_consume(executor, messages) {
        Ok(()) => {
            if let Some(last) = messages.last() {
                executor.coordinator.mark_processed(last.offset);
            }
            run_void_hook(executor, monitor, "on_after_consume", |i| {
                i.on_after_consume(messages)
            });
        }
        Err(e) => {
            monitor.notify(MonitorEvent::ConsumerHookError {
                hook: "on_consume",
                error: e.to_string(),
            });
        }
    }
}

fn consume_expiring(executor: &Executor, messages: &[Message], ttl: Duration, monitor: &dyn Monitor) {
    let now_ms = current_unix_ms();
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    let fresh: Vec<Message> = messages
        .iter()
        .filter(|m| {
            m.timestamp_ms
                .map_or(true, |ts| now_ms.saturating_sub(ts) <= ttl_ms)
        })
        .cloned()
        .collect();
    if fresh.is_empty() {
        if let Some(last) = messages.last() {
            executor.coordinator.mark_processed(last.offset);
        }
        return;
    }
    consume_batch(executor, &fresh, monitor);
}

fn consume_throttled(
    executor: &Executor,
    messages: &[Message],
    limit: u32,
    interval: Duration,
    client: Option<&dyn ClientHandle>,
    monitor: &dyn Monitor,
    runtime: &Runtime,
) {
    let now = Instant::now();
    let mut allowed = Vec::with_capacity(messages.len());
    let mut throttled_at = None;
    for msg in messages {
        if executor.coordinator.throttle_tick(now, limit, interval) {
            allowed.push(msg.clone());
        } else {
            throttled_at = Some(msg.clone());
            break;
        }
    }
    if !allowed.is_empty() {
        consume_batch(executor, &allowed, monitor);
    }
    if let Some(msg) = throttled_at {
        seek_back_and_pause(executor, &msg, client, runtime, interval);
        monitor.notify(MonitorEvent::FilteringThrottled {
            topic: msg.topic.clone(),
            partition: msg.partition,
        });
    }
}

fn consume_delaying(
    executor: &Executor,
    messages: &[Message],
    delay: Duration,
    client: Option<&dyn ClientHandle>,
    monitor: &dyn Monitor,
    runtime: &Runtime,
) {
    let now_ms = current_unix_ms();
    let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    let not_yet_due = |m: &Message| m.timestamp_ms.is_some_and(|ts| now_ms.saturating_sub(ts) < delay_ms);

    let split = messages.iter().position(not_yet_due);
    let ready = match split {
        Some(i) => &messages[..i],
        None => messages,
    };
    if !ready.is_empty() {
        consume_batch(executor, ready, monitor);
    }
    if let Some(i) = split {
        let msg = &messages[i];
        seek_back_and_pause(executor, msg, client, runtime, delay);
        monitor.notify(MonitorEvent::FilteringSeek {
            topic: msg.topic.clone(),
            partition: msg.partition,
            offset: msg.offset,
        });
    }
}

/// Shared tail of the throttling/delaying paths: rewind the client to the held-back
/// message and pause the coordinator until `duration` from now, anchored to the same
/// `Runtime::started_at` the Listener's `for_each_resumable` reads elapsed time against.
fn seek_back_and_pause(
    executor: &Executor,
    msg: &Message,
    client: Option<&dyn ClientHandle>,
    runtime: &Runtime,
    duration: Duration,
) {
    if let Some(client) = client {
        let _ = client.pause(&msg.topic, msg.partition, Some(msg.offset));
        let _ = client.seek(msg, SeekOffset::Exact(msg.offset));
    }
    executor
        .coordinator
        .pause(Instant::now() + duration, runtime.started_at());
}

#[allow(clippy::too_many_arguments)]
fn consume_with_dlq(
    executor: &Executor,
    messages: &[Message],
    max_retries: u32,
    pause_timeout: Duration,
    pause_max_timeout: Duration,
    client: Option<&dyn ClientHandle>,
    dlq: &Arc<dyn DlqDispatcher>,
    monitor: &dyn Monitor,
    runtime: &Runtime,
) {
    run_void_hook(executor, monitor, "on_before_consume", |i| {
        i.on_before_consume(messages)
    });
    match call_consume(executor, messages) {
        Ok(()) => {
            if let Some(last) = messages.last() {
                executor.coordinator.mark_processed(last.offset);
            }
            run_void_hook(executor, monitor, "on_after_consume", |i| {
                i.on_after_consume(messages)
            });
        }
        Err(err) => {
            let Some(first) = messages.first() else {
                return;
            };
            let attempt = executor.coordinator.next_retry();
            if attempt <= max_retries {
                let backoff = exponential_backoff(pause_timeout, pause_max_timeout, attempt);
                seek_back_and_pause(executor, first, client, runtime, backoff);
                monitor.notify(MonitorEvent::ConsumerConsumingRetry {
                    topic: first.topic.clone(),
                    partition: first.partition,
                    attempt,
                });
            } else {
                dispatch_to_dlq(executor, messages, &err.to_string(), client, dlq, monitor);
                executor.coordinator.start_batch();
            }
        }
    }
}

fn dispatch_to_dlq(
    executor: &Executor,
    messages: &[Message],
    error: &str,
    client: Option<&dyn ClientHandle>,
    dlq: &Arc<dyn DlqDispatcher>,
    monitor: &dyn Monitor,
) {
    for msg in messages {
        match dlq.dispatch(msg, error) {
            Ok(()) => monitor.notify(MonitorEvent::DeadLetterQueueDispatched {
                topic: msg.topic.clone(),
                partition: msg.partition,
                offset: msg.offset,
            }),
            Err(e) => monitor.notify(MonitorEvent::WorkerProcessError { error: e.to_string() }),
        }
    }
    if let Some(last) = messages.last() {
        executor.coordinator.mark_processed(last.offset);
        if let Some(client) = client {
            let _ = client.seek(last, SeekOffset::Exact(last.offset + 1));
        }
    }
}

/// Exponential backoff between `base` and `max`, doubling per attempt starting at attempt 1.
/// Duplicates `TimeTracker::backoff`'s shape rather than sharing it: this one is keyed off a
/// coordinator's persistent retry counter, not a single operation's attempt count.
fn exponential_backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
    let scaled = base.as_millis().saturating_mul(u128::from(factor));
    let capped = scaled.min(max.as_millis());
    Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX))
}

fn current_unix_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn run_void_hook<F>(executor: &Executor, monitor: &dyn Monitor, hook: &'static str, f: F)
where
    F: FnOnce(&mut dyn ConsumerInstance),
{
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        executor.with_instance(f);
    }));
    if outcome.is_err() {
        let err = WorkerError::Panicked { hook };
        monitor.notify(MonitorEvent::ConsumerHookError {
            hook,
            error: err.to_string(),
        });
    }
}

fn call_consume(executor: &Executor, messages: &[Message]) -> Result<(), WorkerError> {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        executor.with_instance(|inst| inst.on_consume(messages))
    }));
    match outcome {
        Ok(Some(Ok(()))) => Ok(()),
        Ok(Some(Err(e))) => Err(WorkerError::Hook {
            hook: "on_consume",
            source: e,
        }),
        Ok(None) => Ok(()),
        Err(_) => Err(WorkerError::Panicked { hook: "on_consume" }),
    }
}
