//! Binds a user-supplied [`ConsumerInstance`] to one (topic, partition, virtual-group),
//! and dispatches its ordered lifecycle hooks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::Result as AnyResult;

use crate::buffer::Message;
use crate::client::ClientHandle;
use crate::coordinator::Coordinator;

/// Capability set a user consumer type implements. One instance is bound to one (topic,
/// partition, virtual-group) by an [`Executor`]; hooks run in the order listed in §4.5.
/// Default bodies make every hook optional except `on_consume`.
pub trait ConsumerInstance: Send {
    /// Runs on the listener thread, before the job is handed to a worker. Cheap, synchronous
    /// bookkeeping only (e.g. snapshotting state needed later); never blocks on I/O.
    fn on_before_enqueue(&mut self, _messages: &[Message]) {}

    fn on_before_consume(&mut self, _messages: &[Message]) {}

    /// The user's actual message-processing hook. Errors propagate to the executor, which
    /// applies the configured retry/DLQ strategy.
    fn on_consume(&mut self, messages: &[Message]) -> AnyResult<()>;

    fn on_after_consume(&mut self, _messages: &[Message]) {}

    /// Invoked instead of `on_consume` when a poll cycle produced an empty batch for this
    /// partition.
    fn on_idle(&mut self) {}

    /// Invoked when this executor's partition was revoked. Only called if an instance was
    /// ever materialized.
    fn on_revoked(&mut self) {}

    /// Invoked during shutdown. Only called if an instance was ever materialized.
    fn on_shutdown(&mut self) {}
}

/// Composable per-topic behavior selected once per topic descriptor (§4.5). Implemented as
/// a sum type rather than inheritance: every arm wraps a user [`ConsumerInstance`] and adds
/// one cross-cutting concern around its hooks.
pub enum TopicStrategy {
    /// No extra behavior; hooks pass straight through.
    Plain,
    /// Pause the coordinator after `limit` deliveries within `interval`.
    Throttling { limit: u32, interval: Duration },
    /// Drop messages older than `ttl` before `on_consume`.
    Expiring { ttl: Duration },
    /// Pause until each message's per-message delay elapses.
    Delaying { delay: Duration },
    /// Wrap `on_consume` errors with retry-then-dispatch to a DLQ. Retries pause the
    /// partition with exponentially-backed-off durations between `pause_timeout` and
    /// `pause_max_timeout`.
    Dlq {
        max_retries: u32,
        pause_timeout: Duration,
        pause_max_timeout: Duration,
    },
    /// Exempt the executor from the default worker stall/timeout warning.
    LongRunningJob,
}

impl TopicStrategy {
    pub fn is_long_running(&self) -> bool {
        matches!(self, TopicStrategy::LongRunningJob)
    }
}

pub type ExecutorId = String;
pub type VirtualGroupId = Option<String>;

/// Per-(topic, partition, virtual-group) consumer instance lifecycle. If
/// `consumer_persistence` is enabled, the instance is cached across batches (kept inside
/// `instance`); otherwise the executor's owner rebuilds a new `Executor` per batch.
pub struct Executor {
    pub id: ExecutorId,
    pub topic: String,
    pub partition: i32,
    pub group_id: String,
    pub virtual_group: VirtualGroupId,
    pub coordinator: Arc<Coordinator>,
    client: Mutex<Option<Weak<dyn ClientHandle>>>,
    instance: Mutex<Option<Box<dyn ConsumerInstance>>>,
}

impl Executor {
    pub fn new(
        topic: String,
        partition: i32,
        group_id: String,
        virtual_group: VirtualGroupId,
        coordinator: Arc<Coordinator>,
    ) -> Self {
        let id = match &virtual_group {
            Some(vg) => format!("{topic}:{partition}:{vg}"),
            None => format!("{topic}:{partition}"),
        };
        Executor {
            id,
            topic,
            partition,
            group_id,
            virtual_group,
            coordinator,
            client: Mutex::new(None),
            instance: Mutex::new(None),
        }
    }

    pub fn bind_client(&self, client: Weak<dyn ClientHandle>) {
        *self.client.lock().unwrap_or_else(|p| p.into_inner()) = Some(client);
    }

    pub fn client(&self) -> Option<Arc<dyn ClientHandle>> {
        self.client
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// True once a consumer instance has been materialized at least once (gates
    /// `on_revoked`/`on_shutdown`, per §4.5).
    pub fn has_instance(&self) -> bool {
        self.instance
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Install or replace the cached instance. Called lazily on first batch, or always when
    /// `consumer_persistence` is off.
    pub fn set_instance(&self, instance: Box<dyn ConsumerInstance>) {
        *self.instance.lock().unwrap_or_else(|p| p.into_inner()) = Some(instance);
    }

    pub fn clear_instance(&self) {
        *self.instance.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    pub fn with_instance<R>(&self, f: impl FnOnce(&mut dyn ConsumerInstance) -> R) -> Option<R> {
        let mut guard = self.instance.lock().unwrap_or_else(|p| p.into_inner());
        guard.as_deref_mut().map(f)
    }
}

/// Owns every live [`Executor`] for a Listener.
#[derive(Default)]
pub struct ExecutorsBuffer {
    executors: Mutex<HashMap<(String, i32, VirtualGroupId), Arc<Executor>>>,
}

impl ExecutorsBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn find_or_create(
        &self,
        topic: &str,
        partition: i32,
        group_id: &str,
        virtual_group: VirtualGroupId,
        coordinator: Arc<Coordinator>,
    ) -> Arc<Executor> {
        let key = (topic.to_string(), partition, virtual_group.clone());
        let mut executors = self.executors.lock().unwrap_or_else(|p| p.into_inner());
        executors
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Executor::new(
                    topic.to_string(),
                    partition,
                    group_id.to_string(),
                    virtual_group,
                    coordinator,
                ))
            })
            .clone()
    }

    pub fn find_all(&self, topic: &str, partition: i32) -> Vec<Arc<Executor>> {
        self.executors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|((t, p, _), _)| t == topic && *p == partition)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Remove every executor for a revoked partition, returning them so the caller can
    /// build revocation jobs before they're dropped.
    pub fn revoke(&self, topic: &str, partition: i32) -> Vec<Arc<Executor>> {
        let mut executors = self.executors.lock().unwrap_or_else(|p| p.into_inner());
        let keys: Vec<_> = executors
            .keys()
            .filter(|(t, p, _)| t == topic && *p == partition)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|k| executors.remove(&k))
            .collect()
    }

    pub fn iter(&self) -> Vec<Arc<Executor>> {
        self.executors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.executors.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}
