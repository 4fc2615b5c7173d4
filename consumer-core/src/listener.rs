//! Drives one subscription group's fetch/dispatch/shutdown loop on its own OS thread (§4.8).
//! Owns its `Client`, `CoordinatorsBuffer`, `ExecutorsBuffer` and `JobsQueue` exclusively;
//! nothing else in the process touches them. Workers draining the `JobsQueue` live in a
//! separate `WorkerPool` the caller wires alongside this `Listener`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::client::{Client, ClientHandle};
use crate::config::SubscriptionGroupConfig;
use crate::coordinator::CoordinatorsBuffer;
use crate::driver::KafkaDriver;
use crate::executor::{ConsumerInstance, ExecutorsBuffer, VirtualGroupId};
use crate::group_coordinator::ConsumerGroupCoordinator;
use crate::jobs::{Job, JobKind, JobsQueue};
use crate::monitor::{Monitor, MonitorEvent};
use crate::partitioner::VirtualPartitioner;
use crate::runtime::Runtime;
use crate::scheduler::Scheduler;

/// How often `Client::ping` is called during the shutdown drain, keeping the native
/// library's rebalance callbacks pumping without doing real work (§4.8).
const SHUTDOWN_PING_INTERVAL: Duration = Duration::from_millis(200);

/// How long to sleep before retrying after an uncaught `batch_poll` error (§4.8 restart loop).
const RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// Builds a fresh [`ConsumerInstance`] for a topic. Called lazily, the first time an
/// executor needs one (or every batch, if `consumer_persistence` is off).
pub type InstanceFactory = Arc<dyn Fn(&str) -> Box<dyn ConsumerInstance> + Send + Sync>;

/// One subscription group's control loop. Construct with [`Listener::new`] and run it on a
/// dedicated thread via [`Listener::run`]; the caller is responsible for spawning that
/// thread and for spawning a [`crate::worker::WorkerPool`] draining `queue`.
pub struct Listener<D: KafkaDriver> {
    id: String,
    group_id: String,
    config: SubscriptionGroupConfig,
    client: Arc<Client<D>>,
    queue: Arc<JobsQueue>,
    executors: ExecutorsBuffer,
    coordinators: CoordinatorsBuffer,
    scheduler: Arc<dyn Scheduler>,
    partitioner: Arc<dyn VirtualPartitioner>,
    monitor: Arc<dyn Monitor>,
    runtime: Runtime,
    group_coordinator: ConsumerGroupCoordinator,
    instance_factory: InstanceFactory,
}

impl<D: KafkaDriver + 'static> Listener<D> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        config: SubscriptionGroupConfig,
        client: Arc<Client<D>>,
        queue: Arc<JobsQueue>,
        scheduler: Arc<dyn Scheduler>,
        partitioner: Arc<dyn VirtualPartitioner>,
        monitor: Arc<dyn Monitor>,
        runtime: Runtime,
        group_coordinator: ConsumerGroupCoordinator,
        instance_factory: InstanceFactory,
    ) -> Self {
        let group_id = config.id.clone();
        Listener {
            id: id.into(),
            group_id,
            config,
            client,
            queue,
            executors: ExecutorsBuffer::new(),
            coordinators: CoordinatorsBuffer::new(),
            scheduler,
            partitioner,
            monitor,
            runtime,
            group_coordinator,
            instance_factory,
        }
    }

    /// Runs until `Runtime::stopping()`, then performs the shutdown sequence and returns.
    /// Meant to be called from its own thread (`std::thread::spawn(move || listener.run())`).
    pub fn run(&self) {
        self.monitor.notify(MonitorEvent::ListenerBeforeFetchLoop {
            group_id: self.group_id.clone(),
        });
        self.monitor.notify(MonitorEvent::AppRunning);

        while !self.runtime.stopping() {
            if let Err(err) = self.fetch_cycle() {
                self.monitor.notify(MonitorEvent::ListenerFetchLoopError {
                    group_id: self.group_id.clone(),
                    error: err.to_string(),
                });
                self.restart_after_error();
            }
        }

        self.shutdown_sequence();
    }

    fn fetch_cycle(&self) -> Result<(), crate::error::ClientError> {
        self.coordinators
            .for_each_resumable(self.runtime.elapsed_ms(), |topic, partition| {
                let _ = self.client.resume(topic, partition);
            });

        self.monitor.notify(MonitorEvent::ListenerFetchLoop {
            group_id: self.group_id.clone(),
        });
        let started = Instant::now();
        let outcome = self.client.batch_poll()?;
        self.monitor.notify(MonitorEvent::ListenerFetchLoopReceived {
            group_id: self.group_id.clone(),
            client_id: self.client.id.clone(),
            messages: outcome.messages.len(),
            elapsed: started.elapsed(),
        });

        if outcome.rebalanced {
            self.handle_revocations(&outcome.rebalance);
        }

        if !self.runtime.quieting() {
            self.dispatch_batches(&outcome.messages);
        }

        self.queue.wait(&self.group_id);

        if self.runtime.quieting() && !self.runtime.quiet() && self.queue.is_empty(&self.group_id) {
            self.runtime.mark_quiet();
            self.monitor.notify(MonitorEvent::AppQuiet);
        }

        Ok(())
    }

    /// Revoke every executor for a partition the rebalance snapshot reports lost, removing
    /// its coordinator too and emitting a revocation job per executor (§4.8 step 3). The
    /// snapshot is the one `batch_poll` captured at the moment it detected the rebalance,
    /// not a fresh read — by the time this runs, the driver may already be mid-poll again
    /// and `clear_rebalance_changed` only resets the `changed` flag, not this data. Once
    /// every revocation job here is built, `clear_revocations` tells the driver it is safe
    /// to drop the accounting.
    fn handle_revocations(&self, snapshot: &crate::rebalance::RebalanceSnapshot) {
        let mut jobs = Vec::new();
        for (topic, partitions) in snapshot.revoked_partitions() {
            for partition in partitions {
                if let Some(coordinator) = self.coordinators.find(&topic, partition) {
                    coordinator.revoke();
                }
                for executor in self.executors.revoke(&topic, partition) {
                    jobs.push(Job::new(&self.group_id, executor, JobKind::Revoked));
                }
                self.coordinators.remove(&topic, partition);
            }
        }
        if !jobs.is_empty() {
            self.scheduler.schedule_revocation(&self.queue, jobs);
            self.queue.wait(&self.group_id);
        }
        self.client.clear_revocations();
    }

    /// For every non-empty batch: fan out via the `VirtualPartitioner`, materialize an
    /// executor per sub-batch, run `on_before_enqueue`, increment the coordinator and emit a
    /// `Consume` job. Partitions assigned but silent this cycle get an `Idle` job instead
    /// (§4.8 step 4).
    fn dispatch_batches(&self, messages: &crate::buffer::MessagesBuffer) {
        let mut jobs = Vec::new();

        for (topic, partition, batch) in messages.iter() {
            let coordinator = self.coordinators.find_or_create(topic, partition);
            for sub_batch in self.partitioner.partition(topic, partition, batch) {
                let executor = self.ensure_executor(
                    topic,
                    partition,
                    sub_batch.virtual_group,
                    coordinator.clone(),
                );
                executor.with_instance(|i| i.on_before_enqueue(&sub_batch.messages));
                coordinator.increment();
                jobs.push(Job::new(
                    &self.group_id,
                    executor,
                    JobKind::Consume {
                        messages: sub_batch.messages,
                    },
                ));
            }
        }

        for executor in self.executors.iter() {
            if messages.batch(&executor.topic, executor.partition).is_none() {
                jobs.push(Job::new(&self.group_id, executor, JobKind::Idle));
            }
        }

        if !jobs.is_empty() {
            self.scheduler.schedule_consumption(&self.queue, jobs);
        }
    }

    /// Create-or-fetch the executor for (topic, partition, virtual group), materializing a
    /// fresh `ConsumerInstance` on first use, or every time if `consumer_persistence` is off.
    fn ensure_executor(
        &self,
        topic: &str,
        partition: i32,
        virtual_group: VirtualGroupId,
        coordinator: Arc<crate::coordinator::Coordinator>,
    ) -> Arc<crate::executor::Executor> {
        let executor = self.executors.find_or_create(
            topic,
            partition,
            &self.group_id,
            virtual_group,
            coordinator,
        );
        if !self.config.consumer_persistence || !executor.has_instance() {
            executor.set_instance((self.instance_factory)(topic));
            let weak: std::sync::Weak<dyn ClientHandle> = Arc::downgrade(&self.client);
            executor.bind_client(weak);
        }
        executor
    }

    /// Uncaught `batch_poll` error: drop pending work for this group, wait for whatever was
    /// already in flight to finish, rebuild the driver, and forget every executor/coordinator
    /// so the next cycle starts clean against the rebuilt assignment (§4.8 restart loop).
    fn restart_after_error(&self) {
        self.queue.clear(&self.group_id);
        self.queue.wait(&self.group_id);
        let _ = self.client.reset();
        self.executors.clear();
        self.coordinators.clear();
        std::thread::sleep(RESTART_BACKOFF);
    }

    /// Stop enqueuing regular work, drain what's left while keeping rebalance callbacks
    /// pumping, notify the consumer group this subscription group is done, wait for every
    /// sibling group to finish too, then close the client (§4.8 shutdown sequence).
    fn shutdown_sequence(&self) {
        self.monitor.notify(MonitorEvent::AppStopping);

        let shutdown_jobs: Vec<Job> = self
            .executors
            .iter()
            .into_iter()
            .filter(|e| e.has_instance())
            .map(|e| Job::new(&self.group_id, e, JobKind::Shutdown))
            .collect();
        self.scheduler.schedule_shutdown(&self.queue, shutdown_jobs);
        self.drain_with_ping();

        let mut guard = self.group_coordinator.unlock_guard(&self.id);
        guard.unlock();
        self.group_coordinator.wait(self.config.shutdown_timeout);

        self.client.ping();
        self.client.stop();
        self.runtime.mark_stopped();
        self.monitor.notify(MonitorEvent::AppStopped);
    }

    fn drain_with_ping(&self) {
        let deadline = Instant::now() + self.config.shutdown_timeout;
        while !self.queue.is_empty(&self.group_id) && Instant::now() < deadline {
            self.client.ping();
            std::thread::sleep(SHUTDOWN_PING_INTERVAL);
        }
    }

    /// Begin graceful shutdown: regular work stops being scheduled once `run`'s loop next
    /// checks `Runtime::stopping()`.
    pub fn stop(&self) {
        self.runtime.begin_stopping();
    }

    /// Begin quiet mode: keep polling and draining in-flight work, schedule no new
    /// consumption. `Runtime::quiet()` becomes true once this group's queue is fully drained.
    pub fn quiesce(&self) {
        self.runtime.begin_quieting();
        self.monitor.notify(MonitorEvent::AppQuieting);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopicConfig;
    use crate::dlq::NoopDlqDispatcher;
    use crate::group_coordinator::ConsumerGroupCoordinator;
    use crate::monitor::TracingMonitor;
    use crate::partitioner::IdentityPartitioner;
    use crate::scheduler::FifoScheduler;
    use crate::testing::FakeDriver;
    use crate::worker::StrategyTable;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingInstance {
        consumed: Arc<AtomicU32>,
        idle: Arc<AtomicU32>,
    }

    impl ConsumerInstance for CountingInstance {
        fn on_consume(&mut self, messages: &[crate::buffer::Message]) -> anyhow::Result<()> {
            self.consumed.fetch_add(messages.len() as u32, Ordering::SeqCst);
            Ok(())
        }

        fn on_idle(&mut self) {
            self.idle.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> SubscriptionGroupConfig {
        SubscriptionGroupConfig::try_new(
            "g1",
            vec![TopicConfig::new("t")],
            BTreeMap::new(),
            "test-client",
            1,
            Duration::from_millis(50),
            100,
            Duration::from_millis(100),
            Duration::from_millis(1000),
            true,
            Duration::from_millis(1000),
            true,
        )
        .unwrap()
    }

    fn listener(
        driver: FakeDriver,
        consumed: Arc<AtomicU32>,
        idle: Arc<AtomicU32>,
    ) -> (Listener<FakeDriver>, Arc<JobsQueue>, Arc<StrategyTable>) {
        let runtime = Runtime::for_test();
        let monitor: Arc<dyn Monitor> = Arc::new(TracingMonitor::new());
        let cfg = config();
        let client = Arc::new(
            Client::new(
                "client-1",
                driver,
                || Ok(FakeDriver::new()),
                cfg.clone(),
                monitor.clone(),
                runtime.clone(),
            )
            .unwrap(),
        );
        let queue = Arc::new(JobsQueue::new());
        let mut strategies = StrategyTable::new();
        strategies.insert("t".to_string(), cfg.topic("t").unwrap().strategy());
        let strategies = Arc::new(strategies);
        let factory: InstanceFactory = Arc::new(move |_topic| {
            Box::new(CountingInstance {
                consumed: consumed.clone(),
                idle: idle.clone(),
            })
        });
        let listener = Listener::new(
            "listener-1",
            cfg,
            client,
            queue.clone(),
            Arc::new(FifoScheduler::new()),
            Arc::new(IdentityPartitioner::new()),
            monitor,
            runtime,
            ConsumerGroupCoordinator::new(1),
            factory,
        );
        (listener, queue, strategies)
    }

    #[test]
    fn fetch_cycle_dispatches_a_consume_job_and_drains_it() {
        let driver = FakeDriver::new();
        driver.enqueue_record("t", 0, 0);
        driver.enqueue_record("t", 0, 1);
        let consumed = Arc::new(AtomicU32::new(0));
        let idle = Arc::new(AtomicU32::new(0));
        let (listener, queue, strategies) = listener(driver, consumed.clone(), idle);

        let pool = crate::worker::WorkerPool::spawn(
            1,
            queue.clone(),
            strategies,
            Arc::new(NoopDlqDispatcher::new()),
            Arc::new(TracingMonitor::new()),
            Runtime::for_test(),
        );
        listener.fetch_cycle().unwrap();
        assert_eq!(consumed.load(Ordering::SeqCst), 2);
        queue.close();
        pool.join();
    }

    #[test]
    fn revoked_partition_drops_its_executor() {
        let driver = FakeDriver::new();
        // First cycle materializes an executor for (t, 0) with no rebalance in play.
        driver.enqueue_record("t", 0, 0);
        let driver_handle = driver.driver_handle();
        let consumed = Arc::new(AtomicU32::new(0));
        let idle = Arc::new(AtomicU32::new(0));
        let (listener, queue, strategies) = listener(driver, consumed, idle);

        let pool = crate::worker::WorkerPool::spawn(
            1,
            queue.clone(),
            strategies,
            Arc::new(NoopDlqDispatcher::new()),
            Arc::new(TracingMonitor::new()),
            Runtime::for_test(),
        );
        listener.fetch_cycle().unwrap();
        assert_eq!(listener.executors.find_all("t", 0).len(), 1);

        // Second cycle: the driver reports partition 0 revoked mid-poll. The executor
        // created above must be torn down even though the revocation is only discovered
        // after `batch_poll` has already returned.
        driver_handle.enqueue_record("t", 0, 1);
        driver_handle.trigger_revoke("t", &[0]);
        listener.fetch_cycle().unwrap();
        assert_eq!(listener.executors.find_all("t", 0).len(), 0);

        queue.close();
        pool.join();
    }

    #[test]
    fn shutdown_sequence_closes_client_and_marks_runtime_stopped() {
        let driver = FakeDriver::new();
        let closes = driver.close_count_handle();
        let consumed = Arc::new(AtomicU32::new(0));
        let idle = Arc::new(AtomicU32::new(0));
        let (listener, queue, strategies) = listener(driver, consumed, idle);
        let runtime = listener.runtime.clone();

        let pool = crate::worker::WorkerPool::spawn(
            1,
            queue.clone(),
            strategies,
            Arc::new(NoopDlqDispatcher::new()),
            Arc::new(TracingMonitor::new()),
            runtime.clone(),
        );
        listener.shutdown_sequence();
        assert!(runtime.stopped());
        assert_eq!(closes.get(), 1);
        queue.close();
        pool.join();
    }

    #[test]
    fn idle_job_runs_for_assigned_partition_with_no_messages() {
        let driver = FakeDriver::new();
        // First cycle materializes an executor for (t, 0) via one message...
        driver.enqueue_record("t", 0, 0);
        let consumed = Arc::new(AtomicU32::new(0));
        let idle = Arc::new(AtomicU32::new(0));
        let (listener, queue, strategies) = listener(driver, consumed, idle.clone());

        let pool = crate::worker::WorkerPool::spawn(
            1,
            queue.clone(),
            strategies,
            Arc::new(NoopDlqDispatcher::new()),
            Arc::new(TracingMonitor::new()),
            Runtime::for_test(),
        );
        listener.fetch_cycle().unwrap();
        // ...then a second, empty cycle should call on_idle for that same executor.
        listener.fetch_cycle().unwrap();
        assert_eq!(idle.load(Ordering::SeqCst), 1);
        queue.close();
        pool.join();
    }
}
