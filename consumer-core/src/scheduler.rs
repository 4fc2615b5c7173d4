//! Policy for handing a batch of [`Job`]s to the [`JobsQueue`] (§4.7). The default
//! `FifoScheduler` simply pushes in submission order; any other implementation must still
//! preserve per-partition submission order, since that's what backs the revocation-before-
//! consumption and per-partition offset-ordering invariants upstream.

use crate::jobs::{Job, JobsQueue};

/// Three entry points, one per job kind the Listener ever schedules in bulk. Split out
/// (rather than one `schedule(jobs)`) so an implementation can apply different fairness
/// policies to consumption vs. revocation vs. shutdown batches.
pub trait Scheduler: Send + Sync {
    fn schedule_consumption(&self, queue: &JobsQueue, jobs: Vec<Job>);
    fn schedule_revocation(&self, queue: &JobsQueue, jobs: Vec<Job>);
    fn schedule_shutdown(&self, queue: &JobsQueue, jobs: Vec<Job>);
}

/// Pushes every job in the order it was built. Good enough as long as `JobsQueue::pop`
/// itself doesn't starve any one subscription group, which it doesn't (round-robins across
/// groups with pending work).
#[derive(Default)]
pub struct FifoScheduler;

impl FifoScheduler {
    pub fn new() -> Self {
        Self
    }

    fn push_all(queue: &JobsQueue, jobs: Vec<Job>) {
        for job in jobs {
            queue.push(job);
        }
    }
}

impl Scheduler for FifoScheduler {
    fn schedule_consumption(&self, queue: &JobsQueue, jobs: Vec<Job>) {
        Self::push_all(queue, jobs);
    }

    fn schedule_revocation(&self, queue: &JobsQueue, jobs: Vec<Job>) {
        Self::push_all(queue, jobs);
    }

    fn schedule_shutdown(&self, queue: &JobsQueue, jobs: Vec<Job>) {
        Self::push_all(queue, jobs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Coordinator;
    use crate::executor::Executor;
    use crate::jobs::JobKind;
    use std::sync::Arc;

    fn executor(topic: &str, partition: i32) -> Arc<Executor> {
        Arc::new(Executor::new(
            topic.to_string(),
            partition,
            "g1".to_string(),
            None,
            Arc::new(Coordinator::new(topic.to_string(), partition)),
        ))
    }

    #[test]
    fn schedule_consumption_preserves_submission_order_per_partition() {
        let queue = JobsQueue::new();
        let scheduler = FifoScheduler::new();
        let exec = executor("t", 0);
        let jobs = vec![
            Job::new("g1", exec.clone(), JobKind::Consume { messages: vec![] }),
            Job::new("g1", exec.clone(), JobKind::Idle),
        ];
        scheduler.schedule_consumption(&queue, jobs);
        let first = queue.pop().unwrap();
        assert!(matches!(first.kind, JobKind::Consume { .. }));
        let second = queue.pop().unwrap();
        assert!(matches!(second.kind, JobKind::Idle));
    }
}
