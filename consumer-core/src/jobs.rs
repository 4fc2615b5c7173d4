//! Bounded multi-queue work distribution: one FIFO per subscription group, a single
//! condvar, and pending/in-flight counters so `wait` tells the Listener exactly when its
//! group has fully drained.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use uuid::Uuid;

use crate::buffer::Message;
use crate::executor::Executor;

pub type GroupId = String;
pub type JobId = Uuid;

/// What kind of lifecycle work a [`Job`] carries.
#[derive(Debug, Clone)]
pub enum JobKind {
    Consume { messages: Vec<Message> },
    Idle,
    Revoked,
    Shutdown,
}

/// One unit of work handed to a worker thread. Belongs to exactly one executor.
#[derive(Clone)]
pub struct Job {
    pub id: JobId,
    pub group_id: GroupId,
    pub executor: Arc<Executor>,
    pub kind: JobKind,
}

impl Job {
    pub fn new(group_id: impl Into<String>, executor: Arc<Executor>, kind: JobKind) -> Self {
        Job {
            id: Uuid::new_v4(),
            group_id: group_id.into(),
            executor,
            kind,
        }
    }
}

#[derive(Default)]
struct GroupQueue {
    pending: VecDeque<Job>,
    in_flight: usize,
}

impl GroupQueue {
    fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.in_flight == 0
    }
}

struct State {
    groups: HashMap<GroupId, GroupQueue>,
    closed: bool,
}

/// Per-subscription-group FIFO queues behind one mutex and one condvar. `push` is
/// non-blocking; backpressure is the Listener always waiting for its group to drain before
/// the next fetch cycle (§4.6).
pub struct JobsQueue {
    state: Mutex<State>,
    condvar: Condvar,
}

impl JobsQueue {
    pub fn new() -> Self {
        JobsQueue {
            state: Mutex::new(State {
                groups: HashMap::new(),
                closed: false,
            }),
            condvar: Condvar::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Enqueue a job for its group. Counts toward in-flight immediately, since a pending
    /// job is not yet "drained" from the group's perspective.
    pub fn push(&self, job: Job) {
        let mut state = self.lock();
        let group = state.groups.entry(job.group_id.clone()).or_default();
        group.in_flight += 1;
        group.pending.push_back(job);
        self.condvar.notify_all();
    }

    /// Pop the next job for any group, blocking until one is available or the queue is
    /// closed (in which case `None` is returned). Workers are not scoped to one group; any
    /// worker can service any group's job.
    pub fn pop(&self) -> Option<Job> {
        let mut state = self.lock();
        loop {
            if let Some((_, group)) = state
                .groups
                .iter_mut()
                .find(|(_, g)| !g.pending.is_empty())
            {
                return group.pending.pop_front();
            }
            if state.closed {
                return None;
            }
            state = self
                .condvar
                .wait(state)
                .unwrap_or_else(|p| p.into_inner());
        }
    }

    /// Mark a job (identified by group + id, though only the group count is tracked)
    /// complete, decrementing in-flight for its group.
    pub fn complete(&self, group_id: &str) {
        let mut state = self.lock();
        if let Some(group) = state.groups.get_mut(group_id) {
            group.in_flight = group.in_flight.saturating_sub(1);
        }
        self.condvar.notify_all();
    }

    /// Block until the given group has no pending and no in-flight jobs.
    pub fn wait(&self, group_id: &str) {
        let mut state = self.lock();
        loop {
            let drained = state
                .groups
                .get(group_id)
                .map_or(true, GroupQueue::is_drained);
            if drained {
                return;
            }
            state = self
                .condvar
                .wait(state)
                .unwrap_or_else(|p| p.into_inner());
        }
    }

    pub fn is_empty(&self, group_id: &str) -> bool {
        self.lock()
            .groups
            .get(group_id)
            .map_or(true, GroupQueue::is_drained)
    }

    /// Drop pending jobs for a group. Each dropped job was counted into `in_flight` at
    /// `push` time (it never runs, so `complete` will never be called for it), so
    /// `in_flight` is decremented here to match — only jobs already handed to a worker
    /// remain counted.
    pub fn clear(&self, group_id: &str) {
        let mut state = self.lock();
        if let Some(group) = state.groups.get_mut(group_id) {
            group.in_flight = group.in_flight.saturating_sub(group.pending.len());
            group.pending.clear();
        }
        self.condvar.notify_all();
    }

    /// Wake every blocked `pop` with no further jobs; used during process shutdown.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.condvar.notify_all();
    }
}

impl Default for JobsQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Coordinator;
    use crate::executor::Executor;
    use std::sync::Arc;

    fn dummy_executor(group: &str) -> Arc<Executor> {
        Arc::new(Executor::new(
            "t".to_string(),
            0,
            group.to_string(),
            None,
            Arc::new(Coordinator::new("t".to_string(), 0)),
        ))
    }

    #[test]
    fn wait_blocks_until_drained() {
        let queue = Arc::new(JobsQueue::new());
        let exec = dummy_executor("g1");
        queue.push(Job::new("g1", exec.clone(), JobKind::Idle));
        assert!(!queue.is_empty("g1"));

        let queue2 = queue.clone();
        let handle = std::thread::spawn(move || {
            queue2.wait("g1");
        });

        // Worker picks up the job and completes it.
        let job = queue.pop().unwrap();
        assert_eq!(job.group_id, "g1");
        queue.complete("g1");

        handle.join().unwrap();
        assert!(queue.is_empty("g1"));
    }

    #[test]
    fn clear_preserves_in_flight_count() {
        let queue = JobsQueue::new();
        let exec = dummy_executor("g1");
        queue.push(Job::new("g1", exec.clone(), JobKind::Idle));
        queue.push(Job::new("g1", exec.clone(), JobKind::Idle));
        let job = queue.pop().unwrap(); // first one now in-flight
        queue.clear("g1"); // drops the second, still-pending job
        assert!(!queue.is_empty("g1"), "in-flight job must still count");
        queue.complete("g1");
        assert!(queue.is_empty("g1"));
        drop(job);
    }

    #[test]
    fn pop_returns_none_after_close_with_nothing_pending() {
        let queue = JobsQueue::new();
        queue.close();
        assert!(queue.pop().is_none());
    }
}
