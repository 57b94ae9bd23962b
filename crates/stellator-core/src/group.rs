//! TaskGroup: batched completion tracking
//!
//! Workers hand finished grouped tasks to the group instead of completing
//! them. The group's owner drains them with [`TaskGroup::update`] (or
//! blocks in [`TaskGroup::wait_for_all`]), so completion callbacks of a
//! group always run on the draining thread.
//!
//! `completed <= added` holds at all times: `completed` is bumped only for
//! tasks that were handed back, and every handed-back task was added first.

use crate::sync::lock;
use crate::task::Task;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Minimum time between opportunistic drains, and the wait slice of
/// [`TaskGroup::wait_for_all`].
pub const UPDATE_INTERVAL: Duration = Duration::from_millis(50);

type NotifyFn = Box<dyn Fn() + Send + Sync>;

pub struct TaskGroup {
    added: AtomicUsize,
    completed: AtomicUsize,
    queue: Mutex<Vec<Box<Task>>>,
    cond: Condvar,
    notify: Option<NotifyFn>,
    owner: ThreadId,
    last_update: Mutex<Instant>,
}

impl TaskGroup {
    /// Create a group owned by the calling thread.
    pub fn new() -> Arc<TaskGroup> {
        Arc::new(Self::build(None))
    }

    /// Create a group whose `notify` runs every time a task is handed back.
    ///
    /// `notify` runs on the worker thread that finished the task.
    pub fn with_notify<F>(notify: F) -> Arc<TaskGroup>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(Self::build(Some(Box::new(notify))))
    }

    fn build(notify: Option<NotifyFn>) -> TaskGroup {
        TaskGroup {
            added: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            queue: Mutex::new(Vec::new()),
            cond: Condvar::new(),
            notify,
            owner: thread::current().id(),
            last_update: Mutex::new(Instant::now()),
        }
    }

    /// Account for a task entering the queue.
    ///
    /// On the owning thread this also drains finished tasks when the last
    /// drain is older than [`UPDATE_INTERVAL`].
    pub fn on_added(&self) {
        self.added.fetch_add(1, Ordering::AcqRel);
        if thread::current().id() == self.owner {
            let stale = lock(&self.last_update).elapsed() > UPDATE_INTERVAL;
            if stale {
                self.update();
            }
        }
    }

    /// Hand a finished (or cancelled) task back to the group.
    pub fn on_performed(&self, task: Box<Task>) {
        lock(&self.queue).push(task);
        self.cond.notify_all();
        if let Some(notify) = &self.notify {
            notify();
        }
    }

    /// Complete every task handed back so far.
    ///
    /// Returns the number of tasks completed by this call.
    pub fn update(&self) -> usize {
        let finished = std::mem::take(&mut *lock(&self.queue));
        *lock(&self.last_update) = Instant::now();

        let n = finished.len();
        for mut task in finished {
            task.complete();
            self.completed.fetch_add(1, Ordering::AcqRel);
        }
        n
    }

    /// Block until every added task has been completed.
    ///
    /// Must not be called from a worker thread while tasks of this group
    /// are still queued behind it.
    pub fn wait_for_all(&self) {
        self.update();
        while !self.is_complete() {
            {
                let queue = lock(&self.queue);
                if queue.is_empty() {
                    let _ = self
                        .cond
                        .wait_timeout(queue, UPDATE_INTERVAL)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
            self.update();
        }
    }

    #[inline]
    pub fn added(&self) -> usize {
        self.added.load(Ordering::Acquire)
    }

    #[inline]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    /// `added == completed`
    pub fn is_complete(&self) -> bool {
        // completed first: it can only grow toward added
        let completed = self.completed();
        completed == self.added()
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }
}

impl fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGroup")
            .field("added", &self.added())
            .field("completed", &self.completed())
            .field("owner", &self.owner)
            .finish()
    }
}
