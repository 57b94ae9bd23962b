//! Task: a unit of deferred work
//!
//! A task is an ordered list of execute callbacks followed by an ordered
//! list of completion callbacks. It is populated by its creator, handed to
//! the connection queue, executed exactly once on whichever worker dequeues
//! it, and dropped right after its completion callbacks ran.
//!
//! Tasks that belong to a [`TaskGroup`] do not complete on the worker: the
//! group collects them and runs their completion callbacks during
//! [`TaskGroup::update`], usually on the thread that waits for the group.

use crate::group::TaskGroup;
use crate::server::Server;
use crate::tls;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Execute callback. The task's success is the AND of every result.
pub type ExecuteFn = Box<dyn FnOnce(&Task) -> bool + Send>;

/// Completion callback. Observe the outcome via [`Task::is_successful`].
pub type CompleteFn = Box<dyn FnOnce(&Task) + Send>;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Unique task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Priority level for tasks
///
/// `Critical` tasks always enter the queue's urgent lane; everything else
/// is FIFO unless pushed with `perform_first`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum Priority {
    /// Jumps ahead of regular tasks
    Critical = 0,
    High = 1,
    /// Default for user tasks
    #[default]
    Normal = 2,
    /// Background work, usually submitted as a followed task
    Low = 3,
}

/// A unit of deferred work.
pub struct Task {
    id: TaskId,
    execute: Vec<ExecuteFn>,
    complete: Vec<CompleteFn>,
    scheduled: Option<Instant>,
    priority: Priority,
    successful: bool,
    group: Option<Arc<TaskGroup>>,
    server: Option<Server>,
}

impl Task {
    /// Create an empty task.
    pub fn new() -> Box<Task> {
        Box::new(Task {
            id: TaskId::next(),
            execute: Vec::new(),
            complete: Vec::new(),
            scheduled: None,
            priority: Priority::Normal,
            successful: false,
            group: None,
            server: None,
        })
    }

    /// Create a task and let `init` populate it before anyone can run it.
    ///
    /// ```ignore
    /// let task = Task::prepare(|t| {
    ///     t.add_execute_fn(|_| do_work());
    ///     t.add_complete_fn(|t| log_result(t.is_successful()));
    /// });
    /// root.perform_task(&server, task, false)?;
    /// ```
    pub fn prepare<F>(init: F) -> Box<Task>
    where
        F: FnOnce(&mut Task),
    {
        let mut task = Task::new();
        init(&mut task);
        task
    }

    /// Like [`Task::prepare`], with the task owned by `group`.
    pub fn prepare_in_group<F>(group: &Arc<TaskGroup>, init: F) -> Box<Task>
    where
        F: FnOnce(&mut Task),
    {
        let mut task = Task::new();
        task.group = Some(Arc::clone(group));
        init(&mut task);
        task
    }

    pub fn add_execute_fn<F>(&mut self, f: F)
    where
        F: FnOnce(&Task) -> bool + Send + 'static,
    {
        self.execute.push(Box::new(f));
    }

    pub fn add_complete_fn<F>(&mut self, f: F)
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        self.complete.push(Box::new(f));
    }

    /// Execute the task on the current thread.
    ///
    /// Every execute callback runs, in order, even after one returned
    /// `false`. Completion callbacks run here only for ungrouped tasks.
    pub fn run(&mut self) {
        let _ctx = tls::enter(self);
        let execute = std::mem::take(&mut self.execute);
        let mut ok = true;
        for f in execute {
            ok = f(self) && ok;
        }
        self.successful = ok;
        if self.group.is_none() {
            self.complete();
        }
    }

    /// Mark the task as failed without executing it.
    ///
    /// Used for tasks that can no longer reach a worker. Grouped tasks
    /// still need to be handed to their group so the group can count them.
    pub fn cancel(&mut self) {
        self.execute.clear();
        self.successful = false;
        if self.group.is_none() {
            self.complete();
        }
    }

    /// Run the completion callbacks. Each runs at most once.
    pub(crate) fn complete(&mut self) {
        let _ctx = tls::enter(self);
        for f in std::mem::take(&mut self.complete) {
            f(self);
        }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn is_successful(&self) -> bool {
        self.successful
    }

    #[inline]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    /// When the task becomes due. `None` means immediately.
    #[inline]
    pub fn scheduled(&self) -> Option<Instant> {
        self.scheduled
    }

    pub fn set_scheduled(&mut self, at: Instant) {
        self.scheduled = Some(at);
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.scheduled.map_or(true, |at| at <= now)
    }

    #[inline]
    pub fn group(&self) -> Option<&Arc<TaskGroup>> {
        self.group.as_ref()
    }

    #[inline]
    pub fn server(&self) -> Option<&Server> {
        self.server.as_ref()
    }

    pub fn set_server(&mut self, server: Server) {
        self.server = Some(server);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("execute", &self.execute.len())
            .field("complete", &self.complete.len())
            .field("scheduled", &self.scheduled)
            .field("priority", &self.priority)
            .field("successful", &self.successful)
            .field("grouped", &self.group.is_some())
            .field("server", &self.server.as_ref().map(Server::name))
            .finish()
    }
}
