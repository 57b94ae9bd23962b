//! ConnectionQueue: the shared task queue and the worker pool
//!
//! Any thread may push tasks; only workers pop them. Each push posts one
//! permit to a semaphore eventfd that every worker polls level-triggered
//! with `EPOLLEXCLUSIVE`; a worker that takes a permit pops exactly one
//! task. Permits therefore always match queued tasks.
//!
//! Shutdown writes one byte to a pipe every worker polls edge-triggered,
//! so each worker sees it exactly once on its next wait.

use crate::config::RootConfig;
use crate::handler::ConnectionHandler;
use crate::sys::{EventFd, Pipe};
use crate::worker::ConnectionWorker;
use crossbeam_queue::SegQueue;
use socket2::Socket;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use stellator_core::sync::lock;
use stellator_core::{Error, Priority, Result, Task};
use tracing::{debug, error, info};

pub struct ConnectionQueue {
    tasks: SegQueue<Box<Task>>,
    urgent: SegQueue<Box<Task>>,
    /// Pushed and not yet released
    outstanding: AtomicUsize,
    finalized: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    spawned: AtomicUsize,
    wake: EventFd,
    cancel: Pipe,
    listener: Socket,
    handler: Arc<dyn ConnectionHandler>,
    config: RootConfig,
}

impl ConnectionQueue {
    /// Create the queue around a bound listening socket. Creates the
    /// eventfd and the cancellation pipe; no thread is started yet.
    pub fn new(
        listener: Socket,
        handler: Arc<dyn ConnectionHandler>,
        config: &RootConfig,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            tasks: SegQueue::new(),
            urgent: SegQueue::new(),
            outstanding: AtomicUsize::new(0),
            finalized: AtomicBool::new(false),
            workers: Mutex::new(Vec::with_capacity(config.num_workers)),
            spawned: AtomicUsize::new(0),
            wake: EventFd::semaphore()?,
            cancel: Pipe::new()?,
            listener,
            handler,
            config: config.clone(),
        }))
    }

    /// Spawn `num_workers` worker threads.
    ///
    /// If any worker fails to start, the ones already running are stopped
    /// and the error is returned.
    pub fn run(self: &Arc<Self>) -> Result<()> {
        for index in 0..self.config.num_workers {
            if let Err(e) = self.spawn_worker(index) {
                error!(worker = index, error = %e, "failed to start worker");
                self.finalize();
                return Err(e);
            }
        }
        info!(workers = self.config.num_workers, "connection queue running");
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>, index: usize) -> Result<()> {
        let worker = ConnectionWorker::new(index, Arc::clone(self))?;
        let handle = thread::Builder::new()
            .name(format!("stellator-worker-{}", index))
            .spawn(move || worker.run())
            .map_err(Error::Spawn)?;
        lock(&self.workers).push(handle);
        self.spawned.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Queue a task for any worker.
    ///
    /// `first` (or `Priority::Critical`) puts it ahead of regular tasks.
    /// After `finalize` the task is cancelled instead.
    pub fn push_task(&self, task: Box<Task>, first: bool) {
        if let Some(group) = task.group() {
            group.on_added();
        }
        if self.is_finalized() {
            self.cancel_task(task);
            return;
        }

        self.outstanding.fetch_add(1, Ordering::AcqRel);
        if first || task.priority() == Priority::Critical {
            self.urgent.push(task);
        } else {
            self.tasks.push(task);
        }
        if let Err(e) = self.wake.post() {
            error!(error = %e, "failed to post task wakeup");
        }

        // lost a race with finalize: nobody will pop it
        if self.is_finalized() {
            self.cancel_pending();
        }
    }

    /// Non-blocking dequeue, urgent lane first.
    pub fn pop_task(&self) -> Option<Box<Task>> {
        self.urgent.pop().or_else(|| self.tasks.pop())
    }

    /// Account for a finished task and hand it to its group, if any.
    pub fn release_task(&self, task: Box<Task>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        match task.group().cloned() {
            Some(group) => group.on_performed(task),
            None => drop(task),
        }
    }

    fn cancel_task(&self, mut task: Box<Task>) {
        debug!(task = %task.id(), "cancelling task");
        task.cancel();
        if let Some(group) = task.group().cloned() {
            group.on_performed(task);
        }
    }

    fn cancel_pending(&self) {
        while let Some(task) = self.pop_task() {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            self.cancel_task(task);
        }
    }

    /// Stop and join every worker, then cancel tasks left in the queue.
    ///
    /// Idempotent; later calls return immediately. Called from a task, the
    /// calling worker is not joined; it exits once the task returns.
    pub fn finalize(&self) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.cancel.signal() {
            error!(error = %e, "failed to signal workers");
        }

        let handles = std::mem::take(&mut *lock(&self.workers));
        let count = handles.len();
        let me = thread::current().id();
        for handle in handles {
            let name = handle.thread().name().map(str::to_owned);
            if handle.thread().id() == me {
                debug!(worker = ?name, "finalize called from worker, not joining it");
                continue;
            }
            if handle.join().is_err() {
                error!(worker = ?name, "worker panicked");
            }
        }
        self.cancel_pending();
        info!(workers = count, "connection queue finalized");
    }

    /// Tasks pushed and not yet released.
    pub fn has_tasks(&self) -> bool {
        self.outstanding.load(Ordering::Acquire) > 0
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn workers_count(&self) -> usize {
        self.spawned.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    // Accessors for workers

    pub(crate) fn listener(&self) -> &Socket {
        &self.listener
    }

    pub(crate) fn wake(&self) -> &EventFd {
        &self.wake
    }

    pub(crate) fn cancel_fd(&self) -> std::os::fd::RawFd {
        self.cancel.read_fd()
    }

    pub(crate) fn handler(&self) -> &dyn ConnectionHandler {
        &*self.handler
    }

    pub(crate) fn config(&self) -> &RootConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::EchoHandler;
    use crate::listener;
    use std::collections::HashSet;
    use std::time::{Duration, Instant};
    use stellator_core::TaskGroup;

    fn start(workers: usize) -> Arc<ConnectionQueue> {
        let config = RootConfig::new().port(0).num_workers(workers);
        let listener = listener::bind(&config).unwrap();
        let queue = ConnectionQueue::new(listener, Arc::new(EchoHandler), &config).unwrap();
        queue.run().unwrap();
        queue
    }

    #[test]
    fn test_thousand_tasks_two_workers() {
        let queue = start(2);
        assert_eq!(queue.workers_count(), 2);

        let counter = Arc::new(AtomicUsize::new(0));
        let group = TaskGroup::new();
        for _ in 0..1000 {
            let counter = counter.clone();
            queue.push_task(
                Task::prepare_in_group(&group, move |t| {
                    t.add_execute_fn(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        true
                    });
                }),
                false,
            );
        }
        group.wait_for_all();

        assert_eq!(counter.load(Ordering::SeqCst), 1000);
        assert_eq!(group.completed(), 1000);
        assert!(!queue.has_tasks());
        queue.finalize();
    }

    #[test]
    fn test_concurrent_producers_exactly_once() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 250;

        let queue = start(3);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = queue.clone();
                let seen = seen.clone();
                let done = done.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let seen = seen.clone();
                        let done = done.clone();
                        let tag = p * PER_PRODUCER + i;
                        queue.push_task(
                            Task::prepare(move |t| {
                                t.add_execute_fn(move |_| {
                                    seen.lock().unwrap().push(tag);
                                    true
                                });
                                t.add_complete_fn(move |_| {
                                    done.fetch_add(1, Ordering::SeqCst);
                                });
                            }),
                            false,
                        );
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while done.load(Ordering::SeqCst) < PRODUCERS * PER_PRODUCER {
            assert!(Instant::now() < deadline, "tasks not drained");
            thread::sleep(Duration::from_millis(5));
        }
        queue.finalize();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), PRODUCERS * PER_PRODUCER);
        let unique: HashSet<_> = seen.iter().copied().collect();
        assert_eq!(unique.len(), PRODUCERS * PER_PRODUCER);
    }

    #[test]
    fn test_finalize_is_bounded_with_queued_tasks() {
        let queue = start(2);
        let group = TaskGroup::new();
        let started = Arc::new(AtomicUsize::new(0));

        // keep both workers busy so later tasks stay queued
        for _ in 0..2 {
            let started = started.clone();
            queue.push_task(
                Task::prepare_in_group(&group, move |t| {
                    t.add_execute_fn(move |_| {
                        started.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(200));
                        true
                    });
                }),
                false,
            );
        }
        for _ in 0..100 {
            queue.push_task(Task::prepare_in_group(&group, |t| t.add_execute_fn(|_| true)), false);
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while started.load(Ordering::SeqCst) < 2 {
            assert!(Instant::now() < deadline, "workers never started");
            thread::sleep(Duration::from_millis(1));
        }

        let begin = Instant::now();
        queue.finalize();
        assert!(begin.elapsed() < Duration::from_secs(2));

        // cancelled leftovers still reach the group
        group.wait_for_all();
        assert_eq!(group.completed(), 102);
        assert_eq!(queue.outstanding(), 0);
    }

    #[test]
    fn test_finalize_from_task_does_not_self_join() {
        let queue = start(2);
        let finished = Arc::new(AtomicBool::new(false));

        let (q, f) = (queue.clone(), finished.clone());
        queue.push_task(
            Task::prepare(move |t| {
                t.add_execute_fn(move |_| {
                    q.finalize();
                    f.store(true, Ordering::SeqCst);
                    true
                });
            }),
            false,
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        while !finished.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "finalize from a task never returned");
            thread::sleep(Duration::from_millis(5));
        }
        assert!(queue.is_finalized());
        assert!(lock(&queue.workers).is_empty());
        queue.finalize();
    }

    #[test]
    fn test_push_after_finalize_cancels() {
        let queue = start(1);
        queue.finalize();
        queue.finalize();

        let outcome = Arc::new(Mutex::new(None));
        let o = outcome.clone();
        queue.push_task(
            Task::prepare(move |t| {
                t.add_execute_fn(|_| true);
                t.add_complete_fn(move |t| *o.lock().unwrap() = Some(t.is_successful()));
            }),
            false,
        );
        assert_eq!(*outcome.lock().unwrap(), Some(false));
        assert!(!queue.has_tasks());
    }

    #[test]
    fn test_urgent_lane_first() {
        let config = RootConfig::new().port(0).num_workers(1);
        let listener = listener::bind(&config).unwrap();
        // not running: inspect ordering directly
        let queue = ConnectionQueue::new(listener, Arc::new(EchoHandler), &config).unwrap();

        let regular = Task::new();
        let regular_id = regular.id();
        queue.push_task(regular, false);
        let first = Task::new();
        let first_id = first.id();
        queue.push_task(first, true);
        let critical = Task::prepare(|t| t.set_priority(Priority::Critical));
        let critical_id = critical.id();
        queue.push_task(critical, false);

        assert_eq!(queue.outstanding(), 3);
        let order: Vec<_> = std::iter::from_fn(|| queue.pop_task())
            .map(|t| {
                let id = t.id();
                queue.release_task(t);
                id
            })
            .collect();
        assert_eq!(order, vec![first_id, critical_id, regular_id]);
        assert!(!queue.has_tasks());
    }
}
