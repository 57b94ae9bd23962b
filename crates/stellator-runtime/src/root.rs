//! Root: the process scheduler
//!
//! `Root::run` owns the listening socket and the connection queue for as
//! long as the server runs. Its thread sleeps in `sigtimedwait` on
//! `SIGUSR1`/`SIGUSR2` with the heartbeat interval as timeout:
//!
//! - timeout: heartbeat. Server and user heartbeat hooks run, scheduled
//!   tasks that are due are pushed, and if the queue is idle the oldest
//!   followed task is pushed (or, with nothing left to follow and a close
//!   requested, the loop ends);
//! - signal: the loop ends.
//!
//! Either way the queue is finalized before `run` returns.
//!
//! ```text
//! Idle ──run──▶ Running ──signal / close──▶ Draining ──▶ Stopped
//! ```
//!
//! No lock is held while tasks are pushed or hooks run.

use crate::config::RootConfig;
use crate::handler::ConnectionHandler;
use crate::listener;
use crate::queue::ConnectionQueue;
use crate::signal::{self, SignalGuard};
use nix::sys::pthread::{pthread_self, Pthread};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use stellator_core::sync::lock;
use stellator_core::{Error, Result, Server, Task};
use tracing::{debug, error, info, warn};

type RootFn = dyn Fn(&Root) + Send + Sync;

/// Lifecycle of a [`Root`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Idle = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

impl Phase {
    fn from_u8(v: u8) -> Phase {
        match v {
            1 => Phase::Running,
            2 => Phase::Draining,
            3 => Phase::Stopped,
            _ => Phase::Idle,
        }
    }
}

/// Counters snapshot returned by [`Root::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RootStats {
    pub heartbeats: u64,
    /// Tasks pushed to the queue by the root
    pub tasks_performed: u64,
    pub tasks_scheduled: u64,
    pub tasks_followed: u64,
}

#[derive(Default)]
struct Counters {
    heartbeats: AtomicU64,
    performed: AtomicU64,
    scheduled: AtomicU64,
    followed: AtomicU64,
}

#[derive(Default)]
struct Schedule {
    queue: Option<Arc<ConnectionQueue>>,
    scheduled: Vec<Box<Task>>,
    followed: VecDeque<Box<Task>>,
    should_close: bool,
}

struct RootInner {
    config: RootConfig,
    phase: AtomicU8,
    schedule: Mutex<Schedule>,
    servers: Mutex<Vec<Server>>,
    heartbeat_fns: Mutex<Vec<Arc<RootFn>>>,
    child_init_fns: Mutex<Vec<Arc<RootFn>>>,
    thread: Mutex<Option<Pthread>>,
    local_addr: Mutex<Option<SocketAddr>>,
    counters: Counters,
}

/// Process scheduler handle. Clones share the same root.
#[derive(Clone)]
pub struct Root {
    inner: Arc<RootInner>,
}

impl Root {
    pub fn new(config: RootConfig) -> Self {
        Self {
            inner: Arc::new(RootInner {
                config,
                phase: AtomicU8::new(Phase::Idle as u8),
                schedule: Mutex::new(Schedule::default()),
                servers: Mutex::new(Vec::new()),
                heartbeat_fns: Mutex::new(Vec::new()),
                child_init_fns: Mutex::new(Vec::new()),
                thread: Mutex::new(None),
                local_addr: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &RootConfig {
        &self.inner.config
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.inner.phase.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.phase() == Phase::Running
    }

    /// Serve until a shutdown signal arrives or a requested close
    /// completes. Blocks the calling thread.
    pub fn run(&self, handler: Arc<dyn ConnectionHandler>) -> Result<()> {
        self.inner.config.validate()?;
        self.begin()?;
        let result = self.serve(handler);
        *lock(&self.inner.local_addr) = None;
        self.set_phase(Phase::Stopped);
        match &result {
            Ok(()) => info!("root stopped"),
            Err(e) => error!(error = %e, "root stopped with error"),
        }
        result
    }

    fn begin(&self) -> Result<()> {
        let phase = &self.inner.phase;
        for from in [Phase::Idle, Phase::Stopped] {
            if phase
                .compare_exchange(
                    from as u8,
                    Phase::Running as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok(());
            }
        }
        Err(Error::AlreadyRunning)
    }

    fn set_phase(&self, phase: Phase) {
        self.inner.phase.store(phase as u8, Ordering::Release);
    }

    fn serve(&self, handler: Arc<dyn ConnectionHandler>) -> Result<()> {
        let config = &self.inner.config;
        let _signals = SignalGuard::install()?;

        let listener = listener::bind(config)?;
        let addr = listener::local_addr(&listener);
        let queue = ConnectionQueue::new(listener, handler, config)?;
        queue.run()?;

        // thread first: once the queue is visible, shutdown() must work
        *lock(&self.inner.thread) = Some(pthread_self());
        *lock(&self.inner.local_addr) = addr;
        lock(&self.inner.schedule).queue = Some(Arc::clone(&queue));
        info!(addr = ?addr, workers = queue.workers_count(), "root running");

        let init: Vec<_> = lock(&self.inner.child_init_fns).clone();
        for f in &init {
            f(self);
        }

        let result = self.main_loop();

        self.set_phase(Phase::Draining);
        // no shutdown signal can be sent past this point
        *lock(&self.inner.thread) = None;
        let leftover = {
            let mut schedule = lock(&self.inner.schedule);
            schedule.queue = None;
            schedule.should_close = false;
            let mut leftover = std::mem::take(&mut schedule.scheduled);
            leftover.extend(std::mem::take(&mut schedule.followed));
            leftover
        };
        queue.finalize();
        if !leftover.is_empty() {
            debug!(count = leftover.len(), "cancelling unscheduled tasks");
        }
        for task in leftover {
            cancel_unqueued(task);
        }

        let stray = signal::drain_pending();
        if stray > 0 {
            debug!(count = stray, "discarded pending shutdown signals");
        }
        result
    }

    fn main_loop(&self) -> Result<()> {
        let interval = self.inner.config.heartbeat_interval;
        loop {
            match signal::wait_shutdown(interval) {
                Ok(Some(sig)) => {
                    info!(signal = sig.as_str(), "shutdown signal received");
                    return Ok(());
                }
                Ok(None) => {
                    if self.on_heartbeat() {
                        info!("close requested and queue idle");
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(Error::Sys {
                        op: "sigtimedwait",
                        source,
                    })
                }
            }
        }
    }

    /// One heartbeat. Returns `true` when the root should stop.
    fn on_heartbeat(&self) -> bool {
        let counters = &self.inner.counters;
        counters.heartbeats.fetch_add(1, Ordering::Relaxed);

        let servers = lock(&self.inner.servers).clone();
        for server in &servers {
            server.on_heartbeat();
        }
        let hooks = lock(&self.inner.heartbeat_fns).clone();
        for hook in &hooks {
            hook(self);
        }

        let now = Instant::now();
        let (queue, due, followed, stop) = {
            let mut schedule = lock(&self.inner.schedule);
            let Some(queue) = schedule.queue.clone() else {
                return false;
            };
            let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut schedule.scheduled)
                .into_iter()
                .partition(|t| t.is_due(now));
            schedule.scheduled = pending;

            let mut followed = None;
            let mut stop = false;
            if due.is_empty() && !queue.has_tasks() {
                followed = schedule.followed.pop_front();
                stop = followed.is_none() && schedule.should_close;
            }
            (queue, due, followed, stop)
        };

        for task in due {
            counters.performed.fetch_add(1, Ordering::Relaxed);
            queue.push_task(task, false);
        }
        if let Some(task) = followed {
            counters.performed.fetch_add(1, Ordering::Relaxed);
            queue.push_task(task, false);
        }
        stop
    }

    /// Tag `task` with `server` and queue it now.
    ///
    /// Fails with [`Error::NotRunning`] outside `run`; the task is then
    /// cancelled so its completion path still runs.
    pub fn perform_task(&self, server: &Server, mut task: Box<Task>, first: bool) -> Result<()> {
        task.set_server(server.clone());
        let queue = lock(&self.inner.schedule).queue.clone();
        match queue {
            Some(queue) => {
                self.inner.counters.performed.fetch_add(1, Ordering::Relaxed);
                queue.push_task(task, first);
                Ok(())
            }
            None => {
                warn!(task = %task.id(), "perform_task while root is not running");
                cancel_unqueued(task);
                Err(Error::NotRunning)
            }
        }
    }

    /// Queue `task` once `interval` has passed. It is picked up by the
    /// first heartbeat after that. A zero interval performs it now.
    ///
    /// Outside `run` the task is cancelled and [`Error::NotRunning`]
    /// returned, as with [`Root::perform_task`].
    pub fn schedule_task(&self, server: &Server, mut task: Box<Task>, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return self.perform_task(server, task, false);
        }
        task.set_server(server.clone());
        task.set_scheduled(Instant::now() + interval);

        let mut schedule = lock(&self.inner.schedule);
        if schedule.queue.is_none() {
            drop(schedule);
            warn!(task = %task.id(), "schedule_task while root is not running");
            cancel_unqueued(task);
            return Err(Error::NotRunning);
        }
        self.inner.counters.scheduled.fetch_add(1, Ordering::Relaxed);
        schedule.scheduled.push(task);
        Ok(())
    }

    /// Run `task` when the queue has nothing else to do: now if it is idle,
    /// otherwise on a later idle heartbeat, oldest first.
    ///
    /// Outside `run` the task is cancelled and [`Error::NotRunning`]
    /// returned.
    pub fn run_followed_task(&self, server: &Server, mut task: Box<Task>) -> Result<()> {
        task.set_server(server.clone());

        let mut schedule = lock(&self.inner.schedule);
        let Some(queue) = schedule.queue.clone() else {
            drop(schedule);
            warn!(task = %task.id(), "run_followed_task while root is not running");
            cancel_unqueued(task);
            return Err(Error::NotRunning);
        };
        self.inner.counters.followed.fetch_add(1, Ordering::Relaxed);

        if !queue.has_tasks() && schedule.followed.is_empty() {
            drop(schedule);
            self.inner.counters.performed.fetch_add(1, Ordering::Relaxed);
            queue.push_task(task, false);
        } else {
            schedule.followed.push_back(task);
        }
        Ok(())
    }

    /// Stop once the queue is idle and no followed task is left.
    pub fn close(&self) {
        lock(&self.inner.schedule).should_close = true;
    }

    /// Stop at once by signalling the root thread with `SIGUSR1`.
    pub fn shutdown(&self) -> Result<()> {
        let thread = lock(&self.inner.thread);
        match *thread {
            Some(t) => signal::notify_shutdown(t),
            None => Err(Error::NotRunning),
        }
    }

    /// Register a server; its heartbeat hook runs on every heartbeat.
    pub fn add_server(&self, server: Server) {
        lock(&self.inner.servers).push(server);
    }

    pub fn servers(&self) -> Vec<Server> {
        lock(&self.inner.servers).clone()
    }

    /// Run `f` on every heartbeat, on the root thread.
    pub fn add_heartbeat_fn<F>(&self, f: F)
    where
        F: Fn(&Root) + Send + Sync + 'static,
    {
        lock(&self.inner.heartbeat_fns).push(Arc::new(f));
    }

    /// Run `f` once per `run`, after the workers started and before the
    /// first heartbeat.
    pub fn on_child_init<F>(&self, f: F)
    where
        F: Fn(&Root) + Send + Sync + 'static,
    {
        lock(&self.inner.child_init_fns).push(Arc::new(f));
    }

    /// The running queue, if any.
    pub fn queue(&self) -> Option<Arc<ConnectionQueue>> {
        lock(&self.inner.schedule).queue.clone()
    }

    pub fn has_tasks(&self) -> bool {
        self.queue().is_some_and(|q| q.has_tasks())
    }

    /// Worker threads serving connections.
    pub fn threads_count(&self) -> usize {
        self.queue()
            .map_or(self.inner.config.num_workers, |q| q.workers_count())
    }

    /// Bound listening address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.inner.local_addr)
    }

    pub fn stats(&self) -> RootStats {
        let c = &self.inner.counters;
        RootStats {
            heartbeats: c.heartbeats.load(Ordering::Relaxed),
            tasks_performed: c.performed.load(Ordering::Relaxed),
            tasks_scheduled: c.scheduled.load(Ordering::Relaxed),
            tasks_followed: c.followed.load(Ordering::Relaxed),
        }
    }
}

/// Cancel a task that never reached the queue. Grouped tasks are counted
/// as added first so the group can still complete.
fn cancel_unqueued(mut task: Box<Task>) {
    task.cancel();
    if let Some(group) = task.group().cloned() {
        group.on_added();
        group.on_performed(task);
    }
}
