//! ConnectionWorker: one epoll loop per OS thread
//!
//! Each iteration handles the ready set in two passes:
//!
//! 1. the task eventfd: take one permit, pop one task, run it;
//! 2. everything else: accept on the listener, cancellation, logged
//!    signals, client reads, writes and hangups.
//!
//! Tasks run before I/O so work injected from other threads is not starved
//! by busy connections.

use crate::generation::{decode_token, Generation, ReadOutcome, MAX_GENERATION_ID};
use crate::queue::ConnectionQueue;
use crate::signal;
use crate::sys::Epoll;
use libc::epoll_event;
use nix::sys::signalfd::SignalFd;
use socket2::Socket;
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Ready descriptors handled per `epoll_wait`.
pub const MAX_EVENTS: usize = 64;

// Fixed tokens sit above every client token (generation ids < 0xFFFF).
const LISTENER_TOKEN: u64 = u64::MAX;
const CANCEL_TOKEN: u64 = u64::MAX - 1;
const WAKE_TOKEN: u64 = u64::MAX - 2;
const SIGNAL_TOKEN: u64 = u64::MAX - 3;

const EPOLLIN: u32 = libc::EPOLLIN as u32;
const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
const EPOLLERR: u32 = libc::EPOLLERR as u32;
const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
const EPOLLRDHUP: u32 = libc::EPOLLRDHUP as u32;
const EPOLLET: u32 = libc::EPOLLET as u32;
const EPOLLEXCLUSIVE: u32 = libc::EPOLLEXCLUSIVE as u32;

/// Interest registered for every client.
const CLIENT_EVENTS: u32 = EPOLLIN | EPOLLOUT | EPOLLET | EPOLLRDHUP;

fn sys_err(op: &'static str) -> impl FnOnce(io::Error) -> stellator_core::Error {
    move |source| stellator_core::Error::Sys { op, source }
}

pub(crate) struct ConnectionWorker {
    index: usize,
    queue: Arc<ConnectionQueue>,
    epoll: Epoll,
    signals: Option<SignalFd>,
    /// Newest last; only the newest accepts
    generations: Vec<Generation>,
    next_generation: u16,
    scratch: Vec<u8>,
    should_close: bool,
}

impl ConnectionWorker {
    /// Create the worker's epoll set. Runs on the spawning thread so setup
    /// failures reach `ConnectionQueue::run`.
    pub fn new(index: usize, queue: Arc<ConnectionQueue>) -> stellator_core::Result<Self> {
        let epoll = Epoll::new()?;

        epoll
            .add(
                queue.listener().as_raw_fd(),
                EPOLLIN | EPOLLEXCLUSIVE,
                LISTENER_TOKEN,
            )
            .map_err(sys_err("epoll_ctl(listener)"))?;
        epoll
            .add(queue.cancel_fd(), EPOLLIN | EPOLLET, CANCEL_TOKEN)
            .map_err(sys_err("epoll_ctl(cancel)"))?;
        epoll
            .add(queue.wake().raw_fd(), EPOLLIN | EPOLLEXCLUSIVE, WAKE_TOKEN)
            .map_err(sys_err("epoll_ctl(eventfd)"))?;

        // logging stray signals is best effort
        let signals = match signal::logged_signal_fd() {
            Ok(sfd) => match epoll.add(sfd.as_raw_fd(), EPOLLIN, SIGNAL_TOKEN) {
                Ok(()) => Some(sfd),
                Err(e) => {
                    warn!(worker = index, error = %e, "signalfd not registered");
                    None
                }
            },
            Err(e) => {
                warn!(worker = index, error = %e, "signalfd unavailable");
                None
            }
        };

        let config = queue.config();
        let scratch = vec![0u8; config.read_buffer_size];
        let first = Generation::new(0, index as u16, config.generation_capacity)
            .with_max_input(config.max_input_size);

        Ok(Self {
            index,
            queue,
            epoll,
            signals,
            generations: vec![first],
            next_generation: 1,
            scratch,
            should_close: false,
        })
    }

    /// Worker thread body.
    pub fn run(mut self) {
        if let Err(e) = signal::block_worker_signals() {
            warn!(worker = self.index, error = %e, "failed to block signals");
        }
        debug!(worker = self.index, "worker started");

        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        while !self.should_close {
            let n = match self.epoll.wait(&mut events, -1) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(worker = self.index, error = %e, "epoll_wait failed");
                    break;
                }
            };

            for ev in &events[..n] {
                let token = ev.u64;
                if token == WAKE_TOKEN {
                    self.perform_task();
                }
            }

            for ev in &events[..n] {
                let (flags, token) = (ev.events, ev.u64);
                match token {
                    WAKE_TOKEN => {}
                    LISTENER_TOKEN => self.on_listener(flags),
                    CANCEL_TOKEN => {
                        debug!(worker = self.index, "cancellation received");
                        self.should_close = true;
                    }
                    SIGNAL_TOKEN => self.drain_signals(),
                    _ => self.on_client(token, flags),
                }
            }

            self.reap_generations();
        }

        self.shutdown();
        debug!(worker = self.index, "worker stopped");
    }

    fn perform_task(&mut self) {
        match self.queue.wake().try_acquire() {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(worker = self.index, error = %e, "eventfd read failed");
                return;
            }
        }
        let Some(mut task) = self.queue.pop_task() else {
            return;
        };
        trace!(worker = self.index, task = %task.id(), "running task");
        if panic::catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
            error!(worker = self.index, task = %task.id(), "task panicked");
        }
        self.queue.release_task(task);
    }

    fn on_listener(&mut self, flags: u32) {
        if flags & EPOLLERR != 0 {
            error!(worker = self.index, "error on listening socket, worker stopping");
            self.should_close = true;
            return;
        }
        if flags & EPOLLIN == 0 {
            return;
        }
        loop {
            match self.queue.listener().accept() {
                Ok((socket, addr)) => self.add_client(socket, addr.as_socket()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e)
                    if e.kind() == io::ErrorKind::Interrupted
                        || e.kind() == io::ErrorKind::ConnectionAborted =>
                {
                    continue
                }
                Err(e) => {
                    warn!(worker = self.index, error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn current_generation(&mut self) -> usize {
        let full = self.generations.last().map_or(true, |g| g.is_full());
        if full {
            if let Some(last) = self.generations.last_mut() {
                last.mark_end_of_life();
                debug!(worker = self.index, generation = last.id(), "generation retired");
            }
            let mut id = self.next_generation;
            while self.generations.iter().any(|g| g.id() == id) {
                id = if id >= MAX_GENERATION_ID { 0 } else { id + 1 };
            }
            self.next_generation = if id >= MAX_GENERATION_ID { 0 } else { id + 1 };
            let config = self.queue.config();
            let generation = Generation::new(id, self.index as u16, config.generation_capacity)
                .with_max_input(config.max_input_size);
            self.generations.push(generation);
        }
        self.generations.len() - 1
    }

    fn add_client(&mut self, socket: Socket, peer: Option<SocketAddr>) {
        let gi = self.current_generation();
        let fd = socket.as_raw_fd();
        let generation = &mut self.generations[gi];
        let slot = match generation.push_fd(socket, peer) {
            Ok(slot) => slot,
            Err(e) => {
                warn!(worker = self.index, error = %e, "failed to adopt connection");
                return;
            }
        };

        let token = generation.token(slot);
        if let Err(e) = self.epoll.add(fd, CLIENT_EVENTS, token) {
            warn!(worker = self.index, error = %e, "epoll_ctl failed for client");
            generation.release_client(slot);
            return;
        }
        generation.set_events(slot, CLIENT_EVENTS);
        trace!(worker = self.index, ?peer, token, "client accepted");

        if !generation.open(slot, self.queue.handler()) {
            self.release(gi, slot);
        }
    }

    fn on_client(&mut self, token: u64, flags: u32) {
        let (gen_id, serial, slot) = decode_token(token);
        let Some(gi) = self.generations.iter().position(|g| g.id() == gen_id) else {
            return;
        };
        if !self.generations[gi].is_live(slot, serial) {
            return;
        }

        if flags & EPOLLERR != 0 {
            self.release(gi, slot);
            return;
        }

        if flags & EPOLLIN != 0 {
            let handler = self.queue.handler();
            let generation = &mut self.generations[gi];
            match generation.perform_read(slot, &mut self.scratch, handler) {
                Ok(ReadOutcome::Open) => {}
                Ok(ReadOutcome::Closed) => {
                    self.release(gi, slot);
                    return;
                }
                Err(e) => {
                    debug!(worker = self.index, error = %e, "read failed");
                    self.release(gi, slot);
                    return;
                }
            }
        }

        if flags & EPOLLOUT != 0 {
            if let Err(e) = self.generations[gi].perform_write(slot) {
                debug!(worker = self.index, error = %e, "write failed");
                self.release(gi, slot);
                return;
            }
        }

        if flags & (EPOLLHUP | EPOLLRDHUP) != 0 {
            self.release(gi, slot);
        }
    }

    fn release(&mut self, gi: usize, slot: u32) {
        let generation = &mut self.generations[gi];
        if !generation.client(slot).is_some_and(|c| c.is_active()) {
            return;
        }
        let id = generation.connection_id(slot);
        generation.release_client(slot);
        self.queue.handler().on_close(id);
        trace!(worker = self.index, conn = %id, "client released");
    }

    fn drain_signals(&mut self) {
        let Some(sfd) = self.signals.as_mut() else {
            return;
        };
        loop {
            match sfd.read_signal() {
                Ok(Some(info)) => {
                    warn!(
                        worker = self.index,
                        signal = signal::signal_name(info.ssi_signo as i32),
                        pid = info.ssi_pid,
                        "signal received"
                    );
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(worker = self.index, error = %e, "signalfd read failed");
                    break;
                }
            }
        }
    }

    /// Drop end-of-life generations without clients.
    fn reap_generations(&mut self) {
        let before = self.generations.len();
        self.generations
            .retain(|g| !(g.is_end_of_life() && g.active_clients() == 0));
        if self.generations.len() != before {
            debug!(
                worker = self.index,
                reaped = before - self.generations.len(),
                "generations torn down"
            );
        }
    }

    fn shutdown(&mut self) {
        let handler = self.queue.handler();
        let mut closed = 0;
        for generation in &mut self.generations {
            for slot in generation.active_slots() {
                let id = generation.connection_id(slot);
                generation.release_client(slot);
                handler.on_close(id);
                closed += 1;
            }
            generation.release_all();
        }
        self.generations.clear();
        info!(worker = self.index, closed, "worker shut down");
    }
}
