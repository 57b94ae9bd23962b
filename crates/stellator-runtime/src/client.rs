//! Per-connection state
//!
//! A `Client` is a slot in a `Generation`. Slots are linked into the
//! generation's active or free list by index and are never freed on
//! their own.

use crate::buffer::Buffer;
use socket2::Socket;
use std::collections::VecDeque;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Active,
    Free,
}

#[derive(Debug)]
pub struct Client {
    pub(crate) socket: Option<Socket>,
    pub(crate) peer: Option<SocketAddr>,
    /// Bumped on release; events registered under an older serial are stale.
    pub(crate) serial: u16,
    pub(crate) state: ClientState,
    /// Registered epoll interest
    pub(crate) events: u32,
    pub(crate) prev: Option<u32>,
    pub(crate) next: Option<u32>,
    /// Received bytes the handler has not consumed yet
    pub(crate) input: Vec<u8>,
    pub(crate) output: VecDeque<Buffer>,
}

impl Client {
    pub(crate) fn vacant() -> Self {
        Client {
            socket: None,
            peer: None,
            serial: 0,
            state: ClientState::Free,
            events: 0,
            prev: None,
            next: None,
            input: Vec::new(),
            output: VecDeque::new(),
        }
    }

    #[inline]
    pub fn state(&self) -> ClientState {
        self.state
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state == ClientState::Active
    }

    #[inline]
    pub fn serial(&self) -> u16 {
        self.serial
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn socket(&self) -> Option<&Socket> {
        self.socket.as_ref()
    }

    /// Bytes queued behind earlier writes.
    pub fn pending_output(&self) -> usize {
        self.output.iter().map(|b| b.remaining().len()).sum()
    }

    pub fn has_pending_output(&self) -> bool {
        !self.output.is_empty()
    }

    pub fn pending_input(&self) -> usize {
        self.input.len()
    }
}
