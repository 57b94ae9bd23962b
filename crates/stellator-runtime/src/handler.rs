//! Connection handler seam
//!
//! Payload bytes are opaque to the engine. Whatever protocol runs on top
//! implements [`ConnectionHandler`]; workers call it with each chunk read
//! from a client and the handler answers through a [`Connection`] view.

use crate::generation::Generation;
use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Identity of a connection: the worker that owns it and its epoll token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    worker: u16,
    token: u64,
}

impl ConnectionId {
    pub(crate) fn new(worker: u16, token: u64) -> Self {
        Self { worker, token }
    }

    #[inline]
    pub fn worker(&self) -> u16 {
        self.worker
    }

    #[inline]
    pub fn token(&self) -> u64 {
        self.token
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}:{:x}", self.worker, self.token)
    }
}

/// A live connection, valid for the duration of one handler call.
pub struct Connection<'a> {
    generation: &'a mut Generation,
    slot: u32,
    close: bool,
}

impl<'a> Connection<'a> {
    pub(crate) fn new(generation: &'a mut Generation, slot: u32) -> Self {
        Self {
            generation,
            slot,
            close: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.generation.connection_id(self.slot)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.generation.client(self.slot).and_then(|c| c.peer_addr())
    }

    /// Queue `bytes` for the peer, in call order.
    ///
    /// A write error marks the connection for closing.
    pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let result = self.generation.write_buffer(self.slot, bytes);
        if result.is_err() {
            self.close = true;
        }
        result
    }

    /// Release the connection once the current callback returns.
    pub fn close(&mut self) {
        self.close = true;
    }

    #[inline]
    pub fn is_closing(&self) -> bool {
        self.close
    }

    pub fn pending_output(&self) -> usize {
        self.generation
            .client(self.slot)
            .map_or(0, |c| c.pending_output())
    }
}

/// Protocol logic plugged into the workers. Shared by every worker thread.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// A connection was accepted and registered.
    fn on_open(&self, conn: &mut Connection<'_>) {
        let _ = conn;
    }

    /// `data` holds every byte received and not consumed so far. Returns
    /// how many leading bytes were consumed; the rest is offered again
    /// with the next chunk.
    fn on_data(&self, conn: &mut Connection<'_>, data: &[u8]) -> usize;

    /// The connection was released (peer hangup, error, close or shutdown).
    fn on_close(&self, id: ConnectionId) {
        let _ = id;
    }
}

/// Writes every received chunk back to its sender.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl ConnectionHandler for EchoHandler {
    fn on_data(&self, conn: &mut Connection<'_>, data: &[u8]) -> usize {
        if let Err(e) = conn.write(data) {
            tracing::debug!(conn = %conn.id(), error = %e, "echo write failed");
        }
        data.len()
    }
}
