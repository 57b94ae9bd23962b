//! Generation: an arena of client slots
//!
//! Each worker owns one or more generations. Only the newest accepts
//! connections; once it is full it is marked end-of-life and a new one is
//! started. An end-of-life generation is dropped as soon as its last client
//! is released.
//!
//! Slots live in one `Vec` and are linked by index into either the active
//! list or the free list. Allocation pops the free list before growing the
//! vector, so the vector never grows beyond the largest number of clients
//! that were active at the same time.
//!
//! Epoll tokens encode `generation id | slot serial | slot index`:
//!
//! ```text
//!  63        48 47        32 31                    0
//! ┌────────────┬────────────┬───────────────────────┐
//! │ generation │   serial   │         slot          │
//! └────────────┴────────────┴───────────────────────┘
//! ```

use crate::buffer::BufferPool;
use crate::config::defaults;
use crate::client::{Client, ClientState};
use crate::handler::{Connection, ConnectionHandler, ConnectionId};
use socket2::Socket;
use std::fmt;
use std::io::{self, Read};
use std::net::SocketAddr;

/// Generation ids stay below `0xFFFF` so client tokens never collide with
/// the worker's fixed tokens.
pub const MAX_GENERATION_ID: u16 = 0xFFFE;

#[inline]
pub(crate) fn encode_token(generation: u16, serial: u16, slot: u32) -> u64 {
    ((generation as u64) << 48) | ((serial as u64) << 32) | slot as u64
}

#[inline]
pub(crate) fn decode_token(token: u64) -> (u16, u16, u32) {
    ((token >> 48) as u16, (token >> 32) as u16, token as u32)
}

/// What a read drain left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Drained to `EAGAIN`; the client stays registered.
    Open,
    /// Peer closed or the handler asked to close; release the client.
    Closed,
}

pub struct Generation {
    id: u16,
    worker: u16,
    capacity: usize,
    slots: Vec<Client>,
    active: Option<u32>,
    free: Option<u32>,
    active_clients: usize,
    end_of_life: bool,
    /// Unconsumed input allowed per client
    max_input: usize,
    pool: BufferPool,
}

impl Generation {
    pub fn new(id: u16, worker: u16, capacity: usize) -> Self {
        Self {
            id,
            worker,
            capacity,
            slots: Vec::new(),
            active: None,
            free: None,
            active_clients: 0,
            end_of_life: false,
            max_input: defaults::MAX_INPUT_SIZE,
            pool: BufferPool::new(),
        }
    }

    /// Cap the bytes a handler may leave unconsumed on one client.
    pub fn with_max_input(mut self, max_input: usize) -> Self {
        self.max_input = max_input;
        self
    }

    #[inline]
    pub fn id(&self) -> u16 {
        self.id
    }

    #[inline]
    pub fn active_clients(&self) -> usize {
        self.active_clients
    }

    /// Slots ever allocated.
    #[inline]
    pub fn high_water(&self) -> usize {
        self.slots.len()
    }

    /// No free slot and no room to grow.
    pub fn is_full(&self) -> bool {
        self.free.is_none() && self.slots.len() >= self.capacity
    }

    #[inline]
    pub fn is_end_of_life(&self) -> bool {
        self.end_of_life
    }

    pub fn mark_end_of_life(&mut self) {
        self.end_of_life = true;
    }

    pub fn client(&self, slot: u32) -> Option<&Client> {
        self.slots.get(slot as usize)
    }

    /// Whether `(slot, serial)` still names the client a token was made for.
    pub fn is_live(&self, slot: u32, serial: u16) -> bool {
        self.client(slot)
            .is_some_and(|c| c.is_active() && c.serial == serial)
    }

    pub fn token(&self, slot: u32) -> u64 {
        let serial = self.client(slot).map_or(0, |c| c.serial);
        encode_token(self.id, serial, slot)
    }

    pub fn connection_id(&self, slot: u32) -> ConnectionId {
        ConnectionId::new(self.worker, self.token(slot))
    }

    /// Active slot indices, newest first.
    pub fn active_slots(&self) -> Vec<u32> {
        let mut slots = Vec::with_capacity(self.active_clients);
        let mut cursor = self.active;
        while let Some(slot) = cursor {
            slots.push(slot);
            cursor = self.slots[slot as usize].next;
        }
        slots
    }

    /// Adopt an accepted socket into a slot at the head of the active list.
    ///
    /// The caller checks [`Generation::is_full`] first; a full generation
    /// still grows rather than dropping the connection.
    pub fn push_fd(&mut self, socket: Socket, peer: Option<SocketAddr>) -> io::Result<u32> {
        socket.set_nonblocking(true)?;

        let slot = match self.free {
            Some(slot) => {
                self.free = self.slots[slot as usize].next;
                slot
            }
            None => {
                self.slots.push(Client::vacant());
                (self.slots.len() - 1) as u32
            }
        };

        let head = self.active;
        let client = &mut self.slots[slot as usize];
        client.socket = Some(socket);
        client.peer = peer;
        client.state = ClientState::Active;
        client.events = 0;
        client.input.clear();
        client.prev = None;
        client.next = head;

        if let Some(head) = head {
            self.slots[head as usize].prev = Some(slot);
        }
        self.active = Some(slot);
        self.active_clients += 1;
        Ok(slot)
    }

    /// Record the epoll interest registered for `slot`.
    pub(crate) fn set_events(&mut self, slot: u32, events: u32) {
        if let Some(client) = self.slots.get_mut(slot as usize) {
            client.events = events;
        }
    }

    /// Close the client's socket and move its slot to the free list.
    ///
    /// Returns `false` if the slot was not active.
    pub fn release_client(&mut self, slot: u32) -> bool {
        let Some(client) = self.slots.get_mut(slot as usize) else {
            return false;
        };
        if client.state != ClientState::Active {
            return false;
        }

        client.socket = None;
        client.peer = None;
        client.state = ClientState::Free;
        client.serial = client.serial.wrapping_add(1);
        client.events = 0;
        client.input.clear();
        let (prev, next) = (client.prev.take(), client.next.take());
        let output = std::mem::take(&mut client.output);
        client.next = self.free;

        match prev {
            Some(p) => self.slots[p as usize].next = next,
            None => self.active = next,
        }
        if let Some(n) = next {
            self.slots[n as usize].prev = prev;
        }
        self.free = Some(slot);
        self.active_clients -= 1;

        for buffer in output {
            self.pool.put(buffer);
        }
        true
    }

    /// Release every active client.
    pub fn release_all(&mut self) {
        while let Some(slot) = self.active {
            self.release_client(slot);
        }
    }

    /// Send `bytes` to the client, queueing whatever cannot be written now.
    ///
    /// Bytes are queued untouched while earlier output is still pending so
    /// the peer sees writes in call order.
    pub fn write_buffer(&mut self, slot: u32, bytes: &[u8]) -> io::Result<()> {
        let client = self
            .slots
            .get_mut(slot as usize)
            .filter(|c| c.is_active())
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let Some(socket) = client.socket.as_ref() else {
            return Err(io::ErrorKind::NotConnected.into());
        };

        if !client.output.is_empty() {
            client.output.push_back(self.pool.take(bytes));
            return Ok(());
        }

        let mut written = 0;
        while written < bytes.len() {
            match socket.send(&bytes[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if written < bytes.len() {
            client.output.push_back(self.pool.take(&bytes[written..]));
        }
        Ok(())
    }

    /// Flush the client's queued output, head first, until done or `EAGAIN`.
    pub fn perform_write(&mut self, slot: u32) -> io::Result<()> {
        let Some(client) = self.slots.get_mut(slot as usize) else {
            return Ok(());
        };
        let Client { socket, output, .. } = client;
        let Some(socket) = socket.as_ref() else {
            return Ok(());
        };

        while let Some(front) = output.front_mut() {
            match socket.send(front.remaining()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    front.advance(n);
                    if front.is_consumed() {
                        if let Some(done) = output.pop_front() {
                            self.pool.put(done);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Read until `EAGAIN`, feeding each chunk to `handler`.
    ///
    /// A client whose unconsumed input grows past the generation's cap is
    /// reported `Closed`.
    pub fn perform_read(
        &mut self,
        slot: u32,
        scratch: &mut [u8],
        handler: &dyn ConnectionHandler,
    ) -> io::Result<ReadOutcome> {
        loop {
            let read = {
                let Some(socket) = self.client(slot).and_then(|c| c.socket.as_ref()) else {
                    return Ok(ReadOutcome::Closed);
                };
                let mut reader: &Socket = socket;
                reader.read(scratch)
            };

            match read {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) => {
                    let mut input = std::mem::take(&mut self.slots[slot as usize].input);
                    input.extend_from_slice(&scratch[..n]);

                    let mut conn = Connection::new(self, slot);
                    let consumed = handler.on_data(&mut conn, &input).min(input.len());
                    let closing = conn.is_closing();

                    input.drain(..consumed);
                    let retained = input.len();
                    self.slots[slot as usize].input = input;
                    if closing {
                        return Ok(ReadOutcome::Closed);
                    }
                    if retained > self.max_input {
                        tracing::warn!(
                            conn = %self.connection_id(slot),
                            retained,
                            limit = self.max_input,
                            "unconsumed input over limit, closing"
                        );
                        return Ok(ReadOutcome::Closed);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::Open),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Run `handler.on_open` for a freshly pushed slot. Returns `false` if
    /// the handler closed the connection.
    pub(crate) fn open(&mut self, slot: u32, handler: &dyn ConnectionHandler) -> bool {
        let mut conn = Connection::new(self, slot);
        handler.on_open(&mut conn);
        !conn.is_closing()
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generation")
            .field("id", &self.id)
            .field("worker", &self.worker)
            .field("active_clients", &self.active_clients)
            .field("high_water", &self.slots.len())
            .field("capacity", &self.capacity)
            .field("end_of_life", &self.end_of_life)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::EchoHandler;
    use socket2::SockRef;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use std::time::{Duration, Instant};

    /// A connected pair: (peer side, server side as `Socket`).
    fn tcp_pair(listener: &TcpListener) -> (TcpStream, Socket, SocketAddr) {
        let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, addr) = listener.accept().unwrap();
        (peer, Socket::from(server), addr)
    }

    #[test]
    fn test_token_round_trip() {
        let token = encode_token(MAX_GENERATION_ID, 0xABCD, 0x1234_5678);
        assert_eq!(decode_token(token), (MAX_GENERATION_ID, 0xABCD, 0x1234_5678));
    }

    #[test]
    fn test_slot_reuse_bounded_by_high_water() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut gen = Generation::new(1, 0, 64);
        let mut peers = Vec::new();

        let mut slots = Vec::new();
        for _ in 0..8 {
            let (peer, sock, addr) = tcp_pair(&listener);
            peers.push(peer);
            slots.push(gen.push_fd(sock, Some(addr)).unwrap());
        }
        assert_eq!(gen.active_clients(), 8);
        assert_eq!(gen.high_water(), 8);

        for slot in &slots {
            assert!(gen.release_client(*slot));
        }
        assert!(!gen.release_client(slots[0]));
        assert_eq!(gen.active_clients(), 0);

        for _ in 0..8 {
            let (peer, sock, addr) = tcp_pair(&listener);
            peers.push(peer);
            gen.push_fd(sock, Some(addr)).unwrap();
        }
        assert_eq!(gen.active_clients(), 8);
        assert_eq!(gen.high_water(), 8);
        assert_eq!(gen.active_slots().len(), 8);
    }

    #[test]
    fn test_release_unlinks_middle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut gen = Generation::new(1, 0, 8);
        let mut peers = Vec::new();
        let mut slots = Vec::new();
        for _ in 0..3 {
            let (peer, sock, addr) = tcp_pair(&listener);
            peers.push(peer);
            slots.push(gen.push_fd(sock, Some(addr)).unwrap());
        }
        // active list is newest first: 2, 1, 0
        assert_eq!(gen.active_slots(), vec![slots[2], slots[1], slots[0]]);
        gen.release_client(slots[1]);
        assert_eq!(gen.active_slots(), vec![slots[2], slots[0]]);
        gen.release_all();
        assert!(gen.active_slots().is_empty());
        assert_eq!(gen.high_water(), 3);
    }

    #[test]
    fn test_stale_serial_after_release() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut gen = Generation::new(2, 0, 4);
        let (_peer, sock, addr) = tcp_pair(&listener);
        let slot = gen.push_fd(sock, Some(addr)).unwrap();
        let (g, serial, s) = decode_token(gen.token(slot));
        assert_eq!((g, s), (2, slot));
        assert!(gen.is_live(slot, serial));

        gen.release_client(slot);
        assert!(!gen.is_live(slot, serial));

        let (_peer2, sock2, addr2) = tcp_pair(&listener);
        let reused = gen.push_fd(sock2, Some(addr2)).unwrap();
        assert_eq!(reused, slot);
        assert!(!gen.is_live(slot, serial));
    }

    #[test]
    fn test_is_full() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut gen = Generation::new(1, 0, 2);
        let mut peers = Vec::new();
        let mut slots = Vec::new();
        for _ in 0..2 {
            let (peer, sock, addr) = tcp_pair(&listener);
            peers.push(peer);
            slots.push(gen.push_fd(sock, Some(addr)).unwrap());
        }
        assert!(gen.is_full());
        gen.release_client(slots[0]);
        assert!(!gen.is_full());
    }

    #[test]
    fn test_fifo_across_eagain() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut peer, sock, addr) = tcp_pair(&listener);
        sock.set_send_buffer_size(4096).unwrap();
        SockRef::from(&peer).set_recv_buffer_size(4096).unwrap();

        let mut gen = Generation::new(1, 0, 4);
        let slot = gen.push_fd(sock, Some(addr)).unwrap();

        let chunks: Vec<Vec<u8>> = [(7000usize, 1u8), (6000, 2), (7000, 3)]
            .iter()
            .map(|&(len, tag)| (0..len).map(|i| tag.wrapping_mul(31).wrapping_add((i % 199) as u8)).collect())
            .collect();
        let expected: Vec<u8> = chunks.concat();
        assert_eq!(expected.len(), 20_000);

        for chunk in &chunks {
            gen.write_buffer(slot, chunk).unwrap();
        }

        let reader = thread::spawn(move || {
            peer.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
            let mut received = vec![0u8; 20_000];
            std::io::Read::read_exact(&mut peer, &mut received).unwrap();
            received
        });

        let deadline = Instant::now() + Duration::from_secs(10);
        while gen.client(slot).unwrap().has_pending_output() {
            assert!(Instant::now() < deadline, "output never drained");
            gen.perform_write(slot).unwrap();
            thread::sleep(Duration::from_millis(1));
        }

        let received = reader.join().unwrap();
        assert_eq!(received, expected);
    }

    #[test]
    fn test_read_retains_unconsumed_input() {
        struct Lines;
        impl ConnectionHandler for Lines {
            fn on_data(&self, conn: &mut Connection<'_>, data: &[u8]) -> usize {
                match data.iter().rposition(|&b| b == b'\n') {
                    Some(end) => {
                        conn.write(&data[..=end]).unwrap();
                        end + 1
                    }
                    None => 0,
                }
            }
        }

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut peer, sock, addr) = tcp_pair(&listener);
        let mut gen = Generation::new(1, 0, 4);
        let slot = gen.push_fd(sock, Some(addr)).unwrap();
        let mut scratch = vec![0u8; 512];

        peer.write_all(b"hello wo").unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(gen.perform_read(slot, &mut scratch, &Lines).unwrap(), ReadOutcome::Open);
        assert_eq!(gen.client(slot).unwrap().pending_input(), 8);

        peer.write_all(b"rld\n").unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(gen.perform_read(slot, &mut scratch, &Lines).unwrap(), ReadOutcome::Open);
        assert_eq!(gen.client(slot).unwrap().pending_input(), 0);

        let mut line = [0u8; 12];
        std::io::Read::read_exact(&mut peer, &mut line).unwrap();
        assert_eq!(&line, b"hello world\n");
    }

    #[test]
    fn test_read_closes_when_input_over_limit() {
        struct Never;
        impl ConnectionHandler for Never {
            fn on_data(&self, _conn: &mut Connection<'_>, _data: &[u8]) -> usize {
                0
            }
        }

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut peer, sock, addr) = tcp_pair(&listener);
        let mut gen = Generation::new(1, 0, 4).with_max_input(4096);
        let slot = gen.push_fd(sock, Some(addr)).unwrap();
        let mut scratch = vec![0u8; 1024];

        peer.write_all(&[b'x'; 3000]).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(gen.perform_read(slot, &mut scratch, &Never).unwrap(), ReadOutcome::Open);
        assert_eq!(gen.client(slot).unwrap().pending_input(), 3000);

        // a peer that never sends the delimiter cannot grow input further
        peer.write_all(&[b'x'; 16 * 1024]).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(gen.perform_read(slot, &mut scratch, &Never).unwrap(), ReadOutcome::Closed);
        assert!(gen.client(slot).unwrap().pending_input() <= 4096 + scratch.len());

        assert!(gen.release_client(slot));
        assert_eq!(gen.client(slot).unwrap().pending_input(), 0);
        assert_eq!(gen.active_clients(), 0);
    }

    #[test]
    fn test_read_eof_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (peer, sock, addr) = tcp_pair(&listener);
        let mut gen = Generation::new(1, 0, 4);
        let slot = gen.push_fd(sock, Some(addr)).unwrap();
        drop(peer);
        thread::sleep(Duration::from_millis(50));

        let mut scratch = vec![0u8; 512];
        let outcome = gen.perform_read(slot, &mut scratch, &EchoHandler).unwrap();
        assert_eq!(outcome, ReadOutcome::Closed);
    }

    #[test]
    fn test_write_to_released_slot() {
        let mut gen = Generation::new(1, 0, 4);
        let err = gen.write_buffer(0, b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
