//! Library defaults for `RootConfig`

/// Listen address; an empty address also means loopback
pub const ADDRESS: &str = "127.0.0.1";

pub const PORT: u16 = 8080;

/// Heartbeat period of the root loop
pub const HEARTBEAT_MS: u64 = 1000;

/// Scratch buffer used for each `read()` on a client
pub const READ_BUFFER_SIZE: usize = 8192;

/// Unconsumed input kept per client before the client is dropped
pub const MAX_INPUT_SIZE: usize = 1024 * 1024;

/// Client slots per generation before a new generation is started
pub const GENERATION_CAPACITY: usize = 1024;

pub const MAX_WORKERS: usize = 256;

/// One worker per available CPU
pub fn num_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(MAX_WORKERS)
}
