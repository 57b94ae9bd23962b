//! # stellator-runtime
//!
//! Linux runtime for the stellator server core.
//!
//! This crate provides:
//! - `ConnectionQueue` - the shared task queue and the worker pool
//! - `ConnectionWorker` - one epoll loop per OS thread over the shared
//!   listening socket, the task eventfd and the cancellation pipe
//! - `Generation` / `Client` / `Buffer` - per-worker connection arenas with
//!   buffered non-blocking output
//! - `Root` - the process scheduler (heartbeat, scheduled and followed
//!   tasks, signal-driven shutdown)
//!
//! ```text
//!                 ┌──────────────────────── Root ────────────────────────┐
//!                 │ sigtimedwait(USR1|USR2, heartbeat)                   │
//!                 │   timeout → heartbeat: due scheduled / idle followed │
//!                 │   signal  → finalize                                 │
//!                 └──────────────┬───────────────────────────────────────┘
//!                                │ push_task
//!                 ┌──────────────▼──────────────┐
//!                 │ ConnectionQueue             │
//!                 │  SegQueue + eventfd permits │
//!                 └──┬───────────┬───────────┬──┘
//!              ┌─────▼───┐ ┌─────▼───┐ ┌─────▼───┐
//!              │ worker 0│ │ worker 1│ │ worker N│  epoll: listener (EXCLUSIVE),
//!              │ gens... │ │ gens... │ │ gens... │  eventfd, pipe, signalfd, clients
//!              └─────────┘ └─────────┘ └─────────┘
//! ```

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod config;
        pub mod buffer;
        pub mod client;
        pub mod generation;
        pub mod handler;
        pub mod listener;
        pub mod queue;
        pub mod root;
        pub mod signal;
        mod sys;
        mod worker;

        pub use config::RootConfig;
        pub use generation::Generation;
        pub use handler::{Connection, ConnectionHandler, ConnectionId, EchoHandler};
        pub use queue::ConnectionQueue;
        pub use root::{Phase, Root, RootStats};
    } else {
        compile_error!("stellator-runtime requires Linux (epoll, eventfd, signalfd)");
    }
}
