//! # stellator - epoll connection engine and task scheduler
//!
//! A fixed pool of worker threads shares one listening socket. Each worker
//! runs its own epoll loop over the listener, its clients and a shared task
//! queue. A root thread drives heartbeats, runs scheduled and followed
//! tasks, and turns `SIGUSR1`/`SIGUSR2` into an orderly shutdown.
//!
//! ## Quick Start
//!
//! ```ignore
//! use stellator::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! fn main() -> stellator::Result<()> {
//!     stellator::log::init();
//!     let root = Root::new(RootConfig::from_env());
//!     let server = Server::new("echo");
//!     root.add_server(server.clone());
//!
//!     root.schedule_task(
//!         &server,
//!         Task::prepare(|t| t.add_execute_fn(|_| { println!("tick"); true })),
//!         Duration::from_secs(5),
//!     )?;
//!
//!     root.run(Arc::new(EchoHandler))
//! }
//! ```
//!
//! ## Crates
//!
//! - `stellator-core` - tasks, task groups, server handles, errors, env and
//!   logging helpers (portable)
//! - `stellator-runtime` - workers, generations, connection queue, root
//!   (Linux only)

pub use stellator_core::{
    env, log, tls, ConfigError, Error, Priority, Result, Server, ServerBuilder, StorageHandle,
    StorageProvider, Task, TaskGroup, TaskId,
};
pub use stellator_core::{env_get, env_get_bool, env_get_opt, env_get_str};

pub use stellator_runtime::{
    Connection, ConnectionHandler, ConnectionId, ConnectionQueue, EchoHandler, Generation, Phase,
    Root, RootConfig, RootStats,
};
pub use stellator_runtime::{buffer, signal};

use std::sync::Arc;

/// Common imports for servers built on stellator.
pub mod prelude {
    pub use crate::{
        Connection, ConnectionHandler, ConnectionId, EchoHandler, Priority, Root, RootConfig,
        Server, Task, TaskGroup,
    };
}

/// Run a root with `config` and `handler` on the calling thread until it
/// is shut down.
pub fn serve(config: RootConfig, handler: Arc<dyn ConnectionHandler>) -> Result<()> {
    Root::new(config).run(handler)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_rejects_bad_config() {
        let config = RootConfig::new().address("not-an-address");
        let err = serve(config, Arc::new(EchoHandler)).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::InvalidAddress(_))));
    }

    #[test]
    fn test_serve_rejects_zero_workers() {
        let err = serve(RootConfig::new().num_workers(0), Arc::new(EchoHandler)).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::InvalidValue(_))));
    }
}
