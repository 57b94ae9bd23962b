//! # stellator-core
//!
//! Core types for the stellator connection engine and task scheduler.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! All Linux-specific machinery (epoll, eventfd, signals) lives in
//! `stellator-runtime`.
//!
//! ## Modules
//!
//! - `task` - unit of deferred work (execute + completion callbacks)
//! - `group` - `TaskGroup`, batched completion tracking with blocking wait
//! - `server` - opaque `Server` handle and storage capability traits
//! - `tls` - thread-local "current task" context
//! - `error` - error types
//! - `env` - environment variable utilities
//! - `log` - `tracing` subscriber bootstrap

pub mod error;
pub mod env;
pub mod log;
pub mod server;
pub mod task;
pub mod group;
pub mod tls;
pub mod sync;

// Re-exports for convenience
pub use error::{ConfigError, Error, Result};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str};
pub use server::{Server, ServerBuilder, StorageHandle, StorageProvider};
pub use task::{Priority, Task, TaskId};
pub use group::TaskGroup;
