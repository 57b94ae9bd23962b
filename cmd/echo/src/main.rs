//! Echo server
//!
//! Echoes every byte back to the peer, logs root stats on each heartbeat
//! and runs a self-rescheduling tick task.
//!
//! # Environment Variables
//!
//! - `STELLATOR_ADDRESS` / `STELLATOR_PORT` - listen address (127.0.0.1:8080)
//! - `STELLATOR_WORKERS` - worker threads (available parallelism)
//! - `STELLATOR_LOG=debug` - tracing filter directives
//! - `ECHO_TICK_MS` - interval of the periodic task (5000, 0 disables)
//!
//! Stop with `kill -USR1 <pid>`.

use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stellator::prelude::*;
use stellator::{env_get, log};
use tracing::{debug, error, info, warn};

// STELLATOR_LOG=debug cargo run -p stellator-echo
fn main() -> ExitCode {
    log::init();

    let config = RootConfig::from_env();
    config.log_summary();

    let root = Root::new(config);
    let server = Server::builder("echo")
        .on_heartbeat(|server| debug!(server = server.name(), "server heartbeat"))
        .build();
    root.add_server(server.clone());

    root.add_heartbeat_fn(|root| {
        let stats = root.stats();
        debug!(
            heartbeats = stats.heartbeats,
            performed = stats.tasks_performed,
            scheduled = stats.tasks_scheduled,
            workers = root.threads_count(),
            "root heartbeat"
        );
    });

    let tick = Duration::from_millis(env_get("ECHO_TICK_MS", 5000u64));
    if !tick.is_zero() {
        let ticks = Arc::new(AtomicU64::new(0));
        let server = server.clone();
        root.on_child_init(move |root| {
            schedule_tick(root.clone(), server.clone(), tick, ticks.clone());
        });
    }

    if let Ok(addr) = root.config().ipv4_address() {
        info!(%addr, port = root.config().port, "echo server starting");
    }

    match root.run(Arc::new(EchoHandler)) {
        Ok(()) => {
            info!(stats = ?root.stats(), "echo server stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "echo server failed");
            ExitCode::FAILURE
        }
    }
}

/// Queue a tick that logs and queues the next one.
fn schedule_tick(root: Root, server: Server, every: Duration, ticks: Arc<AtomicU64>) {
    let next = (root.clone(), server.clone(), ticks.clone());
    let task = Task::prepare(move |t| {
        t.add_execute_fn(move |t| {
            let n = ticks.fetch_add(1, Ordering::Relaxed) + 1;
            info!(tick = n, task = %t.id(), "tick");
            true
        });
        t.add_complete_fn(move |t| {
            if t.is_successful() {
                let (root, server, ticks) = next;
                schedule_tick(root, server, every, ticks);
            }
        });
    });
    if let Err(e) = root.schedule_task(&server, task, every) {
        warn!(error = %e, "tick not scheduled");
    }
}
