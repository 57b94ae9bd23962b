//! Signal plumbing
//!
//! - `SIGUSR1`/`SIGUSR2` request shutdown. They are ignored process-wide
//!   and blocked, and the root thread collects them with `sigtimedwait`.
//! - `SIGPIPE` is ignored; peers that vanish surface as write errors.
//! - `SIGHUP`/`SIGALRM` are blocked and drained by the workers through a
//!   `signalfd`, so they are logged instead of killing the process.

use nix::sys::pthread::{pthread_kill, Pthread};
use nix::sys::signal::{
    pthread_sigmask, sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use std::io;
use std::time::Duration;
use stellator_core::{Error, Result};

/// Signals that end the root loop.
pub const SHUTDOWN: [Signal; 2] = [Signal::SIGUSR1, Signal::SIGUSR2];

/// Signals ignored for as long as the root runs.
pub const IGNORED: [Signal; 3] = [Signal::SIGUSR1, Signal::SIGUSR2, Signal::SIGPIPE];

/// Signals consumed and logged by the workers.
pub const LOGGED: [Signal; 2] = [Signal::SIGHUP, Signal::SIGALRM];

fn set_of(signals: &[Signal]) -> SigSet {
    let mut set = SigSet::empty();
    for &sig in signals {
        set.add(sig);
    }
    set
}

pub fn shutdown_set() -> SigSet {
    set_of(&SHUTDOWN)
}

pub fn logged_set() -> SigSet {
    set_of(&LOGGED)
}

fn signal_err(op: &'static str) -> impl FnOnce(nix::Error) -> Error {
    move |errno| Error::Signal {
        op,
        source: io::Error::from(errno),
    }
}

/// Process dispositions and the calling thread's mask for the lifetime of
/// a root loop. Both are restored on drop.
pub struct SignalGuard {
    old_mask: SigSet,
    old_actions: Vec<(Signal, SigAction)>,
}

impl SignalGuard {
    pub fn install() -> Result<Self> {
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        let mut guard = SignalGuard {
            old_mask: SigSet::empty(),
            old_actions: Vec::with_capacity(IGNORED.len()),
        };
        for sig in IGNORED {
            // SAFETY: installing SIG_IGN runs no user code in signal context
            let old = unsafe { sigaction(sig, &ignore) }.map_err(signal_err("sigaction"))?;
            guard.old_actions.push((sig, old));
        }

        let mut block = set_of(&IGNORED);
        for sig in LOGGED {
            block.add(sig);
        }
        let mut old_mask = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&block), Some(&mut old_mask))
            .map_err(signal_err("pthread_sigmask"))?;
        guard.old_mask = old_mask;
        Ok(guard)
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.old_mask), None) {
            tracing::warn!(error = %e, "failed to restore signal mask");
        }
        for (sig, action) in self.old_actions.drain(..).rev() {
            // SAFETY: restores the disposition that was in place before install
            if let Err(e) = unsafe { sigaction(sig, &action) } {
                tracing::warn!(signal = sig.as_str(), error = %e, "failed to restore signal action");
            }
        }
    }
}

/// Block the shutdown and logged signals on the calling worker thread.
pub fn block_worker_signals() -> Result<()> {
    let mut block = shutdown_set();
    for sig in LOGGED {
        block.add(sig);
    }
    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&block), None)
        .map_err(signal_err("pthread_sigmask"))
}

/// Non-blocking signalfd over the logged set.
pub fn logged_signal_fd() -> Result<SignalFd> {
    SignalFd::with_flags(&logged_set(), SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
        .map_err(signal_err("signalfd"))
}

/// Wait for a shutdown signal on the calling thread.
///
/// Returns `Ok(None)` when `timeout` elapsed. `EINTR` is returned as an
/// `Interrupted` error for the caller to retry.
pub fn wait_shutdown(timeout: Duration) -> io::Result<Option<Signal>> {
    let set = shutdown_set();
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    let ret = unsafe { libc::sigtimedwait(set.as_ref(), std::ptr::null_mut(), &ts) };
    if ret >= 0 {
        return Ok(Signal::try_from(ret).ok());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EAGAIN) {
        Ok(None)
    } else {
        Err(err)
    }
}

/// Consume shutdown signals still pending on the calling thread.
pub fn drain_pending() -> usize {
    let mut drained = 0;
    while let Ok(Some(_)) = wait_shutdown(Duration::ZERO) {
        drained += 1;
    }
    drained
}

/// Ask the root thread to shut down.
pub fn notify_shutdown(thread: Pthread) -> Result<()> {
    pthread_kill(thread, Signal::SIGUSR1).map_err(signal_err("pthread_kill"))
}

/// Human readable signal name, `"UNKNOWN"` for numbers nix does not know.
pub fn signal_name(signo: i32) -> &'static str {
    Signal::try_from(signo).map(|s| s.as_str()).unwrap_or("UNKNOWN")
}
