//! Host requests that arrive asynchronously (Ctrl-C, save-state).
//!
//! Handlers only store to atomics; the session polls the flags between instructions.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

#[derive(Debug, Clone, Default)]
pub struct HostSignals {
    halt: Arc<AtomicBool>,
    snapshot: Arc<AtomicBool>,
}

static INSTALLED: OnceLock<HostSignals> = OnceLock::new();

impl HostSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_halt(&self) {
        self.halt.store(true, Ordering::SeqCst);
    }

    pub fn request_snapshot(&self) {
        self.snapshot.store(true, Ordering::SeqCst);
    }

    pub fn halt_requested(&self) -> bool {
        self.halt.load(Ordering::SeqCst)
    }

    /// Consume a pending snapshot request.
    pub fn take_snapshot_request(&self) -> bool {
        self.snapshot.swap(false, Ordering::SeqCst)
    }

    /// Route SIGINT to a halt request and SIGUSR1 to a snapshot request.
    #[cfg(unix)]
    pub fn install() -> io::Result<Self> {
        let signals = INSTALLED.get_or_init(HostSignals::new).clone();
        let handlers: [(libc::c_int, extern "C" fn(libc::c_int)); 2] =
            [(libc::SIGINT, on_sigint), (libc::SIGUSR1, on_sigusr1)];
        for (signum, handler) in handlers {
            // SAFETY: the handlers only perform atomic stores on already-initialised data.
            let previous = unsafe { libc::signal(signum, handler as libc::sighandler_t) };
            if previous == libc::SIG_ERR {
                return Err(io::Error::last_os_error());
            }
        }
        tracing::debug!("installed SIGINT/SIGUSR1 handlers");
        Ok(signals)
    }

    #[cfg(not(unix))]
    pub fn install() -> io::Result<Self> {
        Ok(INSTALLED.get_or_init(HostSignals::new).clone())
    }
}

#[cfg(unix)]
extern "C" fn on_sigint(_: libc::c_int) {
    if let Some(signals) = INSTALLED.get() {
        signals.request_halt();
    }
}

#[cfg(unix)]
extern "C" fn on_sigusr1(_: libc::c_int) {
    if let Some(signals) = INSTALLED.get() {
        signals.request_snapshot();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_request_is_consumed_once() {
        let signals = HostSignals::new();
        assert!(!signals.take_snapshot_request());
        signals.request_snapshot();
        assert!(signals.take_snapshot_request());
        assert!(!signals.take_snapshot_request());
    }

    #[test]
    fn clones_share_flags() {
        let signals = HostSignals::new();
        let handle = signals.clone();
        handle.request_halt();
        assert!(signals.halt_requested());
    }

    #[cfg(unix)]
    #[test]
    fn sigusr1_sets_the_snapshot_flag() {
        let signals = HostSignals::install().unwrap();
        // SAFETY: raising a signal whose handler was just installed.
        unsafe {
            libc::raise(libc::SIGUSR1);
        }
        assert!(signals.take_snapshot_request());
    }
}
