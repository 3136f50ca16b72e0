//! Keeps `mjtest` alive while the runtime runs so the env-file can be cleaned
//! up when the user or a CI runner stops the tool.
//!
//! While a [`SignalGuard`] is held, SIGINT, SIGTERM and SIGHUP no longer kill
//! this process. SIGTERM and SIGHUP are forwarded to the child. SIGINT is only
//! recorded, because a terminal already delivers it to the whole foreground
//! process group. A signal that arrives before the child exists is delivered
//! to it as soon as [`SignalGuard::watch`] is called.

use std::io;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

const HANDLED: [libc::c_int; 3] = [libc::SIGINT, libc::SIGTERM, libc::SIGHUP];

static CHILD_PID: AtomicI32 = AtomicI32::new(0);
static RECEIVED: AtomicI32 = AtomicI32::new(0);
// One guard per process; handlers and the statics above are global.
static GUARD_LOCK: Mutex<()> = Mutex::new(());

extern "C" fn on_signal(signal: libc::c_int) {
    RECEIVED.store(signal, Ordering::SeqCst);
    if signal == libc::SIGINT {
        return;
    }
    let pid = CHILD_PID.load(Ordering::SeqCst);
    if pid > 0 {
        // kill(2) is async-signal-safe.
        unsafe {
            libc::kill(pid, signal);
        }
    }
}

pub(crate) struct SignalGuard {
    previous: Vec<(libc::c_int, libc::sigaction)>,
    _lock: MutexGuard<'static, ()>,
}

impl SignalGuard {
    pub(crate) fn install() -> io::Result<Self> {
        let lock = GUARD_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        CHILD_PID.store(0, Ordering::SeqCst);
        RECEIVED.store(0, Ordering::SeqCst);

        let mut guard = Self {
            previous: Vec::with_capacity(HANDLED.len()),
            _lock: lock,
        };

        let handler: extern "C" fn(libc::c_int) = on_signal;
        // SAFETY: a zeroed sigaction is a valid starting value; every field
        // that matters is set below.
        let mut action: libc::sigaction = unsafe { MaybeUninit::zeroed().assume_init() };
        action.sa_sigaction = handler as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        unsafe {
            libc::sigemptyset(&mut action.sa_mask);
        }

        for signal in HANDLED {
            let mut old: libc::sigaction = unsafe { MaybeUninit::zeroed().assume_init() };
            if unsafe { libc::sigaction(signal, &action, &mut old) } != 0 {
                // Dropping `guard` restores whatever was installed so far.
                return Err(io::Error::last_os_error());
            }
            guard.previous.push((signal, old));
        }

        Ok(guard)
    }

    /// Start forwarding to `pid`, delivering anything received before spawn.
    pub(crate) fn watch(&self, pid: u32) {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return;
        };
        CHILD_PID.store(pid, Ordering::SeqCst);

        let pending = RECEIVED.load(Ordering::SeqCst);
        if pending != 0 {
            debug!(signal = pending, pid, "delivering signal received before spawn");
            unsafe {
                libc::kill(pid, pending);
            }
        }
    }

    /// The last termination signal received while the guard was held.
    pub(crate) fn received(&self) -> Option<i32> {
        match RECEIVED.load(Ordering::SeqCst) {
            0 => None,
            signal => Some(signal),
        }
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        CHILD_PID.store(0, Ordering::SeqCst);
        for (signal, old) in self.previous.drain(..).rev() {
            unsafe {
                libc::sigaction(signal, &old, std::ptr::null_mut());
            }
        }
    }
}
