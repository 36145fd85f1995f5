#![deny(unsafe_op_in_unsafe_fn)]

use std::ffi::c_void;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::native;

static DUMP_REQUESTED: AtomicBool = AtomicBool::new(false);
static QUIT_SIGNALS: AtomicUsize = AtomicUsize::new(0);

/// Handlers installed for the duration of a session. Dropping the guard puts
/// back whatever was installed before.
///
/// Installations are counted per signal, so overlapping guards leave the
/// original handler in place until the last one is dropped.
pub(crate) struct SignalGuard {
    signals: Vec<libc::c_int>,
}

struct Installed {
    signal: libc::c_int,
    users: usize,
    previous: libc::sigaction,
}

static INSTALLED: Mutex<Vec<Installed>> = Mutex::new(Vec::new());

impl SignalGuard {
    pub fn install(native_unwinding: bool, dump_on_quit: bool) -> io::Result<Self> {
        let mut guard = SignalGuard { signals: Vec::new() };
        if native_unwinding {
            acquire(libc::SIGPROF, native::sigprof_handler as usize)?;
            guard.signals.push(libc::SIGPROF);
        }
        if dump_on_quit {
            // on error the guard drops here and releases SIGPROF
            acquire(libc::SIGQUIT, sigquit_handler as usize)?;
            guard.signals.push(libc::SIGQUIT);
        }
        Ok(guard)
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        for signal in self.signals.drain(..).rev() {
            release(signal);
        }
    }
}

fn acquire(signal: libc::c_int, handler: usize) -> io::Result<()> {
    let mut installed = INSTALLED.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(entry) = installed.iter_mut().find(|e| e.signal == signal) {
        entry.users += 1;
        return Ok(());
    }
    let previous = install_handler(signal, handler)?;
    installed.push(Installed {
        signal,
        users: 1,
        previous,
    });
    Ok(())
}

fn release(signal: libc::c_int) {
    let mut installed = INSTALLED.lock().unwrap_or_else(|e| e.into_inner());
    let Some(index) = installed.iter().position(|e| e.signal == signal) else {
        return;
    };
    installed[index].users -= 1;
    if installed[index].users > 0 {
        return;
    }
    let entry = installed.swap_remove(index);
    let err = unsafe { libc::sigaction(signal, &entry.previous, std::ptr::null_mut()) };
    if err != 0 {
        log::warn!("Failed to restore handler for signal {}: {}", signal, io::Error::last_os_error());
    } else {
        log::debug!("Restored handler for signal {}", signal);
    }
}

fn install_handler(signal: libc::c_int, handler: usize) -> io::Result<libc::sigaction> {
    let mut sa: libc::sigaction = unsafe { mem::zeroed() };
    sa.sa_sigaction = handler;
    sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    unsafe { libc::sigemptyset(&mut sa.sa_mask) };

    let mut previous: libc::sigaction = unsafe { mem::zeroed() };
    let err = unsafe { libc::sigaction(signal, &sa, &mut previous) };
    if err != 0 {
        return Err(io::Error::last_os_error());
    }
    log::debug!("Installed handler for signal {}", signal);
    Ok(previous)
}

extern "C" fn sigquit_handler(_sig: libc::c_int, _info: *mut libc::siginfo_t, _ucontext: *mut c_void) {
    QUIT_SIGNALS.fetch_add(1, Ordering::Relaxed);
    DUMP_REQUESTED.store(true, Ordering::Release);
}

pub(crate) fn request_dump() {
    DUMP_REQUESTED.store(true, Ordering::Release);
}

pub(crate) fn take_dump_request() -> bool {
    DUMP_REQUESTED.swap(false, Ordering::AcqRel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quit_signal_only_raises_the_flag() {
        let guard = SignalGuard::install(false, true).unwrap();
        let before = QUIT_SIGNALS.load(Ordering::Relaxed);
        let rc = unsafe { libc::pthread_kill(libc::pthread_self(), libc::SIGQUIT) };
        assert_eq!(rc, 0);
        // delivered synchronously to the calling thread
        assert!(QUIT_SIGNALS.load(Ordering::Relaxed) > before);
        drop(guard);
    }

    #[test]
    fn overlapping_guards_share_one_installation() {
        let first = SignalGuard::install(false, true).unwrap();
        let second = SignalGuard::install(false, true).unwrap();
        drop(first);
        let before = QUIT_SIGNALS.load(Ordering::Relaxed);
        unsafe { libc::pthread_kill(libc::pthread_self(), libc::SIGQUIT) };
        assert!(QUIT_SIGNALS.load(Ordering::Relaxed) > before);
        drop(second);
    }
}
