use std::collections::BTreeMap;
use std::io;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::runtime::ThreadId;

#[derive(Clone, Debug)]
pub struct ThreadRecord {
    pub thread_id: ThreadId,
    pub name: String,
    /// Kernel thread id, used to match the threads excluded in stealth mode.
    /// Zero for threads only the interpreter reported.
    pub native_id: i64,
    /// Found in the interpreter's thread list rather than announced by the host.
    adopted: bool,
    last_wall: Instant,
    last_cpu: Option<Duration>,
    name_reported: bool,
}

impl ThreadRecord {
    pub fn new(thread_id: ThreadId, name: impl Into<String>, native_id: i64) -> Self {
        Self {
            thread_id,
            name: name.into(),
            native_id,
            adopted: false,
            last_wall: Instant::now(),
            last_cpu: None,
            name_reported: false,
        }
    }

    /// Wall time elapsed since the previous sample of this thread.
    pub fn advance_wall(&mut self, now: Instant) -> Duration {
        let delta = now.saturating_duration_since(self.last_wall);
        self.last_wall = now;
        delta
    }

    /// CPU time consumed since the previous call, or `None` when the thread
    /// has not run in between (or its clock cannot be read).
    pub fn advance_cpu(&mut self) -> Option<Duration> {
        let now = match thread_cpu_time(self.thread_id) {
            Ok(now) => now,
            Err(e) => {
                log::trace!("Cannot read CPU clock of thread {}: {}", self.thread_id, e);
                return None;
            }
        };
        let previous = self.last_cpu.replace(now);
        let delta = now.saturating_sub(previous.unwrap_or_default());
        (!delta.is_zero()).then_some(delta)
    }

    /// True the first time it is called after the thread was tracked or renamed.
    pub(crate) fn take_name_report(&mut self) -> bool {
        !std::mem::replace(&mut self.name_reported, true)
    }
}

/// CPU time consumed by a thread identified by its `pthread_t`.
pub fn thread_cpu_time(thread_id: ThreadId) -> io::Result<Duration> {
    let mut clock: libc::clockid_t = 0;
    let rc = unsafe { libc::pthread_getcpuclockid(thread_id as libc::pthread_t, &mut clock) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    if unsafe { libc::clock_gettime(clock, &mut ts) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
}

/// Threads the event source has told us about.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: Mutex<BTreeMap<ThreadId, ThreadRecord>>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_thread(&self, thread_id: ThreadId, name: &str, native_id: i64) {
        let Ok(mut threads) = self.threads.lock() else {
            return;
        };
        match threads.get_mut(&thread_id) {
            Some(record) => {
                if record.name != name {
                    record.name = name.to_string();
                    record.name_reported = false;
                }
                record.native_id = native_id;
                record.adopted = false;
            }
            None => {
                log::debug!("Tracking thread {} ({})", thread_id, name);
                threads.insert(thread_id, ThreadRecord::new(thread_id, name, native_id));
            }
        }
    }

    pub fn untrack_thread(&self, thread_id: ThreadId) {
        if let Ok(mut threads) = self.threads.lock() {
            if threads.remove(&thread_id).is_some() {
                log::debug!("Untracked thread {}", thread_id);
            }
        }
    }

    /// Reconciles with the interpreter's own thread list. Threads missing
    /// from the registry get a placeholder name until the host names them;
    /// placeholders whose thread has gone are dropped.
    pub fn sync(&self, live: &[ThreadId]) {
        let Ok(mut threads) = self.threads.lock() else {
            return;
        };
        threads.retain(|thread_id, record| !record.adopted || live.contains(thread_id));
        for &thread_id in live {
            threads.entry(thread_id).or_insert_with(|| {
                log::debug!("Found untracked thread {}", thread_id);
                let mut record = ThreadRecord::new(thread_id, format!("Thread-{:#x}", thread_id), 0);
                record.adopted = true;
                record
            });
        }
    }

    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.threads
            .lock()
            .map(|threads| threads.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.threads.lock().map(|threads| threads.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `f` on the record of `thread_id`, if it is still tracked.
    pub fn with_record<R>(&self, thread_id: ThreadId, f: impl FnOnce(&mut ThreadRecord) -> R) -> Option<R> {
        let mut threads = self.threads.lock().ok()?;
        threads.get_mut(&thread_id).map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_and_untracks() {
        let registry = ThreadRegistry::new();
        registry.track_thread(2, "worker", 102);
        registry.track_thread(1, "MainThread", 101);
        assert_eq!(registry.thread_ids(), vec![1, 2]);

        registry.untrack_thread(2);
        registry.untrack_thread(7);
        assert_eq!(registry.thread_ids(), vec![1]);
    }

    #[test]
    fn interpreter_threads_fill_the_gaps() {
        let registry = ThreadRegistry::new();
        registry.track_thread(1, "MainThread", 101);
        registry.sync(&[1, 2, 3]);
        assert_eq!(registry.thread_ids(), vec![1, 2, 3]);
        assert_eq!(registry.with_record(2, |r| r.name.clone()), Some("Thread-0x2".to_string()));

        registry.track_thread(3, "worker", 103);
        registry.sync(&[1]);
        assert_eq!(registry.thread_ids(), vec![1, 3]);
        assert_eq!(registry.with_record(3, |r| r.take_name_report()), Some(true));
    }

    #[test]
    fn renaming_reports_the_name_again() {
        let registry = ThreadRegistry::new();
        registry.track_thread(1, "Thread-1", 101);
        assert_eq!(registry.with_record(1, |r| r.take_name_report()), Some(true));
        assert_eq!(registry.with_record(1, |r| r.take_name_report()), Some(false));

        registry.track_thread(1, "Thread-1", 101);
        assert_eq!(registry.with_record(1, |r| r.take_name_report()), Some(false));

        registry.track_thread(1, "poller", 101);
        assert_eq!(registry.with_record(1, |r| r.take_name_report()), Some(true));
        assert_eq!(registry.with_record(1, |r| r.name.clone()), Some("poller".to_string()));
    }

    #[test]
    fn wall_deltas_are_monotonic() {
        let mut record = ThreadRecord::new(1, "MainThread", 1);
        let start = Instant::now();
        record.advance_wall(start);
        let delta = record.advance_wall(start + Duration::from_millis(3));
        assert_eq!(delta, Duration::from_millis(3));
        assert_eq!(record.advance_wall(start), Duration::ZERO);
    }

    #[test]
    fn cpu_time_advances_only_while_running() {
        let thread_id = unsafe { libc::pthread_self() } as ThreadId;
        let mut record = ThreadRecord::new(thread_id, "test", 0);
        record.advance_cpu();

        let deadline = Instant::now() + Duration::from_millis(20);
        let mut spin = 0u64;
        while Instant::now() < deadline {
            spin = spin.wrapping_add(1);
        }
        assert!(spin > 0);
        assert!(record.advance_cpu().is_some());
    }
}
