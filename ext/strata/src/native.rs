#![deny(unsafe_op_in_unsafe_fn)]

//! Native stacks interleaved with interpreted ones.
//!
//! The sampler sends `SIGPROF` to the target thread. The handler records raw
//! instruction pointers into a static slot and then holds the thread until the
//! sampler has walked its interpreter frames, so both halves describe the same
//! instant. Symbolization happens afterwards, on the sampler thread.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::error::CaptureError;
use crate::runtime::ThreadId;
use crate::sample::{Frame, FrameKind};
use crate::walker::WalkedFrame;

pub const MAX_NATIVE_DEPTH: usize = 256;
pub const DEFAULT_EVAL_SYMBOLS: &[&str] = &["_PyEval_EvalFrameDefault"];

const SYMBOL_CACHE_CAPACITY: usize = 4096;
const CAPTURE_TIMEOUT: Duration = Duration::from_millis(50);
const MIN_HOLD: Duration = Duration::from_millis(1);
const MAX_HOLD: Duration = Duration::from_millis(100);

// Longest a held thread waits for the sampler; set from the sampling interval.
static HOLD_LIMIT_NS: AtomicU64 = AtomicU64::new(MAX_HOLD.as_nanos() as u64);

const IDLE: u8 = 0;
const REQUESTED: u8 = 1;
const CAPTURING: u8 = 2;
const CAPTURED: u8 = 3;
const RELEASED: u8 = 4;

struct NativeSlot {
    state: AtomicU8,
    depth: AtomicUsize,
    ips: [AtomicUsize; MAX_NATIVE_DEPTH],
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_IP: AtomicUsize = AtomicUsize::new(0);

static SLOT: NativeSlot = NativeSlot {
    state: AtomicU8::new(IDLE),
    depth: AtomicUsize::new(0),
    ips: [EMPTY_IP; MAX_NATIVE_DEPTH],
};

/// A thread is never held for longer than one sampling interval.
fn hold_limit(interval: Duration) -> Duration {
    interval.clamp(MIN_HOLD, MAX_HOLD)
}

fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

// Only touches atomics, the unwinder and clock_gettime.
pub(crate) extern "C" fn sigprof_handler(_sig: libc::c_int, _info: *mut libc::siginfo_t, _ucontext: *mut c_void) {
    if SLOT
        .state
        .compare_exchange(REQUESTED, CAPTURING, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let mut depth = 0;
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            if depth >= MAX_NATIVE_DEPTH {
                return false;
            }
            SLOT.ips[depth].store(frame.ip() as usize, Ordering::Relaxed);
            depth += 1;
            true
        });
    }
    SLOT.depth.store(depth, Ordering::Relaxed);
    SLOT.state.store(CAPTURED, Ordering::Release);

    let deadline = monotonic_ns() + HOLD_LIMIT_NS.load(Ordering::Relaxed);
    loop {
        match SLOT.state.load(Ordering::Acquire) {
            RELEASED => {
                SLOT.state.store(IDLE, Ordering::Release);
                return;
            }
            CAPTURED => {}
            _ => return,
        }
        if monotonic_ns() >= deadline
            && SLOT
                .state
                .compare_exchange(CAPTURED, IDLE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return;
        }
        std::hint::spin_loop();
    }
}

/// Captures and symbolizes native stacks.
pub struct NativeUnwinder {
    symbols: LruCache<usize, Frame>,
    eval_symbols: Vec<String>,
}

impl NativeUnwinder {
    pub fn new(eval_symbols: Vec<String>, interval: Duration) -> Self {
        HOLD_LIMIT_NS.store(hold_limit(interval).as_nanos() as u64, Ordering::Relaxed);
        let capacity = NonZeroUsize::new(SYMBOL_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            symbols: LruCache::new(capacity),
            eval_symbols,
        }
    }

    pub fn eval_symbols(&self) -> &[String] {
        &self.eval_symbols
    }

    /// Interrupts `thread_id`, records its native stack and runs `during`
    /// while the thread is held. Requires the `SIGPROF` handler to be installed.
    pub fn capture<R>(&mut self, thread_id: ThreadId, during: impl FnOnce() -> R) -> Result<(Vec<usize>, R), CaptureError> {
        if thread_id == unsafe { libc::pthread_self() } as ThreadId {
            return Ok(self.capture_current(during));
        }

        let deadline = Instant::now() + CAPTURE_TIMEOUT;
        while SLOT
            .state
            .compare_exchange(IDLE, REQUESTED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            if Instant::now() >= deadline {
                return Err(CaptureError::NativeTimeout { thread_id });
            }
            thread::yield_now();
        }

        let rc = unsafe { libc::pthread_kill(thread_id as libc::pthread_t, libc::SIGPROF) };
        if rc != 0 {
            SLOT.state.store(IDLE, Ordering::Release);
            return Err(CaptureError::Signal { thread_id, errno: rc });
        }

        loop {
            match SLOT.state.load(Ordering::Acquire) {
                CAPTURED => break,
                REQUESTED if Instant::now() >= deadline => {
                    if SLOT
                        .state
                        .compare_exchange(REQUESTED, IDLE, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return Err(CaptureError::NativeTimeout { thread_id });
                    }
                }
                // the handler gave up on us before we saw the capture
                IDLE => return Err(CaptureError::NativeTimeout { thread_id }),
                _ => {}
            }
            std::hint::spin_loop();
        }

        let depth = SLOT.depth.load(Ordering::Relaxed).min(MAX_NATIVE_DEPTH);
        let ips: Vec<usize> = SLOT.ips[..depth].iter().map(|ip| ip.load(Ordering::Relaxed)).collect();
        let result = during();

        let held = SLOT
            .state
            .compare_exchange(CAPTURED, RELEASED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !held {
            // the thread resumed before the walk finished
            return Err(CaptureError::NativeTimeout { thread_id });
        }
        Ok((ips, result))
    }

    /// Same as [`NativeUnwinder::capture`] for the calling thread, without signals.
    pub fn capture_current<R>(&mut self, during: impl FnOnce() -> R) -> (Vec<usize>, R) {
        let mut ips = Vec::with_capacity(64);
        backtrace::trace(|frame| {
            ips.push(frame.ip() as usize);
            ips.len() < MAX_NATIVE_DEPTH
        });
        (ips, during())
    }

    /// Resolves instruction pointers, dropping the profiler's own frames at the top.
    pub fn symbolize(&mut self, ips: &[usize]) -> Vec<Frame> {
        let mut frames = Vec::with_capacity(ips.len());
        for &ip in ips {
            if let Some(frame) = self.symbols.get(&ip) {
                frames.push(frame.clone());
                continue;
            }
            let frame = resolve_ip(ip);
            self.symbols.put(ip, frame.clone());
            frames.push(frame);
        }
        strip_own_frames(frames)
    }

    pub fn splice(&self, native: &[Frame], interpreted: &[WalkedFrame]) -> Vec<Frame> {
        splice(native, interpreted, &self.eval_symbols)
    }
}

fn resolve_ip(ip: usize) -> Frame {
    let mut resolved = None;
    backtrace::resolve(ip as *mut c_void, |symbol| {
        if resolved.is_some() {
            return;
        }
        let name = match symbol.name() {
            Some(name) => format!("{:#}", name),
            None => format!("{:#x}", ip),
        };
        let file = symbol
            .filename()
            .map(|path| path.display().to_string())
            .unwrap_or_default();
        resolved = Some(Frame::native(name, file, symbol.lineno().unwrap_or(0)));
    });
    resolved.unwrap_or_else(|| Frame::native(format!("{:#x}", ip), "", 0))
}

fn is_own_frame(frame: &Frame) -> bool {
    const MARKERS: &[&str] = &["backtrace::", "strata::", "__restore_rt", "sigprof_handler"];
    MARKERS.iter().any(|marker| frame.name.contains(marker))
}

pub(crate) fn strip_own_frames(mut frames: Vec<Frame>) -> Vec<Frame> {
    let own = frames.iter().take_while(|f| is_own_frame(f)).count();
    frames.drain(..own);
    frames
}

fn is_eval_entry(frame: &Frame, eval_symbols: &[String]) -> bool {
    frame.kind == FrameKind::Native
        && eval_symbols.iter().any(|symbol| {
            frame
                .name
                .strip_prefix(symbol.as_str())
                .map_or(false, |rest| rest.is_empty() || rest.starts_with('.'))
        })
}

/// Replaces every evaluation-loop frame in `native` with the interpreted
/// frames it was running: from the next unconsumed frame up to and including
/// the next entry frame. Both inputs are innermost first.
pub fn splice(native: &[Frame], interpreted: &[WalkedFrame], eval_symbols: &[String]) -> Vec<Frame> {
    let mut frames = Vec::with_capacity(native.len() + interpreted.len());
    let mut remaining = interpreted.iter();
    for frame in native {
        if !is_eval_entry(frame, eval_symbols) {
            frames.push(frame.clone());
            continue;
        }
        for walked in remaining.by_ref() {
            frames.push(walked.frame.clone());
            if walked.is_entry {
                break;
            }
        }
    }
    // interpreted frames whose evaluation loop frame the unwinder never reached
    frames.extend(remaining.map(|w| w.frame.clone()));
    frames
}
