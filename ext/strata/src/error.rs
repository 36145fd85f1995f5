use std::io;

use thiserror::Error;

use crate::runtime::ThreadId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced to whoever drives a profiling session.
///
/// Per-sample failures ([`CaptureError`]) normally never reach this level: the
/// sampler turns them into error-marker records and keeps going.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("target process {pid} is not running")]
    TargetExited { pid: i32 },

    #[error("failed to set up {what}: {source}")]
    Resource {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to inject into process {pid}: {reason}")]
    Injection { pid: i32, reason: String },

    #[error("a profiling session is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn resource(what: &'static str, source: io::Error) -> Self {
        Error::Resource { what, source }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("interval must be positive")]
    NonPositiveInterval,

    #[error("exposure time must be positive")]
    NonPositiveExposure,

    #[error("cannot attach to a process and request a where dump at the same time")]
    ConflictingTargets,

    #[error("cannot use both cpu and memory modes")]
    CpuWithMemory,

    #[error("process id must be positive, got {0}")]
    InvalidPid(i64),

    #[error("no command given")]
    EmptyCommand,

    #[error("invalid value {value:?} for {option}")]
    InvalidValue { option: &'static str, value: String },
}

/// A failed read of target memory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot read {len} bytes at {addr:#x} (errno {errno})")]
pub struct VmError {
    pub addr: usize,
    pub len: usize,
    pub errno: i32,
}

impl VmError {
    pub fn new(addr: usize, len: usize, errno: i32) -> Self {
        Self { addr, len, errno }
    }
}

/// Transient failure of a single capture.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("frame chain of thread {thread_id} changed during capture")]
    Stale { thread_id: ThreadId },

    #[error("unreadable target memory: {0}")]
    Memory(#[from] VmError),

    #[error("stack deeper than {0} frames")]
    TooDeep(usize),

    #[error("native unwinding of thread {thread_id} timed out")]
    NativeTimeout { thread_id: ThreadId },

    #[error("cannot signal thread {thread_id} (errno {errno})")]
    Signal { thread_id: ThreadId, errno: i32 },

    #[error("thread {0} is not known to the runtime")]
    UnknownThread(ThreadId),
}
