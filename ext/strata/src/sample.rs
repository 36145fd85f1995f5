use std::fmt;

use crate::error::CaptureError;
use crate::runtime::{TaskId, ThreadId};

pub const MAX_STACK_DEPTH: usize = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    Interpreted,
    Native,
    /// Synthetic frame naming the task whose frames sit below it.
    TaskBoundary,
}

impl FrameKind {
    pub(crate) fn code(self) -> u8 {
        match self {
            FrameKind::Interpreted => 0,
            FrameKind::Native => 1,
            FrameKind::TaskBoundary => 2,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(FrameKind::Interpreted),
            1 => Some(FrameKind::Native),
            2 => Some(FrameKind::TaskBoundary),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Frame {
    pub name: String,
    pub file: String,
    pub line: u32,
    pub kind: FrameKind,
}

impl Frame {
    pub fn interpreted(name: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            name: name.into(),
            file: file.into(),
            line,
            kind: FrameKind::Interpreted,
        }
    }

    pub fn native(name: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            name: name.into(),
            file: file.into(),
            line,
            kind: FrameKind::Native,
        }
    }

    pub fn task_boundary(task_name: impl Into<String>) -> Self {
        Self {
            name: task_name.into(),
            file: String::new(),
            line: 0,
            kind: FrameKind::TaskBoundary,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FrameKind::TaskBoundary => write!(f, "[task] {}", self.name),
            FrameKind::Interpreted => {
                write!(f, "File \"{}\", line {}, in {}", self.file, self.line, self.name)
            }
            FrameKind::Native if self.file.is_empty() => write!(f, "[native] {}", self.name),
            FrameKind::Native => {
                write!(f, "[native] {} ({}:{})", self.name, self.file, self.line)
            }
        }
    }
}

/// Cost attributed to one sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Metric {
    /// Wall-clock microseconds since the thread's previous sample.
    WallTime(u64),
    /// CPU microseconds consumed since the thread's previous sample.
    CpuTime(u64),
    Allocation { address: u64, size: u64 },
    Free { address: u64, size: u64 },
}

/// One captured stack, innermost frame first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample {
    pub thread_id: ThreadId,
    pub task_id: Option<TaskId>,
    pub metric: Metric,
    pub frames: Vec<Frame>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureReason {
    Stale,
    Memory,
    TooDeep,
    NativeTimeout,
    Signal,
    UnknownThread,
    Other(u8),
}

impl FailureReason {
    pub(crate) fn code(self) -> u8 {
        match self {
            FailureReason::Stale => 1,
            FailureReason::Memory => 2,
            FailureReason::TooDeep => 3,
            FailureReason::NativeTimeout => 4,
            FailureReason::Signal => 5,
            FailureReason::UnknownThread => 6,
            FailureReason::Other(code) => code,
        }
    }

    pub(crate) fn from_code(code: u8) -> Self {
        match code {
            1 => FailureReason::Stale,
            2 => FailureReason::Memory,
            3 => FailureReason::TooDeep,
            4 => FailureReason::NativeTimeout,
            5 => FailureReason::Signal,
            6 => FailureReason::UnknownThread,
            other => FailureReason::Other(other),
        }
    }
}

impl From<&CaptureError> for FailureReason {
    fn from(error: &CaptureError) -> Self {
        match error {
            CaptureError::Stale { .. } => FailureReason::Stale,
            CaptureError::Memory(_) => FailureReason::Memory,
            CaptureError::TooDeep(_) => FailureReason::TooDeep,
            CaptureError::NativeTimeout { .. } => FailureReason::NativeTimeout,
            CaptureError::Signal { .. } => FailureReason::Signal,
            CaptureError::UnknownThread(_) => FailureReason::UnknownThread,
        }
    }
}

/// Stands in for a sample that could not be captured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ErrorMarker {
    pub thread_id: ThreadId,
    pub reason: FailureReason,
}

impl ErrorMarker {
    pub fn new(thread_id: ThreadId, error: &CaptureError) -> Self {
        Self {
            thread_id,
            reason: FailureReason::from(error),
        }
    }
}
