//! The narrow read-only view of interpreter state the profiler samples from.

#[cfg(test)]
pub(crate) mod fake;
pub mod layout;
pub mod mapped;

use crate::error::{CaptureError, VmError};

/// Identity of an interpreter thread. Equal to the thread's `pthread_t`.
pub type ThreadId = u64;
/// Address of a task object; stable for the task's lifetime and reused afterwards.
pub type TaskId = u64;
/// Address of an event loop object.
pub type LoopId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameRef(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeRef(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuntimeVersion {
    pub major: u8,
    pub minor: u8,
}

impl RuntimeVersion {
    pub fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

/// Snapshot of a thread's frame-chain head.
///
/// `generation` changes whenever the chain is pushed, popped or advanced, so a
/// walk bracketed by two equal snapshots saw a consistent chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadState {
    pub top_frame: Option<FrameRef>,
    pub generation: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawFrame {
    pub code: CodeRef,
    /// Byte offset of the last executed instruction.
    pub instr_offset: u32,
    pub previous: Option<FrameRef>,
    /// Whether this frame was pushed by a fresh entry into the evaluation loop.
    pub is_entry: bool,
    /// Interpreter-internal frames that never show up in a stack.
    pub is_shim: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeUnit {
    pub name: String,
    pub qualname: Option<String>,
    pub filename: String,
    pub first_line: u32,
    pub line_table: Vec<u8>,
}

impl CodeUnit {
    pub fn display_name(&self) -> &str {
        self.qualname.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskState {
    /// Frames of the task's suspended coroutine chain, outermost first.
    pub coroutine: Vec<FrameRef>,
    /// The task this one is directly awaiting, if it awaits a task at all.
    pub awaiting: Option<TaskId>,
    pub done: bool,
    /// Only known when the build describes where tasks keep them.
    pub name: Option<String>,
    pub loop_id: Option<LoopId>,
}

/// A runtime collection whose members are task objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskContainer {
    /// A set holding the tasks themselves.
    Set(usize),
    /// A set holding weak references to the tasks.
    WeakSet(usize),
}

impl TaskContainer {
    pub fn address(self) -> usize {
        match self {
            TaskContainer::Set(address) | TaskContainer::WeakSet(address) => address,
        }
    }
}

pub trait Runtime: Send + Sync {
    fn version(&self) -> RuntimeVersion;

    /// Every thread the interpreter currently knows, in list order.
    fn thread_ids(&self) -> Result<Vec<ThreadId>, VmError>;

    fn thread_state(&self, thread_id: ThreadId) -> Result<ThreadState, CaptureError>;

    fn frame(&self, frame: FrameRef) -> Result<RawFrame, VmError>;

    fn code(&self, code: CodeRef) -> Result<CodeUnit, VmError>;

    fn task(&self, task: TaskId) -> Result<TaskState, VmError>;

    /// Members of a task container. Dead weak references are skipped.
    fn container_tasks(&self, container: TaskContainer) -> Result<Vec<TaskId>, VmError>;

    /// True once the interpreter has begun shutting down.
    fn is_finalizing(&self) -> bool {
        false
    }
}
