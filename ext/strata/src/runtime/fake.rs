use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::*;

/// In-memory runtime whose frame chains are assembled by hand.
pub(crate) struct FakeRuntime {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    next_address: usize,
    threads: HashMap<ThreadId, ThreadState>,
    frames: HashMap<FrameRef, RawFrame>,
    codes: HashMap<CodeRef, CodeUnit>,
    tasks: HashMap<TaskId, TaskState>,
    containers: HashMap<usize, Vec<TaskId>>,
    churning: HashSet<ThreadId>,
    finalizing: bool,
}

impl State {
    fn allocate(&mut self) -> usize {
        self.next_address += 0x100;
        self.next_address
    }

    fn new_frame(&mut self, name: &str, file: &str, line: u32, previous: Option<FrameRef>) -> FrameRef {
        let code = CodeRef(self.allocate());
        self.codes.insert(
            code,
            CodeUnit {
                name: name.to_string(),
                qualname: None,
                filename: file.to_string(),
                first_line: line,
                line_table: Vec::new(),
            },
        );
        let frame = FrameRef(self.allocate());
        self.frames.insert(
            frame,
            RawFrame {
                code,
                instr_offset: 0,
                previous,
                is_entry: previous.is_none(),
                is_shim: false,
            },
        );
        frame
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_address: 0x1000,
                ..State::default()
            }),
        }
    }

    /// Replaces the stack of `thread_id`; `frames` lists outermost first.
    /// Returns the frame refs in the same order.
    pub fn set_stack(&self, thread_id: ThreadId, frames: &[(&str, &str, u32)]) -> Vec<FrameRef> {
        let mut state = self.state.lock().unwrap();
        let mut previous = None;
        let mut refs = Vec::new();
        for (name, file, line) in frames {
            let frame = state.new_frame(name, file, *line, previous);
            refs.push(frame);
            previous = Some(frame);
        }
        let generation = state.threads.get(&thread_id).map_or(0, |t| t.generation + 1);
        state.threads.insert(
            thread_id,
            ThreadState {
                top_frame: previous,
                generation,
            },
        );
        refs
    }

    /// A linked chain that belongs to no thread, outermost first. Returns the innermost frame.
    pub fn detached_stack(&self, frames: &[(&str, &str, u32)]) -> Option<FrameRef> {
        let mut state = self.state.lock().unwrap();
        let mut previous = None;
        for (name, file, line) in frames {
            previous = Some(state.new_frame(name, file, *line, previous));
        }
        previous
    }

    /// Frames of a suspended coroutine chain, outermost first. They hang off no thread.
    pub fn coroutine(&self, frames: &[(&str, &str, u32)]) -> Vec<FrameRef> {
        let mut state = self.state.lock().unwrap();
        frames
            .iter()
            .map(|(name, file, line)| state.new_frame(name, file, *line, None))
            .collect()
    }

    pub fn set_task(&self, task: TaskId, coroutine: Vec<FrameRef>, awaiting: Option<TaskId>) {
        self.state.lock().unwrap().tasks.insert(
            task,
            TaskState {
                coroutine,
                awaiting,
                ..TaskState::default()
            },
        );
    }

    /// Gives a task the name and loop the interpreter would report for it.
    pub fn describe_task(&self, task: TaskId, loop_id: LoopId, name: &str) {
        if let Some(state) = self.state.lock().unwrap().tasks.get_mut(&task) {
            state.loop_id = Some(loop_id);
            state.name = Some(name.to_string());
        }
    }

    pub fn set_container(&self, address: usize, tasks: &[TaskId]) {
        self.state.lock().unwrap().containers.insert(address, tasks.to_vec());
    }

    pub fn finish_task(&self, task: TaskId) {
        if let Some(state) = self.state.lock().unwrap().tasks.get_mut(&task) {
            state.done = true;
        }
    }

    pub fn mark_entry(&self, frame: FrameRef) {
        if let Some(raw) = self.state.lock().unwrap().frames.get_mut(&frame) {
            raw.is_entry = true;
        }
    }

    /// Makes every read of the thread's state look like the chain just moved.
    pub fn churn(&self, thread_id: ThreadId) {
        self.state.lock().unwrap().churning.insert(thread_id);
    }

    pub fn set_finalizing(&self) {
        self.state.lock().unwrap().finalizing = true;
    }
}

impl Runtime for FakeRuntime {
    fn version(&self) -> RuntimeVersion {
        RuntimeVersion::new(3, 11)
    }

    fn thread_ids(&self) -> Result<Vec<ThreadId>, VmError> {
        let mut ids: Vec<ThreadId> = self.state.lock().unwrap().threads.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn thread_state(&self, thread_id: ThreadId) -> Result<ThreadState, CaptureError> {
        let mut state = self.state.lock().unwrap();
        let churning = state.churning.contains(&thread_id);
        let thread = state
            .threads
            .get_mut(&thread_id)
            .ok_or(CaptureError::UnknownThread(thread_id))?;
        if churning {
            thread.generation += 1;
        }
        Ok(*thread)
    }

    fn frame(&self, frame: FrameRef) -> Result<RawFrame, VmError> {
        let state = self.state.lock().unwrap();
        state
            .frames
            .get(&frame)
            .copied()
            .ok_or(VmError::new(frame.0, 0, libc::EFAULT))
    }

    fn code(&self, code: CodeRef) -> Result<CodeUnit, VmError> {
        let state = self.state.lock().unwrap();
        state
            .codes
            .get(&code)
            .cloned()
            .ok_or(VmError::new(code.0, 0, libc::EFAULT))
    }

    fn task(&self, task: TaskId) -> Result<TaskState, VmError> {
        let state = self.state.lock().unwrap();
        state
            .tasks
            .get(&task)
            .cloned()
            .ok_or(VmError::new(task as usize, 0, libc::EFAULT))
    }

    fn container_tasks(&self, container: TaskContainer) -> Result<Vec<TaskId>, VmError> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .get(&container.address())
            .cloned()
            .ok_or(VmError::new(container.address(), 0, libc::EFAULT))
    }

    fn is_finalizing(&self) -> bool {
        self.state.lock().unwrap().finalizing
    }
}
