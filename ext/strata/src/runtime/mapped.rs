use crate::error::{CaptureError, VmError};
use crate::runtime::layout::{InstructionLayout, RuntimeLayout, VarObjectLayout};
use crate::runtime::*;
use crate::vm::{MemoryReader, MemoryReaderExt};

const MAX_THREADS: usize = 4096;
const MAX_COROUTINE_DEPTH: usize = 256;
const MAX_SET_SLOTS: usize = 1 << 16;

/// [`Runtime`] backed by raw reads of interpreter structures.
pub struct MappedRuntime<M> {
    memory: M,
    layout: RuntimeLayout,
    interpreter: usize,
}

impl<M: MemoryReader> MappedRuntime<M> {
    pub fn new(memory: M, layout: RuntimeLayout, interpreter: usize) -> Self {
        Self {
            memory,
            layout,
            interpreter,
        }
    }

    pub fn layout(&self) -> &RuntimeLayout {
        &self.layout
    }

    fn read_var_object(&self, addr: usize, layout: VarObjectLayout) -> Result<Vec<u8>, VmError> {
        let length = self.memory.read_isize(addr + layout.length)?;
        if length < 0 {
            return Err(VmError::new(addr, 0, libc::EINVAL));
        }
        self.memory.read_bytes(addr + layout.data, length as usize)
    }

    fn read_string(&self, addr: usize) -> Result<String, VmError> {
        let bytes = self.read_var_object(addr, self.layout.string)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn read_string_field(&self, object: usize, offset: usize) -> Result<String, VmError> {
        self.read_string(self.memory.read_usize(object + offset)?)
    }

    fn raw_instruction(&self, frame: usize) -> Result<u64, VmError> {
        match self.layout.frame.instruction {
            InstructionLayout::Index { offset, .. } => Ok(self.memory.read_i32(frame + offset)? as u64),
            InstructionLayout::Pointer { offset, .. } => Ok(self.memory.read_usize(frame + offset)? as u64),
        }
    }

    fn optional_pointer(&self, base: usize, offset: Option<usize>) -> Result<Option<usize>, VmError> {
        match offset {
            Some(offset) => Ok(Some(self.memory.read_usize(base + offset)?).filter(|&p| p != 0)),
            None => Ok(None),
        }
    }

    fn generation(&self, thread_state: usize, frame: usize) -> Result<u64, VmError> {
        if let Some(offset) = self.layout.thread.generation {
            return self.memory.read_u64(thread_state + offset);
        }
        if frame == 0 {
            return Ok(0);
        }
        Ok((frame as u64).rotate_left(21) ^ self.raw_instruction(frame)?)
    }
}

impl<M: MemoryReader> Runtime for MappedRuntime<M> {
    fn version(&self) -> RuntimeVersion {
        self.layout.version
    }

    fn thread_ids(&self) -> Result<Vec<ThreadId>, VmError> {
        let layout = &self.layout.thread;
        let mut ids = Vec::new();
        let mut current = self
            .memory
            .read_usize(self.interpreter + self.layout.interpreter.threads_head)?;
        while current != 0 && ids.len() < MAX_THREADS {
            ids.push(self.memory.read_u64(current + layout.thread_id)?);
            current = self.memory.read_usize(current + layout.next)?;
        }
        Ok(ids)
    }

    fn thread_state(&self, thread_id: ThreadId) -> Result<ThreadState, CaptureError> {
        let layout = &self.layout.thread;
        let mut current = self
            .memory
            .read_usize(self.interpreter + self.layout.interpreter.threads_head)?;
        for _ in 0..MAX_THREADS {
            if current == 0 {
                break;
            }
            if self.memory.read_u64(current + layout.thread_id)? == thread_id {
                let frame = self.memory.read_usize(current + layout.frame)?;
                return Ok(ThreadState {
                    top_frame: (frame != 0).then_some(FrameRef(frame)),
                    generation: self.generation(current, frame)?,
                });
            }
            current = self.memory.read_usize(current + layout.next)?;
        }
        Err(CaptureError::UnknownThread(thread_id))
    }

    fn frame(&self, frame: FrameRef) -> Result<RawFrame, VmError> {
        let layout = &self.layout.frame;
        let base = frame.0;
        let previous = self.memory.read_usize(base + layout.previous)?;
        let code = self.memory.read_usize(base + layout.code)?;
        let instr_offset = match layout.instruction {
            InstructionLayout::Index { offset, unit } => {
                (self.memory.read_i32(base + offset)?.max(0) as u32).saturating_mul(unit)
            }
            InstructionLayout::Pointer { offset, code_start } => {
                let pointer = self.memory.read_usize(base + offset)?;
                pointer.saturating_sub(code + code_start).min(u32::MAX as usize) as u32
            }
        };
        let is_entry = match layout.is_entry {
            Some(offset) => self.memory.read_u8(base + offset)? != 0,
            None => true,
        };
        let is_shim = match layout.owner {
            Some(owner) => self.memory.read_u8(base + owner.offset)? == owner.shim_value,
            None => false,
        };
        Ok(RawFrame {
            code: CodeRef(code),
            instr_offset,
            previous: (previous != 0).then_some(FrameRef(previous)),
            is_entry,
            is_shim,
        })
    }

    fn code(&self, code: CodeRef) -> Result<CodeUnit, VmError> {
        let layout = &self.layout.code;
        let base = code.0;
        let qualname = match layout.qualname {
            Some(offset) => match self.memory.read_usize(base + offset)? {
                0 => None,
                addr => Some(self.read_string(addr)?),
            },
            None => None,
        };
        let line_table = self.memory.read_usize(base + layout.line_table)?;
        Ok(CodeUnit {
            name: self.read_string_field(base, layout.name)?,
            qualname,
            filename: self.read_string_field(base, layout.filename)?,
            first_line: self.memory.read_i32(base + layout.first_line)?.max(0) as u32,
            line_table: self.read_var_object(line_table, self.layout.bytes)?,
        })
    }

    fn task(&self, task: TaskId) -> Result<TaskState, VmError> {
        let layout = &self.layout.task;
        let base = task as usize;
        let awaiting = self.memory.read_usize(base + layout.awaiting)?;
        let state = self.memory.read_i32(base + layout.state)?;

        let coroutine_layout = self.layout.coroutine;
        let mut coroutine = Vec::new();
        let mut current = self.memory.read_usize(base + layout.coroutine)?;
        while current != 0 && coroutine.len() < MAX_COROUTINE_DEPTH {
            let frame = if coroutine_layout.frame_inline {
                current + coroutine_layout.frame
            } else {
                self.memory.read_usize(current + coroutine_layout.frame)?
            };
            if frame == 0 {
                break;
            }
            coroutine.push(FrameRef(frame));
            let next = match coroutine_layout.awaited {
                Some(offset) => self.memory.read_usize(current + offset)?,
                None => 0,
            };
            if next == current {
                break;
            }
            current = next;
        }

        let name = match self.optional_pointer(base, layout.name)? {
            Some(name) => Some(self.read_string(name)?),
            None => None,
        };
        Ok(TaskState {
            coroutine,
            awaiting: (awaiting != 0).then_some(awaiting as TaskId),
            done: state != layout.pending_state,
            name,
            loop_id: self.optional_pointer(base, layout.loop_ref)?.map(|l| l as LoopId),
        })
    }

    fn container_tasks(&self, container: TaskContainer) -> Result<Vec<TaskId>, VmError> {
        let address = container.address();
        let Some(layout) = self.layout.containers else {
            return Err(VmError::new(address, 0, libc::ENOTSUP));
        };
        let mask = self.memory.read_isize(address + layout.set_mask)?;
        let key_size = std::mem::size_of::<usize>();
        if layout.entry_size < layout.entry_key + key_size || mask < 0 || mask as usize >= MAX_SET_SLOTS {
            return Err(VmError::new(address, 0, libc::EINVAL));
        }
        let slots = mask as usize + 1;
        let table = self.memory.read_usize(address + layout.set_table)?;
        let entries = self.memory.read_bytes(table, slots * layout.entry_size)?;

        let mut tasks = Vec::new();
        for entry in entries.chunks_exact(layout.entry_size) {
            let mut key = [0u8; std::mem::size_of::<usize>()];
            key.copy_from_slice(&entry[layout.entry_key..layout.entry_key + key_size]);
            let key = usize::from_ne_bytes(key);
            if key == 0 {
                continue;
            }
            let task = match container {
                TaskContainer::Set(_) => key,
                TaskContainer::WeakSet(_) => self.memory.read_usize(key + layout.weakref_object)?,
            };
            if task != 0 {
                tasks.push(task as TaskId);
            }
        }
        Ok(tasks)
    }

    fn is_finalizing(&self) -> bool {
        match self.layout.interpreter.finalizing {
            Some(offset) => self
                .memory
                .read_usize(self.interpreter + offset)
                .map_or(false, |value| value != 0),
            None => false,
        }
    }
}
