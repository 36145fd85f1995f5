use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::error::{CaptureError, VmError};
use crate::linetable::{self, LineTableFormat};
use crate::runtime::{CodeRef, FrameRef, Runtime, ThreadId};
use crate::sample::Frame;

pub const FRAME_CACHE_CAPACITY: usize = 2048;

/// An interpreted frame as seen during a walk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalkedFrame {
    pub frame_ref: FrameRef,
    pub frame: Frame,
    pub is_entry: bool,
}

/// Walks interpreter frame chains and resolves them into [`Frame`]s.
///
/// Resolution of a (code object, instruction offset) pair is cached, so steady
/// state sampling of a hot loop does not touch code objects at all.
pub struct FrameWalker {
    runtime: Arc<dyn Runtime>,
    format: LineTableFormat,
    cache: LruCache<(CodeRef, u32), Frame>,
    max_depth: usize,
}

impl FrameWalker {
    pub fn new(runtime: Arc<dyn Runtime>, max_depth: usize) -> Self {
        let format = LineTableFormat::for_version(runtime.version());
        let capacity = NonZeroUsize::new(FRAME_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            runtime,
            format,
            cache: LruCache::new(capacity),
            max_depth: max_depth.max(1),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    /// Captures the interpreter stack of `thread_id`, innermost frame first.
    ///
    /// The chain head is read before and after the traversal; if it moved in
    /// between the result is discarded as [`CaptureError::Stale`].
    pub fn walk(&mut self, thread_id: ThreadId) -> Result<Vec<WalkedFrame>, CaptureError> {
        let before = self.runtime.thread_state(thread_id)?;
        let frames = self.walk_chain(before.top_frame)?;
        let after = self.runtime.thread_state(thread_id)?;
        if before != after {
            return Err(CaptureError::Stale { thread_id });
        }
        Ok(frames)
    }

    /// Walks a chain that no thread is running, such as the saved frames of
    /// a switched-out greenlet. There is no head to re-check, so no staleness test.
    pub fn walk_from(&mut self, top: FrameRef) -> Result<Vec<WalkedFrame>, CaptureError> {
        self.walk_chain(Some(top))
    }

    fn walk_chain(&mut self, top: Option<FrameRef>) -> Result<Vec<WalkedFrame>, CaptureError> {
        let mut frames = Vec::with_capacity(self.max_depth.min(64));
        let mut current = top;
        let mut visited = 0;
        while let Some(frame_ref) = current {
            visited += 1;
            if visited > self.max_depth {
                return Err(CaptureError::TooDeep(self.max_depth));
            }
            let raw = self.runtime.frame(frame_ref)?;
            if !raw.is_shim {
                frames.push(WalkedFrame {
                    frame_ref,
                    frame: self.resolve(raw.code, raw.instr_offset)?,
                    is_entry: raw.is_entry,
                });
            }
            current = raw.previous;
        }
        log::trace!("Walked {} frames", frames.len());
        Ok(frames)
    }

    /// Resolves one frame that is not on any thread's chain, such as the frame
    /// of a suspended coroutine.
    pub fn resolve_frame(&mut self, frame_ref: FrameRef) -> Result<WalkedFrame, VmError> {
        let raw = self.runtime.frame(frame_ref)?;
        Ok(WalkedFrame {
            frame_ref,
            frame: self.resolve(raw.code, raw.instr_offset)?,
            is_entry: raw.is_entry,
        })
    }

    fn resolve(&mut self, code: CodeRef, instr_offset: u32) -> Result<Frame, VmError> {
        if let Some(frame) = self.cache.get(&(code, instr_offset)) {
            return Ok(frame.clone());
        }
        let unit = self.runtime.code(code)?;
        let line = linetable::line_for_offset(self.format, unit.first_line, &unit.line_table, instr_offset);
        let frame = Frame::interpreted(unit.display_name(), unit.filename.as_str(), line);
        self.cache.put((code, instr_offset), frame.clone());
        Ok(frame)
    }

    pub fn cached_frames(&self) -> usize {
        self.cache.len()
    }
}
