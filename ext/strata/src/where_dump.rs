use std::fmt::Write as _;

use crate::error::CaptureError;
use crate::runtime::ThreadId;
use crate::tasks::RenderedStack;

#[derive(Clone, Debug)]
pub struct ThreadDump {
    pub thread_id: ThreadId,
    pub name: String,
    pub stacks: Result<Vec<RenderedStack>, CaptureError>,
}

/// Renders stacks the way a traceback reads: outermost frame first.
pub fn render(pid: u32, dumps: &[ThreadDump]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Process {}: {} threads", pid, dumps.len());
    for dump in dumps {
        let _ = writeln!(out);
        let _ = writeln!(out, "Thread {:#x} \"{}\"", dump.thread_id, dump.name);
        match &dump.stacks {
            Err(e) => {
                let _ = writeln!(out, "  <capture failed: {}>", e);
            }
            Ok(stacks) if stacks.iter().all(|s| s.frames.is_empty()) => {
                let _ = writeln!(out, "  <no frames>");
            }
            Ok(stacks) => {
                for stack in stacks {
                    let indent = match stack.task_id {
                        Some(task_id) => {
                            let _ = writeln!(out, "  Task {:#x}:", task_id);
                            "    "
                        }
                        None => "  ",
                    };
                    for frame in stack.frames.iter().rev() {
                        let _ = writeln!(out, "{}{}", indent, frame);
                    }
                }
            }
        }
    }
    out
}
