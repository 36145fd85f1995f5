//! Structure offsets of a particular interpreter build.
//!
//! The bootstrap that starts a session knows the exact interpreter it runs in
//! and hands these offsets over as JSON, so nothing here is hard-coded per
//! version.

use std::path::Path;

use crate::runtime::RuntimeVersion;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeLayout {
    pub version: RuntimeVersion,
    pub interpreter: InterpreterLayout,
    pub thread: ThreadLayout,
    pub frame: FrameLayout,
    pub code: CodeLayout,
    pub string: VarObjectLayout,
    pub bytes: VarObjectLayout,
    pub task: TaskLayout,
    pub coroutine: CoroutineLayout,
    #[serde(default)]
    pub containers: Option<ContainerLayout>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterLayout {
    /// Head of the thread-state list.
    pub threads_head: usize,
    #[serde(default)]
    pub finalizing: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadLayout {
    pub next: usize,
    pub thread_id: usize,
    /// Pointer to the innermost frame.
    pub frame: usize,
    /// Field that the interpreter bumps on every frame transition, when the build has one.
    #[serde(default)]
    pub generation: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLayout {
    pub previous: usize,
    pub code: usize,
    pub instruction: InstructionLayout,
    /// Boolean marking frames pushed by a fresh entry into the evaluation loop.
    /// Without it every frame counts as an entry.
    #[serde(default)]
    pub is_entry: Option<usize>,
    #[serde(default)]
    pub owner: Option<OwnerLayout>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstructionLayout {
    /// An `int` counter scaled by `unit` to get a byte offset.
    Index { offset: usize, unit: u32 },
    /// A pointer into the bytecode starting `code_start` bytes into the code object.
    Pointer { offset: usize, code_start: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerLayout {
    pub offset: usize,
    /// Owner value of frames that belong to the interpreter itself.
    pub shim_value: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeLayout {
    pub name: usize,
    #[serde(default)]
    pub qualname: Option<usize>,
    pub filename: usize,
    pub first_line: usize,
    pub line_table: usize,
}

/// Length-prefixed object with inline data (compact strings, bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarObjectLayout {
    pub length: usize,
    pub data: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLayout {
    pub coroutine: usize,
    /// The future the task is blocked on.
    pub awaiting: usize,
    pub state: usize,
    pub pending_state: i32,
    /// The task's name string.
    #[serde(default)]
    pub name: Option<usize>,
    /// The loop the task was created on.
    #[serde(default, rename = "loop")]
    pub loop_ref: Option<usize>,
}

/// Hash set internals, enough to list the members of the task sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerLayout {
    /// Pointer to the entry table.
    pub set_table: usize,
    /// Table size minus one.
    pub set_mask: usize,
    pub entry_size: usize,
    pub entry_key: usize,
    /// Referent inside a weak reference object.
    pub weakref_object: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoroutineLayout {
    pub frame: usize,
    /// Whether the frame is embedded in the coroutine object rather than pointed to.
    pub frame_inline: bool,
    /// The coroutine this one is awaiting, if the build exposes it.
    #[serde(default)]
    pub awaited: Option<usize>,
}

impl RuntimeLayout {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents).map_err(std::io::Error::from)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const LAYOUT_JSON: &str = r#"{
        "version": {"major": 3, "minor": 11},
        "interpreter": {"threads_head": 8},
        "thread": {"next": 0, "thread_id": 8, "frame": 16},
        "frame": {
            "previous": 0,
            "code": 8,
            "instruction": {"kind": "pointer", "offset": 16, "code_start": 64},
            "is_entry": 24,
            "owner": {"offset": 25, "shim_value": 3}
        },
        "code": {"name": 0, "qualname": 8, "filename": 16, "first_line": 24, "line_table": 32},
        "string": {"length": 0, "data": 8},
        "bytes": {"length": 0, "data": 8},
        "task": {"coroutine": 0, "awaiting": 8, "state": 16, "pending_state": 0, "name": 24, "loop": 32},
        "coroutine": {"frame": 16, "frame_inline": true},
        "containers": {"set_table": 0, "set_mask": 8, "entry_size": 16, "entry_key": 0, "weakref_object": 8}
    }"#;

    #[test]
    fn parses_layout_with_optional_fields_missing() {
        let layout = RuntimeLayout::from_json(LAYOUT_JSON).unwrap();
        assert_eq!(layout.version, RuntimeVersion::new(3, 11));
        assert_eq!(layout.thread.generation, None);
        assert_eq!(
            layout.frame.instruction,
            InstructionLayout::Pointer {
                offset: 16,
                code_start: 64
            }
        );
        assert_eq!(layout.coroutine.awaited, None);
        assert_eq!(layout.task.loop_ref, Some(32));
    }

    #[test]
    fn task_sets_are_optional() {
        let mut value: serde_json::Value = serde_json::from_str(LAYOUT_JSON).unwrap();
        value.as_object_mut().unwrap().remove("containers");
        let task = value["task"].as_object_mut().unwrap();
        task.remove("name");
        task.remove("loop");
        let layout = RuntimeLayout::from_json(&value.to_string()).unwrap();
        assert_eq!(layout.containers, None);
        assert_eq!(layout.task.name, None);
        assert_eq!(layout.task.loop_ref, None);
    }

    #[test]
    fn rejects_incomplete_layouts() {
        assert!(RuntimeLayout::from_json(r#"{"version": {"major": 3, "minor": 11}}"#).is_err());
    }
}
