//! C ABI used by the bootstrap running inside the profiled process.
//!
//! There is at most one session per process. Every function returns
//! [`STRATA_OK`], [`STRATA_ERROR`] (details go to the log) or
//! [`STRATA_NO_SESSION`].

#![deny(unsafe_op_in_unsafe_fn)]

use std::ffi::{c_char, c_int};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Once};

use super::configuration::Configuration;
use super::Session;
use crate::error::{ConfigError, Error};
use crate::runtime::layout::RuntimeLayout;
use crate::runtime::mapped::MappedRuntime;
use crate::greenlets::GreenletId;
use crate::runtime::{FrameRef, LoopId, TaskContainer, TaskId, ThreadId};
use crate::tasks::TaskDescriptor;
use crate::util::cstr_to_string;
use crate::vm::ProcessMemory;

pub const STRATA_OK: c_int = 0;
pub const STRATA_ERROR: c_int = -1;
pub const STRATA_NO_SESSION: c_int = 1;

static SESSION: Mutex<Option<Session>> = Mutex::new(None);
static INIT_LOGGER: Once = Once::new();

#[repr(C)]
pub struct StrataTask {
    pub id: u64,
    pub loop_id: u64,
    pub name: *const c_char,
}

#[repr(C)]
pub struct StrataRunningTask {
    pub loop_id: u64,
    pub task_id: u64,
}

fn session() -> MutexGuard<'static, Option<Session>> {
    SESSION.lock().unwrap_or_else(|e| e.into_inner())
}

fn with_session(f: impl FnOnce(&Session)) -> c_int {
    match session().as_ref() {
        Some(session) => {
            f(session);
            STRATA_OK
        }
        None => STRATA_NO_SESSION,
    }
}

fn init_logger() {
    INIT_LOGGER.call_once(|| {
        #[cfg(feature = "debug")]
        {
            let _ = env_logger::builder()
                .format_timestamp(None)
                .format_module_path(false)
                .try_init();
        }
    });
}

unsafe fn slice<'a, T>(ptr: *const T, len: usize) -> &'a [T] {
    if ptr.is_null() || len == 0 {
        return &[];
    }
    unsafe { std::slice::from_raw_parts(ptr, len) }
}

unsafe fn descriptors(ptr: *const StrataTask, len: usize) -> Vec<TaskDescriptor> {
    unsafe { slice(ptr, len) }
        .iter()
        .map(|t| TaskDescriptor::new(t.id, t.loop_id, unsafe { cstr_to_string(t.name) }))
        .collect()
}

fn start(interpreter: usize, layout: &str, settings: Option<&str>, channel: Option<PathBuf>) -> Result<(), Error> {
    let configuration = match settings {
        Some(json) => Configuration::from_json(json).map_err(|e| ConfigError::InvalidValue {
            option: "settings",
            value: e.to_string(),
        })?,
        None => Configuration::from_env()?,
    };
    let layout = RuntimeLayout::from_json(layout).map_err(|e| ConfigError::InvalidValue {
        option: "layout",
        value: e.to_string(),
    })?;
    log::debug!("Runtime {}.{}", layout.version.major, layout.version.minor);
    let runtime = MappedRuntime::new(ProcessMemory::current(), layout, interpreter);

    let mut current = session();
    if current.is_some() {
        return Err(Error::AlreadyRunning);
    }
    let mut new_session = Session::new(configuration, Arc::new(runtime))?;
    if let Some(channel) = channel {
        new_session.set_where_channel(channel);
    }
    new_session.start()?;
    *current = Some(new_session);
    Ok(())
}

/// Starts the process-wide session.
///
/// `settings_json` and `channel` may be null; without settings the
/// configuration is read from the environment.
///
/// # Safety
/// Non-null pointers must be NUL-terminated strings. `interpreter` must be
/// the address of the interpreter state described by `layout_json`.
#[no_mangle]
pub unsafe extern "C" fn strata_start(
    interpreter: usize,
    layout_json: *const c_char,
    settings_json: *const c_char,
    channel: *const c_char,
) -> c_int {
    init_logger();
    let layout = unsafe { cstr_to_string(layout_json) };
    let settings = (!settings_json.is_null()).then(|| unsafe { cstr_to_string(settings_json) });
    let channel = (!channel.is_null()).then(|| PathBuf::from(unsafe { cstr_to_string(channel) }));
    match start(interpreter, &layout, settings.as_deref(), channel) {
        Ok(()) => STRATA_OK,
        Err(e) => {
            log::error!("Cannot start profiling: {}", e);
            STRATA_ERROR
        }
    }
}

#[no_mangle]
pub extern "C" fn strata_stop() -> c_int {
    let Some(mut session) = session().take() else {
        return STRATA_NO_SESSION;
    };
    match session.stop() {
        Ok(()) => STRATA_OK,
        Err(e) => {
            log::error!("Cannot stop profiling: {}", e);
            STRATA_ERROR
        }
    }
}

/// # Safety
/// `name` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn strata_track_thread(thread_id: ThreadId, name: *const c_char, native_id: i64) -> c_int {
    let name = unsafe { cstr_to_string(name) };
    with_session(|s| s.track_thread(thread_id, &name, native_id))
}

#[no_mangle]
pub extern "C" fn strata_untrack_thread(thread_id: ThreadId) -> c_int {
    with_session(|s| s.untrack_thread(thread_id))
}

#[no_mangle]
pub extern "C" fn strata_track_loop(thread_id: ThreadId, loop_id: LoopId) -> c_int {
    with_session(|s| s.register_loop(thread_id, loop_id))
}

/// # Safety
/// `name` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn strata_task_created(task: TaskId, loop_id: LoopId, name: *const c_char) -> c_int {
    let name = unsafe { cstr_to_string(name) };
    with_session(|s| s.task_created(TaskDescriptor::new(task, loop_id, name)))
}

#[no_mangle]
pub extern "C" fn strata_link_tasks(parent: TaskId, child: TaskId) -> c_int {
    with_session(|s| s.link(parent, child))
}

#[no_mangle]
pub extern "C" fn strata_enter_task(loop_id: LoopId, task: TaskId) -> c_int {
    with_session(|s| s.enter_task(loop_id, task))
}

#[no_mangle]
pub extern "C" fn strata_leave_task(loop_id: LoopId, task: TaskId) -> c_int {
    with_session(|s| s.leave_task(loop_id, task))
}

#[no_mangle]
pub extern "C" fn strata_task_done(task: TaskId) -> c_int {
    with_session(|s| s.task_done(task))
}

/// Imports the tasks that existed before the session started.
///
/// `scheduled_set` (a set of weak references) and `eager_set` are the
/// addresses of the runtime's task collections, or zero. They are re-read on
/// every sample to find tasks created later.
///
/// # Safety
/// Each pointer must be null or point to `*_len` initialized elements whose
/// names are null or NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn strata_init_tasks(
    running: *const StrataRunningTask,
    running_len: usize,
    scheduled: *const StrataTask,
    scheduled_len: usize,
    eager: *const StrataTask,
    eager_len: usize,
    scheduled_set: usize,
    eager_set: usize,
) -> c_int {
    let running: Vec<(LoopId, TaskId)> = unsafe { slice(running, running_len) }
        .iter()
        .map(|r| (r.loop_id, r.task_id))
        .collect();
    let scheduled = unsafe { descriptors(scheduled, scheduled_len) };
    let eager = unsafe { descriptors(eager, eager_len) };
    with_session(|s| {
        s.bulk_import(&running, scheduled, eager);
        if scheduled_set != 0 {
            s.watch_tasks(TaskContainer::WeakSet(scheduled_set));
        }
        if eager_set != 0 {
            s.watch_tasks(TaskContainer::Set(eager_set));
        }
    })
}

fn frame_ref(frame: usize) -> Option<FrameRef> {
    (frame != 0).then_some(FrameRef(frame))
}

/// `frame` is the greenlet's saved innermost frame, or zero.
///
/// # Safety
/// `name` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn strata_track_greenlet(
    greenlet: GreenletId,
    thread_id: ThreadId,
    name: *const c_char,
    frame: usize,
) -> c_int {
    let name = unsafe { cstr_to_string(name) };
    with_session(|s| s.track_greenlet(greenlet, thread_id, &name, frame_ref(frame)))
}

#[no_mangle]
pub extern "C" fn strata_update_greenlet_frame(greenlet: GreenletId, frame: usize) -> c_int {
    with_session(|s| s.update_greenlet_frame(greenlet, frame_ref(frame)))
}

#[no_mangle]
pub extern "C" fn strata_link_greenlets(greenlet: GreenletId, parent: GreenletId) -> c_int {
    with_session(|s| s.link_greenlets(greenlet, parent))
}

#[no_mangle]
pub extern "C" fn strata_switch_greenlet(thread_id: ThreadId, greenlet: GreenletId) -> c_int {
    with_session(|s| s.switch_greenlet(thread_id, greenlet))
}

#[no_mangle]
pub extern "C" fn strata_untrack_greenlet(greenlet: GreenletId) -> c_int {
    with_session(|s| s.untrack_greenlet(greenlet))
}

#[no_mangle]
pub extern "C" fn strata_on_alloc(thread_id: ThreadId, address: u64, size: u64) -> c_int {
    with_session(|s| s.on_alloc(thread_id, address, size))
}

#[no_mangle]
pub extern "C" fn strata_on_free(address: u64) -> c_int {
    with_session(|s| s.on_free(address))
}

#[cfg(test)]
mod tests {
    use std::ffi::CString;

    use super::*;
    use crate::runtime::layout::tests::LAYOUT_JSON;

    #[test]
    fn calls_without_a_session_are_reported() {
        assert_eq!(strata_stop(), STRATA_NO_SESSION);
        assert_eq!(strata_link_tasks(1, 2), STRATA_NO_SESSION);
        assert_eq!(unsafe { strata_track_thread(1, c"MainThread".as_ptr(), 100) }, STRATA_NO_SESSION);
        assert_eq!(
            unsafe { strata_init_tasks(std::ptr::null(), 0, std::ptr::null(), 0, std::ptr::null(), 0, 0, 0) },
            STRATA_NO_SESSION
        );
        assert_eq!(strata_switch_greenlet(1, 0x10), STRATA_NO_SESSION);
        assert_eq!(strata_update_greenlet_frame(0x10, 0), STRATA_NO_SESSION);
    }

    #[test]
    fn bad_layout_does_not_start() {
        let started = unsafe { strata_start(0x1000, c"{not json".as_ptr(), c"{}".as_ptr(), std::ptr::null()) };
        assert_eq!(started, STRATA_ERROR);
        assert!(session().is_none());
    }

    #[test]
    fn conflicting_settings_do_not_start() {
        let layout = CString::new(LAYOUT_JSON).unwrap();
        let settings = cr#"{"time_mode": "cpu", "memory": true}"#;
        let started = unsafe { strata_start(0x1000, layout.as_ptr(), settings.as_ptr(), std::ptr::null()) };
        assert_eq!(started, STRATA_ERROR);
        assert!(session().is_none());
    }

    #[test]
    fn zero_frame_means_nothing_saved() {
        assert_eq!(frame_ref(0), None);
        assert_eq!(frame_ref(0x1200), Some(FrameRef(0x1200)));
    }

    #[test]
    fn descriptors_copy_names() {
        let tasks = [
            StrataTask {
                id: 0xa1,
                loop_id: 0xe0,
                name: c"Task-1".as_ptr(),
            },
            StrataTask {
                id: 0xa2,
                loop_id: 0xe0,
                name: std::ptr::null(),
            },
        ];
        let copied = unsafe { descriptors(tasks.as_ptr(), tasks.len()) };
        assert_eq!(copied[0], TaskDescriptor::new(0xa1, 0xe0, "Task-1"));
        assert_eq!(copied[1].name, "");
    }
}
