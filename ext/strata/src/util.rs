use std::ffi::{c_char, CStr};
use std::time::{SystemTime, UNIX_EPOCH};

/// Kernel id of the calling thread (`gettid`), the id hosts report as a thread's native id.
pub fn current_native_id() -> i64 {
    unsafe { libc::syscall(libc::SYS_gettid) as i64 }
}

pub fn unix_time_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Copies a C string handed over by the host, replacing invalid UTF-8.
/// A null pointer reads as an empty string.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string valid for the call.
pub unsafe fn cstr_to_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_host_strings() {
        assert_eq!(unsafe { cstr_to_string(c"Task-1".as_ptr()) }, "Task-1");
        assert_eq!(unsafe { cstr_to_string(std::ptr::null()) }, "");
    }

    #[test]
    fn native_ids_differ_between_threads() {
        let here = current_native_id();
        let there = std::thread::spawn(current_native_id).join().unwrap();
        assert!(here > 0 && there > 0);
        assert_ne!(here, there);
    }
}
