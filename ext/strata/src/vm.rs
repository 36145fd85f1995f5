//! Reading interpreter memory without trusting it.
//!
//! Every read copies into a local buffer and may fail; a string or byte object
//! whose recorded size is implausible is rejected before anything is copied.

use crate::error::VmError;

/// Upper bound on any single variable-length copy.
pub const MAX_COPY_SIZE: usize = 1 << 20;

pub trait MemoryReader: Send + Sync {
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), VmError>;
}

pub trait MemoryReaderExt: MemoryReader {
    fn read_u8(&self, addr: usize) -> Result<u8, VmError> {
        let mut buf = [0u8; 1];
        self.read(addr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_i32(&self, addr: usize) -> Result<i32, VmError> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(i32::from_ne_bytes(buf))
    }

    fn read_u64(&self, addr: usize) -> Result<u64, VmError> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }

    fn read_usize(&self, addr: usize) -> Result<usize, VmError> {
        let mut buf = [0u8; std::mem::size_of::<usize>()];
        self.read(addr, &mut buf)?;
        Ok(usize::from_ne_bytes(buf))
    }

    fn read_isize(&self, addr: usize) -> Result<isize, VmError> {
        let mut buf = [0u8; std::mem::size_of::<isize>()];
        self.read(addr, &mut buf)?;
        Ok(isize::from_ne_bytes(buf))
    }

    /// Copies `len` bytes, refusing anything above [`MAX_COPY_SIZE`].
    fn read_bytes(&self, addr: usize, len: usize) -> Result<Vec<u8>, VmError> {
        if len > MAX_COPY_SIZE {
            return Err(VmError::new(addr, len, libc::E2BIG));
        }
        let mut buf = vec![0u8; len];
        if len > 0 {
            self.read(addr, &mut buf)?;
        }
        Ok(buf)
    }
}

impl<T: MemoryReader + ?Sized> MemoryReaderExt for T {}

impl<T: MemoryReader + ?Sized> MemoryReader for std::sync::Arc<T> {
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), VmError> {
        (**self).read(addr, buf)
    }
}

/// Memory of a live process, read with `process_vm_readv`.
#[derive(Clone, Copy, Debug)]
pub struct ProcessMemory {
    pid: libc::pid_t,
}

impl ProcessMemory {
    pub fn new(pid: libc::pid_t) -> Self {
        Self { pid }
    }

    pub fn current() -> Self {
        Self::new(std::process::id() as libc::pid_t)
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }
}

#[cfg(target_os = "linux")]
impl MemoryReader for ProcessMemory {
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), VmError> {
        if addr == 0 {
            return Err(VmError::new(addr, buf.len(), libc::EFAULT));
        }
        let local = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let remote = libc::iovec {
            iov_base: addr as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let copied = unsafe { libc::process_vm_readv(self.pid, &local, 1, &remote, 1, 0) };
        if copied < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(VmError::new(addr, buf.len(), errno));
        }
        if copied as usize != buf.len() {
            return Err(VmError::new(addr, buf.len(), libc::EFAULT));
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
impl MemoryReader for ProcessMemory {
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), VmError> {
        Err(VmError::new(addr, buf.len(), libc::ENOSYS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supported(memory: &ProcessMemory, probe: usize) -> bool {
        match memory.read_u8(probe) {
            Ok(_) => true,
            // sandboxes commonly forbid process_vm_readv
            Err(e) if e.errno == libc::EPERM || e.errno == libc::ENOSYS => false,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn reads_own_memory() {
        let value: u64 = 0x1122_3344_5566_7788;
        let memory = ProcessMemory::current();
        let addr = &value as *const u64 as usize;
        if !supported(&memory, addr) {
            return;
        }
        assert_eq!(memory.read_u64(addr).unwrap(), value);

        let text = b"strata";
        let bytes = memory.read_bytes(text.as_ptr() as usize, text.len()).unwrap();
        assert_eq!(bytes, text);
    }

    #[test]
    fn null_and_oversized_reads_fail() {
        let memory = ProcessMemory::current();
        assert!(memory.read_u64(0).is_err());
        let err = memory.read_bytes(0x1000, MAX_COPY_SIZE + 1).unwrap_err();
        assert_eq!(err.errno, libc::E2BIG);
    }
}
