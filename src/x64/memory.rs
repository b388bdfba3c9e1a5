// This module owns the final, address-stable home of generated code. The
// staging buffer is append-only; finalization is one explicit copy into an
// mmap'd region followed by making it executable. After that the region is
// never written again except at explicitly tracked patch sites: retargeting a
// guard to a freshly compiled bridge briefly flips the page protection,
// rewrites one jump, and flips it back. The region is page-rounded and unmapped
// on drop.

//! Executable memory for compiled units.

use std::ptr::NonNull;

use crate::core::error::{CompileError, CompileResult};

/// A block of memory holding one compiled unit.
///
/// Writable while the unit is being copied in and relocated; executable and
/// read-only afterwards.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    pub fn new(size: usize) -> CompileResult<Self> {
        if size == 0 {
            return Err(CompileError::Memory { reason: "empty unit".into() });
        }
        let page = page_size();
        let size = (size + page - 1) & !(page - 1);
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(CompileError::Memory { reason: "mmap failed".into() });
        }
        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| CompileError::Memory { reason: "mmap returned null".into() })?;
        Ok(ExecutableMemory { ptr, size, executable: false })
    }

    pub fn base(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Copy bytes in; only valid before `make_executable`.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> CompileResult<()> {
        if self.executable {
            return Err(CompileError::Memory { reason: "write after protect".into() });
        }
        if offset + data.len() > self.size {
            return Err(CompileError::Memory { reason: "write past end".into() });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    pub fn make_executable(&mut self) -> CompileResult<()> {
        if self.executable {
            return Ok(());
        }
        let rc = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            return Err(CompileError::Memory { reason: "mprotect failed".into() });
        }
        self.executable = true;
        Ok(())
    }

    /// Rewrite a tracked patch site in an already-executable unit: briefly
    /// writable, patch, executable again. Used to attach bridges to guards
    /// and to invalidate them.
    pub fn patch(&mut self, offset: usize, bytes: &[u8]) -> CompileResult<()> {
        if offset + bytes.len() > self.size {
            return Err(CompileError::Memory { reason: "patch past end".into() });
        }
        if !self.executable {
            return self.write(offset, bytes);
        }
        let rc = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            return Err(CompileError::Memory { reason: "mprotect (unprotect) failed".into() });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(offset), bytes.len());
        }
        let rc = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            return Err(CompileError::Memory { reason: "mprotect (reprotect) failed".into() });
        }
        Ok(())
    }

    /// Read bytes back; diagnostics and tests.
    pub fn read(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= self.size);
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

// The region is exclusively owned and never handed out mutably.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_and_protect() {
        let mut mem = ExecutableMemory::new(100).unwrap();
        assert!(mem.size() >= 100);
        mem.write(0, &[0xc3, 0x90, 0x90]).unwrap();
        mem.make_executable().unwrap();
        assert!(mem.write(0, &[0x00]).is_err());
        let mut back = [0u8; 3];
        mem.read(0, &mut back);
        assert_eq!(back, [0xc3, 0x90, 0x90]);
    }

    #[test]
    fn test_patch_window_on_executable_unit() {
        let mut mem = ExecutableMemory::new(64).unwrap();
        mem.write(0, &[0x90; 16]).unwrap();
        mem.make_executable().unwrap();
        mem.patch(4, &[0xe9, 1, 2, 3, 4]).unwrap();
        let mut back = [0u8; 5];
        mem.read(4, &mut back);
        assert_eq!(back, [0xe9, 1, 2, 3, 4]);
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(ExecutableMemory::new(0).is_err());
    }
}
