//! Executable memory for translated code
//!
//! The dispatcher needs a region it can fill with emitted bytes and
//! then enter as a function. [`MmapArea`] is the real backend: an
//! anonymous private mapping created read-write and flipped to
//! read-execute once the code is in place (never writable and
//! executable at the same time). [`HeapArea`] stands in for it in
//! tests, where the emitted bytes are inspected but never run.

use std::io;
use std::ptr;
use std::slice;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AreaError {
    #[error("executable area allocation of {len} bytes failed: {source}")]
    Allocate { len: usize, source: io::Error },
    #[error("executable area protection change failed: {0}")]
    Finalize(io::Error),
}

/// A writable code region that can be finalised for execution and
/// entered at its base address
pub trait CodeArea {
    /// The writable view, valid until [`CodeArea::finalize`]
    fn code_mut(&mut self) -> &mut [u8];

    /// Make the region executable (and no longer writable). On x86-64
    /// the permission flip is all that is needed; hosts with
    /// incoherent instruction caches would also flush here.
    fn finalize(&mut self) -> Result<(), AreaError>;

    /// Entry point: the base address of the region
    fn entry(&self) -> *const u8;
}

/// Executable memory backed by an anonymous private mapping
#[derive(Debug)]
pub struct MmapArea {
    ptr: *mut u8,
    len: usize,
}

impl MmapArea {
    pub fn allocate(min_bytes: usize) -> Result<Self, AreaError> {
        let len = min_bytes.max(1);
        // SAFETY: anonymous mapping, no file descriptor involved; a
        // MAP_FAILED result is checked before the pointer is used.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(AreaError::Allocate {
                len,
                source: io::Error::last_os_error(),
            });
        }
        Ok(Self {
            ptr: ptr.cast(),
            len,
        })
    }
}

impl CodeArea for MmapArea {
    fn code_mut(&mut self) -> &mut [u8] {
        // SAFETY: the mapping is len bytes long, readable and
        // writable, and exclusively owned by self.
        unsafe { slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    fn finalize(&mut self) -> Result<(), AreaError> {
        // SAFETY: ptr/len describe the mapping created in allocate.
        let result =
            unsafe { libc::mprotect(self.ptr.cast(), self.len, libc::PROT_READ | libc::PROT_EXEC) };
        if result != 0 {
            return Err(AreaError::Finalize(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn entry(&self) -> *const u8 {
        self.ptr
    }
}

impl Drop for MmapArea {
    fn drop(&mut self) {
        // SAFETY: unmapping the mapping created in allocate; the
        // region is never entered again after the dispatcher returns.
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}

/// Plain heap buffer standing in for executable memory in tests.
/// Finalisation is a no-op and the contents must not be entered.
#[derive(Debug, Default)]
pub struct HeapArea {
    buf: Vec<u8>,
}

impl HeapArea {
    pub fn allocate(min_bytes: usize) -> Self {
        Self {
            buf: vec![0; min_bytes],
        }
    }
}

impl CodeArea for HeapArea {
    fn code_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    fn finalize(&mut self) -> Result<(), AreaError> {
        Ok(())
    }

    fn entry(&self) -> *const u8 {
        self.buf.as_ptr()
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn check_mmap_area_is_writable() {
        let mut area = MmapArea::allocate(64).unwrap();
        let code = area.code_mut();
        assert!(code.len() >= 64);
        code[0] = 0xc3;
        code[63] = 0x90;
        assert_eq!(area.code_mut()[0], 0xc3);
        area.finalize().unwrap();
        assert!(!area.entry().is_null());
    }

    #[test]
    fn check_zero_length_request() {
        let mut area = MmapArea::allocate(0).unwrap();
        assert!(!area.code_mut().is_empty());
    }

    #[test]
    fn check_heap_area_round_trip() {
        let mut area = HeapArea::allocate(8);
        area.code_mut().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        area.finalize().unwrap();
        assert_eq!(area.code_mut()[7], 8);
    }
}
