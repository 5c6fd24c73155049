//! Page-aligned heap buffers for the send scratch and the registered region.

use std::ptr::{self, NonNull};

use crate::error::{Error, Result};

/// Page size for aligned allocations.
pub const PAGE_SIZE: usize = 4096;

/// Page-aligned, heap-allocated byte buffer.
///
/// The contents are only reached through raw pointers once the buffer is
/// registered for remote writes; see [`AlignedBuffer::as_slice`].
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// The buffer exclusively owns its allocation.
unsafe impl Send for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate `len` bytes (at least one page) filled with `fill`.
    pub fn new(len: usize, fill: u8) -> Result<Self> {
        let alloc_len = len.max(1).next_multiple_of(PAGE_SIZE);
        let mut raw: *mut libc::c_void = ptr::null_mut();
        let ret = unsafe { libc::posix_memalign(&mut raw, PAGE_SIZE, alloc_len) };
        if ret != 0 {
            return Err(Error::NoMemory(alloc_len));
        }
        let ptr = NonNull::new(raw as *mut u8).ok_or(Error::NoMemory(alloc_len))?;
        unsafe { ptr::write_bytes(ptr.as_ptr(), fill, len) };
        Ok(Self { ptr, len })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Base virtual address, as advertised to peers.
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrow the contents.
    ///
    /// Only sound for buffers no peer writes into concurrently, such as the
    /// send scratch or a registered region between barriers.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Set the first `len` bytes (clamped to the buffer) to `byte`.
    pub fn fill_prefix(&mut self, len: usize, byte: u8) {
        let len = len.min(self.len);
        unsafe { ptr::write_bytes(self.ptr.as_ptr(), byte, len) };
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { libc::free(self.ptr.as_ptr() as *mut libc::c_void) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_page_aligned_and_filled() {
        let buf = AlignedBuffer::new(100, 1).unwrap();
        assert_eq!(buf.as_ptr() as usize % PAGE_SIZE, 0);
        assert_eq!(buf.len(), 100);
        assert!(buf.as_slice().iter().all(|&b| b == 1));
    }

    #[test]
    fn fill_prefix_is_clamped() {
        let mut buf = AlignedBuffer::new(64, 1).unwrap();
        buf.fill_prefix(16, 0);
        assert!(buf.as_slice()[..16].iter().all(|&b| b == 0));
        assert!(buf.as_slice()[16..].iter().all(|&b| b == 1));

        buf.fill_prefix(1 << 20, 0);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }
}
