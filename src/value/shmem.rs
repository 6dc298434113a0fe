//! Shared memory handles backed by anonymous memory descriptors.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Arc;

use crate::error::Error;

use super::dup_raw;

/// A shared memory segment: descriptor, offset and size.
///
/// Clones share the same open descriptor; it is closed exactly once when
/// the last clone is dropped. This is the one descriptor-carrying value
/// that owns its descriptor.
#[derive(Clone, Debug)]
pub struct SharedMemory {
    inner: Arc<Segment>,
}

#[derive(Debug)]
struct Segment {
    fd: OwnedFd,
    offset: i64,
    size: usize,
}

impl SharedMemory {
    /// Allocates a fresh anonymous segment of `size` bytes.
    pub fn create(size: usize) -> Result<SharedMemory, Error> {
        if size == 0 {
            return Err(Error::Invalid("shared memory size must be non-zero".into()));
        }

        const NAME: &[u8] = b"ferry-shmem\0";
        let raw = unsafe { libc::memfd_create(NAME.as_ptr() as *const libc::c_char, 0) };
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } != 0 {
            return Err(io::Error::last_os_error().into());
        }

        Ok(SharedMemory {
            inner: Arc::new(Segment { fd, offset: 0, size }),
        })
    }

    /// Adopts an already-open segment descriptor, e.g. one received over
    /// a connection. Takes ownership of `fd`.
    pub fn from_parts(fd: OwnedFd, offset: i64, size: usize) -> SharedMemory {
        SharedMemory {
            inner: Arc::new(Segment { fd, offset, size }),
        }
    }

    /// New handle to the same segment through a duplicated descriptor.
    pub fn duplicate(&self) -> Result<SharedMemory, Error> {
        let fd = dup_raw(self.raw_fd())?;
        Ok(SharedMemory::from_parts(fd, self.offset(), self.size()))
    }

    pub fn raw_fd(&self) -> RawFd {
        self.inner.fd.as_raw_fd()
    }

    pub fn offset(&self) -> i64 {
        self.inner.offset
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Maps the segment into the address space, read-write, shared.
    pub fn map(&self) -> Result<ShmemMapping, Error> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                self.size(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.raw_fd(),
                self.offset() as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        Ok(ShmemMapping {
            ptr: ptr as *mut u8,
            len: self.size(),
        })
    }
}

/// A live mapping of a [`SharedMemory`] segment. Unmapped on drop.
pub struct ShmemMapping {
    ptr: *mut u8,
    len: usize,
}

impl ShmemMapping {
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for ShmemMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

// The mapping is plain memory; the usual aliasing rules are enforced by
// the &self/&mut self split on the accessors.
unsafe impl Send for ShmemMapping {}
