//! Cache and shadow-stack memory regions.
//!
//! The kernel side creates one shared-memory object per protected module
//! holding both cache buffers back to back, plus one for the shadow stack;
//! this side maps them read-write. Anonymous private regions back the
//! one-shot CLI path and the tests.

use crate::result::{Error, Result};
use std::ffi::CString;
use std::io;
use std::ptr::NonNull;
use tracing::debug;

/// One mapped read-write memory region.
#[derive(Debug)]
pub struct CacheRegion {
    ptr: NonNull<u8>,
    size: usize,
    fd: libc::c_int,
    path: Option<String>,
}

impl CacheRegion {
    /// Maps a shared-memory object created by the kernel side. The object
    /// size must match `expected` exactly; a mismatch means the collaborators
    /// disagree about the buffer geometry and nothing downstream is safe.
    pub fn open_shm(path: &str, expected: usize) -> Result<Self> {
        let shm_err = |source: io::Error| Error::Shm {
            path: path.to_string(),
            source,
        };
        let cpath = CString::new(path)
            .map_err(|e| shm_err(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        let fd = unsafe { libc::shm_open(cpath.as_ptr(), libc::O_RDWR, 0o644) };
        if fd < 0 {
            return Err(shm_err(io::Error::last_os_error()));
        }
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(shm_err(err));
        }
        let size = stat.st_size as usize;
        if size != expected {
            unsafe { libc::close(fd) };
            return Err(Error::MappedSizeMismatch {
                path: path.to_string(),
                mapped: size as u64,
                expected: expected as u64,
            });
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(shm_err(err));
        }
        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| shm_err(io::Error::other("mmap returned null")))?;
        debug!(path, size, "mapped shared region");
        Ok(Self {
            ptr,
            size,
            fd,
            path: Some(path.to_string()),
        })
    }

    /// Private anonymous region of the given size.
    pub fn anonymous(size: usize) -> Result<Self> {
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
            return Err(Error::Shm {
                path: "<anonymous>".to_string(),
                source: io::Error::last_os_error(),
            });
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| Error::Shm {
            path: "<anonymous>".to_string(),
            source: io::Error::other("mmap returned null"),
        })?;
        Ok(Self {
            ptr,
            size,
            fd: -1,
            path: None,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for CacheRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            if self.fd >= 0 {
                libc::close(self.fd);
            }
        }
        if let Some(path) = &self.path {
            debug!(path = %path, "unmapped shared region");
        }
    }
}

// The region owns its mapping; access is serialized by the manager's locks.
unsafe impl Send for CacheRegion {}
unsafe impl Sync for CacheRegion {}

/// The two alternating cache buffers of one module, carved out of a single
/// mapping: buffer 0 at the base, buffer 1 in the upper half.
pub struct CachePair {
    region: CacheRegion,
    half: usize,
}

impl CachePair {
    pub fn new(region: CacheRegion) -> Self {
        let half = region.len() / 2;
        Self { region, half }
    }

    /// Maps the kernel-created pair object; `per_buffer` is the size of one
    /// buffer, the object must hold exactly two.
    pub fn open_shm(path: &str, per_buffer: usize) -> Result<Self> {
        Ok(Self::new(CacheRegion::open_shm(path, per_buffer * 2)?))
    }

    pub fn anonymous(per_buffer: usize) -> Result<Self> {
        Ok(Self::new(CacheRegion::anonymous(per_buffer * 2)?))
    }

    /// Size of one buffer.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.half
    }

    pub fn buffer(&self, index: usize) -> &[u8] {
        let s = self.region.as_slice();
        if index == 0 {
            &s[..self.half]
        } else {
            &s[self.half..]
        }
    }

    pub fn buffer_mut(&mut self, index: usize) -> &mut [u8] {
        let half = self.half;
        let s = self.region.as_mut_slice();
        if index == 0 {
            &mut s[..half]
        } else {
            &mut s[half..]
        }
    }
}
