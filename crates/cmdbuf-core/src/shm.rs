//! Shared memory regions.
//!
//! A `SharedMemory` is an fd-backed `MAP_SHARED` mapping. The fd is the
//! handle passed to the peer, which maps the same pages on its side (in
//! another process, or a second mapping in this one).
//!
//! - Linux: `memfd_create` (anonymous, no filesystem name).
//! - Other Unix: `shm_open` with a unique name, unlinked right away.
//!
//! All accessors are bounds-checked and go through volatile loads/stores:
//! the other side may be reading or writing concurrently, ordering between
//! the two is provided by the put/get cursor protocol.

use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};

use crate::error::{CmdBufError, CmdBufResult};

/// An mmap'd shared-memory region with its backing fd.
pub struct SharedMemory {
    /// Backing descriptor (memfd or unlinked POSIX shm object).
    fd: OwnedFd,
    /// Base of the mapping.
    ptr: NonNull<u8>,
    /// Mapping length in bytes.
    len: usize,
}

// Safety: the region is plain bytes. Concurrent access from the peer is
// expected and coordinated by the ring cursors; all access is volatile.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Create and map a new zero-filled region of `len` bytes.
    pub fn create(name: &str, len: usize) -> CmdBufResult<Self> {
        if len == 0 {
            return Err(CmdBufError::Shm {
                op: "create",
                errno: libc::EINVAL,
            });
        }
        let fd = create_fd(name)?;

        let ret = unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) };
        if ret != 0 {
            return Err(CmdBufError::last_os("ftruncate"));
        }

        // Safety: fd is a fresh shm object of exactly `len` bytes.
        unsafe { Self::from_fd(fd, len) }
    }

    /// Map an existing region received from the other side.
    ///
    /// # Safety
    ///
    /// `fd` must refer to a shared-memory object at least `len` bytes long.
    pub unsafe fn from_fd(fd: OwnedFd, len: usize) -> CmdBufResult<Self> {
        if len == 0 {
            return Err(CmdBufError::Shm {
                op: "map",
                errno: libc::EINVAL,
            });
        }
        let base = libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        );
        if base == libc::MAP_FAILED {
            return Err(CmdBufError::last_os("mmap"));
        }
        let ptr = NonNull::new(base as *mut u8).ok_or(CmdBufError::Shm {
            op: "mmap",
            errno: libc::ENOMEM,
        })?;

        log::trace!("mapped shared memory fd={} len={} at {:p}", fd.as_raw_fd(), len, ptr);
        Ok(Self { fd, ptr, len })
    }

    /// Duplicate the backing fd, e.g. to hand it to a peer.
    pub fn try_clone_fd(&self) -> CmdBufResult<OwnedFd> {
        self.fd
            .try_clone()
            .map_err(|e| CmdBufError::Shm {
                op: "dup",
                errno: e.raw_os_error().unwrap_or(libc::EBADF),
            })
    }

    #[inline]
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base address of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Number of whole 32-bit words in the region.
    #[inline]
    pub fn word_count(&self) -> usize {
        self.len / 4
    }

    #[inline]
    fn check(&self, offset: usize, len: usize) -> CmdBufResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(CmdBufError::OutOfBounds {
                offset,
                len,
                size: self.len,
            }),
        }
    }

    /// Volatile load of word `index`.
    #[inline]
    pub fn read_word(&self, index: usize) -> CmdBufResult<u32> {
        self.check(index.checked_mul(4).unwrap_or(usize::MAX), 4)?;
        // Safety: bounds checked; the mapping is page aligned so every word
        // index is 4-byte aligned.
        Ok(unsafe { ptr::read_volatile((self.ptr.as_ptr() as *const u32).add(index)) })
    }

    /// Volatile store of word `index`.
    #[inline]
    pub fn write_word(&self, index: usize, value: u32) -> CmdBufResult<()> {
        self.check(index.checked_mul(4).unwrap_or(usize::MAX), 4)?;
        unsafe { ptr::write_volatile((self.ptr.as_ptr() as *mut u32).add(index), value) };
        Ok(())
    }

    /// Copy `data` into the region at byte `offset`.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> CmdBufResult<()> {
        self.check(offset, data.len())?;
        for (i, b) in data.iter().enumerate() {
            unsafe { ptr::write_volatile(self.ptr.as_ptr().add(offset + i), *b) };
        }
        Ok(())
    }

    /// Copy bytes at `offset` out of the region into `out`.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> CmdBufResult<()> {
        self.check(offset, out.len())?;
        for (i, b) in out.iter_mut().enumerate() {
            *b = unsafe { ptr::read_volatile(self.ptr.as_ptr().add(offset + i)) };
        }
        Ok(())
    }
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("fd", &self.fd.as_raw_fd())
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
        if ret != 0 {
            log::warn!("munmap of {} bytes at {:p} failed", self.len, self.ptr);
        }
        // fd closed by OwnedFd
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        fn create_fd(name: &str) -> CmdBufResult<OwnedFd> {
            let cname = CString::new(name).map_err(|_| CmdBufError::Shm {
                op: "memfd_create",
                errno: libc::EINVAL,
            })?;
            let fd = unsafe { libc::memfd_create(cname.as_ptr(), libc::MFD_CLOEXEC) };
            if fd < 0 {
                return Err(CmdBufError::last_os("memfd_create"));
            }
            // Safety: fresh descriptor owned by nobody else.
            Ok(unsafe { OwnedFd::from_raw_fd(fd) })
        }
    } else {
        fn create_fd(name: &str) -> CmdBufResult<OwnedFd> {
            use std::sync::atomic::{AtomicU32, Ordering};
            static NEXT: AtomicU32 = AtomicU32::new(0);

            let unique = format!(
                "/{}-{}-{}",
                name,
                std::process::id(),
                NEXT.fetch_add(1, Ordering::Relaxed)
            );
            let cname = CString::new(unique).map_err(|_| CmdBufError::Shm {
                op: "shm_open",
                errno: libc::EINVAL,
            })?;
            let fd = unsafe {
                libc::shm_open(
                    cname.as_ptr(),
                    libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                    0o600 as libc::c_uint,
                )
            };
            if fd < 0 {
                return Err(CmdBufError::last_os("shm_open"));
            }
            // The object lives on through the fd only.
            unsafe { libc::shm_unlink(cname.as_ptr()) };
            Ok(unsafe { OwnedFd::from_raw_fd(fd) })
        }
    }
}
