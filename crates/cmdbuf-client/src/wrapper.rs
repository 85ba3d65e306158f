//! Pointer façade over a fenced transfer arena.
//!
//! `FencedAllocatorWrapper` owns the mapped region and a `FencedAllocator`
//! over its length, and converts between arena offsets and addresses in
//! this process's mapping. Every request is rounded up to `ALIGNMENT`, so
//! every block starts on an `ALIGNMENT` boundary.

use std::mem;
use std::ptr::NonNull;

use cmdbuf_core::{CmdBufError, CmdBufResult, Offset, SharedMemory, Token, TokenWaiter};

use crate::fenced_allocator::FencedAllocator;

/// Alignment of every block handed out by the wrapper.
pub const ALIGNMENT: usize = 8;

/// Transfer arena with pointer-based allocation.
pub struct FencedAllocatorWrapper<W: TokenWaiter> {
    // Declared first: dropping it drains pending blocks while the
    // mapping is still alive.
    allocator: FencedAllocator<W>,
    shm: SharedMemory,
}

impl<W: TokenWaiter> FencedAllocatorWrapper<W> {
    /// Manage all of `shm`.
    pub fn new(shm: SharedMemory, waiter: W) -> CmdBufResult<Self> {
        let size = u32::try_from(shm.len()).map_err(|_| CmdBufError::OutOfBounds {
            offset: 0,
            len: shm.len(),
            size: u32::MAX as usize,
        })?;
        Ok(Self {
            allocator: FencedAllocator::new(size, waiter),
            shm,
        })
    }

    /// Create a fresh region of `size` bytes and manage it.
    pub fn create(name: &str, size: u32, waiter: W) -> CmdBufResult<Self> {
        Self::new(SharedMemory::create(name, size as usize)?, waiter)
    }

    #[inline]
    fn round_up(size: u32) -> CmdBufResult<u32> {
        let align = ALIGNMENT as u32;
        size.max(1)
            .checked_add(align - 1)
            .map(|s| s & !(align - 1))
            .ok_or(CmdBufError::ArenaExhausted { requested: size })
    }

    /// Allocate `size` bytes. May block reclaiming pending blocks.
    pub fn alloc(&mut self, size: u32) -> CmdBufResult<NonNull<u8>> {
        let offset = self.allocator.alloc(Self::round_up(size)?)?;
        self.pointer_at(offset)
    }

    /// Allocate room for `count` values of `T`.
    pub fn alloc_typed<T>(&mut self, count: usize) -> CmdBufResult<NonNull<T>> {
        if mem::align_of::<T>() > ALIGNMENT {
            return Err(CmdBufError::Unaligned {
                align: mem::align_of::<T>(),
                max: ALIGNMENT,
            });
        }
        let bytes = mem::size_of::<T>()
            .checked_mul(count)
            .and_then(|b| u32::try_from(b).ok())
            .ok_or(CmdBufError::ArenaExhausted { requested: u32::MAX })?;
        Ok(self.alloc(bytes)?.cast())
    }

    /// Free the block starting at `ptr`.
    pub fn free<T>(&mut self, ptr: NonNull<T>) -> CmdBufResult<()> {
        let offset = self.offset_of(ptr)?;
        self.allocator.free(offset)
    }

    /// Free the block starting at `ptr` once `token` has passed.
    pub fn free_pending_token<T>(&mut self, ptr: NonNull<T>, token: Token) -> CmdBufResult<()> {
        let offset = self.offset_of(ptr)?;
        self.allocator.free_pending_token(offset, token)
    }

    /// Arena offset of an address inside the mapping.
    pub fn offset_of<T>(&self, ptr: NonNull<T>) -> CmdBufResult<Offset> {
        let base = self.shm.as_ptr().as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        match addr.checked_sub(base) {
            Some(delta) if delta < self.shm.len() => Ok(Offset::new(delta as u32)),
            _ => Err(CmdBufError::OutOfBounds {
                offset: addr,
                len: 0,
                size: self.shm.len(),
            }),
        }
    }

    /// Address of an arena offset in this process's mapping.
    pub fn pointer_at(&self, offset: Offset) -> CmdBufResult<NonNull<u8>> {
        if offset.as_usize() >= self.shm.len() {
            return Err(CmdBufError::OutOfBounds {
                offset: offset.as_usize(),
                len: 0,
                size: self.shm.len(),
            });
        }
        // Safety: offset is inside the mapping.
        Ok(unsafe { NonNull::new_unchecked(self.shm.as_ptr().as_ptr().add(offset.as_usize())) })
    }

    /// Copy `data` into the arena at `offset`.
    pub fn write_bytes(&self, offset: Offset, data: &[u8]) -> CmdBufResult<()> {
        self.shm.write_bytes(offset.as_usize(), data)
    }

    /// Copy bytes at `offset` out of the arena.
    pub fn read_bytes(&self, offset: Offset, out: &mut [u8]) -> CmdBufResult<()> {
        self.shm.read_bytes(offset.as_usize(), out)
    }

    pub fn largest_free_size(&self) -> u32 {
        self.allocator.largest_free_size()
    }

    pub fn largest_free_or_pending_size(&self) -> u32 {
        self.allocator.largest_free_or_pending_size()
    }

    pub fn check_consistency(&self) -> bool {
        self.allocator.check_consistency()
    }

    /// The arena region, e.g. for registering it with the peer.
    #[inline]
    pub fn shm(&self) -> &SharedMemory {
        &self.shm
    }

    #[inline]
    pub fn allocator(&self) -> &FencedAllocator<W> {
        &self.allocator
    }

    #[inline]
    pub fn allocator_mut(&mut self) -> &mut FencedAllocator<W> {
        &mut self.allocator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    use cmdbuf_core::BufferSync;
    use cmdbuf_loopback::{LoopbackConfig, LoopbackService};

    use crate::helper::CommandBufferHelper;

    struct Immediate;

    impl TokenWaiter for Immediate {
        fn wait_for_token(&mut self, _token: Token) -> CmdBufResult<()> {
            Ok(())
        }
    }

    fn wrapper(size: u32) -> FencedAllocatorWrapper<Immediate> {
        FencedAllocatorWrapper::create("cmdbuf-wrapper-test", size, Immediate).unwrap()
    }

    #[test]
    fn test_pointer_offset_conversion() {
        let mut w = wrapper(1024);
        let p = w.alloc(10).unwrap();
        let q = w.alloc(10).unwrap();
        assert_eq!(w.offset_of(p).unwrap(), Offset::ZERO);
        // Rounded to ALIGNMENT.
        assert_eq!(w.offset_of(q).unwrap(), Offset::new(16));
        assert_eq!(w.pointer_at(Offset::new(16)).unwrap(), q);
        assert!(w.pointer_at(Offset::new(1024)).is_err());

        let outside = NonNull::new(0x10 as *mut u8).unwrap();
        assert!(w.offset_of(outside).is_err());
    }

    #[test]
    fn test_alloc_typed_aligned() {
        let mut w = wrapper(1024);
        let _ = w.alloc(3).unwrap();
        let p: NonNull<u64> = w.alloc_typed(4).unwrap();
        assert_eq!(p.as_ptr() as usize % mem::align_of::<u64>(), 0);
        assert_eq!(w.largest_free_size(), 1024 - 8 - 32);

        #[repr(align(64))]
        struct Wide([u8; 64]);
        assert!(matches!(
            w.alloc_typed::<Wide>(1),
            Err(CmdBufError::Unaligned { align: 64, max: ALIGNMENT })
        ));
    }

    #[test]
    fn test_free_and_pending() {
        let mut w = wrapper(64);
        let p = w.alloc(32).unwrap();
        let q = w.alloc(32).unwrap();
        w.free(p).unwrap();
        w.free_pending_token(q, Token::new(1)).unwrap();
        assert_eq!(w.largest_free_size(), 32);
        assert_eq!(w.largest_free_or_pending_size(), 64);
        // Needs the pending block.
        let r = w.alloc(64).unwrap();
        assert_eq!(w.offset_of(r).unwrap(), Offset::ZERO);
        assert!(w.check_consistency());
    }

    #[test]
    fn test_bytes_through_arena() {
        let mut w = wrapper(256);
        let p = w.alloc(5).unwrap();
        let offset = w.offset_of(p).unwrap();
        w.write_bytes(offset, b"hello").unwrap();

        let mut out = [0u8; 5];
        w.read_bytes(offset, &mut out).unwrap();
        assert_eq!(&out, b"hello");
        assert_eq!(unsafe { *p.as_ptr().add(1) }, b'e');
        assert!(w.write_bytes(Offset::new(254), b"xyz").is_err());
    }

    #[test]
    fn test_arena_shared_with_peer() {
        let peer = Arc::new(LoopbackService::new(LoopbackConfig::default()));
        let helper = CommandBufferHelper::init(Arc::clone(&peer), 64).unwrap();
        let helper = Rc::new(RefCell::new(helper));

        let mut w = FencedAllocatorWrapper::create("cmdbuf-transfer", 4096, Rc::clone(&helper)).unwrap();
        let id = peer.register_shared_memory(w.shm()).unwrap();
        assert!(id.is_valid());
        assert_eq!(peer.region_count(), 2);

        let p = w.alloc(4096).unwrap();
        let token = helper.borrow_mut().insert_token().unwrap();
        w.free_pending_token(p, token).unwrap();
        assert_eq!(w.alloc(4096).unwrap(), p);
        assert!(helper.borrow_mut().has_token_passed(token));

        peer.unregister_shared_memory(id);
    }
}
