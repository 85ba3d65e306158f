//! Fenced allocator.
//!
//! Manages a transfer arena as an ordered list of blocks. A block can be
//! freed right away, or "pending a token": the peer may still read it, so
//! it only becomes reusable once that token has passed.
//!
//! ```text
//! offset 0                                                   size
//! +---------+------------------+------+--------------+--------+
//! | IN_USE  | FREE_PENDING(t7) | FREE | FREE_PENDING | IN_USE |
//! +---------+------------------+------+--------------+--------+
//! ```
//!
//! Invariants: blocks are contiguous, sorted, cover `[0, size)`, and no
//! two adjacent blocks are both `Free`. Pending blocks are not merged
//! until they are reclaimed.
//!
//! Allocation is first-fit over `Free` blocks. Failing that, the first
//! pending block whose run of free-or-pending neighbours is large enough
//! is chosen, and the run's tokens are waited on in offset order until
//! the merged block fits. The allocator never waits unless the wait is
//! guaranteed to produce a fit.

use cmdbuf_core::{CmdBufError, CmdBufResult, Offset, Token, TokenWaiter};

/// Block state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    InUse,
    Free,
    FreePendingToken,
}

/// One contiguous range of the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub state: BlockState,
    pub offset: u32,
    pub size: u32,
    /// Meaningful only for `FreePendingToken`.
    pub token: Token,
}

impl Block {
    #[inline]
    fn end(&self) -> u32 {
        self.offset + self.size
    }

    #[inline]
    fn is_reclaimable(&self) -> bool {
        matches!(self.state, BlockState::Free | BlockState::FreePendingToken)
    }
}

/// Block-list allocator over `[0, size)` with token-fenced frees.
pub struct FencedAllocator<W: TokenWaiter> {
    waiter: W,
    blocks: Vec<Block>,
    size: u32,
}

impl<W: TokenWaiter> FencedAllocator<W> {
    /// An arena of `size` bytes, initially one free block.
    pub fn new(size: u32, waiter: W) -> Self {
        let blocks = if size == 0 {
            Vec::new()
        } else {
            vec![Block {
                state: BlockState::Free,
                offset: 0,
                size,
                token: Token::ZERO,
            }]
        };
        Self { waiter, blocks, size }
    }

    /// Allocate `size` bytes (0 counts as 1).
    ///
    /// May block on the waiter to reclaim blocks freed pending a token.
    /// Returns `ArenaExhausted` if no free or reclaimable range is large
    /// enough.
    pub fn alloc(&mut self, size: u32) -> CmdBufResult<Offset> {
        let size = size.max(1);

        if let Some(index) = self
            .blocks
            .iter()
            .position(|b| b.state == BlockState::Free && b.size >= size)
        {
            return Ok(self.alloc_in_block(index, size));
        }

        for index in 0..self.blocks.len() {
            if self.blocks[index].state != BlockState::FreePendingToken {
                continue;
            }
            let (start, end) = self.run_bounds(index);
            if end - start >= size {
                return self.reclaim_and_alloc(start, end, size);
            }
        }

        log::debug!(
            "arena exhausted: {} bytes requested, largest free-or-pending {}",
            size,
            self.largest_free_or_pending_size()
        );
        Err(CmdBufError::ArenaExhausted { requested: size })
    }

    /// Free a block right away.
    pub fn free(&mut self, offset: Offset) -> CmdBufResult<()> {
        let index = self.block_index(offset)?;
        if self.blocks[index].state == BlockState::Free {
            return Err(CmdBufError::InvalidOffset(offset));
        }
        self.blocks[index].state = BlockState::Free;
        self.collapse_free_block(index);
        Ok(())
    }

    /// Free a block once `token` has passed.
    pub fn free_pending_token(&mut self, offset: Offset, token: Token) -> CmdBufResult<()> {
        let index = self.block_index(offset)?;
        let block = &mut self.blocks[index];
        if block.state == BlockState::Free {
            return Err(CmdBufError::InvalidOffset(offset));
        }
        block.state = BlockState::FreePendingToken;
        block.token = token;
        Ok(())
    }

    /// Largest block that can be allocated without waiting.
    pub fn largest_free_size(&self) -> u32 {
        self.blocks
            .iter()
            .filter(|b| b.state == BlockState::Free)
            .map(|b| b.size)
            .max()
            .unwrap_or(0)
    }

    /// Largest block that can be allocated, possibly after waiting.
    pub fn largest_free_or_pending_size(&self) -> u32 {
        let mut largest = 0;
        let mut run = 0;
        for block in &self.blocks {
            if block.is_reclaimable() {
                run += block.size;
                largest = largest.max(run);
            } else {
                run = 0;
            }
        }
        largest
    }

    /// Verify the block-list invariants.
    pub fn check_consistency(&self) -> bool {
        let Some(first) = self.blocks.first() else {
            return self.size == 0;
        };
        if first.offset != 0 {
            return false;
        }
        for pair in self.blocks.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if prev.end() != next.offset {
                return false;
            }
            if prev.state == BlockState::Free && next.state == BlockState::Free {
                return false;
            }
        }
        self.blocks.iter().all(|b| b.size > 0)
            && self.blocks.last().map(Block::end) == Some(self.size)
    }

    /// Wait on and free every pending block.
    pub fn drain_pending(&mut self) -> CmdBufResult<()> {
        let mut index = 0;
        while index < self.blocks.len() {
            if self.blocks[index].state == BlockState::FreePendingToken {
                index = self.wait_for_token_and_free_block(index)?;
            }
            index += 1;
        }
        Ok(())
    }

    // ── Introspection ──

    /// Arena size in bytes.
    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| b.state == BlockState::InUse)
            .count()
    }

    #[inline]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    #[inline]
    pub fn waiter(&self) -> &W {
        &self.waiter
    }

    #[inline]
    pub fn waiter_mut(&mut self) -> &mut W {
        &mut self.waiter
    }

    // ── Internals ──

    fn block_index(&self, offset: Offset) -> CmdBufResult<usize> {
        self.blocks
            .binary_search_by_key(&offset.as_u32(), |b| b.offset)
            .map_err(|_| CmdBufError::InvalidOffset(offset))
    }

    /// Byte range of the free-or-pending run around block `index`.
    fn run_bounds(&self, index: usize) -> (u32, u32) {
        let mut first = index;
        while first > 0 && self.blocks[first - 1].is_reclaimable() {
            first -= 1;
        }
        let mut last = index;
        while last + 1 < self.blocks.len() && self.blocks[last + 1].is_reclaimable() {
            last += 1;
        }
        (self.blocks[first].offset, self.blocks[last].end())
    }

    /// Reclaim pending blocks in `[start, end)` in offset order until the
    /// merged free block fits `size`.
    fn reclaim_and_alloc(&mut self, start: u32, end: u32, size: u32) -> CmdBufResult<Offset> {
        loop {
            let pending = self.blocks.iter().position(|b| {
                b.state == BlockState::FreePendingToken && b.offset >= start && b.end() <= end
            });
            let Some(index) = pending else {
                // Whole run is one free block by now; it fits.
                break;
            };
            let index = self.wait_for_token_and_free_block(index)?;
            if self.blocks[index].size >= size {
                return Ok(self.alloc_in_block(index, size));
            }
        }
        match self.blocks.iter().position(|b| {
            b.state == BlockState::Free && b.offset >= start && b.size >= size
        }) {
            Some(index) => Ok(self.alloc_in_block(index, size)),
            None => Err(CmdBufError::ArenaExhausted { requested: size }),
        }
    }

    /// Wait for the block's token, mark it free and merge it with free
    /// neighbours. Returns the index of the merged block.
    fn wait_for_token_and_free_block(&mut self, index: usize) -> CmdBufResult<usize> {
        let token = self.blocks[index].token;
        log::trace!(
            "reclaiming block at {} ({} bytes) after token {}",
            self.blocks[index].offset,
            self.blocks[index].size,
            token
        );
        self.waiter.wait_for_token(token)?;
        self.blocks[index].state = BlockState::Free;
        Ok(self.collapse_free_block(index))
    }

    /// Merge free block `index` with free neighbours. Returns its new index.
    fn collapse_free_block(&mut self, index: usize) -> usize {
        let mut index = index;
        if index + 1 < self.blocks.len() && self.blocks[index + 1].state == BlockState::Free {
            self.blocks[index].size += self.blocks[index + 1].size;
            self.blocks.remove(index + 1);
        }
        if index > 0 && self.blocks[index - 1].state == BlockState::Free {
            self.blocks[index - 1].size += self.blocks[index].size;
            self.blocks.remove(index);
            index -= 1;
        }
        index
    }

    /// Carve `size` bytes off the front of free block `index`.
    fn alloc_in_block(&mut self, index: usize, size: u32) -> Offset {
        let block = self.blocks[index];
        debug_assert!(block.state == BlockState::Free && block.size >= size);
        self.blocks[index].state = BlockState::InUse;
        if block.size > size {
            self.blocks[index].size = size;
            self.blocks.insert(
                index + 1,
                Block {
                    state: BlockState::Free,
                    offset: block.offset + size,
                    size: block.size - size,
                    token: Token::ZERO,
                },
            );
        }
        Offset::new(block.offset)
    }
}

impl<W: TokenWaiter> Drop for FencedAllocator<W> {
    fn drop(&mut self) {
        if let Err(e) = self.drain_pending() {
            log::error!("fenced allocator: draining pending blocks failed: {}", e);
            return;
        }
        let in_use = self.in_use_count();
        if in_use > 0 {
            log::warn!("fenced allocator dropped with {} blocks in use", in_use);
        }
    }
}

impl<W: TokenWaiter> std::fmt::Debug for FencedAllocator<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FencedAllocator")
            .field("size", &self.size)
            .field("blocks", &self.blocks)
            .finish()
    }
}
