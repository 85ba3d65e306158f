//! Resource ID allocator.
//!
//! Dense bitmap of allocated IDs. Allocation always returns the smallest
//! free ID so the peer can size its per-resource tables by the highest ID
//! it has seen. The bitmap grows on demand and never shrinks.

use cmdbuf_core::ResourceId;

/// Number of bits per bitmap word
const BITS_PER_WORD: usize = 32;

#[derive(Debug, Default, Clone)]
pub struct IdAllocator {
    /// Bit `i` set = ID `i` allocated
    bitmap: Vec<u32>,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the smallest unused ID.
    pub fn allocate_id(&mut self) -> ResourceId {
        let word_idx = match self.bitmap.iter().position(|w| *w != u32::MAX) {
            Some(i) => i,
            None => {
                self.bitmap.push(0);
                self.bitmap.len() - 1
            }
        };
        let bit_idx = self.bitmap[word_idx].trailing_ones() as usize;
        self.bitmap[word_idx] |= 1 << bit_idx;
        ResourceId::new((word_idx * BITS_PER_WORD + bit_idx) as u32)
    }

    /// Release an ID. Freeing an unallocated ID does nothing.
    pub fn free_id(&mut self, id: ResourceId) {
        let (word_idx, mask) = Self::locate(id);
        if let Some(word) = self.bitmap.get_mut(word_idx) {
            *word &= !mask;
        }
    }

    /// Reserve a specific ID, e.g. one assigned by the peer.
    ///
    /// Returns false if it was already in use.
    pub fn mark_used(&mut self, id: ResourceId) -> bool {
        let (word_idx, mask) = Self::locate(id);
        if word_idx >= self.bitmap.len() {
            self.bitmap.resize(word_idx + 1, 0);
        }
        let was_free = self.bitmap[word_idx] & mask == 0;
        self.bitmap[word_idx] |= mask;
        was_free
    }

    /// IDs past the end of the bitmap are not in use.
    #[inline]
    pub fn in_use(&self, id: ResourceId) -> bool {
        let (word_idx, mask) = Self::locate(id);
        self.bitmap.get(word_idx).is_some_and(|w| w & mask != 0)
    }

    /// Number of allocated IDs.
    pub fn in_use_count(&self) -> usize {
        self.bitmap.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[inline]
    fn locate(id: ResourceId) -> (usize, u32) {
        let idx = id.as_usize();
        (idx / BITS_PER_WORD, 1u32 << (idx % BITS_PER_WORD))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_sequential() {
        let mut ids = IdAllocator::new();
        for i in 0..100 {
            assert_eq!(ids.allocate_id(), ResourceId::new(i));
        }
        assert_eq!(ids.in_use_count(), 100);
        assert!(ids.in_use(ResourceId::new(99)));
        assert!(!ids.in_use(ResourceId::new(100)));
    }

    #[test]
    fn test_free_reuses_lowest() {
        let mut ids = IdAllocator::new();
        for _ in 0..70 {
            ids.allocate_id();
        }
        ids.free_id(ResourceId::new(40));
        ids.free_id(ResourceId::new(3));
        assert!(!ids.in_use(ResourceId::new(3)));

        assert_eq!(ids.allocate_id(), ResourceId::new(3));
        assert_eq!(ids.allocate_id(), ResourceId::new(40));
        assert_eq!(ids.allocate_id(), ResourceId::new(70));
    }

    #[test]
    fn test_free_unallocated_is_benign() {
        let mut ids = IdAllocator::new();
        ids.free_id(ResourceId::new(5));
        ids.free_id(ResourceId::new(10_000));
        assert_eq!(ids.in_use_count(), 0);
        assert_eq!(ids.allocate_id(), ResourceId::new(0));
    }

    #[test]
    fn test_never_returns_in_use() {
        let mut ids = IdAllocator::new();
        let mut live = std::collections::HashSet::new();
        for i in 0..500u32 {
            if i % 3 == 2 {
                let victim = ResourceId::new(i / 2);
                if live.remove(&victim) {
                    ids.free_id(victim);
                }
            }
            let id = ids.allocate_id();
            assert!(live.insert(id), "{} handed out twice", id);
            assert!(ids.in_use(id));
        }
        assert_eq!(ids.in_use_count(), live.len());
    }

    #[test]
    fn test_mark_used() {
        let mut ids = IdAllocator::new();
        assert!(ids.mark_used(ResourceId::new(1)));
        assert!(!ids.mark_used(ResourceId::new(1)));
        assert!(ids.mark_used(ResourceId::new(100)));

        assert_eq!(ids.allocate_id(), ResourceId::new(0));
        assert_eq!(ids.allocate_id(), ResourceId::new(2));
        assert!(ids.in_use(ResourceId::new(100)));
    }
}
