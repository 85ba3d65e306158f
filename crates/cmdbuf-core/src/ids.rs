//! Typed identifiers shared between client and peer.
//!
//! All of these are plain 32-bit values on the wire. The newtypes keep ring
//! offsets, arena offsets, shared-memory ids, tokens and resource ids from
//! being mixed up on the client side.

use core::fmt;

/// Offset into the ring (in entries) or into a transfer arena (in bytes).
///
/// The maximum value is reserved as the invalid sentinel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Offset(u32);

impl Offset {
    /// Sentinel for "no offset" / "no progress".
    pub const INVALID: Offset = Offset(u32::MAX);

    /// Offset zero.
    pub const ZERO: Offset = Offset(0);

    #[inline]
    pub const fn new(raw: u32) -> Self {
        Offset(raw)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Offset as a `usize` index.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }

    /// Convert to Option, mapping the sentinel to `None`.
    #[inline]
    pub const fn to_option(self) -> Option<Offset> {
        if self.is_valid() {
            Some(self)
        } else {
            None
        }
    }
}

impl From<u32> for Offset {
    #[inline]
    fn from(raw: u32) -> Self {
        Offset(raw)
    }
}

impl From<Offset> for u32 {
    #[inline]
    fn from(offset: Offset) -> Self {
        offset.0
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Offset({})", self.0)
        } else {
            write!(f, "Offset(INVALID)")
        }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "invalid")
        }
    }
}

/// Identifier the peer assigns to a registered shared-memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ShmId(i32);

impl ShmId {
    pub const INVALID: ShmId = ShmId(-1);

    #[inline]
    pub const fn new(raw: i32) -> Self {
        ShmId(raw)
    }

    #[inline]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for ShmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shm#{}", self.0)
    }
}

/// A synchronization token carried by `SET_TOKEN`.
///
/// Tokens wrap around at `u32::MAX`; ordering is plain numeric ordering,
/// the helper deals with the wrap explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Token(u32);

impl Token {
    pub const ZERO: Token = Token(0);

    #[inline]
    pub const fn new(raw: u32) -> Self {
        Token(raw)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// The token after this one, wrapping to zero.
    #[inline]
    pub const fn next(self) -> Token {
        Token(self.0.wrapping_add(1))
    }
}

impl From<u32> for Token {
    #[inline]
    fn from(raw: u32) -> Self {
        Token(raw)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Small dense integer naming a peer-side resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ResourceId(u32);

impl ResourceId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        ResourceId(raw)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for ResourceId {
    #[inline]
    fn from(raw: u32) -> Self {
        ResourceId(raw)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
