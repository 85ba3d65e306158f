//! Command ring wire format.
//!
//! The ring is a flat array of 32-bit words. A command is a header word
//! followed by `size - 1` argument words:
//!
//! ```text
//!  31                        8 7        0
//! +---------------------------+----------+
//! |         command           |   size   |   header
//! +---------------------------+----------+
//! |            argument 0 (u32/i32/f32)  |
//! |            ...                       |
//! +--------------------------------------+
//! ```
//!
//! `size` counts the header itself, so the smallest command is one word.

use core::fmt;

use crate::ids::Token;

/// Size of one ring entry in bytes.
pub const ENTRY_SIZE: usize = 4;

/// Command identifier (24 bits on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CommandId(u32);

impl CommandId {
    /// Padding command, valid with any argument count.
    pub const NOOP: CommandId = CommandId(0);
    /// Carries a new token value in its single argument.
    pub const SET_TOKEN: CommandId = CommandId(1);
    /// First id available to higher layers.
    pub const FIRST_USER: CommandId = CommandId(2);

    #[inline]
    pub const fn new(raw: u32) -> Self {
        CommandId(raw)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            CommandId::NOOP => write!(f, "NOOP"),
            CommandId::SET_TOKEN => write!(f, "SET_TOKEN"),
            CommandId(raw) => write!(f, "cmd#{}", raw),
        }
    }
}

/// Packed `{size: 8, command: 24}` header word.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct CommandHeader(u32);

impl CommandHeader {
    /// Largest command, in words, including the header.
    pub const MAX_SIZE: u32 = (1 << 8) - 1;
    /// Largest encodable command id.
    pub const MAX_COMMAND: u32 = (1 << 24) - 1;

    /// Pack a header. Out-of-range fields are masked to their bit width;
    /// callers validate before encoding.
    #[inline]
    pub const fn new(size: u32, command: CommandId) -> Self {
        CommandHeader((size & Self::MAX_SIZE) | ((command.0 & Self::MAX_COMMAND) << 8))
    }

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        CommandHeader(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Total words, header included.
    #[inline]
    pub const fn size(self) -> u32 {
        self.0 & Self::MAX_SIZE
    }

    #[inline]
    pub const fn command(self) -> CommandId {
        CommandId(self.0 >> 8)
    }

    /// Number of argument words following the header.
    #[inline]
    pub const fn arg_count(self) -> u32 {
        self.size().saturating_sub(1)
    }
}

impl fmt::Debug for CommandHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandHeader")
            .field("size", &self.size())
            .field("command", &self.command().as_u32())
            .finish()
    }
}

/// One ring word. Interpretation depends on position and command.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct CommandEntry(u32);

impl CommandEntry {
    #[inline]
    pub const fn from_u32(v: u32) -> Self {
        CommandEntry(v)
    }

    #[inline]
    pub const fn from_i32(v: i32) -> Self {
        CommandEntry(v as u32)
    }

    #[inline]
    pub fn from_f32(v: f32) -> Self {
        CommandEntry(v.to_bits())
    }

    #[inline]
    pub const fn from_header(h: CommandHeader) -> Self {
        CommandEntry(h.0)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_i32(self) -> i32 {
        self.0 as i32
    }

    #[inline]
    pub fn as_f32(self) -> f32 {
        f32::from_bits(self.0)
    }

    #[inline]
    pub const fn as_header(self) -> CommandHeader {
        CommandHeader(self.0)
    }
}

impl fmt::Debug for CommandEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandEntry({:#010x})", self.0)
    }
}

impl From<u32> for CommandEntry {
    #[inline]
    fn from(v: u32) -> Self {
        CommandEntry(v)
    }
}

impl From<i32> for CommandEntry {
    #[inline]
    fn from(v: i32) -> Self {
        CommandEntry::from_i32(v)
    }
}

impl From<f32> for CommandEntry {
    #[inline]
    fn from(v: f32) -> Self {
        CommandEntry::from_f32(v)
    }
}

/// Built-in command encoders.
pub mod cmd {
    use super::*;

    /// A NOOP spanning `size` words (header included). The argument words
    /// are left as they are; the parser skips them.
    #[inline]
    pub const fn noop_header(size: u32) -> CommandHeader {
        CommandHeader::new(size, CommandId::NOOP)
    }

    /// Header and argument for `SET_TOKEN`.
    #[inline]
    pub const fn set_token(token: Token) -> [CommandEntry; 2] {
        [
            CommandEntry::from_header(CommandHeader::new(2, CommandId::SET_TOKEN)),
            CommandEntry::from_u32(token.as_u32()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_packing() {
        let h = CommandHeader::new(3, CommandId::new(0x123456));
        assert_eq!(h.size(), 3);
        assert_eq!(h.command(), CommandId::new(0x123456));
        assert_eq!(h.arg_count(), 2);
        assert_eq!(h.raw(), 0x1234_5603);
    }

    #[test]
    fn test_header_masks_oversized_fields() {
        let h = CommandHeader::new(0x1FF, CommandId::new(0x0100_0001));
        assert_eq!(h.size(), 0xFF);
        assert_eq!(h.command(), CommandId::new(1));
    }

    #[test]
    fn test_entry_views() {
        assert_eq!(CommandEntry::from_i32(-1).as_u32(), u32::MAX);
        assert_eq!(CommandEntry::from_f32(1.5).as_f32(), 1.5);
        let h = CommandHeader::new(1, CommandId::NOOP);
        assert_eq!(CommandEntry::from_header(h).as_header(), h);
    }

    #[test]
    fn test_set_token_encoding() {
        let [header, arg] = cmd::set_token(Token::new(7));
        assert_eq!(header.as_header().command(), CommandId::SET_TOKEN);
        assert_eq!(header.as_header().size(), 2);
        assert_eq!(arg.as_u32(), 7);
    }
}
