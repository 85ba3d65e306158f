//! Ring decoder.
//!
//! `CommandParser` walks the ring from `get` towards `put`, one command at
//! a time. Argument words are copied into a buffer owned by the caller so
//! the decoder holds no scratch state of its own and several decoders can
//! run side by side.
//!
//! Structural errors (`InvalidSize`, `OutOfBounds`) leave `get` where it
//! is: the stream cannot be resynchronized. Everything else is the
//! handler's business and happens after the command was consumed.

use crate::error::{CmdBufError, CmdBufResult};
use crate::ids::Offset;
use crate::shm::SharedMemory;
use crate::sync::ParseError;
use crate::wire::{CommandEntry, CommandId, ENTRY_SIZE};

/// Decoder over a ring living inside a shared-memory region.
pub struct CommandParser<'a> {
    shm: &'a SharedMemory,
    /// First word of the ring inside `shm`.
    base: usize,
    entry_count: u32,
    get: u32,
    put: u32,
}

impl<'a> CommandParser<'a> {
    /// Bind a parser to `size` bytes at byte `offset` of `shm`, starting
    /// at entry `start_get`.
    pub fn new(
        shm: &'a SharedMemory,
        offset: usize,
        size: usize,
        start_get: Offset,
    ) -> CmdBufResult<Self> {
        let entry_count = (size / ENTRY_SIZE) as u32;
        if entry_count == 0 || offset % ENTRY_SIZE != 0 {
            return Err(CmdBufError::InvalidEntryCount(entry_count));
        }
        match offset.checked_add(size) {
            Some(end) if end <= shm.len() => {}
            _ => {
                return Err(CmdBufError::OutOfBounds {
                    offset,
                    len: size,
                    size: shm.len(),
                })
            }
        }
        let get = start_get.as_u32() % entry_count;
        Ok(Self {
            shm,
            base: offset / ENTRY_SIZE,
            entry_count,
            get,
            put: get,
        })
    }

    #[inline]
    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    #[inline]
    pub fn get(&self) -> Offset {
        Offset::new(self.get)
    }

    #[inline]
    pub fn put(&self) -> Offset {
        Offset::new(self.put)
    }

    /// Update the producer cursor. Out-of-range values are ignored.
    pub fn set_put(&mut self, put: Offset) -> bool {
        if put.as_u32() >= self.entry_count {
            return false;
        }
        self.put = put.as_u32();
        true
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.get == self.put
    }

    /// Entries between get and put.
    #[inline]
    pub fn pending(&self) -> u32 {
        (self.put + self.entry_count - self.get) % self.entry_count
    }

    #[inline]
    fn word(&self, index: u32) -> Result<CommandEntry, ParseError> {
        self.shm
            .read_word(self.base + index as usize)
            .map(CommandEntry::from_u32)
            .map_err(|_| ParseError::OutOfBounds)
    }

    /// Decode the command at `get` and advance past it.
    ///
    /// Returns `Ok(None)` when the ring is empty. On success `args` holds
    /// exactly the argument words of the command.
    pub fn next_command(
        &mut self,
        args: &mut Vec<CommandEntry>,
    ) -> Result<Option<CommandId>, ParseError> {
        if self.is_empty() {
            return Ok(None);
        }
        let header = self.word(self.get)?.as_header();
        let size = header.size();
        if size == 0 {
            return Err(ParseError::InvalidSize);
        }
        if self.get + size > self.entry_count || size > self.pending() {
            return Err(ParseError::OutOfBounds);
        }

        args.clear();
        for i in 1..size {
            args.push(self.word(self.get + i)?);
        }
        self.get = (self.get + size) % self.entry_count;
        Ok(Some(header.command()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{CommandHeader, cmd};

    fn ring(entries: usize) -> SharedMemory {
        SharedMemory::create("cmdbuf-parser-test", entries * ENTRY_SIZE).unwrap()
    }

    fn write(shm: &SharedMemory, at: usize, words: &[CommandEntry]) {
        for (i, w) in words.iter().enumerate() {
            shm.write_word(at + i, w.as_u32()).unwrap();
        }
    }

    #[test]
    fn test_decode_sequence() {
        let shm = ring(16);
        let header = CommandEntry::from_header(CommandHeader::new(3, CommandId::new(9)));
        write(&shm, 0, &[header, 1u32.into(), (-2i32).into()]);
        write(&shm, 3, &cmd::set_token(crate::ids::Token::new(4)));

        let mut p = CommandParser::new(&shm, 0, 64, Offset::ZERO).unwrap();
        assert!(p.set_put(Offset::new(5)));

        let mut args = Vec::new();
        assert_eq!(p.next_command(&mut args), Ok(Some(CommandId::new(9))));
        assert_eq!(args, vec![CommandEntry::from_u32(1), CommandEntry::from_i32(-2)]);
        assert_eq!(p.next_command(&mut args), Ok(Some(CommandId::SET_TOKEN)));
        assert_eq!(args[0].as_u32(), 4);
        assert_eq!(p.next_command(&mut args), Ok(None));
        assert_eq!(p.get(), Offset::new(5));
    }

    #[test]
    fn test_zero_size_is_structural() {
        let shm = ring(8);
        let mut p = CommandParser::new(&shm, 0, 32, Offset::ZERO).unwrap();
        p.set_put(Offset::new(2));
        let mut args = Vec::new();
        assert_eq!(p.next_command(&mut args), Err(ParseError::InvalidSize));
        assert_eq!(p.get(), Offset::ZERO);
    }

    #[test]
    fn test_command_past_put() {
        let shm = ring(8);
        write(&shm, 0, &[CommandEntry::from_header(CommandHeader::new(4, CommandId::NOOP))]);
        let mut p = CommandParser::new(&shm, 0, 32, Offset::ZERO).unwrap();
        p.set_put(Offset::new(2));
        let mut args = Vec::new();
        assert_eq!(p.next_command(&mut args), Err(ParseError::OutOfBounds));
    }

    #[test]
    fn test_wraps_to_zero() {
        let shm = ring(4);
        write(&shm, 2, &[CommandEntry::from_header(cmd::noop_header(2))]);
        write(&shm, 0, &[CommandEntry::from_header(cmd::noop_header(1))]);
        let mut p = CommandParser::new(&shm, 0, 16, Offset::new(2)).unwrap();
        p.set_put(Offset::new(1));
        let mut args = Vec::new();
        assert_eq!(p.next_command(&mut args), Ok(Some(CommandId::NOOP)));
        assert_eq!(p.get(), Offset::ZERO);
        assert_eq!(p.next_command(&mut args), Ok(Some(CommandId::NOOP)));
        assert!(p.is_empty());
    }

    #[test]
    fn test_region_must_fit() {
        let shm = ring(4);
        assert!(CommandParser::new(&shm, 0, 32, Offset::ZERO).is_err());
        assert!(CommandParser::new(&shm, 0, 0, Offset::ZERO).is_err());
    }
}
