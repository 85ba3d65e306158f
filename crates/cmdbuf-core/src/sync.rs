//! Peer synchronization interface.
//!
//! A `BufferSync` is the service side of the command buffer as seen from
//! the client: it reads the ring, advances `get`, and reports the last
//! token it processed. Calls may be RPCs to another process; the client
//! never assumes they are cheap.
//!
//! # Implementors
//!
//! - `LoopbackService` (cmdbuf-loopback): in-process peer that parses
//!   the ring on the caller's thread or on a dispatcher thread.
//! - Transport proxies (external): forward each call over IPC.

use std::sync::Arc;

use crate::error::CmdBufResult;
use crate::ids::{Offset, ShmId, Token};
use crate::shm::SharedMemory;

/// Parser state reported by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// The peer is gone; nothing will ever be processed again.
    NotConnected,
    /// Connected, but no command buffer was set.
    NoBuffer,
    /// Normal operation.
    Parsing,
    /// The parser hit an error; see `get_parse_error`.
    ParseError,
}

/// Errors the peer's parser can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("command header has size 0")]
    InvalidSize,
    #[error("command runs past the ring or the put cursor")]
    OutOfBounds,
    #[error("unknown command")]
    UnknownCommand,
    #[error("invalid command arguments")]
    InvalidArguments,
}

/// The peer interface consumed by the helper.
///
/// **Contract:**
/// - `put` never blocks.
/// - `wait_get_changes(old)` blocks until `get != old` or an error state
///   is reached. It may return `old` or `Offset::INVALID` when no progress
///   was made; the caller then checks `get_status`.
/// - `get_parse_error` returns the pending error and clears it.
pub trait BufferSync {
    /// Make a region visible to the peer. Returns `None` on failure.
    fn register_shared_memory(&self, shm: &SharedMemory) -> Option<ShmId>;

    fn unregister_shared_memory(&self, id: ShmId);

    /// Tell the peer where the ring lives. `size` is in bytes, `start_get`
    /// in entries.
    fn set_command_buffer(&self, id: ShmId, offset: usize, size: usize, start_get: Offset);

    /// Publish the client's put cursor.
    fn put(&self, offset: Offset);

    /// Read the peer's get cursor.
    fn get(&self) -> Offset;

    /// Last token the peer fully processed.
    fn get_token(&self) -> Token;

    fn get_status(&self) -> PeerStatus;

    fn get_parse_error(&self) -> Option<ParseError>;

    /// Block until the get cursor moves away from `old_get`.
    fn wait_get_changes(&self, old_get: Offset) -> Offset;
}

impl<T: BufferSync + ?Sized> BufferSync for &T {
    fn register_shared_memory(&self, shm: &SharedMemory) -> Option<ShmId> {
        (**self).register_shared_memory(shm)
    }
    fn unregister_shared_memory(&self, id: ShmId) {
        (**self).unregister_shared_memory(id)
    }
    fn set_command_buffer(&self, id: ShmId, offset: usize, size: usize, start_get: Offset) {
        (**self).set_command_buffer(id, offset, size, start_get)
    }
    fn put(&self, offset: Offset) {
        (**self).put(offset)
    }
    fn get(&self) -> Offset {
        (**self).get()
    }
    fn get_token(&self) -> Token {
        (**self).get_token()
    }
    fn get_status(&self) -> PeerStatus {
        (**self).get_status()
    }
    fn get_parse_error(&self) -> Option<ParseError> {
        (**self).get_parse_error()
    }
    fn wait_get_changes(&self, old_get: Offset) -> Offset {
        (**self).wait_get_changes(old_get)
    }
}

impl<T: BufferSync + ?Sized> BufferSync for Arc<T> {
    fn register_shared_memory(&self, shm: &SharedMemory) -> Option<ShmId> {
        (**self).register_shared_memory(shm)
    }
    fn unregister_shared_memory(&self, id: ShmId) {
        (**self).unregister_shared_memory(id)
    }
    fn set_command_buffer(&self, id: ShmId, offset: usize, size: usize, start_get: Offset) {
        (**self).set_command_buffer(id, offset, size, start_get)
    }
    fn put(&self, offset: Offset) {
        (**self).put(offset)
    }
    fn get(&self) -> Offset {
        (**self).get()
    }
    fn get_token(&self) -> Token {
        (**self).get_token()
    }
    fn get_status(&self) -> PeerStatus {
        (**self).get_status()
    }
    fn get_parse_error(&self) -> Option<ParseError> {
        (**self).get_parse_error()
    }
    fn wait_get_changes(&self, old_get: Offset) -> Offset {
        (**self).wait_get_changes(old_get)
    }
}

/// Something that can block until a token has been processed.
///
/// Implemented by the command buffer helper; consumed by the fenced
/// allocator to reclaim blocks freed pending a token.
pub trait TokenWaiter {
    fn wait_for_token(&mut self, token: Token) -> CmdBufResult<()>;
}

impl<T: TokenWaiter + ?Sized> TokenWaiter for &mut T {
    fn wait_for_token(&mut self, token: Token) -> CmdBufResult<()> {
        (**self).wait_for_token(token)
    }
}

impl<T: TokenWaiter + ?Sized> TokenWaiter for std::rc::Rc<std::cell::RefCell<T>> {
    fn wait_for_token(&mut self, token: Token) -> CmdBufResult<()> {
        self.borrow_mut().wait_for_token(token)
    }
}
