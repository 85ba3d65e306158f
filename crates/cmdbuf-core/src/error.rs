//! Error types for the command-buffer runtime

use std::time::Duration;

use thiserror::Error;

use crate::ids::{Offset, Token};

/// Result type for command-buffer operations
pub type CmdBufResult<T> = Result<T, CmdBufError>;

/// Errors that can occur in client operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CmdBufError {
    /// Ring size of zero (or too large to map)
    #[error("invalid ring entry count: {0}")]
    InvalidEntryCount(u32),

    /// Shared-memory primitive failed
    #[error("shared memory {op} failed: errno {errno}")]
    Shm { op: &'static str, errno: i32 },

    /// Peer refused to register a shared-memory region
    #[error("peer refused shared memory registration")]
    RegistrationFailed,

    /// A command can never fit in the ring
    #[error("command of {size} entries cannot fit in a ring of {entry_count}")]
    CommandTooLarge { size: u32, entry_count: u32 },

    /// No free or reclaimable block is large enough
    #[error("transfer arena exhausted: {requested} bytes requested")]
    ArenaExhausted { requested: u32 },

    /// Offset does not start a block
    #[error("offset {0} does not start an allocated block")]
    InvalidOffset(Offset),

    /// Type alignment the transfer arena cannot honour
    #[error("alignment {align} exceeds arena alignment {max}")]
    Unaligned { align: usize, max: usize },

    /// Configuration rejected by `validate()`
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),

    /// Access outside a mapped region
    #[error("access of {len} bytes at {offset} outside region of {size} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    /// The ring drained without the awaited token showing up
    #[error("ring empty while waiting for token {token} (last read {last_read})")]
    ProtocolDesync { token: Token, last_read: Token },

    /// Peer reported NOT_CONNECTED
    #[error("peer disconnected")]
    PeerDisconnected,

    /// Peer reported NO_BUFFER
    #[error("peer has no command buffer")]
    NoBuffer,

    /// A blocking wait exceeded the configured deadline
    #[error("wait exceeded deadline after {waited:?}")]
    Timeout { waited: Duration },

    /// A blocking wait observed a cancelled token
    #[error("wait cancelled")]
    Cancelled,
}

impl CmdBufError {
    /// Protocol-level failures: the ring and peer can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CmdBufError::ProtocolDesync { .. } | CmdBufError::PeerDisconnected | CmdBufError::NoBuffer
        )
    }

    /// Expected outcomes the caller can retry or work around.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CmdBufError::ArenaExhausted { .. } | CmdBufError::Timeout { .. } | CmdBufError::Cancelled
        )
    }

    /// Build a `Shm` error from the current errno.
    pub fn last_os(op: &'static str) -> Self {
        CmdBufError::Shm {
            op,
            errno: nix::errno::Errno::last() as i32,
        }
    }
}
