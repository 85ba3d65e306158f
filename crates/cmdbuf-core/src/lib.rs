//! # cmdbuf-core
//!
//! Core types and traits for the command-buffer runtime.
//!
//! This crate holds everything both sides of the ring agree on: the wire
//! format, typed IDs, the peer interface and the shared-memory regions the
//! ring and transfer arenas live in. The client lives in `cmdbuf-client`.
//!
//! ## Modules
//!
//! - `ids` - Offset, token, shm and resource identifier types
//! - `wire` - Command header and entry encoding
//! - `parser` - Ring decoder with caller-supplied argument buffers
//! - `sync` - Peer interface (`BufferSync`) and `TokenWaiter`
//! - `shm` - fd-backed shared memory regions
//! - `cancel` - Cancellation token for cooperative cancellation
//! - `error` - Error types
//! - `kprint` - Stderr backend for the `log` facade
//! - `env` - Environment variable utilities

pub mod ids;
pub mod wire;
pub mod parser;
pub mod sync;
pub mod shm;
pub mod cancel;
pub mod error;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use ids::{Offset, ResourceId, ShmId, Token};
pub use wire::{CommandEntry, CommandHeader, CommandId, ENTRY_SIZE};
pub use parser::CommandParser;
pub use sync::{BufferSync, ParseError, PeerStatus, TokenWaiter};
pub use shm::SharedMemory;
pub use cancel::CancellationToken;
pub use error::{CmdBufError, CmdBufResult};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str};
