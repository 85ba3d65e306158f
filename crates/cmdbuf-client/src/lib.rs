//! # cmdbuf-client
//!
//! Client side of the command-buffer runtime.
//!
//! A process writes commands into a shared-memory ring with
//! [`CommandBufferHelper`], checkpoints progress with tokens, and stages
//! bulk data in a transfer arena managed by [`FencedAllocator`], whose
//! frees can be deferred until the peer has passed a token.
//!
//! ## Modules
//!
//! - `helper` - Ring buffer, tokens and the blocking wait protocol
//! - `fenced_allocator` - Block-list allocator with token-fenced frees
//! - `wrapper` - Pointer façade over a mapped transfer arena
//! - `id_allocator` - Dense resource ID bitmap
//! - `config` - Defaults and `CMDBUF_*` environment overrides
//!
//! ## Sharing the helper
//!
//! The helper is single-writer. When both user code and an allocator need
//! it, share it as [`SharedHelper`]:
//!
//! ```rust,ignore
//! let helper = Rc::new(RefCell::new(CommandBufferHelper::init(peer, 1024)?));
//! let mut arena = FencedAllocator::new(64 * 1024, Rc::clone(&helper));
//! let block = arena.alloc(256)?;
//! let token = helper.borrow_mut().insert_token()?;
//! arena.free_pending_token(block, token)?;
//! ```

use std::cell::RefCell;
use std::rc::Rc;

pub mod config;
pub mod helper;
pub mod fenced_allocator;
pub mod wrapper;
pub mod id_allocator;

// Re-exports for convenience
pub use config::HelperConfig;
pub use helper::CommandBufferHelper;
pub use fenced_allocator::{Block, BlockState, FencedAllocator};
pub use wrapper::FencedAllocatorWrapper;
pub use id_allocator::IdAllocator;

/// A helper shared between user code and allocators on one thread.
pub type SharedHelper<P> = Rc<RefCell<CommandBufferHelper<P>>>;
