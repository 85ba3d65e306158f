//! Command buffer helper.
//!
//! `CommandBufferHelper` owns the ring: it writes commands at `put`,
//! publishes `put` to the peer, and blocks on the peer when it needs room
//! or needs a token to have passed.
//!
//! ```text
//!           get (peer)            put (client)
//!              v                     v
//! +------+-----+=====================+----------------+
//! | free | ... | written, unread     | free           |
//! +------+-----+=====================+----------------+
//!  0                                          entry_count
//! ```
//!
//! One slot always stays unwritten so `get == put` means empty. A command
//! never straddles the end of the ring: when it would, the tail is padded
//! with NOOPs and writing restarts at 0.
//!
//! All blocking goes through `wait_for_get_change`, one peer round trip at
//! a time, and is bounded by the configured deadline and cancellation token.

use std::time::{Duration, Instant};

use cmdbuf_core::wire::cmd;
use cmdbuf_core::{
    BufferSync, CancellationToken, CmdBufError, CmdBufResult, CommandEntry, CommandHeader,
    CommandId, Offset, ParseError, PeerStatus, SharedMemory, ShmId, Token, TokenWaiter,
    ENTRY_SIZE,
};

use crate::config::{defaults, HelperConfig};

/// Limits on one blocking operation.
struct WaitBudget {
    started: Instant,
    deadline: Option<Duration>,
    cancel: CancellationToken,
}

impl WaitBudget {
    fn new(deadline: Option<Duration>, cancel: CancellationToken) -> Self {
        Self {
            started: Instant::now(),
            deadline,
            cancel,
        }
    }

    /// Called before every peer round trip.
    fn check(&self) -> CmdBufResult<()> {
        self.cancel.check()?;
        if let Some(deadline) = self.deadline {
            let waited = self.started.elapsed();
            if waited >= deadline {
                return Err(CmdBufError::Timeout { waited });
            }
        }
        Ok(())
    }
}

/// Client side of a command ring.
///
/// Single writer: the helper is not `Sync` and takes `&mut self` for every
/// operation that touches the cursors.
pub struct CommandBufferHelper<P: BufferSync> {
    peer: P,
    ring: SharedMemory,
    shm_id: ShmId,
    entry_count: u32,
    put: u32,
    /// Last get observed from the peer.
    get: u32,
    /// Last token inserted.
    token: Token,
    /// Last token the peer reported as processed.
    last_token_read: Token,
    /// The counter wrapped to 0 and the ring has not drained since.
    wrap_pending: bool,
    pending_parse_error: Option<ParseError>,
    wait_deadline: Option<Duration>,
    cancel: CancellationToken,
}

impl<P: BufferSync> CommandBufferHelper<P> {
    /// Create a ring of `entry_count` entries and hand it to `peer`.
    pub fn init(peer: P, entry_count: u32) -> CmdBufResult<Self> {
        Self::create(peer, entry_count, defaults::SHM_NAME, None)
    }

    /// Like `init`, with ring size, shm name and wait deadline from `config`.
    pub fn from_config(peer: P, config: &HelperConfig) -> CmdBufResult<Self> {
        config.validate()?;
        Self::create(peer, config.ring_entries, &config.shm_name, config.wait_deadline)
    }

    fn create(
        peer: P,
        entry_count: u32,
        shm_name: &str,
        wait_deadline: Option<Duration>,
    ) -> CmdBufResult<Self> {
        if entry_count == 0 || entry_count as usize > u32::MAX as usize / ENTRY_SIZE {
            return Err(CmdBufError::InvalidEntryCount(entry_count));
        }
        let size = entry_count as usize * ENTRY_SIZE;
        let ring = SharedMemory::create(shm_name, size)?;

        // On failure `ring` is dropped here, which unmaps it.
        let shm_id = peer
            .register_shared_memory(&ring)
            .ok_or(CmdBufError::RegistrationFailed)?;
        peer.set_command_buffer(shm_id, 0, size, Offset::ZERO);

        let start = peer.get();
        let start = if start.as_u32() < entry_count {
            start.as_u32()
        } else {
            log::warn!("peer reported get={} for a ring of {} entries", start, entry_count);
            0
        };
        let last_token_read = peer.get_token();

        log::debug!(
            "command buffer ready: {} entries, {}, get={}, token={}",
            entry_count,
            shm_id,
            start,
            last_token_read
        );

        Ok(Self {
            peer,
            ring,
            shm_id,
            entry_count,
            put: start,
            get: start,
            token: last_token_read,
            last_token_read,
            wrap_pending: false,
            pending_parse_error: None,
            wait_deadline,
            cancel: CancellationToken::dummy(),
        })
    }

    // ── Accessors ──

    #[inline]
    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    #[inline]
    pub fn put(&self) -> Offset {
        Offset::new(self.put)
    }

    /// Last get cursor observed from the peer.
    #[inline]
    pub fn get(&self) -> Offset {
        Offset::new(self.get)
    }

    #[inline]
    pub fn shm_id(&self) -> ShmId {
        self.shm_id
    }

    /// Last token inserted by `insert_token`.
    #[inline]
    pub fn current_token(&self) -> Token {
        self.token
    }

    #[inline]
    pub fn last_token_read(&self) -> Token {
        self.last_token_read
    }

    /// The ring's backing region.
    #[inline]
    pub fn ring(&self) -> &SharedMemory {
        &self.ring
    }

    #[inline]
    pub fn peer(&self) -> &P {
        &self.peer
    }

    /// Entries that can be written without waiting, as of the last
    /// observed get.
    #[inline]
    pub fn available_entries(&self) -> u32 {
        (self.get + self.entry_count - self.put - 1) % self.entry_count
    }

    pub fn wait_deadline(&self) -> Option<Duration> {
        self.wait_deadline
    }

    pub fn set_wait_deadline(&mut self, deadline: Option<Duration>) {
        self.wait_deadline = deadline;
    }

    /// Blocking waits fail with `Cancelled` once `token` fires.
    pub fn set_cancellation_token(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    fn budget(&self) -> WaitBudget {
        WaitBudget::new(self.wait_deadline, self.cancel.clone())
    }

    // ── Writing ──

    /// Append a command. Blocks until there is room for it.
    pub fn add_command(&mut self, command: CommandId, args: &[CommandEntry]) -> CmdBufResult<()> {
        let size = args.len() + 1;
        if size > CommandHeader::MAX_SIZE as usize || size >= self.entry_count as usize {
            return Err(CmdBufError::CommandTooLarge {
                size: size.min(u32::MAX as usize) as u32,
                entry_count: self.entry_count,
            });
        }
        let size = size as u32;
        self.wait_for_available_entries(size)?;

        self.write_entry(CommandEntry::from_header(CommandHeader::new(size, command)))?;
        for arg in args {
            self.write_entry(*arg)?;
        }
        Ok(())
    }

    #[inline]
    fn write_entry(&mut self, entry: CommandEntry) -> CmdBufResult<()> {
        self.ring.write_word(self.put as usize, entry.as_u32())?;
        self.put = (self.put + 1) % self.entry_count;
        Ok(())
    }

    /// Publish `put` to the peer. Never blocks.
    #[inline]
    pub fn flush(&mut self) {
        self.peer.put(Offset::new(self.put));
    }

    /// Flush and wait until the peer has consumed everything.
    pub fn finish(&mut self) -> CmdBufResult<()> {
        self.flush();
        let budget = self.budget();
        while self.get != self.put {
            budget.check()?;
            self.wait_for_get_change()?;
        }
        Ok(())
    }

    // ── Tokens ──

    /// Insert a `SET_TOKEN` command and return its token.
    ///
    /// When the counter wraps to 0 the ring is drained first so that token
    /// 0 cannot be confused with "nothing processed yet".
    ///
    /// The counter only advances once the command is in the ring. If the
    /// drain after a wrap fails, the next `insert_token` or wait on a
    /// pre-wrap token retries it.
    pub fn insert_token(&mut self) -> CmdBufResult<Token> {
        if self.wrap_pending {
            self.settle_wrap()?;
        }
        let token = self.token.next();
        let [_, value] = cmd::set_token(token);
        self.add_command(CommandId::SET_TOKEN, &[value])?;
        self.token = token;
        if token == Token::ZERO {
            log::debug!("token counter wrapped, draining ring");
            self.last_token_read = Token::ZERO;
            self.wrap_pending = true;
            self.settle_wrap()?;
        }
        Ok(token)
    }

    fn settle_wrap(&mut self) -> CmdBufResult<()> {
        self.finish()?;
        self.wrap_pending = false;
        self.last_token_read = self.peer_token();
        Ok(())
    }

    /// Peer token, with values left over from before a wrap read as 0.
    #[inline]
    fn peer_token(&self) -> Token {
        let token = self.peer.get_token();
        if token > self.token {
            Token::ZERO
        } else {
            token
        }
    }

    /// Non-blocking: has the peer processed `token`?
    pub fn has_token_passed(&mut self, token: Token) -> bool {
        if token > self.token {
            // Issued before the counter wrapped: passed once the ring drains.
            if self.wrap_pending {
                let get = self.peer.get();
                if get.as_u32() < self.entry_count {
                    self.get = get.as_u32();
                }
                if self.get == self.put {
                    self.wrap_pending = false;
                    self.last_token_read = self.peer_token();
                }
            }
            return !self.wrap_pending;
        }
        if self.last_token_read >= token {
            return true;
        }
        self.last_token_read = self.peer_token();
        self.last_token_read >= token
    }

    /// Block until the peer has processed `token`.
    ///
    /// Fails with `ProtocolDesync` if the ring drains without the token
    /// showing up.
    pub fn wait_for_token(&mut self, token: Token) -> CmdBufResult<()> {
        if token > self.token {
            // Issued before the counter wrapped.
            if self.wrap_pending {
                self.settle_wrap()?;
            }
            return Ok(());
        }
        if self.last_token_read >= token {
            return Ok(());
        }
        self.flush();
        let budget = self.budget();
        loop {
            self.last_token_read = self.peer_token();
            if self.last_token_read >= token {
                return Ok(());
            }
            if self.get == self.put {
                log::error!(
                    "ring empty while waiting for token {} (last read {})",
                    token,
                    self.last_token_read
                );
                return Err(CmdBufError::ProtocolDesync {
                    token,
                    last_read: self.last_token_read,
                });
            }
            budget.check()?;
            self.wait_for_get_change()?;
        }
    }

    // ── Waiting for room ──

    /// Block until `count` contiguous entries can be written at `put`.
    ///
    /// Wraps the ring (padding the tail with NOOPs) when fewer than `count`
    /// entries are left before the physical end.
    pub fn wait_for_available_entries(&mut self, count: u32) -> CmdBufResult<()> {
        if count >= self.entry_count {
            return Err(CmdBufError::CommandTooLarge {
                size: count,
                entry_count: self.entry_count,
            });
        }
        let budget = self.budget();

        if self.put + count > self.entry_count {
            // put is about to become 0: get must not be in (put, end) nor at
            // 0, or the NOOPs would overwrite unread entries.
            self.flush();
            while self.get > self.put || self.get == 0 {
                budget.check()?;
                self.wait_for_get_change()?;
            }
            self.pad_to_end()?;
        }

        if self.available_entries() >= count {
            return Ok(());
        }
        self.flush();
        while self.available_entries() < count {
            budget.check()?;
            self.wait_for_get_change()?;
        }
        Ok(())
    }

    fn pad_to_end(&mut self) -> CmdBufResult<()> {
        let padded = self.entry_count - self.put;
        let mut remaining = padded;
        while remaining > 0 {
            let n = remaining.min(CommandHeader::MAX_SIZE);
            self.ring
                .write_word(self.put as usize, CommandEntry::from_header(cmd::noop_header(n)).as_u32())?;
            self.put += n;
            remaining -= n;
        }
        self.put = 0;
        log::trace!("ring wrapped, {} entries padded", padded);
        Ok(())
    }

    /// One peer round trip: wait for get to move.
    ///
    /// A parse error on the peer is logged and kept for `take_parse_error`;
    /// disconnection and a missing buffer are fatal.
    pub fn wait_for_get_change(&mut self) -> CmdBufResult<()> {
        let old = Offset::new(self.get);
        let new_get = self.peer.wait_get_changes(old);
        if new_get != old && new_get.as_u32() < self.entry_count {
            self.get = new_get.as_u32();
            return Ok(());
        }

        match self.peer.get_status() {
            PeerStatus::Parsing => Ok(()),
            PeerStatus::NotConnected => {
                log::error!("peer disconnected");
                Err(CmdBufError::PeerDisconnected)
            }
            PeerStatus::NoBuffer => {
                log::error!("peer has no command buffer set");
                Err(CmdBufError::NoBuffer)
            }
            PeerStatus::ParseError => {
                let error = self.peer.get_parse_error();
                match error {
                    Some(e) => log::warn!("peer parse error: {}", e),
                    None => log::warn!("peer reported a parse error without details"),
                }
                if error.is_some() {
                    self.pending_parse_error = error;
                }
                Ok(())
            }
        }
    }

    /// Return and clear the last parse error reported by the peer.
    pub fn take_parse_error(&mut self) -> Option<ParseError> {
        if let Some(e) = self.pending_parse_error.take() {
            return Some(e);
        }
        if self.peer.get_status() == PeerStatus::ParseError {
            return self.peer.get_parse_error();
        }
        None
    }
}

impl<P: BufferSync> TokenWaiter for CommandBufferHelper<P> {
    fn wait_for_token(&mut self, token: Token) -> CmdBufResult<()> {
        CommandBufferHelper::wait_for_token(self, token)
    }
}

impl<P: BufferSync> Drop for CommandBufferHelper<P> {
    fn drop(&mut self) {
        self.peer.unregister_shared_memory(self.shm_id);
        log::debug!("command buffer {} released", self.shm_id);
    }
}

impl<P: BufferSync> std::fmt::Debug for CommandBufferHelper<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBufferHelper")
            .field("shm_id", &self.shm_id)
            .field("entry_count", &self.entry_count)
            .field("put", &self.put)
            .field("get", &self.get)
            .field("token", &self.token)
            .field("last_token_read", &self.last_token_read)
            .finish()
    }
}
