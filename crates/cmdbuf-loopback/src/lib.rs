//! # cmdbuf-loopback: in-process peer
//!
//! `LoopbackService` implements `BufferSync` inside the client's process.
//! It maps every registered region a second time (from a dup of the fd),
//! parses the ring between `get` and `put`, tracks `SET_TOKEN`, and hands
//! every other command to a `CommandHandler`.
//!
//! Two ways to drive it:
//!
//! ```text
//! inline      wait_get_changes()  -> parse one batch on the caller's thread
//! dispatcher  spawn()             -> dedicated thread runs:
//!
//!             loop {
//!                 1. Parse up to max_batch commands from the ring
//!                 2. Publish get/token, wake waiters
//!                 3. If no work -> wait for put() or idle timeout
//!             }
//! ```
//!
//! The service only knows `NOOP` and `SET_TOKEN`. Accepted user commands
//! are appended to a lock-free record log that tests and tools can drain
//! from any thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;

use cmdbuf_core::env::env_get;
use cmdbuf_core::parser::CommandParser;
use cmdbuf_core::{
    BufferSync, CommandEntry, CommandHeader, CommandId, Offset, ParseError, PeerStatus,
    SharedMemory, ShmId, Token, ENTRY_SIZE,
};

/// Configuration for the loopback peer.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Maximum commands parsed per batch.
    pub max_batch: usize,
    /// How long `wait_get_changes` and an idle dispatcher wait before
    /// giving control back (microseconds).
    pub idle_wait_us: u64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            max_batch: 64,
            idle_wait_us: 200,
        }
    }
}

impl LoopbackConfig {
    /// Defaults overridden by `CMDBUF_LOOPBACK_BATCH` and
    /// `CMDBUF_LOOPBACK_IDLE_US`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_batch: env_get("CMDBUF_LOOPBACK_BATCH", d.max_batch).max(1),
            idle_wait_us: env_get("CMDBUF_LOOPBACK_IDLE_US", d.idle_wait_us),
        }
    }

    fn idle_wait(&self) -> Duration {
        Duration::from_micros(self.idle_wait_us)
    }
}

/// Executes user commands on the peer side.
///
/// Returning an error marks the command as failed: it is still consumed,
/// and the error is reported through `get_parse_error`.
pub trait CommandHandler: Send {
    fn handle(&mut self, command: CommandId, args: &[CommandEntry]) -> Result<(), ParseError>;
}

impl<F> CommandHandler for F
where
    F: FnMut(CommandId, &[CommandEntry]) -> Result<(), ParseError> + Send,
{
    fn handle(&mut self, command: CommandId, args: &[CommandEntry]) -> Result<(), ParseError> {
        self(command, args)
    }
}

/// One accepted user command, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRecord {
    pub command: CommandId,
    pub args: Vec<CommandEntry>,
    /// Last token processed before this command.
    pub token: Token,
}

/// Counters since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub commands: u64,
    pub tokens: u64,
    pub noops: u64,
    pub parse_errors: u64,
}

/// Where the ring lives.
#[derive(Debug, Clone, Copy)]
struct RingBinding {
    shm_id: ShmId,
    offset: usize,
    size: usize,
}

impl RingBinding {
    fn entry_count(&self) -> u32 {
        (self.size / ENTRY_SIZE) as u32
    }
}

struct PeerState {
    regions: HashMap<ShmId, SharedMemory>,
    next_id: i32,
    ring: Option<RingBinding>,
    put: u32,
    get: u32,
    token: Token,
    connected: bool,
    parse_error: Option<ParseError>,
    handler: Box<dyn CommandHandler>,
    /// Scratch for decoded arguments, reused across batches.
    args: Vec<CommandEntry>,
    stats: LoopbackStats,

    // Test knobs
    stalled: bool,
    drop_tokens: bool,
    fail_registration: bool,
    batch_limit: Option<usize>,
}

impl PeerState {
    fn status(&self) -> PeerStatus {
        if !self.connected {
            PeerStatus::NotConnected
        } else if self.ring.is_none() {
            PeerStatus::NoBuffer
        } else if self.parse_error.is_some() {
            PeerStatus::ParseError
        } else {
            PeerStatus::Parsing
        }
    }

    /// Parse one batch. Returns true if `get` moved.
    fn process(&mut self, max_batch: usize, records: &SegQueue<CommandRecord>) -> bool {
        if !self.connected || self.stalled {
            return false;
        }
        let Some(ring) = self.ring else {
            return false;
        };
        let Some(shm) = self.regions.get(&ring.shm_id) else {
            return false;
        };
        let mut parser = match CommandParser::new(shm, ring.offset, ring.size, Offset::new(self.get)) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("loopback: ring no longer fits its region: {}", e);
                return false;
            }
        };
        parser.set_put(Offset::new(self.put));

        let limit = self.batch_limit.unwrap_or(max_batch).max(1);
        let mut done = 0;
        while done < limit {
            match parser.next_command(&mut self.args) {
                Ok(None) => break,
                Ok(Some(CommandId::NOOP)) => self.stats.noops += 1,
                Ok(Some(CommandId::SET_TOKEN)) => {
                    if self.args.len() != 1 {
                        self.parse_error = Some(ParseError::InvalidArguments);
                        self.stats.parse_errors += 1;
                    } else if !self.drop_tokens {
                        self.token = Token::new(self.args[0].as_u32());
                        self.stats.tokens += 1;
                    }
                }
                Ok(Some(command)) => match self.handler.handle(command, &self.args) {
                    Ok(()) => {
                        self.stats.commands += 1;
                        records.push(CommandRecord {
                            command,
                            args: self.args.clone(),
                            token: self.token,
                        });
                    }
                    Err(e) => {
                        log::debug!("loopback: command {} rejected: {}", command, e);
                        self.parse_error = Some(e);
                        self.stats.parse_errors += 1;
                    }
                },
                Err(e) => {
                    // Structural: get stays put, the stream is stuck here.
                    log::debug!("loopback: parse error at get={}: {}", parser.get(), e);
                    self.parse_error = Some(e);
                    self.stats.parse_errors += 1;
                    break;
                }
            }
            done += 1;
        }

        let new_get = parser.get().as_u32();
        let moved = new_get != self.get;
        self.get = new_get;
        moved
    }
}

/// In-process `BufferSync` peer.
pub struct LoopbackService {
    state: Mutex<PeerState>,
    /// Signalled on put(), progress, disconnect and shutdown.
    changed: Condvar,
    records: Arc<SegQueue<CommandRecord>>,
    dispatcher_running: AtomicBool,
    shutdown: AtomicBool,
    config: LoopbackConfig,
}

impl LoopbackService {
    /// A peer that accepts every user command.
    pub fn new(config: LoopbackConfig) -> Self {
        Self::with_handler(config, |_: CommandId, _: &[CommandEntry]| -> Result<(), ParseError> {
            Ok(())
        })
    }

    pub fn with_handler<H: CommandHandler + 'static>(config: LoopbackConfig, handler: H) -> Self {
        Self {
            state: Mutex::new(PeerState {
                regions: HashMap::new(),
                next_id: 1,
                ring: None,
                put: 0,
                get: 0,
                token: Token::ZERO,
                connected: true,
                parse_error: None,
                handler: Box::new(handler),
                args: Vec::with_capacity(CommandHeader::MAX_SIZE as usize),
                stats: LoopbackStats::default(),
                stalled: false,
                drop_tokens: false,
                fail_registration: false,
                batch_limit: None,
            }),
            changed: Condvar::new(),
            records: Arc::new(SegQueue::new()),
            dispatcher_running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a dispatcher thread. From then on the ring is parsed
    /// asynchronously and `wait_get_changes` only waits.
    pub fn spawn(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let this = Arc::clone(self);
        self.dispatcher_running.store(true, Ordering::Release);
        let spawned = std::thread::Builder::new()
            .name("cmdbuf-loopback".into())
            .spawn(move || this.dispatcher_loop());
        if spawned.is_err() {
            self.dispatcher_running.store(false, Ordering::Release);
        }
        spawned
    }

    /// Ask the dispatcher thread to exit.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.changed.notify_all();
    }

    fn dispatcher_loop(&self) {
        log::debug!("loopback: dispatcher started");
        let mut state = self.lock();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            if state.process(self.config.max_batch, &self.records) {
                self.changed.notify_all();
                // Let the client in between batches.
                drop(state);
                state = self.lock();
                continue;
            }
            state = self
                .changed
                .wait_timeout(state, self.config.idle_wait())
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        self.dispatcher_running.store(false, Ordering::Release);
        log::debug!("loopback: dispatcher stopped");
    }

    /// Parse pending commands on the caller's thread until the ring is
    /// drained or parsing stops making progress. Returns batches run.
    pub fn process_pending(&self) -> usize {
        let mut state = self.lock();
        let mut batches = 0;
        while state.process(self.config.max_batch, &self.records) {
            batches += 1;
        }
        if batches > 0 {
            self.changed.notify_all();
        }
        batches
    }

    /// Shared log of accepted user commands.
    pub fn records(&self) -> Arc<SegQueue<CommandRecord>> {
        Arc::clone(&self.records)
    }

    /// Pop every record logged so far.
    pub fn drain_records(&self) -> Vec<CommandRecord> {
        std::iter::from_fn(|| self.records.pop()).collect()
    }

    pub fn stats(&self) -> LoopbackStats {
        self.lock().stats
    }

    pub fn region_count(&self) -> usize {
        self.lock().regions.len()
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    /// Stop parsing without reporting an error.
    pub fn set_stalled(&self, stalled: bool) {
        self.lock().stalled = stalled;
        self.changed.notify_all();
    }

    /// Consume `SET_TOKEN` commands without updating the token.
    pub fn set_drop_tokens(&self, drop_tokens: bool) {
        self.lock().drop_tokens = drop_tokens;
    }

    /// Refuse every following registration.
    pub fn set_fail_registration(&self, fail: bool) {
        self.lock().fail_registration = fail;
    }

    /// Override `max_batch`. `None` restores the configured value.
    pub fn set_batch_limit(&self, limit: Option<usize>) {
        self.lock().batch_limit = limit;
    }

    /// Simulate the peer going away.
    pub fn disconnect(&self) {
        self.lock().connected = false;
        self.changed.notify_all();
    }
}

impl BufferSync for LoopbackService {
    fn register_shared_memory(&self, shm: &SharedMemory) -> Option<ShmId> {
        let mut state = self.lock();
        if state.fail_registration || !state.connected {
            return None;
        }
        let fd = match shm.try_clone_fd() {
            Ok(fd) => fd,
            Err(e) => {
                log::warn!("loopback: cannot dup region fd: {}", e);
                return None;
            }
        };
        // Safety: the fd refers to the client's region of `shm.len()` bytes.
        let mapped = match unsafe { SharedMemory::from_fd(fd, shm.len()) } {
            Ok(m) => m,
            Err(e) => {
                log::warn!("loopback: cannot map region: {}", e);
                return None;
            }
        };
        let id = ShmId::new(state.next_id);
        state.next_id += 1;
        state.regions.insert(id, mapped);
        log::trace!("loopback: registered {} ({} bytes)", id, shm.len());
        Some(id)
    }

    fn unregister_shared_memory(&self, id: ShmId) {
        let mut state = self.lock();
        if state.regions.remove(&id).is_none() {
            log::warn!("loopback: unregister of unknown region {}", id);
            return;
        }
        if state.ring.is_some_and(|r| r.shm_id == id) {
            state.ring = None;
        }
        log::trace!("loopback: unregistered {}", id);
    }

    fn set_command_buffer(&self, id: ShmId, offset: usize, size: usize, start_get: Offset) {
        let mut state = self.lock();
        let binding = RingBinding { shm_id: id, offset, size };
        let fits = state
            .regions
            .get(&id)
            .is_some_and(|shm| CommandParser::new(shm, offset, size, start_get).is_ok());
        if !fits || start_get.as_u32() >= binding.entry_count() {
            log::warn!(
                "loopback: rejecting ring {} offset={} size={} start_get={}",
                id,
                offset,
                size,
                start_get
            );
            state.ring = None;
            return;
        }
        state.ring = Some(binding);
        state.get = start_get.as_u32();
        state.put = start_get.as_u32();
        state.parse_error = None;
    }

    fn put(&self, offset: Offset) {
        let mut state = self.lock();
        match state.ring {
            Some(ring) if offset.as_u32() < ring.entry_count() => state.put = offset.as_u32(),
            _ => {
                log::warn!("loopback: ignoring put({})", offset);
                return;
            }
        }
        drop(state);
        self.changed.notify_all();
    }

    fn get(&self) -> Offset {
        Offset::new(self.lock().get)
    }

    fn get_token(&self) -> Token {
        self.lock().token
    }

    fn get_status(&self) -> PeerStatus {
        self.lock().status()
    }

    fn get_parse_error(&self) -> Option<ParseError> {
        self.lock().parse_error.take()
    }

    fn wait_get_changes(&self, old_get: Offset) -> Offset {
        let inline = !self.dispatcher_running.load(Ordering::Acquire);
        let deadline = Instant::now() + self.config.idle_wait();
        let mut state = self.lock();
        loop {
            if inline && state.process(self.config.max_batch, &self.records) {
                self.changed.notify_all();
            }
            if state.get != old_get.as_u32() || state.status() != PeerStatus::Parsing {
                return Offset::new(state.get);
            }
            let now = Instant::now();
            if now >= deadline || self.shutdown.load(Ordering::Acquire) {
                return old_get;
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmdbuf_core::wire::cmd;

    const RING: usize = 32;

    fn setup(service: &LoopbackService) -> (SharedMemory, ShmId) {
        let shm = SharedMemory::create("cmdbuf-loopback-test", RING * ENTRY_SIZE).unwrap();
        let id = service.register_shared_memory(&shm).unwrap();
        service.set_command_buffer(id, 0, shm.len(), Offset::ZERO);
        (shm, id)
    }

    fn write(shm: &SharedMemory, at: usize, words: &[CommandEntry]) {
        for (i, w) in words.iter().enumerate() {
            shm.write_word(at + i, w.as_u32()).unwrap();
        }
    }

    fn user(command: u32, args: &[u32]) -> Vec<CommandEntry> {
        let mut v = vec![CommandEntry::from_header(CommandHeader::new(
            args.len() as u32 + 1,
            CommandId::new(command),
        ))];
        v.extend(args.iter().map(|a| CommandEntry::from_u32(*a)));
        v
    }

    #[test]
    fn test_status_lifecycle() {
        let service = LoopbackService::new(LoopbackConfig::default());
        assert_eq!(service.get_status(), PeerStatus::NoBuffer);
        let (_shm, id) = setup(&service);
        assert_eq!(service.get_status(), PeerStatus::Parsing);
        service.unregister_shared_memory(id);
        assert_eq!(service.get_status(), PeerStatus::NoBuffer);
        service.disconnect();
        assert_eq!(service.get_status(), PeerStatus::NotConnected);
    }

    #[test]
    fn test_processes_tokens_and_records() {
        let service = LoopbackService::new(LoopbackConfig::default());
        let (shm, _) = setup(&service);

        write(&shm, 0, &user(7, &[11, 12]));
        write(&shm, 3, &cmd::set_token(Token::new(1)));
        write(&shm, 5, &user(8, &[]));
        service.put(Offset::new(6));

        assert_eq!(service.wait_get_changes(Offset::ZERO), Offset::new(6));
        assert_eq!(service.get_token(), Token::new(1));

        let records = service.drain_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].command, CommandId::new(7));
        assert_eq!(records[0].args, vec![CommandEntry::from_u32(11), CommandEntry::from_u32(12)]);
        assert_eq!(records[0].token, Token::ZERO);
        assert_eq!(records[1].token, Token::new(1));

        let stats = service.stats();
        assert_eq!(stats.commands, 2);
        assert_eq!(stats.tokens, 1);
    }

    #[test]
    fn test_batch_limit() {
        let service = LoopbackService::new(LoopbackConfig::default());
        let (shm, _) = setup(&service);
        service.set_batch_limit(Some(1));

        write(&shm, 0, &user(5, &[1]));
        write(&shm, 2, &user(5, &[2]));
        service.put(Offset::new(4));

        assert_eq!(service.wait_get_changes(Offset::ZERO), Offset::new(2));
        assert_eq!(service.wait_get_changes(Offset::new(2)), Offset::new(4));
    }

    #[test]
    fn test_rejected_command_is_consumed() {
        let service = LoopbackService::with_handler(
            LoopbackConfig::default(),
            |c: CommandId, _: &[CommandEntry]| -> Result<(), ParseError> {
                if c == CommandId::new(9) {
                    Err(ParseError::UnknownCommand)
                } else {
                    Ok(())
                }
            },
        );
        let (shm, _) = setup(&service);
        write(&shm, 0, &user(9, &[]));
        service.put(Offset::new(1));

        assert_eq!(service.wait_get_changes(Offset::ZERO), Offset::new(1));
        assert_eq!(service.get_status(), PeerStatus::ParseError);
        assert_eq!(service.get_parse_error(), Some(ParseError::UnknownCommand));
        assert_eq!(service.get_parse_error(), None);
        assert_eq!(service.get_status(), PeerStatus::Parsing);
    }

    #[test]
    fn test_structural_error_sticks() {
        let service = LoopbackService::new(LoopbackConfig { idle_wait_us: 10, ..Default::default() });
        let (_shm, _) = setup(&service);
        // Word 0 is still zero: a header of size 0.
        service.put(Offset::new(1));

        assert_eq!(service.wait_get_changes(Offset::ZERO), Offset::ZERO);
        assert_eq!(service.get_parse_error(), Some(ParseError::InvalidSize));
        assert_eq!(service.process_pending(), 0);
        assert_eq!(service.get(), Offset::ZERO);
    }

    #[test]
    fn test_stalled_returns_old_get() {
        let service = LoopbackService::new(LoopbackConfig { idle_wait_us: 10, ..Default::default() });
        let (shm, _) = setup(&service);
        write(&shm, 0, &user(5, &[]));
        service.put(Offset::new(1));
        service.set_stalled(true);

        assert_eq!(service.wait_get_changes(Offset::ZERO), Offset::ZERO);
        service.set_stalled(false);
        assert_eq!(service.wait_get_changes(Offset::ZERO), Offset::new(1));
    }

    #[test]
    fn test_rejects_bad_put_and_ring() {
        let service = LoopbackService::new(LoopbackConfig::default());
        let (_shm, id) = setup(&service);
        service.put(Offset::new(RING as u32));
        assert_eq!(service.lock().put, 0);

        service.set_command_buffer(id, 0, RING * ENTRY_SIZE * 2, Offset::ZERO);
        assert_eq!(service.get_status(), PeerStatus::NoBuffer);
    }

    #[test]
    fn test_fail_registration() {
        let service = LoopbackService::new(LoopbackConfig::default());
        service.set_fail_registration(true);
        let shm = SharedMemory::create("cmdbuf-loopback-test", 64).unwrap();
        assert!(service.register_shared_memory(&shm).is_none());
        assert_eq!(service.region_count(), 0);
    }

    #[test]
    fn test_dispatcher_thread() {
        let service = Arc::new(LoopbackService::new(LoopbackConfig::default()));
        let (shm, _) = setup(&service);
        let handle = service.spawn().unwrap();

        write(&shm, 0, &user(3, &[42]));
        write(&shm, 2, &cmd::set_token(Token::new(9)));
        service.put(Offset::new(4));

        let mut get = Offset::ZERO;
        for _ in 0..10_000 {
            get = service.wait_get_changes(get);
            if get == Offset::new(4) {
                break;
            }
        }
        assert_eq!(get, Offset::new(4));
        assert_eq!(service.get_token(), Token::new(9));

        service.shutdown();
        handle.join().unwrap();
        assert_eq!(service.records().len(), 1);
    }
}
