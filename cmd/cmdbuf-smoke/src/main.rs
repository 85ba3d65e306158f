//! Command-buffer End-to-End Smoke Test
//!
//! Exercises the client stack against a threaded loopback peer:
//!   Part A: ring commands with tokens and wrap-around
//!   Part B: transfer arena, fenced frees reclaimed through tokens
//!   Part C: resource IDs
//!   Part D: failure paths (parse errors, deadlines and disconnect)
//!
//! Run: ./target/release/cmdbuf-smoke
//! (CMDBUF_LOG_LEVEL=debug for peer/helper tracing)

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cmdbuf_client::{CommandBufferHelper, FencedAllocatorWrapper, HelperConfig, IdAllocator};
use cmdbuf_core::{
    kprint, BufferSync, CmdBufError, CommandEntry, CommandId, ParseError, Token,
};
use cmdbuf_loopback::{LoopbackConfig, LoopbackService};

// ── Command ids understood by the smoke peer ──
mod op {
    use cmdbuf_core::CommandId;

    /// (offset, len): a block of the transfer arena is ready
    pub const UPLOAD: CommandId = CommandId::new(2);
    /// (seq): ordering probe
    pub const SEQ: CommandId = CommandId::new(3);
    /// Not understood by the peer
    pub const BOGUS: CommandId = CommandId::new(0x00ff_ffff);
}

fn smoke_handler(command: CommandId, args: &[CommandEntry]) -> Result<(), ParseError> {
    match command {
        op::UPLOAD if args.len() == 2 => Ok(()),
        op::SEQ if args.len() == 1 => Ok(()),
        op::UPLOAD | op::SEQ => Err(ParseError::InvalidArguments),
        _ => Err(ParseError::UnknownCommand),
    }
}

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    /// Record a `Result`, returning the value on success.
    fn ok<T>(&mut self, name: &str, r: Result<T, CmdBufError>) -> Option<T> {
        match r {
            Ok(v) => { self.pass(name); Some(v) }
            Err(e) => { self.fail(name, &e.to_string()); None }
        }
    }

    /// `ok` without a PASS line, for loops.
    fn ok_quiet<T>(&mut self, r: Result<T, CmdBufError>) -> Option<T> {
        match r {
            Ok(v) => Some(v),
            Err(e) => { self.fail("alloc", &e.to_string()); None }
        }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

type Helper = CommandBufferHelper<Arc<LoopbackService>>;

// ════════════════════════════════════════════════════════════
// Part A: Ring
// ════════════════════════════════════════════════════════════

fn test_ring(t: &mut TestRunner, peer: &Arc<LoopbackService>, helper: &mut Helper) {
    t.section("Part A: Ring and tokens");

    // A1: ordering through many wraps
    let start = Instant::now();
    let mut ok = true;
    let mut last = Token::ZERO;
    for seq in 0..10_000u32 {
        if helper.add_command(op::SEQ, &[CommandEntry::from_u32(seq)]).is_err() {
            ok = false;
            break;
        }
        if seq % 1000 == 999 {
            match helper.insert_token() {
                Ok(tok) => last = tok,
                Err(_) => { ok = false; break; }
            }
        }
    }
    t.check("add_command x10000", ok, "add_command failed");

    // A2: tokens
    t.ok("wait_for_token(last)", helper.wait_for_token(last));
    t.check(
        "peer token caught up",
        peer.get_token() >= last,
        &format!("peer at {}, want {}", peer.get_token(), last),
    );
    t.check("has_token_passed", helper.has_token_passed(last), "token not passed");

    // A3: finish drains everything
    t.ok("finish()", helper.finish());
    t.check("get == put", helper.get() == helper.put(), "ring not drained");

    let records = peer.drain_records();
    let in_order = records
        .iter()
        .enumerate()
        .all(|(i, r)| r.command == op::SEQ && r.args[0].as_u32() == i as u32);
    t.check(
        "10000 commands in FIFO order",
        records.len() == 10_000 && in_order,
        &format!("got {} records, in_order={}", records.len(), in_order),
    );
    println!(
        "       {} commands in {:?}, {} NOOP pads",
        records.len(),
        start.elapsed(),
        peer.stats().noops
    );
}

// ════════════════════════════════════════════════════════════
// Part B: Transfer arena
// ════════════════════════════════════════════════════════════

fn test_arena(
    t: &mut TestRunner,
    peer: &Arc<LoopbackService>,
    helper: &Rc<RefCell<Helper>>,
    config: &HelperConfig,
) {
    t.section("Part B: Fenced transfer arena");

    let mut arena = match FencedAllocatorWrapper::create(
        &config.shm_name,
        64 * 1024,
        Rc::clone(helper),
    ) {
        Ok(a) => { t.pass("create 64 KiB arena"); a }
        Err(e) => { t.fail("create 64 KiB arena", &e.to_string()); return; }
    };
    let arena_id = peer.register_shared_memory(arena.shm());
    t.check("register arena with peer", arena_id.is_some(), "registration refused");

    // B1: fill the arena with uploads, fencing every block
    let mut uploads = 0;
    for round in 0..64u32 {
        let Some(ptr) = t.ok_quiet(arena.alloc(4096)) else {
            break;
        };
        let Ok(offset) = arena.offset_of(ptr) else { break };
        let payload = [round as u8; 64];
        if arena.write_bytes(offset, &payload).is_err() {
            break;
        }
        let mut h = helper.borrow_mut();
        let sent = h
            .add_command(
                op::UPLOAD,
                &[CommandEntry::from_u32(offset.as_u32()), CommandEntry::from_u32(64)],
            )
            .and_then(|_| h.insert_token());
        drop(h);
        match sent.and_then(|tok| arena.free_pending_token(ptr, tok)) {
            Ok(()) => uploads += 1,
            Err(_) => break,
        }
    }
    t.check("64 fenced uploads through 16 blocks", uploads == 64, &format!("only {}", uploads));
    t.check("arena consistent", arena.check_consistency(), "block list broken");

    // B2: draining returns one free block
    t.ok("drain pending", arena.allocator_mut().drain_pending());
    t.check(
        "whole arena free",
        arena.largest_free_size() == 64 * 1024,
        &format!("largest free {}", arena.largest_free_size()),
    );

    let uploads_seen = peer
        .drain_records()
        .iter()
        .filter(|r| r.command == op::UPLOAD)
        .count();
    t.check("peer saw every upload", uploads_seen == 64, &format!("saw {}", uploads_seen));

    if let Some(id) = arena_id {
        peer.unregister_shared_memory(id);
    }
}

// ════════════════════════════════════════════════════════════
// Part C: Resource IDs
// ════════════════════════════════════════════════════════════

fn test_ids(t: &mut TestRunner) {
    t.section("Part C: Resource IDs");

    let mut ids = IdAllocator::new();
    let first: Vec<u32> = (0..100).map(|_| ids.allocate_id().as_u32()).collect();
    t.check("dense 0..100", first == (0..100).collect::<Vec<_>>(), "not dense");

    ids.free_id(cmdbuf_core::ResourceId::new(42));
    t.check(
        "lowest freed id reused",
        ids.allocate_id().as_u32() == 42,
        "did not reuse 42",
    );
    t.check("in_use_count", ids.in_use_count() == 100, "wrong count");
}

// ════════════════════════════════════════════════════════════
// Part D: Failure paths
// ════════════════════════════════════════════════════════════

fn test_failures(t: &mut TestRunner, peer: &Arc<LoopbackService>, helper: &mut Helper) {
    t.section("Part D: Failure paths");

    // D1: unknown command is reported, ring stays usable
    let r = helper.add_command(op::BOGUS, &[]).and_then(|_| helper.finish());
    t.ok("unknown command does not break ring", r);
    t.check(
        "parse error surfaced",
        helper.take_parse_error() == Some(ParseError::UnknownCommand),
        "no parse error",
    );

    // D2: deadline on a stalled peer
    peer.set_stalled(true);
    let _ = helper.add_command(op::SEQ, &[CommandEntry::from_u32(0)]);
    let r = helper.finish();
    t.check(
        "stalled peer -> Timeout",
        matches!(r, Err(CmdBufError::Timeout { .. })),
        &format!("{:?}", r),
    );
    peer.set_stalled(false);
    t.ok("resume after stall", helper.finish());
    let _ = peer.drain_records();

    // D3: disconnect is fatal
    peer.disconnect();
    let _ = helper.add_command(op::SEQ, &[CommandEntry::from_u32(1)]);
    let r = helper.finish();
    t.check(
        "disconnect -> PeerDisconnected",
        matches!(r, Err(ref e) if e.is_fatal()),
        &format!("{:?}", r),
    );
}

fn main() {
    kprint::init();
    println!("=== Command-buffer End-to-End Smoke Test ===");

    let config = HelperConfig::from_env()
        .ring_entries(256)
        .wait_deadline(Some(Duration::from_millis(500)));
    config.log();

    let mut t = TestRunner::new();

    let peer = Arc::new(LoopbackService::with_handler(LoopbackConfig::from_env(), smoke_handler));
    let dispatcher = match peer.spawn() {
        Ok(h) => h,
        Err(e) => {
            println!("\nFATAL: cannot start peer dispatcher: {}", e);
            std::process::exit(1);
        }
    };

    let helper = match CommandBufferHelper::from_config(Arc::clone(&peer), &config) {
        Ok(h) => { t.pass("helper from_config"); h }
        Err(e) => {
            println!("\nFATAL: helper init failed: {}", e);
            peer.shutdown();
            let _ = dispatcher.join();
            t.summary();
            std::process::exit(1);
        }
    };
    let helper = Rc::new(RefCell::new(helper));

    test_ring(&mut t, &peer, &mut helper.borrow_mut());
    test_arena(&mut t, &peer, &helper, &config);
    test_ids(&mut t);
    test_failures(&mut t, &peer, &mut helper.borrow_mut());

    drop(helper);
    peer.shutdown();
    let _ = dispatcher.join();

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}
