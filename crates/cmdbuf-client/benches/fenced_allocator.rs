//! Allocator churn and command throughput.
//!
//! Run: cargo bench -p cmdbuf-client

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};

use cmdbuf_client::{CommandBufferHelper, FencedAllocator, IdAllocator};
use cmdbuf_core::{CmdBufResult, CommandEntry, CommandId, Offset, Token, TokenWaiter};
use cmdbuf_loopback::{LoopbackConfig, LoopbackService};

struct Immediate;

impl TokenWaiter for Immediate {
    fn wait_for_token(&mut self, _token: Token) -> CmdBufResult<()> {
        Ok(())
    }
}

fn bench_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("fenced_allocator");
    group.throughput(Throughput::Elements(64));

    group.bench_function("alloc_free_64x256", |b| {
        let mut arena = FencedAllocator::new(1 << 20, Immediate);
        let mut live = Vec::with_capacity(64);
        b.iter(|| {
            for _ in 0..64 {
                live.push(arena.alloc(black_box(256)).unwrap());
            }
            for o in live.drain(..) {
                arena.free(o).unwrap();
            }
        });
    });

    group.bench_function("alloc_reclaim_pending_64x256", |b| {
        b.iter_batched(
            || {
                let mut arena = FencedAllocator::new(64 * 256, Immediate);
                let offsets: Vec<Offset> = (0..64).map(|_| arena.alloc(256).unwrap()).collect();
                for (i, o) in offsets.iter().enumerate() {
                    arena.free_pending_token(*o, Token::new(i as u32)).unwrap();
                }
                arena
            },
            |mut arena| {
                for _ in 0..64 {
                    black_box(arena.alloc(256).unwrap());
                }
                arena
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn bench_id_allocator(c: &mut Criterion) {
    c.bench_function("id_allocator_1024", |b| {
        b.iter(|| {
            let mut ids = IdAllocator::new();
            for _ in 0..1024 {
                black_box(ids.allocate_id());
            }
        });
    });
}

fn bench_commands(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_buffer");
    group.throughput(Throughput::Elements(1000));

    let peer = Arc::new(LoopbackService::new(LoopbackConfig::default()));
    let mut helper = CommandBufferHelper::init(Arc::clone(&peer), 4096).unwrap();
    let args = [CommandEntry::from_u32(1), CommandEntry::from_u32(2)];

    group.bench_function("add_command_1000_inline_peer", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                helper.add_command(CommandId::new(7), black_box(&args)).unwrap();
            }
            helper.finish().unwrap();
            while peer.records().pop().is_some() {}
        });
    });

    group.finish();
}

criterion_group!(benches, bench_alloc_free, bench_id_allocator, bench_commands);
criterion_main!(benches);
