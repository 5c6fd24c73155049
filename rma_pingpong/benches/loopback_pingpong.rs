//! Ping-pong engine over the in-process loopback fabric.
//!
//! Measures the protocol overhead (slot polling, flush draining, barriers)
//! without a NIC. Run with:
//! ```bash
//! cargo bench --package rma_pingpong --bench loopback_pingpong
//! ```

use std::thread;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use rma_pingpong::buffer::AlignedBuffer;
use rma_pingpong::engine::SENTINEL;
use rma_pingpong::loopback::{CompletionMode, LoopbackFabric};
use rma_pingpong::{Comm, bench};

const SIZES: [usize; 4] = [8, 256, 4096, 16384];
/// Round trips per pair, bounding region memory.
const CHUNK: u64 = 1024;

/// Run `iters` measured round trips at `size` on a fresh pair; returns rank
/// 0's elapsed time.
fn pingpong(iters: usize, size: usize) -> Duration {
    let fabric = LoopbackFabric::new(2, CompletionMode::Deferred);
    let handles: Vec<_> = (0..2)
        .map(|rank| {
            let fabric = fabric.clone();
            thread::spawn(move || {
                let mut comm = Comm::init(fabric.transport(rank), fabric.group(rank)).unwrap();
                let len = iters * size;
                comm.reg_buffer(AlignedBuffer::new(len, 0).unwrap()).unwrap();
                let sdata = AlignedBuffer::new(len, SENTINEL).unwrap();
                comm.barrier();
                bench(&comm, sdata.as_slice(), iters, 0, size).unwrap()
            })
        })
        .collect();

    let mut elapsed = Duration::ZERO;
    for handle in handles {
        if let Some(m) = handle.join().unwrap() {
            elapsed = m.elapsed;
        }
    }
    elapsed
}

fn bench_pingpong(c: &mut Criterion) {
    let mut group = c.benchmark_group("loopback_pingpong");
    for size in SIZES {
        group.throughput(Throughput::Bytes(2 * size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_custom(|iters| {
                let mut elapsed = Duration::ZERO;
                let mut left = iters;
                while left > 0 {
                    let n = left.min(CHUNK);
                    elapsed += pingpong(n as usize, size);
                    left -= n;
                }
                elapsed
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_pingpong);
criterion_main!(benches);
