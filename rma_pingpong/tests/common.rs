//! Helpers for running two in-process ranks over the loopback fabric.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;

use rma_pingpong::Comm;
use rma_pingpong::buffer::AlignedBuffer;
use rma_pingpong::engine::SENTINEL;
use rma_pingpong::loopback::{CompletionMode, LoopbackFabric, LoopbackGroup, LoopbackTransport};

pub type LoopbackComm = Comm<LoopbackTransport, LoopbackGroup>;

/// Run `f` once per rank of `fabric`, each on its own thread with a freshly
/// bootstrapped `Comm`. Results are returned in rank order.
pub fn run_ranks<R, F>(fabric: &Arc<LoopbackFabric>, f: F) -> Vec<R>
where
    R: Send + 'static,
    F: Fn(LoopbackComm) -> R + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let handles: Vec<_> = (0..fabric.ranks())
        .map(|rank| {
            let fabric = fabric.clone();
            let f = f.clone();
            thread::Builder::new()
                .name(format!("rank-{}", rank))
                .spawn(move || {
                    let comm = Comm::init(fabric.transport(rank), fabric.group(rank))
                        .expect("loopback bootstrap failed");
                    f(comm)
                })
                .expect("failed to spawn rank thread")
        })
        .collect();

    handles
        .into_iter()
        .map(|h| h.join().expect("rank thread panicked"))
        .collect()
}

pub fn pair(mode: CompletionMode) -> Arc<LoopbackFabric> {
    LoopbackFabric::new(2, mode)
}

/// Bootstrap plus a registered, zeroed region of `len` bytes, and a send
/// scratch of the same length filled with the sentinel.
pub fn registered(mut comm: LoopbackComm, len: usize) -> (LoopbackComm, AlignedBuffer) {
    comm.reg_buffer(AlignedBuffer::new(len, 0).unwrap()).unwrap();
    comm.barrier();
    (comm, AlignedBuffer::new(len, SENTINEL).unwrap())
}

/// Copy of the registered region.
pub fn region_bytes(comm: &LoopbackComm) -> Vec<u8> {
    comm.registered().unwrap().as_slice().to_vec()
}
