mod common;

use std::cell::Cell;
use std::sync::Arc;
use std::thread;

use rma_pingpong::buffer::AlignedBuffer;
use rma_pingpong::group::GroupComm;
use rma_pingpong::loopback::{CompletionMode, LoopbackFabric, LoopbackGroup, LoopbackTransport};
use rma_pingpong::{Comm, Error, Result};

use common::{pair, registered, run_ranks};

/// Group that rewrites rank 1's blob in the `nth` all-gather it serves.
struct CorruptingGroup {
    inner: LoopbackGroup,
    nth: usize,
    calls: Cell<usize>,
    corrupt: fn(&mut Vec<u8>),
}

impl GroupComm for CorruptingGroup {
    fn rank(&self) -> usize {
        self.inner.rank()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn all_gather(&self, local: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut blobs = self.inner.all_gather(local)?;
        let call = self.calls.get();
        self.calls.set(call + 1);
        if call == self.nth {
            (self.corrupt)(&mut blobs[1]);
        }
        Ok(blobs)
    }

    fn barrier(&self) {
        self.inner.barrier()
    }
}

type CorruptedComm = Comm<LoopbackTransport, CorruptingGroup>;

fn run_corrupted<R: Send + 'static>(
    fabric: &Arc<LoopbackFabric>,
    nth: usize,
    corrupt: fn(&mut Vec<u8>),
    f: fn(Result<CorruptedComm>) -> R,
) -> Vec<R> {
    let handles: Vec<_> = (0..fabric.ranks())
        .map(|rank| {
            let fabric = fabric.clone();
            thread::spawn(move || {
                let group = CorruptingGroup {
                    inner: fabric.group(rank),
                    nth,
                    calls: Cell::new(0),
                    corrupt,
                };
                f(Comm::init(fabric.transport(rank), group))
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn init_connects_every_peer_including_self() {
    let fabric = LoopbackFabric::new(3, CompletionMode::Deferred);
    let counters = fabric.clone();
    let seen = run_ranks(&fabric, move |comm| {
        comm.barrier();
        let endpoints = counters.counters().endpoints();
        comm.barrier();
        (comm.rank(), comm.size(), endpoints)
    });

    for (rank, (r, size, endpoints)) in seen.into_iter().enumerate() {
        assert_eq!(r, rank);
        assert_eq!(size, 3);
        assert_eq!(endpoints, 9);
    }
    assert_eq!(fabric.counters().live(), 0);
}

#[test]
fn reg_buffer_unpacks_a_key_per_peer() {
    let fabric = pair(CompletionMode::Deferred);
    let counters = fabric.clone();
    let seen = run_ranks(&fabric, move |comm| {
        let (comm, _sdata) = registered(comm, 4096);
        let snapshot = (
            counters.counters().mem_handles(),
            counters.counters().remote_keys(),
        );
        comm.barrier();
        snapshot
    });

    for snapshot in seen {
        assert_eq!(snapshot, (2, 4));
    }
}

#[test]
fn put_reaches_the_peer_region_at_offset() {
    let fabric = pair(CompletionMode::Deferred);
    let regions = run_ranks(&fabric, |comm| {
        let (comm, _sdata) = registered(comm, 64);
        let peer = 1 - comm.rank();
        let payload = [comm.rank() as u8 + 7; 8];
        comm.put(peer, &payload, 16).unwrap();
        comm.flush().unwrap();
        comm.barrier();
        common::region_bytes(&comm)
    });

    // Rank 0's region holds rank 1's payload and vice versa.
    for (rank, region) in regions.iter().enumerate() {
        let expected = (1 - rank) as u8 + 7;
        assert!(region[..16].iter().all(|&b| b == 0));
        assert!(region[16..24].iter().all(|&b| b == expected));
        assert!(region[24..].iter().all(|&b| b == 0));
    }
}

#[test]
fn put_before_registration_is_rejected() {
    let fabric = pair(CompletionMode::Immediate);
    let results = run_ranks(&fabric, |comm| comm.put(1 - comm.rank(), &[1; 8], 0));
    for result in results {
        assert!(matches!(result, Err(Error::NotRegistered)));
    }
}

#[test]
fn failed_registration_leaves_registry_empty() {
    let fabric = pair(CompletionMode::Deferred);
    let results = run_ranks(&fabric, |mut comm| {
        let result = comm.reg_buffer(AlignedBuffer::new(0, 0).unwrap());
        (result, comm.registered().is_none())
    });

    for (result, empty) in results {
        assert!(matches!(result, Err(Error::Registration(_))));
        assert!(empty);
    }
    assert_eq!(fabric.counters().mem_handles(), 0);
    assert_eq!(fabric.counters().remote_keys(), 0);
}

#[test]
fn init_failure_after_first_endpoint_releases_it() {
    let fabric = pair(CompletionMode::Deferred);
    // Worker exchange is the first all-gather; cut rank 1's address short.
    let results = run_corrupted(&fabric, 0, |blob| blob.truncate(4), |comm| comm.err());

    for err in results {
        assert!(matches!(err, Some(Error::Init(_))));
    }
    assert_eq!(fabric.counters().endpoints(), 0);
    assert_eq!(fabric.counters().live(), 0);
}

#[test]
fn unpack_failure_after_first_key_releases_registration() {
    let fabric = pair(CompletionMode::Deferred);
    // Buffer exchange is the second all-gather. Its entries are an 8 byte
    // base followed by a 24 byte key; keep half of rank 1's key.
    let results = run_corrupted(
        &fabric,
        1,
        |blob| blob.truncate(8 + 12),
        |comm| {
            let mut comm = comm.unwrap();
            let result = comm.reg_buffer(AlignedBuffer::new(4096, 0).unwrap());
            let empty = comm.registered().is_none();
            comm.barrier();
            (result, empty)
        },
    );

    for (result, empty) in results {
        assert!(matches!(result, Err(Error::Registration(_))));
        assert!(empty);
    }
    assert_eq!(fabric.counters().mem_handles(), 0);
    assert_eq!(fabric.counters().remote_keys(), 0);
    assert_eq!(fabric.counters().live(), 0);
}

#[test]
fn second_registration_is_rejected() {
    let fabric = pair(CompletionMode::Deferred);
    let results = run_ranks(&fabric, |comm| {
        let (mut comm, _sdata) = registered(comm, 4096);
        let again = comm.reg_buffer(AlignedBuffer::new(4096, 0).unwrap());
        (again, comm.registered().map(|r| r.len()))
    });

    for (again, len) in results {
        assert!(matches!(again, Err(Error::Registration(_))));
        assert_eq!(len, Some(4096));
    }
}

#[test]
fn finalize_releases_every_resource() {
    let fabric = pair(CompletionMode::Deferred);
    run_ranks(&fabric, |comm| {
        let (comm, _sdata) = registered(comm, 4096);
        comm.finalize();
    });
    assert_eq!(fabric.counters().live(), 0);
}
