//! One-sided PUT ping-pong for a single payload size.
//!
//! Rank 0 writes an all-ones slot into rank 1's region and spins on its own
//! region until rank 1 writes the same slot back. Neither side posts a
//! receive: arrival is detected by polling the slot for the sentinel byte,
//! and every spin flushes the worker so the progress engine keeps moving.
//!
//! Iteration `i` uses bytes `[i * size, (i + 1) * size)` on both sides, so a
//! slot is written at most once per call and a stale sentinel can never be
//! mistaken for a fresh one.

use std::sync::atomic::{Ordering, fence};
use std::time::Instant;

use tracing::debug;

use crate::bootstrap::Comm;
use crate::config::REQUIRED_PEERS;
use crate::error::{Error, Result};
use crate::group::GroupComm;
use crate::report::Measurement;
use crate::transport::RmaTransport;

/// Byte value of a delivered payload. The receive region starts zeroed.
pub const SENTINEL: u8 = 1;

/// True if every byte of `slot[..len]` equals `byte`.
///
/// Reads are volatile: the bytes are written by the NIC, not by this thread.
///
/// # Safety
///
/// `slot..slot + len` must be valid for reads.
unsafe fn slot_matches(slot: *const u8, len: usize, byte: u8) -> bool {
    let mut off = 0;
    if slot as usize % align_of::<u64>() == 0 {
        let word = u64::from_ne_bytes([byte; 8]);
        while off + 8 <= len {
            if unsafe { std::ptr::read_volatile(slot.add(off) as *const u64) } != word {
                return false;
            }
            off += 8;
        }
    }
    while off < len {
        if unsafe { std::ptr::read_volatile(slot.add(off)) } != byte {
            return false;
        }
        off += 1;
    }
    true
}

/// Spin until slot `index` of the local region holds the sentinel, flushing
/// the worker on every spin.
fn await_slot<T: RmaTransport, G: GroupComm>(
    comm: &Comm<T, G>,
    base: *const u8,
    index: usize,
    size: usize,
) -> Result<()> {
    let slot = unsafe { base.add(index * size) };
    while !unsafe { slot_matches(slot, size, SENTINEL) } {
        comm.flush()?;
    }
    fence(Ordering::Acquire);
    Ok(())
}

/// Run warmup and the timed ping-pong for one payload `size`.
///
/// `sdata` is the send scratch, filled with [`SENTINEL`], at least
/// `iter * size` bytes. The registered region must hold at least
/// `max(iter, warmup) * size` bytes and be zero over `[0, size)`; the caller
/// rezeroes it between calls.
///
/// Collective over both peers. Returns the measurement on rank 0 and `None`
/// on rank 1.
pub fn bench<T: RmaTransport, G: GroupComm>(
    comm: &Comm<T, G>,
    sdata: &[u8],
    iter: usize,
    warmup: usize,
    size: usize,
) -> Result<Option<Measurement>> {
    if comm.size() != REQUIRED_PEERS {
        return Err(Error::PeerCount(comm.size()));
    }
    if iter == 0 || size == 0 {
        return Err(Error::Config(format!(
            "iter ({}) and size ({}) must be positive",
            iter, size
        )));
    }
    let mybuff = comm.registered().ok_or(Error::NotRegistered)?;
    let footprint = iter.max(warmup) * size;
    if mybuff.len() < footprint || sdata.len() < iter * size {
        return Err(Error::Config(format!(
            "size {} needs {} bytes of region and {} of send data, have {} and {}",
            size,
            footprint,
            iter * size,
            mybuff.len(),
            sdata.len()
        )));
    }
    let base = mybuff.as_ptr() as *const u8;
    if !unsafe { slot_matches(base, size, 0) } {
        return Err(Error::NotZeroed { size });
    }

    let rank = comm.rank();
    let peer = 1 - rank;
    debug!(rank, size, iter, warmup, "bench");

    // Zeros into zeros: warms the path without disturbing the handshake.
    let zeros = vec![0u8; size];
    for i in 0..warmup {
        comm.put(peer, &zeros, i * size)?;
        comm.flush()?;
    }

    comm.barrier();

    let slot = |i: usize| &sdata[i * size..(i + 1) * size];
    let measurement = if rank == 0 {
        let start = Instant::now();
        for i in 0..iter {
            comm.put(peer, slot(i), i * size)?;
            comm.flush()?;
            await_slot(comm, base, i, size)?;
        }
        let elapsed = start.elapsed();
        Some(Measurement {
            size,
            iters: iter,
            warmup,
            elapsed,
        })
    } else {
        for i in 0..iter {
            await_slot(comm, base, i, size)?;
            comm.put(peer, slot(i), i * size)?;
            comm.flush()?;
        }
        None
    };

    comm.barrier();
    Ok(measurement)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_matches_checks_every_byte() {
        let mut buf = [SENTINEL; 37];
        assert!(unsafe { slot_matches(buf.as_ptr(), buf.len(), SENTINEL) });

        buf[36] = 0;
        assert!(!unsafe { slot_matches(buf.as_ptr(), buf.len(), SENTINEL) });
        assert!(unsafe { slot_matches(buf.as_ptr(), 36, SENTINEL) });

        buf[3] = 0;
        assert!(!unsafe { slot_matches(buf.as_ptr(), 8, SENTINEL) });
    }

    #[test]
    fn slot_matches_handles_unaligned_start() {
        let buf = [0u8; 24];
        assert!(unsafe { slot_matches(buf.as_ptr().add(3), 17, 0) });
    }
}
