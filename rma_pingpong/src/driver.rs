//! Top-level control flow: buffers, registration, the size sweep.

use std::io::Write;

use tracing::debug;

use crate::bootstrap::Comm;
use crate::buffer::AlignedBuffer;
use crate::config::{REQUIRED_PEERS, SweepConfig};
use crate::engine::{self, SENTINEL};
use crate::error::{Error, Result};
use crate::group::GroupComm;
use crate::report::{self, Measurement};
use crate::transport::RmaTransport;

/// Register a zeroed region, then sweep every payload size of `config`.
///
/// Rank 0 writes the header and one row per size to `out` as results arrive
/// and gets every measurement back; other ranks write nothing and get an
/// empty list.
pub fn run<T, G, W>(
    comm: &mut Comm<T, G>,
    config: &SweepConfig,
    out: &mut W,
) -> Result<Vec<Measurement>>
where
    T: RmaTransport,
    G: GroupComm,
    W: Write,
{
    if comm.size() != REQUIRED_PEERS {
        return Err(Error::PeerCount(comm.size()));
    }
    config.validate()?;

    let mybuff = AlignedBuffer::new(config.region_len, 0)?;
    let sdata = AlignedBuffer::new(config.region_len, SENTINEL)?;

    comm.barrier();
    comm.reg_buffer(mybuff)?;
    comm.barrier();

    let is_root = comm.rank() == 0;
    if is_root {
        report::write_header(out)?;
    }

    let mut measurements = Vec::new();
    // Bytes of the region the previous size may have written.
    let mut dirty = 0;
    for size in config.sizes() {
        if let Some(region) = comm.registered_mut() {
            region.fill_prefix(dirty, 0);
        }
        dirty = config.footprint(size);
        debug!(rank = comm.rank(), size, "starting size");

        if let Some(m) = engine::bench(comm, sdata.as_slice(), config.iters, config.warmup, size)? {
            report::write_row(out, &m)?;
            measurements.push(m);
        }
    }

    Ok(measurements)
}
