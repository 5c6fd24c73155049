//! Group-communication seam: rank identity, all-gather and barriers.
//!
//! Only bootstrap and phase fences go through here; measured traffic never
//! does. [`MpiGroup`] is the production implementation.

use mpi::collective::CommunicatorCollectives;
use mpi::environment::Universe;
use mpi::topology::{Communicator, SimpleCommunicator};

use crate::error::{Error, Result, TransportError};

/// Collective operations the bootstrap needs from the launcher's runtime.
pub trait GroupComm {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Gather one variable-length blob from every rank, indexed by rank.
    fn all_gather(&self, local: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Return once every rank has entered.
    fn barrier(&self);

    /// All-gather of opaque worker addresses.
    fn worker_exchange(&self, address: &[u8]) -> Result<Vec<Vec<u8>>> {
        let addresses = self.all_gather(address)?;
        if addresses.len() != self.size() {
            return Err(Error::Exchange(format!(
                "expected {} worker addresses, got {}",
                self.size(),
                addresses.len()
            )));
        }
        Ok(addresses)
    }

    /// All-gather of packed remote keys and region base addresses.
    ///
    /// Returns `(packed_keys, remote_bases)`, both indexed by rank.
    fn buffer_exchange(&self, packed_key: &[u8], base: u64) -> Result<(Vec<Vec<u8>>, Vec<u64>)> {
        let gathered = self.all_gather(&encode_buffer_entry(packed_key, base))?;
        if gathered.len() != self.size() {
            return Err(Error::Exchange(format!(
                "expected {} buffer entries, got {}",
                self.size(),
                gathered.len()
            )));
        }

        let mut keys = Vec::with_capacity(gathered.len());
        let mut bases = Vec::with_capacity(gathered.len());
        for (rank, entry) in gathered.into_iter().enumerate() {
            let (key, base) = decode_buffer_entry(entry).ok_or_else(|| {
                Error::Exchange(format!("truncated buffer entry from rank {}", rank))
            })?;
            keys.push(key);
            bases.push(base);
        }
        Ok((keys, bases))
    }
}

/// Base address (little endian) followed by the packed key.
fn encode_buffer_entry(packed_key: &[u8], base: u64) -> Vec<u8> {
    let mut entry = Vec::with_capacity(8 + packed_key.len());
    entry.extend_from_slice(&base.to_le_bytes());
    entry.extend_from_slice(packed_key);
    entry
}

fn decode_buffer_entry(mut entry: Vec<u8>) -> Option<(Vec<u8>, u64)> {
    let base = u64::from_le_bytes(entry.get(..8)?.try_into().ok()?);
    entry.drain(..8);
    Some((entry, base))
}

/// Split an all-gathered buffer of `stride`-byte records back into blobs.
fn split_padded(gathered: &[u8], lens: &[u64], stride: usize) -> Vec<Vec<u8>> {
    lens.iter()
        .enumerate()
        .map(|(rank, &len)| {
            let start = rank * stride;
            gathered[start..start + len as usize].to_vec()
        })
        .collect()
}

/// `MPI_COMM_WORLD` of a single-threaded MPI environment.
///
/// Dropping the group finalizes MPI.
pub struct MpiGroup {
    world: SimpleCommunicator,
    // Dropped last: finalizes MPI.
    _universe: Universe,
}

impl MpiGroup {
    pub fn init() -> Result<Self> {
        let universe = mpi::initialize().ok_or_else(|| {
            Error::Init(TransportError::new("MPI_Init", "MPI is already initialized"))
        })?;
        let world = universe.world();
        Ok(Self {
            world,
            _universe: universe,
        })
    }
}

impl GroupComm for MpiGroup {
    fn rank(&self) -> usize {
        self.world.rank() as usize
    }

    fn size(&self) -> usize {
        self.world.size() as usize
    }

    fn all_gather(&self, local: &[u8]) -> Result<Vec<Vec<u8>>> {
        let size = self.size();

        // Lengths first, then every blob padded to the longest one.
        let local_len = local.len() as u64;
        let mut lens = vec![0u64; size];
        self.world.all_gather_into(&local_len, &mut lens[..]);

        let stride = lens.iter().copied().max().unwrap_or(0) as usize;
        if stride == 0 {
            return Ok(vec![Vec::new(); size]);
        }
        let mut padded = vec![0u8; stride];
        padded[..local.len()].copy_from_slice(local);
        let mut gathered = vec![0u8; stride * size];
        self.world.all_gather_into(&padded[..], &mut gathered[..]);

        Ok(split_padded(&gathered, &lens, stride))
    }

    fn barrier(&self) {
        self.world.barrier();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_padded_trims_each_record() {
        let gathered = [1, 2, 0, 0, 3, 4, 5, 6, 7, 0, 0, 0];
        let blobs = split_padded(&gathered, &[2, 4, 1], 4);
        assert_eq!(blobs, vec![vec![1, 2], vec![3, 4, 5, 6], vec![7]]);
    }

    #[test]
    fn buffer_entry_carries_base_and_key() {
        let entry = encode_buffer_entry(&[9, 8, 7], 0xdead_beef_0000_1000);
        let (key, base) = decode_buffer_entry(entry).unwrap();
        assert_eq!(key, vec![9, 8, 7]);
        assert_eq!(base, 0xdead_beef_0000_1000);
    }

    #[test]
    fn truncated_buffer_entry_is_rejected() {
        assert!(decode_buffer_entry(vec![1, 2, 3]).is_none());
    }
}
