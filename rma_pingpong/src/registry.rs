//! Registration of the local region and remote key exchange.

use tracing::debug;

use crate::bootstrap::{Comm, Region};
use crate::buffer::AlignedBuffer;
use crate::error::{Error, Result, TransportError};
use crate::group::GroupComm;
use crate::transport::RmaTransport;

impl<T: RmaTransport, G: GroupComm> Comm<T, G> {
    /// Register `buffer` for remote writes and learn every peer's region.
    ///
    /// Collective: every peer must call it. On success the region is owned
    /// by `self` until teardown, and a remote key and base address are known
    /// for every peer, this process included. On failure nothing is kept:
    /// the registration is released and the buffer freed.
    pub fn reg_buffer(&mut self, buffer: AlignedBuffer) -> Result<()> {
        if self.region.is_some() {
            return Err(Error::Registration(TransportError::new(
                "reg_buffer",
                "a region is already registered",
            )));
        }

        // The buffer moves into `self.region` together with the handle, so
        // the memory outlives the registration.
        let handle = unsafe { self.transport.mem_map(buffer.as_ptr(), buffer.len()) }
            .map_err(Error::Registration)?;
        debug!(
            rank = self.rank(),
            base = buffer.addr(),
            len = buffer.len(),
            "region registered"
        );

        let packed = self.transport.pack_rkey(&handle).map_err(Error::Registration)?;
        let (peer_keys, remote_addrs) = self.group.buffer_exchange(&packed, buffer.addr())?;
        drop(packed);

        let mut rkeys = Vec::with_capacity(peer_keys.len());
        for (ep, packed) in self.endpoints.iter().zip(peer_keys) {
            rkeys.push(self.transport.unpack_rkey(ep, &packed).map_err(Error::Registration)?);
            // The peer's packed key is released here, right after unpacking.
        }
        if rkeys.len() != self.size() {
            return Err(Error::Exchange(format!(
                "expected {} remote keys, got {}",
                self.size(),
                rkeys.len()
            )));
        }

        self.rkeys = rkeys;
        self.remote_addrs = remote_addrs;
        self.region = Some(Region { handle, buffer });
        Ok(())
    }
}
