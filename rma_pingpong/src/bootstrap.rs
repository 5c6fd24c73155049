//! Communication bring-up and teardown.
//!
//! [`Comm`] owns every piece of process-wide RMA state: the transport
//! (context and worker), one endpoint per peer, the registered region and the
//! remote keys and addresses learned for it, and the group layer. Its field
//! order is its teardown order.

use tracing::{debug, error};

use crate::buffer::AlignedBuffer;
use crate::error::{Error, Result};
use crate::group::{GroupComm, MpiGroup};
use crate::transport::{self, RmaTransport};
use crate::ucx::UcxTransport;

/// The local registered region: registration first, so it is dropped before
/// the memory it covers.
pub(crate) struct Region<T: RmaTransport> {
    pub(crate) handle: T::MemHandle,
    pub(crate) buffer: AlignedBuffer,
}

/// Process-wide RMA state for one run.
pub struct Comm<T: RmaTransport, G: GroupComm> {
    pub(crate) rkeys: Vec<T::RemoteKey>,
    pub(crate) remote_addrs: Vec<u64>,
    pub(crate) endpoints: Vec<T::Endpoint>,
    pub(crate) region: Option<Region<T>>,
    pub(crate) transport: T,
    pub(crate) group: G,
    rank: usize,
    size: usize,
}

/// Bring up UCX and MPI and connect to every peer.
pub fn comm_init() -> Result<Comm<UcxTransport, MpiGroup>> {
    let transport = UcxTransport::new().map_err(Error::Init)?;
    let group = MpiGroup::init()?;
    Comm::init(transport, group)
}

impl<T: RmaTransport, G: GroupComm> Comm<T, G> {
    /// Exchange worker addresses and create an endpoint to every peer,
    /// including this process.
    ///
    /// On failure everything acquired so far is released before returning.
    pub fn init(transport: T, group: G) -> Result<Self> {
        let rank = group.rank();
        let size = group.size();

        let address = transport.worker_address().map_err(Error::Init)?;
        debug!(rank, size, address_len = address.len(), "exchanging worker addresses");
        let addresses = group.worker_exchange(&address)?;

        let mut endpoints = Vec::with_capacity(size);
        for (peer, address) in addresses.iter().enumerate() {
            let ep = transport.create_endpoint(address).map_err(|e| {
                error!(rank, peer, error = %e, "endpoint creation failed");
                Error::Init(e)
            })?;
            endpoints.push(ep);
        }

        Ok(Self {
            rkeys: Vec::new(),
            remote_addrs: Vec::new(),
            endpoints,
            region: None,
            transport,
            group,
            rank,
            size,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of peers, this process included.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn barrier(&self) {
        self.group.barrier();
    }

    /// The registered region, if `reg_buffer` has succeeded.
    pub fn registered(&self) -> Option<&AlignedBuffer> {
        self.region.as_ref().map(|r| &r.buffer)
    }

    /// Mutable access to the registered region.
    ///
    /// Only call between barriers, when no peer is writing into it.
    pub fn registered_mut(&mut self) -> Option<&mut AlignedBuffer> {
        self.region.as_mut().map(|r| &mut r.buffer)
    }

    /// Write `src` into `peer`'s region at `offset` and wait for local
    /// completion of the put.
    pub fn put(&self, peer: usize, src: &[u8], offset: usize) -> Result<()> {
        let (Some(rkey), Some(&base)) = (self.rkeys.get(peer), self.remote_addrs.get(peer)) else {
            return Err(Error::NotRegistered);
        };
        let status = self
            .transport
            .put_nbx(&self.endpoints[peer], src, base + offset as u64, rkey);
        transport::wait(&self.transport, status).map_err(Error::Operation)
    }

    /// Flush every outstanding operation of the worker to completion.
    pub fn flush(&self) -> Result<()> {
        transport::wait(&self.transport, self.transport.flush_nbx()).map_err(Error::Operation)
    }

    /// Flush all outstanding writes, then release keys, endpoints, the
    /// region, the worker and context, and finally the group layer.
    ///
    /// A failed flush is fatal: the process aborts.
    pub fn finalize(self) {
        self.barrier();
        if let Err(e) = self.flush() {
            error!(rank = self.rank, error = %e, "final flush failed");
            std::process::abort();
        }
        debug!(rank = self.rank, "communication torn down");
        drop(self);
    }
}
