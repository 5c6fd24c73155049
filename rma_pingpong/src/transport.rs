//! The RMA transport seam.
//!
//! [`RmaTransport`] names the handful of one-sided operations the benchmark
//! consumes: endpoint creation from an opaque worker address, memory
//! registration and remote key packing, non-blocking PUT and worker flush,
//! request status and the progress pump. [`crate::ucx::UcxTransport`] backs it
//! with UCP; [`crate::loopback::LoopbackTransport`] backs it in-process.
//!
//! Every non-blocking call yields an [`OpStatus`]. Callers must pass it to
//! [`wait`], which is the only place that spins on a request, and which pumps
//! the progress engine while it does so.

use crate::error::TransportError;

/// Outcome of submitting a non-blocking operation.
#[derive(Debug)]
pub enum OpStatus<R> {
    /// Completed during submission; there is no request to track.
    Complete,
    /// Still in flight. The request is released when dropped.
    Pending(R),
    /// Rejected at submission.
    Failed(TransportError),
}

/// Status of an outstanding request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestState {
    InProgress,
    Complete,
    Failed(TransportError),
}

/// One-sided RMA operations used by the ping-pong protocol.
///
/// Handles returned by a transport must be dropped before the transport
/// itself; [`crate::bootstrap::Comm`] orders its fields so that holds.
pub trait RmaTransport {
    /// Connection to one peer worker.
    type Endpoint;
    /// Local registration of a memory region.
    type MemHandle;
    /// Unpacked credential for a peer's region.
    type RemoteKey;
    /// Outstanding non-blocking operation.
    type Request;

    /// Opaque address blob peers use to reach this worker.
    fn worker_address(&self) -> Result<Vec<u8>, TransportError>;

    /// Connect to the worker described by `address`.
    fn create_endpoint(&self, address: &[u8]) -> Result<Self::Endpoint, TransportError>;

    /// Register `len` bytes at `base` for remote access.
    ///
    /// # Safety
    ///
    /// `base..base + len` must stay allocated until the returned handle is
    /// dropped.
    unsafe fn mem_map(&self, base: *mut u8, len: usize) -> Result<Self::MemHandle, TransportError>;

    /// Serialize a registration into a blob peers can unpack.
    fn pack_rkey(&self, mem: &Self::MemHandle) -> Result<Vec<u8>, TransportError>;

    /// Turn a peer's packed key into a remote key usable through `ep`.
    fn unpack_rkey(
        &self,
        ep: &Self::Endpoint,
        packed: &[u8],
    ) -> Result<Self::RemoteKey, TransportError>;

    /// Start writing `src` to `remote_addr` in the region `rkey` describes.
    ///
    /// `src` must not be modified until the operation completes.
    fn put_nbx(
        &self,
        ep: &Self::Endpoint,
        src: &[u8],
        remote_addr: u64,
        rkey: &Self::RemoteKey,
    ) -> OpStatus<Self::Request>;

    /// Start a worker-wide flush of every previously issued operation.
    fn flush_nbx(&self) -> OpStatus<Self::Request>;

    fn request_state(&self, request: &Self::Request) -> RequestState;

    /// Advance in-flight operations. Returns the number of events processed.
    fn progress(&self) -> u32;
}

/// Drive `status` to completion, pumping `transport` while the request is in
/// flight, then release the request.
pub fn wait<T: RmaTransport>(
    transport: &T,
    status: OpStatus<T::Request>,
) -> Result<(), TransportError> {
    match status {
        OpStatus::Complete => Ok(()),
        OpStatus::Failed(e) => Err(e),
        OpStatus::Pending(request) => loop {
            match transport.request_state(&request) {
                RequestState::InProgress => {
                    transport.progress();
                }
                RequestState::Complete => return Ok(()),
                RequestState::Failed(e) => return Err(e),
            }
        },
    }
}
