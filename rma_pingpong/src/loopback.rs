//! In-process fabric implementing both seams for a group of threads.
//!
//! Each rank is a thread holding its own [`LoopbackTransport`] and
//! [`LoopbackGroup`]. Because all ranks share one address space, a peer's
//! advertised base address is directly writable, so a PUT is a memcpy into
//! the peer's registered region.
//!
//! In [`CompletionMode::Deferred`] nothing moves until the issuing rank calls
//! [`RmaTransport::progress`], which reproduces the progress-engine
//! discipline of a real RMA stack. Live handles are tracked in
//! [`ResourceCounters`] so tests can check teardown.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering, fence};
use std::sync::{Arc, Barrier, Mutex};

use crate::error::{Error, Result, TransportError};
use crate::group::GroupComm;
use crate::transport::{OpStatus, RequestState, RmaTransport};

/// How submitted operations complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Puts and flushes finish during submission.
    Immediate,
    /// Puts and flushes return a request that completes under `progress`.
    Deferred,
}

/// Count of live transport handles across every rank of a fabric.
#[derive(Debug, Default)]
pub struct ResourceCounters {
    endpoints: AtomicUsize,
    mem_handles: AtomicUsize,
    remote_keys: AtomicUsize,
    requests: AtomicUsize,
}

impl ResourceCounters {
    pub fn endpoints(&self) -> usize {
        self.endpoints.load(Ordering::SeqCst)
    }

    pub fn mem_handles(&self) -> usize {
        self.mem_handles.load(Ordering::SeqCst)
    }

    pub fn remote_keys(&self) -> usize {
        self.remote_keys.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.endpoints() + self.mem_handles() + self.remote_keys() + self.requests()
    }
}

#[derive(Debug, Clone, Copy)]
enum Resource {
    Endpoint,
    MemHandle,
    RemoteKey,
    Request,
}

impl ResourceCounters {
    fn slot(&self, resource: Resource) -> &AtomicUsize {
        match resource {
            Resource::Endpoint => &self.endpoints,
            Resource::MemHandle => &self.mem_handles,
            Resource::RemoteKey => &self.remote_keys,
            Resource::Request => &self.requests,
        }
    }
}

/// Increments a counter on creation, decrements it on drop.
struct Tracked {
    fabric: Arc<LoopbackFabric>,
    resource: Resource,
}

impl Tracked {
    fn new(fabric: &Arc<LoopbackFabric>, resource: Resource) -> Self {
        fabric.counters.slot(resource).fetch_add(1, Ordering::SeqCst);
        Self {
            fabric: fabric.clone(),
            resource,
        }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.fabric.counters.slot(self.resource).fetch_sub(1, Ordering::SeqCst);
    }
}

/// Injected put failure: the put of `size` bytes issued by `rank` after
/// `skip` successful ones fails.
#[derive(Debug, Clone, Copy)]
struct PutFault {
    rank: usize,
    size: usize,
    skip: usize,
}

/// Shared state of a loopback group.
pub struct LoopbackFabric {
    ranks: usize,
    mode: CompletionMode,
    barrier: Barrier,
    gather: Mutex<Vec<Vec<u8>>>,
    counters: ResourceCounters,
    fault: Mutex<Option<PutFault>>,
    // Set once a rank hits an injected fault; peers then see failed flushes.
    poisoned: AtomicBool,
}

impl LoopbackFabric {
    pub fn new(ranks: usize, mode: CompletionMode) -> Arc<Self> {
        Arc::new(Self {
            ranks,
            mode,
            barrier: Barrier::new(ranks),
            gather: Mutex::new(vec![Vec::new(); ranks]),
            counters: ResourceCounters::default(),
            fault: Mutex::new(None),
            poisoned: AtomicBool::new(false),
        })
    }

    pub fn ranks(&self) -> usize {
        self.ranks
    }

    pub fn counters(&self) -> &ResourceCounters {
        &self.counters
    }

    /// Fail the put of `size` bytes that `rank` issues after `skip` successful
    /// ones. Once it fires, every rank's flushes fail too, as they would after
    /// a peer process aborts.
    pub fn fail_put(&self, rank: usize, size: usize, skip: usize) {
        *self.fault.lock().unwrap_or_else(|e| e.into_inner()) = Some(PutFault { rank, size, skip });
    }

    pub fn transport(self: &Arc<Self>, rank: usize) -> LoopbackTransport {
        assert!(rank < self.ranks, "rank {} out of range", rank);
        LoopbackTransport {
            rank,
            fabric: self.clone(),
            queue: RefCell::new(VecDeque::new()),
        }
    }

    pub fn group(self: &Arc<Self>, rank: usize) -> LoopbackGroup {
        assert!(rank < self.ranks, "rank {} out of range", rank);
        LoopbackGroup {
            rank,
            fabric: self.clone(),
        }
    }

    /// Consume one matching put from the fault budget; true if this put fails.
    fn take_fault(&self, rank: usize, size: usize) -> bool {
        let mut fault = self.fault.lock().unwrap_or_else(|e| e.into_inner());
        match fault.as_mut() {
            Some(f) if f.rank == rank && f.size == size => {
                if f.skip == 0 {
                    *fault = None;
                    self.poisoned.store(true, Ordering::SeqCst);
                    true
                } else {
                    f.skip -= 1;
                    false
                }
            }
            _ => false,
        }
    }
}

/// Group-communication view of one rank.
pub struct LoopbackGroup {
    rank: usize,
    fabric: Arc<LoopbackFabric>,
}

impl GroupComm for LoopbackGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.fabric.ranks
    }

    fn all_gather(&self, local: &[u8]) -> Result<Vec<Vec<u8>>> {
        let lock_err = |_| Error::Exchange("loopback gather table poisoned".into());
        self.fabric.gather.lock().map_err(lock_err)?[self.rank] = local.to_vec();
        self.fabric.barrier.wait();
        let gathered = self.fabric.gather.lock().map_err(lock_err)?.clone();
        // Nobody may publish the next round until everyone has read this one.
        self.fabric.barrier.wait();
        Ok(gathered)
    }

    fn barrier(&self) {
        self.fabric.barrier.wait();
    }
}

const ADDRESS_PREFIX: &[u8] = b"loopback:";

pub struct LoopbackEndpoint {
    peer: usize,
    _tracked: Tracked,
}

pub struct LoopbackMemHandle {
    base: u64,
    len: u64,
    _tracked: Tracked,
}

pub struct LoopbackRemoteKey {
    owner: usize,
    base: u64,
    len: u64,
    _tracked: Tracked,
}

pub struct LoopbackRequest {
    done: Rc<Cell<bool>>,
    _tracked: Tracked,
}

enum Deferred {
    Put {
        dst: u64,
        data: Vec<u8>,
        done: Rc<Cell<bool>>,
    },
    Fence {
        done: Rc<Cell<bool>>,
    },
}

/// RMA transport view of one rank. Single-threaded, like the worker it
/// stands in for.
pub struct LoopbackTransport {
    rank: usize,
    fabric: Arc<LoopbackFabric>,
    queue: RefCell<VecDeque<Deferred>>,
}

impl LoopbackTransport {
    fn request(&self, done: Rc<Cell<bool>>) -> LoopbackRequest {
        LoopbackRequest {
            done,
            _tracked: Tracked::new(&self.fabric, Resource::Request),
        }
    }

    fn peer_failure(&self, op: &'static str) -> Option<TransportError> {
        self.fabric
            .poisoned
            .load(Ordering::SeqCst)
            .then(|| TransportError::new(op, "endpoint closed by peer"))
    }
}

/// Copy `data` to the absolute address `dst` and publish it.
///
/// # Safety
///
/// `dst..dst + data.len()` must lie inside a live registered region.
unsafe fn write_remote(dst: u64, data: &[u8]) {
    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst as *mut u8, data.len()) };
    fence(Ordering::Release);
}

impl RmaTransport for LoopbackTransport {
    type Endpoint = LoopbackEndpoint;
    type MemHandle = LoopbackMemHandle;
    type RemoteKey = LoopbackRemoteKey;
    type Request = LoopbackRequest;

    fn worker_address(&self) -> std::result::Result<Vec<u8>, TransportError> {
        let mut address = ADDRESS_PREFIX.to_vec();
        address.extend_from_slice(&(self.rank as u64).to_le_bytes());
        Ok(address)
    }

    fn create_endpoint(
        &self,
        address: &[u8],
    ) -> std::result::Result<LoopbackEndpoint, TransportError> {
        let peer = address
            .strip_prefix(ADDRESS_PREFIX)
            .and_then(|rank| <[u8; 8]>::try_from(rank).ok())
            .map(|rank| u64::from_le_bytes(rank) as usize)
            .filter(|&rank| rank < self.fabric.ranks)
            .ok_or_else(|| TransportError::new("create_endpoint", "malformed worker address"))?;
        Ok(LoopbackEndpoint {
            peer,
            _tracked: Tracked::new(&self.fabric, Resource::Endpoint),
        })
    }

    unsafe fn mem_map(
        &self,
        base: *mut u8,
        len: usize,
    ) -> std::result::Result<LoopbackMemHandle, TransportError> {
        if base.is_null() || len == 0 {
            return Err(TransportError::new("mem_map", "empty region"));
        }
        Ok(LoopbackMemHandle {
            base: base as u64,
            len: len as u64,
            _tracked: Tracked::new(&self.fabric, Resource::MemHandle),
        })
    }

    fn pack_rkey(&self, mem: &LoopbackMemHandle) -> std::result::Result<Vec<u8>, TransportError> {
        let mut packed = Vec::with_capacity(24);
        packed.extend_from_slice(&(self.rank as u64).to_le_bytes());
        packed.extend_from_slice(&mem.base.to_le_bytes());
        packed.extend_from_slice(&mem.len.to_le_bytes());
        Ok(packed)
    }

    fn unpack_rkey(
        &self,
        ep: &LoopbackEndpoint,
        packed: &[u8],
    ) -> std::result::Result<LoopbackRemoteKey, TransportError> {
        let field = |i: usize| -> Option<u64> {
            Some(u64::from_le_bytes(packed.get(i * 8..(i + 1) * 8)?.try_into().ok()?))
        };
        let (Some(owner), Some(base), Some(len)) = (field(0), field(1), field(2)) else {
            return Err(TransportError::new("unpack_rkey", "truncated key"));
        };
        if packed.len() != 24 || owner as usize != ep.peer {
            return Err(TransportError::new("unpack_rkey", "key does not belong to endpoint peer"));
        }
        Ok(LoopbackRemoteKey {
            owner: owner as usize,
            base,
            len,
            _tracked: Tracked::new(&self.fabric, Resource::RemoteKey),
        })
    }

    fn put_nbx(
        &self,
        ep: &LoopbackEndpoint,
        src: &[u8],
        remote_addr: u64,
        rkey: &LoopbackRemoteKey,
    ) -> OpStatus<LoopbackRequest> {
        if ep.peer != rkey.owner {
            return OpStatus::Failed(TransportError::new("put", "remote key of another peer"));
        }
        let end = remote_addr.checked_add(src.len() as u64);
        if remote_addr < rkey.base || end.is_none_or(|end| end > rkey.base + rkey.len) {
            return OpStatus::Failed(TransportError::new("put", "outside registered region"));
        }
        if self.fabric.take_fault(self.rank, src.len()) {
            return OpStatus::Failed(TransportError::new("put", "injected failure"));
        }

        match self.fabric.mode {
            CompletionMode::Immediate => {
                unsafe { write_remote(remote_addr, src) };
                OpStatus::Complete
            }
            CompletionMode::Deferred => {
                let done = Rc::new(Cell::new(false));
                self.queue.borrow_mut().push_back(Deferred::Put {
                    dst: remote_addr,
                    data: src.to_vec(),
                    done: done.clone(),
                });
                OpStatus::Pending(self.request(done))
            }
        }
    }

    fn flush_nbx(&self) -> OpStatus<LoopbackRequest> {
        if let Some(e) = self.peer_failure("flush") {
            return OpStatus::Failed(e);
        }
        match self.fabric.mode {
            CompletionMode::Immediate => {
                while self.progress() > 0 {}
                OpStatus::Complete
            }
            CompletionMode::Deferred => {
                let done = Rc::new(Cell::new(false));
                self.queue.borrow_mut().push_back(Deferred::Fence { done: done.clone() });
                OpStatus::Pending(self.request(done))
            }
        }
    }

    fn request_state(&self, request: &LoopbackRequest) -> RequestState {
        if request.done.get() {
            RequestState::Complete
        } else if let Some(e) = self.peer_failure("request") {
            RequestState::Failed(e)
        } else {
            RequestState::InProgress
        }
    }

    fn progress(&self) -> u32 {
        let Some(op) = self.queue.borrow_mut().pop_front() else {
            return 0;
        };
        match op {
            Deferred::Put { dst, data, done } => {
                // Bounds were checked against the remote key at submission.
                unsafe { write_remote(dst, &data) };
                done.set(true);
            }
            Deferred::Fence { done } => done.set(true),
        }
        1
    }
}
