//! UCP implementation of [`RmaTransport`].
//!
//! Each wrapper owns one UCX handle and releases it on drop. The transport
//! keeps the worker and context; endpoints, memory handles and remote keys
//! hold raw copies of the handles they need and must be dropped first.

use std::ffi::{CStr, c_void};
use std::mem::MaybeUninit;
use std::ptr;

use ucx_sys::{
    ucp_address_t, ucp_context_h, ucp_ep_h, ucp_ep_params_t, ucp_mem_h, ucp_mem_map_params_t,
    ucp_params_t, ucp_request_param_t, ucp_rkey_h, ucp_worker_h, ucp_worker_params_t,
    ucs_status_ptr_t, ucs_status_t,
};

use crate::error::TransportError;
use crate::transport::{OpStatus, RequestState, RmaTransport};

const UCS_OK: ucs_status_t = ucx_sys::ucs_status_t_UCS_OK;
const UCS_INPROGRESS: ucs_status_t = ucx_sys::ucs_status_t_UCS_INPROGRESS;

/// Remote write plus 32- and 64-bit atomics.
const RMA_FEATURES: u64 = (ucx_sys::ucp_feature_UCP_FEATURE_RMA
    | ucx_sys::ucp_feature_UCP_FEATURE_AMO32
    | ucx_sys::ucp_feature_UCP_FEATURE_AMO64) as u64;

fn status_string(status: ucs_status_t) -> String {
    let msg = unsafe { ucx_sys::ucs_status_string(status) };
    if msg.is_null() {
        format!("UCX status {}", status)
    } else {
        unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
    }
}

fn check(op: &'static str, status: ucs_status_t) -> Result<(), TransportError> {
    if status == UCS_OK {
        Ok(())
    } else {
        Err(TransportError::new(op, status_string(status)))
    }
}

/// Classify the tri-state pointer returned by `*_nbx` calls.
fn classify(op: &'static str, status_ptr: ucs_status_ptr_t) -> OpStatus<UcpRequest> {
    if status_ptr.is_null() {
        OpStatus::Complete
    } else if ucx_sys::ucs_ptr_is_err(status_ptr) {
        OpStatus::Failed(TransportError::new(
            op,
            status_string(ucx_sys::ucs_ptr_status(status_ptr)),
        ))
    } else {
        OpStatus::Pending(UcpRequest { handle: status_ptr })
    }
}

/// UCP context configured for RMA and atomics.
pub struct UcpContext {
    handle: ucp_context_h,
}

impl UcpContext {
    pub fn new() -> Result<Self, TransportError> {
        let mut config: *mut ucx_sys::ucp_config_t = ptr::null_mut();
        check("ucp_config_read", unsafe {
            ucx_sys::ucp_config_read(ptr::null(), ptr::null(), &mut config)
        })?;

        let params = ucp_params_t {
            field_mask: ucx_sys::ucp_params_field_UCP_PARAM_FIELD_FEATURES as u64,
            features: RMA_FEATURES,
            ..unsafe { std::mem::zeroed() }
        };

        let mut context: MaybeUninit<ucp_context_h> = MaybeUninit::uninit();
        let status = unsafe {
            ucx_sys::ucp_init_version(
                ucx_sys::UCP_API_MAJOR,
                ucx_sys::UCP_API_MINOR,
                &params,
                config,
                context.as_mut_ptr(),
            )
        };
        unsafe { ucx_sys::ucp_config_release(config) };
        check("ucp_init", status)?;

        Ok(Self {
            handle: unsafe { context.assume_init() },
        })
    }

    pub fn handle(&self) -> ucp_context_h {
        self.handle
    }
}

impl Drop for UcpContext {
    fn drop(&mut self) {
        unsafe { ucx_sys::ucp_cleanup(self.handle) };
    }
}

/// Single-threaded UCP worker.
pub struct UcpWorker {
    handle: ucp_worker_h,
}

impl UcpWorker {
    pub fn new(ctx: &UcpContext) -> Result<Self, TransportError> {
        let params = ucp_worker_params_t {
            field_mask: ucx_sys::ucp_worker_params_field_UCP_WORKER_PARAM_FIELD_THREAD_MODE
                as u64,
            thread_mode: ucx_sys::ucs_thread_mode_t_UCS_THREAD_MODE_SINGLE,
            ..unsafe { std::mem::zeroed() }
        };

        let mut worker: MaybeUninit<ucp_worker_h> = MaybeUninit::uninit();
        check("ucp_worker_create", unsafe {
            ucx_sys::ucp_worker_create(ctx.handle(), &params, worker.as_mut_ptr())
        })?;

        Ok(Self {
            handle: unsafe { worker.assume_init() },
        })
    }

    /// Copy of the worker address, for exchange with peers.
    pub fn address(&self) -> Result<Vec<u8>, TransportError> {
        let mut addr: *mut ucp_address_t = ptr::null_mut();
        let mut len: usize = 0;
        check("ucp_worker_get_address", unsafe {
            ucx_sys::ucp_worker_get_address(self.handle, &mut addr, &mut len)
        })?;

        let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, len) }.to_vec();
        unsafe { ucx_sys::ucp_worker_release_address(self.handle, addr) };
        Ok(bytes)
    }

    pub fn progress(&self) -> u32 {
        unsafe { ucx_sys::ucp_worker_progress(self.handle) }
    }

    pub fn handle(&self) -> ucp_worker_h {
        self.handle
    }
}

impl Drop for UcpWorker {
    fn drop(&mut self) {
        unsafe { ucx_sys::ucp_worker_destroy(self.handle) };
    }
}

pub struct UcpEndpoint {
    handle: ucp_ep_h,
}

impl Drop for UcpEndpoint {
    fn drop(&mut self) {
        unsafe { ucx_sys::ucp_ep_destroy(self.handle) };
    }
}

/// Registered memory; unmapped on drop.
pub struct UcpMemHandle {
    context: ucp_context_h,
    handle: ucp_mem_h,
}

impl Drop for UcpMemHandle {
    fn drop(&mut self) {
        let status = unsafe { ucx_sys::ucp_mem_unmap(self.context, self.handle) };
        if status != UCS_OK {
            tracing::warn!(status = %status_string(status), "ucp_mem_unmap failed");
        }
    }
}

pub struct UcpRemoteKey {
    handle: ucp_rkey_h,
}

impl Drop for UcpRemoteKey {
    fn drop(&mut self) {
        unsafe { ucx_sys::ucp_rkey_destroy(self.handle) };
    }
}

/// Outstanding UCP request; freed on drop.
pub struct UcpRequest {
    handle: *mut c_void,
}

impl Drop for UcpRequest {
    fn drop(&mut self) {
        unsafe { ucx_sys::ucp_request_free(self.handle) };
    }
}

/// UCP context plus its single progress worker.
pub struct UcxTransport {
    // Field order is drop order: worker before context.
    worker: UcpWorker,
    context: UcpContext,
}

impl UcxTransport {
    pub fn new() -> Result<Self, TransportError> {
        let context = UcpContext::new()?;
        let worker = UcpWorker::new(&context)?;
        Ok(Self { worker, context })
    }
}

impl RmaTransport for UcxTransport {
    type Endpoint = UcpEndpoint;
    type MemHandle = UcpMemHandle;
    type RemoteKey = UcpRemoteKey;
    type Request = UcpRequest;

    fn worker_address(&self) -> Result<Vec<u8>, TransportError> {
        self.worker.address()
    }

    fn create_endpoint(&self, address: &[u8]) -> Result<UcpEndpoint, TransportError> {
        let params = ucp_ep_params_t {
            field_mask: ucx_sys::ucp_ep_params_field_UCP_EP_PARAM_FIELD_REMOTE_ADDRESS as u64,
            address: address.as_ptr() as *const ucp_address_t,
            ..unsafe { std::mem::zeroed() }
        };

        let mut ep: MaybeUninit<ucp_ep_h> = MaybeUninit::uninit();
        check("ucp_ep_create", unsafe {
            ucx_sys::ucp_ep_create(self.worker.handle(), &params, ep.as_mut_ptr())
        })?;
        Ok(UcpEndpoint {
            handle: unsafe { ep.assume_init() },
        })
    }

    unsafe fn mem_map(&self, base: *mut u8, len: usize) -> Result<UcpMemHandle, TransportError> {
        let params = ucp_mem_map_params_t {
            field_mask: (ucx_sys::ucp_mem_map_params_field_UCP_MEM_MAP_PARAM_FIELD_ADDRESS
                | ucx_sys::ucp_mem_map_params_field_UCP_MEM_MAP_PARAM_FIELD_LENGTH)
                as u64,
            address: base as *mut c_void,
            length: len,
            ..unsafe { std::mem::zeroed() }
        };

        let mut memh: MaybeUninit<ucp_mem_h> = MaybeUninit::uninit();
        check("ucp_mem_map", unsafe {
            ucx_sys::ucp_mem_map(self.context.handle(), &params, memh.as_mut_ptr())
        })?;
        Ok(UcpMemHandle {
            context: self.context.handle(),
            handle: unsafe { memh.assume_init() },
        })
    }

    fn pack_rkey(&self, mem: &UcpMemHandle) -> Result<Vec<u8>, TransportError> {
        let mut packed: *mut c_void = ptr::null_mut();
        let mut len: usize = 0;
        check("ucp_rkey_pack", unsafe {
            ucx_sys::ucp_rkey_pack(self.context.handle(), mem.handle, &mut packed, &mut len)
        })?;

        let bytes = unsafe { std::slice::from_raw_parts(packed as *const u8, len) }.to_vec();
        unsafe { ucx_sys::ucp_rkey_buffer_release(packed) };
        Ok(bytes)
    }

    fn unpack_rkey(&self, ep: &UcpEndpoint, packed: &[u8]) -> Result<UcpRemoteKey, TransportError> {
        let mut rkey: MaybeUninit<ucp_rkey_h> = MaybeUninit::uninit();
        check("ucp_ep_rkey_unpack", unsafe {
            ucx_sys::ucp_ep_rkey_unpack(
                ep.handle,
                packed.as_ptr() as *const c_void,
                rkey.as_mut_ptr(),
            )
        })?;
        Ok(UcpRemoteKey {
            handle: unsafe { rkey.assume_init() },
        })
    }

    fn put_nbx(
        &self,
        ep: &UcpEndpoint,
        src: &[u8],
        remote_addr: u64,
        rkey: &UcpRemoteKey,
    ) -> OpStatus<UcpRequest> {
        let param: ucp_request_param_t = unsafe { std::mem::zeroed() };
        let status_ptr = unsafe {
            ucx_sys::ucp_put_nbx(
                ep.handle,
                src.as_ptr() as *const c_void,
                src.len(),
                remote_addr,
                rkey.handle,
                &param,
            )
        };
        classify("ucp_put_nbx", status_ptr)
    }

    fn flush_nbx(&self) -> OpStatus<UcpRequest> {
        let param: ucp_request_param_t = unsafe { std::mem::zeroed() };
        let status_ptr = unsafe { ucx_sys::ucp_worker_flush_nbx(self.worker.handle(), &param) };
        classify("ucp_worker_flush_nbx", status_ptr)
    }

    fn request_state(&self, request: &UcpRequest) -> RequestState {
        let status = unsafe { ucx_sys::ucp_request_check_status(request.handle) };
        if status == UCS_INPROGRESS {
            RequestState::InProgress
        } else if status == UCS_OK {
            RequestState::Complete
        } else {
            RequestState::Failed(TransportError::new(
                "ucp_request_check_status",
                status_string(status),
            ))
        }
    }

    fn progress(&self) -> u32 {
        self.worker.progress()
    }
}
