#![allow(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    dead_code,
    clippy::all
)]

include!(concat!(env!("OUT_DIR"), "/bindings.rs"));

// The UCS_PTR_* helpers are C macros and never reach the generated bindings.

/// `UCS_PTR_IS_ERR`: the pointer encodes a negative status code.
#[inline]
pub fn ucs_ptr_is_err(ptr: ucs_status_ptr_t) -> bool {
    (ptr as usize) >= (ucs_status_t_UCS_ERR_LAST as isize as usize)
}

/// `UCS_PTR_IS_PTR`: the pointer is a real request handle.
#[inline]
pub fn ucs_ptr_is_ptr(ptr: ucs_status_ptr_t) -> bool {
    !ptr.is_null() && !ucs_ptr_is_err(ptr)
}

/// `UCS_PTR_STATUS`: the status encoded in an error pointer.
#[inline]
pub fn ucs_ptr_status(ptr: ucs_status_ptr_t) -> ucs_status_t {
    ptr as isize as ucs_status_t
}
