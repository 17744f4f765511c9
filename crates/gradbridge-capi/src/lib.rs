//! C API for gradbridge
//!
//! This crate exposes the gradbridge autograd engine to foreign code: tensors
//! and tensor lists, custom functions whose forward and backward are foreign
//! callbacks, and gradient hooks.
//!
//! Every value crosses the boundary as a `*mut gbr_handle`, a tagged wrapper
//! checked on every use: a handle of the wrong kind yields
//! `GBR_TYPE_MISMATCH` instead of undefined behavior. Handles returned by the
//! API are owned by the caller and freed with [`gbr_handle_release`].
//!
//! A foreign closure is a function pointer plus a `custom` user-data pointer.
//! Handles passed *to* a callback are owned by the callback (it may release
//! or return them); the handle a callback returns is consumed by the library.
//! The context handle passed to forward/backward is borrowed for the call
//! only and cannot be released.
//!
//! Graph nodes live in a per-thread arena that only grows: backward frees a
//! node's saved state but not its slot. Long-running loops should call
//! [`gbr_autograd_clear_graph`] between iterations, once no tensor from the
//! previous iteration will take part in autograd again.
//!
//! Accessors that return a plain value (`gbr_tensor_len`,
//! `gbr_variable_list_size` and the like) cannot carry a status code; they
//! return zero or false for an invalid handle and log the mismatch at `warn`
//! level.
//!
//! All extern "C" functions are inherently unsafe as they work with raw pointers
//! from foreign code. The `#[unsafe(no_mangle)]` attribute marks the entire
//! function signature as unsafe at the FFI boundary.

#![allow(clippy::not_unsafe_ptr_arg_deref)]

mod context;
mod function;
mod handle;
mod hook;
mod tensor;
mod variable_list;

pub use context::*;
pub use function::*;
pub use handle::*;
pub use hook::*;
pub use tensor::*;
pub use variable_list::*;

use gradbridge::autograd::{clear_graph, is_grad_enabled, set_grad_enabled};
use gradbridge::{AutogradError, TensorError};
use libc::c_int;
use log::warn;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;

// Status codes
pub type StatusCode = c_int;

pub const GBR_SUCCESS: StatusCode = 0;
pub const GBR_INVALID_ARGUMENT: StatusCode = -1;
pub const GBR_SHAPE_MISMATCH: StatusCode = -2;
pub const GBR_INDEX_OUT_OF_BOUNDS: StatusCode = -3;
pub const GBR_INTERNAL_ERROR: StatusCode = -4;
pub const GBR_TYPE_MISMATCH: StatusCode = -5;
pub const GBR_ARITY_MISMATCH: StatusCode = -6;
pub const GBR_INVALID_TOKEN: StatusCode = -7;
pub const GBR_AUTOGRAD_ERROR: StatusCode = -8;
pub const GBR_CALLBACK_FAILED: StatusCode = -9;

/// Map an engine error to its status code.
pub(crate) fn error_status(err: AutogradError) -> StatusCode {
    warn!("gradbridge C API: {err}");
    match err {
        AutogradError::Tensor(TensorError::IndexOutOfBounds { .. })
        | AutogradError::OutOfRange { .. } => GBR_INDEX_OUT_OF_BOUNDS,
        AutogradError::Tensor(_) | AutogradError::GradShapeMismatch { .. } => GBR_SHAPE_MISMATCH,
        AutogradError::ArityMismatch { .. } => GBR_ARITY_MISMATCH,
        AutogradError::TypeMismatch { .. } => GBR_TYPE_MISMATCH,
        AutogradError::InvalidHookToken { .. } => GBR_INVALID_TOKEN,
        AutogradError::UndefinedTensor => GBR_INVALID_ARGUMENT,
        AutogradError::Callback { .. } => GBR_CALLBACK_FAILED,
        AutogradError::DoesNotRequireGrad
        | AutogradError::NonScalarRoot { .. }
        | AutogradError::GraphReleased { .. }
        | AutogradError::ContextBusy { .. } => GBR_AUTOGRAD_ERROR,
    }
}

/// Run `f` behind a panic guard and report its outcome through `status`.
///
/// Returns null on any failure. Nothing runs if `status` is null.
pub(crate) fn handle_result(
    status: *mut StatusCode,
    f: impl FnOnce() -> Result<*mut gbr_handle, StatusCode>,
) -> *mut gbr_handle {
    if status.is_null() {
        return ptr::null_mut();
    }

    let (handle, code) = match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(handle)) => (handle, GBR_SUCCESS),
        Ok(Err(code)) => (ptr::null_mut(), code),
        Err(_) => {
            warn!("gradbridge C API: panic caught at the boundary");
            (ptr::null_mut(), GBR_INTERNAL_ERROR)
        }
    };
    unsafe {
        *status = code;
    }
    handle
}

/// Run `f` behind a panic guard and return its status code.
pub(crate) fn status_result(f: impl FnOnce() -> Result<(), StatusCode>) -> StatusCode {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => GBR_SUCCESS,
        Ok(Err(code)) => code,
        Err(_) => {
            warn!("gradbridge C API: panic caught at the boundary");
            GBR_INTERNAL_ERROR
        }
    }
}

// ============================================================================
// Grad mode
// ============================================================================

/// Enable or disable gradient tracking on the calling thread.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_autograd_set_grad_mode(enabled: bool) {
    set_grad_enabled(enabled);
}

/// Whether gradient tracking is enabled on the calling thread.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_autograd_is_enabled() -> bool {
    is_grad_enabled()
}

/// Drop every graph node of the calling thread, leaves included.
///
/// Tensors created before the call keep their data but must not be used for
/// backward, hooks or as inputs that require grad afterwards.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_autograd_clear_graph() {
    clear_graph();
}
