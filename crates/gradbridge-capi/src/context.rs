//! Autograd context access from inside foreign forward/backward callbacks.

use crate::handle::{context_mut, gbr_handle, list_ref};
use crate::{GBR_INVALID_ARGUMENT, StatusCode, error_status, handle_result, status_result};
use gradbridge::autograd::AutogradContext;
use libc::{c_char, c_double, size_t};
use std::ffi::CStr;

/// Borrow a NUL-terminated UTF-8 key.
unsafe fn key_arg<'a>(key: *const c_char) -> Result<&'a str, StatusCode> {
    if key.is_null() {
        return Err(GBR_INVALID_ARGUMENT);
    }
    unsafe { CStr::from_ptr(key) }
        .to_str()
        .map_err(|_| GBR_INVALID_ARGUMENT)
}

/// Write a scratch value read by `get` through `out`.
fn read_into<T>(
    ctx: *mut gbr_handle,
    key: *const c_char,
    out: *mut T,
    get: impl FnOnce(&AutogradContext, &str) -> Result<T, gradbridge::AutogradError>,
) -> StatusCode {
    status_result(|| {
        if out.is_null() {
            return Err(GBR_INVALID_ARGUMENT);
        }
        let ctx = unsafe { context_mut(ctx)? };
        let key = unsafe { key_arg(key)? };
        let value = get(&*ctx, key).map_err(error_status)?;
        unsafe {
            *out = value;
        }
        Ok(())
    })
}

fn write_from(
    ctx: *mut gbr_handle,
    key: *const c_char,
    set: impl FnOnce(&mut AutogradContext, &str),
) -> StatusCode {
    status_result(|| {
        let ctx = unsafe { context_mut(ctx)? };
        let key = unsafe { key_arg(key)? };
        set(ctx, key);
        Ok(())
    })
}

// ============================================================================
// Saved variables
// ============================================================================

/// Save tensors for backward, replacing any previously saved set.
///
/// `list` is not consumed. Call from forward.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_context_save_for_backward(
    ctx: *mut gbr_handle,
    list: *const gbr_handle,
) -> StatusCode {
    status_result(|| {
        let variables = unsafe { list_ref(list)? }.clone();
        unsafe { context_mut(ctx)? }.save_for_backward(variables);
        Ok(())
    })
}

/// Tensors saved in forward, in the order they were saved.
///
/// # Returns
/// New variable list, or null once the graph node has been released
#[unsafe(no_mangle)]
pub extern "C" fn gbr_context_get_saved_variables(
    ctx: *mut gbr_handle,
    status: *mut StatusCode,
) -> *mut gbr_handle {
    handle_result(status, || {
        let saved = unsafe { context_mut(ctx)? }
            .get_saved_variables()
            .map_err(error_status)?;
        Ok(gbr_handle::list(saved))
    })
}

// ============================================================================
// Scratch map
// ============================================================================

/// Store an integer under `key`, overwriting any previous value.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_context_set_int(
    ctx: *mut gbr_handle,
    key: *const c_char,
    value: i64,
) -> StatusCode {
    write_from(ctx, key, |c, k| c.set(k, value))
}

/// Read an integer stored under `key`.
///
/// # Returns
/// `GBR_TYPE_MISMATCH` if the key is missing or holds another type
#[unsafe(no_mangle)]
pub extern "C" fn gbr_context_get_int(
    ctx: *mut gbr_handle,
    key: *const c_char,
    out: *mut i64,
) -> StatusCode {
    read_into(ctx, key, out, AutogradContext::get_int)
}

#[unsafe(no_mangle)]
pub extern "C" fn gbr_context_set_double(
    ctx: *mut gbr_handle,
    key: *const c_char,
    value: c_double,
) -> StatusCode {
    write_from(ctx, key, |c, k| c.set(k, value))
}

#[unsafe(no_mangle)]
pub extern "C" fn gbr_context_get_double(
    ctx: *mut gbr_handle,
    key: *const c_char,
    out: *mut c_double,
) -> StatusCode {
    read_into(ctx, key, out, AutogradContext::get_double)
}

#[unsafe(no_mangle)]
pub extern "C" fn gbr_context_set_bool(
    ctx: *mut gbr_handle,
    key: *const c_char,
    value: bool,
) -> StatusCode {
    write_from(ctx, key, |c, k| c.set(k, value))
}

#[unsafe(no_mangle)]
pub extern "C" fn gbr_context_get_bool(
    ctx: *mut gbr_handle,
    key: *const c_char,
    out: *mut bool,
) -> StatusCode {
    read_into(ctx, key, out, AutogradContext::get_bool)
}

// ============================================================================
// Flags
// ============================================================================

/// Whether input `index` needs a gradient. False for invalid handles and
/// out-of-range indices.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_context_needs_input_grad(ctx: *mut gbr_handle, index: size_t) -> bool {
    unsafe { context_mut(ctx) }.is_ok_and(|c| c.needs_input_grad(index))
}

/// Choose whether missing output gradients reach backward as zeros (the
/// default) or as undefined tensors.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_context_set_materialize_grads(
    ctx: *mut gbr_handle,
    materialize: bool,
) -> StatusCode {
    status_result(|| {
        unsafe { context_mut(ctx)? }.set_materialize_grads(materialize);
        Ok(())
    })
}
