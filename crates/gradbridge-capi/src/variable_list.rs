//! Ordered tensor lists: custom-function inputs, outputs and gradients.

use crate::handle::{gbr_handle, list_mut, list_ref, tensor_ref};
use crate::{StatusCode, error_status, handle_result, status_result};
use gradbridge::autograd::VariableList;
use libc::size_t;

/// Create an empty list.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_variable_list_new() -> *mut gbr_handle {
    gbr_handle::list(VariableList::new())
}

/// Append a tensor. The list holds its own reference; `tensor` is not
/// consumed.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_variable_list_push_back(
    list: *mut gbr_handle,
    tensor: *const gbr_handle,
) -> StatusCode {
    status_result(|| {
        let variable = unsafe { tensor_ref(tensor)? }.clone();
        unsafe { list_mut(list)? }.push(variable);
        Ok(())
    })
}

/// Element at `index` as a new tensor handle sharing the same data and
/// graph position.
///
/// # Returns
/// New tensor handle, or null with `GBR_INDEX_OUT_OF_BOUNDS`
#[unsafe(no_mangle)]
pub extern "C" fn gbr_variable_list_get(
    list: *const gbr_handle,
    index: size_t,
    status: *mut StatusCode,
) -> *mut gbr_handle {
    handle_result(status, || {
        let list = unsafe { list_ref(list)? };
        let variable = list.get(index).map_err(error_status)?;
        Ok(gbr_handle::tensor(variable.clone()))
    })
}

/// Number of elements.
///
/// Zero for an empty list and also for a null, released or wrong-kind
/// handle; the latter two are logged at `warn` level.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_variable_list_size(list: *const gbr_handle) -> size_t {
    unsafe { list_ref(list) }.map_or(0, VariableList::len)
}
