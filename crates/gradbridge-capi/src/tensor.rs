//! Tensor handles: creation, inspection, gradients and differentiable ops.

use crate::handle::{gbr_handle, tensor_ref};
use crate::{
    GBR_INDEX_OUT_OF_BOUNDS, GBR_INVALID_ARGUMENT, StatusCode, error_status, handle_result,
    status_result,
};
use gradbridge::autograd::{BackwardOptions, Variable};
use gradbridge::{AutogradError, DenseTensor};
use libc::{c_double, size_t};
use log::trace;
use std::ptr;

/// Shape argument from a raw pointer; `ndim == 0` means a scalar.
unsafe fn shape_arg<'a>(shape: *const size_t, ndim: size_t) -> Result<&'a [usize], StatusCode> {
    if ndim == 0 {
        return Ok(&[]);
    }
    if shape.is_null() {
        return Err(GBR_INVALID_ARGUMENT);
    }
    Ok(unsafe { std::slice::from_raw_parts(shape, ndim) })
}

fn tensor_status(err: impl Into<AutogradError>) -> StatusCode {
    error_status(err.into())
}

// ============================================================================
// Tensor creation functions
// ============================================================================

/// Create a new tensor from data.
///
/// # Arguments
/// * `data` - Pointer to data array (column-major order)
/// * `len` - Length of data array
/// * `shape` - Pointer to array of dimensions
/// * `ndim` - Number of dimensions
/// * `requires_grad` - Whether the tensor is a differentiable leaf
/// * `status` - Pointer to receive status code
///
/// # Returns
/// New tensor handle, or null on error. `GBR_SHAPE_MISMATCH` if `len` does
/// not match the shape or the shape's element count overflows.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_tensor_from_data(
    data: *const c_double,
    len: size_t,
    shape: *const size_t,
    ndim: size_t,
    requires_grad: bool,
    status: *mut StatusCode,
) -> *mut gbr_handle {
    handle_result(status, || {
        if data.is_null() && len > 0 {
            return Err(GBR_INVALID_ARGUMENT);
        }
        let data = if len == 0 {
            Vec::new()
        } else {
            unsafe { std::slice::from_raw_parts(data, len) }.to_vec()
        };
        let shape = unsafe { shape_arg(shape, ndim)? };
        let tensor = DenseTensor::from_vec(data, shape).map_err(tensor_status)?;
        Ok(gbr_handle::tensor(Variable::with_requires_grad(
            tensor,
            requires_grad,
        )))
    })
}

/// Create a new tensor filled with ones.
///
/// # Returns
/// New tensor handle, or null with `GBR_SHAPE_MISMATCH` if the shape's
/// element count overflows or cannot be allocated
#[unsafe(no_mangle)]
pub extern "C" fn gbr_tensor_ones(
    shape: *const size_t,
    ndim: size_t,
    requires_grad: bool,
    status: *mut StatusCode,
) -> *mut gbr_handle {
    handle_result(status, || {
        let shape = unsafe { shape_arg(shape, ndim)? };
        let tensor = DenseTensor::try_ones(shape).map_err(tensor_status)?;
        Ok(gbr_handle::tensor(Variable::with_requires_grad(
            tensor,
            requires_grad,
        )))
    })
}

/// Create the undefined tensor, used as "no gradient" in backward results.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_tensor_undefined() -> *mut gbr_handle {
    gbr_handle::tensor(Variable::undefined())
}

// ============================================================================
// Tensor query functions
// ============================================================================

/// Whether the tensor holds data.
///
/// False for the undefined tensor and also for a null, released or
/// wrong-kind handle; the latter two are logged at `warn` level.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_tensor_is_defined(tensor: *const gbr_handle) -> bool {
    unsafe { tensor_ref(tensor) }.is_ok_and(Variable::is_defined)
}

/// Get the number of dimensions.
///
/// Zero for scalars, the undefined tensor and invalid handles. Use
/// `gbr_tensor_shape` when a status code is needed.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_tensor_ndim(tensor: *const gbr_handle) -> size_t {
    unsafe { tensor_ref(tensor) }.map_or(0, |v| v.shape().len())
}

/// Get the total number of elements.
///
/// Zero for the undefined tensor and for invalid handles, which are logged
/// at `warn` level rather than reported as `GBR_TYPE_MISMATCH`.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_tensor_len(tensor: *const gbr_handle) -> size_t {
    unsafe { tensor_ref(tensor) }.map_or(0, Variable::len)
}

/// Get the shape (dimensions).
///
/// # Arguments
/// * `tensor` - Tensor handle
/// * `out` - Output array for shape (must have space for ndim elements)
///
/// # Returns
/// Status code
#[unsafe(no_mangle)]
pub extern "C" fn gbr_tensor_shape(tensor: *const gbr_handle, out: *mut size_t) -> StatusCode {
    status_result(|| {
        if out.is_null() {
            return Err(GBR_INVALID_ARGUMENT);
        }
        let variable = unsafe { tensor_ref(tensor)? };
        for (i, &dim) in variable.shape().iter().enumerate() {
            unsafe {
                *out.add(i) = dim;
            }
        }
        Ok(())
    })
}

/// Get pointer to underlying data (read-only).
///
/// # Safety
/// The returned pointer is only valid while the tensor handle exists. Null
/// for the undefined tensor.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_tensor_data(tensor: *const gbr_handle) -> *const c_double {
    match unsafe { tensor_ref(tensor) }.and_then(|v| v.tensor().map_err(tensor_status)) {
        Ok(t) => t.data().as_ptr(),
        Err(_) => ptr::null(),
    }
}

/// Get element by linear index.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_tensor_get_linear(
    tensor: *const gbr_handle,
    index: size_t,
    out: *mut c_double,
) -> StatusCode {
    status_result(|| {
        if out.is_null() {
            return Err(GBR_INVALID_ARGUMENT);
        }
        let t = unsafe { tensor_ref(tensor)? }.tensor().map_err(tensor_status)?;
        let value = *t.get_linear(index).ok_or(GBR_INDEX_OUT_OF_BOUNDS)?;
        unsafe {
            *out = value;
        }
        Ok(())
    })
}

/// Whether gradients flow back through the tensor. False for invalid handles.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_tensor_requires_grad(tensor: *const gbr_handle) -> bool {
    unsafe { tensor_ref(tensor) }.is_ok_and(Variable::requires_grad)
}

// ============================================================================
// Gradient functions
// ============================================================================

/// Accumulated gradient of a leaf.
///
/// # Returns
/// New tensor handle; the undefined tensor if no gradient has been
/// accumulated
#[unsafe(no_mangle)]
pub extern "C" fn gbr_tensor_grad(
    tensor: *const gbr_handle,
    status: *mut StatusCode,
) -> *mut gbr_handle {
    handle_result(status, || {
        let grad = unsafe { tensor_ref(tensor)? }.grad();
        Ok(gbr_handle::tensor(grad.map_or_else(Variable::undefined, Variable::new)))
    })
}

/// New handle sharing the data but cut from the graph.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_tensor_detach(
    tensor: *const gbr_handle,
    status: *mut StatusCode,
) -> *mut gbr_handle {
    handle_result(status, || {
        Ok(gbr_handle::tensor(unsafe { tensor_ref(tensor)? }.detach()))
    })
}

/// Reset the accumulated gradient of a leaf.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_tensor_zero_grad(tensor: *const gbr_handle) -> StatusCode {
    status_result(|| {
        unsafe { tensor_ref(tensor)? }.zero_grad();
        Ok(())
    })
}

/// Run backward from `tensor`.
///
/// # Arguments
/// * `tensor` - Root of the backward pass
/// * `grad_output` - Gradient of the root, or null for an implicit one
///   (single-element roots only)
/// * `retain_graph` - Keep the traversed graph for another pass
///
/// # Returns
/// Status code; errors raised by foreign callbacks abort the pass
#[unsafe(no_mangle)]
pub extern "C" fn gbr_tensor_backward(
    tensor: *const gbr_handle,
    grad_output: *const gbr_handle,
    retain_graph: bool,
) -> StatusCode {
    status_result(|| {
        let root = unsafe { tensor_ref(tensor)? };
        let seed = if grad_output.is_null() {
            None
        } else {
            Some(unsafe { tensor_ref(grad_output)? }.tensor().map_err(tensor_status)?)
        };
        trace!("backward from C API (retain_graph = {retain_graph})");
        root.backward_with(seed, BackwardOptions::new().retain_graph(retain_graph))
            .map_err(error_status)
    })
}

// ============================================================================
// Differentiable operations
// ============================================================================

fn binary_op(
    a: *const gbr_handle,
    b: *const gbr_handle,
    status: *mut StatusCode,
    op: impl FnOnce(&Variable, &Variable) -> Result<Variable, AutogradError>,
) -> *mut gbr_handle {
    handle_result(status, || {
        let a = unsafe { tensor_ref(a)? };
        let b = unsafe { tensor_ref(b)? };
        op(a, b).map(gbr_handle::tensor).map_err(error_status)
    })
}

/// Element-wise `a + b`.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_tensor_add(
    a: *const gbr_handle,
    b: *const gbr_handle,
    status: *mut StatusCode,
) -> *mut gbr_handle {
    binary_op(a, b, status, Variable::add)
}

/// Element-wise `a - b`.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_tensor_sub(
    a: *const gbr_handle,
    b: *const gbr_handle,
    status: *mut StatusCode,
) -> *mut gbr_handle {
    binary_op(a, b, status, Variable::sub)
}

/// Element-wise `a * b`.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_tensor_mul(
    a: *const gbr_handle,
    b: *const gbr_handle,
    status: *mut StatusCode,
) -> *mut gbr_handle {
    binary_op(a, b, status, Variable::mul)
}

/// Matrix product of two 2-D tensors.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_tensor_matmul(
    a: *const gbr_handle,
    b: *const gbr_handle,
    status: *mut StatusCode,
) -> *mut gbr_handle {
    binary_op(a, b, status, Variable::matmul)
}

/// `alpha * a`.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_tensor_mul_scalar(
    a: *const gbr_handle,
    alpha: c_double,
    status: *mut StatusCode,
) -> *mut gbr_handle {
    handle_result(status, || {
        let a = unsafe { tensor_ref(a)? };
        a.mul_scalar(alpha)
            .map(gbr_handle::tensor)
            .map_err(error_status)
    })
}

/// Sum of all elements as a scalar tensor.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_tensor_sum(a: *const gbr_handle, status: *mut StatusCode) -> *mut gbr_handle {
    handle_result(status, || {
        let a = unsafe { tensor_ref(a)? };
        a.sum().map(gbr_handle::tensor).map_err(error_status)
    })
}
