//! Gradient hooks backed by foreign callbacks.

use crate::handle::{Payload, gbr_handle, hook_ref, take, tensor_ref};
use crate::{GBR_INVALID_ARGUMENT, StatusCode, error_status, handle_result, status_result};
use gradbridge::autograd::{GradHook, Variable};
use gradbridge::{AutogradError, DenseTensor};
use libc::size_t;
use log::trace;
use std::ffi::c_void;
use std::rc::Rc;

/// Hook callback: `fun(grad, custom)`.
///
/// `grad` is a tensor handle owned by the callback. The callback returns the
/// replacement gradient as a tensor handle (possibly `grad` itself), which
/// the library consumes, or null to signal failure.
#[allow(non_camel_case_types)]
pub type gbr_hook_callback =
    Option<unsafe extern "C" fn(grad: *mut gbr_handle, custom: *mut c_void) -> *mut gbr_handle>;

struct ForeignHook {
    fun: unsafe extern "C" fn(*mut gbr_handle, *mut c_void) -> *mut gbr_handle,
    custom: *mut c_void,
}

impl GradHook for ForeignHook {
    fn call(&self, grad: DenseTensor<f64>) -> Result<DenseTensor<f64>, AutogradError> {
        let handle = gbr_handle::tensor(Variable::new(grad));
        trace!("calling foreign gradient hook");
        let returned = unsafe { (self.fun)(handle, self.custom) };
        if returned.is_null() {
            return Err(AutogradError::Callback {
                message: "hook returned null".to_string(),
            });
        }

        let replacement = match unsafe { take(returned) } {
            Ok(Payload::Tensor(variable)) => variable.into_tensor(),
            _ => None,
        };
        replacement.ok_or_else(|| AutogradError::Callback {
            message: "hook must return a defined tensor".to_string(),
        })
    }
}

/// Wrap a foreign hook callback.
///
/// The hook handle can be registered on any number of tensors; releasing it
/// does not unregister it. `custom` must stay valid while the hook is
/// registered anywhere.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_hook_new(
    fun: gbr_hook_callback,
    custom: *mut c_void,
    status: *mut StatusCode,
) -> *mut gbr_handle {
    handle_result(status, || {
        let fun = fun.ok_or(GBR_INVALID_ARGUMENT)?;
        let hook: Rc<dyn GradHook> = Rc::new(ForeignHook { fun, custom });
        Ok(gbr_handle::into_raw(Payload::Hook(hook)))
    })
}

/// Register `hook` on `tensor`.
///
/// Hooks run in registration order on the tensor's accumulated gradient
/// during backward, each receiving the previous one's result.
///
/// # Arguments
/// * `tensor` - Tensor that requires grad
/// * `hook` - Handle from `gbr_hook_new` (not consumed)
/// * `out_token` - Receives the token for `gbr_tensor_remove_hook`
#[unsafe(no_mangle)]
pub extern "C" fn gbr_tensor_register_hook(
    tensor: *const gbr_handle,
    hook: *const gbr_handle,
    out_token: *mut size_t,
) -> StatusCode {
    status_result(|| {
        if out_token.is_null() {
            return Err(GBR_INVALID_ARGUMENT);
        }
        let variable = unsafe { tensor_ref(tensor)? };
        let hook = unsafe { hook_ref(hook)? };
        let token = variable.register_shared_hook(hook).map_err(error_status)?;
        unsafe {
            *out_token = token;
        }
        Ok(())
    })
}

/// Remove a hook by the token returned at registration.
///
/// # Returns
/// `GBR_INVALID_TOKEN` if the token is unknown or already removed
#[unsafe(no_mangle)]
pub extern "C" fn gbr_tensor_remove_hook(tensor: *const gbr_handle, token: size_t) -> StatusCode {
    status_result(|| {
        let variable = unsafe { tensor_ref(tensor)? };
        variable.remove_hook(token).map_err(error_status)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        GBR_AUTOGRAD_ERROR, GBR_CALLBACK_FAILED, GBR_INVALID_TOKEN, GBR_SUCCESS,
        gbr_handle_release,
    };
    use gradbridge::autograd::clear_graph;
    use std::ptr;

    unsafe extern "C" fn double_grad(
        grad: *mut gbr_handle,
        _custom: *mut c_void,
    ) -> *mut gbr_handle {
        let mut status = GBR_SUCCESS;
        let out = crate::gbr_tensor_mul_scalar(grad, 2.0, &mut status);
        gbr_handle_release(grad);
        out
    }

    unsafe extern "C" fn count_calls(
        grad: *mut gbr_handle,
        custom: *mut c_void,
    ) -> *mut gbr_handle {
        let counter = unsafe { &mut *(custom as *mut usize) };
        *counter += 1;
        grad
    }

    unsafe extern "C" fn fail(grad: *mut gbr_handle, _custom: *mut c_void) -> *mut gbr_handle {
        gbr_handle_release(grad);
        ptr::null_mut()
    }

    #[test]
    fn test_hook_transforms_leaf_gradient() {
        clear_graph();
        let x = Variable::leaf(DenseTensor::ones(&[2]));
        let handle = gbr_handle::tensor(x.clone());

        let mut status = -999;
        let mut calls = 0usize;
        let doubler = gbr_hook_new(Some(double_grad), ptr::null_mut(), &mut status);
        assert_eq!(status, GBR_SUCCESS);
        let counter = gbr_hook_new(
            Some(count_calls),
            &mut calls as *mut usize as *mut c_void,
            &mut status,
        );

        let mut t1 = 0;
        let mut t2 = 0;
        assert_eq!(gbr_tensor_register_hook(handle, doubler, &mut t1), GBR_SUCCESS);
        assert_eq!(gbr_tensor_register_hook(handle, counter, &mut t2), GBR_SUCCESS);
        assert_ne!(t1, t2);

        x.sum().unwrap().backward().unwrap();
        assert_eq!(x.grad().unwrap().data(), &[2.0, 2.0]);
        assert_eq!(calls, 1);

        assert_eq!(gbr_tensor_remove_hook(handle, t1), GBR_SUCCESS);
        assert_eq!(gbr_tensor_remove_hook(handle, t1), GBR_INVALID_TOKEN);

        for h in [handle, doubler, counter] {
            gbr_handle_release(h);
        }
    }

    #[test]
    fn test_failing_hook_aborts_backward() {
        clear_graph();
        let x = Variable::leaf(DenseTensor::ones(&[1]));
        let handle = gbr_handle::tensor(x.clone());
        let mut status = -999;
        let hook = gbr_hook_new(Some(fail), ptr::null_mut(), &mut status);

        let mut token = 0;
        assert_eq!(gbr_tensor_register_hook(handle, hook, &mut token), GBR_SUCCESS);
        assert_eq!(
            x.sum().unwrap().backward().map_err(error_status),
            Err(GBR_CALLBACK_FAILED)
        );

        for h in [handle, hook] {
            gbr_handle_release(h);
        }
    }

    #[test]
    fn test_register_on_constant_fails() {
        let constant = gbr_handle::tensor(Variable::new(DenseTensor::ones(&[1])));
        let mut status = -999;
        let hook = gbr_hook_new(Some(fail), ptr::null_mut(), &mut status);

        let mut token = 0;
        assert_eq!(
            gbr_tensor_register_hook(constant, hook, &mut token),
            GBR_AUTOGRAD_ERROR
        );
        assert_eq!(
            gbr_tensor_register_hook(constant, hook, ptr::null_mut()),
            GBR_INVALID_ARGUMENT
        );

        for h in [constant, hook] {
            gbr_handle_release(h);
        }
    }
}
