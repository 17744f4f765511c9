//! Custom functions whose forward and backward are foreign callbacks.

use crate::handle::{
    Payload, backward_ref, forward_ref, gbr_handle, list_ref, release_context, take,
};
use crate::{GBR_INVALID_ARGUMENT, StatusCode, error_status, handle_result};
use gradbridge::AutogradError;
use gradbridge::autograd::{AutogradContext, Function, VariableList};
use log::debug;
use std::ffi::c_void;

/// Forward or backward callback.
///
/// Called as `fun(custom, ctx, list)`: `ctx` is borrowed for the call, `list`
/// (inputs for forward, output gradients for backward) is owned by the
/// callback. Must return a new variable-list handle (or `list` itself), or
/// null to signal failure.
#[allow(non_camel_case_types)]
pub type gbr_function_callback = Option<
    unsafe extern "C" fn(
        custom: *mut c_void,
        ctx: *mut gbr_handle,
        list: *mut gbr_handle,
    ) -> *mut gbr_handle,
>;

/// Foreign closure: function pointer plus user data.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ForeignFunction {
    fun: unsafe extern "C" fn(*mut c_void, *mut gbr_handle, *mut gbr_handle) -> *mut gbr_handle,
    custom: *mut c_void,
}

impl ForeignFunction {
    /// Invoke the callback, packaging the arguments as fresh handles and
    /// unwrapping the returned list.
    pub(crate) fn call(
        &self,
        ctx: &mut AutogradContext,
        list: VariableList,
    ) -> Result<VariableList, AutogradError> {
        let ctx_handle = gbr_handle::into_raw(Payload::Context(ctx as *mut AutogradContext));
        let list_handle = gbr_handle::list(list);

        let returned = unsafe { (self.fun)(self.custom, ctx_handle, list_handle) };
        unsafe { release_context(ctx_handle) };

        if returned.is_null() {
            return Err(AutogradError::Callback {
                message: "callback returned null".to_string(),
            });
        }
        match unsafe { take(returned) } {
            Ok(Payload::VariableList(list)) => Ok(list),
            Ok(_) => Err(AutogradError::Callback {
                message: "callback must return a variable list".to_string(),
            }),
            Err(code) => Err(AutogradError::Callback {
                message: format!("callback returned an invalid handle (status {code})"),
            }),
        }
    }
}

fn foreign_function(
    fun: gbr_function_callback,
    custom: *mut c_void,
) -> Result<ForeignFunction, StatusCode> {
    let fun = fun.ok_or(GBR_INVALID_ARGUMENT)?;
    Ok(ForeignFunction { fun, custom })
}

// ============================================================================
// Function creation
// ============================================================================

/// Wrap a foreign forward callback.
///
/// `custom` is passed back on every call; it must stay valid for as long
/// as the function can be applied.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_function_forward_new(
    fun: gbr_function_callback,
    custom: *mut c_void,
    status: *mut StatusCode,
) -> *mut gbr_handle {
    handle_result(status, || {
        Ok(gbr_handle::into_raw(Payload::Forward(foreign_function(
            fun, custom,
        )?)))
    })
}

/// Wrap a foreign backward callback.
///
/// `custom` must stay valid until every graph node created with this
/// backward has been released.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_function_backward_new(
    fun: gbr_function_callback,
    custom: *mut c_void,
    status: *mut StatusCode,
) -> *mut gbr_handle {
    handle_result(status, || {
        Ok(gbr_handle::into_raw(Payload::Backward(foreign_function(
            fun, custom,
        )?)))
    })
}

/// Apply a custom function.
///
/// Runs `forward` on `inputs` with gradient tracking suspended and, if any
/// input requires grad, records `backward` as the gradient rule of the
/// outputs. `backward` must return one gradient per input (an undefined
/// tensor for "no gradient").
///
/// # Arguments
/// * `inputs` - Variable list (not consumed)
/// * `forward` - Handle from `gbr_function_forward_new`
/// * `backward` - Handle from `gbr_function_backward_new`
/// * `status` - Pointer to receive status code
///
/// # Returns
/// New variable list with the outputs, or null on error
#[unsafe(no_mangle)]
pub extern "C" fn gbr_function_apply(
    inputs: *const gbr_handle,
    forward: *const gbr_handle,
    backward: *const gbr_handle,
    status: *mut StatusCode,
) -> *mut gbr_handle {
    handle_result(status, || {
        let inputs = unsafe { list_ref(inputs)? }.clone();
        let forward = unsafe { forward_ref(forward)? };
        let backward = unsafe { backward_ref(backward)? };
        debug!("applying foreign function to {} inputs", inputs.len());

        let outputs = Function::apply(
            inputs,
            move |ctx: &mut AutogradContext, inputs: VariableList| forward.call(ctx, inputs),
            move |ctx: &mut AutogradContext, grads: VariableList| backward.call(ctx, grads),
        )
        .map_err(error_status)?;
        Ok(gbr_handle::list(outputs))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        GBR_CALLBACK_FAILED, GBR_SUCCESS, GBR_TYPE_MISMATCH, gbr_handle_kind, gbr_handle_release,
        GBR_KIND_BACKWARD, GBR_KIND_FORWARD, gbr_variable_list_new,
    };
    use std::ptr;

    unsafe extern "C" fn identity(
        _custom: *mut c_void,
        _ctx: *mut gbr_handle,
        list: *mut gbr_handle,
    ) -> *mut gbr_handle {
        list
    }

    unsafe extern "C" fn returns_null(
        _custom: *mut c_void,
        _ctx: *mut gbr_handle,
        list: *mut gbr_handle,
    ) -> *mut gbr_handle {
        gbr_handle_release(list);
        ptr::null_mut()
    }

    #[test]
    fn test_function_handles() {
        let mut status: StatusCode = -999;

        let fwd = gbr_function_forward_new(Some(identity), ptr::null_mut(), &mut status);
        assert_eq!(status, GBR_SUCCESS);
        assert_eq!(gbr_handle_kind(fwd), GBR_KIND_FORWARD);

        let bwd = gbr_function_backward_new(Some(identity), ptr::null_mut(), &mut status);
        assert_eq!(status, GBR_SUCCESS);
        assert_eq!(gbr_handle_kind(bwd), GBR_KIND_BACKWARD);

        let missing = gbr_function_forward_new(None, ptr::null_mut(), &mut status);
        assert!(missing.is_null());
        assert_eq!(status, GBR_INVALID_ARGUMENT);

        gbr_handle_release(fwd);
        gbr_handle_release(bwd);
    }

    #[test]
    fn test_apply_checks_handle_kinds() {
        let mut status: StatusCode = -999;
        let inputs = gbr_variable_list_new();
        let fwd = gbr_function_forward_new(Some(identity), ptr::null_mut(), &mut status);
        let bwd = gbr_function_backward_new(Some(identity), ptr::null_mut(), &mut status);

        // forward and backward swapped
        let out = gbr_function_apply(inputs, bwd, fwd, &mut status);
        assert!(out.is_null());
        assert_eq!(status, GBR_TYPE_MISMATCH);

        let out = gbr_function_apply(inputs, fwd, bwd, &mut status);
        assert_eq!(status, GBR_SUCCESS);
        assert!(!out.is_null());

        for h in [inputs, fwd, bwd, out] {
            gbr_handle_release(h);
        }
    }

    #[test]
    fn test_null_from_forward_is_callback_failure() {
        let mut status: StatusCode = -999;
        let inputs = gbr_variable_list_new();
        let fwd = gbr_function_forward_new(Some(returns_null), ptr::null_mut(), &mut status);
        let bwd = gbr_function_backward_new(Some(identity), ptr::null_mut(), &mut status);

        let out = gbr_function_apply(inputs, fwd, bwd, &mut status);
        assert!(out.is_null());
        assert_eq!(status, GBR_CALLBACK_FAILED);

        for h in [inputs, fwd, bwd] {
            gbr_handle_release(h);
        }
    }
}
