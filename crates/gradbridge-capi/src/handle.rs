//! Tagged opaque handles.

use crate::function::ForeignFunction;
use crate::{GBR_INVALID_ARGUMENT, GBR_SUCCESS, GBR_TYPE_MISMATCH, StatusCode, status_result};
use gradbridge::autograd::{AutogradContext, GradHook, Variable, VariableList};
use libc::c_int;
use log::warn;
use std::ffi::c_void;
use std::ptr;
use std::rc::Rc;

// Handle kinds
pub type HandleKind = c_int;

pub const GBR_KIND_INVALID: HandleKind = 0;
pub const GBR_KIND_TENSOR: HandleKind = 1;
pub const GBR_KIND_VARIABLE_LIST: HandleKind = 2;
pub const GBR_KIND_HOOK: HandleKind = 3;
pub const GBR_KIND_FORWARD: HandleKind = 4;
pub const GBR_KIND_BACKWARD: HandleKind = 5;
pub const GBR_KIND_CONTEXT: HandleKind = 6;

/// "GBRH"
const HANDLE_MAGIC: u32 = 0x4742_5248;

fn kind_name(kind: HandleKind) -> &'static str {
    match kind {
        GBR_KIND_TENSOR => "tensor",
        GBR_KIND_VARIABLE_LIST => "variable list",
        GBR_KIND_HOOK => "hook",
        GBR_KIND_FORWARD => "forward function",
        GBR_KIND_BACKWARD => "backward function",
        GBR_KIND_CONTEXT => "autograd context",
        _ => "invalid",
    }
}

/// Native value behind a handle.
pub(crate) enum Payload {
    Tensor(Variable),
    VariableList(VariableList),
    Hook(Rc<dyn GradHook>),
    Forward(ForeignFunction),
    Backward(ForeignFunction),
    /// Borrowed for the duration of one forward/backward callback.
    Context(*mut AutogradContext),
}

impl Payload {
    fn kind(&self) -> HandleKind {
        match self {
            Payload::Tensor(_) => GBR_KIND_TENSOR,
            Payload::VariableList(_) => GBR_KIND_VARIABLE_LIST,
            Payload::Hook(_) => GBR_KIND_HOOK,
            Payload::Forward(_) => GBR_KIND_FORWARD,
            Payload::Backward(_) => GBR_KIND_BACKWARD,
            Payload::Context(_) => GBR_KIND_CONTEXT,
        }
    }
}

/// Opaque handle to any gradbridge value.
#[allow(non_camel_case_types)]
#[repr(C)]
pub struct gbr_handle {
    magic: u32,
    kind: HandleKind,
    _private: *mut c_void,
}

impl gbr_handle {
    pub(crate) fn into_raw(payload: Payload) -> *mut gbr_handle {
        let kind = payload.kind();
        let boxed = Box::new(payload);
        Box::into_raw(Box::new(Self {
            magic: HANDLE_MAGIC,
            kind,
            _private: Box::into_raw(boxed) as *mut c_void,
        }))
    }

    pub(crate) fn tensor(variable: Variable) -> *mut gbr_handle {
        Self::into_raw(Payload::Tensor(variable))
    }

    pub(crate) fn list(list: VariableList) -> *mut gbr_handle {
        Self::into_raw(Payload::VariableList(list))
    }

    fn payload(&self) -> &Payload {
        unsafe { &*(self._private as *const Payload) }
    }

    fn payload_mut(&mut self) -> &mut Payload {
        unsafe { &mut *(self._private as *mut Payload) }
    }
}

impl Drop for gbr_handle {
    fn drop(&mut self) {
        if !self._private.is_null() {
            unsafe {
                let _ = Box::from_raw(self._private as *mut Payload);
            }
        }
    }
}

fn type_mismatch(expected: HandleKind, found: HandleKind) -> StatusCode {
    warn!(
        "gradbridge C API: expected a {} handle, got a {} handle",
        kind_name(expected),
        kind_name(found)
    );
    GBR_TYPE_MISMATCH
}

/// Validate a handle pointer.
///
/// # Safety
/// `handle` must be null or point to readable memory of a `gbr_handle`.
unsafe fn checked<'a>(handle: *const gbr_handle) -> Result<&'a gbr_handle, StatusCode> {
    if handle.is_null() {
        return Err(GBR_INVALID_ARGUMENT);
    }
    let h = unsafe { &*handle };
    if h.magic != HANDLE_MAGIC || h._private.is_null() {
        warn!("gradbridge C API: pointer is not a live gradbridge handle");
        return Err(GBR_INVALID_ARGUMENT);
    }
    Ok(h)
}

unsafe fn checked_mut<'a>(handle: *mut gbr_handle) -> Result<&'a mut gbr_handle, StatusCode> {
    unsafe { checked(handle)? };
    Ok(unsafe { &mut *handle })
}

pub(crate) unsafe fn tensor_ref<'a>(handle: *const gbr_handle) -> Result<&'a Variable, StatusCode> {
    match unsafe { checked(handle)? }.payload() {
        Payload::Tensor(v) => Ok(v),
        other => Err(type_mismatch(GBR_KIND_TENSOR, other.kind())),
    }
}

pub(crate) unsafe fn list_ref<'a>(
    handle: *const gbr_handle,
) -> Result<&'a VariableList, StatusCode> {
    match unsafe { checked(handle)? }.payload() {
        Payload::VariableList(list) => Ok(list),
        other => Err(type_mismatch(GBR_KIND_VARIABLE_LIST, other.kind())),
    }
}

pub(crate) unsafe fn list_mut<'a>(
    handle: *mut gbr_handle,
) -> Result<&'a mut VariableList, StatusCode> {
    match unsafe { checked_mut(handle)? }.payload_mut() {
        Payload::VariableList(list) => Ok(list),
        other => Err(type_mismatch(GBR_KIND_VARIABLE_LIST, other.kind())),
    }
}

pub(crate) unsafe fn hook_ref(handle: *const gbr_handle) -> Result<Rc<dyn GradHook>, StatusCode> {
    match unsafe { checked(handle)? }.payload() {
        Payload::Hook(hook) => Ok(Rc::clone(hook)),
        other => Err(type_mismatch(GBR_KIND_HOOK, other.kind())),
    }
}

pub(crate) unsafe fn forward_ref(handle: *const gbr_handle) -> Result<ForeignFunction, StatusCode> {
    match unsafe { checked(handle)? }.payload() {
        Payload::Forward(f) => Ok(*f),
        other => Err(type_mismatch(GBR_KIND_FORWARD, other.kind())),
    }
}

pub(crate) unsafe fn backward_ref(
    handle: *const gbr_handle,
) -> Result<ForeignFunction, StatusCode> {
    match unsafe { checked(handle)? }.payload() {
        Payload::Backward(f) => Ok(*f),
        other => Err(type_mismatch(GBR_KIND_BACKWARD, other.kind())),
    }
}

pub(crate) unsafe fn context_mut<'a>(
    handle: *mut gbr_handle,
) -> Result<&'a mut AutogradContext, StatusCode> {
    match unsafe { checked(handle)? }.payload() {
        Payload::Context(ctx) => Ok(unsafe { &mut **ctx }),
        other => Err(type_mismatch(GBR_KIND_CONTEXT, other.kind())),
    }
}

/// Consume a handle returned by foreign code and take its value.
///
/// Context handles are never owned by foreign code and cannot be taken.
pub(crate) unsafe fn take(handle: *mut gbr_handle) -> Result<Payload, StatusCode> {
    let h = unsafe { checked_mut(handle)? };
    if h.kind == GBR_KIND_CONTEXT {
        return Err(GBR_INVALID_ARGUMENT);
    }
    let payload = std::mem::replace(&mut h._private, ptr::null_mut());
    h.magic = 0;
    unsafe {
        drop(Box::from_raw(handle));
        Ok(*Box::from_raw(payload as *mut Payload))
    }
}

/// Free a context wrapper created for one callback. The context itself is
/// owned by the graph and stays alive.
pub(crate) unsafe fn release_context(handle: *mut gbr_handle) {
    if let Ok(h) = unsafe { checked_mut(handle) } {
        if h.kind == GBR_KIND_CONTEXT {
            h.magic = 0;
            unsafe { drop(Box::from_raw(handle)) };
        }
    }
}

// ============================================================================
// Handle lifecycle
// ============================================================================

/// Release (free) a handle of any kind. Null is a no-op.
///
/// # Returns
/// `GBR_INVALID_ARGUMENT` for context handles, which are borrowed and freed
/// by the library.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_handle_release(handle: *mut gbr_handle) -> StatusCode {
    if handle.is_null() {
        return GBR_SUCCESS;
    }

    status_result(|| {
        let h = unsafe { checked_mut(handle)? };
        if h.kind == GBR_KIND_CONTEXT {
            warn!("gradbridge C API: context handles are borrowed and cannot be released");
            return Err(GBR_INVALID_ARGUMENT);
        }
        h.magic = 0;
        unsafe { drop(Box::from_raw(handle)) };
        Ok(())
    })
}

/// Kind of a handle, or `GBR_KIND_INVALID` for null or foreign pointers.
#[unsafe(no_mangle)]
pub extern "C" fn gbr_handle_kind(handle: *const gbr_handle) -> HandleKind {
    match unsafe { checked(handle) } {
        Ok(h) => h.kind,
        Err(_) => GBR_KIND_INVALID,
    }
}
