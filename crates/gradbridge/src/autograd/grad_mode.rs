//! Gradient-tracking mode.
//!
//! The flag is thread-local like the computation graph it gates. Prefer
//! [`GradModeGuard`] over [`set_grad_enabled`] so the previous mode is
//! restored on every exit path, including `?` returns.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Whether differentiable operations currently record graph nodes.
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(Cell::get)
}

/// Enable or disable gradient tracking until changed again.
pub fn set_grad_enabled(enabled: bool) {
    GRAD_ENABLED.with(|flag| flag.set(enabled));
}

/// Scoped override of the grad mode; restores the previous mode on drop.
#[must_use = "the previous grad mode is restored as soon as the guard is dropped"]
#[derive(Debug)]
pub struct GradModeGuard {
    previous: bool,
    // The flag is per thread, so the guard must not move across threads.
    _not_send: PhantomData<*const ()>,
}

impl GradModeGuard {
    pub fn new(enabled: bool) -> Self {
        let previous = is_grad_enabled();
        set_grad_enabled(enabled);
        Self {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl Drop for GradModeGuard {
    fn drop(&mut self) {
        set_grad_enabled(self.previous);
    }
}

/// Suspend gradient tracking for the lifetime of the returned guard.
///
/// # Example
///
/// ```
/// use gradbridge::autograd::{is_grad_enabled, no_grad};
///
/// assert!(is_grad_enabled());
/// {
///     let _guard = no_grad();
///     assert!(!is_grad_enabled());
/// }
/// assert!(is_grad_enabled());
/// ```
pub fn no_grad() -> GradModeGuard {
    GradModeGuard::new(false)
}
