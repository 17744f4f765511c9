//! Gradient hooks.
//!
//! A hook observes (and may replace) the gradient of one tensor at the moment
//! the backward pass has computed it. Hooks on the same tensor run in
//! registration order, each receiving the previous hook's output.

use super::graph::with_graph;
use super::variable::Variable;
use crate::error::AutogradError;
use crate::tensor::DenseTensor;
use log::debug;
use std::rc::Rc;

/// Callback run on a gradient as it is produced.
pub trait GradHook {
    /// Return the gradient to propagate in place of `grad`.
    fn call(&self, grad: DenseTensor<f64>) -> Result<DenseTensor<f64>, AutogradError>;
}

impl<F> GradHook for F
where
    F: Fn(DenseTensor<f64>) -> Result<DenseTensor<f64>, AutogradError>,
{
    fn call(&self, grad: DenseTensor<f64>) -> Result<DenseTensor<f64>, AutogradError> {
        self(grad)
    }
}

/// Run `hooks` as a pipeline over `grad`.
pub(crate) fn run_hooks(
    hooks: &[Rc<dyn GradHook>],
    grad: DenseTensor<f64>,
) -> Result<DenseTensor<f64>, AutogradError> {
    hooks.iter().enumerate().try_fold(grad, |grad, (position, hook)| {
        let expected = grad.shape().to_vec();
        let replaced = hook.call(grad)?;
        if replaced.shape() != expected.as_slice() {
            return Err(AutogradError::GradShapeMismatch {
                origin: format!("hook {position}"),
                expected,
                actual: replaced.shape().to_vec(),
            });
        }
        Ok(replaced)
    })
}

impl Variable {
    /// Register a hook on this tensor's gradient.
    ///
    /// Returns the hook's position among the hooks of this tensor, to be
    /// passed to [`Variable::remove_hook`].
    ///
    /// # Errors
    ///
    /// `DoesNotRequireGrad` if the tensor is not part of the graph.
    ///
    /// # Example
    ///
    /// ```
    /// use gradbridge::{AutogradError, DenseTensor};
    /// use gradbridge::autograd::Variable;
    /// use gradbridge::operations::scale;
    ///
    /// let x = Variable::leaf(DenseTensor::ones(&[3]));
    /// x.register_hook(|g: DenseTensor<f64>| -> Result<DenseTensor<f64>, AutogradError> {
    ///     Ok(scale(&g, 2.0))
    /// })
    /// .unwrap();
    ///
    /// x.sum().unwrap().backward().unwrap();
    /// assert_eq!(x.grad().unwrap().data(), &[2.0, 2.0, 2.0]);
    /// ```
    pub fn register_hook<H>(&self, hook: H) -> Result<usize, AutogradError>
    where
        H: GradHook + 'static,
    {
        self.register_shared_hook(Rc::new(hook))
    }

    /// Register a hook that may also be registered on other tensors.
    pub fn register_shared_hook(&self, hook: Rc<dyn GradHook>) -> Result<usize, AutogradError> {
        let edge = self.grad_edge().ok_or(AutogradError::DoesNotRequireGrad)?;
        let token = with_graph(|g| {
            g.get_node_mut(edge.node)
                .ok_or(AutogradError::GraphReleased {
                    node: edge.node.index(),
                })?
                .add_hook(edge.input_nr, hook)
        })?;
        debug!(
            "registered hook {} on node {} output {}",
            token,
            edge.node.index(),
            edge.input_nr
        );
        Ok(token)
    }

    /// Deregister the hook at position `token`.
    ///
    /// # Errors
    ///
    /// `InvalidHookToken` if no hook is registered at that position (never
    /// registered, or already removed).
    pub fn remove_hook(&self, token: usize) -> Result<(), AutogradError> {
        let edge = self.grad_edge().ok_or(AutogradError::DoesNotRequireGrad)?;
        with_graph(|g| {
            g.get_node_mut(edge.node)
                .ok_or(AutogradError::InvalidHookToken { token })?
                .remove_hook(edge.input_nr, token)
        })?;
        debug!("removed hook {} from node {}", token, edge.node.index());
        Ok(())
    }
}
