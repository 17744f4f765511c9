//! User-defined differentiable functions.
//!
//! A custom function is a forward computation paired with a hand-written
//! backward rule. Applying it runs forward immediately and installs one graph
//! node whose gradient rule is the backward callback; both callbacks share an
//! [`AutogradContext`] for saved tensors and scratch values.

use super::context::AutogradContext;
use super::grad_mode::{GradModeGuard, is_grad_enabled};
use super::graph::{Edge, EdgeList, GradFn, with_graph};
use super::variable::{Variable, VariableList};
use crate::error::AutogradError;
use crate::tensor::DenseTensor;
use log::debug;
use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::Rc;

type BackwardFn = dyn Fn(&mut AutogradContext, VariableList) -> Result<VariableList, AutogradError>;

/// A differentiable function with a hand-written gradient.
///
/// `backward` receives one gradient per output of `forward` and must return
/// exactly one entry per input, in input order; use
/// [`Variable::undefined`] for inputs that get no gradient.
pub trait CustomFunction: 'static {
    /// Name used in logs and error messages.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn forward(
        &self,
        ctx: &mut AutogradContext,
        inputs: VariableList,
    ) -> Result<VariableList, AutogradError>;

    fn backward(
        &self,
        ctx: &mut AutogradContext,
        grad_outputs: VariableList,
    ) -> Result<VariableList, AutogradError>;
}

/// Apply a [`CustomFunction`] to `inputs`.
pub fn apply_function<F: CustomFunction>(
    function: F,
    inputs: VariableList,
) -> Result<VariableList, AutogradError> {
    let function = Rc::new(function);
    let name = function.name().to_string();
    let for_backward = Rc::clone(&function);
    apply_impl(
        name,
        inputs,
        |ctx: &mut AutogradContext, inputs: VariableList| function.forward(ctx, inputs),
        Box::new(move |ctx: &mut AutogradContext, grads: VariableList| {
            for_backward.backward(ctx, grads)
        }),
    )
}

/// Closure form of a custom function.
#[derive(Debug, Clone, Copy)]
pub struct Function;

impl Function {
    /// Run `forward` on `inputs` and record `backward` as its gradient rule.
    ///
    /// Forward runs with gradient tracking suspended. A node is recorded only
    /// if grad mode is enabled and at least one input requires grad; every
    /// defined output is then bound to that node. Otherwise the outputs come
    /// back detached, even when forward returns one of its inputs.
    ///
    /// # Example
    ///
    /// ```
    /// use gradbridge::DenseTensor;
    /// use gradbridge::autograd::{AutogradContext, Function, Variable, VariableList, clear_graph};
    ///
    /// clear_graph();
    ///
    /// let x = Variable::leaf(DenseTensor::from_vec(vec![1.0, 2.0], &[2]).unwrap());
    ///
    /// // y = 3x
    /// let outputs = Function::apply(
    ///     vec![x.clone()].into(),
    ///     |ctx: &mut AutogradContext, inputs: VariableList| {
    ///         ctx.set("factor", 3.0);
    ///         Ok(vec![inputs.get(0)?.mul_scalar(3.0)?].into())
    ///     },
    ///     |ctx: &mut AutogradContext, grads: VariableList| {
    ///         let factor = ctx.get_double("factor")?;
    ///         Ok(vec![grads.get(0)?.mul_scalar(factor)?].into())
    ///     },
    /// )
    /// .unwrap();
    ///
    /// outputs[0].sum().unwrap().backward().unwrap();
    /// assert_eq!(x.grad().unwrap().data(), &[3.0, 3.0]);
    /// ```
    pub fn apply<Fwd, Bwd>(
        inputs: VariableList,
        forward: Fwd,
        backward: Bwd,
    ) -> Result<VariableList, AutogradError>
    where
        Fwd: FnOnce(&mut AutogradContext, VariableList) -> Result<VariableList, AutogradError>,
        Bwd: Fn(&mut AutogradContext, VariableList) -> Result<VariableList, AutogradError>
            + 'static,
    {
        apply_impl("Function".to_string(), inputs, forward, Box::new(backward))
    }
}

fn apply_impl<Fwd>(
    name: String,
    inputs: VariableList,
    forward: Fwd,
    backward: Box<BackwardFn>,
) -> Result<VariableList, AutogradError>
where
    Fwd: FnOnce(&mut AutogradContext, VariableList) -> Result<VariableList, AutogradError>,
{
    let grad_enabled = is_grad_enabled();
    let needs_input_grad: Vec<bool> = inputs
        .iter()
        .map(|v| grad_enabled && v.requires_grad())
        .collect();
    let is_executable = needs_input_grad.iter().any(|&needs| needs);

    let next_edges: EdgeList = inputs.iter().map(Variable::grad_edge).collect();
    let input_shapes: Vec<Vec<usize>> = inputs.iter().map(|v| v.shape().to_vec()).collect();

    let mut ctx = AutogradContext::new(needs_input_grad);
    let outputs = {
        let _guard = GradModeGuard::new(false);
        forward(&mut ctx, inputs)?
    };

    if !is_executable {
        return Ok(outputs.iter().map(Variable::detach).collect());
    }

    let output_shapes: Vec<Option<Vec<usize>>> = outputs
        .iter()
        .map(|v| v.is_defined().then(|| v.shape().to_vec()))
        .collect();
    let num_outputs = outputs.len();

    let bridge = Rc::new(BridgeBackward {
        name,
        backward,
        ctx: RefCell::new(ctx),
        next_edges,
        input_shapes,
        output_shapes,
    });
    let node = with_graph(|g| g.create_node(Rc::clone(&bridge) as Rc<dyn GradFn>, num_outputs));
    bridge.ctx.borrow_mut().attach(node);
    debug!(
        "recorded {} as node {} ({} inputs, {} outputs)",
        bridge.name,
        node.index(),
        bridge.next_edges.len(),
        num_outputs
    );

    Ok(outputs
        .into_iter()
        .enumerate()
        .map(|(i, output)| match output.shared_tensor() {
            Some(data) => Variable::from_edge(Rc::clone(data), Some(Edge::new(node, i))),
            None => output,
        })
        .collect())
}

/// Graph node of one custom-function invocation.
struct BridgeBackward {
    name: String,
    backward: Box<BackwardFn>,
    ctx: RefCell<AutogradContext>,
    next_edges: EdgeList,
    input_shapes: Vec<Vec<usize>>,
    /// `None` for outputs forward left undefined.
    output_shapes: Vec<Option<Vec<usize>>>,
}

impl GradFn for BridgeBackward {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_edges(&self) -> &[Option<Edge>] {
        &self.next_edges
    }

    fn apply(
        &self,
        grad_outputs: Vec<Option<DenseTensor<f64>>>,
    ) -> Result<Vec<Option<DenseTensor<f64>>>, AutogradError> {
        let mut ctx = self
            .ctx
            .try_borrow_mut()
            .map_err(|_| AutogradError::ContextBusy {
                function: self.name.clone(),
            })?;

        let materialize = ctx.materialize_grads();
        let grads: VariableList = grad_outputs
            .into_iter()
            .zip(&self.output_shapes)
            .map(|(grad, shape)| match (grad, shape) {
                (Some(grad), _) => Variable::new(grad),
                (None, Some(shape)) if materialize => Variable::new(DenseTensor::zeros(shape)),
                (None, _) => Variable::undefined(),
            })
            .collect();

        let input_grads = (self.backward)(&mut ctx, grads)?;
        if input_grads.len() != self.next_edges.len() {
            return Err(AutogradError::ArityMismatch {
                function: self.name.clone(),
                expected: self.next_edges.len(),
                actual: input_grads.len(),
            });
        }

        input_grads
            .into_iter()
            .zip(self.next_edges.iter().zip(&self.input_shapes))
            .enumerate()
            .map(|(i, (grad, (edge, shape)))| {
                if edge.is_none() {
                    return Ok(None);
                }
                match grad.into_tensor() {
                    Some(grad) if grad.shape() != shape.as_slice() => {
                        Err(AutogradError::GradShapeMismatch {
                            origin: format!("{} (input {})", self.name, i),
                            expected: shape.clone(),
                            actual: grad.shape().to_vec(),
                        })
                    }
                    grad => Ok(grad),
                }
            })
            .collect()
    }

    fn release_variables(&self) {
        if let Ok(mut ctx) = self.ctx.try_borrow_mut() {
            ctx.release_variables();
        }
    }
}

impl Debug for BridgeBackward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeBackward")
            .field("name", &self.name)
            .field("next_edges", &self.next_edges)
            .field("input_shapes", &self.input_shapes)
            .field("output_shapes", &self.output_shapes)
            .finish()
    }
}
