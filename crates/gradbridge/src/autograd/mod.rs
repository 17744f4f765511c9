//! Reverse-mode automatic differentiation with user-defined functions.
//!
//! Tape-based autograd over [`DenseTensor<f64>`](crate::DenseTensor),
//! following a PyTorch-style API with a thread-local computation graph.
//! Besides the built-in operations on [`Variable`], callers can install
//! their own gradient rules ([`Function::apply`], [`CustomFunction`]) and
//! observe or rewrite gradients as they flow ([`Variable::register_hook`]).
//!
//! # Architecture
//!
//! ```text
//! Variable  ──edge (node, output_nr)──►  ComputationGraph (thread_local)
//!    │                                          │
//!    ▼                                          ▼
//! Rc<DenseTensor<f64>>                     Vec<Node>  ── hooks per output
//!                                               │
//!                                               ▼
//!                          GradFn: AddBackward, MatmulBackward, ...
//!                                  BridgeBackward ── AutogradContext
//!                                                        │
//!                                                  SavedVariable (Rc)
//! ```
//!
//! # Example
//!
//! ```
//! use gradbridge::DenseTensor;
//! use gradbridge::autograd::{AutogradContext, Function, Variable, VariableList, clear_graph};
//!
//! // Clear the graph for a fresh computation
//! clear_graph();
//!
//! let a = Variable::leaf(DenseTensor::from_vec(vec![1.0, 2.0], &[2]).unwrap());
//! let b = Variable::leaf(DenseTensor::from_vec(vec![3.0, 4.0], &[2]).unwrap());
//!
//! // out = a * b with a hand-written gradient
//! let out = Function::apply(
//!     vec![a.clone(), b.clone()].into(),
//!     |ctx: &mut AutogradContext, inputs: VariableList| {
//!         ctx.save_for_backward(inputs.clone());
//!         Ok(vec![inputs.get(0)?.mul(inputs.get(1)?)?].into())
//!     },
//!     |ctx: &mut AutogradContext, grads: VariableList| {
//!         let saved = ctx.get_saved_variables()?;
//!         let g = grads.get(0)?;
//!         Ok(vec![g.mul(saved.get(1)?)?, g.mul(saved.get(0)?)?].into())
//!     },
//! )
//! .unwrap();
//!
//! out[0].sum().unwrap().backward().unwrap();
//!
//! assert_eq!(a.grad().unwrap().data(), &[3.0, 4.0]);
//! assert_eq!(b.grad().unwrap().data(), &[1.0, 2.0]);
//! ```
//!
//! # Design Notes
//!
//! - Thread-local computation graph and grad mode (no `Arc`, uses `Rc`)
//! - The graph is never borrowed while user code (backward, hooks) runs
//! - "No gradient" is always the explicit undefined [`Variable`]

mod context;
mod engine;
mod function;
mod grad_mode;
mod gradients;
mod graph;
mod hooks;
mod ops;
mod saved;
mod variable;

pub use context::{AutogradContext, SavedValue};
pub use engine::{BackwardOptions, backward};
pub use function::{CustomFunction, Function, apply_function};
pub use grad_mode::{GradModeGuard, is_grad_enabled, no_grad, set_grad_enabled};
pub use gradients::GradientBuffer;
pub use graph::{
    ComputationGraph, Edge, EdgeList, GradFn, Node, NodeId, clear_graph, with_graph,
};
pub use hooks::GradHook;
pub use saved::SavedVariable;
pub use variable::{Variable, VariableList};
