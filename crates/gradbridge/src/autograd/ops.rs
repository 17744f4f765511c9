//! Differentiable operations on [`Variable`].
//!
//! Each operation computes its result with the plain kernels in
//! [`crate::operations`] and, when gradient tracking applies, records a node
//! whose [`GradFn`] holds what the backward rule needs.

use super::grad_mode::is_grad_enabled;
use super::graph::{Edge, EdgeList, GradFn, with_graph};
use super::saved::SavedVariable;
use super::variable::Variable;
use crate::error::AutogradError;
use crate::operations;
use crate::tensor::DenseTensor;
use std::rc::Rc;

type Grads = Vec<Option<DenseTensor<f64>>>;

/// Wrap `result` in a variable, recording a node built by `make_grad_fn` if
/// grad mode is on and any input requires grad.
fn record<G>(
    result: DenseTensor<f64>,
    inputs: &[&Variable],
    make_grad_fn: impl FnOnce(EdgeList) -> G,
) -> Variable
where
    G: GradFn + 'static,
{
    let data = Rc::new(result);
    if !is_grad_enabled() || !inputs.iter().any(|v| v.requires_grad()) {
        return Variable::from_edge(data, None);
    }
    let next_edges: EdgeList = inputs.iter().map(|v| v.grad_edge()).collect();
    let grad_fn: Rc<dyn GradFn> = Rc::new(make_grad_fn(next_edges));
    let node = with_graph(|g| g.create_node(grad_fn, 1));
    Variable::from_edge(data, Some(Edge::new(node, 0)))
}

/// Gradient of the single output, if any.
fn single(grad_outputs: Grads) -> Option<DenseTensor<f64>> {
    grad_outputs.into_iter().next().flatten()
}

fn unpack(saved: &SavedVariable) -> Result<Rc<DenseTensor<f64>>, AutogradError> {
    saved
        .unpack()
        .shared_tensor()
        .cloned()
        .ok_or(AutogradError::UndefinedTensor)
}

#[derive(Debug)]
struct AddBackward {
    next_edges: EdgeList,
}

impl GradFn for AddBackward {
    fn name(&self) -> &str {
        "AddBackward"
    }

    fn next_edges(&self) -> &[Option<Edge>] {
        &self.next_edges
    }

    fn apply(&self, grad_outputs: Grads) -> Result<Grads, AutogradError> {
        let grad = single(grad_outputs);
        Ok(vec![grad.clone(), grad])
    }
}

#[derive(Debug)]
struct SubBackward {
    next_edges: EdgeList,
}

impl GradFn for SubBackward {
    fn name(&self) -> &str {
        "SubBackward"
    }

    fn next_edges(&self) -> &[Option<Edge>] {
        &self.next_edges
    }

    fn apply(&self, grad_outputs: Grads) -> Result<Grads, AutogradError> {
        let grad = single(grad_outputs);
        let neg = grad.as_ref().map(operations::neg);
        Ok(vec![grad, neg])
    }
}

/// d(a*b) = g*b, g*a
#[derive(Debug)]
struct MulBackward {
    next_edges: EdgeList,
    lhs: SavedVariable,
    rhs: SavedVariable,
}

impl GradFn for MulBackward {
    fn name(&self) -> &str {
        "MulBackward"
    }

    fn next_edges(&self) -> &[Option<Edge>] {
        &self.next_edges
    }

    fn apply(&self, grad_outputs: Grads) -> Result<Grads, AutogradError> {
        let Some(grad) = single(grad_outputs) else {
            return Ok(vec![None, None]);
        };
        let grad_lhs = match self.next_edges[0] {
            Some(_) => Some(operations::mul(&grad, &*unpack(&self.rhs)?)?),
            None => None,
        };
        let grad_rhs = match self.next_edges[1] {
            Some(_) => Some(operations::mul(&grad, &*unpack(&self.lhs)?)?),
            None => None,
        };
        Ok(vec![grad_lhs, grad_rhs])
    }
}

#[derive(Debug)]
struct MulScalarBackward {
    next_edges: EdgeList,
    alpha: f64,
}

impl GradFn for MulScalarBackward {
    fn name(&self) -> &str {
        "MulScalarBackward"
    }

    fn next_edges(&self) -> &[Option<Edge>] {
        &self.next_edges
    }

    fn apply(&self, grad_outputs: Grads) -> Result<Grads, AutogradError> {
        Ok(vec![
            single(grad_outputs).map(|g| operations::scale(&g, self.alpha)),
        ])
    }
}

/// Broadcasts the scalar gradient back to the input shape.
#[derive(Debug)]
struct SumBackward {
    next_edges: EdgeList,
    input_shape: Vec<usize>,
}

impl GradFn for SumBackward {
    fn name(&self) -> &str {
        "SumBackward"
    }

    fn next_edges(&self) -> &[Option<Edge>] {
        &self.next_edges
    }

    fn apply(&self, grad_outputs: Grads) -> Result<Grads, AutogradError> {
        let grad = match single(grad_outputs) {
            Some(g) => Some(DenseTensor::full(&self.input_shape, g.item()?)),
            None => None,
        };
        Ok(vec![grad])
    }
}

/// C = A @ B: dA = G @ B^T, dB = A^T @ G
#[derive(Debug)]
struct MatmulBackward {
    next_edges: EdgeList,
    lhs: SavedVariable,
    rhs: SavedVariable,
}

impl GradFn for MatmulBackward {
    fn name(&self) -> &str {
        "MatmulBackward"
    }

    fn next_edges(&self) -> &[Option<Edge>] {
        &self.next_edges
    }

    fn apply(&self, grad_outputs: Grads) -> Result<Grads, AutogradError> {
        let Some(grad) = single(grad_outputs) else {
            return Ok(vec![None, None]);
        };
        let grad_lhs = match self.next_edges[0] {
            Some(_) => {
                let rhs_t = operations::transpose(&*unpack(&self.rhs)?)?;
                Some(operations::matmul(&grad, &rhs_t)?)
            }
            None => None,
        };
        let grad_rhs = match self.next_edges[1] {
            Some(_) => {
                let lhs_t = operations::transpose(&*unpack(&self.lhs)?)?;
                Some(operations::matmul(&lhs_t, &grad)?)
            }
            None => None,
        };
        Ok(vec![grad_lhs, grad_rhs])
    }
}

impl Variable {
    /// Element-wise `self + other`.
    ///
    /// # Errors
    ///
    /// `UndefinedTensor` if either operand is undefined; `Tensor(ShapeMismatch)`
    /// if the shapes differ.
    pub fn add(&self, other: &Variable) -> Result<Variable, AutogradError> {
        let result = operations::add(self.tensor()?, other.tensor()?)?;
        Ok(record(result, &[self, other], |next_edges| AddBackward {
            next_edges,
        }))
    }

    /// Element-wise `self - other`.
    pub fn sub(&self, other: &Variable) -> Result<Variable, AutogradError> {
        let result = operations::sub(self.tensor()?, other.tensor()?)?;
        Ok(record(result, &[self, other], |next_edges| SubBackward {
            next_edges,
        }))
    }

    /// Element-wise `self * other`.
    pub fn mul(&self, other: &Variable) -> Result<Variable, AutogradError> {
        let result = operations::mul(self.tensor()?, other.tensor()?)?;
        Ok(record(result, &[self, other], |next_edges| MulBackward {
            next_edges,
            lhs: SavedVariable::new(self),
            rhs: SavedVariable::new(other),
        }))
    }

    /// `alpha * self`.
    pub fn mul_scalar(&self, alpha: f64) -> Result<Variable, AutogradError> {
        let result = operations::scale(self.tensor()?, alpha);
        Ok(record(result, &[self], |next_edges| MulScalarBackward {
            next_edges,
            alpha,
        }))
    }

    /// Sum of all elements, as a rank-0 tensor.
    pub fn sum(&self) -> Result<Variable, AutogradError> {
        let input = self.tensor()?;
        let result = DenseTensor::scalar(operations::sum(input));
        Ok(record(result, &[self], |next_edges| SumBackward {
            next_edges,
            input_shape: input.shape().to_vec(),
        }))
    }

    /// Matrix product of two rank-2 tensors.
    ///
    /// # Example
    ///
    /// ```
    /// use gradbridge::DenseTensor;
    /// use gradbridge::autograd::{Variable, clear_graph};
    ///
    /// clear_graph();
    ///
    /// let a = Variable::leaf(DenseTensor::ones(&[2, 3]));
    /// let b = Variable::leaf(DenseTensor::ones(&[3, 4]));
    /// let loss = a.matmul(&b).unwrap().sum().unwrap();
    /// loss.backward().unwrap();
    ///
    /// // Each entry of A meets the 4 columns of B.
    /// assert!(a.grad().unwrap().data().iter().all(|&g| g == 4.0));
    /// assert!(b.grad().unwrap().data().iter().all(|&g| g == 2.0));
    /// ```
    pub fn matmul(&self, other: &Variable) -> Result<Variable, AutogradError> {
        let result = operations::matmul(self.tensor()?, other.tensor()?)?;
        Ok(record(result, &[self, other], |next_edges| MatmulBackward {
            next_edges,
            lhs: SavedVariable::new(self),
            rhs: SavedVariable::new(other),
        }))
    }
}
