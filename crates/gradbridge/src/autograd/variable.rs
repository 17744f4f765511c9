//! Variable - a tensor with autograd metadata.

use super::engine::{BackwardOptions, backward};
use super::graph::{Edge, NodeId, with_graph};
use crate::error::AutogradError;
use crate::tensor::DenseTensor;
use std::ops::Index;
use std::rc::Rc;

/// A tensor value together with the graph edge that produced it.
///
/// A `Variable` may be *undefined*: it then holds no data and stands for
/// "no gradient" wherever a gradient list is expected.
///
/// Cloning is cheap; clones share the tensor data and the graph edge.
///
/// # Example
///
/// ```
/// use gradbridge::DenseTensor;
/// use gradbridge::autograd::Variable;
///
/// // A leaf that requires gradient
/// let a = Variable::leaf(DenseTensor::ones(&[2, 3]));
/// assert!(a.requires_grad());
///
/// // A constant
/// let b = Variable::new(DenseTensor::ones(&[2, 3]));
/// assert!(!b.requires_grad());
///
/// assert!(!Variable::undefined().is_defined());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Variable {
    data: Option<Rc<DenseTensor<f64>>>,
    /// Output slot of the node that produced this tensor (None if not tracking).
    grad_edge: Option<Edge>,
}

impl Variable {
    /// Create a variable that does not require gradient.
    pub fn new(tensor: DenseTensor<f64>) -> Self {
        Self {
            data: Some(Rc::new(tensor)),
            grad_edge: None,
        }
    }

    /// Create a leaf variable that requires gradient.
    ///
    /// Registers a leaf node in the thread-local computation graph. Graph
    /// slots are reclaimed only by [`clear_graph`](super::clear_graph), so
    /// training loops should clear the graph between iterations.
    pub fn leaf(tensor: DenseTensor<f64>) -> Self {
        let node = with_graph(|g| g.create_leaf());
        Self {
            data: Some(Rc::new(tensor)),
            grad_edge: Some(Edge::new(node, 0)),
        }
    }

    /// Create with explicit requires_grad flag.
    pub fn with_requires_grad(tensor: DenseTensor<f64>, requires_grad: bool) -> Self {
        if requires_grad {
            Self::leaf(tensor)
        } else {
            Self::new(tensor)
        }
    }

    /// The undefined sentinel.
    pub fn undefined() -> Self {
        Self::default()
    }

    pub(crate) fn from_edge(data: Rc<DenseTensor<f64>>, grad_edge: Option<Edge>) -> Self {
        Self {
            data: Some(data),
            grad_edge,
        }
    }

    pub fn is_defined(&self) -> bool {
        self.data.is_some()
    }

    /// Get the underlying tensor.
    ///
    /// # Errors
    ///
    /// `UndefinedTensor` for the undefined sentinel.
    pub fn tensor(&self) -> Result<&DenseTensor<f64>, AutogradError> {
        self.data.as_deref().ok_or(AutogradError::UndefinedTensor)
    }

    pub(crate) fn shared_tensor(&self) -> Option<&Rc<DenseTensor<f64>>> {
        self.data.as_ref()
    }

    /// Copy of the tensor data, `None` when undefined.
    pub fn to_tensor(&self) -> Option<DenseTensor<f64>> {
        self.data.as_deref().cloned()
    }

    /// Consume and return the tensor, cloning only if the data is shared.
    pub fn into_tensor(self) -> Option<DenseTensor<f64>> {
        self.data.map(Rc::unwrap_or_clone)
    }

    /// Shape of the tensor; empty for the undefined sentinel.
    pub fn shape(&self) -> &[usize] {
        self.data.as_deref().map(DenseTensor::shape).unwrap_or(&[])
    }

    /// Number of elements; zero for the undefined sentinel.
    pub fn len(&self) -> usize {
        self.data.as_deref().map_or(0, DenseTensor::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether gradients flow back through this tensor.
    pub fn requires_grad(&self) -> bool {
        self.grad_edge.is_some()
    }

    pub fn grad_edge(&self) -> Option<Edge> {
        self.grad_edge
    }

    /// Get node ID if tracked.
    pub fn node_id(&self) -> Option<NodeId> {
        self.grad_edge.map(|e| e.node)
    }

    /// Position of this tensor among the outputs of its node.
    pub fn output_nr(&self) -> usize {
        self.grad_edge.map_or(0, |e| e.input_nr)
    }

    /// A leaf is a tensor that requires grad and was not computed by a
    /// recorded operation.
    pub fn is_leaf(&self) -> bool {
        self.grad_edge.is_some_and(|e| {
            with_graph(|g| g.get_node(e.node).is_some_and(|n| n.is_leaf()))
        })
    }

    /// Accumulated gradient of a leaf, if a backward pass reached it.
    pub fn grad(&self) -> Option<DenseTensor<f64>> {
        let edge = self.grad_edge?;
        with_graph(|g| g.get_node(edge.node).and_then(|n| n.grad().cloned()))
    }

    /// Reset the accumulated gradient of a leaf.
    pub fn zero_grad(&self) {
        if let Some(edge) = self.grad_edge {
            with_graph(|g| {
                if let Some(node) = g.get_node_mut(edge.node) {
                    node.clear_grad();
                }
            });
        }
    }

    /// Detach from computation graph.
    ///
    /// Returns a variable that shares data but doesn't require grad.
    pub fn detach(&self) -> Self {
        Self {
            data: self.data.clone(),
            grad_edge: None,
        }
    }

    /// Backpropagate from a single-element tensor with an implicit
    /// gradient of one, freeing the traversed graph.
    pub fn backward(&self) -> Result<(), AutogradError> {
        backward(self, None, BackwardOptions::default())
    }

    /// Backpropagate with an explicit output gradient and options.
    pub fn backward_with(
        &self,
        grad_output: Option<&DenseTensor<f64>>,
        options: BackwardOptions,
    ) -> Result<(), AutogradError> {
        backward(self, grad_output, options)
    }
}

impl From<DenseTensor<f64>> for Variable {
    fn from(tensor: DenseTensor<f64>) -> Self {
        Self::new(tensor)
    }
}

/// Ordered list of variables; the argument and return shape of custom
/// functions.
#[derive(Debug, Clone, Default)]
pub struct VariableList(Vec<Variable>);

impl VariableList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }

    pub fn push(&mut self, variable: Variable) {
        self.0.push(variable);
    }

    /// Element at `index`.
    ///
    /// # Errors
    ///
    /// `OutOfRange` if `index >= len()`.
    pub fn get(&self, index: usize) -> Result<&Variable, AutogradError> {
        self.0.get(index).ok_or(AutogradError::OutOfRange {
            index,
            len: self.0.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Variable> {
        self.0.iter()
    }

    pub fn into_vec(self) -> Vec<Variable> {
        self.0
    }
}

impl From<Vec<Variable>> for VariableList {
    fn from(variables: Vec<Variable>) -> Self {
        Self(variables)
    }
}

impl FromIterator<Variable> for VariableList {
    fn from_iter<I: IntoIterator<Item = Variable>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for VariableList {
    type Item = Variable;
    type IntoIter = std::vec::IntoIter<Variable>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a VariableList {
    type Item = &'a Variable;
    type IntoIter = std::slice::Iter<'a, Variable>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Index<usize> for VariableList {
    type Output = Variable;

    fn index(&self, index: usize) -> &Variable {
        &self.0[index]
    }
}
