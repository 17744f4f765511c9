//! Computation graph for reverse-mode automatic differentiation.

use super::hooks::GradHook;
use crate::error::AutogradError;
use crate::operations::add;
use crate::tensor::DenseTensor;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::Rc;

/// Unique identifier for a node in the computation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    /// Get the internal index.
    pub fn index(&self) -> usize {
        self.0
    }

    /// Create a NodeId for testing purposes.
    #[cfg(test)]
    pub(crate) fn new_for_test(index: usize) -> Self {
        Self(index)
    }
}

/// Where a gradient flows: output slot `input_nr` of `node`.
///
/// A tensor produced by a node with several outputs is identified by the
/// node plus the position of the tensor among those outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    pub node: NodeId,
    pub input_nr: usize,
}

impl Edge {
    pub fn new(node: NodeId, input_nr: usize) -> Self {
        Self { node, input_nr }
    }
}

/// Next edges of a node, one per input. `None` marks an input that does not
/// require grad.
pub type EdgeList = SmallVec<[Option<Edge>; 2]>;

/// Gradient rule of a graph node.
///
/// `apply` receives one gradient slot per node output and returns one slot
/// per entry of `next_edges`, in the same order.
pub trait GradFn: Debug {
    /// Name used in logs and error messages.
    fn name(&self) -> &str;

    /// Edges to the nodes that produced this node's inputs.
    fn next_edges(&self) -> &[Option<Edge>];

    /// Compute input gradients from output gradients.
    fn apply(
        &self,
        grad_outputs: Vec<Option<DenseTensor<f64>>>,
    ) -> Result<Vec<Option<DenseTensor<f64>>>, AutogradError>;

    /// Free state kept for backward once the node will not run again.
    fn release_variables(&self) {}
}

/// A node in the computation graph.
pub struct Node {
    id: NodeId,
    /// Backward function; `None` for leaves and for released nodes.
    grad_fn: Option<Rc<dyn GradFn>>,
    is_leaf: bool,
    num_outputs: usize,
    /// Accumulated gradient (leaves only).
    grad: Option<DenseTensor<f64>>,
    /// Registered hooks per output slot; removed hooks leave a `None` hole so
    /// positions stay stable.
    hooks: Vec<Vec<Option<Rc<dyn GradHook>>>>,
}

impl Node {
    fn new(id: NodeId, grad_fn: Option<Rc<dyn GradFn>>, num_outputs: usize) -> Self {
        Self {
            id,
            is_leaf: grad_fn.is_none(),
            grad_fn,
            num_outputs,
            grad: None,
            hooks: (0..num_outputs).map(|_| Vec::new()).collect(),
        }
    }

    /// Get node ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get backward function (shared so it can run without a graph borrow).
    pub fn grad_fn(&self) -> Option<Rc<dyn GradFn>> {
        self.grad_fn.clone()
    }

    /// Leaves accumulate gradients instead of propagating them.
    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    /// A non-leaf whose backward function has been freed.
    pub fn is_released(&self) -> bool {
        !self.is_leaf && self.grad_fn.is_none()
    }

    pub fn num_outputs(&self) -> usize {
        self.num_outputs
    }

    /// Accumulated gradient of a leaf.
    pub fn grad(&self) -> Option<&DenseTensor<f64>> {
        self.grad.as_ref()
    }

    pub(crate) fn accumulate_grad(&mut self, grad: DenseTensor<f64>) -> Result<(), AutogradError> {
        self.grad = Some(match self.grad.take() {
            Some(existing) => add(&existing, &grad)?,
            None => grad,
        });
        Ok(())
    }

    pub(crate) fn clear_grad(&mut self) {
        self.grad = None;
    }

    /// Register a hook on one output slot; returns its position.
    pub(crate) fn add_hook(
        &mut self,
        output_nr: usize,
        hook: Rc<dyn GradHook>,
    ) -> Result<usize, AutogradError> {
        let len = self.hooks.len();
        let slot = self
            .hooks
            .get_mut(output_nr)
            .ok_or(AutogradError::OutOfRange {
                index: output_nr,
                len,
            })?;
        slot.push(Some(hook));
        Ok(slot.len() - 1)
    }

    pub(crate) fn remove_hook(
        &mut self,
        output_nr: usize,
        token: usize,
    ) -> Result<(), AutogradError> {
        self.hooks
            .get_mut(output_nr)
            .and_then(|slot| slot.get_mut(token))
            .and_then(Option::take)
            .map(|_| ())
            .ok_or(AutogradError::InvalidHookToken { token })
    }

    /// Hooks still registered on an output slot, in registration order.
    pub(crate) fn active_hooks(&self, output_nr: usize) -> Vec<Rc<dyn GradHook>> {
        self.hooks
            .get(output_nr)
            .map(|slot| slot.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop the backward function and everything it saved.
    pub(crate) fn release(&mut self) {
        if let Some(grad_fn) = self.grad_fn.take() {
            grad_fn.release_variables();
        }
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("grad_fn", &self.grad_fn.as_ref().map(|g| g.name().to_string()))
            .field("is_leaf", &self.is_leaf)
            .field("num_outputs", &self.num_outputs)
            .field("has_grad", &self.grad.is_some())
            .finish()
    }
}

/// Thread-local computation graph.
///
/// Stores the DAG of tensor operations for reverse-mode AD.
/// Each thread has its own independent graph.
///
/// The node arena only grows. Releasing a node after backward drops its
/// backward function and saved state but keeps the slot, so `NodeId`s stay
/// valid until [`clear`](Self::clear).
pub struct ComputationGraph {
    nodes: Vec<Node>,
}

impl ComputationGraph {
    /// Create a new empty computation graph.
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Create a leaf node (a user-created tensor that requires grad).
    pub fn create_leaf(&mut self) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::new(id, None, 1));
        id
    }

    /// Create a computed node with a backward function.
    pub fn create_node(&mut self, grad_fn: Rc<dyn GradFn>, num_outputs: usize) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::new(id, Some(grad_fn), num_outputs));
        id
    }

    /// Get node by ID.
    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub fn get_node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.index())
    }

    /// Get all nodes.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Drop every node. Variables created before the clear must not be used
    /// for autograd afterwards.
    pub fn clear(&mut self) {
        for node in self.nodes.iter_mut() {
            node.release();
        }
        self.nodes.clear();
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if graph is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for ComputationGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for ComputationGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputationGraph")
            .field("num_nodes", &self.nodes.len())
            .finish()
    }
}

thread_local! {
    static GRAPH: RefCell<ComputationGraph> = RefCell::new(ComputationGraph::new());
}

/// Access the thread-local computation graph.
///
/// The borrow lasts only for the closure; never call user code (backward
/// functions, hooks) from inside it.
pub fn with_graph<R>(f: impl FnOnce(&mut ComputationGraph) -> R) -> R {
    GRAPH.with(|g| f(&mut g.borrow_mut()))
}

/// Clear the thread-local computation graph.
pub fn clear_graph() {
    with_graph(|g| g.clear());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct PassThrough {
        next_edges: EdgeList,
    }

    impl GradFn for PassThrough {
        fn name(&self) -> &str {
            "PassThrough"
        }

        fn next_edges(&self) -> &[Option<Edge>] {
            &self.next_edges
        }

        fn apply(
            &self,
            grad_outputs: Vec<Option<DenseTensor<f64>>>,
        ) -> Result<Vec<Option<DenseTensor<f64>>>, AutogradError> {
            let grad = grad_outputs.into_iter().next().flatten();
            Ok(self.next_edges.iter().map(|_| grad.clone()).collect())
        }
    }

    #[test]
    fn test_create_leaf() {
        let mut graph = ComputationGraph::new();

        let a = graph.create_leaf();
        let b = graph.create_leaf();

        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(graph.len(), 2);

        let node = graph.get_node(a).unwrap();
        assert!(node.is_leaf());
        assert!(node.grad_fn().is_none());
        assert!(!node.is_released());
    }

    #[test]
    fn test_create_node_with_grad_fn() {
        let mut graph = ComputationGraph::new();

        let a = graph.create_leaf();
        let b = graph.create_leaf();
        let grad_fn = PassThrough {
            next_edges: [Some(Edge::new(a, 0)), Some(Edge::new(b, 0))]
                .into_iter()
                .collect(),
        };
        let c = graph.create_node(Rc::new(grad_fn), 1);

        let node = graph.get_node(c).unwrap();
        assert!(!node.is_leaf());
        let edges = node.grad_fn().unwrap().next_edges().to_vec();
        assert_eq!(edges, vec![Some(Edge::new(a, 0)), Some(Edge::new(b, 0))]);
    }

    #[test]
    fn test_release_node() {
        let mut graph = ComputationGraph::new();
        let a = graph.create_leaf();
        let c = graph.create_node(
            Rc::new(PassThrough {
                next_edges: [Some(Edge::new(a, 0))].into_iter().collect(),
            }),
            1,
        );

        graph.get_node_mut(c).unwrap().release();
        assert!(graph.get_node(c).unwrap().is_released());

        // Leaves are never considered released.
        graph.get_node_mut(a).unwrap().release();
        assert!(!graph.get_node(a).unwrap().is_released());
    }

    #[test]
    fn test_accumulate_grad() {
        let mut graph = ComputationGraph::new();
        let a = graph.create_leaf();
        let node = graph.get_node_mut(a).unwrap();

        node.accumulate_grad(DenseTensor::from_vec(vec![1.0, 2.0], &[2]).unwrap())
            .unwrap();
        node.accumulate_grad(DenseTensor::from_vec(vec![3.0, 4.0], &[2]).unwrap())
            .unwrap();
        assert_eq!(node.grad().unwrap().data(), &[4.0, 6.0]);

        assert!(node.accumulate_grad(DenseTensor::ones(&[3])).is_err());

        node.clear_grad();
        assert!(node.grad().is_none());
    }

    #[test]
    fn test_hook_positions_are_stable() {
        let mut graph = ComputationGraph::new();
        let a = graph.create_leaf();
        let node = graph.get_node_mut(a).unwrap();

        let identity = |g: DenseTensor<f64>| -> Result<DenseTensor<f64>, AutogradError> { Ok(g) };
        let first = node.add_hook(0, Rc::new(identity)).unwrap();
        let second = node.add_hook(0, Rc::new(identity)).unwrap();
        assert_eq!((first, second), (0, 1));

        node.remove_hook(0, first).unwrap();
        assert_eq!(node.active_hooks(0).len(), 1);
        assert_eq!(
            node.remove_hook(0, first),
            Err(AutogradError::InvalidHookToken { token: 0 })
        );
        assert_eq!(
            node.remove_hook(0, 7),
            Err(AutogradError::InvalidHookToken { token: 7 })
        );

        let third = node.add_hook(0, Rc::new(identity)).unwrap();
        assert_eq!(third, 2);
    }

    #[test]
    fn test_thread_local_graph() {
        clear_graph();

        with_graph(|g| {
            g.create_leaf();
            g.create_leaf();
        });
        assert_eq!(with_graph(|g| g.len()), 2);

        clear_graph();
        assert!(with_graph(|g| g.is_empty()));
    }
}
