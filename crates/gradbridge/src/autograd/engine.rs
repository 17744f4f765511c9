//! Backward pass execution for reverse-mode automatic differentiation.

use super::grad_mode::GradModeGuard;
use super::gradients::GradientBuffer;
use super::graph::{ComputationGraph, NodeId, with_graph};
use super::hooks::run_hooks;
use super::variable::Variable;
use crate::error::AutogradError;
use crate::tensor::DenseTensor;
use log::{debug, trace};
use std::collections::{BinaryHeap, HashMap};

/// Options of a backward pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackwardOptions {
    /// Keep every traversed node (and what it saved) so the same graph can
    /// be traversed again.
    pub retain_graph: bool,
}

impl BackwardOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retain_graph(mut self, retain: bool) -> Self {
        self.retain_graph = retain;
        self
    }
}

/// Per-node bookkeeping gathered before execution.
struct GraphTask {
    /// Number of not-yet-executed consumers of each node's outputs.
    dependencies: HashMap<NodeId, usize>,
    num_outputs: HashMap<NodeId, usize>,
}

impl GraphTask {
    fn outputs_of(&self, id: NodeId) -> usize {
        self.num_outputs.get(&id).copied().unwrap_or(1)
    }
}

/// Execute backward pass from `root`.
///
/// Gradients are accumulated into the leaves reachable from `root` (read
/// them with [`Variable::grad`]). Each node runs exactly once, with the sum
/// of the gradients of all paths into it, after every node that consumes
/// its outputs.
///
/// # Arguments
/// * `root` - Tensor to differentiate
/// * `grad_output` - Gradient of `root`; `None` means ones, which is only
///   allowed for single-element roots
/// * `options` - See [`BackwardOptions`]
///
/// # Errors
/// Returns error if:
/// - `root` is undefined or does not require grad
/// - `grad_output` is `None` and `root` has more than one element
/// - `grad_output` does not have the shape of `root`
/// - the traversal reaches a node released by an earlier backward pass
/// - a gradient function or hook fails
///
/// # Example
///
/// ```
/// use gradbridge::DenseTensor;
/// use gradbridge::autograd::{BackwardOptions, Variable, backward, clear_graph};
///
/// clear_graph();
///
/// let a = Variable::leaf(DenseTensor::from_vec(vec![1.0, 2.0], &[2]).unwrap());
/// let b = Variable::leaf(DenseTensor::from_vec(vec![3.0, 4.0], &[2]).unwrap());
/// let loss = a.mul(&b).unwrap().sum().unwrap();
///
/// backward(&loss, None, BackwardOptions::default()).unwrap();
///
/// assert_eq!(a.grad().unwrap().data(), &[3.0, 4.0]);
/// assert_eq!(b.grad().unwrap().data(), &[1.0, 2.0]);
/// ```
pub fn backward(
    root: &Variable,
    grad_output: Option<&DenseTensor<f64>>,
    options: BackwardOptions,
) -> Result<(), AutogradError> {
    let root_tensor = root.tensor()?;
    let root_edge = root.grad_edge().ok_or(AutogradError::DoesNotRequireGrad)?;

    let seed = match grad_output {
        Some(grad) => {
            if grad.shape() != root_tensor.shape() {
                return Err(AutogradError::GradShapeMismatch {
                    origin: "grad_output".to_string(),
                    expected: root_tensor.shape().to_vec(),
                    actual: grad.shape().to_vec(),
                });
            }
            grad.clone()
        }
        None => {
            if root_tensor.len() != 1 {
                return Err(AutogradError::NonScalarRoot {
                    len: root_tensor.len(),
                });
            }
            DenseTensor::ones(root_tensor.shape())
        }
    };

    let mut task = with_graph(|g| collect_dependencies(g, root_edge.node))?;
    debug!(
        "backward from node {} over {} nodes (retain_graph = {})",
        root_edge.node.index(),
        task.num_outputs.len(),
        options.retain_graph
    );

    // Gradient functions must not record new nodes.
    let _guard = GradModeGuard::new(false);

    let mut buffer = GradientBuffer::new();
    let root_outputs = task.outputs_of(root_edge.node);
    buffer.accumulate(root_edge.node, root_edge.input_nr, root_outputs, seed)?;

    // Node ids follow creation order, so the max-heap runs consumers before
    // their producers.
    let mut ready = BinaryHeap::from([root_edge.node]);
    let mut executed = 0usize;

    while let Some(node_id) = ready.pop() {
        let num_outputs = task.outputs_of(node_id);
        let grads = run_slot_hooks(node_id, buffer.take(node_id, num_outputs))?;

        let (is_leaf, grad_fn) = with_graph(|g| {
            g.get_node(node_id)
                .map(|n| (n.is_leaf(), n.grad_fn()))
                .ok_or(AutogradError::GraphReleased {
                    node: node_id.index(),
                })
        })?;

        if is_leaf {
            if let Some(grad) = grads.into_iter().next().flatten() {
                trace!("accumulating gradient into leaf {}", node_id.index());
                with_graph(|g| match g.get_node_mut(node_id) {
                    Some(node) => node.accumulate_grad(grad),
                    None => Err(AutogradError::GraphReleased {
                        node: node_id.index(),
                    }),
                })?;
            }
            continue;
        }

        let grad_fn = grad_fn.ok_or(AutogradError::GraphReleased {
            node: node_id.index(),
        })?;
        let next_edges = grad_fn.next_edges().to_vec();

        if grads.iter().any(Option::is_some) {
            trace!("running {} (node {})", grad_fn.name(), node_id.index());
            let input_grads = grad_fn.apply(grads)?;
            if input_grads.len() != next_edges.len() {
                return Err(AutogradError::ArityMismatch {
                    function: grad_fn.name().to_string(),
                    expected: next_edges.len(),
                    actual: input_grads.len(),
                });
            }
            for (edge, grad) in next_edges.iter().zip(input_grads) {
                if let (Some(edge), Some(grad)) = (edge, grad) {
                    let target_outputs = task.outputs_of(edge.node);
                    buffer.accumulate(edge.node, edge.input_nr, target_outputs, grad)?;
                }
            }
            executed += 1;
        } else {
            trace!("skipping {} (node {}): no gradient", grad_fn.name(), node_id.index());
        }

        for edge in next_edges.iter().flatten() {
            if let Some(count) = task.dependencies.get_mut(&edge.node) {
                *count -= 1;
                if *count == 0 {
                    ready.push(edge.node);
                }
            }
        }

        if !options.retain_graph {
            drop(grad_fn);
            with_graph(|g| {
                if let Some(node) = g.get_node_mut(node_id) {
                    node.release();
                }
            });
        }
    }

    debug!("backward finished: {} gradient functions executed", executed);
    Ok(())
}

/// Count, for every node reachable from `root`, how many edges point at it.
fn collect_dependencies(
    graph: &ComputationGraph,
    root: NodeId,
) -> Result<GraphTask, AutogradError> {
    let mut dependencies = HashMap::new();
    let mut num_outputs = HashMap::new();
    let mut stack = vec![root];

    dependencies.insert(root, 0);
    while let Some(id) = stack.pop() {
        if num_outputs.contains_key(&id) {
            continue;
        }
        let node = graph
            .get_node(id)
            .ok_or(AutogradError::GraphReleased { node: id.index() })?;
        if node.is_released() {
            return Err(AutogradError::GraphReleased { node: id.index() });
        }
        num_outputs.insert(id, node.num_outputs());

        if let Some(grad_fn) = node.grad_fn() {
            for edge in grad_fn.next_edges().iter().flatten() {
                *dependencies.entry(edge.node).or_insert(0) += 1;
                if !num_outputs.contains_key(&edge.node) {
                    stack.push(edge.node);
                }
            }
        }
    }

    Ok(GraphTask {
        dependencies,
        num_outputs,
    })
}

/// Run the hooks registered on each output slot of a node over its gradient.
fn run_slot_hooks(
    node_id: NodeId,
    grads: Vec<Option<DenseTensor<f64>>>,
) -> Result<Vec<Option<DenseTensor<f64>>>, AutogradError> {
    grads
        .into_iter()
        .enumerate()
        .map(|(slot, grad)| {
            let Some(grad) = grad else {
                return Ok(None);
            };
            // Clone the hooks out so no graph borrow is held while they run.
            let hooks = with_graph(|g| {
                g.get_node(node_id)
                    .map(|n| n.active_hooks(slot))
                    .unwrap_or_default()
            });
            if hooks.is_empty() {
                Ok(Some(grad))
            } else {
                trace!(
                    "running {} hooks on node {} output {}",
                    hooks.len(),
                    node_id.index(),
                    slot
                );
                run_hooks(&hooks, grad).map(Some)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::graph::{Edge, EdgeList, GradFn};
    use crate::autograd::{clear_graph, is_grad_enabled};
    use crate::operations::scale;
    use std::cell::Cell;
    use std::rc::Rc;

    // GradFn that scales gradient
    #[derive(Debug)]
    struct ScaleBackward {
        next_edges: EdgeList,
        scale: f64,
    }

    impl GradFn for ScaleBackward {
        fn name(&self) -> &str {
            "ScaleBackward"
        }

        fn next_edges(&self) -> &[Option<Edge>] {
            &self.next_edges
        }

        fn apply(
            &self,
            grad_outputs: Vec<Option<DenseTensor<f64>>>,
        ) -> Result<Vec<Option<DenseTensor<f64>>>, AutogradError> {
            assert!(!is_grad_enabled());
            let grad = grad_outputs.into_iter().next().flatten();
            Ok(vec![grad.map(|g| scale(&g, self.scale))])
        }
    }

    // GradFn that returns one gradient too many
    #[derive(Debug)]
    struct TooMany {
        next_edges: EdgeList,
    }

    impl GradFn for TooMany {
        fn name(&self) -> &str {
            "TooMany"
        }

        fn next_edges(&self) -> &[Option<Edge>] {
            &self.next_edges
        }

        fn apply(
            &self,
            _grad_outputs: Vec<Option<DenseTensor<f64>>>,
        ) -> Result<Vec<Option<DenseTensor<f64>>>, AutogradError> {
            Ok(vec![None, None])
        }
    }

    fn scaled(input: &Variable, factor: f64) -> Variable {
        let grad_fn = ScaleBackward {
            next_edges: [input.grad_edge()].into_iter().collect(),
            scale: factor,
        };
        let node = with_graph(|g| g.create_node(Rc::new(grad_fn), 1));
        let data = scale(input.tensor().unwrap(), factor);
        Variable::from_edge(Rc::new(data), Some(Edge::new(node, 0)))
    }

    #[test]
    fn test_backward_single_leaf() {
        clear_graph();

        let leaf = Variable::leaf(DenseTensor::scalar(1.0));
        let out = scaled(&leaf, 1.0);

        backward(&out, None, BackwardOptions::default()).unwrap();

        assert_eq!(leaf.grad().unwrap().data(), &[1.0]);
        assert!(is_grad_enabled());
    }

    #[test]
    fn test_backward_chain() {
        clear_graph();

        // leaf -> scale(2) -> scale(3)
        let leaf = Variable::leaf(DenseTensor::scalar(1.0));
        let out = scaled(&scaled(&leaf, 2.0), 3.0);

        backward(&out, None, BackwardOptions::default()).unwrap();

        // Gradient should be 1.0 * 3.0 * 2.0 = 6.0
        assert_eq!(leaf.grad().unwrap().data(), &[6.0]);
    }

    #[test]
    fn test_backward_diamond_runs_each_node_once() {
        clear_graph();

        let leaf = Variable::leaf(DenseTensor::scalar(1.0));
        let mid = scaled(&leaf, 2.0);
        let counter = Rc::new(Cell::new(0));
        let seen = Rc::clone(&counter);
        mid.register_hook(move |g: DenseTensor<f64>| -> Result<DenseTensor<f64>, AutogradError> {
            seen.set(seen.get() + 1);
            Ok(g)
        })
        .unwrap();

        let out = mid.add(&mid).unwrap();
        backward(&out, None, BackwardOptions::default()).unwrap();

        // Two paths into `mid`, summed before its hook runs.
        assert_eq!(counter.get(), 1);
        assert_eq!(leaf.grad().unwrap().data(), &[4.0]);
    }

    #[test]
    fn test_backward_explicit_grad_output() {
        clear_graph();

        let leaf = Variable::leaf(DenseTensor::ones(&[3]));
        let out = scaled(&leaf, 2.0);
        let seed = DenseTensor::from_vec(vec![1.0, 2.0, 3.0], &[3]).unwrap();

        backward(&out, Some(&seed), BackwardOptions::default()).unwrap();
        assert_eq!(leaf.grad().unwrap().data(), &[2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_backward_non_scalar_error() {
        clear_graph();

        let leaf = Variable::leaf(DenseTensor::ones(&[3]));
        let out = scaled(&leaf, 1.0);

        assert_eq!(
            backward(&out, None, BackwardOptions::default()),
            Err(AutogradError::NonScalarRoot { len: 3 })
        );
        assert!(matches!(
            backward(&out, Some(&DenseTensor::ones(&[2])), BackwardOptions::default()),
            Err(AutogradError::GradShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_backward_not_in_graph_error() {
        clear_graph();

        let constant = Variable::new(DenseTensor::scalar(1.0));
        assert_eq!(
            backward(&constant, None, BackwardOptions::default()),
            Err(AutogradError::DoesNotRequireGrad)
        );
        assert_eq!(
            backward(&Variable::undefined(), None, BackwardOptions::default()),
            Err(AutogradError::UndefinedTensor)
        );
    }

    #[test]
    fn test_second_backward_needs_retain_graph() {
        clear_graph();

        let leaf = Variable::leaf(DenseTensor::scalar(1.0));
        let out = scaled(&leaf, 2.0);

        let retain = BackwardOptions::new().retain_graph(true);
        backward(&out, None, retain).unwrap();
        backward(&out, None, BackwardOptions::default()).unwrap();
        assert_eq!(leaf.grad().unwrap().data(), &[4.0]);

        let node = out.node_id().unwrap().index();
        assert_eq!(
            backward(&out, None, BackwardOptions::default()),
            Err(AutogradError::GraphReleased { node })
        );
    }

    #[test]
    fn test_arity_mismatch_aborts() {
        clear_graph();

        let leaf = Variable::leaf(DenseTensor::scalar(1.0));
        let grad_fn = TooMany {
            next_edges: [leaf.grad_edge()].into_iter().collect(),
        };
        let node = with_graph(|g| g.create_node(Rc::new(grad_fn), 1));
        let out = Variable::from_edge(Rc::new(DenseTensor::scalar(1.0)), Some(Edge::new(node, 0)));

        assert_eq!(
            backward(&out, None, BackwardOptions::default()),
            Err(AutogradError::ArityMismatch {
                function: "TooMany".to_string(),
                expected: 1,
                actual: 2,
            })
        );
        assert!(leaf.grad().is_none());
        assert!(is_grad_enabled());
    }
}
