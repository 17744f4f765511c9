//! Gradient buffers used while a backward pass is running.

use super::graph::NodeId;
use crate::error::AutogradError;
use crate::operations::add;
use crate::tensor::DenseTensor;
use std::collections::HashMap;

/// Pending gradients keyed by node, one slot per node output.
///
/// Several paths into the same output slot are summed in place, so every
/// node sees the total gradient of each of its outputs exactly once.
#[derive(Debug, Default)]
pub struct GradientBuffer {
    grads: HashMap<NodeId, Vec<Option<DenseTensor<f64>>>>,
}

impl GradientBuffer {
    /// Create empty gradient buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate gradient for output `slot` of a node with `num_outputs`
    /// outputs.
    ///
    /// # Errors
    ///
    /// `Tensor(ShapeMismatch)` if a gradient already in the slot has another
    /// shape.
    pub fn accumulate(
        &mut self,
        id: NodeId,
        slot: usize,
        num_outputs: usize,
        grad: DenseTensor<f64>,
    ) -> Result<(), AutogradError> {
        let slots = self
            .grads
            .entry(id)
            .or_insert_with(|| vec![None; num_outputs]);
        if slot >= slots.len() {
            return Err(AutogradError::OutOfRange {
                index: slot,
                len: slots.len(),
            });
        }
        slots[slot] = Some(match slots[slot].take() {
            Some(existing) => add(&existing, &grad)?,
            None => grad,
        });
        Ok(())
    }

    /// Get the gradient of one output slot.
    pub fn get(&self, id: NodeId, slot: usize) -> Option<&DenseTensor<f64>> {
        self.grads.get(&id)?.get(slot)?.as_ref()
    }

    /// Remove and return every slot of a node (for passing to its backward
    /// function). Nodes that never received a gradient yield all `None`.
    pub fn take(&mut self, id: NodeId, num_outputs: usize) -> Vec<Option<DenseTensor<f64>>> {
        self.grads
            .remove(&id)
            .unwrap_or_else(|| vec![None; num_outputs])
    }

    /// Check if any gradient is pending for node.
    pub fn contains(&self, id: NodeId) -> bool {
        self.grads.contains_key(&id)
    }

    /// Number of nodes with pending gradients.
    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }
}
