//! Variables retained by a forward pass for use in backward.

use super::graph::Edge;
use super::variable::Variable;
use crate::tensor::DenseTensor;
use std::rc::Rc;

/// A variable saved for the backward pass.
///
/// Uses `Rc` so saving never copies tensor data; the computation graph is
/// thread-local, so `Arc` is not needed. Unpacking restores the original
/// graph edge, so a saved input still requires grad after unpacking.
#[derive(Debug, Clone)]
pub struct SavedVariable {
    data: Option<Rc<DenseTensor<f64>>>,
    grad_edge: Option<Edge>,
}

impl SavedVariable {
    pub fn new(variable: &Variable) -> Self {
        Self {
            data: variable.shared_tensor().cloned(),
            grad_edge: variable.grad_edge(),
        }
    }

    /// Reconstruct the saved variable.
    pub fn unpack(&self) -> Variable {
        match &self.data {
            Some(data) => Variable::from_edge(Rc::clone(data), self.grad_edge),
            None => Variable::undefined(),
        }
    }

    pub fn is_defined(&self) -> bool {
        self.data.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::clear_graph;

    #[test]
    fn test_saved_variable_shares_data() {
        clear_graph();

        let v = Variable::leaf(DenseTensor::from_vec(vec![1.0, 2.0], &[2]).unwrap());
        let saved = SavedVariable::new(&v);
        let unpacked = saved.unpack();

        assert!(Rc::ptr_eq(
            v.shared_tensor().unwrap(),
            unpacked.shared_tensor().unwrap()
        ));
        assert_eq!(unpacked.grad_edge(), v.grad_edge());
    }

    #[test]
    fn test_saved_undefined() {
        let saved = SavedVariable::new(&Variable::undefined());
        assert!(!saved.is_defined());
        assert!(!saved.unpack().is_defined());
    }
}
