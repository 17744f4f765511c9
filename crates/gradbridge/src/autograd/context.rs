//! Per-invocation state shared by a custom function's forward and backward.

use super::graph::NodeId;
use super::saved::SavedVariable;
use super::variable::VariableList;
use crate::error::AutogradError;
use std::collections::HashMap;

/// Primitive value stored in a context's scratch map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SavedValue {
    Int(i64),
    Double(f64),
    Bool(bool),
}

impl SavedValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            SavedValue::Int(_) => "int",
            SavedValue::Double(_) => "double",
            SavedValue::Bool(_) => "bool",
        }
    }
}

impl From<i64> for SavedValue {
    fn from(value: i64) -> Self {
        SavedValue::Int(value)
    }
}

impl From<i32> for SavedValue {
    fn from(value: i32) -> Self {
        SavedValue::Int(value.into())
    }
}

impl From<f64> for SavedValue {
    fn from(value: f64) -> Self {
        SavedValue::Double(value)
    }
}

impl From<bool> for SavedValue {
    fn from(value: bool) -> Self {
        SavedValue::Bool(value)
    }
}

fn type_mismatch(key: &str, expected: &'static str, found: Option<&SavedValue>) -> AutogradError {
    AutogradError::TypeMismatch {
        key: key.to_string(),
        expected,
        found: found.map_or("None", SavedValue::type_name),
    }
}

/// Autograd context of one custom-function invocation.
///
/// Created right before forward runs and owned by the graph node installed
/// for the invocation; it is dropped when that node is released.
#[derive(Debug)]
pub struct AutogradContext {
    saved_data: HashMap<String, SavedValue>,
    saved_variables: Vec<SavedVariable>,
    needs_input_grad: Vec<bool>,
    materialize_grads: bool,
    released: bool,
    node: Option<NodeId>,
}

impl AutogradContext {
    pub(crate) fn new(needs_input_grad: Vec<bool>) -> Self {
        Self {
            saved_data: HashMap::new(),
            saved_variables: Vec::new(),
            needs_input_grad,
            materialize_grads: true,
            released: false,
            node: None,
        }
    }

    /// Save tensors for backward, replacing anything saved before.
    pub fn save_for_backward(&mut self, variables: VariableList) {
        self.saved_variables = variables.iter().map(SavedVariable::new).collect();
    }

    /// Tensors saved by forward, in save order.
    ///
    /// # Errors
    ///
    /// `GraphReleased` once the owning node has been freed by a backward pass
    /// that did not retain the graph.
    pub fn get_saved_variables(&self) -> Result<VariableList, AutogradError> {
        if self.released {
            return Err(AutogradError::GraphReleased {
                node: self.node.map_or(0, |n| n.index()),
            });
        }
        Ok(self.saved_variables.iter().map(SavedVariable::unpack).collect())
    }

    /// Store a primitive value under `key`, overwriting any previous value.
    ///
    /// # Example
    ///
    /// ```
    /// # use gradbridge::autograd::{AutogradContext, Function, Variable, VariableList};
    /// # use gradbridge::DenseTensor;
    /// let inputs: VariableList = vec![Variable::new(DenseTensor::scalar(1.0))].into();
    /// Function::apply(
    ///     inputs,
    ///     |ctx: &mut AutogradContext, inputs: VariableList| {
    ///         ctx.set("scale", 2.5);
    ///         ctx.set("mode", 3);
    ///         assert_eq!(ctx.get_double("scale").unwrap(), 2.5);
    ///         assert_eq!(ctx.get_int("mode").unwrap(), 3);
    ///         assert!(ctx.get_bool("scale").is_err());
    ///         Ok(inputs)
    ///     },
    ///     |_ctx: &mut AutogradContext, grads: VariableList| Ok(grads),
    /// )
    /// .unwrap();
    /// ```
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<SavedValue>) {
        self.saved_data.insert(key.into(), value.into());
    }

    /// The scratch map.
    pub fn saved_data(&self) -> &HashMap<String, SavedValue> {
        &self.saved_data
    }

    pub fn saved_data_mut(&mut self) -> &mut HashMap<String, SavedValue> {
        &mut self.saved_data
    }

    /// Read an integer from the scratch map.
    ///
    /// # Errors
    ///
    /// `TypeMismatch` if the key is missing or holds another type.
    pub fn get_int(&self, key: &str) -> Result<i64, AutogradError> {
        match self.saved_data.get(key) {
            Some(SavedValue::Int(v)) => Ok(*v),
            found => Err(type_mismatch(key, "int", found)),
        }
    }

    /// Read a double from the scratch map.
    pub fn get_double(&self, key: &str) -> Result<f64, AutogradError> {
        match self.saved_data.get(key) {
            Some(SavedValue::Double(v)) => Ok(*v),
            found => Err(type_mismatch(key, "double", found)),
        }
    }

    /// Read a bool from the scratch map.
    pub fn get_bool(&self, key: &str) -> Result<bool, AutogradError> {
        match self.saved_data.get(key) {
            Some(SavedValue::Bool(v)) => Ok(*v),
            found => Err(type_mismatch(key, "bool", found)),
        }
    }

    /// Whether input `index` requires grad. Out-of-range indices are `false`.
    pub fn needs_input_grad(&self, index: usize) -> bool {
        self.needs_input_grad.get(index).copied().unwrap_or(false)
    }

    /// Number of inputs the function was applied to.
    pub fn num_inputs(&self) -> usize {
        self.needs_input_grad.len()
    }

    /// When `false`, outputs that receive no gradient are passed to backward
    /// as undefined instead of zeros.
    pub fn set_materialize_grads(&mut self, materialize: bool) {
        self.materialize_grads = materialize;
    }

    pub fn materialize_grads(&self) -> bool {
        self.materialize_grads
    }

    pub(crate) fn attach(&mut self, node: NodeId) {
        self.node = Some(node);
    }

    /// Drop saved variables; they can no longer be read.
    pub(crate) fn release_variables(&mut self) {
        self.saved_variables.clear();
        self.released = true;
    }
}
