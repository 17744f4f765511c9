//! gradbridge - dense tensors with reverse-mode autograd and user-defined
//! gradient rules.
//!
//! This crate provides a small column-major tensor type, the kernels needed
//! to differentiate through it, and an autograd engine that foreign code can
//! extend with its own forward/backward pairs and gradient hooks. The C ABI
//! lives in the `gradbridge-capi` crate.
//!
//! # Architecture
//!
//! ```text
//! Level 1: Differentiable API (autograd module)
//!     → Variable ops, Function::apply, register_hook, backward
//!
//! Level 2: Tensor kernels (operations module)
//!     → elementwise, sum, matmul (faer)
//!
//! Level 3: Storage
//!     → DenseTensor (contiguous, column-major)
//! ```
//!
//! # Example
//!
//! ```
//! use gradbridge::DenseTensor;
//! use gradbridge::autograd::{Variable, clear_graph};
//!
//! clear_graph();
//!
//! // f(a, b) = sum(a + b + a * b)
//! let a = Variable::leaf(DenseTensor::from_vec(vec![1.0, 2.0], &[2]).unwrap());
//! let b = Variable::leaf(DenseTensor::from_vec(vec![3.0, 4.0], &[2]).unwrap());
//! let f = a.add(&b).unwrap().add(&a.mul(&b).unwrap()).unwrap().sum().unwrap();
//! f.backward().unwrap();
//!
//! // df/da = 1 + b, df/db = 1 + a
//! assert_eq!(a.grad().unwrap().data(), &[4.0, 5.0]);
//! assert_eq!(b.grad().unwrap().data(), &[2.0, 3.0]);
//! ```

pub mod autograd;
pub mod error;
pub mod operations;
pub mod random;
pub mod scalar;
pub mod tensor;

pub use error::{AutogradError, TensorError};
pub use scalar::Scalar;
pub use tensor::DenseTensor;
