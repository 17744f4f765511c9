//! Tensor kernels.
//!
//! These operate on plain [`DenseTensor`](crate::DenseTensor)s and know
//! nothing about autograd; the differentiable wrappers live in
//! [`crate::autograd`].

mod elementwise;
mod matmul;

pub use elementwise::{add, apply, apply_binary, mul, neg, scale, sub, sum};
pub use matmul::{matmul, transpose};
