//! Element-wise tensor operations.
//!
//! Binary operations require identical shapes; there is no broadcasting.

use crate::error::TensorError;
use crate::scalar::Scalar;
use crate::tensor::DenseTensor;

/// Apply a function to each element, returning a new tensor.
///
/// # Example
///
/// ```
/// use gradbridge::DenseTensor;
/// use gradbridge::operations::apply;
///
/// let t = DenseTensor::from_vec(vec![1.0, 4.0, 9.0], &[3]).unwrap();
/// let ts = apply(&t, |x: f64| x.sqrt());
/// assert_eq!(ts.data(), &[1.0, 2.0, 3.0]);
/// ```
pub fn apply<ElT: Scalar, F>(tensor: &DenseTensor<ElT>, f: F) -> DenseTensor<ElT>
where
    F: Fn(ElT) -> ElT,
{
    let mut out = tensor.clone();
    for x in out.data_mut() {
        *x = f(*x);
    }
    out
}

/// Apply a binary function combining two tensors element-wise.
///
/// Both tensors must have the same shape.
///
/// # Example
///
/// ```
/// use gradbridge::DenseTensor;
/// use gradbridge::operations::apply_binary;
///
/// let a = DenseTensor::from_vec(vec![1.0, 2.0, 3.0], &[3]).unwrap();
/// let b = DenseTensor::from_vec(vec![4.0, 5.0, 6.0], &[3]).unwrap();
/// let c = apply_binary(&a, &b, |x, y| x + y).unwrap();
/// assert_eq!(c.data(), &[5.0, 7.0, 9.0]);
/// ```
pub fn apply_binary<ElT: Scalar, F>(
    a: &DenseTensor<ElT>,
    b: &DenseTensor<ElT>,
    f: F,
) -> Result<DenseTensor<ElT>, TensorError>
where
    F: Fn(ElT, ElT) -> ElT,
{
    if a.shape() != b.shape() {
        return Err(TensorError::ShapeMismatch {
            lhs: a.shape().to_vec(),
            rhs: b.shape().to_vec(),
        });
    }
    let data: Vec<ElT> = a
        .data()
        .iter()
        .zip(b.data().iter())
        .map(|(&x, &y)| f(x, y))
        .collect();
    DenseTensor::from_vec(data, a.shape())
}

/// Element-wise sum `a + b`.
pub fn add<ElT: Scalar>(
    a: &DenseTensor<ElT>,
    b: &DenseTensor<ElT>,
) -> Result<DenseTensor<ElT>, TensorError> {
    apply_binary(a, b, |x, y| x + y)
}

/// Element-wise difference `a - b`.
pub fn sub<ElT: Scalar>(
    a: &DenseTensor<ElT>,
    b: &DenseTensor<ElT>,
) -> Result<DenseTensor<ElT>, TensorError> {
    apply_binary(a, b, |x, y| x - y)
}

/// Element-wise (Hadamard) product `a * b`.
pub fn mul<ElT: Scalar>(
    a: &DenseTensor<ElT>,
    b: &DenseTensor<ElT>,
) -> Result<DenseTensor<ElT>, TensorError> {
    apply_binary(a, b, |x, y| x * y)
}

/// Multiply all elements by a scalar, returning a new tensor.
///
/// # Example
///
/// ```
/// use gradbridge::DenseTensor;
/// use gradbridge::operations::scale;
///
/// let t = DenseTensor::from_vec(vec![1.0, 2.0, 3.0], &[3]).unwrap();
/// assert_eq!(scale(&t, 2.0).data(), &[2.0, 4.0, 6.0]);
/// ```
pub fn scale<ElT: Scalar>(tensor: &DenseTensor<ElT>, alpha: ElT) -> DenseTensor<ElT> {
    apply(tensor, |x| x * alpha)
}

/// Negate every element.
pub fn neg<ElT: Scalar>(tensor: &DenseTensor<ElT>) -> DenseTensor<ElT> {
    apply(tensor, |x| -x)
}

/// Sum of all elements.
pub fn sum<ElT: Scalar>(tensor: &DenseTensor<ElT>) -> ElT {
    tensor
        .data()
        .iter()
        .fold(ElT::zero(), |acc, &x| acc + x)
}
