//! Matrix products using faer.
//!
//! Both gradbridge and faer store data column-major, so 2-D tensors are
//! viewed as faer matrices without copying.

use faer::linalg::matmul::matmul as faer_matmul;
use faer::{Accum, MatMut, MatRef, Par};

use crate::error::TensorError;
use crate::scalar::Scalar;
use crate::tensor::DenseTensor;

fn matrix_dims<ElT: Scalar>(t: &DenseTensor<ElT>) -> Result<(usize, usize), TensorError> {
    match t.shape() {
        [rows, cols] => Ok((*rows, *cols)),
        shape => Err(TensorError::RankMismatch {
            expected: 2,
            actual: shape.len(),
        }),
    }
}

/// Matrix product `a @ b` of two rank-2 tensors.
///
/// # Example
///
/// ```
/// use gradbridge::DenseTensor;
/// use gradbridge::operations::matmul;
///
/// let a: DenseTensor<f64> = DenseTensor::ones(&[2, 3]);
/// let b: DenseTensor<f64> = DenseTensor::ones(&[3, 4]);
/// let c = matmul(&a, &b).unwrap();
/// assert_eq!(c.shape(), &[2, 4]);
/// assert_eq!(c.data()[0], 3.0);
/// ```
pub fn matmul<ElT: Scalar>(
    a: &DenseTensor<ElT>,
    b: &DenseTensor<ElT>,
) -> Result<DenseTensor<ElT>, TensorError> {
    let (m, k) = matrix_dims(a)?;
    let (k2, n) = matrix_dims(b)?;
    if k != k2 {
        return Err(TensorError::ShapeMismatch {
            lhs: a.shape().to_vec(),
            rhs: b.shape().to_vec(),
        });
    }

    let a_mat = MatRef::from_column_major_slice(a.data(), m, k);
    let b_mat = MatRef::from_column_major_slice(b.data(), k, n);

    let mut c = DenseTensor::<ElT>::zeros(&[m, n]);
    let mut c_mat = MatMut::from_column_major_slice_mut(c.data_mut(), m, n);

    // C = 1 * A * B, overwriting C
    faer_matmul(c_mat.as_mut(), Accum::Replace, a_mat, b_mat, ElT::one(), Par::Seq);

    Ok(c)
}

/// Transpose of a rank-2 tensor.
pub fn transpose<ElT: Scalar>(t: &DenseTensor<ElT>) -> Result<DenseTensor<ElT>, TensorError> {
    let (rows, cols) = matrix_dims(t)?;
    let src = t.data();
    let mut data = Vec::with_capacity(src.len());
    // Column j of the result is row j of the source.
    for i in 0..rows {
        for j in 0..cols {
            data.push(src[i + j * rows]);
        }
    }
    DenseTensor::from_vec(data, &[cols, rows])
}
