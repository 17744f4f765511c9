//! Dense n-dimensional tensor.
//!
//! Data is stored contiguously in column-major order, matching faer, so
//! 2-D tensors can be viewed as faer matrices without copying. A tensor
//! with shape `[]` is a scalar holding one element.

use crate::error::TensorError;
use crate::scalar::Scalar;

/// Dense tensor with owned, contiguous, column-major storage.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseTensor<ElT: Scalar> {
    data: Vec<ElT>,
    shape: Vec<usize>,
}

/// Number of elements implied by a shape. The empty shape is a scalar.
///
/// # Errors
///
/// `TensorError::ShapeOverflow` if the product does not fit in `usize`.
pub fn shape_len(shape: &[usize]) -> Result<usize, TensorError> {
    shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| TensorError::ShapeOverflow {
            shape: shape.to_vec(),
        })
}

impl<ElT: Scalar> DenseTensor<ElT> {
    /// Create a new tensor with the given shape, zero-initialized.
    ///
    /// # Examples
    ///
    /// ```
    /// use gradbridge::DenseTensor;
    ///
    /// let t: DenseTensor<f64> = DenseTensor::zeros(&[2, 3, 4]);
    /// assert_eq!(t.shape(), &[2, 3, 4]);
    /// assert_eq!(t.len(), 24);
    /// ```
    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, ElT::zero())
    }

    /// Create a tensor filled with ones.
    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, ElT::one())
    }

    /// Create a tensor with every element set to `value`.
    ///
    /// # Panics
    ///
    /// If the shape's element count overflows or cannot be allocated. Use
    /// [`try_full`](Self::try_full) for shapes from untrusted input.
    pub fn full(shape: &[usize], value: ElT) -> Self {
        Self {
            data: vec![value; shape.iter().product()],
            shape: shape.to_vec(),
        }
    }

    /// Fallible [`full`](Self::full).
    ///
    /// # Errors
    ///
    /// `ShapeOverflow` if the element count overflows, `AllocationFailed`
    /// if the storage cannot be reserved.
    ///
    /// # Examples
    ///
    /// ```
    /// use gradbridge::{DenseTensor, TensorError};
    ///
    /// let t = DenseTensor::try_full(&[2, 2], 0.5).unwrap();
    /// assert_eq!(t.data(), &[0.5; 4]);
    ///
    /// let err = DenseTensor::try_full(&[usize::MAX, 2], 0.0).unwrap_err();
    /// assert!(matches!(err, TensorError::ShapeOverflow { .. }));
    /// ```
    pub fn try_full(shape: &[usize], value: ElT) -> Result<Self, TensorError> {
        let len = shape_len(shape)?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| TensorError::AllocationFailed { len })?;
        data.resize(len, value);
        Ok(Self {
            data,
            shape: shape.to_vec(),
        })
    }

    pub fn try_zeros(shape: &[usize]) -> Result<Self, TensorError> {
        Self::try_full(shape, ElT::zero())
    }

    pub fn try_ones(shape: &[usize]) -> Result<Self, TensorError> {
        Self::try_full(shape, ElT::one())
    }

    /// Create a rank-0 tensor holding a single value.
    pub fn scalar(value: ElT) -> Self {
        Self {
            data: vec![value],
            shape: Vec::new(),
        }
    }

    /// Create tensor from data and shape.
    ///
    /// Data is expected to be in column-major order.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::LengthMismatch` if data length doesn't match shape,
    /// `TensorError::ShapeOverflow` if the shape's element count overflows.
    ///
    /// # Examples
    ///
    /// ```
    /// use gradbridge::DenseTensor;
    ///
    /// let t = DenseTensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    /// assert_eq!(t.shape(), &[2, 3]);
    /// assert_eq!(t.get_linear(1), Some(&2.0));
    ///
    /// assert!(DenseTensor::from_vec(vec![1.0, 2.0], &[3]).is_err());
    /// ```
    pub fn from_vec(data: Vec<ElT>, shape: &[usize]) -> Result<Self, TensorError> {
        let expected = shape_len(shape)?;
        if data.len() != expected {
            return Err(TensorError::LengthMismatch {
                shape: shape.to_vec(),
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            shape: shape.to_vec(),
        })
    }

    /// Get the shape of the tensor.
    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the rank (number of dimensions).
    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Get total number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if tensor has zero elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get underlying data as slice.
    #[inline]
    pub fn data(&self) -> &[ElT] {
        &self.data
    }

    /// Get underlying data as mutable slice.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [ElT] {
        &mut self.data
    }

    /// Consume the tensor and return its storage.
    pub fn into_vec(self) -> Vec<ElT> {
        self.data
    }

    /// Get element by linear index.
    #[inline]
    pub fn get_linear(&self, i: usize) -> Option<&ElT> {
        self.data.get(i)
    }

    /// Get mutable element by linear index.
    #[inline]
    pub fn get_linear_mut(&mut self, i: usize) -> Option<&mut ElT> {
        self.data.get_mut(i)
    }

    /// Set element by linear index.
    pub fn set_linear(&mut self, i: usize, value: ElT) -> Result<(), TensorError> {
        let len = self.len();
        let slot = self
            .data
            .get_mut(i)
            .ok_or(TensorError::IndexOutOfBounds { index: i, len })?;
        *slot = value;
        Ok(())
    }

    /// Fill all elements with a value.
    pub fn fill(&mut self, value: ElT) {
        for x in self.data.iter_mut() {
            *x = value;
        }
    }

    /// Return a copy of the tensor with a new shape of the same length.
    pub fn reshape(&self, new_shape: &[usize]) -> Result<Self, TensorError> {
        Self::from_vec(self.data.clone(), new_shape)
    }

    /// The single value of a one-element tensor.
    pub fn item(&self) -> Result<ElT, TensorError> {
        match self.data.as_slice() {
            [value] => Ok(*value),
            _ => Err(TensorError::LengthMismatch {
                shape: self.shape.clone(),
                expected: 1,
                actual: self.len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeros_and_ones() {
        let z: DenseTensor<f64> = DenseTensor::zeros(&[2, 3]);
        assert_eq!(z.len(), 6);
        assert!(z.data().iter().all(|&x| x == 0.0));

        let o: DenseTensor<f64> = DenseTensor::ones(&[4]);
        assert_eq!(o.data(), &[1.0; 4]);
    }

    #[test]
    fn test_scalar_shape() {
        let s = DenseTensor::scalar(3.5);
        assert_eq!(s.ndim(), 0);
        assert_eq!(s.len(), 1);
        assert_eq!(s.item().unwrap(), 3.5);

        let z: DenseTensor<f64> = DenseTensor::zeros(&[]);
        assert_eq!(z.len(), 1);
    }

    #[test]
    fn test_zero_sized_dimension() {
        let t: DenseTensor<f64> = DenseTensor::zeros(&[3, 0]);
        assert!(t.is_empty());
        assert!(t.item().is_err());
    }

    #[test]
    fn test_from_vec_length_mismatch() {
        let err = DenseTensor::from_vec(vec![1.0, 2.0, 3.0], &[2, 2]).unwrap_err();
        assert_eq!(
            err,
            TensorError::LengthMismatch {
                shape: vec![2, 2],
                expected: 4,
                actual: 3
            }
        );
    }

    #[test]
    fn test_overflowing_shape() {
        let big = 1usize << (usize::BITS / 2);
        assert_eq!(
            shape_len(&[big, big]),
            Err(TensorError::ShapeOverflow {
                shape: vec![big, big]
            })
        );
        assert_eq!(shape_len(&[big, big, 0]), Ok(0));

        // an overflowing product must not wrap to an empty tensor
        assert!(matches!(
            DenseTensor::<f64>::from_vec(Vec::new(), &[big, big]),
            Err(TensorError::ShapeOverflow { .. })
        ));
        assert!(matches!(
            DenseTensor::<f64>::try_ones(&[big, big]),
            Err(TensorError::ShapeOverflow { .. })
        ));
        assert!(matches!(
            DenseTensor::<f64>::try_zeros(&[usize::MAX / 8 + 1]),
            Err(TensorError::AllocationFailed { .. })
        ));
    }

    #[test]
    fn test_set_linear() {
        let mut t: DenseTensor<f64> = DenseTensor::zeros(&[2, 2]);
        t.set_linear(3, 7.0).unwrap();
        assert_eq!(t.get_linear(3), Some(&7.0));
        assert!(t.set_linear(4, 1.0).is_err());
    }

    #[test]
    fn test_reshape_keeps_data() {
        let t = DenseTensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
        let r = t.reshape(&[3, 2]).unwrap();
        assert_eq!(r.shape(), &[3, 2]);
        assert_eq!(r.data(), t.data());
        assert!(t.reshape(&[4]).is_err());
    }
}
