//! Logical buffer dimensions.

use crate::error::{Error, Result};
use std::fmt;

/// Most dimensions a buffer view can have.
pub const MAX_RANK: usize = 3;

/// Ordered dimension lengths of a buffer, outermost first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Validate caller-supplied dimensions.
    pub fn from_dims(dims: &[i64]) -> Result<Self> {
        if dims.is_empty() {
            return Err(Error::invalid_dimensions("missing dimension(s)"));
        }
        if dims.len() > MAX_RANK {
            return Err(Error::invalid_dimensions(format!(
                "{} dimensions given, at most {} supported",
                dims.len(),
                MAX_RANK
            )));
        }

        let mut out = Vec::with_capacity(dims.len());
        for (axis, &len) in dims.iter().enumerate() {
            if len < 1 {
                return Err(Error::invalid_dimensions(format!(
                    "dimension {} has length {}",
                    axis, len
                )));
            }
            let len = usize::try_from(len).map_err(|_| {
                Error::invalid_dimensions(format!("dimension {} is too large", axis))
            })?;
            out.push(len);
        }

        let shape = Self { dims: out };
        if shape.num_elements().is_none() {
            return Err(Error::invalid_dimensions(format!(
                "{} elements overflow the address space",
                shape
            )));
        }

        Ok(shape)
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Product of all dimensions, `None` on overflow.
    pub fn num_elements(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Bytes needed for `elem_size`-byte elements, `None` on overflow.
    pub fn byte_len(&self, elem_size: usize) -> Option<usize> {
        self.num_elements()?.checked_mul(elem_size)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                f.write_str("x")?;
            }
            write!(f, "{}", d)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_shapes() {
        let shape = Shape::from_dims(&[100, 20, 2]).unwrap();
        assert_eq!(shape.dims(), &[100, 20, 2]);
        assert_eq!(shape.rank(), 3);
        assert_eq!(shape.num_elements(), Some(4000));
        assert_eq!(shape.byte_len(4), Some(16_000));
        assert_eq!(shape.to_string(), "100x20x2");
    }

    #[test]
    fn test_rejects_missing_and_non_positive() {
        let cases: [&[i64]; 7] = [
            &[],
            &[0],
            &[-1],
            &[10, 0],
            &[10, -1],
            &[10, 10, 0],
            &[-1, 10, 10],
        ];
        for dims in cases {
            let err = Shape::from_dims(dims).unwrap_err();
            assert!(matches!(err, Error::InvalidDimensions(_)), "{:?}", dims);
        }
    }

    #[test]
    fn test_rejects_rank_above_three() {
        assert!(Shape::from_dims(&[1, 1, 1, 1]).is_err());
    }

    #[test]
    fn test_rejects_overflow() {
        let err = Shape::from_dims(&[i64::MAX, i64::MAX]).unwrap_err();
        assert!(matches!(err, Error::InvalidDimensions(_)));
    }
}
