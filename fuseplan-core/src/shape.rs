use std::fmt::Display;

use crate::{DType, Result};

/// Compute default (contiguous) strides for a tensor of given shape.
/// Products saturate at `i64::MAX`; graph construction rejects shapes
/// where that happens.
pub fn contiguous_strides(dims: &[i64]) -> Vec<i64> {
    let mut strides = Vec::with_capacity(dims.len());
    let mut acc: i64 = 1;
    // Iterate dims in reverse to accumulate products
    for dim in dims.iter().rev() {
        strides.push(acc);
        acc = acc.saturating_mul(*dim);
    }
    strides.reverse();
    strides
}

/// Packing of several elements into one vector lane along an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Vectorization {
    pub count: u32,
    pub axis: u32,
}

/// Element type plus logical shape and physical layout of a tensor node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorDesc {
    pub dtype: DType,
    pub dims: Vec<i64>,
    pub strides: Vec<i64>,
    pub vectorization: Option<Vectorization>,
    /// Passed to the device as a scalar value instead of through a buffer.
    pub by_value: bool,
}

impl TensorDesc {
    /// A dense row-major tensor.
    pub fn new(dtype: DType, dims: impl Into<Vec<i64>>) -> Self {
        let dims = dims.into();
        let strides = contiguous_strides(&dims);
        Self {
            dtype,
            dims,
            strides,
            vectorization: None,
            by_value: false,
        }
    }

    pub fn with_strides(
        dtype: DType,
        dims: impl Into<Vec<i64>>,
        strides: impl Into<Vec<i64>>,
    ) -> Result<Self> {
        let dims = dims.into();
        let strides = strides.into();
        if dims.len() != strides.len() {
            crate::structural!(
                "rank mismatch: {} dims but {} strides",
                dims.len(),
                strides.len()
            );
        }
        Ok(Self {
            dtype,
            dims,
            strides,
            vectorization: None,
            by_value: false,
        })
    }

    /// A rank-1, single-element scalar passed by value.
    pub fn scalar(dtype: DType) -> Self {
        Self {
            by_value: true,
            ..Self::new(dtype, [1])
        }
    }

    pub fn vectorized(mut self, count: u32, axis: u32) -> Self {
        self.vectorization = Some(Vectorization { count, axis });
        self
    }

    /// Same layout with a different element type.
    pub fn cast(&self, dtype: DType) -> Self {
        Self {
            dtype,
            ..self.clone()
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Saturates on overflow, which a validated descriptor never hits.
    pub fn element_count(&self) -> u64 {
        self.checked_element_count().unwrap_or(u64::MAX)
    }

    /// Saturates on overflow, which a validated descriptor never hits.
    pub fn size_in_bytes(&self) -> u64 {
        self.checked_size_in_bytes().unwrap_or(u64::MAX)
    }

    pub fn checked_element_count(&self) -> Option<u64> {
        self.dims
            .iter()
            .try_fold(1u64, |acc, d| acc.checked_mul((*d).max(0) as u64))
    }

    /// Byte size, or `None` when it does not fit a signed 64-bit offset.
    pub fn checked_size_in_bytes(&self) -> Option<u64> {
        self.checked_element_count()?
            .checked_mul(self.dtype.size_in_bytes() as u64)
            .filter(|bytes| *bytes <= i64::MAX as u64)
    }

    pub fn is_contiguous(&self) -> bool {
        self.strides == contiguous_strides(&self.dims)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.dims.len() != self.strides.len() {
            crate::structural!(
                "rank mismatch: {} dims but {} strides",
                self.dims.len(),
                self.strides.len()
            );
        }
        if let Some(d) = self.dims.iter().find(|d| **d <= 0) {
            crate::structural!("non-positive dimension {d} in {:?}", self.dims);
        }
        if self.checked_size_in_bytes().is_none() {
            crate::structural!(
                "{} tensor of shape {:?} is too large to address",
                self.dtype,
                self.dims
            );
        }
        if let Some(v) = &self.vectorization {
            if v.count == 0 || v.axis as usize >= self.dims.len() {
                crate::structural!("invalid vectorization {v:?} for rank {}", self.dims.len());
            }
        }
        Ok(())
    }
}

impl Display for TensorDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{:?}", self.dtype, self.dims)?;
        if !self.is_contiguous() {
            write!(f, "s{:?}", self.strides)?;
        }
        if let Some(v) = &self.vectorization {
            write!(f, "v{}@{}", v.count, v.axis)?;
        }
        if self.by_value {
            f.write_str("#")?;
        }
        Ok(())
    }
}
