use std::{fmt::Display, str::FromStr};

#[cfg(feature = "bfloat")]
use half::bf16;
#[cfg(feature = "half")]
use half::f16;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Element type of a tensor node or the compute precision of an operator.
///
/// The textual names are the vocabulary accepted inside `[..]` in a
/// declarative op-sequence record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Pred,
    U8,
    S8,
    S32,
    S64,
    F16,
    BF16,
    F32,
    F64,
}

impl DType {
    pub const ALL: [DType; 9] = [
        DType::Pred,
        DType::U8,
        DType::S8,
        DType::S32,
        DType::S64,
        DType::F16,
        DType::BF16,
        DType::F32,
        DType::F64,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Pred => "pred",
            Self::U8 => "u8",
            Self::S8 => "s8",
            Self::S32 => "s32",
            Self::S64 => "s64",
            Self::F16 => "f16",
            Self::BF16 => "bf16",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }

    pub const fn size_in_bytes(&self) -> usize {
        match self {
            Self::Pred | Self::U8 | Self::S8 => 1,
            Self::F16 | Self::BF16 => 2,
            Self::S32 | Self::F32 => 4,
            Self::S64 | Self::F64 => 8,
        }
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, Self::F16 | Self::BF16 | Self::F32 | Self::F64)
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|dt| dt.name() == name)
    }
}

impl Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| Error::structural(format!("unknown dtype `{s}`")))
    }
}

/// A scalar operand passed to the device by value rather than through a buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    Pred(bool),
    S32(i32),
    S64(i64),
    F32(f32),
    F64(f64),
    #[cfg(feature = "half")]
    F16(f16),
    #[cfg(feature = "bfloat")]
    BF16(bf16),
}

impl ScalarValue {
    pub fn dtype(&self) -> DType {
        match self {
            Self::Pred(_) => DType::Pred,
            Self::S32(_) => DType::S32,
            Self::S64(_) => DType::S64,
            Self::F32(_) => DType::F32,
            Self::F64(_) => DType::F64,
            #[cfg(feature = "half")]
            Self::F16(_) => DType::F16,
            #[cfg(feature = "bfloat")]
            Self::BF16(_) => DType::BF16,
        }
    }

    /// Little-endian bytes as the device expects them in a variant pack.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            Self::Pred(v) => vec![*v as u8],
            Self::S32(v) => v.to_le_bytes().to_vec(),
            Self::S64(v) => v.to_le_bytes().to_vec(),
            Self::F32(v) => v.to_le_bytes().to_vec(),
            Self::F64(v) => v.to_le_bytes().to_vec(),
            #[cfg(feature = "half")]
            Self::F16(v) => v.to_le_bytes().to_vec(),
            #[cfg(feature = "bfloat")]
            Self::BF16(v) => v.to_le_bytes().to_vec(),
        }
    }
}

impl Display for ScalarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pred(v) => write!(f, "pred:{v}"),
            Self::S32(v) => write!(f, "s32:{v}"),
            Self::S64(v) => write!(f, "s64:{v}"),
            Self::F32(v) => write!(f, "f32:{v:?}"),
            Self::F64(v) => write!(f, "f64:{v:?}"),
            #[cfg(feature = "half")]
            Self::F16(v) => write!(f, "f16:{v:?}"),
            #[cfg(feature = "bfloat")]
            Self::BF16(v) => write!(f, "bf16:{v:?}"),
        }
    }
}

macro_rules! scalar_from {
    ($rt:ty, $variant:ident) => {
        impl From<$rt> for ScalarValue {
            fn from(v: $rt) -> Self {
                ScalarValue::$variant(v)
            }
        }
    };
}

scalar_from!(bool, Pred);
scalar_from!(i32, S32);
scalar_from!(i64, S64);
scalar_from!(f32, F32);
scalar_from!(f64, F64);
#[cfg(feature = "half")]
scalar_from!(f16, F16);
#[cfg(feature = "bfloat")]
scalar_from!(bf16, BF16);
