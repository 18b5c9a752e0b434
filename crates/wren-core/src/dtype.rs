use std::fmt;

use serde::{Deserialize, Serialize};

// DType — Element types a tensor descriptor can declare
//
// The construction engine never touches element data, but it still has to
// agree with the numeric engine on what each node produces:
//
//   F16 / BF16 — half precision, for mixed-precision graphs
//   F32        — the default for dense activations and parameters
//   F64        — accumulators that must not lose precision (statistics)
//   U8 / Bool  — masks
//   I32        — sparse class indices and sequence lengths
//   I64        — counters
//
// In graph descriptions they are spelled the long way ("float32", "int32"),
// the short spelling ("f32", "i32") is accepted as an alias.

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DType {
    #[serde(rename = "float16", alias = "f16")]
    F16,
    #[serde(rename = "bfloat16", alias = "bf16")]
    BF16,
    #[default]
    #[serde(rename = "float32", alias = "f32")]
    F32,
    #[serde(rename = "float64", alias = "f64")]
    F64,
    #[serde(rename = "uint8", alias = "u8")]
    U8,
    #[serde(rename = "int32", alias = "i32")]
    I32,
    #[serde(rename = "int64", alias = "i64")]
    I64,
    #[serde(rename = "bool")]
    Bool,
}

impl DType {
    /// Floating point; concatenated sources and recurrent inputs keep it.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F16 => "float16",
            DType::BF16 => "bfloat16",
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::U8 => "uint8",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::Bool => "bool",
        };
        write!(f, "{}", s)
    }
}
