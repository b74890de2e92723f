use serde::{Deserialize, Serialize};

/// Storage or accumulation precision of a kernel operand.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub enum Precision {
    F32,
    F16,
    BF16,
}

impl Precision {
    pub const fn size_in_bytes(&self) -> usize {
        match self {
            Precision::F32 => 4,
            Precision::F16 | Precision::BF16 => 2,
        }
    }

    /// Spelling of this precision in emitted shader source.
    pub const fn shader_name(&self) -> &'static str {
        match self {
            Precision::F32 => "float",
            Precision::F16 => "half",
            Precision::BF16 => "bfloat",
        }
    }

    /// A register precision is legal for operands stored at this memory
    /// precision iff it matches or widens to F32.
    pub const fn supports_register(&self, register: Precision) -> bool {
        match (self, register) {
            (_, Precision::F32) => true,
            (Precision::F16, Precision::F16) => true,
            (Precision::BF16, Precision::BF16) => true,
            _ => false,
        }
    }

    /// Default register precision for operands stored at this precision.
    /// BF16 widens to F32: the target GPUs have no BF16 arithmetic path, so
    /// values convert when tiles leave threadgroup memory.
    pub const fn default_register(&self) -> Precision {
        match self {
            Precision::F32 => Precision::F32,
            Precision::F16 => Precision::F16,
            Precision::BF16 => Precision::F32,
        }
    }
}
