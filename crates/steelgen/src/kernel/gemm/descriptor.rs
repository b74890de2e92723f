use std::fmt;

use serde::{Deserialize, Serialize};

use crate::precision::Precision;

/// GEMM operand tag. C is the accumulator and is never transposed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum GemmOperand {
    A,
    B,
    C,
}

impl fmt::Display for GemmOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GemmOperand::A => write!(f, "A"),
            GemmOperand::B => write!(f, "B"),
            GemmOperand::C => write!(f, "C"),
        }
    }
}

/// Per-operand values for A, B and C.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct GemmOperands<T> {
    pub a: T,
    pub b: T,
    pub c: T,
}

impl<T: Copy> GemmOperands<T> {
    pub const fn splat(value: T) -> Self {
        Self {
            a: value,
            b: value,
            c: value,
        }
    }

    pub fn get(&self, operand: GemmOperand) -> T {
        match operand {
            GemmOperand::A => self.a,
            GemmOperand::B => self.b,
            GemmOperand::C => self.c,
        }
    }
}

/// Immutable fingerprint of one GEMM kernel variant. `None` fields are
/// resolved by the synthesiser; the synthesised [`super::GemmKernel`]
/// exposes every field fully resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GemmDescriptor {
    /// (M, N, K) in BLAS notation.
    pub matrix_dimensions: (u32, u32, u32),
    pub memory_precisions: GemmOperands<Precision>,
    /// Defaults to the memory precision per operand, with BF16 widened to
    /// F32.
    pub register_precisions: Option<GemmOperands<Precision>>,
    /// Transpose state of (A, B).
    pub transpose_state: (bool, bool),
    /// (Mb, Nb, Kb). Defaults from a rule table keyed by the memory
    /// precisions and the device class.
    pub block_dimensions: Option<(u16, u16, u16)>,
    /// Per-operand override of the leading dimension of a block in
    /// threadgroup memory. Each override must cover the tile extent.
    pub leading_block_dimensions: Option<GemmOperands<u16>>,
    /// Per-operand override of the leading dimension in device memory,
    /// for operands with a padded row stride. Defaults to the packed
    /// extent implied by the matrix dimensions and transpose state.
    pub leading_dimensions: Option<GemmOperands<u32>>,
    /// SIMD-group count along (M, N) inside one block.
    pub splits: Option<(u16, u16)>,
    pub prefer_async_load: bool,
    pub prefer_async_store: bool,
    /// Accumulate onto the existing contents of C instead of overwriting.
    pub load_previous_c: bool,
}

impl GemmDescriptor {
    pub fn new(
        matrix_dimensions: (u32, u32, u32),
        memory_precisions: GemmOperands<Precision>,
        transpose_state: (bool, bool),
    ) -> Self {
        Self {
            matrix_dimensions,
            memory_precisions,
            register_precisions: None,
            transpose_state,
            block_dimensions: None,
            leading_block_dimensions: None,
            leading_dimensions: None,
            splits: None,
            prefer_async_load: false,
            prefer_async_store: false,
            load_previous_c: false,
        }
    }
}
