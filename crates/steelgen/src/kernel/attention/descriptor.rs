use std::fmt;

use serde::{Deserialize, Serialize};

use crate::precision::Precision;

/// Attention operand tag. Derivative buffers (dO, dQ, dV, the row
/// statistics and the dS^T scratch) follow fixed precisions and are not
/// tagged separately.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum AttentionOperand {
    Q,
    K,
    V,
    O,
}

impl fmt::Display for AttentionOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttentionOperand::Q => write!(f, "Q"),
            AttentionOperand::K => write!(f, "K"),
            AttentionOperand::V => write!(f, "V"),
            AttentionOperand::O => write!(f, "O"),
        }
    }
}

/// Per-operand values for Q, K, V and O.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct AttentionOperands<T> {
    pub q: T,
    pub k: T,
    pub v: T,
    pub o: T,
}

impl<T: Copy> AttentionOperands<T> {
    pub const fn splat(value: T) -> Self {
        Self {
            q: value,
            k: value,
            v: value,
            o: value,
        }
    }

    pub fn get(&self, operand: AttentionOperand) -> T {
        match operand {
            AttentionOperand::Q => self.q,
            AttentionOperand::K => self.k,
            AttentionOperand::V => self.v,
            AttentionOperand::O => self.o,
        }
    }
}

/// Which of the three cooperating kernels to synthesise. Forward and
/// backward-query parallelise along R and stream across C; backward
/// key-value parallelises along C and streams across R so it can reuse the
/// saved row statistics instead of recomputing the softmax.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum AttentionKernelType {
    Forward { store_logsumexp: bool },
    BackwardQuery { store_derivative_st: bool },
    BackwardKeyValue { store_derivative_st: bool },
}

/// Immutable fingerprint of one attention kernel variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttentionDescriptor {
    /// (R, C, D): rows and columns of the score matrix, head dimension.
    pub matrix_dimensions: (u32, u32, u16),
    pub memory_precisions: AttentionOperands<Precision>,
    pub transpose_state: AttentionOperands<bool>,
    pub kernel_type: AttentionKernelType,
}

impl AttentionDescriptor {
    pub fn new(
        matrix_dimensions: (u32, u32, u16),
        memory_precisions: AttentionOperands<Precision>,
        kernel_type: AttentionKernelType,
    ) -> Self {
        Self {
            matrix_dimensions,
            memory_precisions,
            transpose_state: AttentionOperands::splat(false),
            kernel_type,
        }
    }

    /// The same problem with a different kernel type; used by the planner
    /// to derive the members of a forward/backward sequence.
    pub fn with_kernel_type(&self, kernel_type: AttentionKernelType) -> Self {
        Self {
            kernel_type,
            ..self.clone()
        }
    }
}
