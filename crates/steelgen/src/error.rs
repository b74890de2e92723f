use thiserror::Error;

use crate::{
    dispatch::GridSize, kernel::gemm::GemmOperand, precision::Precision,
};

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("compilation error: {0}")]
    Compilation(#[from] CompilationError),
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Rejections raised synchronously while resolving a descriptor into a
/// kernel. Fatal for that descriptor; nothing is retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error(
        "register precision {register:?} is illegal for operand {operand} \
         stored as {memory:?}"
    )]
    IncompatibleRegisterPrecision {
        operand: GemmOperand,
        memory: Precision,
        register: Precision,
    },
    #[error("BF16 cannot accumulate C: an 8-bit mantissa corrupts reductions")]
    Bf16Accumulator,
    #[error(
        "leading block dimension {provided} for operand {operand} is below \
         the tile extent {expected}"
    )]
    LeadingBlockDimensionTooSmall {
        operand: GemmOperand,
        provided: u16,
        expected: u16,
    },
    #[error(
        "leading dimension {provided} for operand {operand} is below the \
         matrix extent {expected}"
    )]
    LeadingDimensionTooSmall {
        operand: GemmOperand,
        provided: u32,
        expected: u32,
    },
    #[error(
        "block dimensions {block:?} do not tile into 8x8 register tiles \
         under splits {splits:?}"
    )]
    MisalignedBlockDimensions {
        block: (u16, u16, u16),
        splits: (u16, u16),
    },
    #[error("matrix dimensions must be nonzero")]
    ZeroDimension,
    #[error(
        "threadgroup memory requirement {required} exceeds the device \
         limit {limit}"
    )]
    ThreadgroupMemoryExceeded { required: u32, limit: u32 },
    #[error(
        "threadgroup size {threads} exceeds the device limit {limit}"
    )]
    ThreadgroupSizeExceeded { threads: u32, limit: u32 },
    #[error(
        "the derivative GEMM pair requires a square score matrix, got \
         {rows} rows by {columns} columns"
    )]
    NonSquareScoreMatrix { rows: u32, columns: u32 },
}

/// Shader compilation failure, surfaced with the offending source text
/// attached for diagnosis. The pipeline cache does not insert an entry for
/// a descriptor whose compilation failed.
#[derive(Debug, Clone, Error)]
#[error("{function_name}: {reason}")]
pub struct CompilationError {
    pub function_name: String,
    pub reason: String,
    pub source_text: String,
}

/// Grid or threadgroup geometry beyond what the device can dispatch.
/// Raised before any command is encoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("grid {grid:?} exceeds {limit} threadgroups per dimension")]
    GridTooLarge { grid: GridSize, limit: u32 },
    #[error("threadgroup of {threads} threads exceeds the device limit {limit}")]
    ThreadgroupTooLarge { threads: u32, limit: u32 },
}
