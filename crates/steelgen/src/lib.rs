//! Kernel generator and host-side dispatcher for tiled GEMM and
//! FlashAttention-style fused attention on Apple GPUs.
//!
//! The crate is split along the data flow: a [`GemmDescriptor`] or
//! [`AttentionDescriptor`] is a pure value fingerprinting one kernel
//! variant; the synthesisers ([`GemmKernel::new`], [`AttentionKernel::new`])
//! resolve every defaulted field and emit Metal shader source; the
//! [`PipelineCache`] compiles each distinct descriptor at most once through
//! an abstract [`PipelineCompiler`]; and the planner in [`dispatch`] turns
//! synthesised kernels into grid sizes and buffer-binding records.
//!
//! The driver itself (library compilation, command encoding, buffer
//! ownership) lives with the embedding runtime. Synthesis is deterministic:
//! identical descriptors produce byte-identical source, which is what makes
//! the descriptor usable as the cache key.

pub mod cache;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod kernel;
pub mod precision;
mod shader;

pub use cache::{AttentionPipeline, GemmPipeline, PipelineCache};
pub use device::{DeviceClass, DeviceProperties, PipelineCompiler};
pub use dispatch::{
    AttentionGradientPlan, BufferBinding, BufferSlot, DispatchGeometry,
    DispatchStep, GridSize, PlannedKernel, ceil_divide, ceil_to_multiple,
    gemm_operations, gigaflops, plan_attention, plan_gemm,
};
pub use error::{
    CompilationError, DescriptorError, DispatchError, KernelError,
};
pub use kernel::attention::{
    AttentionDescriptor, AttentionKernel, AttentionKernelType,
    AttentionOperand, AttentionOperands,
};
pub use kernel::gemm::{
    GemmDescriptor, GemmKernel, GemmOperand, GemmOperands,
};
pub use precision::Precision;
