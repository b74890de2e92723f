mod descriptor;
mod kernel;

pub use descriptor::{
    AttentionDescriptor, AttentionKernelType, AttentionOperand,
    AttentionOperands,
};
pub use kernel::AttentionKernel;
