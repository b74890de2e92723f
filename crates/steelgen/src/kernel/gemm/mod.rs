mod descriptor;
mod kernel;

pub use descriptor::{GemmDescriptor, GemmOperand, GemmOperands};
pub use kernel::GemmKernel;
