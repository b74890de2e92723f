//! Stateless dispatch planning: grid and threadgroup geometry for single
//! kernels, and the five-step forward/backward attention sequence with its
//! logical buffer bindings. Buffers are externally owned; the planner only
//! names the slot each binding index expects.

use serde::{Deserialize, Serialize};

use crate::{
    device::DeviceProperties,
    error::{DescriptorError, DispatchError, KernelError},
    kernel::{
        attention::{
            AttentionDescriptor, AttentionKernel, AttentionKernelType,
        },
        gemm::{GemmDescriptor, GemmKernel, GemmOperands},
    },
    precision::Precision,
};

pub fn ceil_divide(value: u32, granularity: u16) -> u32 {
    value.div_ceil(u32::from(granularity))
}

pub fn ceil_to_multiple(value: u32, granularity: u16) -> u32 {
    ceil_divide(value, granularity) * u32::from(granularity)
}

/// Multiply-add count of one GEMM, for throughput reporting.
pub fn gemm_operations(matrix_dimensions: (u32, u32, u32)) -> u64 {
    let (m, n, k) = matrix_dimensions;
    2 * u64::from(m) * u64::from(n) * u64::from(k)
}

pub fn gigaflops(operations: u64, seconds: f64) -> f64 {
    operations as f64 / seconds / 1e9
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct GridSize {
    pub width: u64,
    pub height: u64,
    pub depth: u64,
}

impl GridSize {
    pub fn new(width: u64, height: u64, depth: u64) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }
}

/// Logical identity of a buffer in the attention training sequence. The
/// caller resolves each slot to a device buffer it owns.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum BufferSlot {
    Query,
    Key,
    Value,
    Output,
    Logsumexp,
    OutputGradient,
    DTerms,
    ValueGradient,
    DerivativeST,
    QueryGradient,
    KeyGradient,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct BufferBinding {
    pub index: u32,
    pub slot: BufferSlot,
}

fn binding(index: u32, slot: BufferSlot) -> BufferBinding {
    BufferBinding { index, slot }
}

/// The descriptor behind a planned dispatch; callers register it with the
/// pipeline cache to obtain the compiled pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlannedKernel {
    Gemm(GemmDescriptor),
    Attention(AttentionDescriptor),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchGeometry {
    pub grid: GridSize,
    pub threadgroup: GridSize,
    pub threadgroup_memory_length: u32,
}

#[derive(Debug, Clone)]
pub struct DispatchStep {
    pub kernel: PlannedKernel,
    pub geometry: DispatchGeometry,
    pub bindings: Vec<BufferBinding>,
}

fn check_grid(
    grid: GridSize,
    threads: u32,
    device: &DeviceProperties,
) -> Result<(), DispatchError> {
    let limit = u64::from(device.max_threadgroups_per_dimension);
    if grid.width > limit || grid.height > limit || grid.depth > limit {
        return Err(DispatchError::GridTooLarge {
            grid,
            limit: device.max_threadgroups_per_dimension,
        });
    }
    if threads > device.max_threads_per_threadgroup {
        return Err(DispatchError::ThreadgroupTooLarge {
            threads,
            limit: device.max_threads_per_threadgroup,
        });
    }
    Ok(())
}

/// Grid: one threadgroup per (Nb, Mb) tile of C. Group: the kernel's flat
/// threadgroup.
pub fn plan_gemm(
    kernel: &GemmKernel,
    device: &DeviceProperties,
) -> Result<DispatchGeometry, DispatchError> {
    let (m, n, _) = kernel.matrix_dimensions;
    let (block_m, block_n, _) = kernel.block_dimensions;
    let grid = GridSize::new(
        u64::from(ceil_divide(n, block_n)),
        u64::from(ceil_divide(m, block_m)),
        1,
    );
    let threadgroup = GridSize::new(u64::from(kernel.threadgroup_size), 1, 1);
    check_grid(grid, kernel.threadgroup_size, device)?;
    Ok(DispatchGeometry {
        grid,
        threadgroup,
        threadgroup_memory_length: kernel.threadgroup_memory_allocation,
    })
}

/// Forward and backward-query span R; backward-key-value spans C.
pub fn plan_attention(
    kernel: &AttentionKernel,
    device: &DeviceProperties,
) -> Result<DispatchGeometry, DispatchError> {
    let (r, c, _) = kernel.matrix_dimensions;
    let (block_r, block_c) = kernel.block_dimensions;
    let width = match kernel.kernel_type {
        AttentionKernelType::BackwardKeyValue { .. } => {
            ceil_divide(c, block_c)
        }
        _ => ceil_divide(r, block_r),
    };
    let grid = GridSize::new(u64::from(width), 1, 1);
    let threadgroup = GridSize::new(u64::from(kernel.threadgroup_size), 1, 1);
    check_grid(grid, kernel.threadgroup_size, device)?;
    Ok(DispatchGeometry {
        grid,
        threadgroup,
        threadgroup_memory_length: kernel.threadgroup_memory_allocation,
    })
}

/// The full training sequence for one attention problem:
///
/// 1. forward along R, writing O and L;
/// 2. backward-query along R, writing dQ and the D row statistic;
/// 3. backward-key-value along C, writing dV and the BF16 dS^T scratch;
/// 4. GEMM `dK = dS^T . Q`, transpose (false, false);
/// 5. GEMM `dQ += dS . K`, transpose (true, false), accumulating onto a
///    zero-initialised buffer.
///
/// Both trailing GEMMs read the scratch as operand A with its padded
/// leading dimension, inner dimension C. The sequence relies on the score
/// matrix being square; command-buffer ordering provides the
/// happens-before between steps.
#[derive(Debug, Clone)]
pub struct AttentionGradientPlan {
    pub steps: Vec<DispatchStep>,
    pub leading_dimension_derivative_st: u32,
}

impl AttentionGradientPlan {
    pub fn new(
        base: &AttentionDescriptor,
        device: &DeviceProperties,
    ) -> Result<Self, KernelError> {
        let (r, c, d) = base.matrix_dimensions;
        if r != c {
            return Err(KernelError::Descriptor(
                DescriptorError::NonSquareScoreMatrix {
                    rows: r,
                    columns: c,
                },
            ));
        }

        let forward = base.with_kernel_type(AttentionKernelType::Forward {
            store_logsumexp: true,
        });
        let backward_query =
            base.with_kernel_type(AttentionKernelType::BackwardQuery {
                store_derivative_st: false,
            });
        let backward_key_value =
            base.with_kernel_type(AttentionKernelType::BackwardKeyValue {
                store_derivative_st: true,
            });

        let forward_kernel = AttentionKernel::new(&forward, device)?;
        let backward_query_kernel =
            AttentionKernel::new(&backward_query, device)?;
        let backward_key_value_kernel =
            AttentionKernel::new(&backward_key_value, device)?;
        let leading_dimension_derivative_st =
            backward_key_value_kernel.leading_dimension_derivative_st;

        // The scratch is BF16 with a padded leading dimension; the
        // gradients and the operands the harness hands the GEMMs are F32.
        let derivative_precisions = GemmOperands {
            a: Precision::BF16,
            b: Precision::F32,
            c: Precision::F32,
        };
        let derivative_leading = GemmOperands {
            a: leading_dimension_derivative_st,
            b: u32::from(d),
            c: u32::from(d),
        };
        let mut key_gradient_gemm = GemmDescriptor::new(
            (r, u32::from(d), c),
            derivative_precisions,
            (false, false),
        );
        key_gradient_gemm.leading_dimensions = Some(derivative_leading);
        let mut query_gradient_gemm = GemmDescriptor::new(
            (r, u32::from(d), c),
            derivative_precisions,
            (true, false),
        );
        query_gradient_gemm.leading_dimensions = Some(derivative_leading);
        query_gradient_gemm.load_previous_c = true;

        let key_gradient_kernel =
            GemmKernel::new(&key_gradient_gemm, device)?;
        let query_gradient_kernel =
            GemmKernel::new(&query_gradient_gemm, device)?;

        let steps = vec![
            DispatchStep {
                kernel: PlannedKernel::Attention(forward),
                geometry: plan_attention(&forward_kernel, device)?,
                bindings: vec![
                    binding(0, BufferSlot::Query),
                    binding(1, BufferSlot::Key),
                    binding(2, BufferSlot::Value),
                    binding(3, BufferSlot::Output),
                    binding(4, BufferSlot::Logsumexp),
                ],
            },
            DispatchStep {
                kernel: PlannedKernel::Attention(backward_query),
                geometry: plan_attention(&backward_query_kernel, device)?,
                bindings: vec![
                    binding(0, BufferSlot::Query),
                    binding(1, BufferSlot::Key),
                    binding(2, BufferSlot::Value),
                    binding(3, BufferSlot::Output),
                    binding(4, BufferSlot::Logsumexp),
                    binding(5, BufferSlot::OutputGradient),
                    binding(6, BufferSlot::DTerms),
                    binding(9, BufferSlot::QueryGradient),
                ],
            },
            DispatchStep {
                kernel: PlannedKernel::Attention(backward_key_value),
                geometry: plan_attention(
                    &backward_key_value_kernel,
                    device,
                )?,
                bindings: vec![
                    binding(0, BufferSlot::Query),
                    binding(1, BufferSlot::Key),
                    binding(2, BufferSlot::Value),
                    binding(4, BufferSlot::Logsumexp),
                    binding(5, BufferSlot::OutputGradient),
                    binding(6, BufferSlot::DTerms),
                    binding(7, BufferSlot::ValueGradient),
                    binding(8, BufferSlot::DerivativeST),
                ],
            },
            DispatchStep {
                kernel: PlannedKernel::Gemm(key_gradient_gemm),
                geometry: plan_gemm(&key_gradient_kernel, device)?,
                bindings: vec![
                    binding(0, BufferSlot::DerivativeST),
                    binding(1, BufferSlot::Query),
                    binding(2, BufferSlot::KeyGradient),
                ],
            },
            DispatchStep {
                kernel: PlannedKernel::Gemm(query_gradient_gemm),
                geometry: plan_gemm(&query_gradient_kernel, device)?,
                bindings: vec![
                    binding(0, BufferSlot::DerivativeST),
                    binding(1, BufferSlot::Key),
                    binding(2, BufferSlot::QueryGradient),
                ],
            },
        ];

        Ok(Self {
            steps,
            leading_dimension_derivative_st,
        })
    }

    /// Element count of the dS^T scratch buffer the caller must provide:
    /// one padded row per score column.
    pub fn derivative_st_elements(&self) -> u64 {
        let PlannedKernel::Attention(descriptor) = &self.steps[2].kernel
        else {
            unreachable!("step 3 is the backward-key-value kernel");
        };
        u64::from(descriptor.matrix_dimensions.1)
            * u64::from(self.leading_dimension_derivative_st)
    }
}
