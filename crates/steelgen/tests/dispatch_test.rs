use steelgen::{
    AttentionDescriptor, AttentionGradientPlan, AttentionKernel,
    AttentionKernelType, AttentionOperands, BufferSlot, DeviceProperties,
    DispatchError, GemmDescriptor, GemmKernel, GemmOperands, KernelError,
    PlannedKernel, Precision, ceil_divide, ceil_to_multiple,
    gemm_operations, gigaflops, plan_attention, plan_gemm,
};

fn device() -> DeviceProperties {
    DeviceProperties::default()
}

fn gemm_descriptor(dimensions: (u32, u32, u32)) -> GemmDescriptor {
    GemmDescriptor::new(
        dimensions,
        GemmOperands::splat(Precision::F32),
        (false, false),
    )
}

fn attention_base(n: u32, d: u16) -> AttentionDescriptor {
    AttentionDescriptor::new(
        (n, n, d),
        AttentionOperands::splat(Precision::F32),
        AttentionKernelType::Forward {
            store_logsumexp: true,
        },
    )
}

fn slot_for(
    bindings: &[steelgen::BufferBinding],
    index: u32,
) -> BufferSlot {
    bindings
        .iter()
        .find(|binding| binding.index == index)
        .unwrap_or_else(|| panic!("no binding at index {index}"))
        .slot
}

#[test]
fn ceiling_division() {
    assert_eq!(ceil_divide(7, 8), 1);
    assert_eq!(ceil_divide(8, 8), 1);
    assert_eq!(ceil_divide(9, 8), 2);
    assert_eq!(ceil_to_multiple(25, 32), 32);
    assert_eq!(ceil_to_multiple(64, 32), 64);
    assert_eq!(ceil_to_multiple(65, 32), 96);
}

#[test]
fn gemm_grids_cover_the_problem_sizes() {
    for n in [7u32, 8, 9, 16, 17, 31, 32, 33, 127, 128, 129, 151, 152, 153]
    {
        let kernel = GemmKernel::new(&gemm_descriptor((n, n, n)), &device())
            .expect("kernel");
        let geometry = plan_gemm(&kernel, &device()).expect("plan");
        let (block_m, block_n, _) = kernel.block_dimensions;
        assert_eq!(
            geometry.grid.width,
            u64::from(ceil_divide(n, block_n))
        );
        assert_eq!(
            geometry.grid.height,
            u64::from(ceil_divide(n, block_m))
        );
        assert_eq!(geometry.grid.depth, 1);
        assert_eq!(
            geometry.threadgroup.width,
            u64::from(kernel.threadgroup_size)
        );
        assert_eq!(
            geometry.threadgroup_memory_length,
            kernel.threadgroup_memory_allocation
        );
    }
}

#[test]
fn attention_grids_follow_the_parallel_axis() {
    let forward =
        AttentionKernel::new(&attention_base(100, 32), &device())
            .expect("kernel");
    let geometry = plan_attention(&forward, &device()).expect("plan");
    assert_eq!(geometry.grid.width, 4); // ceil(100 / 32)

    let key_value = AttentionKernel::new(
        &attention_base(100, 32).with_kernel_type(
            AttentionKernelType::BackwardKeyValue {
                store_derivative_st: true,
            },
        ),
        &device(),
    )
    .expect("kernel");
    let geometry = plan_attention(&key_value, &device()).expect("plan");
    assert_eq!(
        geometry.grid.width,
        u64::from(ceil_divide(100, key_value.block_dimensions.1))
    );
}

#[test]
fn oversized_grids_are_rejected() {
    let mut limited = device();
    limited.max_threadgroups_per_dimension = 4;
    let kernel =
        GemmKernel::new(&gemm_descriptor((1024, 1024, 64)), &limited)
            .expect("kernel");
    assert!(matches!(
        plan_gemm(&kernel, &limited).unwrap_err(),
        DispatchError::GridTooLarge { .. }
    ));
}

#[test]
fn gradient_plan_emits_the_five_step_sequence() {
    let plan = AttentionGradientPlan::new(&attention_base(64, 32), &device())
        .expect("plan");
    assert_eq!(plan.steps.len(), 5);

    let PlannedKernel::Attention(forward) = &plan.steps[0].kernel else {
        panic!("step 1 must be the forward kernel");
    };
    assert_eq!(
        forward.kernel_type,
        AttentionKernelType::Forward {
            store_logsumexp: true,
        }
    );

    let PlannedKernel::Attention(backward_query) = &plan.steps[1].kernel
    else {
        panic!("step 2 must be the backward-query kernel");
    };
    assert_eq!(
        backward_query.kernel_type,
        AttentionKernelType::BackwardQuery {
            store_derivative_st: false,
        }
    );

    let PlannedKernel::Attention(backward_key_value) =
        &plan.steps[2].kernel
    else {
        panic!("step 3 must be the backward-key-value kernel");
    };
    assert_eq!(
        backward_key_value.kernel_type,
        AttentionKernelType::BackwardKeyValue {
            store_derivative_st: true,
        }
    );

    let PlannedKernel::Gemm(key_gradient) = &plan.steps[3].kernel else {
        panic!("step 4 must be the dK GEMM");
    };
    assert_eq!(key_gradient.matrix_dimensions, (64, 32, 64));
    assert_eq!(key_gradient.transpose_state, (false, false));
    assert_eq!(key_gradient.memory_precisions.a, Precision::BF16);
    assert_eq!(key_gradient.memory_precisions.b, Precision::F32);
    assert_eq!(key_gradient.memory_precisions.c, Precision::F32);
    assert!(!key_gradient.load_previous_c);

    let PlannedKernel::Gemm(query_gradient) = &plan.steps[4].kernel else {
        panic!("step 5 must be the dQ GEMM");
    };
    assert_eq!(query_gradient.matrix_dimensions, (64, 32, 64));
    assert_eq!(query_gradient.transpose_state, (true, false));
    assert!(query_gradient.load_previous_c);
}

#[test]
fn gradient_plan_threads_the_scratch_stride_through_the_gemms() {
    let plan =
        AttentionGradientPlan::new(&attention_base(100, 80), &device())
            .expect("plan");
    let stride = plan.leading_dimension_derivative_st;
    assert!(stride >= 100);

    for step in [&plan.steps[3], &plan.steps[4]] {
        let PlannedKernel::Gemm(descriptor) = &step.kernel else {
            panic!("trailing steps are GEMMs");
        };
        let leading =
            descriptor.leading_dimensions.expect("leading override");
        assert_eq!(leading.a, stride);
    }
    assert_eq!(
        plan.derivative_st_elements(),
        u64::from(stride) * 100
    );
}

#[test]
fn gradient_plan_buffer_bindings() {
    let plan = AttentionGradientPlan::new(&attention_base(64, 32), &device())
        .expect("plan");

    let forward = &plan.steps[0].bindings;
    assert_eq!(slot_for(forward, 0), BufferSlot::Query);
    assert_eq!(slot_for(forward, 1), BufferSlot::Key);
    assert_eq!(slot_for(forward, 2), BufferSlot::Value);
    assert_eq!(slot_for(forward, 3), BufferSlot::Output);
    assert_eq!(slot_for(forward, 4), BufferSlot::Logsumexp);

    let backward_query = &plan.steps[1].bindings;
    assert_eq!(slot_for(backward_query, 5), BufferSlot::OutputGradient);
    assert_eq!(slot_for(backward_query, 6), BufferSlot::DTerms);
    assert_eq!(slot_for(backward_query, 9), BufferSlot::QueryGradient);

    let backward_key_value = &plan.steps[2].bindings;
    assert_eq!(
        slot_for(backward_key_value, 7),
        BufferSlot::ValueGradient
    );
    assert_eq!(
        slot_for(backward_key_value, 8),
        BufferSlot::DerivativeST
    );

    let key_gradient = &plan.steps[3].bindings;
    assert_eq!(slot_for(key_gradient, 0), BufferSlot::DerivativeST);
    assert_eq!(slot_for(key_gradient, 1), BufferSlot::Query);
    assert_eq!(slot_for(key_gradient, 2), BufferSlot::KeyGradient);

    let query_gradient = &plan.steps[4].bindings;
    assert_eq!(slot_for(query_gradient, 0), BufferSlot::DerivativeST);
    assert_eq!(slot_for(query_gradient, 1), BufferSlot::Key);
    assert_eq!(slot_for(query_gradient, 2), BufferSlot::QueryGradient);
}

#[test]
fn gradient_plan_rejects_rectangular_scores() {
    let descriptor = AttentionDescriptor::new(
        (64, 128, 32),
        AttentionOperands::splat(Precision::F32),
        AttentionKernelType::Forward {
            store_logsumexp: true,
        },
    );
    assert!(matches!(
        AttentionGradientPlan::new(&descriptor, &device()).unwrap_err(),
        KernelError::Descriptor(_)
    ));
}

#[test]
fn throughput_accounting() {
    let operations = gemm_operations((512, 512, 512));
    assert_eq!(operations, 2 * 512 * 512 * 512);
    let rate = gigaflops(operations, 1e-3);
    assert!(rate > 0.0);
}
