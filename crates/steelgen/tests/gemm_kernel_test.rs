use rand::{Rng, SeedableRng, rngs::StdRng};
use steelgen::{
    DescriptorError, DeviceProperties, GemmDescriptor, GemmKernel,
    GemmOperands, Precision,
};

fn device() -> DeviceProperties {
    DeviceProperties::default()
}

fn descriptor(
    dimensions: (u32, u32, u32),
    precision: Precision,
) -> GemmDescriptor {
    GemmDescriptor::new(
        dimensions,
        GemmOperands::splat(precision),
        (false, false),
    )
}

#[test]
fn register_precision_pairs() {
    let precisions =
        [Precision::F32, Precision::F16, Precision::BF16];
    for memory in precisions {
        for register in precisions {
            let mut desc = descriptor((64, 64, 64), Precision::F32);
            desc.memory_precisions.a = memory;
            desc.register_precisions = Some(GemmOperands {
                a: register,
                b: Precision::F32,
                c: Precision::F32,
            });
            let result = GemmKernel::new(&desc, &device());
            let legal = register == memory || register == Precision::F32;
            assert_eq!(
                result.is_ok(),
                legal,
                "memory {memory:?} register {register:?}"
            );
            if !legal {
                assert!(matches!(
                    result.unwrap_err(),
                    DescriptorError::IncompatibleRegisterPrecision {
                        ..
                    }
                ));
            }
        }
    }
}

#[test]
fn bf16_accumulator_is_rejected() {
    let mut desc = descriptor((64, 64, 64), Precision::BF16);
    desc.register_precisions =
        Some(GemmOperands::splat(Precision::BF16));
    assert_eq!(
        GemmKernel::new(&desc, &device()).unwrap_err(),
        DescriptorError::Bf16Accumulator
    );
}

#[test]
fn bf16_memory_defaults_to_f32_registers() {
    let desc = descriptor((64, 64, 64), Precision::BF16);
    let kernel = GemmKernel::new(&desc, &device()).expect("kernel");
    assert_eq!(kernel.register_precisions.a, Precision::F32);
    assert_eq!(kernel.register_precisions.c, Precision::F32);
    assert!(kernel.source.contains("tile_cast<bfloat, float>"));
}

#[test]
fn tile_alignment_invariants() {
    let cases = [
        (descriptor((151, 152, 153), Precision::F32), device()),
        (descriptor((151, 152, 153), Precision::F16), device()),
        (
            descriptor((512, 512, 512), Precision::BF16),
            DeviceProperties::desktop(),
        ),
    ];
    for (desc, device) in cases {
        let kernel = GemmKernel::new(&desc, &device).expect("kernel");
        let (mb, nb, _) = kernel.block_dimensions;
        let (sm, sn) = kernel.splits;
        assert_eq!(mb % (8 * sm), 0);
        assert_eq!(nb % (8 * sn), 0);
        assert_eq!(
            kernel.threadgroup_size,
            32 * u32::from(sm) * u32::from(sn)
        );
        assert_eq!(kernel.register_m, mb / sm);
        assert_eq!(kernel.register_n, nb / sn);
    }
}

#[test]
fn default_tile_rule_table() {
    let f32_kernel =
        GemmKernel::new(&descriptor((256, 256, 256), Precision::F32), &device())
            .expect("kernel");
    assert_eq!(f32_kernel.block_dimensions, (32, 32, 8));

    let mixed_kernel =
        GemmKernel::new(&descriptor((256, 256, 256), Precision::F16), &device())
            .expect("kernel");
    assert_eq!(mixed_kernel.block_dimensions, (32, 32, 32));

    let desktop_kernel = GemmKernel::new(
        &descriptor((256, 256, 256), Precision::F16),
        &DeviceProperties::desktop(),
    )
    .expect("kernel");
    assert_eq!(desktop_kernel.block_dimensions, (48, 48, 32));
}

#[test]
fn misaligned_splits_are_rejected() {
    let mut desc = descriptor((64, 64, 64), Precision::F16);
    desc.block_dimensions = Some((48, 48, 32));
    desc.splits = Some((5, 2));
    assert!(matches!(
        GemmKernel::new(&desc, &device()).unwrap_err(),
        DescriptorError::MisalignedBlockDimensions { .. }
    ));
}

#[test]
fn leading_block_dimension_expectations() {
    // Untransposed A expects Kb; transposed A expects Mb.
    let mut desc = descriptor((64, 64, 64), Precision::F16);
    desc.block_dimensions = Some((32, 32, 16));
    let kernel = GemmKernel::new(&desc, &device()).expect("kernel");
    assert_eq!(kernel.leading_block_dimensions.a, 16);
    assert_eq!(kernel.leading_block_dimensions.b, 32);
    assert_eq!(kernel.leading_block_dimensions.c, 32);

    desc.transpose_state = (true, true);
    let kernel = GemmKernel::new(&desc, &device()).expect("kernel");
    assert_eq!(kernel.leading_block_dimensions.a, 32);
    assert_eq!(kernel.leading_block_dimensions.b, 16);
}

#[test]
fn undersized_leading_block_dimension_is_rejected() {
    let mut desc = descriptor((64, 64, 64), Precision::F16);
    desc.block_dimensions = Some((32, 32, 16));
    desc.leading_block_dimensions = Some(GemmOperands {
        a: 8,
        b: 32,
        c: 32,
    });
    assert!(matches!(
        GemmKernel::new(&desc, &device()).unwrap_err(),
        DescriptorError::LeadingBlockDimensionTooSmall {
            provided: 8,
            expected: 16,
            ..
        }
    ));
}

#[test]
fn oversized_leading_block_dimension_is_accepted() {
    let mut desc = descriptor((64, 64, 64), Precision::F16);
    desc.block_dimensions = Some((32, 32, 16));
    desc.leading_block_dimensions = Some(GemmOperands {
        a: 20,
        b: 36,
        c: 40,
    });
    let kernel = GemmKernel::new(&desc, &device()).expect("kernel");
    assert_eq!(kernel.leading_block_dimensions.a, 20);
    assert!(kernel.source.contains("constant ushort LEADING_BLOCK_A = 20;"));
}

#[test]
fn threadgroup_memory_formula() {
    let desc = descriptor((512, 512, 512), Precision::F16);
    let kernel =
        GemmKernel::new(&desc, &DeviceProperties::desktop()).expect("kernel");
    // Blocks 48x48x32: A = 32*48*2, B = 48*32*2, C = 48*48*2.
    assert_eq!(kernel.threadgroup_memory_allocation, 6144);

    let desc = descriptor((512, 512, 512), Precision::F32);
    let kernel = GemmKernel::new(&desc, &device()).expect("kernel");
    // Blocks 32x32x8: A + B = 2 * 8*32*4, C = 32*32*4.
    assert_eq!(kernel.threadgroup_memory_allocation, 4096);
}

#[test]
fn threadgroup_memory_limit_is_enforced() {
    let mut desc = descriptor((512, 512, 512), Precision::F32);
    desc.block_dimensions = Some((96, 96, 64));
    assert!(matches!(
        GemmKernel::new(&desc, &device()).unwrap_err(),
        DescriptorError::ThreadgroupMemoryExceeded { .. }
    ));
}

#[test]
fn identical_descriptors_emit_identical_source() {
    let mut desc = descriptor((151, 80, 151), Precision::F16);
    desc.transpose_state = (true, false);
    desc.load_previous_c = true;
    let first = GemmKernel::new(&desc, &device()).expect("kernel");
    let second = GemmKernel::new(&desc, &device()).expect("kernel");
    assert_eq!(first.source, second.source);
    assert_eq!(first.block_dimensions, second.block_dimensions);
    assert_eq!(
        first.threadgroup_memory_allocation,
        second.threadgroup_memory_allocation
    );
}

#[test]
fn sampled_descriptors_synthesise_deterministically() {
    let precisions = [Precision::F32, Precision::F16, Precision::BF16];
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..32 {
        let mut desc = descriptor(
            (
                rng.gen_range(1..512),
                rng.gen_range(1..512),
                rng.gen_range(1..512),
            ),
            precisions[rng.gen_range(0..precisions.len())],
        );
        desc.transpose_state = (rng.gen(), rng.gen());
        desc.load_previous_c = rng.gen();
        desc.prefer_async_store = rng.gen();
        let first = GemmKernel::new(&desc, &device()).expect("kernel");
        let second = GemmKernel::new(&desc, &device()).expect("kernel");
        assert_eq!(first.source, second.source);
        assert_eq!(first.threadgroup_size, second.threadgroup_size);
    }
}

#[test]
fn variants_emit_distinct_source() {
    let base = descriptor((64, 64, 64), Precision::F16);
    let base_kernel = GemmKernel::new(&base, &device()).expect("kernel");

    let mut transposed = base.clone();
    transposed.transpose_state = (true, false);
    let transposed_kernel =
        GemmKernel::new(&transposed, &device()).expect("kernel");
    assert_ne!(base_kernel.source, transposed_kernel.source);

    let f32_kernel =
        GemmKernel::new(&descriptor((64, 64, 64), Precision::F32), &device())
            .expect("kernel");
    assert_ne!(base_kernel.source, f32_kernel.source);
}

#[test]
fn source_declares_entry_point_and_constants() {
    let desc = descriptor((64, 64, 64), Precision::F16);
    let kernel = GemmKernel::new(&desc, &device()).expect("kernel");
    let source = &kernel.source;
    assert!(source.contains("kernel void gemm"));
    assert!(source.contains("constant uint M [[function_constant(0)]];"));
    assert!(source.contains("constant uint N [[function_constant(1)]];"));
    assert!(source.contains("constant uint K [[function_constant(2)]];"));
    assert!(source.contains("*A [[buffer(0)]]"));
    assert!(source.contains("*B [[buffer(1)]]"));
    assert!(source.contains("*C [[buffer(2)]]"));
    assert!(source.contains("#pragma clang loop unroll(full)"));
    assert!(source.contains("constant uint M_SHIFT"));
    assert!(source.contains("constant uint N_SHIFT"));
    assert!(source.contains("simdgroup_multiply_accumulate"));
    assert!(source.contains("block_event"));
    assert!(source.contains("threadgroup_barrier(mem_flags::mem_threadgroup)"));
}

#[test]
fn load_previous_c_changes_the_prologue() {
    let mut desc = descriptor((64, 64, 64), Precision::F16);
    let overwrite = GemmKernel::new(&desc, &device()).expect("kernel");
    assert!(overwrite
        .source
        .contains("make_filled_simdgroup_matrix"));
    // Accumulating kernels never shift edge blocks: overlapped blocks
    // would race on the read-modify-write of C.
    assert!(overwrite.source.contains("m0 -= M_SHIFT;"));

    desc.load_previous_c = true;
    let accumulate = GemmKernel::new(&desc, &device()).expect("kernel");
    assert!(!accumulate.source.contains("m0 -= M_SHIFT;"));
    assert!(accumulate.source.contains("simdgroup_load(c_frags[i][j]"));
}

#[test]
fn prefer_async_store_disables_the_direct_path() {
    let mut desc = descriptor((64, 64, 64), Precision::F16);
    desc.prefer_async_store = true;
    let kernel = GemmKernel::new(&desc, &device()).expect("kernel");
    assert!(kernel.source.contains("bool direct_c = false;"));
}

#[test]
fn device_leading_dimension_override_is_baked() {
    let mut desc = descriptor((64, 80, 64), Precision::F16);
    desc.leading_dimensions = Some(GemmOperands {
        a: 96,
        b: 80,
        c: 80,
    });
    let kernel = GemmKernel::new(&desc, &device()).expect("kernel");
    assert_eq!(kernel.leading_dimensions.a, 96);
    assert!(kernel.source.contains("constant uint LEADING_A = 96;"));

    let natural = descriptor((64, 80, 64), Precision::F16);
    let kernel = GemmKernel::new(&natural, &device()).expect("kernel");
    assert_eq!(kernel.leading_dimensions.a, 64);
    assert!(kernel.source.contains("constant uint LEADING_A = K;"));
    assert!(kernel.source.contains("constant uint LEADING_C = N;"));
}

#[test]
fn undersized_device_leading_dimension_is_rejected() {
    let mut desc = descriptor((64, 80, 64), Precision::F16);
    desc.leading_dimensions = Some(GemmOperands {
        a: 32,
        b: 80,
        c: 80,
    });
    assert!(matches!(
        GemmKernel::new(&desc, &device()).unwrap_err(),
        DescriptorError::LeadingDimensionTooSmall {
            provided: 32,
            expected: 64,
            ..
        }
    ));
}

#[test]
fn zero_dimensions_are_rejected() {
    let desc = descriptor((0, 64, 64), Precision::F32);
    assert_eq!(
        GemmKernel::new(&desc, &device()).unwrap_err(),
        DescriptorError::ZeroDimension
    );
}
