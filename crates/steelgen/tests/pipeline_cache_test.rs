use std::sync::{
    Arc, Barrier,
    atomic::{AtomicUsize, Ordering},
};
use std::thread;
use std::time::Duration;

use steelgen::{
    AttentionDescriptor, AttentionKernelType, AttentionOperands,
    DeviceProperties, GemmDescriptor, GemmOperands, KernelError,
    PipelineCache, PipelineCompiler, Precision,
};

/// Counts compilations and can fail a configurable number of times.
struct MockCompiler {
    compiles: AtomicUsize,
    failures_remaining: AtomicUsize,
    delay: Duration,
}

impl MockCompiler {
    fn new() -> Self {
        Self {
            compiles: AtomicUsize::new(0),
            failures_remaining: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    fn failing_once() -> Self {
        Self {
            failures_remaining: AtomicUsize::new(1),
            ..Self::new()
        }
    }

    fn slow() -> Self {
        Self {
            delay: Duration::from_millis(20),
            ..Self::new()
        }
    }

    fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }
}

impl PipelineCompiler for &MockCompiler {
    type Pipeline = usize;

    fn compile(
        &self,
        _function_name: &str,
        source: &str,
    ) -> Result<Self::Pipeline, String> {
        thread::sleep(self.delay);
        if self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok()
        {
            return Err("mock front end rejected the source".to_string());
        }
        self.compiles.fetch_add(1, Ordering::SeqCst);
        Ok(source.len())
    }
}

fn gemm_descriptor(n: u32) -> GemmDescriptor {
    GemmDescriptor::new(
        (n, n, n),
        GemmOperands::splat(Precision::F16),
        (false, false),
    )
}

fn attention_descriptor(n: u32) -> AttentionDescriptor {
    AttentionDescriptor::new(
        (n, n, 32),
        AttentionOperands::splat(Precision::F32),
        AttentionKernelType::Forward {
            store_logsumexp: true,
        },
    )
}

#[test]
fn repeated_registration_compiles_once() {
    let compiler = MockCompiler::new();
    let cache = PipelineCache::new(&compiler, DeviceProperties::default());
    let descriptor = gemm_descriptor(64);

    let first = cache.register_gemm(&descriptor).expect("register");
    let second = cache.register_gemm(&descriptor).expect("register");
    assert_eq!(compiler.compile_count(), 1);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.kernel.matrix_dimensions, (64, 64, 64));
}

#[test]
fn distinct_fingerprints_compile_independently() {
    let compiler = MockCompiler::new();
    let cache = PipelineCache::new(&compiler, DeviceProperties::default());

    cache.register_gemm(&gemm_descriptor(64)).expect("register");
    cache.register_gemm(&gemm_descriptor(128)).expect("register");
    cache
        .register_attention(&attention_descriptor(64))
        .expect("register");
    assert_eq!(compiler.compile_count(), 3);
}

#[test]
fn concurrent_registration_compiles_at_most_once() {
    let compiler = MockCompiler::slow();
    let cache = Arc::new(PipelineCache::new(
        &compiler,
        DeviceProperties::default(),
    ));
    let descriptor = gemm_descriptor(96);
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    thread::scope(|scope| {
        for _ in 0..threads {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            let descriptor = descriptor.clone();
            scope.spawn(move || {
                barrier.wait();
                cache.register_gemm(&descriptor).expect("register");
            });
        }
    });
    assert_eq!(compiler.compile_count(), 1);
}

#[test]
fn failed_compilation_is_not_cached() {
    let compiler = MockCompiler::failing_once();
    let cache = PipelineCache::new(&compiler, DeviceProperties::default());
    let descriptor = gemm_descriptor(64);

    let error = cache.register_gemm(&descriptor).unwrap_err();
    let KernelError::Compilation(compilation) = error else {
        panic!("expected a compilation error");
    };
    assert_eq!(compilation.function_name, "gemm");
    assert!(compilation.source_text.contains("kernel void gemm"));

    // The entry was not inserted; the next attempt compiles again and
    // succeeds.
    cache.register_gemm(&descriptor).expect("register");
    assert_eq!(compiler.compile_count(), 1);
}

#[test]
fn descriptor_errors_skip_compilation() {
    let compiler = MockCompiler::new();
    let cache = PipelineCache::new(&compiler, DeviceProperties::default());
    let mut descriptor = gemm_descriptor(64);
    descriptor.register_precisions = Some(GemmOperands {
        a: Precision::F16,
        b: Precision::BF16,
        c: Precision::F32,
    });

    assert!(matches!(
        cache.register_gemm(&descriptor).unwrap_err(),
        KernelError::Descriptor(_)
    ));
    assert_eq!(compiler.compile_count(), 0);
}

#[test]
fn attention_pipelines_share_the_cache() {
    let compiler = MockCompiler::new();
    let cache = PipelineCache::new(&compiler, DeviceProperties::default());
    let descriptor = attention_descriptor(128);

    let first = cache.register_attention(&descriptor).expect("register");
    let second = cache.register_attention(&descriptor).expect("register");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(compiler.compile_count(), 1);
    assert_eq!(first.kernel.block_dimensions, (32, 32));
}
