use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tracing::debug;

use crate::{
    device::{DeviceProperties, PipelineCompiler},
    error::{CompilationError, KernelError},
    kernel::{
        attention::{AttentionDescriptor, AttentionKernel},
        gemm::{GemmDescriptor, GemmKernel},
    },
};

/// A compiled GEMM variant: the synthesised kernel metadata plus the
/// driver's pipeline object.
#[derive(Debug)]
pub struct GemmPipeline<P> {
    pub kernel: Arc<GemmKernel>,
    pub pipeline: P,
}

#[derive(Debug)]
pub struct AttentionPipeline<P> {
    pub kernel: Arc<AttentionKernel>,
    pub pipeline: P,
}

type Slot<T> = Arc<Mutex<Option<Arc<T>>>>;

/// Fingerprint-keyed pipeline cache. Each distinct descriptor is
/// synthesised and compiled at most once per cache; concurrent callers
/// with the same fingerprint block on a per-fingerprint mutex while one of
/// them builds, and callers with different fingerprints proceed in
/// parallel. The outer map lock is held only long enough to find or
/// create the slot. Failed compilations leave no entry behind.
///
/// The embedding process typically keeps one cache per device for its
/// whole lifetime.
pub struct PipelineCache<C: PipelineCompiler> {
    compiler: C,
    device: DeviceProperties,
    gemm: Mutex<HashMap<GemmDescriptor, Slot<GemmPipeline<C::Pipeline>>>>,
    attention: Mutex<
        HashMap<AttentionDescriptor, Slot<AttentionPipeline<C::Pipeline>>>,
    >,
}

impl<C: PipelineCompiler> PipelineCache<C> {
    pub fn new(compiler: C, device: DeviceProperties) -> Self {
        Self {
            compiler,
            device,
            gemm: Mutex::new(HashMap::new()),
            attention: Mutex::new(HashMap::new()),
        }
    }

    pub fn device_properties(&self) -> &DeviceProperties {
        &self.device
    }

    pub fn register_gemm(
        &self,
        descriptor: &GemmDescriptor,
    ) -> Result<Arc<GemmPipeline<C::Pipeline>>, KernelError> {
        let slot = {
            let mut map = self.gemm.lock().unwrap();
            map.entry(descriptor.clone()).or_default().clone()
        };
        let mut entry = slot.lock().unwrap();
        if let Some(built) = entry.as_ref() {
            debug!(function = "gemm", "pipeline cache hit");
            return Ok(built.clone());
        }
        let kernel = GemmKernel::new(descriptor, &self.device)?;
        debug!(
            function = "gemm",
            source_bytes = kernel.source.len(),
            "compiling pipeline"
        );
        match self.compiler.compile("gemm", &kernel.source) {
            Ok(pipeline) => {
                let built = Arc::new(GemmPipeline {
                    kernel: Arc::new(kernel),
                    pipeline,
                });
                *entry = Some(built.clone());
                Ok(built)
            }
            Err(reason) => Err(KernelError::Compilation(CompilationError {
                function_name: "gemm".to_string(),
                reason,
                source_text: kernel.source,
            })),
        }
    }

    pub fn register_attention(
        &self,
        descriptor: &AttentionDescriptor,
    ) -> Result<Arc<AttentionPipeline<C::Pipeline>>, KernelError> {
        let slot = {
            let mut map = self.attention.lock().unwrap();
            map.entry(descriptor.clone()).or_default().clone()
        };
        let mut entry = slot.lock().unwrap();
        if let Some(built) = entry.as_ref() {
            debug!(function = "attention", "pipeline cache hit");
            return Ok(built.clone());
        }
        let kernel = AttentionKernel::new(descriptor, &self.device)?;
        debug!(
            function = "attention",
            source_bytes = kernel.source.len(),
            "compiling pipeline"
        );
        match self.compiler.compile("attention", &kernel.source) {
            Ok(pipeline) => {
                let built = Arc::new(AttentionPipeline {
                    kernel: Arc::new(kernel),
                    pipeline,
                });
                *entry = Some(built.clone());
                Ok(built)
            }
            Err(reason) => Err(KernelError::Compilation(CompilationError {
                function_name: "attention".to_string(),
                reason,
                source_text: kernel.source,
            })),
        }
    }
}
