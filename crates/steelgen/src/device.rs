use serde::{Deserialize, Serialize};

/// Device performance class, following Apple's GPU family taxonomy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum DeviceClass {
    /// iPhone/iPad integrated GPUs.
    Phone,
    /// Base Mac integrated GPUs.
    Integrated,
    /// Pro/Max/Ultra-class GPUs.
    Desktop,
}

impl DeviceClass {
    pub fn is_high_performance(&self) -> bool {
        matches!(self, Self::Desktop)
    }
}

/// Static characteristics of the target GPU that influence tile selection
/// and dispatch validation. Defaults describe a base Apple-silicon part.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct DeviceProperties {
    pub class: DeviceClass,
    /// Threadgroup memory available to one threadgroup, in bytes.
    pub threadgroup_memory_limit: u32,
    pub max_threads_per_threadgroup: u32,
    /// Conservative per-dimension bound on threadgroups in a grid.
    pub max_threadgroups_per_dimension: u32,
}

impl Default for DeviceProperties {
    fn default() -> Self {
        Self {
            class: DeviceClass::Integrated,
            threadgroup_memory_limit: 32_768,
            max_threads_per_threadgroup: 1_024,
            max_threadgroups_per_dimension: 65_535,
        }
    }
}

impl DeviceProperties {
    pub fn desktop() -> Self {
        Self {
            class: DeviceClass::Desktop,
            ..Self::default()
        }
    }
}

/// Compile capability supplied by the embedding runtime: turns emitted
/// shader source into an executable pipeline object. Errors are the
/// driver's diagnostic text; the cache attaches the offending source.
pub trait PipelineCompiler {
    type Pipeline: Clone + Send + Sync;

    fn compile(
        &self,
        function_name: &str,
        source: &str,
    ) -> Result<Self::Pipeline, String>;
}
