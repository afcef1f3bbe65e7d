//! Configuration of the kernel generator.
use fenris_launch::LaunchTuning;
use serde::{Deserialize, Serialize};

/// GPU programming model targeted by generated source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    Cuda,
    Hip,
}

impl Target {
    /// Tag used in type and kernel names, e.g. `Fields_Cuda`.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Cuda => "Cuda",
            Self::Hip => "Hip",
        }
    }

    /// Directory of the device templates below the JIT source root.
    pub fn template_dir(&self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::Hip => "hip",
        }
    }
}

/// Scalar type the generated kernels are compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarType {
    Float32,
    Float64,
}

impl ScalarType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenOptions {
    pub target: Target,
    pub scalar: ScalarType,
    pub tuning: LaunchTuning,
    /// Upper bound on dynamic shared memory passed to the occupancy query.
    pub dynamic_shared_memory_limit: usize,
    /// Root of the device template headers included by generated source.
    pub jit_source_root: String,
}

impl Default for GenOptions {
    fn default() -> Self {
        Self {
            target: Target::Cuda,
            scalar: ScalarType::Float64,
            tuning: LaunchTuning::default(),
            dynamic_shared_memory_limit: 0x10000,
            jit_source_root: "ceed/jit-source".to_string(),
        }
    }
}
