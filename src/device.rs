//! Interface to the GPU runtime.
//!
//! The generator never talks to a driver directly. Everything it needs from the runtime (source
//! compilation, kernel lookup, occupancy queries, launches, memory and streams) goes through the
//! [`Device`] trait, and host vectors are accessed through [`DeviceArray`].
use fenris_launch::LaunchConfig;
use std::fmt;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// An address in device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Pointer to the entry `count` elements of `elem_size` bytes past `self`.
    pub fn offset(&self, count: usize, elem_size: usize) -> DevicePtr {
        DevicePtr(self.0 + (count * elem_size) as u64)
    }
}

/// A vector of scalars living in device memory.
///
/// Access follows a borrow/restore protocol: every successful `read`, `read_write` or `write` must
/// be paired with a call to `restore` once the kernel using the pointer has been issued.
pub trait DeviceArray: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> eyre::Result<DevicePtr>;

    fn read_write(&self) -> eyre::Result<DevicePtr>;

    /// Access for writing only; previous contents need not be preserved.
    fn write(&self) -> eyre::Result<DevicePtr> {
        self.read_write()
    }

    fn restore(&self) -> eyre::Result<()>;
}

impl Debug for dyn DeviceArray {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceArray(len = {})", self.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    pub multiprocessor_count: usize,
    pub max_threads_dim: [usize; 3],
    pub warp_size: usize,
    pub max_shared_memory_per_block: usize,
}

/// Result of an occupancy query for a compiled kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupancy {
    /// Minimum grid size needed to reach full occupancy.
    pub min_grid_size: usize,
    /// Block size achieving full occupancy.
    pub block_size: usize,
}

/// A value per input field and per output field of an operator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldSlots<T> {
    pub inputs: Vec<T>,
    pub outputs: Vec<T>,
}

impl<T: Clone> FieldSlots<T> {
    pub fn filled(num_inputs: usize, num_outputs: usize, value: T) -> Self {
        Self {
            inputs: vec![value.clone(); num_inputs],
            outputs: vec![value; num_outputs],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PointsArgs {
    /// Number of points in each element.
    pub num_per_elem: DevicePtr,
    /// Offsets of the points restriction.
    pub indices: DevicePtr,
    pub coords: DevicePtr,
}

/// Arguments passed to every generated kernel, in signature order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KernelArgs {
    pub num_elem: usize,
    pub context: DevicePtr,
    pub indices: FieldSlots<DevicePtr>,
    pub fields: FieldSlots<DevicePtr>,
    pub b: FieldSlots<DevicePtr>,
    pub g: FieldSlots<DevicePtr>,
    pub w: DevicePtr,
    pub points: PointsArgs,
    /// Output array of the assembly kernels.
    pub values: Option<DevicePtr>,
}

/// Source text of a kernel ready for runtime compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSource {
    pub code: String,
    pub entry_point: String,
    /// Compile-time definitions passed to the runtime compiler.
    pub defines: Vec<(String, i64)>,
}

impl KernelSource {
    pub fn define(&self, name: &str) -> Option<i64> {
        self.defines
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| *value)
    }
}

/// A GPU runtime able to compile and launch generated kernels.
///
/// Errors returned from [`Device::compile`] and [`Device::launch`] are recoverable: the operator
/// switches to its reference backend. All other errors are propagated to the caller.
pub trait Device: Send + Sync {
    type Module: Send + Sync;
    type Function: Send + Sync;
    type Stream: Send + Sync;

    fn properties(&self) -> &DeviceProperties;

    fn compile(&self, source: &KernelSource) -> eyre::Result<Self::Module>;

    fn get_kernel(&self, module: &Self::Module, name: &str) -> eyre::Result<Self::Function>;

    fn unload(&self, module: Self::Module) -> eyre::Result<()>;

    /// Queries the block size maximizing occupancy of `function`.
    ///
    /// `dynamic_shared_memory` maps a block size to the dynamic shared memory it requires, and
    /// `block_size_limit` bounds the block sizes considered.
    fn occupancy(
        &self,
        function: &Self::Function,
        dynamic_shared_memory: &dyn Fn(usize) -> usize,
        block_size_limit: usize,
    ) -> eyre::Result<Occupancy>;

    fn launch(
        &self,
        function: &Self::Function,
        config: &LaunchConfig,
        stream: Option<&Self::Stream>,
        args: &KernelArgs,
    ) -> eyre::Result<()>;

    /// Copies host scalars to a new device allocation.
    fn upload_scalars(&self, data: &[f64]) -> eyre::Result<DevicePtr>;

    /// Copies host integers to a new device allocation.
    fn upload_indices(&self, data: &[i32]) -> eyre::Result<DevicePtr>;

    fn free(&self, ptr: DevicePtr) -> eyre::Result<()>;

    fn create_vector(&self, len: usize) -> eyre::Result<Arc<dyn DeviceArray>>;

    fn create_stream(&self) -> eyre::Result<Self::Stream>;

    fn destroy_stream(&self, stream: Self::Stream) -> eyre::Result<()>;

    fn synchronize(&self) -> eyre::Result<()>;
}
