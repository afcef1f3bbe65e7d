//! Launch configuration planning for element-parallel GPU kernels.
//!
//! Generated operator kernels map one element to a `x * y` grid of threads and pack several
//! elements into the `z` dimension of a thread block. This crate chooses how many elements go into
//! each block, given the limits reported by the device runtime's occupancy query.
//!
//! The planner does not depend on any particular GPU runtime and may be used on its own.
//!
//! # Waste
//!
//! Hardware schedules threads in whole warps. Consider elements with `7x7` threads each (a
//! `7x7x7` element that loops over its last dimension). Packing two elements gives 98 useful
//! threads, which occupy 128 hardware threads. If the multiprocessor can host 352 threads, two
//! such blocks fit but a third does not. Packing three elements instead gives 147 useful threads in
//! 160 slots, and two such blocks fit. The planner scores every candidate by the number of
//! hardware threads left idle, and picks the candidate with the least waste.
//!
//! Smaller blocks synchronize less, so a larger candidate with equal waste is only preferred while
//! the block stays within [`LaunchTuning::sync_threshold`] threads.
use num::Integer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Display, Formatter};

/// Library-wide error type.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The per-element thread shape has a zero extent.
    EmptyThreadShape,
    /// The device reported a warp size of zero.
    InvalidWarpSize,
    /// The device reported a zero extent for the `z` block dimension.
    InvalidThreadsZ,
    /// Not even a single element fits in the shared memory available to a block.
    SharedMemoryExceeded { required: usize, available: usize },
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyThreadShape => write!(f, "Thread shape per element must be non-empty"),
            Self::InvalidWarpSize => write!(f, "Warp size must be positive"),
            Self::InvalidThreadsZ => write!(f, "Maximum number of threads in z must be positive"),
            Self::SharedMemoryExceeded { required, available } => {
                write!(
                    f,
                    "A single element requires {required} bytes of shared memory, \
                     but only {available} bytes are available per block"
                )
            }
        }
    }
}

impl std::error::Error for Error {}

/// Tunable thresholds for the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchTuning {
    /// Largest block (in threads) for which a larger candidate with equal waste is preferred.
    pub sync_threshold: usize,
    /// Target number of threads per block for non-tensor elements.
    pub nontensor_block_threads: usize,
}

impl Default for LaunchTuning {
    fn default() -> Self {
        Self {
            sync_threshold: 128,
            nontensor_block_threads: 512,
        }
    }
}

/// Device limits relevant to planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Block size suggested by the occupancy query for the kernel being launched.
    pub max_threads_per_block: usize,
    /// Number of such blocks that may be resident on a single multiprocessor.
    pub blocks_per_multiprocessor: usize,
    pub warp_size: usize,
    pub max_threads_z: usize,
    pub max_shared_memory_per_block: usize,
}

impl DeviceLimits {
    pub fn threads_per_multiprocessor(&self) -> usize {
        self.blocks_per_multiprocessor * self.max_threads_per_block
    }
}

/// How threads are laid out within an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementLayout {
    /// Tensor-product elements, with block size chosen by waste minimization.
    Tensor,
    /// Non-tensor elements, with a fixed target block size.
    NonTensor,
}

/// A request for a launch configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchRequest {
    pub num_elem: usize,
    /// Threads per element in the `x` and `y` block dimensions.
    pub thread_shape: [usize; 2],
    pub layout: ElementLayout,
    /// Size in bytes of a scalar, one of which is staged in shared memory per thread.
    pub scalar_size: usize,
}

impl LaunchRequest {
    pub fn threads_per_element(&self) -> usize {
        self.thread_shape[0] * self.thread_shape[1]
    }
}

/// A 3D block shape together with the grid size and dynamic shared memory for a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub block: [usize; 3],
    pub grid: usize,
    pub shared_memory_bytes: usize,
}

impl LaunchConfig {
    pub fn block_volume(&self) -> usize {
        self.block.iter().product()
    }

    /// Number of elements processed by each block.
    pub fn elements_per_block(&self) -> usize {
        self.block[2]
    }

    pub fn total_threads(&self) -> usize {
        self.block_volume() * self.grid
    }
}

/// Number of hardware threads left idle on a multiprocessor when blocks hold `elems_per_block`
/// elements of `threads_per_element` threads each.
///
/// Each block is padded to a whole number of warps.
pub fn waste(
    threads_per_multiprocessor: usize,
    warp_size: usize,
    threads_per_element: usize,
    elems_per_block: usize,
) -> usize {
    let useful_threads_per_block = threads_per_element * elems_per_block;
    let block_size = Integer::div_ceil(&useful_threads_per_block, &warp_size) * warp_size;
    let blocks_per_multiprocessor = threads_per_multiprocessor / block_size;
    threads_per_multiprocessor.saturating_sub(useful_threads_per_block * blocks_per_multiprocessor)
}

/// Block shape baked into a kernel at compile time.
///
/// Each element gets `t x t` threads (`t x 1` in 1D) with `t = max(p_1d, q_1d)`, and the `z`
/// dimension holds a fixed number of elements depending on dimension and `t`.
pub fn fixed_block_shape(dim: usize, p_1d: usize, q_1d: usize) -> [usize; 3] {
    let t = p_1d.max(q_1d).max(1);
    match dim {
        0 | 1 => {
            let elems_per_block = if 64 * t > 256 { 256 / t } else { 64 };
            [t, 1, elems_per_block.max(1)]
        }
        2 => [t, t, if t < 4 { 16 } else { 2 }],
        _ => {
            let elems_per_block = if t < 6 {
                4
            } else if t < 8 {
                2
            } else {
                1
            };
            [t, t, elems_per_block]
        }
    }
}

/// Chooses launch configurations for element-parallel kernels.
#[derive(Debug, Clone, Default)]
pub struct LaunchPlanner {
    tuning: LaunchTuning,
}

impl LaunchPlanner {
    pub fn new(tuning: LaunchTuning) -> Self {
        Self { tuning }
    }

    pub fn tuning(&self) -> &LaunchTuning {
        &self.tuning
    }

    /// Plans a launch covering `request.num_elem` elements.
    ///
    /// The resulting grid always covers every element, and the shared memory request never
    /// exceeds the device's per-block limit.
    pub fn plan(&self, request: &LaunchRequest, limits: &DeviceLimits) -> Result<LaunchConfig, Error> {
        let [x, y] = request.thread_shape;
        if x == 0 || y == 0 {
            return Err(Error::EmptyThreadShape);
        }
        if limits.warp_size == 0 {
            return Err(Error::InvalidWarpSize);
        }
        if limits.max_threads_z == 0 {
            return Err(Error::InvalidThreadsZ);
        }

        let threads_per_element = request.threads_per_element();
        let shared_per_element = threads_per_element * request.scalar_size;
        if shared_per_element > limits.max_shared_memory_per_block {
            return Err(Error::SharedMemoryExceeded {
                required: shared_per_element,
                available: limits.max_shared_memory_per_block,
            });
        }
        let max_elems_for_shared = limits
            .max_shared_memory_per_block
            .checked_div(shared_per_element)
            .unwrap_or(usize::MAX);
        let max_elems_per_block = limits.max_threads_z.min(max_elems_for_shared);

        let elems_per_block = match request.layout {
            ElementLayout::Tensor => {
                let bound = (limits.max_threads_per_block / threads_per_element)
                    .min(request.num_elem)
                    .min(max_elems_per_block);
                self.minimize_waste(threads_per_element, bound, limits)
            }
            ElementLayout::NonTensor => (self.tuning.nontensor_block_threads / x)
                .max(1)
                .min(max_elems_per_block),
        };

        let block = [x, y, elems_per_block];
        Ok(LaunchConfig {
            block,
            grid: Integer::div_ceil(&request.num_elem, &elems_per_block),
            shared_memory_bytes: x * y * elems_per_block * request.scalar_size,
        })
    }

    fn minimize_waste(&self, threads_per_element: usize, bound: usize, limits: &DeviceLimits) -> usize {
        let threads_per_multiprocessor = limits.threads_per_multiprocessor();
        let waste_of = |k| waste(threads_per_multiprocessor, limits.warp_size, threads_per_element, k);

        let mut best = 1;
        let mut best_waste = waste_of(1);
        for k in 2..=bound {
            let k_waste = waste_of(k);
            if k_waste < best_waste
                || (k_waste == best_waste && threads_per_element * k <= self.tuning.sync_threshold)
            {
                best = k;
                best_waste = k_waste;
            }
        }
        best
    }
}
