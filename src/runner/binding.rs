//! Binding of device arrays to kernel arguments and launch planning.
use super::{GenOperator, OperatorState};
use crate::cache::GeneratedKernel;
use crate::classify::OperatorShape;
use crate::codegen::{KernelKind, MatrixSource};
use crate::device::{Device, DeviceArray, DevicePtr, FieldSlots, KernelArgs, PointsArgs};
use crate::operator::{Basis, ElemRestriction, EvalMode, FieldVector, Operator};
use eyre::{eyre, WrapErr};
use fenris_launch::{DeviceLimits, ElementLayout, LaunchConfig, LaunchPlanner, LaunchRequest};
use log::debug;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Device arrays accessed for the duration of a launch.
#[derive(Default)]
pub(super) struct Borrowed<'a> {
    arrays: Vec<&'a dyn DeviceArray>,
}

impl<'a> Borrowed<'a> {
    pub fn read(&mut self, array: &'a dyn DeviceArray) -> eyre::Result<DevicePtr> {
        let ptr = array.read()?;
        self.arrays.push(array);
        Ok(ptr)
    }

    pub fn read_write(&mut self, array: &'a dyn DeviceArray) -> eyre::Result<DevicePtr> {
        let ptr = array.read_write()?;
        self.arrays.push(array);
        Ok(ptr)
    }

    pub fn write(&mut self, array: &'a dyn DeviceArray) -> eyre::Result<DevicePtr> {
        let ptr = array.write()?;
        self.arrays.push(array);
        Ok(ptr)
    }

    /// Restores every array, returning the first error.
    fn restore(self) -> eyre::Result<()> {
        let mut result = Ok(());
        for array in self.arrays.into_iter().rev() {
            if let Err(err) = array.restore() {
                result = result.and(Err(err));
            }
        }
        result
    }
}

/// Runs `f` with a set of borrowed arrays, and restores all of them afterwards whether or not `f`
/// succeeded.
pub(super) fn with_borrowed<'a, T>(f: impl FnOnce(&mut Borrowed<'a>) -> eyre::Result<T>) -> eyre::Result<T> {
    let mut borrowed = Borrowed::default();
    let result = f(&mut borrowed);
    let restored = borrowed.restore();
    let value = result?;
    restored?;
    Ok(value)
}

/// Number of points in each element, resident on the device.
///
/// The element count of an operator is fixed, so the counts are uploaded on first use and kept
/// until the operator is destroyed.
#[derive(Debug, Default)]
pub(super) struct PointsBuffer {
    ptr: Option<DevicePtr>,
}

impl PointsBuffer {
    pub fn get_or_upload<D: Device>(
        &mut self,
        device: &D,
        restriction: &ElemRestriction,
        num_elem: usize,
    ) -> eyre::Result<DevicePtr> {
        if let Some(ptr) = self.ptr {
            return Ok(ptr);
        }
        let counts = (0..num_elem)
            .map(|elem| i32::try_from(restriction.points_in_element(elem)))
            .collect::<Result<Vec<_>, _>>()
            .wrap_err("Number of points in element exceeds the index range")?;
        let ptr = device
            .upload_indices(&counts)
            .wrap_err("Failed to upload number of points per element")?;
        self.ptr = Some(ptr);
        debug!("Uploaded number of points for {num_elem} elements");
        Ok(ptr)
    }

    pub fn release<D: Device>(&mut self, device: &D) -> eyre::Result<()> {
        match self.ptr.take() {
            Some(ptr) => device.free(ptr),
            None => Ok(()),
        }
    }
}

/// Chebyshev interpolation tables uploaded for bases evaluated at points.
pub(super) type ChebyshevTables = FxHashMap<usize, (Arc<Basis>, DevicePtr)>;

fn resolve_matrix<D: Device>(
    device: &D,
    uploaded: &mut ChebyshevTables,
    source: Option<&MatrixSource>,
) -> eyre::Result<DevicePtr> {
    match source {
        None => Ok(DevicePtr::NULL),
        Some(MatrixSource::Resident(ptr)) => Ok(*ptr),
        Some(MatrixSource::ChebyshevInterp(basis)) => {
            let key = Arc::as_ptr(basis) as usize;
            if let Some((_, ptr)) = uploaded.get(&key) {
                return Ok(*ptr);
            }
            let table = basis
                .chebyshev_interp_1d
                .as_ref()
                .ok_or_else(|| eyre!("Basis has no Chebyshev interpolation table"))?;
            // Kernels read the table row by row
            let row_major = table.transpose();
            let ptr = device
                .upload_scalars(row_major.as_slice())
                .wrap_err("Failed to upload Chebyshev interpolation table")?;
            uploaded.insert(key, (Arc::clone(basis), ptr));
            Ok(ptr)
        }
    }
}

fn resolve_slots<T, U>(
    slots: &FieldSlots<T>,
    mut resolve: impl FnMut(&T) -> eyre::Result<U>,
) -> eyre::Result<FieldSlots<U>> {
    Ok(FieldSlots {
        inputs: slots.inputs.iter().map(&mut resolve).collect::<eyre::Result<_>>()?,
        outputs: slots.outputs.iter().map(&mut resolve).collect::<eyre::Result<_>>()?,
    })
}

/// Pointers to the field vectors of an operator.
///
/// Weights and active inputs of assembly kernels are bound to null. Outputs are only bound when
/// `active_output` is given.
fn bind_fields<'a>(
    operator: &'a Operator,
    borrowed: &mut Borrowed<'a>,
    active_input: DevicePtr,
    active_output: Option<DevicePtr>,
) -> eyre::Result<FieldSlots<DevicePtr>> {
    let mut fields = FieldSlots::filled(operator.inputs.len(), operator.outputs.len(), DevicePtr::NULL);
    for (ptr, field) in fields.inputs.iter_mut().zip(&operator.inputs) {
        if field.eval_mode == EvalMode::Weight {
            continue;
        }
        *ptr = match &field.vector {
            FieldVector::Active => active_input,
            FieldVector::Passive(vector) => borrowed.read(vector.as_ref())?,
            FieldVector::None => DevicePtr::NULL,
        };
    }
    if let Some(active_output) = active_output {
        for (ptr, field) in fields.outputs.iter_mut().zip(&operator.outputs) {
            *ptr = match &field.vector {
                FieldVector::Active => active_output,
                FieldVector::Passive(vector) => borrowed.read_write(vector.as_ref())?,
                FieldVector::None => DevicePtr::NULL,
            };
        }
    }
    Ok(fields)
}

/// Arguments of a single kernel run that vary between entry points.
pub(super) struct RunArgs<'s, S> {
    pub active_input: DevicePtr,
    /// Pointer bound to active outputs. `None` leaves every output unbound.
    pub active_output: Option<DevicePtr>,
    pub values: Option<DevicePtr>,
    pub stream: Option<&'s S>,
}

impl<D: Device> GenOperator<D> {
    /// Binds arguments and launches the built kernel of the given kind.
    ///
    /// Returns whether the kernel ran. If it did not, `kind` is marked for fallback. Every array
    /// accessed by the run is restored before returning.
    pub(super) fn run_kernel(
        &self,
        state: &mut OperatorState<D>,
        kind: KernelKind,
        args: RunArgs<'_, D::Stream>,
    ) -> eyre::Result<bool> {
        if self.operator.num_elem == 0 {
            return Ok(true);
        }
        let is_good = with_borrowed(|borrowed| self.bind_and_launch(&mut *state, kind, &args, borrowed))?;
        if !is_good {
            state.fallback.set(kind);
        }
        Ok(is_good)
    }

    fn bind_and_launch<'a>(
        &'a self,
        state: &mut OperatorState<D>,
        kind: KernelKind,
        args: &RunArgs<'_, D::Stream>,
        borrowed: &mut Borrowed<'a>,
    ) -> eyre::Result<bool> {
        let OperatorState {
            shape,
            cache,
            points: points_buffer,
            chebyshev,
            ..
        } = state;
        let kernel = cache
            .kernel(kind)
            .ok_or_else(|| eyre!("No compiled kernel for {kind}"))?;
        let shape = shape
            .as_ref()
            .ok_or_else(|| eyre!("Operator has not been classified"))?;
        let device = self.device.as_ref();
        let operator = self.operator.as_ref();
        let bindings = &kernel.bindings;

        let fields = bind_fields(operator, borrowed, args.active_input, args.active_output)?;
        let points = match &operator.points {
            Some(data) => PointsArgs {
                num_per_elem: points_buffer.get_or_upload(device, &data.restriction, operator.num_elem)?,
                indices: bindings.points_indices.unwrap_or(DevicePtr::NULL),
                coords: borrowed.read(data.coords.as_ref())?,
            },
            None => PointsArgs::default(),
        };
        let context = match &operator.qfunction.context {
            Some(context) => borrowed.read(context.as_ref())?,
            None => DevicePtr::NULL,
        };
        let resident = |ptr: &Option<DevicePtr>| -> eyre::Result<DevicePtr> { Ok(ptr.unwrap_or(DevicePtr::NULL)) };
        let kernel_args = KernelArgs {
            num_elem: operator.num_elem,
            context,
            indices: resolve_slots(&bindings.indices, resident)?,
            fields,
            b: resolve_slots(&bindings.b, |source| resolve_matrix(device, chebyshev, source.as_ref()))?,
            g: resolve_slots(&bindings.g, resident)?,
            w: bindings.w.unwrap_or(DevicePtr::NULL),
            points,
            values: args.values,
        };

        let Some(config) = self.plan(kernel, kind, shape)? else {
            return Ok(false);
        };
        if let Err(err) = device.launch(&kernel.function, &config, args.stream, &kernel_args) {
            debug!("Launch of {} failed: {err:#}", kernel.source.entry_point);
            return Ok(false);
        }
        if kind.is_assembly() {
            device.synchronize()?;
        }
        Ok(true)
    }

    /// Launch configuration for the current element count, or `None` if no valid configuration
    /// exists.
    fn plan(
        &self,
        kernel: &GeneratedKernel<D>,
        kind: KernelKind,
        shape: &OperatorShape,
    ) -> eyre::Result<Option<LaunchConfig>> {
        let scalar_size = self.options.scalar.size_in_bytes();
        let occupancy = self
            .device
            .occupancy(
                &kernel.function,
                &|threads| threads * scalar_size,
                self.options.dynamic_shared_memory_limit,
            )
            .wrap_err_with(|| format!("Occupancy query for {} failed", kernel.source.entry_point))?;

        let properties = self.device.properties();
        // Assembly at points processes a single element per block
        let single_element = matches!(kind, KernelKind::DiagonalAssembly | KernelKind::FullAssembly);
        let limits = DeviceLimits {
            max_threads_per_block: if single_element { 1 } else { occupancy.block_size },
            blocks_per_multiprocessor: occupancy
                .min_grid_size
                .checked_div(properties.multiprocessor_count)
                .unwrap_or(0),
            warp_size: properties.warp_size,
            max_threads_z: properties.max_threads_dim[2],
            max_shared_memory_per_block: properties.max_shared_memory_per_block,
        };

        let t = kernel.thread_1d;
        let request = LaunchRequest {
            num_elem: self.operator.num_elem,
            thread_shape: [t, if !shape.is_all_tensor || shape.max_dim == 1 { 1 } else { t }],
            layout: if shape.is_all_tensor || single_element {
                ElementLayout::Tensor
            } else {
                ElementLayout::NonTensor
            },
            scalar_size,
        };
        match LaunchPlanner::new(self.options.tuning).plan(&request, &limits) {
            Ok(config) => Ok(Some(config)),
            Err(err) => {
                debug!("No launch configuration for {}: {err}", kernel.source.entry_point);
                Ok(None)
            }
        }
    }
}
