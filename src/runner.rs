//! Evaluation of operators through generated kernels.
//!
//! A [`GenOperator`] wraps an [`Operator`] together with a reference implementation of the same
//! operator. Each entry point builds the corresponding kernel on first use, binds device arrays,
//! plans and issues the launch. Whenever a kernel cannot be built or launched, the call is
//! completed by the [`ReferenceOperator`] instead, and every later call of the same kind goes
//! there directly.
use crate::cache::{CompileCache, FallbackState};
use crate::classify::{classify, OperatorShape};
use crate::codegen::KernelKind;
use crate::device::{Device, DeviceArray, KernelSource};
use crate::operator::{ElemRestriction, Operator};
use crate::options::GenOptions;
use eyre::eyre;
use log::warn;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

mod apply;
mod assembly;
mod binding;
mod composite;

use binding::{ChebyshevTables, PointsBuffer};

pub use composite::CompositeOperator;

/// Operator evaluation that does not rely on generated kernels.
pub trait ReferenceOperator: Send + Sync {
    /// Computes `output += A(input)`.
    fn apply_add(&self, input: Option<&dyn DeviceArray>, output: &dyn DeviceArray) -> eyre::Result<()>;

    fn assemble_qfunction(&self) -> eyre::Result<AssembledQFunction>;

    fn assemble_qfunction_update(&self, assembled: &AssembledQFunction) -> eyre::Result<()>;

    fn assemble_add_diagonal(&self, assembled: &dyn DeviceArray) -> eyre::Result<()>;

    /// Writes the element matrices of the operator, starting at `offset` in `values`.
    fn assemble_single(&self, offset: usize, values: &dyn DeviceArray) -> eyre::Result<()>;
}

/// The linearized QFunction at every quadrature point of every element.
#[derive(Debug, Clone)]
pub struct AssembledQFunction {
    pub vector: Arc<dyn DeviceArray>,
    /// Strided restriction with one component per pair of active input and output components.
    pub restriction: Arc<ElemRestriction>,
}

/// Mutable state of a [`GenOperator`].
struct OperatorState<D: Device> {
    shape: Option<OperatorShape>,
    cache: CompileCache<D>,
    fallback: FallbackState,
    points: PointsBuffer,
    /// Keyed by basis address.
    chebyshev: ChebyshevTables,
    destroyed: bool,
}

impl<D: Device> OperatorState<D> {
    fn new() -> Self {
        Self {
            shape: None,
            cache: CompileCache::new(),
            fallback: FallbackState::default(),
            points: PointsBuffer::default(),
            chebyshev: ChebyshevTables::default(),
            destroyed: false,
        }
    }
}

/// An operator evaluated by generated kernels.
pub struct GenOperator<D: Device> {
    device: Arc<D>,
    operator: Arc<Operator>,
    reference: Arc<dyn ReferenceOperator>,
    options: GenOptions,
    state: Mutex<OperatorState<D>>,
}

impl<D: Device> GenOperator<D> {
    pub fn new(
        device: Arc<D>,
        operator: Arc<Operator>,
        reference: Arc<dyn ReferenceOperator>,
        options: GenOptions,
    ) -> Self {
        Self {
            device,
            operator,
            reference,
            options,
            state: Mutex::new(OperatorState::new()),
        }
    }

    pub fn operator(&self) -> &Operator {
        &self.operator
    }

    pub fn options(&self) -> &GenOptions {
        &self.options
    }

    /// Kernel kinds that this operator evaluates with generated kernels.
    ///
    /// Other calls are forwarded to the reference operator without attempting generation.
    pub fn entry_points(&self) -> Vec<KernelKind> {
        KernelKind::ALL
            .into_iter()
            .filter(|&kind| self.supports(kind))
            .collect()
    }

    pub fn supports(&self, kind: KernelKind) -> bool {
        match kind {
            KernelKind::Apply => true,
            KernelKind::QFunctionAssembly => !self.operator.is_at_points(),
            KernelKind::DiagonalAssembly | KernelKind::FullAssembly => self.operator.is_at_points(),
        }
    }

    /// Whether calls of the given kind are currently forwarded to the reference operator.
    pub fn uses_fallback(&self, kind: KernelKind) -> bool {
        self.state.lock().fallback.is_set(kind)
    }

    /// Source of the compiled kernel of the given kind, if it has been built.
    pub fn kernel_source(&self, kind: KernelKind) -> Option<KernelSource> {
        self.state
            .lock()
            .cache
            .kernel(kind)
            .map(|kernel| kernel.source.clone())
    }

    /// Releases compiled modules and device buffers owned by the operator.
    ///
    /// The operator cannot be evaluated afterwards. Destroying twice is a no-op.
    pub fn destroy(&self) -> eyre::Result<()> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Ok(());
        }
        state.destroyed = true;

        let device = self.device.as_ref();
        let mut result = state.cache.release(device);
        result = result.and(state.points.release(device));
        for (_, (_, ptr)) in state.chebyshev.drain() {
            if let Err(err) = device.free(ptr) {
                result = result.and(Err(err));
            }
        }
        result
    }

    /// Locks the operator state, failing if the operator was destroyed.
    fn lock(&self) -> eyre::Result<MutexGuard<'_, OperatorState<D>>> {
        let state = self.state.lock();
        if state.destroyed {
            return Err(eyre!("Operator has been destroyed"));
        }
        Ok(state)
    }

    /// Ensures that the kernel of the given kind is built. Returns whether it can be launched.
    fn ensure_built(&self, state: &mut OperatorState<D>, kind: KernelKind) -> eyre::Result<bool> {
        if state.fallback.is_set(kind) {
            return Ok(false);
        }
        if state.cache.state(kind).is_terminal() {
            return Ok(state.cache.is_ready(kind));
        }
        let shape = self.classified_shape(state)?;
        state.cache.build(
            kind,
            self.device.as_ref(),
            &self.operator,
            &shape,
            &self.options,
            &mut state.fallback,
        )
    }

    /// Shape of the operator, classified on first use. Configuration errors are not cached.
    fn classified_shape(&self, state: &mut OperatorState<D>) -> eyre::Result<OperatorShape> {
        if let Some(shape) = &state.shape {
            return Ok(shape.clone());
        }
        let shape = classify(&self.operator)?;
        state.shape = Some(shape.clone());
        Ok(shape)
    }

    /// Reports configuration errors without building or launching anything.
    pub(crate) fn check_configuration(&self) -> eyre::Result<()> {
        let mut state = self.lock()?;
        self.classified_shape(&mut state).map(|_| ())
    }

    /// Builds an assembly kernel, which requires the apply kernel to build as well.
    fn ensure_assembly_built(&self, state: &mut OperatorState<D>, kind: KernelKind) -> eyre::Result<bool> {
        if state.fallback.is_set(kind) {
            return Ok(false);
        }
        let is_good = self.ensure_built(state, KernelKind::Apply)? && self.ensure_built(state, kind)?;
        if !is_good {
            state.fallback.set(kind);
        }
        Ok(is_good)
    }
}

impl<D: Device> Drop for GenOperator<D> {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            warn!("Failed to release generated operator {}: {err:#}", self.operator.qfunction.name);
        }
    }
}
