//! Per-operator cache of compiled kernels.
//!
//! Every [`KernelKind`] of an operator moves through the states of [`BuildState`] at most once:
//! a kernel is synthesized and compiled on first use, and the outcome is kept until the operator
//! is destroyed. Kinds that cannot be generated, or whose compilation fails, are marked in
//! [`FallbackState`] so that later calls go straight to the reference backend.
use crate::classify::{unsupported_reason, OperatorShape};
use crate::codegen::{synthesize, FieldBindings, KernelKind};
use crate::device::{Device, KernelSource};
use crate::error::GenError;
use crate::operator::Operator;
use crate::options::GenOptions;
use eyre::{eyre, WrapErr};
use log::{debug, warn};
use std::fmt;
use std::fmt::{Debug, Formatter};

/// A compiled kernel together with everything needed to launch it.
pub struct GeneratedKernel<D: Device> {
    pub source: KernelSource,
    pub bindings: FieldBindings,
    pub thread_1d: usize,
    pub block: [usize; 3],
    pub module: D::Module,
    pub function: D::Function,
}

impl<D: Device> Debug for GeneratedKernel<D> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedKernel")
            .field("entry_point", &self.source.entry_point)
            .field("thread_1d", &self.thread_1d)
            .field("block", &self.block)
            .finish_non_exhaustive()
    }
}

pub enum BuildState<D: Device> {
    Unbuilt,
    Building,
    Ready(GeneratedKernel<D>),
    Failed,
}

impl<D: Device> BuildState<D> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready(_) | Self::Failed)
    }
}

impl<D: Device> Debug for BuildState<D> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbuilt => write!(f, "Unbuilt"),
            Self::Building => write!(f, "Building"),
            Self::Ready(kernel) => f.debug_tuple("Ready").field(kernel).finish(),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Kernel kinds evaluated by the reference backend.
///
/// Flags are only ever set, never cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FallbackState {
    flags: [bool; 4],
}

impl FallbackState {
    pub fn is_set(&self, kind: KernelKind) -> bool {
        self.flags[kind.index()]
    }

    pub fn set(&mut self, kind: KernelKind) {
        self.flags[kind.index()] = true;
    }
}

pub struct CompileCache<D: Device> {
    slots: [BuildState<D>; 4],
}

impl<D: Device> Default for CompileCache<D> {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| BuildState::Unbuilt),
        }
    }
}

impl<D: Device> Debug for CompileCache<D> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.slots.iter()).finish()
    }
}

impl<D: Device> CompileCache<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, kind: KernelKind) -> &BuildState<D> {
        &self.slots[kind.index()]
    }

    pub fn kernel(&self, kind: KernelKind) -> Option<&GeneratedKernel<D>> {
        match self.state(kind) {
            BuildState::Ready(kernel) => Some(kernel),
            _ => None,
        }
    }

    pub fn is_ready(&self, kind: KernelKind) -> bool {
        self.kernel(kind).is_some()
    }

    pub fn is_failed(&self, kind: KernelKind) -> bool {
        matches!(self.state(kind), BuildState::Failed)
    }

    /// Builds the kernel of the given kind unless it was built before.
    ///
    /// Returns whether a compiled kernel is available. A kernel that cannot be generated or fails
    /// to compile marks `kind` in `fallback` and yields `Ok(false)`. Errors of the operator
    /// configuration and of the runtime are returned, and leave the slot unbuilt.
    pub fn build(
        &mut self,
        kind: KernelKind,
        device: &D,
        operator: &Operator,
        shape: &OperatorShape,
        options: &GenOptions,
        fallback: &mut FallbackState,
    ) -> eyre::Result<bool> {
        if fallback.is_set(kind) {
            return Ok(false);
        }
        let slot = &mut self.slots[kind.index()];
        match slot {
            BuildState::Ready(_) => return Ok(true),
            BuildState::Failed => return Ok(false),
            BuildState::Building => return Err(eyre!("Kernel for {kind} is already being built")),
            BuildState::Unbuilt => {}
        }

        *slot = BuildState::Building;
        match build_kernel(kind, device, operator, shape, options) {
            Ok(Some(kernel)) => {
                debug!("Built {kind} kernel {}", kernel.source.entry_point);
                *slot = BuildState::Ready(kernel);
                Ok(true)
            }
            Ok(None) => {
                *slot = BuildState::Failed;
                fallback.set(kind);
                Ok(false)
            }
            Err(err) => {
                *slot = BuildState::Unbuilt;
                Err(err)
            }
        }
    }

    /// Unloads every compiled module, leaving all slots unbuilt.
    ///
    /// All modules are unloaded even if some fail; the first error is returned.
    pub fn release(&mut self, device: &D) -> eyre::Result<()> {
        let mut result = Ok(());
        for slot in &mut self.slots {
            if let BuildState::Ready(kernel) = std::mem::replace(slot, BuildState::Unbuilt) {
                let entry_point = kernel.source.entry_point;
                if let Err(err) = device.unload(kernel.module) {
                    if result.is_ok() {
                        result = Err(err.wrap_err(format!("Failed to unload module of {entry_point}")));
                    }
                }
            }
        }
        result
    }
}

/// Synthesizes and compiles a kernel. `None` means the kernel cannot be used.
fn build_kernel<D: Device>(
    kind: KernelKind,
    device: &D,
    operator: &Operator,
    shape: &OperatorShape,
    options: &GenOptions,
) -> eyre::Result<Option<GeneratedKernel<D>>> {
    if let Some(reason) = unsupported_reason(operator) {
        debug!("Cannot generate {kind} kernel: {reason}");
        return Ok(None);
    }

    let kernel = match synthesize(kind, operator, shape, options) {
        Ok(kernel) => kernel,
        Err(err) => {
            return match err.downcast_ref::<GenError>() {
                Some(GenError::Unsupported(reason)) => {
                    debug!("Cannot generate {kind} kernel: {reason}");
                    Ok(None)
                }
                _ => Err(err),
            }
        }
    };

    let module = match device.compile(&kernel.source) {
        Ok(module) => module,
        Err(err) => {
            debug!("Compilation of {} failed: {err:#}", kernel.source.entry_point);
            return Ok(None);
        }
    };
    let function = match device.get_kernel(&module, &kernel.source.entry_point) {
        Ok(function) => function,
        Err(err) => {
            if let Err(unload_err) = device.unload(module) {
                warn!("Failed to unload module of {}: {unload_err:#}", kernel.source.entry_point);
            }
            return Err(err.wrap_err(format!("Failed to look up kernel {}", kernel.source.entry_point)));
        }
    };

    Ok(Some(GeneratedKernel {
        source: kernel.source,
        bindings: kernel.bindings,
        thread_1d: kernel.thread_1d,
        block: kernel.block,
        module,
        function,
    }))
}
