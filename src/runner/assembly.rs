use super::binding::{with_borrowed, RunArgs};
use super::{AssembledQFunction, GenOperator, OperatorState};
use crate::codegen::KernelKind;
use crate::device::{Device, DeviceArray, DevicePtr};
use crate::error::GenError;
use crate::operator::ElemRestriction;
use eyre::{eyre, WrapErr};
use log::debug;
use std::sync::Arc;

impl<D: Device> GenOperator<D> {
    /// Assembles the linearized QFunction, creating the assembled vector and its restriction.
    pub fn assemble_qfunction(&self) -> eyre::Result<AssembledQFunction> {
        if !self.supports(KernelKind::QFunctionAssembly) {
            return self.reference.assemble_qfunction();
        }
        self.require_active_fields()?;
        let mut state = self.lock()?;

        let mut assembled = None;
        if self.ensure_assembly_built(&mut state, KernelKind::QFunctionAssembly)? {
            let created = self.create_assembled_qfunction(&state)?;
            if self.run_qfunction_assembly(&mut state, &created)? {
                assembled = Some(created);
            }
        }

        match assembled {
            Some(assembled) => Ok(assembled),
            None => {
                drop(state);
                self.log_fallback("assemble_qfunction");
                self.reference.assemble_qfunction()
            }
        }
    }

    /// Recomputes a linearized QFunction previously created by [`GenOperator::assemble_qfunction`].
    pub fn assemble_qfunction_update(&self, assembled: &AssembledQFunction) -> eyre::Result<()> {
        if !self.supports(KernelKind::QFunctionAssembly) {
            return self.reference.assemble_qfunction_update(assembled);
        }
        self.require_active_fields()?;
        let mut state = self.lock()?;

        let is_good = self.ensure_assembly_built(&mut state, KernelKind::QFunctionAssembly)?
            && self.run_qfunction_assembly(&mut state, assembled)?;
        if !is_good {
            drop(state);
            self.log_fallback("assemble_qfunction_update");
            self.reference.assemble_qfunction_update(assembled)?;
        }
        Ok(())
    }

    /// Adds the diagonal of the operator matrix to `assembled`.
    pub fn assemble_add_diagonal(&self, assembled: &dyn DeviceArray) -> eyre::Result<()> {
        self.assemble_at_points(KernelKind::DiagonalAssembly, assembled, 0)
    }

    /// Writes the element matrices of the operator into `values`, starting at `offset`.
    pub fn assemble_single(&self, offset: usize, values: &dyn DeviceArray) -> eyre::Result<()> {
        self.assemble_at_points(KernelKind::FullAssembly, values, offset)
    }

    fn require_active_fields(&self) -> eyre::Result<()> {
        let (size_in, size_out) = self.operator.active_qfunction_sizes();
        if size_in == 0 || size_out == 0 {
            return Err(GenError::NoActiveFields.into());
        }
        Ok(())
    }

    /// Creates the assembled vector, laid out for the quadrature points the kernel writes.
    fn create_assembled_qfunction(&self, state: &OperatorState<D>) -> eyre::Result<AssembledQFunction> {
        let q = state
            .shape
            .as_ref()
            .map(|shape| shape.q)
            .ok_or_else(|| eyre!("Operator has not been classified"))?;
        let (size_in, size_out) = self.operator.active_qfunction_sizes();
        let num_elem = self.operator.num_elem;
        let num_comp = size_in * size_out;
        let l_size = num_elem * q * num_comp;
        let restriction = ElemRestriction::strided(num_elem, q, num_comp, l_size, Some([1, num_elem * q, q]));
        let vector = self
            .device
            .create_vector(l_size)
            .wrap_err("Failed to create assembled QFunction vector")?;
        Ok(AssembledQFunction {
            vector,
            restriction: Arc::new(restriction),
        })
    }

    fn run_qfunction_assembly(&self, state: &mut OperatorState<D>, assembled: &AssembledQFunction) -> eyre::Result<bool> {
        with_borrowed(|borrowed| {
            let values = borrowed.write(assembled.vector.as_ref())?;
            let args = RunArgs {
                active_input: DevicePtr::NULL,
                active_output: None,
                values: Some(values),
                stream: None,
            };
            self.run_kernel(state, KernelKind::QFunctionAssembly, args)
        })
    }

    fn assemble_at_points(&self, kind: KernelKind, values: &dyn DeviceArray, offset: usize) -> eyre::Result<()> {
        let reference = || match kind {
            KernelKind::DiagonalAssembly => self.reference.assemble_add_diagonal(values),
            _ => self.reference.assemble_single(offset, values),
        };
        if !self.supports(kind) {
            return reference();
        }
        let mut state = self.lock()?;

        let is_good = self.ensure_at_points_assembly_built(&mut state, kind)?
            && with_borrowed(|borrowed| {
                let scalar_size = self.options.scalar.size_in_bytes();
                let values = borrowed.read_write(values)?.offset(offset, scalar_size);
                let args = RunArgs {
                    active_input: DevicePtr::NULL,
                    active_output: None,
                    values: Some(values),
                    stream: None,
                };
                self.run_kernel(&mut state, kind, args)
            })?;
        if !is_good {
            drop(state);
            self.log_fallback(if kind == KernelKind::DiagonalAssembly {
                "assemble_add_diagonal"
            } else {
                "assemble_single"
            });
            reference()?;
        }
        Ok(())
    }

    /// Assembly at points requires matching active input and output bases.
    fn ensure_at_points_assembly_built(&self, state: &mut OperatorState<D>, kind: KernelKind) -> eyre::Result<bool> {
        if !state.fallback.is_set(kind) && !state.cache.state(kind).is_terminal() {
            let (num_bases_in, num_bases_out) = self.operator.num_active_bases();
            if num_bases_in != num_bases_out {
                debug!("Cannot generate {kind} kernel: {num_bases_in} active input bases, {num_bases_out} active output bases");
                state.fallback.set(kind);
            }
        }
        self.ensure_assembly_built(state, kind)
    }

    fn log_fallback(&self, entry_point: &str) {
        debug!(
            "Falling back to reference operator for {entry_point} of {}",
            self.operator.qfunction.name
        );
    }
}
