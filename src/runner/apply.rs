use super::binding::{with_borrowed, RunArgs};
use super::{GenOperator, OperatorState};
use crate::codegen::KernelKind;
use crate::device::{Device, DeviceArray, DevicePtr};
use eyre::eyre;
use log::debug;

impl<D: Device> GenOperator<D> {
    /// Computes `output += A(input)`.
    ///
    /// `input` may be omitted for operators without an active input.
    pub fn apply_add(&self, input: Option<&dyn DeviceArray>, output: &dyn DeviceArray) -> eyre::Result<()> {
        self.check_active_input(input.is_some())?;
        let mut state = self.lock()?;
        let is_good = with_borrowed(|borrowed| {
            let input = match input {
                Some(input) => borrowed.read(input)?,
                None => DevicePtr::NULL,
            };
            let output = borrowed.read_write(output)?;
            self.apply_core(&mut state, input, output, None)
        })?;

        if !is_good {
            drop(state);
            debug!(
                "Falling back to reference operator for apply_add of {}",
                self.operator.qfunction.name
            );
            self.reference.apply_add(input, output)?;
        }
        Ok(())
    }

    pub(super) fn check_active_input(&self, has_input: bool) -> eyre::Result<()> {
        let has_active_input = self.operator.inputs.iter().any(|field| field.vector.is_active());
        if has_active_input && !has_input {
            return Err(eyre!(
                "Operator {} has an active input, but no input vector was given",
                self.operator.qfunction.name
            ));
        }
        Ok(())
    }

    /// Applies the operator to arrays that are already accessed by the caller.
    ///
    /// Returns whether the generated kernel ran. If not, the caller completes the call with the
    /// reference operator.
    pub(super) fn apply_core(
        &self,
        state: &mut OperatorState<D>,
        input: DevicePtr,
        output: DevicePtr,
        stream: Option<&D::Stream>,
    ) -> eyre::Result<bool> {
        if !self.ensure_built(state, KernelKind::Apply)? {
            return Ok(false);
        }
        let args = RunArgs {
            active_input: input,
            active_output: Some(output),
            values: None,
            stream,
        };
        self.run_kernel(state, KernelKind::Apply, args)
    }

    /// Runs the apply kernel on `stream` without waiting for completion.
    pub(super) fn apply_on_stream(&self, input: DevicePtr, output: DevicePtr, stream: &D::Stream) -> eyre::Result<bool> {
        let mut state = self.lock()?;
        self.apply_core(&mut state, input, output, Some(stream))
    }
}
