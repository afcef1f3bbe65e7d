use super::binding::with_borrowed;
use super::GenOperator;
use crate::device::{Device, DeviceArray, DevicePtr};
use log::debug;
use rayon::prelude::*;
use std::sync::Arc;

/// A sum of operators acting on disjoint sets of elements.
pub struct CompositeOperator<D: Device> {
    device: Arc<D>,
    operators: Vec<Arc<GenOperator<D>>>,
}

impl<D: Device> CompositeOperator<D> {
    pub fn new(device: Arc<D>, operators: Vec<Arc<GenOperator<D>>>) -> Self {
        Self { device, operators }
    }

    pub fn operators(&self) -> &[Arc<GenOperator<D>>] {
        &self.operators
    }

    /// Computes `output += sum_i A_i(input)`.
    ///
    /// Sub-operators are issued concurrently, each on its own stream. Sub-operators whose kernel
    /// cannot run are then evaluated one at a time by their reference operators.
    pub fn apply_add(&self, input: Option<&dyn DeviceArray>, output: &dyn DeviceArray) -> eyre::Result<()> {
        // Misconfigured sub-operators fail the call before any sub-operator touches `output`
        for operator in &self.operators {
            operator.check_active_input(input.is_some())?;
            operator.check_configuration()?;
        }
        let is_good = with_borrowed(|borrowed| {
            let input = match input {
                Some(input) => borrowed.read(input)?,
                None => DevicePtr::NULL,
            };
            let output = borrowed.read_write(output)?;
            self.apply_concurrently(input, output)
        })?;

        for (operator, is_good) in self.operators.iter().zip(is_good) {
            if !is_good {
                debug!(
                    "Falling back to reference operator for composite apply_add of {}",
                    operator.operator.qfunction.name
                );
                operator.reference.apply_add(input, output)?;
            }
        }
        Ok(())
    }

    fn apply_concurrently(&self, input: DevicePtr, output: DevicePtr) -> eyre::Result<Vec<bool>> {
        let mut streams = Vec::with_capacity(self.operators.len());
        for operator in &self.operators {
            if operator.operator.num_elem == 0 {
                streams.push(None);
                continue;
            }
            match self.device.create_stream() {
                Ok(stream) => streams.push(Some(stream)),
                Err(err) => {
                    // The creation error takes precedence
                    let _ = self.destroy_streams(streams);
                    return Err(err);
                }
            }
        }

        let results: Vec<eyre::Result<bool>> = self
            .operators
            .par_iter()
            .zip(streams.par_iter())
            .map(|(operator, stream)| match stream {
                Some(stream) => operator.apply_on_stream(input, output, stream),
                None => Ok(true),
            })
            .collect();

        let synchronized = self.device.synchronize();
        let destroyed = self.destroy_streams(streams);
        let is_good = results.into_iter().collect::<eyre::Result<Vec<_>>>()?;
        synchronized?;
        destroyed?;
        Ok(is_good)
    }

    fn destroy_streams(&self, streams: Vec<Option<D::Stream>>) -> eyre::Result<()> {
        let mut result = Ok(());
        for stream in streams.into_iter().flatten() {
            if let Err(err) = self.device.destroy_stream(stream) {
                result = result.and(Err(err));
            }
        }
        result
    }
}
