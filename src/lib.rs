//! Fused GPU kernels for matrix-free finite element operators.
//!
//! Given an [`Operator`](operator::Operator), this crate generates the source of a single device
//! kernel that restricts element data, applies the basis, evaluates the user QFunction and
//! accumulates the result back, compiles it at runtime through a [`Device`](device::Device) and
//! launches it with a block shape chosen by [`launch`]. Operators or devices the generated kernels
//! cannot handle are evaluated by a [`ReferenceOperator`](runner::ReferenceOperator).
pub mod cache;
pub mod classify;
pub mod codegen;
pub mod device;
pub mod error;
pub mod operator;
pub mod options;
pub mod runner;

pub mod launch {
    pub use fenris_launch::*;
}

pub extern crate nalgebra;

pub use runner::{AssembledQFunction, CompositeOperator, GenOperator, ReferenceOperator};
