//! Error types specific to kernel generation.
//!
//! Fallible operations return [`eyre::Result`]. Errors that callers may want to act on carry a
//! [`GenError`] that can be recovered with [`eyre::Report::downcast_ref`].
use std::fmt;
use std::fmt::{Display, Formatter};

/// Configuration errors detected while analyzing an operator.
///
/// These are reported on every call and never trigger the fallback backend.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GenError {
    /// Fields disagree on the number of quadrature points, with each other or with the operator.
    IncompatibleQuadrature,
    /// A field is missing data required by its evaluation mode.
    InvalidField { field: String, reason: String },
    /// An at-points operator has no points restriction or coordinates.
    MissingPoints,
    /// QFunction assembly requested for an operator without active inputs or outputs.
    NoActiveFields,
    /// The operator cannot be represented by generated kernels at all.
    Unsupported(String),
}

impl Display for GenError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::IncompatibleQuadrature => write!(f, "Quadrature spaces must be compatible"),
            Self::InvalidField { field, reason } => write!(f, "Invalid field '{field}': {reason}"),
            Self::MissingPoints => write!(f, "Operator at points requires a points restriction and coordinates"),
            Self::NoActiveFields => write!(f, "Cannot assemble QFunction without active inputs and outputs"),
            Self::Unsupported(msg) => write!(f, "Unsupported operator: {msg}"),
        }
    }
}

impl std::error::Error for GenError {}
