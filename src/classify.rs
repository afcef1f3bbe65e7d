//! Classification of operator fields.
//!
//! Before any code is generated, the fields of an operator are inspected to determine the
//! properties that drive both kernel synthesis and launch planning: dimensionality, node and
//! quadrature point counts, whether all bases are tensor products, and which parallelization
//! strategy applies.
use crate::error::GenError;
use crate::operator::{EvalMode, Operator, OperatorField, RestrictionKind};
use eyre::eyre;

/// Classified shape of an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorShape {
    pub is_all_tensor: bool,
    pub is_all_nontensor: bool,
    pub is_at_points: bool,
    /// Process 3D elements one quadrature plane at a time using collocated gradients.
    pub use_3d_slices: bool,
    pub max_dim: usize,
    /// Largest total number of nodes over all bases.
    pub max_p: usize,
    /// Largest number of 1D nodes over tensor bases.
    pub max_p_1d: usize,
    pub q: usize,
    pub q_1d: usize,
    pub max_num_points: usize,
    pub coords_comp_stride: usize,
}

impl OperatorShape {
    /// Node count used when sizing thread blocks.
    pub fn thread_nodes(&self) -> usize {
        if self.is_all_tensor {
            self.max_p_1d
        } else {
            self.max_p
        }
    }

    /// Whether the QFunction processes a full column of `q_1d` points per thread.
    pub fn processes_columns(&self) -> bool {
        self.max_dim == 3 && !self.is_at_points && !self.use_3d_slices && self.is_all_tensor
    }

    /// Whether quadrature data of every element is held in registers along the last dimension.
    pub fn has_column_registers(&self) -> bool {
        self.is_all_tensor && self.max_dim >= 3
    }

    /// Whether both tensor and non-tensor bases appear.
    pub fn is_mixed(&self) -> bool {
        !self.is_all_tensor && !self.is_all_nontensor
    }
}

/// Classifies the fields of `operator`.
///
/// Fails with a [`GenError`] if the operator is inconsistent, e.g. when fields disagree on the
/// number of quadrature points, or the bases disagree with the quadrature point count of the
/// operator.
pub fn classify(operator: &Operator) -> eyre::Result<OperatorShape> {
    validate_fields(operator)?;

    let mut shape = OperatorShape {
        is_all_tensor: true,
        is_all_nontensor: true,
        is_at_points: operator.is_at_points(),
        use_3d_slices: false,
        max_dim: 0,
        max_p: 0,
        max_p_1d: 0,
        q: 0,
        q_1d: 0,
        max_num_points: 0,
        coords_comp_stride: 0,
    };

    let mut is_all_3d = true;
    for basis in operator.fields().filter_map(|field| field.basis.as_ref()) {
        let is_tensor = basis.is_tensor();
        shape.is_all_tensor &= is_tensor;
        shape.is_all_nontensor &= !is_tensor;
        is_all_3d &= basis.dim == 3;
        shape.max_dim = shape.max_dim.max(basis.dim);
        shape.max_p = shape.max_p.max(basis.num_nodes());

        let field_q = basis.num_qpts();
        if shape.q != 0 && field_q != shape.q {
            return Err(GenError::IncompatibleQuadrature.into());
        }
        shape.q = field_q;
        if is_tensor {
            shape.max_p_1d = shape.max_p_1d.max(basis.num_nodes_1d());
            let field_q_1d = basis.num_qpts_1d();
            if shape.q_1d != 0 && field_q_1d != shape.q_1d {
                return Err(GenError::IncompatibleQuadrature.into());
            }
            shape.q_1d = field_q_1d;
        }
    }

    if !shape.is_at_points && shape.q != 0 && operator.num_qpts != shape.q {
        return Err(GenError::IncompatibleQuadrature.into());
    }

    if is_all_3d && shape.is_all_tensor {
        let mut grad_fields = operator
            .fields()
            .filter(|field| field.eval_mode == EvalMode::Grad)
            .peekable();
        shape.use_3d_slices = grad_fields.peek().is_some()
            && grad_fields.all(|field| {
                field
                    .basis
                    .as_ref()
                    .map(|basis| basis.collo_grad_1d.is_some())
                    .unwrap_or(false)
            });
    }

    if shape.max_dim == 0 {
        shape.max_dim = 1;
    }
    if let Some(points) = &operator.points {
        shape.max_num_points = points.restriction.max_points_in_element();
        shape.coords_comp_stride = points
            .restriction
            .comp_stride()
            .ok_or(GenError::MissingPoints)?;
        shape.use_3d_slices = false;
    }
    if shape.q_1d == 0 {
        shape.q_1d = if shape.is_at_points {
            shape.max_num_points
        } else {
            operator.num_qpts
        };
    }
    if shape.q == 0 {
        shape.q = shape.q_1d;
    }
    Ok(shape)
}

fn invalid_field(field: &OperatorField, reason: &str) -> eyre::Report {
    GenError::InvalidField {
        field: field.name.clone(),
        reason: reason.to_string(),
    }
    .into()
}

fn validate_fields(operator: &Operator) -> eyre::Result<()> {
    for field in operator.fields() {
        if field.eval_mode.requires_basis() && field.basis.is_none() {
            return Err(invalid_field(field, &format!("{} requires a basis", field.eval_mode.name())));
        }
        if field.eval_mode != EvalMode::Weight && field.restriction.is_none() {
            return Err(invalid_field(field, "missing element restriction"));
        }
    }
    if let Some(field) = operator
        .outputs
        .iter()
        .find(|field| field.eval_mode == EvalMode::Weight)
    {
        return Err(invalid_field(field, "quadrature weights cannot be an output"));
    }

    if let Some(points) = &operator.points {
        if !points.restriction.is_points() {
            return Err(GenError::MissingPoints.into());
        }
    }

    let qfunction = &operator.qfunction;
    if qfunction.identity {
        let is_restriction_only = |fields: &[OperatorField]| {
            fields
                .first()
                .map(|field| field.eval_mode == EvalMode::None)
                .unwrap_or(false)
        };
        if is_restriction_only(&operator.inputs) && is_restriction_only(&operator.outputs) {
            return Err(GenError::Unsupported("restriction only identity operators".to_string()).into());
        }
    }
    if qfunction.source_path.is_none() {
        return Err(GenError::Unsupported(format!(
            "QFunction '{}' has no source file",
            qfunction.name
        ))
        .into());
    }
    Ok(())
}

/// Reason why generated kernels cannot represent `operator`, if any.
///
/// Unlike configuration errors, such operators are still valid and are evaluated by the
/// reference backend instead.
pub fn unsupported_reason(operator: &Operator) -> Option<String> {
    for field in operator.fields() {
        if let Some(basis) = &field.basis {
            if !basis.shared_layout {
                return Some(format!("basis of field '{}' is not laid out for shared memory", field.name));
            }
            if basis.dim > 3 {
                return Some(format!("basis of field '{}' has dimension {}", field.name, basis.dim));
            }
            let needs_chebyshev = matches!(field.eval_mode, EvalMode::Interp | EvalMode::Grad);
            if operator.is_at_points() && needs_chebyshev {
                if !basis.is_tensor() {
                    return Some(format!("field '{}' uses a non-tensor basis at points", field.name));
                }
                if basis.chebyshev_interp_1d.is_none() {
                    return Some(format!("basis of field '{}' has no Chebyshev interpolation", field.name));
                }
            }
        }
        if matches!(field.eval_mode, EvalMode::Div | EvalMode::Curl) {
            return Some(format!("{} is not implemented", field.eval_mode.name()));
        }
        if let Some(restriction) = &field.restriction {
            if matches!(
                restriction.kind,
                RestrictionKind::Oriented { .. } | RestrictionKind::CurlOriented { .. }
            ) {
                return Some(format!("oriented restriction on field '{}' is not implemented", field.name));
            }
        }
    }
    None
}

/// Fails unless `operator` is evaluated at points.
pub(crate) fn require_at_points(operator: &Operator) -> eyre::Result<()> {
    if operator.is_at_points() {
        Ok(())
    } else {
        Err(eyre!("Only operators at points support generated full and diagonal assembly"))
    }
}
