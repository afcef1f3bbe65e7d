//! Descriptions of finite element operators.
//!
//! An [`Operator`] couples a user [`QFunction`] with a list of input and output fields. Each
//! [`OperatorField`] describes how values travel between the global vector and the quadrature
//! points: an element restriction gathers element-local values, a basis maps them to quadrature
//! points according to its evaluation mode, and the QFunction consumes or produces the result.
//!
//! These types are plain descriptors. Basis tables and restriction offsets live in device memory
//! and are referenced by [`DevicePtr`].
use crate::device::{DeviceArray, DevicePtr};
use nalgebra::DMatrix;
use std::path::PathBuf;
use std::sync::Arc;

/// How a field is evaluated at quadrature points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvalMode {
    /// Values are passed through without a basis action.
    None,
    Interp,
    Grad,
    /// Quadrature weights.
    Weight,
    Div,
    Curl,
}

impl EvalMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "CEED_EVAL_NONE",
            Self::Interp => "CEED_EVAL_INTERP",
            Self::Grad => "CEED_EVAL_GRAD",
            Self::Weight => "CEED_EVAL_WEIGHT",
            Self::Div => "CEED_EVAL_DIV",
            Self::Curl => "CEED_EVAL_CURL",
        }
    }

    pub fn requires_basis(&self) -> bool {
        !matches!(self, Self::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasisTopology {
    /// Tensor product of a 1D basis with `p_1d` nodes and `q_1d` quadrature points.
    Tensor { p_1d: usize, q_1d: usize },
    NonTensor { p: usize, q: usize },
}

/// A finite element basis with its tables resident in device memory.
#[derive(Debug, Clone, PartialEq)]
pub struct Basis {
    pub dim: usize,
    pub topology: BasisTopology,
    /// Interpolation matrix, 1D for tensor bases.
    pub interp: DevicePtr,
    /// Gradient matrix, 1D for tensor bases.
    pub grad: DevicePtr,
    /// Collocated gradient at the 1D quadrature points, if available.
    pub collo_grad_1d: Option<DevicePtr>,
    pub q_weight: DevicePtr,
    /// Interpolation from nodes to Chebyshev coefficients, used for evaluation at points.
    pub chebyshev_interp_1d: Option<DMatrix<f64>>,
    /// Whether the tables are laid out for the shared memory kernel templates.
    pub shared_layout: bool,
}

impl Basis {
    pub fn tensor(dim: usize, p_1d: usize, q_1d: usize) -> Self {
        Self {
            dim,
            topology: BasisTopology::Tensor { p_1d, q_1d },
            interp: DevicePtr::NULL,
            grad: DevicePtr::NULL,
            collo_grad_1d: None,
            q_weight: DevicePtr::NULL,
            chebyshev_interp_1d: None,
            shared_layout: true,
        }
    }

    pub fn non_tensor(dim: usize, p: usize, q: usize) -> Self {
        Self {
            topology: BasisTopology::NonTensor { p, q },
            ..Self::tensor(dim, p, q)
        }
    }

    pub fn with_tables(mut self, interp: DevicePtr, grad: DevicePtr, q_weight: DevicePtr) -> Self {
        self.interp = interp;
        self.grad = grad;
        self.q_weight = q_weight;
        self
    }

    pub fn with_collocated_grad(mut self, collo_grad_1d: DevicePtr) -> Self {
        self.collo_grad_1d = Some(collo_grad_1d);
        self
    }

    pub fn with_chebyshev_interp(mut self, chebyshev_interp_1d: DMatrix<f64>) -> Self {
        self.chebyshev_interp_1d = Some(chebyshev_interp_1d);
        self
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self.topology, BasisTopology::Tensor { .. })
    }

    /// Number of nodes in one dimension, or the total number of nodes for non-tensor bases.
    pub fn num_nodes_1d(&self) -> usize {
        match self.topology {
            BasisTopology::Tensor { p_1d, .. } => p_1d,
            BasisTopology::NonTensor { p, .. } => p,
        }
    }

    /// Number of quadrature points in one dimension, or the total for non-tensor bases.
    pub fn num_qpts_1d(&self) -> usize {
        match self.topology {
            BasisTopology::Tensor { q_1d, .. } => q_1d,
            BasisTopology::NonTensor { q, .. } => q,
        }
    }

    /// Total number of nodes. Saturates at `usize::MAX` for dimensions too large to represent.
    pub fn num_nodes(&self) -> usize {
        match self.topology {
            BasisTopology::Tensor { p_1d, .. } => self.tensor_size(p_1d),
            BasisTopology::NonTensor { p, .. } => p,
        }
    }

    /// Total number of quadrature points. Saturates like [`Basis::num_nodes`].
    pub fn num_qpts(&self) -> usize {
        match self.topology {
            BasisTopology::Tensor { q_1d, .. } => self.tensor_size(q_1d),
            BasisTopology::NonTensor { q, .. } => q,
        }
    }

    fn tensor_size(&self, n_1d: usize) -> usize {
        u32::try_from(self.dim)
            .ok()
            .and_then(|dim| n_1d.checked_pow(dim))
            .unwrap_or(usize::MAX)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RestrictionKind {
    /// Gathers through an offsets array, with components `comp_stride` apart in the L-vector.
    Standard { offsets: DevicePtr, comp_stride: usize },
    /// Strides `[node, component, element]`. `None` selects the backend layout
    /// `[1, elem_size * num_elem, elem_size]`.
    Strided { strides: Option<[usize; 3]> },
    /// Points restriction with a variable number of points per element.
    Points {
        offsets: DevicePtr,
        comp_stride: usize,
        points_per_elem: Vec<usize>,
    },
    Oriented { offsets: DevicePtr, comp_stride: usize },
    CurlOriented { offsets: DevicePtr, comp_stride: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElemRestriction {
    pub kind: RestrictionKind,
    pub num_elem: usize,
    pub elem_size: usize,
    pub num_comp: usize,
    pub l_size: usize,
}

impl ElemRestriction {
    pub fn standard(num_elem: usize, elem_size: usize, num_comp: usize, l_size: usize, offsets: DevicePtr) -> Self {
        Self {
            kind: RestrictionKind::Standard {
                offsets,
                comp_stride: l_size / num_comp.max(1),
            },
            num_elem,
            elem_size,
            num_comp,
            l_size,
        }
    }

    pub fn strided(num_elem: usize, elem_size: usize, num_comp: usize, l_size: usize, strides: Option<[usize; 3]>) -> Self {
        Self {
            kind: RestrictionKind::Strided { strides },
            num_elem,
            elem_size,
            num_comp,
            l_size,
        }
    }

    /// Strides of a strided restriction, with backend strides resolved.
    pub fn strides(&self) -> Option<[usize; 3]> {
        match self.kind {
            RestrictionKind::Strided { strides } => {
                Some(strides.unwrap_or([1, self.elem_size * self.num_elem, self.elem_size]))
            }
            _ => None,
        }
    }

    pub fn offsets(&self) -> Option<DevicePtr> {
        match self.kind {
            RestrictionKind::Standard { offsets, .. }
            | RestrictionKind::Points { offsets, .. }
            | RestrictionKind::Oriented { offsets, .. }
            | RestrictionKind::CurlOriented { offsets, .. } => Some(offsets),
            RestrictionKind::Strided { .. } => None,
        }
    }

    pub fn comp_stride(&self) -> Option<usize> {
        match self.kind {
            RestrictionKind::Standard { comp_stride, .. }
            | RestrictionKind::Points { comp_stride, .. }
            | RestrictionKind::Oriented { comp_stride, .. }
            | RestrictionKind::CurlOriented { comp_stride, .. } => Some(comp_stride),
            RestrictionKind::Strided { .. } => None,
        }
    }

    pub fn is_points(&self) -> bool {
        matches!(self.kind, RestrictionKind::Points { .. })
    }

    pub fn points_in_element(&self, elem: usize) -> usize {
        match &self.kind {
            RestrictionKind::Points { points_per_elem, .. } => points_per_elem.get(elem).copied().unwrap_or(0),
            _ => self.elem_size,
        }
    }

    pub fn max_points_in_element(&self) -> usize {
        match &self.kind {
            RestrictionKind::Points { points_per_elem, .. } => points_per_elem.iter().copied().max().unwrap_or(0),
            _ => self.elem_size,
        }
    }
}

/// Vector bound to an operator field.
#[derive(Debug, Clone)]
pub enum FieldVector {
    /// The vector passed to the operator at evaluation time.
    Active,
    /// No vector, e.g. for quadrature weights.
    None,
    Passive(Arc<dyn DeviceArray>),
}

impl FieldVector {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Whether two slots refer to the same vector.
    pub fn same_as(&self, other: &FieldVector) -> bool {
        match (self, other) {
            (Self::Active, Self::Active) => true,
            (Self::Passive(a), Self::Passive(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperatorField {
    pub name: String,
    pub eval_mode: EvalMode,
    pub basis: Option<Arc<Basis>>,
    pub restriction: Option<Arc<ElemRestriction>>,
    pub vector: FieldVector,
}

impl OperatorField {
    pub fn new(name: impl Into<String>, eval_mode: EvalMode) -> Self {
        Self {
            name: name.into(),
            eval_mode,
            basis: None,
            restriction: None,
            vector: FieldVector::None,
        }
    }

    pub fn with_basis(mut self, basis: Arc<Basis>) -> Self {
        self.basis = Some(basis);
        self
    }

    pub fn with_restriction(mut self, restriction: Arc<ElemRestriction>) -> Self {
        self.restriction = Some(restriction);
        self
    }

    pub fn with_vector(mut self, vector: FieldVector) -> Self {
        self.vector = vector;
        self
    }

    pub fn num_comp(&self) -> usize {
        self.restriction.as_ref().map(|r| r.num_comp).unwrap_or(1)
    }

    pub fn dim(&self) -> usize {
        self.basis.as_ref().map(|b| b.dim).unwrap_or(1)
    }

    pub fn is_tensor(&self) -> bool {
        self.basis.as_ref().map(|b| b.is_tensor()).unwrap_or(true)
    }

    /// Number of values per quadrature point seen by the QFunction.
    pub fn qfunction_size(&self) -> usize {
        match self.eval_mode {
            EvalMode::None | EvalMode::Interp => self.num_comp(),
            EvalMode::Grad => self.num_comp() * self.dim(),
            EvalMode::Weight => 1,
            EvalMode::Div => self.num_comp(),
            EvalMode::Curl => self.num_comp() * if self.dim() == 3 { 3 } else { 1 },
        }
    }

    /// Whether both fields use the very same basis object.
    pub fn shares_basis_with(&self, other: &OperatorField) -> bool {
        match (&self.basis, &other.basis) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Whether both fields gather through the same restriction from the same vector.
    pub fn shares_restriction_with(&self, other: &OperatorField) -> bool {
        let same_restriction = match (&self.restriction, &other.restriction) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        same_restriction && self.vector.same_as(&other.vector)
    }
}

/// User point-wise kernel, referenced by name and source file.
#[derive(Debug, Clone)]
pub struct QFunction {
    pub name: String,
    pub source_path: Option<PathBuf>,
    /// Identity QFunctions copy inputs to outputs unchanged.
    pub identity: bool,
    pub context: Option<Arc<dyn DeviceArray>>,
}

impl QFunction {
    pub fn new(name: impl Into<String>, source_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source_path: Some(source_path.into()),
            identity: false,
            context: None,
        }
    }

    pub fn with_context(mut self, context: Arc<dyn DeviceArray>) -> Self {
        self.context = Some(context);
        self
    }
}

/// Sample points for operators evaluated at arbitrary points inside elements.
#[derive(Debug, Clone)]
pub struct PointsData {
    pub restriction: Arc<ElemRestriction>,
    pub coords: Arc<dyn DeviceArray>,
}

#[derive(Debug, Clone)]
pub struct Operator {
    pub qfunction: QFunction,
    pub inputs: Vec<OperatorField>,
    pub outputs: Vec<OperatorField>,
    pub num_elem: usize,
    /// Number of quadrature points per element.
    pub num_qpts: usize,
    pub points: Option<PointsData>,
}

impl Operator {
    pub fn new(qfunction: QFunction, num_elem: usize, num_qpts: usize) -> Self {
        Self {
            qfunction,
            inputs: Vec::new(),
            outputs: Vec::new(),
            num_elem,
            num_qpts,
            points: None,
        }
    }

    pub fn with_input(mut self, field: OperatorField) -> Self {
        self.inputs.push(field);
        self
    }

    pub fn with_output(mut self, field: OperatorField) -> Self {
        self.outputs.push(field);
        self
    }

    pub fn at_points(mut self, restriction: Arc<ElemRestriction>, coords: Arc<dyn DeviceArray>) -> Self {
        self.points = Some(PointsData { restriction, coords });
        self
    }

    pub fn is_at_points(&self) -> bool {
        self.points.is_some()
    }

    pub fn fields(&self) -> impl Iterator<Item = &OperatorField> {
        self.inputs.iter().chain(self.outputs.iter())
    }

    /// Sizes of the active inputs and outputs seen by the QFunction.
    pub fn active_qfunction_sizes(&self) -> (usize, usize) {
        let size = |fields: &[OperatorField]| {
            fields
                .iter()
                .filter(|field| field.vector.is_active())
                .map(OperatorField::qfunction_size)
                .sum()
        };
        (size(&self.inputs), size(&self.outputs))
    }

    /// Number of distinct bases among active inputs and active outputs.
    pub fn num_active_bases(&self) -> (usize, usize) {
        let count = |fields: &[OperatorField]| {
            let mut bases: Vec<&Arc<Basis>> = Vec::new();
            for basis in fields
                .iter()
                .filter(|field| field.vector.is_active())
                .filter_map(|field| field.basis.as_ref())
            {
                if !bases.iter().any(|b| Arc::ptr_eq(b, basis)) {
                    bases.push(basis);
                }
            }
            bases.len()
        };
        (count(&self.inputs), count(&self.outputs))
    }
}
