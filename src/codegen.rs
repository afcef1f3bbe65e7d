//! Synthesis of fused operator kernels.
//!
//! For a given operator and [`KernelKind`], [`synthesize`] emits the source of a single device
//! kernel that performs restriction, basis action, the QFunction and the transposed basis action
//! and restriction for all fields at once. The source relies on the device template headers of the
//! shared memory basis family and on the user QFunction source, and is compiled at runtime.
//!
//! Alongside the source, synthesis records which device tables the kernel expects for each field
//! in a [`FieldBindings`] table, which the runner passes as kernel arguments.
use crate::classify::{require_at_points, OperatorShape};
use crate::device::{DevicePtr, FieldSlots, KernelSource};
use crate::error::GenError;
use crate::operator::{Basis, Operator, OperatorField};
use crate::options::{GenOptions, Target};
use fenris_launch::fixed_block_shape;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

pub mod reuse;
pub mod syntax;

mod fields;
mod kernels;
mod qfunction;

use reuse::{matrix_reuse, ReuseMap, Side};
use syntax::SourceFile;

/// The kinds of kernels generated for an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KernelKind {
    /// Applies the operator and accumulates into the output.
    Apply,
    /// Assembles the linearized QFunction at every quadrature point.
    QFunctionAssembly,
    /// Assembles the diagonal of an operator at points.
    DiagonalAssembly,
    /// Assembles the full matrix of an operator at points.
    FullAssembly,
}

impl KernelKind {
    pub const ALL: [KernelKind; 4] = [
        KernelKind::Apply,
        KernelKind::QFunctionAssembly,
        KernelKind::DiagonalAssembly,
        KernelKind::FullAssembly,
    ];

    /// Position of the kind in [`KernelKind::ALL`].
    pub fn index(&self) -> usize {
        match self {
            Self::Apply => 0,
            Self::QFunctionAssembly => 1,
            Self::DiagonalAssembly => 2,
            Self::FullAssembly => 3,
        }
    }

    pub fn is_assembly(&self) -> bool {
        !matches!(self, Self::Apply)
    }

    /// Name of the generated entry point for a QFunction named `qfunction`.
    pub fn entry_point(&self, target: Target, qfunction: &str) -> String {
        let kind = match self {
            Self::Apply => "Operator",
            Self::QFunctionAssembly => "QFunctionAssembly",
            Self::DiagonalAssembly => "OperatorDiagonalAssembly",
            Self::FullAssembly => "OperatorFullAssembly",
        };
        format!("CeedKernel{}Gen{kind}_{qfunction}", target.tag())
    }
}

impl Display for KernelKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Apply => "apply",
            Self::QFunctionAssembly => "QFunction assembly",
            Self::DiagonalAssembly => "diagonal assembly",
            Self::FullAssembly => "full assembly",
        };
        write!(f, "{name}")
    }
}

/// Where the interpolation matrix of a field comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum MatrixSource {
    /// A table already resident in device memory.
    Resident(DevicePtr),
    /// The Chebyshev interpolation table of the basis, uploaded by the runner on first use.
    ChebyshevInterp(Arc<Basis>),
}

/// Device tables expected by a generated kernel, per field slot.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FieldBindings {
    pub b: FieldSlots<Option<MatrixSource>>,
    pub g: FieldSlots<Option<DevicePtr>>,
    pub indices: FieldSlots<Option<DevicePtr>>,
    pub w: Option<DevicePtr>,
    pub points_indices: Option<DevicePtr>,
}

impl FieldBindings {
    fn for_operator(operator: &Operator) -> Self {
        let (n_in, n_out) = (operator.inputs.len(), operator.outputs.len());
        Self {
            b: FieldSlots::filled(n_in, n_out, None),
            g: FieldSlots::filled(n_in, n_out, None),
            indices: FieldSlots::filled(n_in, n_out, None),
            w: None,
            points_indices: None,
        }
    }
}

fn slot<T>(slots: &mut FieldSlots<T>, side: Side) -> &mut Vec<T> {
    match side {
        Side::Input => &mut slots.inputs,
        Side::Output => &mut slots.outputs,
    }
}

/// Output of kernel synthesis.
#[derive(Debug, Clone)]
pub struct SynthesizedKernel {
    pub kind: KernelKind,
    pub source: KernelSource,
    /// Statement structure the source was rendered from.
    pub syntax: SourceFile,
    pub bindings: FieldBindings,
    /// Thread extent per element along x.
    pub thread_1d: usize,
    /// Block shape the kernel is compiled for.
    pub block: [usize; 3],
}

/// State shared by the emitters of a single kernel.
struct Emitter<'a> {
    operator: &'a Operator,
    shape: OperatorShape,
    options: &'a GenOptions,
    reuse: ReuseMap,
    bindings: FieldBindings,
}

impl<'a> Emitter<'a> {
    fn field(&self, side: Side, index: usize) -> &'a OperatorField {
        match side {
            Side::Input => &self.operator.inputs[index],
            Side::Output => &self.operator.outputs[index],
        }
    }

    /// Name of a target specific type, e.g. `Fields_Cuda`.
    fn type_name(&self, name: &str) -> String {
        format!("{name}_{}", self.options.target.tag())
    }

    /// Include path of a device template header.
    fn template_header(&self, name: &str) -> String {
        let dir = self.options.target.template_dir();
        format!("{}/{dir}/{dir}-{name}.h", self.options.jit_source_root)
    }

    /// Extent of per-thread quadrature registers: a full column for 3D tensor elements.
    fn column(&self, q_name: &'static str) -> &'static str {
        if self.shape.has_column_registers() {
            q_name
        } else {
            "1"
        }
    }
}

fn required_basis(field: &OperatorField) -> eyre::Result<&Arc<Basis>> {
    field.basis.as_ref().ok_or_else(|| {
        GenError::InvalidField {
            field: field.name.clone(),
            reason: format!("{} requires a basis", field.eval_mode.name()),
        }
        .into()
    })
}

fn not_implemented(field: &OperatorField, what: &str) -> eyre::Report {
    GenError::Unsupported(format!("{what} of field '{}' is not implemented", field.name)).into()
}

/// Generates the kernel of the given kind for `operator`.
pub fn synthesize(
    kind: KernelKind,
    operator: &Operator,
    shape: &OperatorShape,
    options: &GenOptions,
) -> eyre::Result<SynthesizedKernel> {
    let mut shape = shape.clone();
    match kind {
        KernelKind::Apply => {}
        KernelKind::QFunctionAssembly => {
            if shape.is_at_points {
                return Err(GenError::Unsupported("QFunction assembly of operators at points".to_string()).into());
            }
            shape.use_3d_slices = false;
        }
        KernelKind::DiagonalAssembly | KernelKind::FullAssembly => require_at_points(operator)?,
    }

    let mut emitter = Emitter {
        operator,
        shape,
        options,
        reuse: matrix_reuse(operator),
        bindings: FieldBindings::for_operator(operator),
    };
    let entry_point = kind.entry_point(options.target, &operator.qfunction.name);
    let syntax = emitter.kernel(kind, &entry_point)?;

    let shape = &emitter.shape;
    let block = match kind {
        KernelKind::Apply if shape.is_all_tensor => fixed_block_shape(shape.max_dim, shape.thread_nodes(), shape.q_1d),
        KernelKind::Apply => fixed_block_shape(1, shape.thread_nodes(), shape.q),
        _ => fixed_block_shape(shape.max_dim, shape.thread_nodes(), shape.q_1d),
    };
    let source = KernelSource {
        code: syntax.render(),
        entry_point,
        defines: vec![
            ("OP_T_1D".to_string(), block[0] as i64),
            ("BLOCK_SIZE".to_string(), (block[0] * block[1] * block[2]) as i64),
        ],
    };
    Ok(SynthesizedKernel {
        kind,
        source,
        syntax,
        bindings: emitter.bindings,
        thread_1d: block[0],
        block,
    })
}
