//! Per field code: constants and basis matrices, element restriction and basis action.
use super::reuse::Side;
use super::syntax::{Block, Stmt};
use super::{not_implemented, required_basis, slot, Emitter, MatrixSource};
use crate::error::GenError;
use crate::operator::{Basis, ElemRestriction, EvalMode, OperatorField, RestrictionKind};
use std::sync::Arc;

pub(super) fn required_restriction(field: &OperatorField) -> eyre::Result<&Arc<ElemRestriction>> {
    field.restriction.as_ref().ok_or_else(|| {
        GenError::InvalidField {
            field: field.name.clone(),
            reason: "missing element restriction".to_string(),
        }
        .into()
    })
}

impl<'a> Emitter<'a> {
    /// Field constants and shared memory basis matrices.
    pub(super) fn field_data(&mut self, block: &mut Block, side: Side, index: usize) -> eyre::Result<()> {
        let field = self.field(side, index);
        let s = side.suffix(index);
        let basis = field.basis.as_ref();
        let is_tensor = field.is_tensor();
        let p_name = format!("{}{s}", if is_tensor { "P_1d" } else { "P" });
        let q_name = if is_tensor { "Q_1d" } else { "Q" };

        block.comment(format!("-- {} field {index}: {}", side.label(), field.name));
        block.constant(format!("dim{s}"), basis.map(|b| b.dim).unwrap_or(self.shape.max_dim));
        if is_tensor && !self.shape.is_all_tensor {
            block.constant(format!("P{s}"), basis.map(|b| b.num_nodes()).unwrap_or(self.shape.q));
        }
        block.constant(&p_name, basis.map(|b| b.num_nodes_1d()).unwrap_or(self.shape.q_1d));
        if field.eval_mode != EvalMode::Weight {
            block.constant(format!("num_comp{s}"), field.num_comp());
        }

        block.comment(format!("EvalMode: {}", field.eval_mode.name()));
        match field.eval_mode {
            EvalMode::None | EvalMode::Weight => {}
            EvalMode::Interp => {
                self.bind_interp(side, index, required_basis(field)?);
                self.load_interp(block, side, index, &p_name, q_name);
            }
            EvalMode::Grad => {
                let basis = required_basis(field)?;
                self.bind_interp(side, index, basis);
                if is_tensor {
                    self.load_interp(block, side, index, &p_name, q_name);
                }
                // Gradients at points are evaluated from the Chebyshev coefficients
                if self.shape.is_at_points {
                    return Ok(());
                }
                let (table, rows, cols) = match basis.collo_grad_1d {
                    Some(collo_grad_1d) => (collo_grad_1d, q_name.to_string(), q_name.to_string()),
                    None if is_tensor => (basis.grad, p_name.clone(), q_name.to_string()),
                    None => (basis.grad, p_name.clone(), format!("{q_name}*dim{s}")),
                };
                slot(&mut self.bindings.g, side)[index] = Some(table);
                match self.reuse.get(side, index) {
                    Some(reuse) if reuse.eval_mode == EvalMode::Grad => {
                        block.alias(format!("s_G{s}"), format!("s_G{}", reuse.suffix()));
                    }
                    _ => {
                        block.shared_array(format!("s_G{s}"), format!("{rows}*{cols}"));
                        block.call(
                            "LoadMatrix",
                            &[&rows, &cols],
                            &["data", &format!("G.{}[{index}]", side.slot()), &format!("s_G{s}")],
                        );
                    }
                }
            }
            EvalMode::Div | EvalMode::Curl => return Err(not_implemented(field, field.eval_mode.name())),
        }
        Ok(())
    }

    fn bind_interp(&mut self, side: Side, index: usize, basis: &Arc<Basis>) {
        let source = if self.shape.is_at_points {
            MatrixSource::ChebyshevInterp(Arc::clone(basis))
        } else {
            MatrixSource::Resident(basis.interp)
        };
        slot(&mut self.bindings.b, side)[index] = Some(source);
    }

    fn load_interp(&self, block: &mut Block, side: Side, index: usize, p_name: &str, q_name: &str) {
        let s = side.suffix(index);
        match self.reuse.get(side, index) {
            Some(reuse) => {
                block.alias(format!("s_B{s}"), format!("s_B{}", reuse.suffix()));
            }
            None => {
                block.shared_array(format!("s_B{s}"), format!("{p_name}*{q_name}"));
                block.call(
                    "LoadMatrix",
                    &[p_name, q_name],
                    &["data", &format!("B.{}[{index}]", side.slot()), &format!("s_B{s}")],
                );
            }
        }
    }

    /// Gathers an input field into element registers, or scatters an output field.
    ///
    /// Inputs whose element values were already gathered for `buffer_owner` alias its buffer.
    pub(super) fn restriction(
        &mut self,
        block: &mut Block,
        side: Side,
        index: usize,
        buffer_owner: Option<usize>,
    ) -> eyre::Result<()> {
        let field = self.field(side, index);
        let s = side.suffix(index);
        let is_all_tensor = self.shape.is_all_tensor;
        let p_name = format!("{}{s}", if is_all_tensor { "P_1d" } else { "P" });
        let d = if is_all_tensor { self.shape.max_dim } else { 1 };

        if side == Side::Input {
            if let Some(owner) = buffer_owner.filter(|&owner| owner != index) {
                block.alias(format!("r_e{s}"), format!("r_e_in_{owner}"));
                return Ok(());
            }
            if field.eval_mode == EvalMode::Weight {
                return Ok(());
            }
        }

        let restriction = required_restriction(field)?;
        if side == Side::Input && !restriction.is_points() {
            if field.eval_mode == EvalMode::None {
                // Without basis action the element values are also the quadrature values
                block.array(format!("r_e{s}"), format!("num_comp{s}*{p_name}"));
            } else {
                block.alias(format!("r_e{s}"), "r_e_scratch");
            }
        }

        let direction = match side {
            Side::Input => "Read",
            Side::Output => "Write",
        };
        let (from, to) = match side {
            Side::Input => (format!("d{s}"), format!("r_e{s}")),
            Side::Output => (format!("r_e{s}"), format!("d{s}")),
        };
        match &restriction.kind {
            RestrictionKind::Standard { offsets, comp_stride } => {
                block.constant(format!("l_size{s}"), restriction.l_size);
                block.constant(format!("comp_stride{s}"), comp_stride);
                slot(&mut self.bindings.indices, side)[index] = Some(*offsets);
                block.call(
                    format!("{direction}LVecStandard{d}d"),
                    &[&format!("num_comp{s}"), &format!("comp_stride{s}"), &p_name],
                    &[
                        "data",
                        &format!("l_size{s}"),
                        "elem",
                        &format!("indices.{}[{index}]", side.slot()),
                        &from,
                        &to,
                    ],
                );
            }
            RestrictionKind::Strided { .. } => {
                let strides = restriction.strides().unwrap_or_default();
                self.stride_constants(block, &s, strides);
                block.call(
                    format!("{direction}LVecStrided{d}d"),
                    &[
                        &format!("num_comp{s}"),
                        &p_name,
                        &format!("strides{s}_0"),
                        &format!("strides{s}_1"),
                        &format!("strides{s}_2"),
                    ],
                    &["data", "elem", &from, &to],
                );
            }
            RestrictionKind::Points { offsets, comp_stride, .. } => {
                // Values at points are read and written inside the point loop
                if side == Side::Input {
                    block.constant(format!("comp_stride{s}"), comp_stride);
                }
                slot(&mut self.bindings.indices, side)[index] = Some(*offsets);
            }
            RestrictionKind::Oriented { .. } | RestrictionKind::CurlOriented { .. } => {
                return Err(not_implemented(field, "oriented restriction"));
            }
        }
        Ok(())
    }

    pub(super) fn stride_constants(&self, block: &mut Block, s: &str, strides: [usize; 3]) {
        block.push(Stmt::Constants(
            strides
                .iter()
                .enumerate()
                .map(|(k, stride)| (format!("strides{s}_{k}"), stride.to_string()))
                .collect(),
        ));
    }

    /// Maps element values to quadrature points, or quadrature values back to the element.
    pub(super) fn basis(&mut self, block: &mut Block, side: Side, index: usize) -> eyre::Result<()> {
        let field = self.field(side, index);
        let s = side.suffix(index);
        let basis = field.basis.as_ref();
        let is_tensor = field.is_tensor();
        let is_all_tensor = self.shape.is_all_tensor;
        let is_at_points = self.shape.is_at_points;
        let use_3d_slices = self.shape.use_3d_slices;
        let p_name = format!("{}{s}", if is_tensor { "P_1d" } else { "P" });
        let q_name = if is_tensor { "Q_1d" } else { "Q" };
        let dim = basis.map(|b| b.dim).unwrap_or(self.shape.max_dim);
        let p_1d = basis.map(|b| b.num_nodes_1d()).unwrap_or(0);
        let q_1d = self.shape.q_1d;
        let flattened = if is_all_tensor { "" } else { "Flattened" };
        let column = if is_all_tensor && dim >= 3 { q_name } else { "1" };
        let tensor_fn = |one_dim: &str, tensor: &str| {
            let name = if dim == 1 { one_dim } else { tensor };
            format!("{name}{dim}d")
        };
        // Mixed operators size the thread extent of tensor fields by their own table
        let op_t_1d = if is_all_tensor || !is_tensor {
            "OP_T_1D".to_string()
        } else if p_1d > q_1d {
            p_name.clone()
        } else {
            q_name.to_string()
        };
        let is_collocated = dim == 3 && q_1d >= p_1d;
        let num_comp = format!("num_comp{s}");
        let (r_e, r_q, r_c, s_b, s_g) = (
            format!("r_e{s}"),
            format!("r_q{s}"),
            format!("r_c{s}"),
            format!("s_B{s}"),
            format!("s_G{s}"),
        );

        block.comment(format!("EvalMode: {}", field.eval_mode.name()));
        match (side, field.eval_mode) {
            (Side::Input, EvalMode::None) => {
                if !use_3d_slices && !is_at_points {
                    block.alias(r_q, r_e);
                }
            }
            (Side::Input, EvalMode::Interp) | (Side::Input, EvalMode::Grad) if is_at_points => {
                let c_len = if dim >= 3 { q_name } else { "1" };
                block.array(&r_c, format!("{num_comp}*{c_len}"));
                block.call(
                    tensor_fn("Interp", "InterpTensor"),
                    &[&num_comp, &p_name, q_name, "OP_T_1D"],
                    &["data", &r_e, &s_b, &r_c],
                );
            }
            (Side::Input, EvalMode::Interp) => {
                let function = if is_tensor {
                    tensor_fn("Interp", "InterpTensor") + flattened
                } else {
                    "InterpNonTensor".to_string()
                };
                block.array(&r_q, format!("{num_comp}*{column}"));
                block.call(function, &[&num_comp, &p_name, q_name, &op_t_1d], &["data", &r_e, &s_b, &r_q]);
            }
            (Side::Input, EvalMode::Grad) if use_3d_slices => {
                block.array(&r_q, format!("{num_comp}*{q_name}"));
                block.call(
                    tensor_fn("Interp", "InterpTensor"),
                    &[&num_comp, &p_name, q_name, "OP_T_1D"],
                    &["data", &r_e, &s_b, &r_q],
                );
            }
            (Side::Input, EvalMode::Grad) if is_tensor => {
                let function = if dim == 1 {
                    "Grad1d".to_string()
                } else if is_collocated {
                    format!("GradTensorCollocated{dim}d")
                } else {
                    format!("GradTensor{dim}d")
                } + flattened;
                let op_t_1d = if is_all_tensor { "OP_T_1D" } else { &op_t_1d };
                block.array(&r_q, format!("{num_comp}*dim{s}*{column}"));
                block.call(
                    function,
                    &[&num_comp, &p_name, q_name, op_t_1d],
                    &["data", &r_e, &s_b, &s_g, &r_q],
                );
            }
            (Side::Input, EvalMode::Grad) => {
                block.array(&r_q, format!("{num_comp}*dim{s}"));
                block.call(
                    "GradNonTensor",
                    &[&num_comp, &format!("dim{s}"), &p_name, q_name, "OP_T_1D"],
                    &["data", &r_e, &s_g, &r_q],
                );
            }
            (Side::Input, EvalMode::Weight) => {
                if is_at_points {
                    block.comment("Nothing to do AtPoints");
                } else {
                    let basis = required_basis(field)?;
                    self.bindings.w = Some(basis.q_weight);
                    let function = if is_tensor {
                        tensor_fn("Weight", "WeightTensor") + flattened
                    } else {
                        "WeightNonTensor".to_string()
                    };
                    block.array(&r_q, column);
                    block.call(function, &[&p_name, q_name], &["data", "W", &r_q]);
                }
            }
            (Side::Output, EvalMode::None) => {
                block.alias(r_e, r_q);
            }
            (Side::Output, EvalMode::Interp) | (Side::Output, EvalMode::Grad) if is_at_points => {
                block.alias(&r_e, "r_e_scratch");
                block.call(
                    tensor_fn("InterpTranspose", "InterpTransposeTensor"),
                    &[&num_comp, &p_name, q_name, "OP_T_1D"],
                    &["data", &r_c, &s_b, &r_e],
                );
            }
            (Side::Output, EvalMode::Interp) => {
                block.alias(&r_e, "r_e_scratch");
                let function = if is_tensor {
                    tensor_fn("InterpTranspose", "InterpTransposeTensor") + flattened
                } else {
                    "InterpTransposeNonTensor".to_string()
                };
                block.call(function, &[&num_comp, &p_name, q_name, &op_t_1d], &["data", &r_q, &s_b, &r_e]);
            }
            (Side::Output, EvalMode::Grad) if use_3d_slices => {
                block.alias(&r_e, "r_e_scratch");
                block.call(
                    tensor_fn("InterpTranspose", "InterpTransposeTensor"),
                    &[&num_comp, &p_name, q_name, "OP_T_1D"],
                    &["data", &r_q, &s_b, &r_e],
                );
            }
            (Side::Output, EvalMode::Grad) if is_tensor => {
                block.alias(&r_e, "r_e_scratch");
                let function = if dim == 1 {
                    "GradTranspose1d".to_string()
                } else if is_collocated {
                    format!("GradTransposeTensorCollocated{dim}d")
                } else {
                    format!("GradTransposeTensor{dim}d")
                } + flattened;
                let op_t_1d = if is_all_tensor { "OP_T_1D" } else { &op_t_1d };
                block.call(
                    function,
                    &[&num_comp, &p_name, q_name, op_t_1d],
                    &["data", &r_q, &s_b, &s_g, &r_e],
                );
            }
            (Side::Output, EvalMode::Grad) => {
                block.alias(&r_e, "r_e_scratch");
                block.call(
                    "GradTransposeNonTensor",
                    &[&num_comp, &format!("dim{s}"), &p_name, q_name, "OP_T_1D"],
                    &["data", &r_q, &s_g, &r_e],
                );
            }
            (Side::Output, EvalMode::Weight) => {
                return Err(GenError::InvalidField {
                    field: field.name.clone(),
                    reason: "quadrature weights cannot be an output".to_string(),
                }
                .into());
            }
            (_, EvalMode::Div) | (_, EvalMode::Curl) => return Err(not_implemented(field, field.eval_mode.name())),
        }
        Ok(())
    }
}
