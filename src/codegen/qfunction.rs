//! The QFunction call and the per point or per plane code surrounding it.
use super::fields::required_restriction;
use super::reuse::Side;
use super::syntax::{Block, Stmt};
use super::{not_implemented, slot, Emitter};
use crate::operator::{EvalMode, RestrictionKind};

/// `for (CeedInt i = 0; i < len; i++) name[i] = 0.0;`
fn zero_fill(block: &mut Block, name: &str, len: &str) {
    let mut body = Block::new();
    body.assign(format!("{name}[i]"), "0.0");
    block.range_loop("i", len, body);
}

impl<'a> Emitter<'a> {
    /// Name of the quadrature point extent in generated source.
    pub(super) fn q_name(&self) -> &'static str {
        if self.shape.is_all_tensor {
            "Q_1d"
        } else {
            "Q"
        }
    }

    pub(super) fn field_comment(&self, block: &mut Block, side: Side, index: usize, depth: &str) {
        let field = self.field(side, index);
        block.comment(format!("{depth} {} field {index}: {}", side.label(), field.name));
    }

    /// Emits the QFunction evaluation of one element, including the quadrature registers of the
    /// outputs and the traversal over points or planes.
    pub(super) fn qfunction(&mut self, block: &mut Block) -> eyre::Result<()> {
        let q_name = self.q_name();
        let max_dim = self.shape.max_dim;
        let at_points_len = if max_dim >= 3 { q_name } else { "1" };
        let column = self.column(q_name);

        block.blank();
        block.comment("-- Output field setup");
        for index in 0..self.operator.outputs.len() {
            let field = self.field(Side::Output, index);
            let s = Side::Output.suffix(index);
            self.field_comment(block, Side::Output, index, "----");
            match (field.eval_mode, self.shape.is_at_points) {
                (EvalMode::None, true) => {
                    block.array(format!("r_q{s}"), format!("num_comp{s}"));
                }
                (EvalMode::None, false) | (EvalMode::Interp, false) => {
                    block.array(format!("r_q{s}"), format!("num_comp{s}*{column}"));
                }
                (EvalMode::Interp, true) | (EvalMode::Grad, true) => {
                    // Accumulates the contributions of all points
                    let len = format!("num_comp{s}*{at_points_len}");
                    block.array(format!("r_c{s}"), &len);
                    zero_fill(block, &format!("r_c{s}"), &len);
                }
                (EvalMode::Grad, false) if self.shape.use_3d_slices => {
                    let len = format!("num_comp{s}*{q_name}");
                    block.array(format!("r_q{s}"), &len);
                    zero_fill(block, &format!("r_q{s}"), &len);
                }
                (EvalMode::Grad, false) => {
                    block.array(format!("r_q{s}"), format!("num_comp{s}*dim{s}*{column}"));
                }
                (EvalMode::Weight, _) => {}
                (EvalMode::Div, _) | (EvalMode::Curl, _) => {
                    return Err(not_implemented(field, field.eval_mode.name()))
                }
            }
        }

        if self.shape.is_at_points {
            block.blank();
            block.comment("Note: Using batches of points");
            block.constant(
                "point_loop_bound",
                "(blockDim.x*blockDim.y) * ceil((1.0*max_num_points) / (blockDim.x*blockDim.y))",
            );
            block.push(Stmt::Pragma("unroll".to_string()));
            let mut body = self.point_fields()?;
            self.qfunction_call(&mut body);
            self.point_write_back(&mut body)?;
            block.push(Stmt::For {
                var: "i".to_string(),
                start: "threadIdx.x + threadIdx.y*blockDim.x".to_string(),
                bound: "point_loop_bound".to_string(),
                step: Some("blockDim.x*blockDim.y".to_string()),
                body,
            });
        } else if self.shape.use_3d_slices {
            block.blank();
            block.comment("Note: Using planes of 3D elements");
            block.push(Stmt::Pragma("unroll".to_string()));
            let mut body = self.slice_fields()?;
            self.qfunction_call(&mut body);
            self.slice_write_back(&mut body)?;
            block.range_loop("q", q_name, body);
        } else {
            block.blank();
            block.comment("Note: Using full elements");
            let mut body = Block::new();
            for side in [Side::Input, Side::Output] {
                body.comment(format!("-- {} fields", side.label()));
                for index in 0..self.num_fields(side) {
                    let s = side.suffix(index);
                    self.field_comment(&mut body, side, index, "----");
                    body.alias(format!("r_s{s}"), format!("r_q{s}"));
                }
            }
            self.qfunction_call(&mut body);
            block.scope(body);
        }
        Ok(())
    }

    pub(super) fn num_fields(&self, side: Side) -> usize {
        match side {
            Side::Input => self.operator.inputs.len(),
            Side::Output => self.operator.outputs.len(),
        }
    }

    /// Declares the per point registers of the output fields.
    fn output_point_registers(&self, body: &mut Block) -> eyre::Result<()> {
        body.blank();
        body.comment("-- Output fields");
        for index in 0..self.operator.outputs.len() {
            let field = self.field(Side::Output, index);
            let s = Side::Output.suffix(index);
            self.field_comment(body, Side::Output, index, "----");
            match field.eval_mode {
                EvalMode::None | EvalMode::Interp => {
                    body.array(format!("r_s{s}"), format!("num_comp{s}"));
                }
                EvalMode::Grad => {
                    body.array(format!("r_s{s}"), format!("num_comp{s}*dim{s}"));
                }
                EvalMode::Weight => {}
                EvalMode::Div | EvalMode::Curl => return Err(not_implemented(field, field.eval_mode.name())),
            }
        }
        Ok(())
    }

    fn point_fields(&self) -> eyre::Result<Block> {
        let q_name = self.q_name();
        let max_dim = self.shape.max_dim;
        let mut body = Block::new();
        body.constant("p", "i % max_num_points");
        body.blank();
        body.comment("-- Coordinates");
        body.array("r_x", "max_dim");
        body.call(
            "ReadPoint",
            &["max_dim", "coords_comp_stride", "max_num_points"],
            &["data", "elem", "p", "max_num_points", "points.indices", "points.coords", "r_x"],
        );
        body.blank();

        body.comment("-- Input fields");
        for index in 0..self.operator.inputs.len() {
            let field = self.field(Side::Input, index);
            let s = Side::Input.suffix(index);
            let (num_comp, p_name, r_s) = (format!("num_comp{s}"), format!("P_1d{s}"), format!("r_s{s}"));
            self.field_comment(&mut body, Side::Input, index, "----");
            body.comment(format!("EvalMode: {}", field.eval_mode.name()));
            match field.eval_mode {
                EvalMode::None => {
                    body.array(&r_s, &num_comp);
                    body.call(
                        "ReadPoint",
                        &[&num_comp, &format!("comp_stride{s}"), "max_num_points"],
                        &[
                            "data",
                            "elem",
                            "p",
                            "max_num_points",
                            &format!("indices.inputs[{index}]"),
                            &format!("d{s}"),
                            &r_s,
                        ],
                    );
                }
                EvalMode::Interp => {
                    body.array(&r_s, &num_comp);
                    body.call(
                        format!("InterpAtPoints{max_dim}d"),
                        &[&num_comp, "max_num_points", &p_name, q_name],
                        &["data", "i", &format!("r_c{s}"), "r_x", &r_s],
                    );
                }
                EvalMode::Grad => {
                    body.array(&r_s, format!("{num_comp}*dim{s}"));
                    body.call(
                        format!("GradAtPoints{max_dim}d"),
                        &[&num_comp, "max_num_points", &p_name, q_name],
                        &["data", "i", &format!("r_c{s}"), "r_x", &r_s],
                    );
                }
                EvalMode::Weight => {
                    body.array(&r_s, "1");
                    body.assign(format!("{r_s}[0]"), "1.0");
                }
                EvalMode::Div | EvalMode::Curl => return Err(not_implemented(field, field.eval_mode.name())),
            }
        }
        self.output_point_registers(&mut body)?;
        Ok(body)
    }

    fn slice_fields(&mut self) -> eyre::Result<Block> {
        let q_name = self.q_name();
        let mut body = Block::new();
        body.comment("-- Input fields");
        for index in 0..self.operator.inputs.len() {
            let field = self.field(Side::Input, index);
            let s = Side::Input.suffix(index);
            let (num_comp, r_s, r_q) = (format!("num_comp{s}"), format!("r_s{s}"), format!("r_q{s}"));
            self.field_comment(&mut body, Side::Input, index, "----");
            body.comment(format!("EvalMode: {}", field.eval_mode.name()));
            match field.eval_mode {
                EvalMode::None => {
                    body.array(&r_s, &num_comp);
                    let restriction = required_restriction(field)?;
                    match &restriction.kind {
                        RestrictionKind::Strided { .. } => {
                            let strides = restriction.strides().unwrap_or_default();
                            self.stride_constants(&mut body, &s, strides);
                            body.call(
                                "ReadEVecSliceStrided3d",
                                &[
                                    &num_comp,
                                    q_name,
                                    &format!("strides{s}_0"),
                                    &format!("strides{s}_1"),
                                    &format!("strides{s}_2"),
                                ],
                                &["data", "elem", "q", &format!("d{s}"), &r_s],
                            );
                        }
                        _ => {
                            body.constant(format!("l_size{s}"), restriction.l_size);
                            body.constant(format!("comp_stride{s}"), restriction.comp_stride().unwrap_or(1));
                            self.bindings.indices.inputs[index] = restriction.offsets();
                            body.call(
                                "ReadEVecSliceStandard3d",
                                &[&num_comp, &format!("comp_stride{s}"), q_name],
                                &[
                                    "data",
                                    &format!("l_size{s}"),
                                    "elem",
                                    "q",
                                    &format!("indices.inputs[{index}]"),
                                    &format!("d{s}"),
                                    &r_s,
                                ],
                            );
                        }
                    }
                }
                EvalMode::Interp => {
                    body.array(&r_s, &num_comp);
                    let mut copy = Block::new();
                    copy.assign(format!("{r_s}[j]"), format!("{r_q}[q + j*{q_name}]"));
                    body.range_loop("j", &num_comp, copy);
                }
                EvalMode::Grad => {
                    body.array(&r_s, format!("{num_comp}*dim{s}"));
                    body.call(
                        "GradColloSlice3d",
                        &[&num_comp, q_name, "OP_T_1D"],
                        &["data", "q", &r_q, &format!("s_G{s}"), &r_s],
                    );
                }
                EvalMode::Weight => {
                    body.array(&r_s, "1");
                    body.assign(format!("{r_s}[0]"), format!("{r_q}[q]"));
                }
                EvalMode::Div | EvalMode::Curl => return Err(not_implemented(field, field.eval_mode.name())),
            }
        }
        self.output_point_registers(&mut body)?;
        Ok(body)
    }

    fn qfunction_call(&self, body: &mut Block) {
        body.blank();
        body.comment("-- QFunction inputs and outputs");
        for side in [Side::Input, Side::Output] {
            let name = side.slot();
            body.comment(format!("---- {}s", side.label()));
            body.raw(format!("CeedScalar *{name}[{}]", self.num_fields(side).max(1)));
            for index in 0..self.num_fields(side) {
                self.field_comment(body, side, index, "------");
                body.assign(format!("{name}[{index}]"), format!("r_s{}", side.suffix(index)));
            }
        }

        let count = if self.shape.processes_columns() {
            self.q_name()
        } else {
            "1"
        };
        body.blank();
        body.comment("-- Apply QFunction");
        body.invoke(&self.operator.qfunction.name, &["ctx", count, "inputs", "outputs"]);
    }

    fn point_write_back(&mut self, body: &mut Block) -> eyre::Result<()> {
        let q_name = self.q_name();
        let max_dim = self.shape.max_dim;
        body.blank();
        body.comment("-- Output fields");
        for index in 0..self.operator.outputs.len() {
            let field = self.field(Side::Output, index);
            let s = Side::Output.suffix(index);
            let (num_comp, p_name, r_s) = (format!("num_comp{s}"), format!("P_1d{s}"), format!("r_s{s}"));
            self.field_comment(body, Side::Output, index, "----");
            body.comment(format!("EvalMode: {}", field.eval_mode.name()));
            let (len, function) = match field.eval_mode {
                EvalMode::None => {
                    let restriction = required_restriction(field)?;
                    body.constant(format!("comp_stride{s}"), restriction.comp_stride().unwrap_or(1));
                    slot(&mut self.bindings.indices, Side::Output)[index] = restriction.offsets();
                    body.call(
                        "WritePoint",
                        &[&num_comp, &format!("comp_stride{s}"), "max_num_points"],
                        &[
                            "data",
                            "elem",
                            "i",
                            "points.num_per_elem[elem]",
                            &format!("indices.outputs[{index}]"),
                            &r_s,
                            &format!("d{s}"),
                        ],
                    );
                    continue;
                }
                EvalMode::Interp => (num_comp.clone(), format!("InterpTransposeAtPoints{max_dim}d")),
                EvalMode::Grad => (format!("{num_comp}*dim{s}"), format!("GradTransposeAtPoints{max_dim}d")),
                EvalMode::Weight => continue,
                EvalMode::Div | EvalMode::Curl => return Err(not_implemented(field, field.eval_mode.name())),
            };
            // Padding points must not contribute
            let mut padding = Block::new();
            let mut zero = Block::new();
            zero.assign(format!("{r_s}[j]"), "0.0");
            padding.range_loop("j", len, zero);
            body.push(Stmt::If {
                condition: "i >= points.num_per_elem[elem]".to_string(),
                body: padding,
            });
            body.call(
                function,
                &[&num_comp, "max_num_points", &p_name, q_name],
                &["data", "i", &r_s, "r_x", &format!("r_c{s}")],
            );
        }
        Ok(())
    }

    fn slice_write_back(&self, body: &mut Block) -> eyre::Result<()> {
        let q_name = self.q_name();
        body.blank();
        body.comment("-- Output fields");
        for index in 0..self.operator.outputs.len() {
            let field = self.field(Side::Output, index);
            let s = Side::Output.suffix(index);
            let (num_comp, r_s, r_q) = (format!("num_comp{s}"), format!("r_s{s}"), format!("r_q{s}"));
            self.field_comment(body, Side::Output, index, "----");
            body.comment(format!("EvalMode: {}", field.eval_mode.name()));
            match field.eval_mode {
                EvalMode::None | EvalMode::Interp => {
                    let mut copy = Block::new();
                    copy.assign(format!("{r_q}[q + j*{q_name}]"), format!("{r_s}[j]"));
                    body.range_loop("j", &num_comp, copy);
                }
                EvalMode::Grad => {
                    body.call(
                        "GradColloSliceTranspose3d",
                        &[&num_comp, q_name, "OP_T_1D"],
                        &["data", "q", &r_s, &format!("s_G{s}"), &r_q],
                    );
                }
                EvalMode::Weight => {}
                EvalMode::Div | EvalMode::Curl => return Err(not_implemented(field, field.eval_mode.name())),
            }
        }
        Ok(())
    }
}
