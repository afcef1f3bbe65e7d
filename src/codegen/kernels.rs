//! Kernel level structure: includes, signature, prologue and the element loop of each kind.
use super::reuse::{input_order, Side};
use super::syntax::{Block, KernelFunction, SourceFile, Stmt};
use super::{Emitter, KernelKind};
use crate::error::GenError;
use crate::operator::EvalMode;
use itertools::Itertools;

impl<'a> Emitter<'a> {
    pub(super) fn kernel(&mut self, kind: KernelKind, entry_point: &str) -> eyre::Result<SourceFile> {
        let preamble = self.preamble(kind)?;
        let mut body = self.prologue(kind)?;

        let mut element = Block::new();
        self.scratch_buffer(&mut element);
        match kind {
            KernelKind::Apply => self.apply(&mut element)?,
            KernelKind::QFunctionAssembly => self.qfunction_assembly(&mut element)?,
            KernelKind::DiagonalAssembly => self.assembly_at_points(&mut element, false)?,
            KernelKind::FullAssembly => self.assembly_at_points(&mut element, true)?,
        }

        body.blank();
        body.comment("Element loop");
        body.raw("__syncthreads()");
        body.push(Stmt::For {
            var: "elem".to_string(),
            start: "blockIdx.x*blockDim.z + threadIdx.z".to_string(),
            bound: "num_elem".to_string(),
            step: Some("gridDim.x*blockDim.z".to_string()),
            body: element,
        });

        let title = match kind {
            KernelKind::Apply => "Operator Kernel",
            _ => "Operator Assembly Kernel",
        };
        Ok(SourceFile {
            preamble,
            title: title.to_string(),
            kernel: KernelFunction {
                name: entry_point.to_string(),
                launch_bounds: kind == KernelKind::Apply,
                params: self.params(kind),
                body,
            },
        })
    }

    fn include_template(&self, block: &mut Block, comment: &str, name: &str) {
        block.comment(comment);
        block.push(Stmt::Include(self.template_header(name)));
        block.blank();
    }

    fn preamble(&self, kind: KernelKind) -> eyre::Result<Block> {
        let shape = &self.shape;
        let mut block = Block::new();
        if kind.is_assembly() && shape.is_at_points {
            self.include_template(&mut block, "Tensor basis source", "shared-basis-tensor-templates");
            self.include_template(&mut block, "AtPoints basis source", "shared-basis-tensor-at-points-templates");
        } else {
            if !shape.is_all_nontensor {
                self.include_template(&mut block, "Tensor basis source", "shared-basis-tensor-templates");
            }
            if !shape.is_all_tensor {
                self.include_template(&mut block, "Non-tensor basis source", "shared-basis-nontensor-templates");
            }
            if shape.is_at_points {
                self.include_template(&mut block, "AtPoints basis source", "shared-basis-tensor-at-points-templates");
            }
            if shape.is_mixed() {
                self.include_template(&mut block, "Tensor basis source", "shared-basis-tensor-flattened-templates");
            }
        }
        self.include_template(&mut block, "CodeGen operator source", "gen-templates");

        // Number of quadrature points the QFunction sees per call
        let q_vla = if shape.processes_columns() { shape.q_1d } else { 1 };
        block.blank();
        block.push(Stmt::Undef("CEED_Q_VLA".to_string()));
        block.push(Stmt::Define("CEED_Q_VLA".to_string(), q_vla.to_string()));
        block.blank();

        let qfunction = &self.operator.qfunction;
        let source_path = qfunction.source_path.as_ref().ok_or_else(|| {
            GenError::Unsupported(format!("QFunction '{}' has no source file", qfunction.name))
        })?;
        block.comment("User QFunction source");
        block.push(Stmt::IncludeLocal(source_path.display().to_string()));
        block.blank();
        Ok(block)
    }

    fn params(&self, kind: KernelKind) -> Vec<String> {
        let fields = self.type_name("Fields");
        let mut params = vec![
            "CeedInt num_elem".to_string(),
            "void* ctx".to_string(),
            format!("{} indices", self.type_name("FieldsInt")),
            format!("{fields} fields"),
            format!("{fields} B"),
            format!("{fields} G"),
        ];
        if kind.is_assembly() {
            params.push("CeedScalar *W".to_string());
        } else {
            params.push("CeedScalar* W".to_string());
        }
        params.push(format!("{} points", self.type_name("Points")));
        if kind.is_assembly() {
            params.push("CeedScalar *__restrict__ values_array".to_string());
        }
        params
    }

    /// Field pointers, constants, shared data and basis matrices.
    fn prologue(&mut self, kind: KernelKind) -> eyre::Result<Block> {
        let mut block = Block::new();
        for (i, field) in self.operator.inputs.iter().enumerate() {
            if field.eval_mode != EvalMode::Weight {
                block.push(Stmt::Pointer {
                    name: format!("d_in_{i}"),
                    target: format!("fields.inputs[{i}]"),
                    is_const: true,
                    restrict: true,
                });
            }
        }
        for i in 0..self.operator.outputs.len() {
            block.push(Stmt::Pointer {
                name: format!("d_out_{i}"),
                target: format!("fields.outputs[{i}]"),
                is_const: false,
                restrict: true,
            });
        }

        let shape = &self.shape;
        let is_assembly_at_points = kind.is_assembly() && shape.is_at_points;
        block.constant("max_dim", shape.max_dim);
        if !shape.is_all_tensor && !is_assembly_at_points {
            block.constant("Q", shape.q);
        }
        if !shape.is_all_nontensor || is_assembly_at_points {
            block.constant("Q_1d", shape.q_1d);
        }
        if shape.is_at_points {
            block.constant("max_num_points", shape.max_num_points);
            block.constant("coords_comp_stride", shape.coords_comp_stride);
        }

        let slice_stride = if !shape.is_all_tensor || shape.max_dim == 1 {
            "OP_T_1D"
        } else {
            "OP_T_1D*OP_T_1D"
        };
        block.raw("extern __shared__ CeedScalar slice[]");
        block.raw(format!("{} data", self.type_name("SharedData")));
        block.assign("data.t_id_x", "threadIdx.x");
        block.assign("data.t_id_y", "threadIdx.y");
        block.assign("data.t_id_z", "threadIdx.z");
        block.assign(
            "data.t_id  ",
            "threadIdx.x + threadIdx.y*blockDim.x + threadIdx.z*blockDim.y*blockDim.x",
        );
        block.assign("data.slice ", format!("slice + data.t_id_z*{slice_stride}"));

        if let Some(points) = &self.operator.points {
            self.bindings.points_indices = points.restriction.offsets();
        }

        for side in [Side::Input, Side::Output] {
            block.blank();
            block.comment(format!("{} field constants and basis data", side.label()));
            for index in 0..self.num_fields(side) {
                self.field_data(&mut block, side, index)?;
            }
        }
        Ok(block)
    }

    fn scratch_buffer(&self, block: &mut Block) {
        let column = if self.shape.has_column_registers() { self.shape.q_1d } else { 1 };
        let inputs = self
            .operator
            .inputs
            .iter()
            .filter(|field| !matches!(field.eval_mode, EvalMode::None | EvalMode::Weight));
        let outputs = self
            .operator
            .outputs
            .iter()
            .filter(|field| field.eval_mode != EvalMode::None);
        let size = inputs
            .chain(outputs)
            .map(|field| field.num_comp() * column)
            .fold(1, usize::max);
        block.comment("Scratch restriction buffer space");
        block.array("r_e_scratch", size.to_string());
    }

    fn apply(&mut self, block: &mut Block) -> eyre::Result<()> {
        let order = input_order(self.operator);
        block.blank();
        block.comment("-- Input field restrictions and basis actions");
        for &index in &order.order {
            self.field_comment(block, Side::Input, index, "----");
            self.restriction(block, Side::Input, index, Some(order.buffer_owner[index]))?;
            self.basis(block, Side::Input, index)?;
        }

        self.qfunction(block)?;

        block.blank();
        block.comment("-- Output field basis action and restrictions");
        for index in 0..self.operator.outputs.len() {
            self.field_comment(block, Side::Output, index, "----");
            self.basis(block, Side::Output, index)?;
            self.restriction(block, Side::Output, index, None)?;
        }
        Ok(())
    }

    fn active_outputs(&self) -> Vec<usize> {
        self.operator
            .outputs
            .iter()
            .positions(|field| field.vector.is_active())
            .collect()
    }

    /// Applies the operator to each unit vector of the active input in turn.
    fn assembly_at_points(&mut self, block: &mut Block, is_full: bool) -> eyre::Result<()> {
        let order = input_order(self.operator);
        let max_dim = self.shape.max_dim;

        block.blank();
        block.comment("-- Input field restrictions and basis actions");
        let mut active_input = None;
        for &index in &order.order {
            let field = self.field(Side::Input, index);
            let s = Side::Input.suffix(index);
            self.field_comment(block, Side::Input, index, "----");
            if field.vector.is_active() {
                block.comment("Active field - no restriction or basis action here");
                match active_input {
                    None => {
                        active_input = Some(index);
                        let column = if max_dim >= 3 { format!("P_1d{s}") } else { "1".to_string() };
                        block.zeroed_array(format!("r_e{s}"), format!("num_comp{s}*{column}"), "0.0");
                    }
                    Some(active) => {
                        block.alias(format!("r_e{s}"), format!("r_e_in_{active}"));
                    }
                }
            } else {
                self.restriction(block, Side::Input, index, Some(order.buffer_owner[index]))?;
                self.basis(block, Side::Input, index)?;
            }
        }
        let active = active_input.ok_or(GenError::NoActiveFields)?;
        let a = Side::Input.suffix(active);

        let nodes = std::iter::repeat(format!("*P_1d{a}")).take(max_dim).join("");
        let set_node = format!("SetEVecStandard{max_dim}d_Single");
        let names = [format!("num_comp{a}"), format!("P_1d{a}")];
        let template = [names[0].as_str(), names[1].as_str()];

        let mut node = Block::new();
        node.comment("Set current active node and component to 1.0");
        node.call(&set_node, &template, &["data", "n", "1.0", &format!("r_e{a}")]);
        node.blank();
        let active_inputs: Vec<usize> = order
            .order
            .iter()
            .copied()
            .filter(|&index| self.operator.inputs[index].vector.is_active())
            .collect();
        for index in active_inputs {
            self.field_comment(&mut node, Side::Input, index, "----");
            self.basis(&mut node, Side::Input, index)?;
        }

        self.qfunction(&mut node)?;

        node.blank();
        node.comment("-- Output field basis action and restrictions");
        for index in self.active_outputs() {
            let field = self.field(Side::Output, index);
            let s = Side::Output.suffix(index);
            self.field_comment(&mut node, Side::Output, index, "----");
            self.basis(&mut node, Side::Output, index)?;

            let restriction = super::fields::required_restriction(field)?;
            let (num_comp, comp_stride, l_size, p_name, r_e) = (
                format!("num_comp{s}"),
                format!("comp_stride{s}"),
                format!("l_size{s}"),
                format!("P_1d{s}"),
                format!("r_e{s}"),
            );
            node.constant(&l_size, restriction.l_size);
            node.constant(&comp_stride, restriction.comp_stride().unwrap_or(1));
            let template = [num_comp.as_str(), comp_stride.as_str(), p_name.as_str()];
            if is_full {
                node.call(
                    format!("WriteLVecStandard{max_dim}d_Assembly"),
                    &template,
                    &["data", &l_size, "elem", "n", &r_e, "values_array"],
                );
            } else {
                self.bindings.indices.outputs[index] = restriction.offsets();
                node.call(
                    format!("WriteLVecStandard{max_dim}d_Single"),
                    &template,
                    &[
                        "data",
                        &l_size,
                        "elem",
                        "n",
                        &format!("indices.outputs[{index}]"),
                        &r_e,
                        "values_array",
                    ],
                );
            }
        }

        node.blank();
        node.comment("Reset current active node and component to 0.0");
        node.call(&set_node, &template, &["data", "n", "0.0", &format!("r_e{a}")]);

        block.blank();
        block.comment("Loop over nodes in active field");
        block.range_loop("n", format!("num_comp{a}{nodes}"), node);
        Ok(())
    }

    /// Evaluates the QFunction on each unit vector of the active inputs at every point.
    fn qfunction_assembly(&mut self, block: &mut Block) -> eyre::Result<()> {
        let order = input_order(self.operator);
        let column = self.column("Q_1d");
        let q_name = self.q_name();

        block.blank();
        block.comment("-- Input field restrictions and basis actions");
        let mut active_inputs = Vec::new();
        for &index in &order.order {
            let field = self.field(Side::Input, index);
            let s = Side::Input.suffix(index);
            self.field_comment(block, Side::Input, index, "----");
            if field.vector.is_active() {
                active_inputs.push(index);
                let len = match field.eval_mode {
                    EvalMode::Grad => format!("num_comp{s}*dim{s}*{column}"),
                    _ => format!("num_comp{s}*{column}"),
                };
                block.zeroed_array(format!("r_q{s}"), len, "0.");
                block.constant(format!("field_size{s}"), field.qfunction_size());
            } else {
                self.restriction(block, Side::Input, index, Some(order.buffer_owner[index]))?;
                self.basis(block, Side::Input, index)?;
            }
        }
        let active_outputs = self.active_outputs();
        if active_inputs.is_empty() || active_outputs.is_empty() {
            return Err(GenError::NoActiveFields.into());
        }

        let list = |prefix: &str, indices: &[usize]| indices.iter().map(|i| format!("{prefix}{i}")).join(", ");
        let num_active_in = active_inputs.len();
        block.raw(format!(
            "const CeedInt field_sizes_in[{num_active_in}] = {{{}}}",
            list("field_size_in_", &active_inputs)
        ));
        block.raw(format!("CeedScalar * r_q_in[{num_active_in}] = {{{}}}", list("r_q_in_", &active_inputs)));

        let mut total_size_out = 0;
        for &index in &active_outputs {
            let field = self.field(Side::Output, index);
            self.field_comment(block, Side::Output, index, "----");
            block.constant(format!("field_size_out_{index}"), field.qfunction_size());
            total_size_out += field.qfunction_size();
        }
        block.raw(format!(
            "const CeedInt field_sizes_out[{}] = {{{}}}",
            active_outputs.len(),
            list("field_size_out_", &active_outputs)
        ));
        block.constant("total_size_out", total_size_out);

        let has_column_registers = self.shape.has_column_registers();
        let set_point = |value: &str| {
            let mut set = Block::new();
            if has_column_registers {
                let mut body = Block::new();
                body.assign("r_q_in[a][i + s * Q_1d]", value);
                set.range_loop("i", "Q_1d", body);
            } else {
                set.assign("r_q_in[a][s]", value);
            }
            set
        };

        let mut component = Block::new();
        component.comment("Set current active point and component to 1.0");
        component.append(set_point("1.0"));
        self.qfunction(&mut component)?;

        component.blank();
        component.comment("-- Output field basis action and restrictions");
        let d = if self.shape.is_all_tensor { self.shape.max_dim } else { 1 };
        let mut offset = 0;
        for &index in &active_outputs {
            let field = self.field(Side::Output, index);
            self.field_comment(&mut component, Side::Output, index, "----");
            component.call(
                format!("WriteLVecStandard{d}d_QFAssembly"),
                &["total_size_out", &format!("field_size_out_{index}"), q_name],
                &[
                    "data",
                    "num_elem",
                    "elem",
                    "input_offset + s",
                    &offset.to_string(),
                    &format!("r_q_out_{index}"),
                    "values_array",
                ],
            );
            offset += field.qfunction_size();
        }
        component.blank();
        component.comment("Reset current active node and component to 0.0");
        component.append(set_point("0.0"));

        let mut active = Block::new();
        active.blank();
        active.comment("Loop over current active input field size");
        active.constant("field_size_in", "field_sizes_in[a]");
        active.range_loop("s", "field_size_in", component);
        active.raw("input_offset += field_size_in");

        block.blank();
        block.raw("CeedInt input_offset = 0");
        block.comment("Loop over active QFunction input fields");
        block.constant("num_active_in", num_active_in);
        block.range_loop("a", "num_active_in", active);
        Ok(())
    }
}
