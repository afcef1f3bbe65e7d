//! Sharing of basis matrices and element buffers between fields.
use crate::operator::{EvalMode, Operator, OperatorField};

/// Whether a field is an input or an output of the QFunction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Input,
    Output,
}

impl Side {
    /// Member of the `Fields_*` argument structs holding this side.
    pub fn slot(&self) -> &'static str {
        match self {
            Self::Input => "inputs",
            Self::Output => "outputs",
        }
    }

    /// Suffix of generated variables belonging to field `index`, e.g. `_in_2`.
    pub fn suffix(&self, index: usize) -> String {
        match self {
            Self::Input => format!("_in_{index}"),
            Self::Output => format!("_out_{index}"),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Input => "Input",
            Self::Output => "Output",
        }
    }
}

/// Reference to the field whose shared memory matrices another field aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldReuse {
    pub side: Side,
    pub index: usize,
    /// Evaluation mode of the aliased field. The gradient matrix is only shared with gradient fields.
    pub eval_mode: EvalMode,
}

impl FieldReuse {
    pub fn suffix(&self) -> String {
        self.side.suffix(self.index)
    }
}

/// For every field, the earlier field whose basis matrices it reuses, if any.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReuseMap {
    pub inputs: Vec<Option<FieldReuse>>,
    pub outputs: Vec<Option<FieldReuse>>,
}

impl ReuseMap {
    pub fn get(&self, side: Side, index: usize) -> Option<FieldReuse> {
        let slots = match side {
            Side::Input => &self.inputs,
            Side::Output => &self.outputs,
        };
        slots.get(index).copied().flatten()
    }

    /// Number of fields loading their own matrices.
    pub fn num_owned(&self) -> usize {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .filter(|reuse| reuse.is_none())
            .count()
    }
}

fn can_reuse(field: &OperatorField, candidate: &OperatorField) -> bool {
    if candidate.eval_mode == EvalMode::Weight || !field.shares_basis_with(candidate) {
        return false;
    }
    // Non-tensor bases store different matrices per evaluation mode
    field.is_tensor() || field.eval_mode == candidate.eval_mode
}

fn find_reuse<'a>(
    field: &OperatorField,
    candidates: impl Iterator<Item = (Side, usize, &'a OperatorField)>,
) -> Option<FieldReuse> {
    if field.eval_mode == EvalMode::Weight {
        return None;
    }
    candidates
        .filter(|(_, _, candidate)| can_reuse(field, candidate))
        .map(|(side, index, candidate)| FieldReuse {
            side,
            index,
            eval_mode: candidate.eval_mode,
        })
        .next()
}

/// Determines which fields alias the basis matrices of an earlier field.
///
/// Inputs consider earlier inputs, outputs consider all inputs followed by earlier outputs. The
/// first match wins and aliases are never chained.
pub fn matrix_reuse(operator: &Operator) -> ReuseMap {
    let inputs = operator
        .inputs
        .iter()
        .enumerate()
        .map(|(i, field)| {
            let earlier = operator.inputs[..i]
                .iter()
                .enumerate()
                .map(|(j, candidate)| (Side::Input, j, candidate));
            find_reuse(field, earlier)
        })
        .collect();
    let outputs = operator
        .outputs
        .iter()
        .enumerate()
        .map(|(i, field)| {
            let all_inputs = operator
                .inputs
                .iter()
                .enumerate()
                .map(|(j, candidate)| (Side::Input, j, candidate));
            let earlier_outputs = operator.outputs[..i]
                .iter()
                .enumerate()
                .map(|(j, candidate)| (Side::Output, j, candidate));
            find_reuse(field, all_inputs.chain(earlier_outputs))
        })
        .collect();
    ReuseMap { inputs, outputs }
}

/// Processing order of the input fields.
///
/// Inputs gathered through the same restriction from the same vector are processed back to back
/// and share the element buffer of the first of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputOrder {
    pub order: Vec<usize>,
    /// For each input, the input owning its element buffer.
    pub buffer_owner: Vec<usize>,
}

pub fn input_order(operator: &Operator) -> InputOrder {
    let num_inputs = operator.inputs.len();
    let mut order = Vec::with_capacity(num_inputs);
    let mut buffer_owner: Vec<usize> = (0..num_inputs).collect();
    let mut is_ordered = vec![false; num_inputs];

    for i in 0..num_inputs {
        if is_ordered[i] {
            continue;
        }
        is_ordered[i] = true;
        order.push(i);
        for j in i + 1..num_inputs {
            if !is_ordered[j] && operator.inputs[i].shares_restriction_with(&operator.inputs[j]) {
                is_ordered[j] = true;
                order.push(j);
                buffer_owner[j] = i;
            }
        }
    }
    InputOrder { order, buffer_owner }
}
