use crate::unit_tests::mock::{
    diffusion_operator, mass_at_points, mass_operator, nontensor_basis, points_restriction, standard_restriction,
    tensor_basis, Memory,
};
use fenris_gen::classify::{classify, unsupported_reason};
use fenris_gen::error::GenError;
use fenris_gen::operator::{EvalMode, FieldVector, Operator, OperatorField, QFunction};
use std::sync::Arc;

fn gen_error(result: eyre::Result<impl std::fmt::Debug>) -> GenError {
    let report = result.expect_err("Classification must fail");
    report
        .downcast_ref::<GenError>()
        .cloned()
        .expect("Error must be a GenError")
}

#[test]
fn tensor_mass_operator_shape() {
    let memory = Arc::new(Memory::default());
    let shape = classify(&mass_operator(&memory, 10, 2, 3, 4)).unwrap();

    assert!(shape.is_all_tensor);
    assert!(!shape.is_all_nontensor);
    assert!(!shape.is_mixed());
    assert!(!shape.is_at_points);
    assert!(!shape.use_3d_slices);
    assert_eq!(shape.max_dim, 2);
    assert_eq!(shape.max_p_1d, 3);
    assert_eq!(shape.max_p, 9);
    assert_eq!(shape.q_1d, 4);
    assert_eq!(shape.q, 16);
    assert_eq!(shape.thread_nodes(), 3);
    assert!(!shape.processes_columns());
    assert!(!shape.has_column_registers());
}

#[test]
fn collocated_3d_gradients_use_slices() {
    let shape = classify(&diffusion_operator(8, 3, 3, 4, true)).unwrap();
    assert!(shape.use_3d_slices);
    assert!(!shape.processes_columns());
    assert!(shape.has_column_registers());

    let shape = classify(&diffusion_operator(8, 3, 3, 4, false)).unwrap();
    assert!(!shape.use_3d_slices);
    assert!(shape.processes_columns());

    // Slices only apply to 3D elements
    let shape = classify(&diffusion_operator(8, 2, 3, 4, true)).unwrap();
    assert!(!shape.use_3d_slices);
}

#[test]
fn mixed_tensor_and_nontensor_bases() {
    let num_elem = 4;
    let tensor = Arc::new(tensor_basis(2, 2, 3));
    let simplex = Arc::new(nontensor_basis(2, 6, 9));
    let operator = Operator::new(QFunction::new("mixed", "qfunctions/mixed.h"), num_elem, 9)
        .with_input(
            OperatorField::new("u", EvalMode::Interp)
                .with_basis(tensor)
                .with_restriction(standard_restriction(num_elem, 4, 1))
                .with_vector(FieldVector::Active),
        )
        .with_output(
            OperatorField::new("v", EvalMode::Interp)
                .with_basis(simplex)
                .with_restriction(standard_restriction(num_elem, 6, 1))
                .with_vector(FieldVector::Active),
        );

    let shape = classify(&operator).unwrap();
    assert!(shape.is_mixed());
    assert_eq!(shape.max_p, 6);
    assert_eq!(shape.max_p_1d, 2);
    assert_eq!(shape.q, 9);
    assert_eq!(shape.q_1d, 3);
    assert_eq!(shape.thread_nodes(), 6);
}

#[test]
fn incompatible_quadrature_is_a_configuration_error() {
    let num_elem = 3;
    let operator = Operator::new(QFunction::new("mass", "qfunctions/mass.h"), num_elem, 9)
        .with_input(
            OperatorField::new("u", EvalMode::Interp)
                .with_basis(Arc::new(tensor_basis(2, 2, 3)))
                .with_restriction(standard_restriction(num_elem, 4, 1))
                .with_vector(FieldVector::Active),
        )
        .with_output(
            OperatorField::new("v", EvalMode::Interp)
                .with_basis(Arc::new(tensor_basis(2, 2, 4)))
                .with_restriction(standard_restriction(num_elem, 4, 1))
                .with_vector(FieldVector::Active),
        );

    assert_eq!(gen_error(classify(&operator)), GenError::IncompatibleQuadrature);
}

#[test]
fn bases_must_match_quadrature_points_of_operator() {
    let memory = Arc::new(Memory::default());
    let mut operator = mass_operator(&memory, 10, 2, 3, 4);
    operator.num_qpts = 4;
    assert_eq!(gen_error(classify(&operator)), GenError::IncompatibleQuadrature);

    // Points are not tied to the quadrature of the bases
    let mut operator = mass_at_points(&memory, vec![3, 2]);
    operator.num_qpts = 5;
    let shape = classify(&operator).unwrap();
    assert_eq!(shape.q, 16);
}

#[test]
fn fields_missing_basis_or_restriction_are_invalid() {
    let operator = Operator::new(QFunction::new("mass", "qfunctions/mass.h"), 2, 4).with_input(
        OperatorField::new("u", EvalMode::Interp)
            .with_restriction(standard_restriction(2, 4, 1))
            .with_vector(FieldVector::Active),
    );
    assert!(matches!(
        gen_error(classify(&operator)),
        GenError::InvalidField { field, .. } if field == "u"
    ));

    let operator = Operator::new(QFunction::new("mass", "qfunctions/mass.h"), 2, 4).with_input(
        OperatorField::new("u", EvalMode::Interp)
            .with_basis(Arc::new(tensor_basis(2, 2, 2)))
            .with_vector(FieldVector::Active),
    );
    assert!(matches!(gen_error(classify(&operator)), GenError::InvalidField { .. }));
}

#[test]
fn weights_as_output_are_invalid() {
    let operator = Operator::new(QFunction::new("setup", "qfunctions/setup.h"), 2, 4)
        .with_output(OperatorField::new("w", EvalMode::Weight).with_basis(Arc::new(tensor_basis(2, 2, 2))));
    assert!(matches!(gen_error(classify(&operator)), GenError::InvalidField { .. }));
}

#[test]
fn qfunction_without_source_is_unsupported() {
    let memory = Arc::new(Memory::default());
    let mut operator = mass_operator(&memory, 2, 2, 2, 2);
    operator.qfunction.source_path = None;
    assert!(matches!(gen_error(classify(&operator)), GenError::Unsupported(_)));
}

#[test]
fn restriction_only_identity_is_unsupported() {
    let restriction = standard_restriction(2, 4, 1);
    let mut qfunction = QFunction::new("identity", "qfunctions/identity.h");
    qfunction.identity = true;
    let operator = Operator::new(qfunction, 2, 4)
        .with_input(
            OperatorField::new("input", EvalMode::None)
                .with_restriction(Arc::clone(&restriction))
                .with_vector(FieldVector::Active),
        )
        .with_output(
            OperatorField::new("output", EvalMode::None)
                .with_restriction(restriction)
                .with_vector(FieldVector::Active),
        );
    assert!(matches!(gen_error(classify(&operator)), GenError::Unsupported(_)));
}

#[test]
fn at_points_shape() {
    let memory = Arc::new(Memory::default());
    let operator = mass_at_points(&memory, vec![3, 7, 5]);
    let shape = classify(&operator).unwrap();

    assert!(shape.is_at_points);
    assert!(!shape.use_3d_slices);
    assert_eq!(shape.max_num_points, 7);
    assert_eq!(shape.coords_comp_stride, 15);
    assert_eq!(shape.q_1d, 4);
    assert_eq!(unsupported_reason(&operator), None);
}

#[test]
fn at_points_requires_points_restriction() {
    let memory = Arc::new(Memory::default());
    let mut operator = mass_at_points(&memory, vec![2, 2]);
    if let Some(points) = &mut operator.points {
        points.restriction = standard_restriction(2, 2, 2);
    }
    assert_eq!(gen_error(classify(&operator)), GenError::MissingPoints);
}

#[test]
fn unsupported_operators_are_reported_without_error() {
    let memory = Arc::new(Memory::default());

    let mut operator = mass_operator(&memory, 2, 2, 2, 2);
    operator.inputs[0].eval_mode = EvalMode::Div;
    assert!(unsupported_reason(&operator).is_some());

    let mut operator = mass_at_points(&memory, vec![2, 2]);
    let basis = Arc::new(tensor_basis(2, 3, 4));
    operator.inputs[0].basis = Some(Arc::clone(&basis));
    operator.outputs[0].basis = Some(basis);
    assert!(unsupported_reason(&operator)
        .unwrap()
        .contains("Chebyshev"));

    let mut operator = mass_operator(&memory, 2, 2, 2, 2);
    let mut basis = tensor_basis(2, 2, 2);
    basis.shared_layout = false;
    operator.inputs[0].basis = Some(Arc::new(basis));
    assert!(unsupported_reason(&operator).is_some());

    let operator = Operator::new(QFunction::new("mass", "qfunctions/mass.h"), 2, 4)
        .with_input(
            OperatorField::new("u", EvalMode::Interp)
                .with_basis(Arc::new(nontensor_basis(2, 3, 4)))
                .with_restriction(standard_restriction(2, 3, 1))
                .with_vector(FieldVector::Active),
        )
        .at_points(points_restriction(2, vec![1, 1]), crate::unit_tests::mock::MockVector::zeros(&memory, 4));
    assert!(unsupported_reason(&operator).is_some());
}

#[test]
fn sizes_of_high_dimensional_bases_saturate() {
    assert_eq!(tensor_basis(4, 3, 4).num_qpts(), 256);
    let basis = Arc::new(tensor_basis(64, 3, 4));
    assert_eq!(basis.num_nodes(), usize::MAX);
    assert_eq!(basis.num_qpts(), usize::MAX);

    let memory = Arc::new(Memory::default());
    let mut operator = mass_operator(&memory, 2, 2, 3, 4);
    operator.inputs[0].basis = Some(Arc::clone(&basis));
    operator.outputs[0].basis = Some(basis);
    operator.num_qpts = usize::MAX;

    let shape = classify(&operator).unwrap();
    assert_eq!(shape.max_dim, 64);
    assert!(unsupported_reason(&operator)
        .unwrap()
        .contains("dimension 64"));
}
