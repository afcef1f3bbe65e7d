use crate::unit_tests::mock::{
    diffusion_operator, mass_at_points, mass_operator, nontensor_basis, standard_restriction, tensor_basis, Memory,
};
use fenris_gen::classify::classify;
use fenris_gen::codegen::reuse::{input_order, matrix_reuse, Side};
use fenris_gen::codegen::syntax::Stmt;
use fenris_gen::codegen::{synthesize, KernelKind, MatrixSource, SynthesizedKernel};
use fenris_gen::device::DevicePtr;
use fenris_gen::error::GenError;
use fenris_gen::operator::{EvalMode, FieldVector, Operator, OperatorField, QFunction};
use fenris_gen::options::{GenOptions, Target};
use std::sync::Arc;

fn generate(kind: KernelKind, operator: &Operator, options: &GenOptions) -> eyre::Result<SynthesizedKernel> {
    let shape = classify(operator)?;
    synthesize(kind, operator, &shape, options)
}

/// Names of all functions called by the kernel body.
fn calls(kernel: &SynthesizedKernel) -> Vec<String> {
    let mut names = Vec::new();
    kernel.syntax.kernel.body.walk(&mut |stmt| {
        if let Stmt::Call { function, .. } = stmt {
            names.push(function.clone());
        }
    });
    names
}

fn count_calls(kernel: &SynthesizedKernel, function: &str) -> usize {
    calls(kernel).iter().filter(|name| *name == function).count()
}

#[test]
fn apply_kernel_for_tensor_mass_operator() {
    let memory = Arc::new(Memory::default());
    let operator = mass_operator(&memory, 100, 2, 3, 4);
    let kernel = generate(KernelKind::Apply, &operator, &GenOptions::default()).unwrap();

    assert_eq!(kernel.source.entry_point, "CeedKernelCudaGenOperator_mass");
    assert_eq!(kernel.thread_1d, 4);
    assert_eq!(kernel.block, [4, 4, 2]);
    assert_eq!(kernel.source.define("OP_T_1D"), Some(4));
    assert_eq!(kernel.source.define("BLOCK_SIZE"), Some(32));

    let code = &kernel.source.code;
    assert!(code.contains("extern \"C\" __launch_bounds__(BLOCK_SIZE)"));
    assert!(code.contains("__global__ void CeedKernelCudaGenOperator_mass(CeedInt num_elem, void* ctx"));
    assert!(code.contains("#include <ceed/jit-source/cuda/cuda-shared-basis-tensor-templates.h>"));
    assert!(code.contains("#include <ceed/jit-source/cuda/cuda-gen-templates.h>"));
    assert!(code.contains("#include \"qfunctions/mass.h\""));
    assert!(!code.contains("nontensor"));
    assert!(code.contains("#define CEED_Q_VLA 1"));
    assert!(code.contains("Note: Using full elements"));
    assert!(code.contains("mass(ctx, 1, inputs, outputs);"));
    assert!(code.contains("for (CeedInt elem = blockIdx.x*blockDim.z + threadIdx.z; elem < num_elem; elem += gridDim.x*blockDim.z) {"));

    let function_calls = calls(&kernel);
    assert!(function_calls.contains(&"ReadLVecStandard2d".to_string()));
    assert!(function_calls.contains(&"InterpTensor2d".to_string()));
    assert!(function_calls.contains(&"InterpTransposeTensor2d".to_string()));
    assert!(function_calls.contains(&"WriteLVecStandard2d".to_string()));
    assert!(function_calls.contains(&"ReadLVecStrided2d".to_string()));
}

#[test]
fn bindings_record_device_tables() {
    let memory = Arc::new(Memory::default());
    let operator = mass_operator(&memory, 10, 2, 3, 4);
    let kernel = generate(KernelKind::Apply, &operator, &GenOptions::default()).unwrap();
    let bindings = &kernel.bindings;

    assert_eq!(bindings.b.inputs[0], Some(MatrixSource::Resident(DevicePtr(0x100))));
    assert_eq!(bindings.b.inputs[1], None);
    assert_eq!(bindings.b.outputs[0], Some(MatrixSource::Resident(DevicePtr(0x100))));
    assert_eq!(bindings.g.inputs, vec![None, None]);
    assert_eq!(bindings.indices.inputs[0], Some(DevicePtr(0x700)));
    // Strided restrictions need no offsets
    assert_eq!(bindings.indices.inputs[1], None);
    assert_eq!(bindings.indices.outputs[0], Some(DevicePtr(0x700)));
    assert_eq!(bindings.w, None);
    assert_eq!(bindings.points_indices, None);
}

#[test]
fn hip_target_changes_names_and_headers() {
    let memory = Arc::new(Memory::default());
    let options = GenOptions {
        target: Target::Hip,
        jit_source_root: "/opt/ceed/include".to_string(),
        ..GenOptions::default()
    };
    let kernel = generate(KernelKind::Apply, &mass_operator(&memory, 10, 2, 3, 4), &options).unwrap();
    let code = &kernel.source.code;

    assert_eq!(kernel.source.entry_point, "CeedKernelHipGenOperator_mass");
    assert!(code.contains("Fields_Hip fields"));
    assert!(code.contains("FieldsInt_Hip indices"));
    assert!(code.contains("#include </opt/ceed/include/hip/hip-gen-templates.h>"));
    assert!(!code.contains("Cuda"));
}

#[test]
fn fields_sharing_a_basis_load_its_matrices_once() {
    let memory = Arc::new(Memory::default());
    let operator = mass_operator(&memory, 10, 2, 3, 4);
    let reuse = matrix_reuse(&operator);
    assert_eq!(reuse.get(Side::Input, 0), None);
    assert_eq!(reuse.get(Side::Output, 0).map(|reuse| (reuse.side, reuse.index)), Some((Side::Input, 0)));

    let kernel = generate(KernelKind::Apply, &operator, &GenOptions::default()).unwrap();
    assert_eq!(count_calls(&kernel, "LoadMatrix"), 1);
    assert!(kernel.source.code.contains("CeedScalar *s_B_out_0 = s_B_in_0;"));

    // A third field with its own basis loads its own matrix
    let other = Arc::new(tensor_basis(2, 3, 4).with_tables(DevicePtr(0xA00), DevicePtr(0xB00), DevicePtr(0xC00)));
    let operator = operator.with_input(
        OperatorField::new("f", EvalMode::Interp)
            .with_basis(other)
            .with_restriction(standard_restriction(10, 9, 1))
            .with_vector(FieldVector::Active),
    );
    assert_eq!(matrix_reuse(&operator).num_owned(), 3);
    let kernel = generate(KernelKind::Apply, &operator, &GenOptions::default()).unwrap();
    assert_eq!(count_calls(&kernel, "LoadMatrix"), 2);
    assert_eq!(
        kernel.bindings.b.inputs[2],
        Some(MatrixSource::Resident(DevicePtr(0xA00)))
    );
}

#[test]
fn gradient_matrices_are_only_shared_between_gradient_fields() {
    let basis = Arc::new(tensor_basis(2, 3, 4));
    let restriction = standard_restriction(10, 9, 1);
    let operator = Operator::new(QFunction::new("advection", "qfunctions/advection.h"), 10, 16)
        .with_input(
            OperatorField::new("u", EvalMode::Interp)
                .with_basis(Arc::clone(&basis))
                .with_restriction(Arc::clone(&restriction))
                .with_vector(FieldVector::Active),
        )
        .with_output(
            OperatorField::new("dv", EvalMode::Grad)
                .with_basis(basis)
                .with_restriction(restriction)
                .with_vector(FieldVector::Active),
        );

    let kernel = generate(KernelKind::Apply, &operator, &GenOptions::default()).unwrap();
    let code = &kernel.source.code;
    assert!(code.contains("CeedScalar *s_B_out_0 = s_B_in_0;"));
    assert!(code.contains("__shared__ CeedScalar s_G_out_0[P_1d_out_0*Q_1d];"));
    assert_eq!(count_calls(&kernel, "LoadMatrix"), 2);
}

#[test]
fn inputs_sharing_a_restriction_share_the_element_buffer() {
    let basis = Arc::new(tensor_basis(2, 3, 4));
    let restriction = standard_restriction(10, 9, 1);
    let operator = Operator::new(QFunction::new("both", "qfunctions/both.h"), 10, 16)
        .with_input(
            OperatorField::new("u", EvalMode::Interp)
                .with_basis(Arc::clone(&basis))
                .with_restriction(Arc::clone(&restriction))
                .with_vector(FieldVector::Active),
        )
        .with_input(OperatorField::new("weight", EvalMode::Weight).with_basis(Arc::clone(&basis)))
        .with_input(
            OperatorField::new("du", EvalMode::Grad)
                .with_basis(Arc::clone(&basis))
                .with_restriction(Arc::clone(&restriction))
                .with_vector(FieldVector::Active),
        )
        .with_output(
            OperatorField::new("v", EvalMode::Interp)
                .with_basis(basis)
                .with_restriction(restriction)
                .with_vector(FieldVector::Active),
        );

    let order = input_order(&operator);
    assert_eq!(order.order, vec![0, 2, 1]);
    assert_eq!(order.buffer_owner, vec![0, 1, 0]);

    let kernel = generate(KernelKind::Apply, &operator, &GenOptions::default()).unwrap();
    assert!(kernel.source.code.contains("CeedScalar *r_e_in_2 = r_e_in_0;"));
    assert_eq!(count_calls(&kernel, "ReadLVecStandard2d"), 1);
    assert_eq!(count_calls(&kernel, "WeightTensor2d"), 1);
    assert_eq!(kernel.bindings.w, Some(DevicePtr(0x300)));
}

#[test]
fn collocated_3d_operator_processes_slices() {
    let kernel = generate(
        KernelKind::Apply,
        &diffusion_operator(10, 3, 3, 4, true),
        &GenOptions::default(),
    )
    .unwrap();
    let code = &kernel.source.code;

    assert!(code.contains("Note: Using planes of 3D elements"));
    assert!(code.contains("for (CeedInt q = 0; q < Q_1d; q++) {"));
    assert!(code.contains("#define CEED_Q_VLA 1"));
    assert_eq!(count_calls(&kernel, "GradColloSlice3d"), 1);
    assert_eq!(count_calls(&kernel, "GradColloSliceTranspose3d"), 1);
    assert_eq!(count_calls(&kernel, "ReadEVecSliceStrided3d"), 1);
    assert_eq!(kernel.bindings.g.inputs[0], Some(DevicePtr(0x800)));
}

#[test]
fn non_collocated_3d_operator_processes_columns() {
    let kernel = generate(
        KernelKind::Apply,
        &diffusion_operator(10, 3, 3, 4, false),
        &GenOptions::default(),
    )
    .unwrap();
    let code = &kernel.source.code;

    assert!(!code.contains("Note: Using planes of 3D elements"));
    assert!(code.contains("#define CEED_Q_VLA 4"));
    assert!(code.contains("diffusion(ctx, Q_1d, inputs, outputs);"));
    assert_eq!(count_calls(&kernel, "GradTensorCollocated3d"), 1);
    assert_eq!(kernel.bindings.g.inputs[0], Some(DevicePtr(0x200)));
    assert_eq!(kernel.block, [4, 4, 4]);
}

#[test]
fn at_points_kernel_loops_over_points() {
    let memory = Arc::new(Memory::default());
    let operator = mass_at_points(&memory, vec![3, 7, 5]);
    let kernel = generate(KernelKind::Apply, &operator, &GenOptions::default()).unwrap();
    let code = &kernel.source.code;

    assert!(code.contains("shared-basis-tensor-at-points-templates.h"));
    assert!(code.contains("const CeedInt max_num_points = 7;"));
    assert!(code.contains("Note: Using batches of points"));
    assert!(code.contains("point_loop_bound"));
    assert_eq!(count_calls(&kernel, "ReadPoint"), 1);
    assert_eq!(count_calls(&kernel, "InterpAtPoints2d"), 1);
    assert_eq!(count_calls(&kernel, "InterpTransposeAtPoints2d"), 1);
    assert!(!code.contains("CeedScalar s_G"));

    let basis = operator.inputs[0].basis.clone().unwrap();
    assert_eq!(kernel.bindings.b.inputs[0], Some(MatrixSource::ChebyshevInterp(basis)));
    assert_eq!(kernel.bindings.points_indices, Some(DevicePtr(0x900)));
}

#[test]
fn nontensor_operator_uses_flat_thread_layout() {
    let num_elem = 10;
    let basis = Arc::new(nontensor_basis(2, 6, 7));
    let restriction = standard_restriction(num_elem, 6, 1);
    let operator = Operator::new(QFunction::new("mass", "qfunctions/mass.h"), num_elem, 7)
        .with_input(
            OperatorField::new("u", EvalMode::Interp)
                .with_basis(Arc::clone(&basis))
                .with_restriction(Arc::clone(&restriction))
                .with_vector(FieldVector::Active),
        )
        .with_output(
            OperatorField::new("v", EvalMode::Interp)
                .with_basis(basis)
                .with_restriction(restriction)
                .with_vector(FieldVector::Active),
        );

    let kernel = generate(KernelKind::Apply, &operator, &GenOptions::default()).unwrap();
    assert_eq!(kernel.thread_1d, 7);
    assert_eq!(kernel.block, [7, 1, 36]);
    assert!(kernel.source.code.contains("shared-basis-nontensor-templates.h"));
    assert_eq!(count_calls(&kernel, "InterpNonTensor"), 1);
    assert_eq!(count_calls(&kernel, "InterpTransposeNonTensor"), 1);
    assert_eq!(count_calls(&kernel, "ReadLVecStandard1d"), 1);
}

#[test]
fn qfunction_assembly_kernel() {
    let memory = Arc::new(Memory::default());
    let operator = mass_operator(&memory, 10, 2, 3, 4);
    let kernel = generate(KernelKind::QFunctionAssembly, &operator, &GenOptions::default()).unwrap();
    let code = &kernel.source.code;

    assert_eq!(kernel.source.entry_point, "CeedKernelCudaGenQFunctionAssembly_mass");
    assert!(code.contains("// Operator Assembly Kernel"));
    assert!(!code.contains("__launch_bounds__"));
    assert!(code.contains("CeedScalar *__restrict__ values_array"));
    assert!(code.contains("const CeedInt total_size_out = 1;"));
    assert_eq!(count_calls(&kernel, "WriteLVecStandard2d_QFAssembly"), 1);
    // Active fields are not restricted
    assert_eq!(count_calls(&kernel, "ReadLVecStandard2d"), 0);
}

#[test]
fn qfunction_assembly_requires_active_fields() {
    let memory = Arc::new(Memory::default());
    let mut operator = mass_operator(&memory, 10, 2, 3, 4);
    operator.outputs[0].vector = FieldVector::None;
    let err = generate(KernelKind::QFunctionAssembly, &operator, &GenOptions::default()).unwrap_err();
    assert_eq!(err.downcast_ref::<GenError>(), Some(&GenError::NoActiveFields));
}

#[test]
fn assembly_kinds_depend_on_points() {
    let memory = Arc::new(Memory::default());
    let options = GenOptions::default();

    let at_points = mass_at_points(&memory, vec![2, 4]);
    let err = generate(KernelKind::QFunctionAssembly, &at_points, &options).unwrap_err();
    assert!(matches!(err.downcast_ref::<GenError>(), Some(GenError::Unsupported(_))));

    let operator = mass_operator(&memory, 10, 2, 3, 4);
    assert!(generate(KernelKind::DiagonalAssembly, &operator, &options).is_err());
    assert!(generate(KernelKind::FullAssembly, &operator, &options).is_err());
}

#[test]
fn at_points_assembly_kernels() {
    let memory = Arc::new(Memory::default());
    let operator = mass_at_points(&memory, vec![2, 4]);
    let options = GenOptions::default();

    let diagonal = generate(KernelKind::DiagonalAssembly, &operator, &options).unwrap();
    assert_eq!(diagonal.source.entry_point, "CeedKernelCudaGenOperatorDiagonalAssembly_mass_points");
    assert!(diagonal.source.code.contains("Loop over nodes in active field"));
    assert_eq!(count_calls(&diagonal, "SetEVecStandard2d_Single"), 2);
    assert_eq!(count_calls(&diagonal, "WriteLVecStandard2d_Single"), 1);
    assert_eq!(diagonal.bindings.indices.outputs[0], Some(DevicePtr(0x700)));

    let full = generate(KernelKind::FullAssembly, &operator, &options).unwrap();
    assert_eq!(full.source.entry_point, "CeedKernelCudaGenOperatorFullAssembly_mass_points");
    assert_eq!(count_calls(&full, "WriteLVecStandard2d_Assembly"), 1);
    assert_eq!(count_calls(&full, "WriteLVecStandard2d_Single"), 0);
}

#[test]
fn unimplemented_eval_modes_are_unsupported() {
    let memory = Arc::new(Memory::default());
    let mut operator = mass_operator(&memory, 10, 2, 3, 4);
    operator.outputs[0].eval_mode = EvalMode::Curl;
    let err = generate(KernelKind::Apply, &operator, &GenOptions::default()).unwrap_err();
    assert!(matches!(err.downcast_ref::<GenError>(), Some(GenError::Unsupported(_))));
}

#[test]
fn rendered_source_matches_syntax() {
    let memory = Arc::new(Memory::default());
    let kernel = generate(KernelKind::Apply, &mass_operator(&memory, 10, 2, 3, 4), &GenOptions::default()).unwrap();
    assert_eq!(kernel.syntax.render(), kernel.source.code);
    assert_eq!(kernel.syntax.to_string(), kernel.source.code);
}
