use crate::unit_tests::mock::{mass_operator, scale_add, tensor_basis, MockDevice, MockVector, ScalingReference};
use fenris_gen::codegen::KernelKind;
use fenris_gen::device::DeviceArray;
use fenris_gen::error::GenError;
use fenris_gen::options::GenOptions;
use fenris_gen::{CompositeOperator, GenOperator};
use matrixcompare::assert_matrix_eq;
use nalgebra::DVector;
use std::sync::atomic::Ordering;
use std::sync::Arc;

const NUM_NODES: usize = 4 * 9;

/// A mass operator named `name` scaling its input by `scale`, both in the generated kernel and in
/// the reference operator.
fn scaling_operator(
    device: &Arc<MockDevice>,
    name: &str,
    num_elem: usize,
    scale: f64,
) -> (Arc<GenOperator<MockDevice>>, Arc<ScalingReference>) {
    let mut operator = mass_operator(&device.memory, num_elem, 2, 3, 4);
    operator.qfunction.name = name.to_string();
    device.register_kernel(format!("CeedKernelCudaGenOperator_{name}"), move |memory, args, _config| {
        scale_add(memory, scale, args.fields.inputs[0], args.fields.outputs[0])
    });
    let reference = ScalingReference::new(&device.memory, scale);
    let gen = GenOperator::new(
        Arc::clone(device),
        Arc::new(operator),
        reference.clone(),
        GenOptions::default(),
    );
    (Arc::new(gen), reference)
}

fn input_values() -> Vec<f64> {
    (0..NUM_NODES).map(|i| 1.0 + i as f64 / 8.0).collect()
}

#[test]
fn concurrent_apply_matches_sequential_apply() {
    let device = MockDevice::new();
    let scales = [1.0, 2.0, 0.5, -3.0];
    let operators: Vec<_> = scales
        .iter()
        .enumerate()
        .map(|(i, &scale)| scaling_operator(&device, &format!("mass_{i}"), 4, scale).0)
        .collect();
    let composite = CompositeOperator::new(Arc::clone(&device), operators.clone());
    assert_eq!(composite.operators().len(), 4);

    let input = MockVector::from_slice(&device.memory, &input_values());
    let concurrent = MockVector::zeros(&device.memory, NUM_NODES);
    let sequential = MockVector::zeros(&device.memory, NUM_NODES);
    let input_array: &dyn DeviceArray = input.as_ref();

    composite.apply_add(Some(input_array), concurrent.as_ref()).unwrap();
    for operator in &operators {
        operator.apply_add(Some(input_array), sequential.as_ref()).unwrap();
    }

    assert_matrix_eq!(
        DVector::from_vec(concurrent.to_vec()),
        DVector::from_vec(sequential.to_vec()),
        comp = abs,
        tol = 1e-12
    );
    let launches = device.launches();
    assert_eq!(launches.iter().filter(|launch| launch.on_stream).count(), 4);
    assert_eq!(launches.iter().filter(|launch| !launch.on_stream).count(), 4);
    assert_eq!(device.streams_created.load(Ordering::SeqCst), 4);
    assert_eq!(device.streams_destroyed.load(Ordering::SeqCst), 4);
    assert_eq!(input.outstanding(), 0);
    assert_eq!(concurrent.outstanding(), 0);
}

#[test]
fn failing_sub_operator_falls_back_alone() {
    let device = MockDevice::new();
    let (good, good_reference) = scaling_operator(&device, "good", 4, 2.0);
    let (bad, bad_reference) = scaling_operator(&device, "bad", 4, 3.0);
    device.fail_launches_of("CeedKernelCudaGenOperator_bad");
    let composite = CompositeOperator::new(Arc::clone(&device), vec![Arc::clone(&good), Arc::clone(&bad)]);

    let input = MockVector::from_slice(&device.memory, &input_values());
    let output = MockVector::zeros(&device.memory, NUM_NODES);
    composite
        .apply_add(Some(input.as_ref() as &dyn DeviceArray), output.as_ref())
        .unwrap();

    assert_eq!(good_reference.num_applies(), 0);
    assert_eq!(bad_reference.num_applies(), 1);
    assert!(!good.uses_fallback(KernelKind::Apply));
    assert!(bad.uses_fallback(KernelKind::Apply));

    let expected: Vec<f64> = input_values().iter().map(|x| 5.0 * x).collect();
    assert_matrix_eq!(
        DVector::from_vec(output.to_vec()),
        DVector::from_vec(expected),
        comp = abs,
        tol = 1e-12
    );
    assert_eq!(input.outstanding(), 0);
    assert_eq!(output.outstanding(), 0);
    assert_eq!(
        device.streams_created.load(Ordering::SeqCst),
        device.streams_destroyed.load(Ordering::SeqCst)
    );
}

#[test]
fn empty_sub_operators_get_no_stream() {
    let device = MockDevice::new();
    let (full, _) = scaling_operator(&device, "full", 4, 1.0);
    let (empty, empty_reference) = scaling_operator(&device, "empty", 0, 1.0);
    let composite = CompositeOperator::new(Arc::clone(&device), vec![full, empty]);

    let input = MockVector::from_slice(&device.memory, &input_values());
    let output = MockVector::zeros(&device.memory, NUM_NODES);
    composite
        .apply_add(Some(input.as_ref() as &dyn DeviceArray), output.as_ref())
        .unwrap();

    assert_eq!(device.streams_created.load(Ordering::SeqCst), 1);
    assert_eq!(device.streams_destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(device.num_launches(), 1);
    assert_eq!(empty_reference.num_applies(), 0);
    assert_eq!(output.to_vec(), input_values());
}

#[test]
fn missing_input_is_rejected_before_launching() {
    let device = MockDevice::new();
    let (operator, reference) = scaling_operator(&device, "mass", 4, 1.0);
    let composite = CompositeOperator::new(Arc::clone(&device), vec![operator]);
    let output = MockVector::zeros(&device.memory, NUM_NODES);

    assert!(composite.apply_add(None, output.as_ref()).is_err());
    assert_eq!(device.streams_created.load(Ordering::SeqCst), 0);
    assert_eq!(reference.num_applies(), 0);
    assert_eq!(output.outstanding(), 0);
}

#[test]
fn misconfigured_sub_operator_leaves_output_untouched() {
    let device = MockDevice::new();
    let (good, good_reference) = scaling_operator(&device, "good", 4, 2.0);
    let mut operator = mass_operator(&device.memory, 4, 2, 3, 4);
    operator.outputs[0].basis = Some(Arc::new(tensor_basis(2, 3, 5)));
    let (bad_reference, bad) = {
        let reference = ScalingReference::new(&device.memory, 3.0);
        let gen = GenOperator::new(Arc::clone(&device), Arc::new(operator), reference.clone(), GenOptions::default());
        (reference, Arc::new(gen))
    };
    let composite = CompositeOperator::new(Arc::clone(&device), vec![good, bad]);

    let input = MockVector::from_slice(&device.memory, &input_values());
    let output = MockVector::from_slice(&device.memory, &vec![1.0; NUM_NODES]);
    for _ in 0..2 {
        let err = composite
            .apply_add(Some(input.as_ref() as &dyn DeviceArray), output.as_ref())
            .unwrap_err();
        assert_eq!(err.downcast_ref::<GenError>(), Some(&GenError::IncompatibleQuadrature));
    }

    assert_eq!(output.to_vec(), vec![1.0; NUM_NODES]);
    assert_eq!(device.num_launches(), 0);
    assert_eq!(device.streams_created.load(Ordering::SeqCst), 0);
    assert_eq!(good_reference.num_applies(), 0);
    assert_eq!(bad_reference.num_applies(), 0);
    assert_eq!(input.outstanding(), 0);
    assert_eq!(output.outstanding(), 0);
}
