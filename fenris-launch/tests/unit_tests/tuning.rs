use fenris_launch::{fixed_block_shape, LaunchTuning};

#[test]
fn tuning_defaults() {
    let tuning = LaunchTuning::default();
    assert_eq!(tuning.sync_threshold, 128);
    assert_eq!(tuning.nontensor_block_threads, 512);
}

#[test]
fn tuning_deserializes_with_missing_fields() {
    let tuning: LaunchTuning = serde_json::from_str(r#"{ "sync_threshold": 256 }"#).unwrap();
    assert_eq!(tuning.sync_threshold, 256);
    assert_eq!(tuning.nontensor_block_threads, 512);
}

#[test]
fn fixed_block_shape_1d() {
    assert_eq!(fixed_block_shape(1, 2, 3), [3, 1, 64]);
    assert_eq!(fixed_block_shape(1, 4, 4), [4, 1, 64]);
    assert_eq!(fixed_block_shape(1, 5, 8), [8, 1, 32]);
    assert_eq!(fixed_block_shape(1, 300, 300), [300, 1, 1]);
}

#[test]
fn fixed_block_shape_2d() {
    assert_eq!(fixed_block_shape(2, 2, 3), [3, 3, 16]);
    assert_eq!(fixed_block_shape(2, 4, 4), [4, 4, 2]);
}

#[test]
fn fixed_block_shape_3d() {
    assert_eq!(fixed_block_shape(3, 2, 3), [3, 3, 4]);
    assert_eq!(fixed_block_shape(3, 4, 5), [5, 5, 4]);
    assert_eq!(fixed_block_shape(3, 6, 7), [7, 7, 2]);
    assert_eq!(fixed_block_shape(3, 8, 9), [9, 9, 1]);
}
