use fenris_gen::launch::LaunchTuning;
use fenris_gen::options::{GenOptions, ScalarType, Target};

#[test]
fn options_round_trip_through_json() {
    let options = GenOptions {
        target: Target::Hip,
        scalar: ScalarType::Float32,
        tuning: LaunchTuning {
            sync_threshold: 256,
            nontensor_block_threads: 384,
        },
        dynamic_shared_memory_limit: 0x8000,
        jit_source_root: "/usr/local/include/ceed/jit-source".to_string(),
    };
    let json = serde_json::to_string(&options).unwrap();
    let parsed: GenOptions = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, options);
}

#[test]
fn missing_options_take_default_values() {
    let parsed: GenOptions = serde_json::from_str(r#"{ "target": "Hip", "tuning": { "sync_threshold": 64 } }"#).unwrap();
    let defaults = GenOptions::default();
    assert_eq!(parsed.target, Target::Hip);
    assert_eq!(parsed.scalar, defaults.scalar);
    assert_eq!(parsed.tuning.sync_threshold, 64);
    assert_eq!(
        parsed.tuning.nontensor_block_threads,
        defaults.tuning.nontensor_block_threads
    );
    assert_eq!(parsed.jit_source_root, defaults.jit_source_root);
}

#[test]
fn scalar_sizes() {
    assert_eq!(ScalarType::Float32.size_in_bytes(), 4);
    assert_eq!(ScalarType::Float64.size_in_bytes(), 8);
}
