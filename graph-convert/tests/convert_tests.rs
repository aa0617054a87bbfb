mod fixture;

use fixture::{asl_classifier, file_names, graph_weight_count, write_model};
use graph_convert::{
    CleanupStatus, ConversionError, ConvertOptions, Converter, GraphConversionError, Quantization,
};
use model_io::{KerasModel, Layer, Shape};
use serde_json::Value;
use tempfile::TempDir;

fn read_model_json(dir: &std::path::Path) -> Value {
    let bytes = std::fs::read(dir.join("model.json")).unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn shard_bytes(dir: &std::path::Path) -> u64 {
    file_names(dir)
        .iter()
        .filter(|n| n.ends_with(".bin"))
        .map(|n| std::fs::metadata(dir.join(n)).unwrap().len())
        .sum()
}

#[test]
fn test_convert_writes_graph_model_and_cleans_up() {
    let root = TempDir::new().unwrap();
    let model_path = write_model(root.path(), &asl_classifier());
    let output = root.path().join("asl_model_output").join("tfjs_graph_model");

    let mut console = Vec::new();
    let report = Converter::new(&model_path, &output).run(&mut console).unwrap();

    assert_eq!(file_names(&output), ["group1-shard1of1.bin", "model.json"]);
    assert_eq!(report.files.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(), ["group1-shard1of1.bin", "model.json"]);
    assert_eq!(report.cleanup, CleanupStatus::Removed);
    assert!(!report.intermediate_dir.exists());
    assert_eq!(report.intermediate_dir, root.path().join("asl_model_output").join("saved_model_temp"));
    assert_eq!(report.input_shape.to_string(), "(None, 63)");
    assert_eq!(report.output_shape.as_ref().unwrap().to_string(), "(None, 26)");
    assert_eq!(shard_bytes(&output), (graph_weight_count() * 4) as u64);

    let console = String::from_utf8(console).unwrap();
    assert!(console.contains("Input shape: (None, 63)"));
    assert!(console.contains("Output shape: (None, 26)"));
    assert!(console.contains("dense_1 (Dense)"));
    assert!(console.contains("Conversion successful"));
}

#[test]
fn test_model_json_describes_graph() {
    let root = TempDir::new().unwrap();
    let model_path = write_model(root.path(), &asl_classifier());
    let output = root.path().join("out");
    Converter::new(&model_path, &output).run(&mut std::io::sink()).unwrap();

    let json = read_model_json(&output);
    assert_eq!(json["format"], "graph-model");
    assert_eq!(json["generatedBy"], "keras 3.6.0");
    assert!(json["signature"]["inputs"]["input_layer:0"].is_object());
    let out_dims = &json["signature"]["outputs"]["Identity:0"]["tensorShape"]["dim"];
    assert_eq!(out_dims[1]["size"], "26");

    let nodes = json["modelTopology"]["node"].as_array().unwrap();
    let ops: Vec<&str> = nodes.iter().map(|n| n["op"].as_str().unwrap()).collect();
    assert_eq!(ops.first(), Some(&"Placeholder"));
    assert_eq!(ops.last(), Some(&"Identity"));
    assert!(!ops.contains(&"Dropout"));
    assert!(ops.contains(&"Softmax"));

    let manifest = json["weightsManifest"].as_array().unwrap();
    assert_eq!(manifest.len(), 1);
    assert_eq!(manifest[0]["paths"][0], "group1-shard1of1.bin");
    let const_names: Vec<&str> = nodes
        .iter()
        .filter(|n| n["op"] == "Const")
        .map(|n| n["name"].as_str().unwrap())
        .collect();
    let weight_names: Vec<&str> = manifest[0]["weights"]
        .as_array()
        .unwrap()
        .iter()
        .map(|w| w["name"].as_str().unwrap())
        .collect();
    assert_eq!(const_names, weight_names);
}

#[test]
fn test_missing_model_creates_nothing() {
    let root = TempDir::new().unwrap();
    let output = root.path().join("asl_model_output").join("tfjs_graph_model");
    let converter = Converter::new(root.path().join("missing.keras"), &output);

    let err = converter.run(&mut std::io::sink()).unwrap_err();
    assert!(matches!(err, ConversionError::ModelNotFound(_)));
    assert!(err.to_string().contains("not found"));
    assert!(file_names(root.path()).is_empty());
}

#[test]
fn test_malformed_model_is_load_error() {
    let root = TempDir::new().unwrap();
    let model_path = root.path().join("best_model.keras");
    std::fs::write(&model_path, b"not a zip").unwrap();
    let output = root.path().join("out");

    let err = Converter::new(&model_path, &output).run(&mut std::io::sink()).unwrap_err();
    assert!(matches!(err, ConversionError::ModelLoad { .. }));
    assert_eq!(file_names(root.path()), ["best_model.keras"]);
}

#[test]
fn test_unsupported_layer_leaves_no_artifact() {
    let root = TempDir::new().unwrap();
    let mut model = KerasModel::sequential("sequential", Shape::batched(&[63]));
    let lstm = Layer::custom("LSTM", serde_json::json!({"name": "lstm", "units": 8}), Vec::new()).unwrap();
    model.add(lstm).unwrap();
    let model_path = write_model(root.path(), &model);
    let output = root.path().join("asl_model_output").join("tfjs_graph_model");
    let converter = Converter::new(&model_path, &output);

    let err = converter.run(&mut std::io::sink()).unwrap_err();
    match err {
        ConversionError::GraphConversion { source: GraphConversionError::UnsupportedLayer { layer, .. }, .. } => {
            assert_eq!(layer, "lstm");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!output.join("model.json").exists());
    // cleanup never ran
    assert!(converter.intermediate_dir().exists());
}

#[test]
fn test_small_shard_size_splits_weights() {
    let root = TempDir::new().unwrap();
    let model_path = write_model(root.path(), &asl_classifier());
    let output = root.path().join("out");
    let options = ConvertOptions { shard_size_bytes: 16 * 1024, ..ConvertOptions::default() };
    Converter::new(&model_path, &output)
        .with_options(options)
        .run(&mut std::io::sink())
        .unwrap();

    let total = (graph_weight_count() * 4) as u64;
    let expected_shards = total.div_ceil(16 * 1024) as usize;
    let shards: Vec<String> = file_names(&output).into_iter().filter(|n| n.ends_with(".bin")).collect();
    assert_eq!(shards.len(), expected_shards);
    assert_eq!(shards[0], format!("group1-shard1of{expected_shards}.bin"));
    assert_eq!(shard_bytes(&output), total);
    let json = read_model_json(&output);
    assert_eq!(json["weightsManifest"][0]["paths"].as_array().unwrap().len(), expected_shards);
}

#[test]
fn test_rerun_replaces_stale_shards() {
    let root = TempDir::new().unwrap();
    let model_path = write_model(root.path(), &asl_classifier());
    let output = root.path().join("out");
    let small = ConvertOptions { shard_size_bytes: 8 * 1024, ..ConvertOptions::default() };
    Converter::new(&model_path, &output).with_options(small).run(&mut std::io::sink()).unwrap();
    std::fs::write(output.join("README.txt"), b"keep me").unwrap();

    Converter::new(&model_path, &output).run(&mut std::io::sink()).unwrap();
    assert_eq!(file_names(&output), ["README.txt", "group1-shard1of1.bin", "model.json"]);
}

#[test]
fn test_two_runs_are_equivalent() {
    let root = TempDir::new().unwrap();
    let model_path = write_model(root.path(), &asl_classifier());
    let first = root.path().join("first");
    let second = root.path().join("second");
    Converter::new(&model_path, &first).run(&mut std::io::sink()).unwrap();
    Converter::new(&model_path, &second).run(&mut std::io::sink()).unwrap();

    assert_eq!(file_names(&first), file_names(&second));
    let a = read_model_json(&first);
    let b = read_model_json(&second);
    assert_eq!(a["weightsManifest"], b["weightsManifest"]);
    assert_eq!(a["modelTopology"], b["modelTopology"]);
}

#[test]
fn test_stale_intermediate_is_replaced() {
    let root = TempDir::new().unwrap();
    let model_path = write_model(root.path(), &asl_classifier());
    let output = root.path().join("asl_model_output").join("tfjs_graph_model");
    let converter = Converter::new(&model_path, &output);
    std::fs::create_dir_all(converter.intermediate_dir().join("variables")).unwrap();
    std::fs::write(converter.intermediate_dir().join("leftover"), b"x").unwrap();

    let report = converter.run(&mut std::io::sink()).unwrap();
    assert_eq!(report.cleanup, CleanupStatus::Removed);
    assert!(!converter.intermediate_dir().exists());
}

#[test]
fn test_keep_intermediate_and_quantize() {
    let root = TempDir::new().unwrap();
    let model_path = write_model(root.path(), &asl_classifier());
    let output = root.path().join("out");
    let options = ConvertOptions {
        quantization: Quantization::Uint8,
        keep_intermediate: true,
        ..ConvertOptions::default()
    };
    let report = Converter::new(&model_path, &output).with_options(options).run(&mut std::io::sink()).unwrap();

    assert_eq!(report.cleanup, CleanupStatus::Kept);
    assert!(report.intermediate_dir.join("saved_model.json").exists());
    assert_eq!(shard_bytes(&output), graph_weight_count() as u64);
    let json = read_model_json(&output);
    assert_eq!(json["weightsManifest"][0]["weights"][0]["quantization"]["dtype"], "uint8");
}

#[test]
fn test_blocked_intermediate_is_export_error() {
    let root = TempDir::new().unwrap();
    let model_path = write_model(root.path(), &asl_classifier());
    let output = root.path().join("asl_model_output").join("tfjs_graph_model");
    let converter = Converter::new(&model_path, &output);
    // a plain file where the intermediate directory goes
    std::fs::write(converter.intermediate_dir(), b"in the way").unwrap();

    let err = converter.run(&mut std::io::sink()).unwrap_err();
    match err {
        ConversionError::Export { path, .. } => assert_eq!(path, converter.intermediate_dir()),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!output.exists());
}

#[test]
fn test_failed_model_json_write_removes_shards() {
    let root = TempDir::new().unwrap();
    let model_path = write_model(root.path(), &asl_classifier());
    let output = root.path().join("out");
    // model.json is written last; a directory in its place makes that write fail
    std::fs::create_dir_all(output.join("model.json")).unwrap();
    let options = ConvertOptions { shard_size_bytes: 16 * 1024, ..ConvertOptions::default() };

    let err = Converter::new(&model_path, &output)
        .with_options(options)
        .run(&mut std::io::sink())
        .unwrap_err();
    match err {
        ConversionError::GraphConversion { source: GraphConversionError::Io { path, .. }, .. } => {
            assert_eq!(path, output.join("model.json"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(file_names(&output), ["model.json"]);
    assert!(output.join("model.json").is_dir());
}
