use model_io::{
    load_keras, save_keras, save_keras_as, KerasModel, Layer, LayerKind, LoadError, Shape, WeightFormat,
};
use ndarray::{Array1, Array2, ArrayD};
use rand::Rng;
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;

fn random_matrix(rows: usize, cols: usize) -> Array2<f32> {
    let mut rng = rand::thread_rng();
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-0.1..0.1))
}

fn asl_classifier() -> KerasModel {
    let mut model = KerasModel::sequential("sequential", Shape::batched(&[63]));
    model
        .add(Layer::dense("dense", "relu", random_matrix(63, 128), Some(Array1::zeros(128))))
        .unwrap();
    model.add(Layer::dropout("dropout", 0.3)).unwrap();
    model
        .add(Layer::dense("dense_1", "softmax", random_matrix(128, 26), Some(Array1::zeros(26))))
        .unwrap();
    model.keras_version = Some("3.6.0".into());
    model
}

#[test]
fn test_save_and_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("best_model.keras");
    let model = asl_classifier();
    save_keras(&model, &path).unwrap();

    let loaded = load_keras(&path).unwrap();
    assert_eq!(loaded.name, "sequential");
    assert_eq!(loaded.keras_version.as_deref(), Some("3.6.0"));
    assert_eq!(loaded.input_shape().to_string(), "(None, 63)");
    assert_eq!(loaded.output_shape().map(|s| s.to_string()).as_deref(), Some("(None, 26)"));
    assert_eq!(loaded.total_params(), model.total_params());
    assert_eq!(loaded.layers()[1].variables[0], model.layers()[1].variables[0]);
}

#[test]
fn test_functional_model_loads_as_chain() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("functional.keras");
    save_keras(&asl_classifier().into_functional(), &path).unwrap();

    let loaded = load_keras(&path).unwrap();
    let kinds: Vec<&str> = loaded.layers().iter().map(|l| l.class_name.as_str()).collect();
    assert_eq!(kinds, ["InputLayer", "Dense", "Dropout", "Dense"]);
}

#[test]
fn test_unsupported_layer_still_loads() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("custom.keras");
    let mut model = asl_classifier();
    let custom = Layer::custom(
        "GaussianNoise",
        serde_json::json!({"name": "noise", "stddev": 0.1}),
        Vec::new(),
    )
    .unwrap();
    model.add(custom).unwrap();
    save_keras(&model, &path).unwrap();

    let loaded = load_keras(&path).unwrap();
    assert_eq!(loaded.layers().last().unwrap().kind, LayerKind::Unsupported);
    assert!(loaded.output_shape().is_none());
    assert!(loaded.summary().to_string().contains("noise (GaussianNoise)"));
}

#[test]
fn test_missing_file_is_io_error() {
    let err = load_keras(std::path::Path::new("/nonexistent/best_model.keras")).unwrap_err();
    assert!(matches!(err, LoadError::Io(_)));
}

fn random_array(shape: &[usize]) -> ArrayD<f32> {
    let mut rng = rand::thread_rng();
    ArrayD::from_shape_fn(shape.to_vec(), |_| rng.gen_range(0.5..1.5))
}

/// HDF5 weight store laid out the way Keras writes it: per-layer groups
/// under `root`, plus the model-level and optimizer groups Keras adds.
fn keras_weight_store(root: &str, groups: &[(&str, &[ArrayD<f32>])]) -> Vec<u8> {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("model.weights.h5");
    {
        let file = hdf5::File::create(&path).unwrap();
        file.create_group("vars").unwrap();
        file.create_group("optimizer").unwrap().create_group("vars").unwrap();
        let layers = file.create_group(root).unwrap();
        for (group, variables) in groups {
            let vars = layers.create_group(group).unwrap().create_group("vars").unwrap();
            for (index, variable) in variables.iter().enumerate() {
                let values: Vec<f32> = variable.iter().copied().collect();
                vars.new_dataset::<f32>()
                    .shape(variable.shape().to_vec())
                    .create(index.to_string().as_str())
                    .unwrap()
                    .write_raw(values.as_slice())
                    .unwrap();
            }
        }
    }
    std::fs::read(&path).unwrap()
}

fn write_archive(path: &Path, config: &str, weights: &[u8]) {
    let mut zip = zip::ZipWriter::new(std::fs::File::create(path).unwrap());
    let options = zip::write::SimpleFileOptions::default();
    zip.start_file("metadata.json", options).unwrap();
    zip.write_all(br#"{"keras_version": "3.6.0", "date_saved": "2024-10-01@12:00:00"}"#).unwrap();
    zip.start_file("config.json", options).unwrap();
    zip.write_all(config.as_bytes()).unwrap();
    zip.start_file("model.weights.h5", options).unwrap();
    zip.write_all(weights).unwrap();
    zip.finish().unwrap();
}

#[test]
fn test_keras3_archive_with_hdf5_weights() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("best_model.keras");
    let hidden = [random_array(&[6, 4]), random_array(&[4])];
    let norm = [random_array(&[4]), random_array(&[4]), random_array(&[4]), random_array(&[4])];
    let letters = [random_array(&[4, 3]), random_array(&[3])];
    // groups follow the layer class, not the layer name
    let weights = keras_weight_store(
        "layers",
        &[("dense", &hidden), ("batch_normalization", &norm), ("dropout", &[]), ("dense_1", &letters)],
    );
    write_archive(&path, include_str!("data/keras3_sequential.json"), &weights);

    let model = load_keras(&path).unwrap();
    let names: Vec<&str> = model.layers().iter().map(|l| l.name.as_str()).collect();
    assert_eq!(names, ["input_layer", "hidden", "norm", "drop", "letters"]);
    assert_eq!(model.keras_version.as_deref(), Some("3.6.0"));
    assert_eq!(model.input_shape().to_string(), "(None, 6)");
    assert_eq!(model.output_shape().map(|s| s.to_string()).as_deref(), Some("(None, 3)"));
    assert_eq!(model.layers()[1].variables, hidden);
    assert_eq!(model.layers()[2].variables, norm);
    assert_eq!(model.layers()[4].variables, letters);
    assert_eq!(model.total_params(), 6 * 4 + 4 + 4 * 4 + 4 * 3 + 3);
    assert_eq!(model.non_trainable_params(), 8);
}

#[test]
fn test_tf_keras_archive_with_hdf5_weights() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("legacy.keras");
    let config = serde_json::json!({
        "class_name": "Sequential",
        "config": {
            "name": "sequential",
            "layers": [
                {"class_name": "InputLayer",
                 "config": {"batch_input_shape": [null, 5], "dtype": "float32", "name": "dense_input"}},
                {"class_name": "Dense",
                 "config": {"name": "dense", "units": 2, "activation": "relu", "use_bias": true}},
                {"class_name": "BatchNormalization",
                 "config": {"name": "batch_normalization", "axis": [1], "epsilon": 0.001,
                            "center": true, "scale": true}}
            ]
        }
    });
    let dense = [random_array(&[5, 2]), random_array(&[2])];
    let norm = [random_array(&[2]), random_array(&[2]), random_array(&[2]), random_array(&[2])];
    let weights = keras_weight_store(
        "_layer_checkpoint_dependencies",
        &[("input_layer", &[]), ("dense", &dense), ("batch_normalization", &norm)],
    );
    write_archive(&path, &config.to_string(), &weights);

    let model = load_keras(&path).unwrap();
    assert_eq!(model.layers()[1].variables, dense);
    assert!(matches!(model.layers()[2].kind, LayerKind::BatchNormalization { axis: 1, .. }));
    assert_eq!(model.output_shape(), Some(&Shape::batched(&[2])));
}

#[test]
fn test_hdf5_store_missing_layer_weights() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("best_model.keras");
    let weights = keras_weight_store("layers", &[("dense", &[random_array(&[6, 4])])]);
    write_archive(&path, include_str!("data/keras3_sequential.json"), &weights);

    let err = load_keras(&path).unwrap_err();
    assert!(matches!(err, LoadError::MissingVariable { ref layer, index: 1 } if layer == "hidden"));
}

#[test]
fn test_safetensors_store_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("best_model.keras");
    let model = asl_classifier();
    save_keras_as(&model, &path, WeightFormat::SafeTensors).unwrap();

    let loaded = load_keras(&path).unwrap();
    assert_eq!(loaded.total_params(), model.total_params());
    assert_eq!(loaded.layers()[3].variables, model.layers()[3].variables);
}
