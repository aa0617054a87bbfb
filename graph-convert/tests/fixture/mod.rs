#![allow(dead_code)]

use model_io::{save_keras, KerasModel, Layer, Shape};
use ndarray::{Array1, Array2};
use rand::Rng;
use std::path::{Path, PathBuf};

pub const HIDDEN: usize = 128;

fn random_matrix(rows: usize, cols: usize) -> Array2<f32> {
    let mut rng = rand::thread_rng();
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-0.1..0.1))
}

fn random_vector(len: usize, lo: f32, hi: f32) -> Array1<f32> {
    let mut rng = rand::thread_rng();
    Array1::from_shape_fn(len, |_| rng.gen_range(lo..hi))
}

/// Hand-landmark classifier: 63 inputs (21 points x 3 coords), 26 letters.
pub fn asl_classifier() -> KerasModel {
    let mut model = KerasModel::sequential("sequential", Shape::batched(&[63]));
    model
        .add(Layer::dense("dense", "relu", random_matrix(63, HIDDEN), Some(random_vector(HIDDEN, -0.1, 0.1))))
        .unwrap();
    model
        .add(Layer::batch_norm(
            "batch_normalization",
            1e-3,
            random_vector(HIDDEN, 0.5, 1.5),
            random_vector(HIDDEN, -0.1, 0.1),
            random_vector(HIDDEN, -0.1, 0.1),
            random_vector(HIDDEN, 0.5, 1.5),
        ))
        .unwrap();
    model.add(Layer::dropout("dropout", 0.3)).unwrap();
    model
        .add(Layer::dense("dense_1", "softmax", random_matrix(HIDDEN, 26), Some(random_vector(26, -0.1, 0.1))))
        .unwrap();
    model.keras_version = Some("3.6.0".into());
    model
}

/// Number of float weights in the converted graph (batch norm folds four
/// vectors into two).
pub fn graph_weight_count() -> usize {
    63 * HIDDEN + HIDDEN + 2 * HIDDEN + HIDDEN * 26 + 26
}

/// Write `model` to `<root>/asl_model_output/best_model.keras`.
pub fn write_model(root: &Path, model: &KerasModel) -> PathBuf {
    let dir = root.join("asl_model_output");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("best_model.keras");
    save_keras(model, &path).unwrap();
    path
}

pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
