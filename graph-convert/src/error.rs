//! Error types for the conversion pipeline.

use std::path::PathBuf;

use model_io::LoadError;
use thiserror::Error;

/// Failure while writing the intermediate SavedModel directory.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SafeTensors error: {0}")]
    SafeTensors(String),
}

/// Failure while turning the intermediate directory into a graph model.
#[derive(Error, Debug)]
pub enum GraphConversionError {
    #[error("layer `{layer}` of type {class_name} has no graph equivalent")]
    UnsupportedLayer { layer: String, class_name: String },

    #[error("layer `{layer}` uses unsupported activation `{activation}`")]
    UnsupportedActivation { layer: String, activation: String },

    #[error("variable `{0}` is missing from the SavedModel")]
    MissingVariable(String),

    #[error("malformed SavedModel: {0}")]
    Malformed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SafeTensors error: {0}")]
    SafeTensors(String),

    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl GraphConversionError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}

/// Error returned by [`crate::Converter::run`]; one variant per pipeline
/// stage that can fail.
#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("Keras model not found at {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error("failed to load model from {}", path.display())]
    ModelLoad {
        path: PathBuf,
        #[source]
        source: LoadError,
    },

    #[error("failed to export SavedModel to {}", path.display())]
    Export {
        path: PathBuf,
        #[source]
        source: ExportError,
    },

    #[error("failed to convert SavedModel into {}", path.display())]
    GraphConversion {
        path: PathBuf,
        #[source]
        source: GraphConversionError,
    },
}
