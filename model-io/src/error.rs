//! Errors raised while reading or writing Keras model archives.

use thiserror::Error;

/// Model archive load/save errors
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported model format: {0}")]
    UnsupportedFormat(String),

    #[error("malformed model config: {0}")]
    Malformed(String),

    #[error("archive is missing `{0}`")]
    MissingEntry(&'static str),

    #[error("SafeTensors error: {0}")]
    SafeTensors(String),

    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    #[error("layer `{layer}` is missing variable {index}")]
    MissingVariable { layer: String, index: usize },

    #[error("layer `{layer}` variable {index}: expected shape {expected:?}, got {actual:?}")]
    VariableShape {
        layer: String,
        index: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

impl LoadError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}
