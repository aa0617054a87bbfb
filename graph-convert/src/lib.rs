//! Converts Keras `.keras` archives into browser-loadable graph models.
//!
//! The pipeline exports the loaded model into an intermediate SavedModel
//! directory, lowers that into inference graph nodes and writes a
//! `model.json` with its weight shards.

pub mod artifact;
pub mod convert;
pub mod error;
pub mod graph;
pub mod lower;
pub mod saved_model;
pub mod weights;

pub use artifact::{list_files, OutputFile, MODEL_JSON};
pub use convert::{
    convert, convert_saved_model, CleanupStatus, ConversionReport, ConvertOptions, Converter,
    DEFAULT_INTERMEDIATE_DIR,
};
pub use error::{ConversionError, ExportError, GraphConversionError};
pub use weights::{Quantization, DEFAULT_SHARD_SIZE_BYTES};
