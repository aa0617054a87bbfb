//! Library crate describing trained Keras models.
//!
//! Covers the `.keras` archive format, the supported layer set, shape
//! inference and the textual model summary used by the converter.

pub mod archive;
pub mod error;
pub mod layer;
pub mod model;

pub use archive::{load_keras, save_keras, save_keras_as, WeightFormat};
pub use error::LoadError;
pub use layer::{Layer, LayerKind, Shape};
pub use model::{format_count, variable_key, Container, KerasModel, ModelSummary, Variables};
