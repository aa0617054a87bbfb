//! The conversion pipeline: load, summarize, export, convert, list, clean up.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use model_io::{format_count, load_keras, ModelSummary, Shape};

use crate::artifact::{list_files, write_graph_model, OutputFile};
use crate::error::{ConversionError, ExportError, GraphConversionError};
use crate::lower::lower;
use crate::saved_model::{export, SavedModel};
use crate::weights::{Quantization, DEFAULT_SHARD_SIZE_BYTES};

/// Leaf name of the intermediate SavedModel directory.
pub const DEFAULT_INTERMEDIATE_DIR: &str = "saved_model_temp";

macro_rules! say {
    ($out:expr, $($arg:tt)*) => {{
        let _ = writeln!($out, $($arg)*);
    }};
}

#[derive(Clone, Debug)]
pub struct ConvertOptions {
    /// Upper bound for a single weight shard file.
    pub shard_size_bytes: usize,
    pub quantization: Quantization,
    /// Leaf name of the intermediate directory, created next to the output.
    pub intermediate_name: String,
    /// Skip removal of the intermediate directory.
    pub keep_intermediate: bool,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            shard_size_bytes: DEFAULT_SHARD_SIZE_BYTES,
            quantization: Quantization::None,
            intermediate_name: DEFAULT_INTERMEDIATE_DIR.to_string(),
            keep_intermediate: false,
        }
    }
}

/// Outcome of removing the intermediate directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CleanupStatus {
    Removed,
    Kept,
    /// Removal failed; the directory was left behind.
    Failed { reason: String },
}

#[derive(Debug)]
pub struct ConversionReport {
    pub summary: ModelSummary,
    pub input_shape: Shape,
    pub output_shape: Option<Shape>,
    pub output_dir: PathBuf,
    pub intermediate_dir: PathBuf,
    /// Output directory contents, sorted by name.
    pub files: Vec<OutputFile>,
    pub cleanup: CleanupStatus,
}

/// Convert a SavedModel directory into a graph model inside `output_dir`.
/// Returns the written files.
pub fn convert_saved_model(
    saved_model_dir: &Path,
    output_dir: &Path,
    shard_size_bytes: usize,
    quantization: Quantization,
) -> Result<Vec<PathBuf>, GraphConversionError> {
    let saved = SavedModel::open(saved_model_dir)?;
    let lowered = lower(&saved)?;
    tracing::info!(
        nodes = lowered.graph.nodes.len(),
        weights = lowered.graph.weights.len(),
        "lowered SavedModel to graph"
    );
    write_graph_model(&lowered, &saved.meta, output_dir, shard_size_bytes, quantization)
}

/// Converts one `.keras` file into a browser graph model.
pub struct Converter {
    model_path: PathBuf,
    output_dir: PathBuf,
    options: ConvertOptions,
}

impl Converter {
    pub fn new(model_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            output_dir: output_dir.into(),
            options: ConvertOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ConvertOptions) -> Self {
        self.options = options;
        self
    }

    /// Sibling of the output directory holding the intermediate export.
    pub fn intermediate_dir(&self) -> PathBuf {
        let parent = match self.output_dir.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut leaf = self.options.intermediate_name.clone();
        if self.output_dir.file_name().map_or(false, |name| name == leaf.as_str()) {
            leaf.push_str("_intermediate");
        }
        parent.join(leaf)
    }

    /// Run the whole pipeline, writing progress for humans to `out`.
    pub fn run(&self, out: &mut dyn Write) -> Result<ConversionReport, ConversionError> {
        if !self.model_path.exists() {
            return Err(ConversionError::ModelNotFound(self.model_path.clone()));
        }

        say!(out, "Loading Keras model from: {}", self.model_path.display());
        let model = load_keras(&self.model_path).map_err(|source| ConversionError::ModelLoad {
            path: self.model_path.clone(),
            source,
        })?;
        tracing::info!(model = %model.name, layers = model.layers().len(), "model loaded");

        let summary = model.summary();
        let input_shape = model.input_shape().clone();
        let output_shape = model.output_shape().cloned();
        say!(out, "\nModel Summary:\n{summary}");
        say!(out, "\nInput shape: {input_shape}");
        match &output_shape {
            Some(shape) => say!(out, "Output shape: {shape}"),
            None => say!(out, "Output shape: unknown"),
        }

        let intermediate = self.intermediate_dir();
        say!(out, "\nSaving as SavedModel to: {}", intermediate.display());
        let export_err = |source: ExportError| ConversionError::Export { path: intermediate.clone(), source };
        if intermediate.exists() {
            tracing::warn!(dir = %intermediate.display(), "removing stale intermediate directory");
            fs::remove_dir_all(&intermediate).map_err(|e| export_err(e.into()))?;
        }
        export(&model, &intermediate).map_err(export_err)?;
        tracing::info!(dir = %intermediate.display(), "SavedModel exported");

        say!(out, "\nConverting to graph model: {}", self.output_dir.display());
        let written = convert_saved_model(
            &intermediate,
            &self.output_dir,
            self.options.shard_size_bytes,
            self.options.quantization,
        )
        .map_err(|source| ConversionError::GraphConversion {
            path: self.output_dir.clone(),
            source,
        })?;
        tracing::info!(files = written.len(), "graph model written");

        let files = list_files(&self.output_dir).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "could not list output directory; reporting written files");
            written
                .iter()
                .filter_map(|path| {
                    Some(OutputFile {
                        name: path.file_name()?.to_string_lossy().into_owned(),
                        size: fs::metadata(path).ok()?.len(),
                    })
                })
                .collect()
        });
        say!(out, "\n✅ Conversion successful!");
        say!(out, "Output directory: {}", self.output_dir.display());
        say!(out, "\nFiles created:");
        for file in &files {
            say!(out, "  - {} ({} bytes)", file.name, format_count(file.size));
        }

        let cleanup = if self.options.keep_intermediate {
            say!(out, "\nKept intermediate directory: {}", intermediate.display());
            CleanupStatus::Kept
        } else {
            remove_intermediate(&intermediate, out)
        };

        Ok(ConversionReport {
            summary,
            input_shape,
            output_shape,
            output_dir: self.output_dir.clone(),
            intermediate_dir: intermediate,
            files,
            cleanup,
        })
    }
}

/// Best-effort removal of the intermediate directory. A failure is logged
/// and reported, never returned as an error.
fn remove_intermediate(dir: &Path, out: &mut dyn Write) -> CleanupStatus {
    match fs::remove_dir_all(dir) {
        Ok(()) => {
            say!(out, "\n🗑️  Cleaned up temporary directory: {}", dir.display());
            CleanupStatus::Removed
        }
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to remove intermediate directory");
            say!(out, "\n⚠️  Could not remove temporary directory {}: {e}", dir.display());
            CleanupStatus::Failed { reason: e.to_string() }
        }
    }
}

/// Convert with default options, printing progress to stdout.
pub fn convert(model_path: &Path, output_dir: &Path) -> Result<ConversionReport, ConversionError> {
    Converter::new(model_path, output_dir).run(&mut std::io::stdout())
}
