//! Intermediate SavedModel directory.
//!
//! Layout:
//! - `saved_model.json`: producer, serving signature and one function per
//!   layer in execution order
//! - `variables/variables.safetensors`: every variable, keyed `<layer>/<i>`

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::MmapOptions;
use model_io::archive::{read_variables, write_variables};
use model_io::{KerasModel, Shape, Variables};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ExportError, GraphConversionError};

pub const SAVED_MODEL_FILE: &str = "saved_model.json";
pub const VARIABLES_DIR: &str = "variables";
pub const VARIABLES_FILE: &str = "variables.safetensors";

/// Name, dtype and shape of a signature tensor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub dtype: String,
    /// `None` when the shape could not be inferred.
    pub shape: Option<Vec<Option<usize>>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Signature {
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

/// One layer call in the exported graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub class_name: String,
    pub config: Value,
    /// Upstream function, absent for the input layer.
    pub input: Option<String>,
    pub variables: Vec<VariableSpec>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SavedModelMeta {
    pub producer: String,
    pub model_name: String,
    pub keras_version: Option<String>,
    pub signature: Signature,
    pub functions: Vec<Function>,
}

fn variable_name(layer: &str, index: usize) -> String {
    format!("{layer}/{index}")
}

fn tensor_spec(name: &str, shape: Option<&Shape>) -> TensorSpec {
    TensorSpec {
        name: name.to_string(),
        dtype: "float32".to_string(),
        shape: shape.map(|s| s.dims().to_vec()),
    }
}

/// Export `model` into `dir`, which must not exist yet or be empty.
pub fn export(model: &KerasModel, dir: &Path) -> Result<SavedModelMeta, ExportError> {
    let layers = model.layers();
    let functions = layers
        .iter()
        .enumerate()
        .map(|(i, layer)| Function {
            name: layer.name.clone(),
            class_name: layer.class_name.clone(),
            config: layer.config.clone(),
            input: i.checked_sub(1).map(|p| layers[p].name.clone()),
            variables: layer
                .variables
                .iter()
                .enumerate()
                .map(|(j, v)| VariableSpec {
                    name: variable_name(&layer.name, j),
                    shape: v.shape().to_vec(),
                })
                .collect(),
        })
        .collect();

    let output_name = layers.last().map_or("output", |l| l.name.as_str());
    let meta = SavedModelMeta {
        producer: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        model_name: model.name.clone(),
        keras_version: model.keras_version.clone(),
        signature: Signature {
            inputs: vec![tensor_spec(&model.input_layer().name, Some(model.input_shape()))],
            outputs: vec![tensor_spec(output_name, model.output_shape())],
        },
        functions,
    };

    let variables: Vec<(String, &ArrayD<f32>)> = layers
        .iter()
        .flat_map(|layer| {
            layer
                .variables
                .iter()
                .enumerate()
                .map(move |(j, v)| (variable_name(&layer.name, j), v))
        })
        .collect();
    let bytes = write_variables(&variables).map_err(|e| ExportError::SafeTensors(e.to_string()))?;

    let variables_dir = dir.join(VARIABLES_DIR);
    std::fs::create_dir_all(&variables_dir)?;
    std::fs::write(variables_dir.join(VARIABLES_FILE), bytes)?;
    std::fs::write(dir.join(SAVED_MODEL_FILE), serde_json::to_vec_pretty(&meta)?)?;
    tracing::debug!(dir = %dir.display(), functions = meta.functions.len(), "exported SavedModel");
    Ok(meta)
}

/// A SavedModel directory read back for conversion.
pub struct SavedModel {
    pub meta: SavedModelMeta,
    pub dir: PathBuf,
    variables: Variables,
}

impl SavedModel {
    pub fn open(dir: &Path) -> Result<Self, GraphConversionError> {
        let meta_path = dir.join(SAVED_MODEL_FILE);
        let meta_bytes = std::fs::read(&meta_path).map_err(GraphConversionError::io(&meta_path))?;
        let meta: SavedModelMeta = serde_json::from_slice(&meta_bytes)?;

        let vars_path = dir.join(VARIABLES_DIR).join(VARIABLES_FILE);
        let file = File::open(&vars_path).map_err(GraphConversionError::io(&vars_path))?;
        let mmap = unsafe { MmapOptions::new().map(&file) }.map_err(GraphConversionError::io(&vars_path))?;
        let variables = read_variables(&mmap[..])
            .map_err(|e| GraphConversionError::SafeTensors(e.to_string()))?;

        Ok(Self { meta, dir: dir.to_path_buf(), variables })
    }

    /// The `index`-th variable of `function`, checked against the shape
    /// recorded in the metadata.
    pub fn variable(&self, function: &Function, index: usize) -> Result<&ArrayD<f32>, GraphConversionError> {
        let spec = function.variables.get(index).ok_or_else(|| {
            GraphConversionError::MissingVariable(variable_name(&function.name, index))
        })?;
        let value = self
            .variables
            .get(&spec.name)
            .ok_or_else(|| GraphConversionError::MissingVariable(spec.name.clone()))?;
        if value.shape() != spec.shape.as_slice() {
            return Err(GraphConversionError::Malformed(format!(
                "variable `{}` has shape {:?}, metadata says {:?}",
                spec.name,
                value.shape(),
                spec.shape
            )));
        }
        Ok(value)
    }
}
