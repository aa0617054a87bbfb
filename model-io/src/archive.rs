//! Reading and writing `.keras` model archives.
//!
//! An archive is a zip file holding `config.json`, an optional
//! `metadata.json` and a weight store. Keras writes the store as HDF5
//! (`model.weights.h5`) with one group per layer, `layers/<group>/vars/<i>`,
//! where `<group>` is the snake-cased layer class numbered in layer order.
//! A `model.weights.safetensors` store with F32 tensors keyed by
//! [`variable_key`] is accepted as well.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use ndarray::ArrayD;
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::error::LoadError;
use crate::layer::Layer;
use crate::model::{variable_key, KerasModel, Variables};

pub const CONFIG_ENTRY: &str = "config.json";
pub const METADATA_ENTRY: &str = "metadata.json";
pub const WEIGHTS_ENTRY: &str = "model.weights.h5";
pub const SAFETENSORS_WEIGHTS_ENTRY: &str = "model.weights.safetensors";

/// Top-level HDF5 groups holding per-layer weights. Keras 3 uses `layers`;
/// tf.keras 2.13+ reaches the same layers through
/// `_layer_checkpoint_dependencies` first.
const HDF5_LAYER_ROOTS: [&str; 2] = ["layers", "_layer_checkpoint_dependencies"];

/// Weight store written by [`save_keras_as`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WeightFormat {
    Hdf5,
    SafeTensors,
}

/// Contents of `metadata.json`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    #[serde(default)]
    pub keras_version: Option<String>,
    #[serde(default)]
    pub date_saved: Option<String>,
}

/// Load a model from a `.keras` archive.
pub fn load_keras(path: &Path) -> Result<KerasModel, LoadError> {
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        if ext.eq_ignore_ascii_case("h5") || ext.eq_ignore_ascii_case("hdf5") {
            return Err(LoadError::UnsupportedFormat(
                "legacy HDF5 model files are not supported; save the model as .keras".into(),
            ));
        }
    }

    let file = File::open(path)?;
    let mut archive = ZipArchive::new(file).map_err(|e| match e {
        ZipError::InvalidArchive(_) => {
            LoadError::UnsupportedFormat(format!("{} is not a .keras archive", path.display()))
        }
        other => LoadError::Zip(other),
    })?;

    let config: serde_json::Value = serde_json::from_slice(
        &read_entry(&mut archive, CONFIG_ENTRY)?.ok_or(LoadError::MissingEntry(CONFIG_ENTRY))?,
    )?;
    let metadata: ArchiveMetadata = match read_entry(&mut archive, METADATA_ENTRY)? {
        Some(bytes) => serde_json::from_slice(&bytes)?,
        None => {
            tracing::debug!("archive has no {METADATA_ENTRY}");
            ArchiveMetadata::default()
        }
    };

    let mut variables = match read_entry(&mut archive, WEIGHTS_ENTRY)? {
        Some(bytes) => read_hdf5_variables(&bytes, &config)?,
        None => match read_entry(&mut archive, SAFETENSORS_WEIGHTS_ENTRY)? {
            Some(bytes) => read_variables(&bytes)?,
            None => return Err(LoadError::MissingEntry(WEIGHTS_ENTRY)),
        },
    };

    let mut model = KerasModel::from_config(&config, &mut variables)?;
    model.keras_version = metadata.keras_version;
    tracing::debug!(
        model = %model.name,
        layers = model.layers().len(),
        params = model.total_params(),
        "loaded keras archive"
    );
    Ok(model)
}

/// Write a model as a `.keras` archive with an HDF5 weight store, the
/// layout Keras itself writes.
pub fn save_keras(model: &KerasModel, path: &Path) -> Result<(), LoadError> {
    save_keras_as(model, path, WeightFormat::Hdf5)
}

pub fn save_keras_as(model: &KerasModel, path: &Path, format: WeightFormat) -> Result<(), LoadError> {
    let metadata = ArchiveMetadata {
        keras_version: model.keras_version.clone(),
        date_saved: Some(chrono::Utc::now().format("%Y-%m-%d@%H:%M:%S").to_string()),
    };
    let (entry, weights) = match format {
        WeightFormat::Hdf5 => (WEIGHTS_ENTRY, write_hdf5_variables(model)?),
        WeightFormat::SafeTensors => (SAFETENSORS_WEIGHTS_ENTRY, write_variables(&model.variables())?),
    };

    let file = File::create(path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    zip.start_file(CONFIG_ENTRY, options)?;
    zip.write_all(serde_json::to_string(&model.to_config())?.as_bytes())?;
    zip.start_file(METADATA_ENTRY, options)?;
    zip.write_all(serde_json::to_string(&metadata)?.as_bytes())?;
    zip.start_file(entry, options)?;
    zip.write_all(&weights)?;
    zip.finish()?;
    Ok(())
}

/// Keras' `to_snake_case`: `BatchNormalization` -> `batch_normalization`.
fn snake_case(class_name: &str) -> String {
    let chars: Vec<char> = class_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    let mut spaced = Vec::with_capacity(chars.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        let starts_word = c.is_ascii_uppercase() && chars.get(i + 1).map_or(false, char::is_ascii_lowercase);
        if i > 0 && starts_word {
            spaced.push('_');
        }
        spaced.push(c);
    }
    let mut out = String::with_capacity(spaced.len() + 4);
    for (i, &c) in spaced.iter().enumerate() {
        if i > 0 && c.is_ascii_uppercase() && spaced[i - 1].is_ascii_lowercase() {
            out.push('_');
        }
        out.push(c.to_ascii_lowercase());
    }
    out
}

/// HDF5 group of each layer, given `(name, class_name)` pairs in layer
/// order: the first `Dense` is `dense`, the next `dense_1`, and so on.
fn store_groups<'a>(layers: impl IntoIterator<Item = (&'a str, &'a str)>) -> Vec<(&'a str, String)> {
    let mut used: HashMap<String, usize> = HashMap::new();
    layers
        .into_iter()
        .map(|(name, class_name)| {
            let base = snake_case(class_name);
            let group = match used.get_mut(&base) {
                Some(count) => {
                    *count += 1;
                    format!("{base}_{count}")
                }
                None => {
                    used.insert(base.clone(), 0);
                    base
                }
            };
            (name, group)
        })
        .collect()
}

/// `(name, class_name)` of every layer in a model config, in config order.
fn config_layers(config: &Value) -> Vec<(&str, &str)> {
    let entries = config
        .get("config")
        .and_then(|c| c.get("layers"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    entries
        .iter()
        .filter_map(|entry| {
            let class_name = entry.get("class_name")?.as_str()?;
            let name = entry
                .get("config")
                .and_then(|c| c.get("name"))
                .or_else(|| entry.get("name"))?
                .as_str()?;
            Some((name, class_name))
        })
        .collect()
}

/// Decode a Keras HDF5 weight store. Groups are matched to layers of
/// `config` by class and position; a group named after the layer itself is
/// accepted as a fallback.
pub fn read_hdf5_variables(bytes: &[u8], config: &Value) -> Result<Variables, LoadError> {
    // libhdf5 opens files by path
    let mut spill = tempfile::NamedTempFile::new()?;
    spill.write_all(bytes)?;
    spill.flush()?;

    let file = hdf5::File::open(spill.path())?;
    let mut out = Variables::new();
    let Some(root) = HDF5_LAYER_ROOTS.into_iter().find(|root| file.link_exists(root)) else {
        tracing::warn!("HDF5 weight store has no layer groups");
        return Ok(out);
    };
    let root = file.group(root)?;

    for (layer, group) in store_groups(config_layers(config)) {
        let Some(group) = [group.as_str(), layer].into_iter().find(|g| root.link_exists(g)) else {
            continue;
        };
        let group = root.group(group)?;
        if !group.link_exists("vars") {
            continue;
        }
        let vars = group.group("vars")?;
        let mut index = 0;
        while vars.link_exists(&index.to_string()) {
            let dataset = vars.dataset(&index.to_string())?;
            let data = dataset.read_raw::<f32>()?;
            let array = ArrayD::from_shape_vec(dataset.shape(), data).map_err(|e| {
                LoadError::malformed(format!("weights of `{layer}` variable {index}: {e}"))
            })?;
            out.insert(variable_key(layer, index), array);
            index += 1;
        }
    }
    tracing::debug!(variables = out.len(), "read HDF5 weight store");
    Ok(out)
}

/// Encode a model's variables as a Keras HDF5 weight store.
fn write_hdf5_variables(model: &KerasModel) -> Result<Vec<u8>, LoadError> {
    let spill = tempfile::NamedTempFile::new()?;
    {
        let file = hdf5::File::create(spill.path())?;
        let root = file.create_group(HDF5_LAYER_ROOTS[0])?;
        let layers: Vec<&Layer> = model.layers().iter().filter(|l| !l.is_input()).collect();
        let groups = store_groups(layers.iter().map(|l| (l.name.as_str(), l.class_name.as_str())));
        for (layer, (_, group)) in layers.iter().zip(groups) {
            let vars = root.create_group(&group)?.create_group("vars")?;
            for (index, variable) in layer.variables.iter().enumerate() {
                let values: Vec<f32> = variable.iter().copied().collect();
                let dataset = vars
                    .new_dataset::<f32>()
                    .shape(variable.shape().to_vec())
                    .create(index.to_string().as_str())?;
                dataset.write_raw(values.as_slice())?;
            }
        }
    }
    Ok(std::fs::read(spill.path())?)
}

fn read_entry<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Option<Vec<u8>>, LoadError> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut buf = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut buf)?;
    Ok(Some(buf))
}

/// Decode a safetensors buffer into F32 arrays.
pub fn read_variables(bytes: &[u8]) -> Result<Variables, LoadError> {
    let tensors = SafeTensors::deserialize(bytes)
        .map_err(|e| LoadError::SafeTensors(format!("failed to read weight store: {e}")))?;
    let mut out = Variables::new();
    for (name, view) in tensors.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(LoadError::UnsupportedFormat(format!(
                "tensor `{name}` has dtype {:?}; only F32 weights are supported",
                view.dtype()
            )));
        }
        let data: Vec<f32> = view
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let array = ArrayD::from_shape_vec(view.shape().to_vec(), data)
            .map_err(|e| LoadError::SafeTensors(format!("tensor `{name}`: {e}")))?;
        out.insert(name, array);
    }
    Ok(out)
}

/// Encode named F32 arrays as a safetensors buffer.
pub fn write_variables(vars: &[(String, &ArrayD<f32>)]) -> Result<Vec<u8>, LoadError> {
    let tensor_data: Vec<(&str, Vec<u8>, Vec<usize>)> = vars
        .iter()
        .map(|(name, array)| {
            let values: Vec<f32> = array.iter().copied().collect();
            (name.as_str(), bytemuck::cast_slice(&values).to_vec(), array.shape().to_vec())
        })
        .collect();

    let views = tensor_data
        .iter()
        .map(|(name, bytes, shape)| {
            TensorView::new(Dtype::F32, shape.clone(), bytes)
                .map(|view| (*name, view))
                .map_err(|e| LoadError::SafeTensors(format!("tensor `{name}`: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut metadata = HashMap::new();
    metadata.insert("format".to_string(), "keras".to_string());
    safetensors::serialize(views, Some(metadata))
        .map_err(|e| LoadError::SafeTensors(format!("serialization failed: {e}")))
}
