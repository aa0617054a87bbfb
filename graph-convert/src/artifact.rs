//! Writing the browser graph model (`model.json` + weight shards) and
//! listing the output directory.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::GraphConversionError;
use crate::graph::{tensor_shape, DType, Node};
use crate::lower::LoweredGraph;
use crate::saved_model::{SavedModelMeta, TensorSpec};
use crate::weights::{encode, shard_name, split_shards, Quantization, WeightGroup};

pub const MODEL_JSON: &str = "model.json";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelJson<'a> {
    format: &'static str,
    generated_by: String,
    converted_by: String,
    signature: Value,
    model_topology: Topology<'a>,
    weights_manifest: Vec<WeightGroup>,
}

#[derive(Serialize)]
struct Topology<'a> {
    node: &'a [Node],
    library: Value,
    versions: Value,
}

/// A file in the output directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputFile {
    pub name: String,
    pub size: u64,
}

/// Whether `name` is one of the files this converter writes.
pub fn is_artifact_file(name: &str) -> bool {
    name == MODEL_JSON
        || (name.starts_with("group") && name.contains("-shard") && name.ends_with(".bin"))
}

fn signature_entry(node: &str, spec: Option<&TensorSpec>) -> (String, Value) {
    let key = format!("{node}:0");
    let mut entry = json!({ "name": key, "dtype": DType::Float32.proto_name() });
    if let Some(dims) = spec.and_then(|s| s.shape.as_ref()) {
        entry["tensorShape"] = tensor_shape(dims);
    }
    (key, entry)
}

fn signature(lowered: &LoweredGraph, meta: &SavedModelMeta) -> Value {
    let inputs: Map<String, Value> =
        [signature_entry(&lowered.input, meta.signature.inputs.first())].into_iter().collect();
    let outputs: Map<String, Value> =
        [signature_entry(&lowered.output, meta.signature.outputs.first())].into_iter().collect();
    json!({ "inputs": inputs, "outputs": outputs })
}

/// Remove `model.json` and shard files left by an earlier run.
fn remove_stale(dir: &Path) -> Result<(), GraphConversionError> {
    for entry in fs::read_dir(dir).map_err(GraphConversionError::io(dir))? {
        let entry = entry.map_err(GraphConversionError::io(dir))?;
        let name = entry.file_name();
        if entry.path().is_file() && is_artifact_file(&name.to_string_lossy()) {
            tracing::debug!(file = %name.to_string_lossy(), "removing stale artifact file");
            fs::remove_file(entry.path()).map_err(GraphConversionError::io(entry.path()))?;
        }
    }
    Ok(())
}

/// Write the graph model into `dir`. Shards go first and `model.json`
/// last; on failure every file written so far is removed again.
pub fn write_graph_model(
    lowered: &LoweredGraph,
    meta: &SavedModelMeta,
    dir: &Path,
    shard_size_bytes: usize,
    quantization: Quantization,
) -> Result<Vec<PathBuf>, GraphConversionError> {
    fs::create_dir_all(dir).map_err(GraphConversionError::io(dir))?;
    remove_stale(dir)?;

    let encoded = encode(&lowered.graph.weights, quantization);
    let shards = split_shards(&encoded.data, shard_size_bytes);
    let paths: Vec<String> = (1..=shards.len()).map(|i| shard_name(1, i, shards.len())).collect();

    let model_json = ModelJson {
        format: "graph-model",
        generated_by: match &meta.keras_version {
            Some(version) => format!("keras {version}"),
            None => "keras".to_string(),
        },
        converted_by: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        signature: signature(lowered, meta),
        model_topology: Topology {
            node: &lowered.graph.nodes,
            library: json!({}),
            versions: json!({}),
        },
        weights_manifest: vec![WeightGroup { paths: paths.clone(), weights: encoded.specs }],
    };
    let body = serde_json::to_vec(&model_json)?;

    let mut written = Vec::with_capacity(shards.len() + 1);
    let files = paths
        .iter()
        .map(String::as_str)
        .zip(shards)
        .chain(std::iter::once((MODEL_JSON, body.as_slice())));
    for (name, bytes) in files {
        let path = dir.join(name);
        if let Err(source) = fs::write(&path, bytes) {
            for done in &written {
                let _ = fs::remove_file(done);
            }
            let _ = fs::remove_file(&path);
            return Err(GraphConversionError::Io { path, source });
        }
        tracing::debug!(file = %path.display(), bytes = bytes.len(), "wrote artifact file");
        written.push(path);
    }
    Ok(written)
}

/// Regular files in `dir` with their sizes, sorted by name.
pub fn list_files(dir: &Path) -> std::io::Result<Vec<OutputFile>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_file() {
            files.push(OutputFile {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
            });
        }
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}
