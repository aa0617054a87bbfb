//! TensorFlow graph nodes in the JSON form read by tfjs `loadGraphModel`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Element type of a graph tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DType {
    Float32,
    Int32,
}

impl DType {
    /// Protobuf enum name used in node attributes.
    pub fn proto_name(&self) -> &'static str {
        match self {
            DType::Float32 => "DT_FLOAT",
            DType::Int32 => "DT_INT32",
        }
    }

    /// Name used in the weights manifest.
    pub fn manifest_name(&self) -> &'static str {
        match self {
            DType::Float32 => "float32",
            DType::Int32 => "int32",
        }
    }
}

/// Constant payload carried by a `Const` node.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I32(Vec<i32>),
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::Float32,
            TensorData::I32(_) => DType::Int32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A named constant that ends up in the weights manifest.
#[derive(Clone, Debug, PartialEq)]
pub struct ConstTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: TensorData,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub op: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attr: BTreeMap<String, Value>,
}

fn dims_json<I: IntoIterator<Item = i64>>(dims: I) -> Value {
    let dim: Vec<Value> = dims.into_iter().map(|d| json!({ "size": d.to_string() })).collect();
    if dim.is_empty() {
        json!({})
    } else {
        json!({ "dim": dim })
    }
}

/// Shape attribute with `-1` for unknown dimensions.
pub fn shape_attr(dims: &[Option<usize>]) -> Value {
    json!({ "shape": dims_json(dims.iter().map(|d| d.map_or(-1, |n| n as i64))) })
}

pub fn type_attr(dtype: DType) -> Value {
    json!({ "type": dtype.proto_name() })
}

pub fn bool_attr(value: bool) -> Value {
    json!({ "b": value })
}

/// Tensor shape in the signature form (`{"dim": [{"size": "-1"}, ...]}`).
pub fn tensor_shape(dims: &[Option<usize>]) -> Value {
    dims_json(dims.iter().map(|d| d.map_or(-1, |n| n as i64)))
}

/// Graph under construction: nodes in topological order plus the constants
/// they reference.
#[derive(Debug, Default)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub weights: Vec<ConstTensor>,
}

impl Graph {
    pub fn placeholder(&mut self, name: &str, dims: &[Option<usize>]) -> String {
        let mut attr = BTreeMap::new();
        attr.insert("dtype".to_string(), type_attr(DType::Float32));
        attr.insert("shape".to_string(), shape_attr(dims));
        self.push(name, "Placeholder", Vec::new(), attr)
    }

    /// Add a `Const` node whose value is stored in the weight shards.
    pub fn constant(&mut self, tensor: ConstTensor) -> String {
        let dtype = tensor.data.dtype();
        let mut attr = BTreeMap::new();
        attr.insert("dtype".to_string(), type_attr(dtype));
        attr.insert(
            "value".to_string(),
            json!({
                "tensor": {
                    "dtype": dtype.proto_name(),
                    "tensorShape": dims_json(tensor.shape.iter().map(|&d| d as i64)),
                }
            }),
        );
        let name = self.push(&tensor.name, "Const", Vec::new(), attr);
        self.weights.push(ConstTensor { name: name.clone(), ..tensor });
        name
    }

    /// Add an op with a `T: DT_FLOAT` attribute plus any extra attributes.
    pub fn op(&mut self, name: &str, op: &str, input: Vec<String>, extra: &[(&str, Value)]) -> String {
        let mut attr = BTreeMap::new();
        attr.insert("T".to_string(), type_attr(DType::Float32));
        for (key, value) in extra {
            attr.insert(key.to_string(), value.clone());
        }
        self.push(name, op, input, attr)
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    fn push(&mut self, name: &str, op: &str, input: Vec<String>, attr: BTreeMap<String, Value>) -> String {
        let name = self.unique_name(name);
        tracing::debug!(node = %name, op, "graph node");
        self.nodes.push(Node { name: name.clone(), op: op.to_string(), input, attr });
        name
    }

    fn unique_name(&self, base: &str) -> String {
        if self.node(base).is_none() {
            return base.to_string();
        }
        (1..)
            .map(|i| format!("{base}_{i}"))
            .find(|candidate| self.node(candidate).is_none())
            .unwrap_or_else(|| base.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_shape_uses_minus_one_for_batch() {
        let mut graph = Graph::default();
        graph.placeholder("input_layer", &[None, Some(63)]);
        let attr = &graph.nodes[0].attr["shape"];
        assert_eq!(attr["shape"]["dim"][0]["size"], "-1");
        assert_eq!(attr["shape"]["dim"][1]["size"], "63");
    }

    #[test]
    fn constants_are_recorded_as_weights() {
        let mut graph = Graph::default();
        let name = graph.constant(ConstTensor {
            name: "dense/kernel".into(),
            shape: vec![2, 2],
            data: TensorData::F32(vec![1.0, 2.0, 3.0, 4.0]),
        });
        assert_eq!(name, "dense/kernel");
        assert_eq!(graph.weights.len(), 1);
        assert_eq!(graph.nodes[0].op, "Const");
    }

    #[test]
    fn duplicate_names_get_suffixes() {
        let mut graph = Graph::default();
        let a = graph.op("x", "Relu", vec![], &[]);
        let b = graph.op("x", "Relu", vec![], &[]);
        assert_eq!(a, "x");
        assert_eq!(b, "x_1");
    }
}
