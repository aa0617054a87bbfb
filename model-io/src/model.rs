use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use ndarray::ArrayD;
use serde_json::{json, Value};

use crate::error::LoadError;
use crate::layer::{Layer, LayerKind, Shape};

/// Variables keyed by their storage name (see [`variable_key`]).
pub type Variables = BTreeMap<String, ArrayD<f32>>;

/// Storage key of the `index`-th variable of a layer, matching the
/// `layers/<name>/vars/<i>` layout Keras uses for its weight stores.
pub fn variable_key(layer: &str, index: usize) -> String {
    format!("layers/{layer}/vars/{index}")
}

/// Format a count with thousands separators (`12345` -> `12,345`).
pub fn format_count(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Top-level Keras container class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Container {
    Sequential,
    Functional,
}

impl Container {
    pub fn class_name(&self) -> &'static str {
        match self {
            Container::Sequential => "Sequential",
            Container::Functional => "Functional",
        }
    }
}

/// A trained Keras model reduced to a single chain of layers.
///
/// The first layer is always the input layer; every later layer consumes
/// the output of the one before it.
#[derive(Clone, Debug)]
pub struct KerasModel {
    pub name: String,
    pub container: Container,
    pub keras_version: Option<String>,
    layers: Vec<Layer>,
}

impl KerasModel {
    /// Start a sequential model with an input layer of the given shape.
    pub fn sequential(name: &str, input_shape: Shape) -> Self {
        let mut input = Layer::input("input_layer", input_shape.clone());
        input.output_shape = Some(input_shape);
        Self {
            name: name.to_string(),
            container: Container::Sequential,
            keras_version: None,
            layers: vec![input],
        }
    }

    /// Re-tag the model as a functional graph (same chain).
    pub fn into_functional(mut self) -> Self {
        self.container = Container::Functional;
        self
    }

    /// Append a layer, inferring its output shape and checking its variables.
    pub fn add(&mut self, mut layer: Layer) -> Result<(), LoadError> {
        if self.layers.iter().any(|l| l.name == layer.name) {
            return Err(LoadError::malformed(format!("duplicate layer name `{}`", layer.name)));
        }
        if self.layers.is_empty() != layer.is_input() {
            return Err(LoadError::malformed(format!(
                "layer `{}`: a model needs exactly one input layer, placed first",
                layer.name
            )));
        }
        let input = self.layers.last().and_then(|l| l.output_shape.clone());
        layer.validate_variables(input.as_ref())?;
        layer.output_shape = layer.kind.output_shape(input.as_ref());
        self.layers.push(layer);
        Ok(())
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn input_layer(&self) -> &Layer {
        &self.layers[0]
    }

    pub fn input_shape(&self) -> &Shape {
        match &self.layers[0].kind {
            LayerKind::Input { batch_shape } => batch_shape,
            _ => unreachable!("first layer is always an input layer"),
        }
    }

    /// Output shape of the last layer; unknown past unsupported layers.
    pub fn output_shape(&self) -> Option<&Shape> {
        self.layers.last().and_then(|l| l.output_shape.as_ref())
    }

    pub fn total_params(&self) -> usize {
        self.layers.iter().map(Layer::param_count).sum()
    }

    pub fn non_trainable_params(&self) -> usize {
        self.layers.iter().map(Layer::non_trainable_count).sum()
    }

    /// All variables with their storage keys, in layer order.
    pub fn variables(&self) -> Vec<(String, &ArrayD<f32>)> {
        self.layers
            .iter()
            .flat_map(|layer| {
                layer
                    .variables
                    .iter()
                    .enumerate()
                    .map(move |(i, v)| (variable_key(&layer.name, i), v))
            })
            .collect()
    }

    pub fn summary(&self) -> ModelSummary {
        let rows = self
            .layers
            .iter()
            .filter(|l| !l.is_input())
            .map(|l| SummaryRow {
                name: l.name.clone(),
                class_name: l.class_name.clone(),
                output_shape: l.output_shape.clone(),
                params: l.param_count(),
            })
            .collect();
        let total = self.total_params();
        let non_trainable = self.non_trainable_params();
        ModelSummary {
            name: self.name.clone(),
            rows,
            total_params: total,
            trainable_params: total - non_trainable,
            non_trainable_params: non_trainable,
        }
    }

    /// Build a model from a parsed `config.json`, taking each layer's
    /// variables out of `variables`.
    pub fn from_config(config: &Value, variables: &mut Variables) -> Result<Self, LoadError> {
        let class_name = config
            .get("class_name")
            .and_then(Value::as_str)
            .ok_or_else(|| LoadError::malformed("model config without `class_name`"))?;
        let container = match class_name {
            "Sequential" => Container::Sequential,
            "Functional" | "Model" => Container::Functional,
            other => {
                return Err(LoadError::UnsupportedFormat(format!("model class `{other}`")));
            }
        };
        let inner = config
            .get("config")
            .ok_or_else(|| LoadError::malformed("model config without `config`"))?;
        let entries = inner
            .get("layers")
            .and_then(Value::as_array)
            .ok_or_else(|| LoadError::malformed("model config without `layers`"))?;
        let ordered: Vec<&Value> = match container {
            Container::Sequential => entries.iter().collect(),
            Container::Functional => chain_order(inner, entries)?,
        };

        let mut model = Self {
            name: inner.get("name").and_then(Value::as_str).unwrap_or("model").to_string(),
            container,
            keras_version: None,
            layers: Vec::new(),
        };

        for (position, entry) in ordered.into_iter().enumerate() {
            let class = entry
                .get("class_name")
                .and_then(Value::as_str)
                .ok_or_else(|| LoadError::malformed("layer entry without `class_name`"))?;
            let layer_config = entry
                .get("config")
                .cloned()
                .ok_or_else(|| LoadError::malformed(format!("{class} entry without `config`")))?;
            let mut layer = Layer::from_config(class, layer_config)?;

            if position == 0 && !layer.is_input() {
                let shape = implicit_input_shape(config, inner, &layer.config)?;
                model.add(Layer::input("input_layer", shape))?;
            }

            let mut index = 0;
            while let Some(var) = variables.remove(&variable_key(&layer.name, index)) {
                layer.variables.push(var);
                index += 1;
            }
            model.add(layer)?;
        }

        if model.layers.is_empty() {
            return Err(LoadError::malformed("model has no layers"));
        }
        for key in variables.keys() {
            tracing::warn!(variable = %key, "ignoring variable not claimed by any layer");
        }
        Ok(model)
    }

    /// Serialize back into a Keras 3 `config.json` value.
    pub fn to_config(&self) -> Value {
        let functional = self.container == Container::Functional;
        let layers: Vec<Value> = self
            .layers
            .iter()
            .enumerate()
            .map(|(i, layer)| {
                let mut entry = json!({
                    "module": "keras.layers",
                    "class_name": layer.class_name,
                    "config": layer.config.clone(),
                    "registered_name": null,
                });
                if functional {
                    entry["name"] = json!(layer.name);
                    entry["inbound_nodes"] = match i.checked_sub(1).map(|p| &self.layers[p]) {
                        None => json!([]),
                        Some(prev) => json!([{
                            "args": [{
                                "class_name": "__keras_tensor__",
                                "config": {
                                    "shape": prev.output_shape.as_ref().map(Shape::to_json),
                                    "dtype": "float32",
                                    "keras_history": [prev.name, 0, 0],
                                },
                            }],
                            "kwargs": {},
                        }]),
                    };
                }
                entry
            })
            .collect();

        let mut inner = json!({ "name": self.name, "trainable": true, "layers": layers });
        if functional {
            let last = &self.layers[self.layers.len() - 1];
            inner["input_layers"] = json!([[self.input_layer().name, 0, 0]]);
            inner["output_layers"] = json!([[last.name, 0, 0]]);
        }
        json!({
            "module": "keras",
            "class_name": self.container.class_name(),
            "config": inner,
            "registered_name": null,
            "build_config": { "input_shape": self.input_shape().to_json() },
        })
    }
}

/// Order functional layers from input to output. Only single chains are
/// accepted: every layer but the input has exactly one inbound layer.
fn chain_order<'a>(inner: &Value, entries: &'a [Value]) -> Result<Vec<&'a Value>, LoadError> {
    let mut by_name: HashMap<String, &Value> = HashMap::new();
    for entry in entries {
        let name = entry
            .get("name")
            .or_else(|| entry.get("config").and_then(|c| c.get("name")))
            .and_then(Value::as_str)
            .ok_or_else(|| LoadError::malformed("functional layer without a name"))?;
        by_name.insert(name.to_string(), entry);
    }

    let inputs = node_refs(inner.get("input_layers").unwrap_or(&Value::Null));
    let outputs = node_refs(inner.get("output_layers").unwrap_or(&Value::Null));
    let (input, output) = match (inputs.as_slice(), outputs.as_slice()) {
        ([input], [output]) => (input.clone(), output.clone()),
        _ => {
            return Err(LoadError::UnsupportedFormat(
                "only single-input, single-output functional models are supported".into(),
            ));
        }
    };

    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = output;
    loop {
        let entry = *by_name
            .get(&current)
            .ok_or_else(|| LoadError::malformed(format!("reference to unknown layer `{current}`")))?;
        if !seen.insert(current.clone()) {
            return Err(LoadError::malformed(format!("cycle through layer `{current}`")));
        }
        chain.push(entry);
        if current == input {
            break;
        }
        let inbound = node_refs(entry.get("inbound_nodes").unwrap_or(&Value::Null));
        current = match inbound.as_slice() {
            [single] => single.clone(),
            [] => {
                return Err(LoadError::malformed(format!("layer `{current}` has no inbound layer")));
            }
            _ => {
                return Err(LoadError::UnsupportedFormat(format!(
                    "layer `{current}` has several inputs; only chains are supported"
                )));
            }
        };
    }

    if chain.len() != entries.len() {
        return Err(LoadError::UnsupportedFormat(
            "functional graph is not a single chain of layers".into(),
        ));
    }
    chain.reverse();
    Ok(chain)
}

/// Collect layer names from node references in either the Keras 3 form
/// (`keras_history: [name, 0, 0]`) or the Keras 2 form (`[name, 0, 0, {}]`).
fn node_refs(value: &Value) -> Vec<String> {
    fn collect(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::Object(obj) => {
                if let Some(history) = obj.get("keras_history") {
                    if let Some(name) = history.get(0).and_then(Value::as_str) {
                        out.push(name.to_string());
                    }
                    return;
                }
                obj.values().for_each(|v| collect(v, out));
            }
            Value::Array(items) => {
                if let (Some(Value::String(name)), Some(Value::Number(_))) = (items.first(), items.get(1)) {
                    out.push(name.clone());
                    return;
                }
                items.iter().for_each(|v| collect(v, out));
            }
            _ => {}
        }
    }
    let mut out = Vec::new();
    collect(value, &mut out);
    out
}

fn implicit_input_shape(top: &Value, inner: &Value, first: &Value) -> Result<Shape, LoadError> {
    let candidate = first
        .get("batch_shape")
        .or_else(|| first.get("batch_input_shape"))
        .or_else(|| inner.get("build_input_shape"))
        .or_else(|| top.get("build_config").and_then(|b| b.get("input_shape")))
        .filter(|v| !v.is_null());
    match candidate {
        Some(shape) => Shape::from_json(shape),
        None => Err(LoadError::malformed("cannot determine the model input shape")),
    }
}

/// One row of the summary table.
#[derive(Clone, Debug)]
pub struct SummaryRow {
    pub name: String,
    pub class_name: String,
    pub output_shape: Option<Shape>,
    pub params: usize,
}

/// Keras-style textual model summary.
#[derive(Clone, Debug)]
pub struct ModelSummary {
    pub name: String,
    pub rows: Vec<SummaryRow>,
    pub total_params: usize,
    pub trainable_params: usize,
    pub non_trainable_params: usize,
}

impl fmt::Display for ModelSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const WIDTH: usize = 72;
        writeln!(f, "Model: \"{}\"", self.name)?;
        writeln!(f, "{}", "─".repeat(WIDTH))?;
        writeln!(f, "{:<34}{:<26}{:>12}", "Layer (type)", "Output Shape", "Param #")?;
        writeln!(f, "{}", "═".repeat(WIDTH))?;
        for row in &self.rows {
            let shape = row.output_shape.as_ref().map_or_else(|| "?".to_string(), Shape::to_string);
            writeln!(
                f,
                "{:<34}{:<26}{:>12}",
                format!("{} ({})", row.name, row.class_name),
                shape,
                format_count(row.params as u64)
            )?;
        }
        writeln!(f, "{}", "─".repeat(WIDTH))?;
        writeln!(f, "Total params: {}", format_count(self.total_params as u64))?;
        writeln!(f, "Trainable params: {}", format_count(self.trainable_params as u64))?;
        write!(f, "Non-trainable params: {}", format_count(self.non_trainable_params as u64))
    }
}
