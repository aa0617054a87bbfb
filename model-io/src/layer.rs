use std::fmt;

use ndarray::{Array1, Array2, ArrayD};
use serde_json::{json, Value};

use crate::error::LoadError;

/// Tensor shape with `None` standing in for unknown (batch) dimensions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shape(pub Vec<Option<usize>>);

impl Shape {
    /// Shape with an unknown leading batch dimension.
    pub fn batched(dims: &[usize]) -> Self {
        let mut out = vec![None];
        out.extend(dims.iter().copied().map(Some));
        Self(out)
    }

    /// Parse a Keras shape list such as `[null, 63]`.
    pub fn from_json(value: &Value) -> Result<Self, LoadError> {
        let dims = value
            .as_array()
            .ok_or_else(|| LoadError::malformed(format!("expected a shape list, got {value}")))?;
        dims.iter()
            .map(|d| match d {
                Value::Null => Ok(None),
                Value::Number(n) => n
                    .as_u64()
                    .map(|n| Some(n as usize))
                    .ok_or_else(|| LoadError::malformed(format!("invalid dimension {n}"))),
                other => Err(LoadError::malformed(format!("invalid dimension {other}"))),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    pub fn to_json(&self) -> Value {
        Value::Array(
            self.0
                .iter()
                .map(|d| d.map_or(Value::Null, |n| json!(n)))
                .collect(),
        )
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[Option<usize>] {
        &self.0
    }

    /// Size of the innermost dimension, if known.
    pub fn last(&self) -> Option<usize> {
        self.0.last().copied().flatten()
    }

    fn with_last(&self, n: usize) -> Self {
        let mut dims = self.0.clone();
        match dims.last_mut() {
            Some(last) => *last = Some(n),
            None => dims.push(Some(n)),
        }
        Self(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self
            .0
            .iter()
            .map(|d| d.map_or_else(|| "None".to_string(), |n| n.to_string()))
            .collect();
        match dims.len() {
            1 => write!(f, "({},)", dims[0]),
            _ => write!(f, "({})", dims.join(", ")),
        }
    }
}

/// Parsed view of a layer config. Classes the converter does not know are
/// kept as `Unsupported` so the model can still be inspected.
#[derive(Clone, Debug, PartialEq)]
pub enum LayerKind {
    Input { batch_shape: Shape },
    Dense { units: usize, activation: String, use_bias: bool },
    Dropout { rate: f32 },
    Activation { activation: String },
    /// `axis` is kept as written; see [`LayerKind::feature_axis`].
    BatchNormalization { axis: i64, epsilon: f32, center: bool, scale: bool },
    Flatten,
    Unsupported,
}

impl LayerKind {
    pub fn parse(class_name: &str, config: &Value) -> Result<Self, LoadError> {
        let kind = match class_name {
            "InputLayer" => {
                let shape = config
                    .get("batch_shape")
                    .or_else(|| config.get("batch_input_shape"))
                    .ok_or_else(|| LoadError::malformed("InputLayer without a batch shape"))?;
                LayerKind::Input { batch_shape: Shape::from_json(shape)? }
            }
            "Dense" => LayerKind::Dense {
                units: config
                    .get("units")
                    .and_then(Value::as_u64)
                    .filter(|&u| u > 0)
                    .ok_or_else(|| LoadError::malformed("Dense layer without positive `units`"))?
                    as usize,
                activation: activation_name(config.get("activation"))?,
                use_bias: bool_field(config, "use_bias", true),
            },
            "Dropout" => LayerKind::Dropout {
                rate: config.get("rate").and_then(Value::as_f64).unwrap_or(0.0) as f32,
            },
            "Activation" => LayerKind::Activation {
                activation: activation_name(config.get("activation"))?,
            },
            "BatchNormalization" => match single_axis(config) {
                Some(axis) => LayerKind::BatchNormalization {
                    axis,
                    epsilon: config.get("epsilon").and_then(Value::as_f64).unwrap_or(1e-3) as f32,
                    center: bool_field(config, "center", true),
                    scale: bool_field(config, "scale", true),
                },
                None => LayerKind::Unsupported,
            },
            "Flatten" => LayerKind::Flatten,
            _ => LayerKind::Unsupported,
        };
        Ok(kind)
    }

    /// Output shape for a given input shape. Unknown input yields unknown
    /// output, except for input layers which define their own shape.
    pub fn output_shape(&self, input: Option<&Shape>) -> Option<Shape> {
        match self {
            LayerKind::Input { batch_shape } => Some(batch_shape.clone()),
            LayerKind::Dense { units, .. } => input.map(|s| s.with_last(*units)),
            LayerKind::Dropout { .. }
            | LayerKind::Activation { .. }
            | LayerKind::BatchNormalization { .. } => input.cloned(),
            LayerKind::Flatten => input.map(|s| {
                let rest = &s.dims()[1.min(s.rank())..];
                let flat = rest.iter().try_fold(1usize, |acc, d| d.map(|d| acc * d));
                Shape(vec![s.dims().first().copied().flatten(), flat])
            }),
            LayerKind::Unsupported => None,
        }
    }

    /// Expected variable shapes, in Keras storage order. `None` when the
    /// shapes cannot be derived (unknown input or unsupported layer).
    pub fn variable_shapes(&self, input: Option<&Shape>) -> Option<Vec<Vec<usize>>> {
        match self {
            LayerKind::Dense { units, use_bias, .. } => {
                let fan_in = input?.last()?;
                let mut shapes = vec![vec![fan_in, *units]];
                if *use_bias {
                    shapes.push(vec![*units]);
                }
                Some(shapes)
            }
            LayerKind::BatchNormalization { center, scale, .. } => {
                let input = input?;
                let features = input.dims().get(self.feature_axis(input)?).copied().flatten()?;
                let count = 2 + usize::from(*center) + usize::from(*scale);
                Some(vec![vec![features]; count])
            }
            LayerKind::Unsupported => None,
            _ => Some(Vec::new()),
        }
    }

    /// Axis a batch-norm layer normalizes, resolved against the rank of its
    /// input. `None` for other kinds or when the axis is out of range.
    pub fn feature_axis(&self, input: &Shape) -> Option<usize> {
        let LayerKind::BatchNormalization { axis, .. } = self else {
            return None;
        };
        let rank = i64::try_from(input.rank()).ok()?;
        let resolved = if *axis < 0 { rank + axis } else { *axis };
        usize::try_from(resolved).ok().filter(|&a| a < input.rank())
    }
}

fn bool_field(config: &Value, key: &str, default: bool) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(default)
}

/// Keras 3 writes the batch-norm axis as `-1`; Keras 2 writes the built
/// axis as a one-element list such as `[1]`.
fn single_axis(config: &Value) -> Option<i64> {
    match config.get("axis") {
        None => Some(-1),
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::Array(axes)) if axes.len() == 1 => axes[0].as_i64(),
        Some(_) => None,
    }
}

/// Activations serialize either as a bare name or, for Keras 3 objects, as
/// `{"class_name": "function", "config": "relu"}`.
fn activation_name(value: Option<&Value>) -> Result<String, LoadError> {
    match value {
        None | Some(Value::Null) => Ok("linear".to_string()),
        Some(Value::String(name)) => Ok(name.clone()),
        Some(Value::Object(obj)) => obj
            .get("config")
            .and_then(|c| c.as_str().or_else(|| c.get("name").and_then(Value::as_str)))
            .or_else(|| obj.get("class_name").and_then(Value::as_str))
            .map(str::to_string)
            .ok_or_else(|| LoadError::malformed("unreadable activation")),
        Some(other) => Err(LoadError::malformed(format!("unreadable activation {other}"))),
    }
}

/// A single layer with its raw config, parsed kind and variables.
#[derive(Clone, Debug)]
pub struct Layer {
    pub name: String,
    pub class_name: String,
    pub config: Value,
    pub kind: LayerKind,
    pub variables: Vec<ArrayD<f32>>,
    pub output_shape: Option<Shape>,
}

impl Layer {
    /// Build a layer from a Keras class name and config.
    pub fn from_config(class_name: &str, config: Value) -> Result<Self, LoadError> {
        let name = config
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| LoadError::malformed(format!("{class_name} layer without a name")))?
            .to_string();
        let kind = LayerKind::parse(class_name, &config)?;
        Ok(Self {
            name,
            class_name: class_name.to_string(),
            config,
            kind,
            variables: Vec::new(),
            output_shape: None,
        })
    }

    pub fn input(name: &str, batch_shape: Shape) -> Self {
        let config = json!({
            "name": name,
            "batch_shape": batch_shape.to_json(),
            "dtype": "float32",
            "sparse": false,
        });
        Self::known("InputLayer", config, Vec::new())
    }

    /// Dense layer; `units` is taken from the kernel's second axis.
    pub fn dense(
        name: &str,
        activation: &str,
        kernel: Array2<f32>,
        bias: Option<Array1<f32>>,
    ) -> Self {
        let config = json!({
            "name": name,
            "trainable": true,
            "dtype": "float32",
            "units": kernel.ncols(),
            "activation": activation,
            "use_bias": bias.is_some(),
        });
        let mut variables = vec![kernel.into_dyn()];
        variables.extend(bias.map(|b| b.into_dyn()));
        Self::known("Dense", config, variables)
    }

    pub fn dropout(name: &str, rate: f32) -> Self {
        let config = json!({ "name": name, "trainable": true, "dtype": "float32", "rate": rate });
        Self::known("Dropout", config, Vec::new())
    }

    pub fn activation(name: &str, activation: &str) -> Self {
        let config =
            json!({ "name": name, "trainable": true, "dtype": "float32", "activation": activation });
        Self::known("Activation", config, Vec::new())
    }

    /// Batch normalization over the last axis with all four statistics.
    pub fn batch_norm(
        name: &str,
        epsilon: f32,
        gamma: Array1<f32>,
        beta: Array1<f32>,
        moving_mean: Array1<f32>,
        moving_variance: Array1<f32>,
    ) -> Self {
        let config = json!({
            "name": name,
            "trainable": true,
            "dtype": "float32",
            "axis": -1,
            "epsilon": epsilon,
            "center": true,
            "scale": true,
        });
        let variables = [gamma, beta, moving_mean, moving_variance]
            .into_iter()
            .map(|v| v.into_dyn())
            .collect();
        Self::known("BatchNormalization", config, variables)
    }

    pub fn flatten(name: &str) -> Self {
        let config = json!({ "name": name, "trainable": true, "dtype": "float32" });
        Self::known("Flatten", config, Vec::new())
    }

    /// Layer of an arbitrary class, kept opaque.
    pub fn custom(class_name: &str, config: Value, variables: Vec<ArrayD<f32>>) -> Result<Self, LoadError> {
        let mut layer = Self::from_config(class_name, config)?;
        layer.variables = variables;
        Ok(layer)
    }

    fn known(class_name: &str, config: Value, variables: Vec<ArrayD<f32>>) -> Self {
        let name = config["name"].as_str().unwrap_or_default().to_string();
        let kind = LayerKind::parse(class_name, &config).unwrap_or(LayerKind::Unsupported);
        Self {
            name,
            class_name: class_name.to_string(),
            config,
            kind,
            variables,
            output_shape: None,
        }
    }

    pub fn is_input(&self) -> bool {
        matches!(self.kind, LayerKind::Input { .. })
    }

    pub fn param_count(&self) -> usize {
        self.variables.iter().map(|v| v.len()).sum()
    }

    /// Parameters that are not updated by training (moving statistics).
    pub fn non_trainable_count(&self) -> usize {
        match self.kind {
            LayerKind::BatchNormalization { .. } => {
                self.variables.iter().rev().take(2).map(|v| v.len()).sum()
            }
            _ => 0,
        }
    }

    /// Check the attached variables against the shapes implied by `input`.
    pub(crate) fn validate_variables(&self, input: Option<&Shape>) -> Result<(), LoadError> {
        let Some(expected) = self.kind.variable_shapes(input) else {
            return Ok(());
        };
        for (index, shape) in expected.iter().enumerate() {
            let var = self.variables.get(index).ok_or_else(|| LoadError::MissingVariable {
                layer: self.name.clone(),
                index,
            })?;
            if var.shape() != shape.as_slice() {
                return Err(LoadError::VariableShape {
                    layer: self.name.clone(),
                    index,
                    expected: shape.clone(),
                    actual: var.shape().to_vec(),
                });
            }
        }
        Ok(())
    }
}
