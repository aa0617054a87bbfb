//! Lowering of exported layer functions into an inference graph.

use model_io::{LayerKind, Shape};
use ndarray::{Array1, ArrayD, Ix1};
use serde_json::json;

use crate::error::GraphConversionError;
use crate::graph::{bool_attr, type_attr, ConstTensor, DType, Graph, TensorData};
use crate::saved_model::{Function, SavedModel};

/// Base64 of `NHWC`, the `data_format` string attribute of `BiasAdd`.
const NHWC: &str = "TkhXQw==";

/// Name of the node producing the model output.
pub const OUTPUT_NODE: &str = "Identity";

/// Inference graph plus the names of its input and output nodes.
#[derive(Debug)]
pub struct LoweredGraph {
    pub graph: Graph,
    pub input: String,
    pub output: String,
}

pub fn lower(saved: &SavedModel) -> Result<LoweredGraph, GraphConversionError> {
    let meta = &saved.meta;
    let mut graph = Graph::default();
    let mut current: Option<String> = None;
    let mut shape: Option<Shape> = None;
    let mut input = None;
    let mut previous: Option<&str> = None;

    for function in &meta.functions {
        if function.input.as_deref() != previous {
            return Err(GraphConversionError::Malformed(format!(
                "function `{}` does not consume the preceding function",
                function.name
            )));
        }
        let kind = LayerKind::parse(&function.class_name, &function.config)
            .map_err(|e| GraphConversionError::Malformed(format!("{}: {e}", function.name)))?;
        let scope = format!("{}/{}", meta.model_name, function.name);

        let produced = match (&kind, current.take()) {
            (LayerKind::Input { batch_shape }, None) => {
                let name = graph.placeholder(&function.name, batch_shape.dims());
                input = Some(name.clone());
                name
            }
            (LayerKind::Input { .. }, Some(_)) => {
                return Err(GraphConversionError::Malformed(format!(
                    "input function `{}` is not first",
                    function.name
                )));
            }
            (_, None) => {
                return Err(GraphConversionError::Malformed(format!(
                    "function `{}` has no input",
                    function.name
                )));
            }
            (LayerKind::Dense { units, activation, use_bias }, Some(x)) => {
                let input_shape = known_shape(function, shape.as_ref())?;
                // MatMul is rank-2 only; wider inputs are folded into the batch
                // and unfolded again, as Keras applies Dense over the last axis.
                let folded = match input_shape.rank() {
                    2 => None,
                    rank if rank > 2 => Some(inner_dims(function, &input_shape)?),
                    _ => {
                        return Err(GraphConversionError::Malformed(format!(
                            "dense layer `{}` needs an input of rank 2 or more, got {input_shape}",
                            function.name
                        )));
                    }
                };
                let x = match &folded {
                    Some(inner) => {
                        let fan_in = *inner.last().unwrap_or(&1);
                        reshape(&mut graph, &format!("{scope}/Tensordot"), x, &[-1, fan_in])
                    }
                    None => x,
                };
                let kernel = graph.constant(const_f32(
                    format!("{scope}/MatMul/ReadVariableOp"),
                    saved.variable(function, 0)?,
                ));
                let mut y = graph.op(
                    &format!("{scope}/MatMul"),
                    "MatMul",
                    vec![x, kernel],
                    &[("transpose_a", bool_attr(false)), ("transpose_b", bool_attr(false))],
                );
                if let Some(inner) = &folded {
                    let mut target = vec![-1];
                    target.extend_from_slice(&inner[..inner.len() - 1]);
                    target.push(to_i32(function, *units)?);
                    y = reshape(&mut graph, &format!("{scope}/Tensordot_1"), y, &target);
                }
                if *use_bias {
                    let bias = graph.constant(const_f32(
                        format!("{scope}/BiasAdd/ReadVariableOp"),
                        saved.variable(function, 1)?,
                    ));
                    y = graph.op(
                        &format!("{scope}/BiasAdd"),
                        "BiasAdd",
                        vec![y, bias],
                        &[("data_format", json!({ "s": NHWC }))],
                    );
                }
                activation_op(&mut graph, &scope, function, activation, y)?
            }
            (LayerKind::Dropout { .. }, Some(x)) => {
                tracing::debug!(layer = %function.name, "dropout elided from inference graph");
                x
            }
            (LayerKind::Activation { activation }, Some(x)) => {
                activation_op(&mut graph, &scope, function, activation, x)?
            }
            (LayerKind::BatchNormalization { epsilon, center, scale, .. }, Some(x)) => {
                let input_shape = known_shape(function, shape.as_ref())?;
                if kind.feature_axis(&input_shape).map(|axis| axis + 1) != Some(input_shape.rank()) {
                    return Err(GraphConversionError::UnsupportedLayer {
                        layer: function.name.clone(),
                        class_name: format!("{} over a non-last axis", function.class_name),
                    });
                }
                let (mul, add) = fold_batch_norm(saved, function, *epsilon, *center, *scale)?;
                let mul = graph.constant(const_f32(format!("{scope}/batchnorm/mul"), &mul.into_dyn()));
                let add = graph.constant(const_f32(format!("{scope}/batchnorm/sub"), &add.into_dyn()));
                let y = graph.op(&format!("{scope}/batchnorm/mul_1"), "Mul", vec![x, mul], &[]);
                graph.op(&format!("{scope}/batchnorm/add_1"), "AddV2", vec![y, add], &[])
            }
            (LayerKind::Flatten, Some(x)) => {
                let flat = kind
                    .output_shape(shape.as_ref())
                    .and_then(|s| s.last())
                    .ok_or_else(|| {
                        GraphConversionError::Malformed(format!(
                            "cannot flatten `{}`: input shape is not fully known",
                            function.name
                        ))
                    })?;
                let flat = to_i32(function, flat)?;
                reshape(&mut graph, &scope, x, &[-1, flat])
            }
            (LayerKind::Unsupported, Some(_)) => {
                return Err(GraphConversionError::UnsupportedLayer {
                    layer: function.name.clone(),
                    class_name: function.class_name.clone(),
                });
            }
        };

        current = Some(produced);
        shape = kind.output_shape(shape.as_ref());
        previous = Some(function.name.as_str());
    }

    let input = input.ok_or_else(|| GraphConversionError::Malformed("no input function".into()))?;
    let last = current.ok_or_else(|| GraphConversionError::Malformed("no functions".into()))?;
    let output = graph.op(OUTPUT_NODE, "Identity", vec![last], &[]);
    Ok(LoweredGraph { graph, input, output })
}

fn const_f32(name: String, value: &ArrayD<f32>) -> ConstTensor {
    ConstTensor {
        name,
        shape: value.shape().to_vec(),
        data: TensorData::F32(value.iter().copied().collect()),
    }
}

/// `Reshape` of `x` to `dims`, with the target shape as an int32 constant
/// `{scope}/Const`.
fn reshape(graph: &mut Graph, scope: &str, x: String, dims: &[i32]) -> String {
    let target = graph.constant(ConstTensor {
        name: format!("{scope}/Const"),
        shape: vec![dims.len()],
        data: TensorData::I32(dims.to_vec()),
    });
    graph.op(
        &format!("{scope}/Reshape"),
        "Reshape",
        vec![x, target],
        &[("Tshape", type_attr(DType::Int32))],
    )
}

fn to_i32(function: &Function, n: usize) -> Result<i32, GraphConversionError> {
    i32::try_from(n).map_err(|_| {
        GraphConversionError::Malformed(format!(
            "`{}`: dimension {n} does not fit an int32 shape",
            function.name
        ))
    })
}

fn known_shape(function: &Function, shape: Option<&Shape>) -> Result<Shape, GraphConversionError> {
    shape.cloned().ok_or_else(|| {
        GraphConversionError::Malformed(format!("input shape of `{}` is unknown", function.name))
    })
}

/// Non-batch dimensions of `shape`, all of which must be known.
fn inner_dims(function: &Function, shape: &Shape) -> Result<Vec<i32>, GraphConversionError> {
    shape.dims()[1..]
        .iter()
        .map(|d| {
            let d = d.ok_or_else(|| {
                GraphConversionError::Malformed(format!(
                    "dense layer `{}` on input {shape} needs every non-batch dimension known",
                    function.name
                ))
            })?;
            to_i32(function, d)
        })
        .collect()
}

fn activation_op(
    graph: &mut Graph,
    scope: &str,
    function: &Function,
    activation: &str,
    x: String,
) -> Result<String, GraphConversionError> {
    let op = match activation {
        "linear" => return Ok(x),
        "relu" => "Relu",
        "relu6" => "Relu6",
        "sigmoid" => "Sigmoid",
        "tanh" => "Tanh",
        "softmax" => "Softmax",
        "elu" => "Elu",
        "selu" => "Selu",
        "softplus" => "Softplus",
        "softsign" => "Softsign",
        "swish" | "silu" => {
            let gate = graph.op(&format!("{scope}/Sigmoid"), "Sigmoid", vec![x.clone()], &[]);
            return Ok(graph.op(&format!("{scope}/mul"), "Mul", vec![x, gate], &[]));
        }
        other => {
            return Err(GraphConversionError::UnsupportedActivation {
                layer: function.name.clone(),
                activation: other.to_string(),
            });
        }
    };
    Ok(graph.op(&format!("{scope}/{op}"), op, vec![x], &[]))
}

/// Fold the batch-norm statistics into a per-feature scale and offset:
/// `y = x * gamma / sqrt(var + eps) + (beta - mean * gamma / sqrt(var + eps))`.
fn fold_batch_norm(
    saved: &SavedModel,
    function: &Function,
    epsilon: f32,
    center: bool,
    scale: bool,
) -> Result<(Array1<f32>, Array1<f32>), GraphConversionError> {
    let vector = |index: usize| -> Result<Array1<f32>, GraphConversionError> {
        saved
            .variable(function, index)?
            .clone()
            .into_dimensionality::<Ix1>()
            .map_err(|e| GraphConversionError::Malformed(format!("{}: {e}", function.name)))
    };

    let mut index = 0;
    let gamma = if scale {
        index += 1;
        Some(vector(index - 1)?)
    } else {
        None
    };
    let beta = if center {
        index += 1;
        Some(vector(index - 1)?)
    } else {
        None
    };
    let mean = vector(index)?;
    let variance = vector(index + 1)?;

    let inv_std = variance.mapv(|v| 1.0 / (v + epsilon).sqrt());
    let mul = match gamma {
        Some(gamma) => gamma * &inv_std,
        None => inv_std,
    };
    let shift = &mean * &mul;
    let add = match beta {
        Some(beta) => beta - &shift,
        None => -shift,
    };
    Ok((mul, add))
}
