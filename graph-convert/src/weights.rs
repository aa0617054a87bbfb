//! Weights manifest, optional affine quantization and shard splitting.

use serde::{Deserialize, Serialize};

use crate::graph::{ConstTensor, TensorData};

/// Default shard size used by tfjs converters (4 MiB).
pub const DEFAULT_SHARD_SIZE_BYTES: usize = 4 * 1024 * 1024;

/// Storage type for float weights in the shards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Quantization {
    #[default]
    None,
    Uint8,
    Uint16,
}

impl Quantization {
    fn bits(&self) -> Option<u32> {
        match self {
            Quantization::None => None,
            Quantization::Uint8 => Some(8),
            Quantization::Uint16 => Some(16),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuantizationSpec {
    pub dtype: String,
    pub min: f32,
    pub scale: f32,
    pub original_dtype: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<QuantizationSpec>,
}

/// One manifest group: the shard files and the weights packed into them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightGroup {
    pub paths: Vec<String>,
    pub weights: Vec<WeightSpec>,
}

/// Weights packed into one contiguous little-endian buffer.
#[derive(Debug, Default)]
pub struct EncodedWeights {
    pub specs: Vec<WeightSpec>,
    pub data: Vec<u8>,
}

/// Affine quantization of `values` onto `bits`-wide unsigned integers.
/// Returns the quantized values, the minimum and the scale so that
/// `value ≈ q * scale + min`.
fn quantize(values: &[f32], bits: u32) -> (Vec<u32>, f32, f32) {
    let (min, max) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let (min, max) = if values.is_empty() { (0.0, 0.0) } else { (min, max) };
    let levels = ((1u64 << bits) - 1) as f32;
    let scale = if max > min { (max - min) / levels } else { 1.0 };
    let data = values
        .iter()
        .map(|&v| ((v - min) / scale).round().clamp(0.0, levels) as u32)
        .collect();
    (data, min, scale)
}

/// Pack graph constants in order. Int32 constants are never quantized.
pub fn encode(weights: &[ConstTensor], quantization: Quantization) -> EncodedWeights {
    let mut out = EncodedWeights::default();
    for tensor in weights {
        let dtype = tensor.data.dtype().manifest_name().to_string();
        let spec = match (&tensor.data, quantization.bits()) {
            (TensorData::F32(values), Some(bits)) => {
                let (q, min, scale) = quantize(values, bits);
                let target = if bits == 8 { "uint8" } else { "uint16" };
                if bits == 8 {
                    out.data.extend(q.iter().map(|&v| v as u8));
                } else {
                    let narrow: Vec<u16> = q.iter().map(|&v| v as u16).collect();
                    out.data.extend_from_slice(bytemuck::cast_slice(&narrow));
                }
                WeightSpec {
                    name: tensor.name.clone(),
                    shape: tensor.shape.clone(),
                    dtype: dtype.clone(),
                    quantization: Some(QuantizationSpec {
                        dtype: target.to_string(),
                        min,
                        scale,
                        original_dtype: dtype,
                    }),
                }
            }
            (data, _) => {
                match data {
                    TensorData::F32(values) => out.data.extend_from_slice(bytemuck::cast_slice(values)),
                    TensorData::I32(values) => out.data.extend_from_slice(bytemuck::cast_slice(values)),
                }
                WeightSpec {
                    name: tensor.name.clone(),
                    shape: tensor.shape.clone(),
                    dtype,
                    quantization: None,
                }
            }
        };
        out.specs.push(spec);
    }
    out
}

pub fn shard_name(group: usize, index: usize, count: usize) -> String {
    format!("group{group}-shard{index}of{count}.bin")
}

/// Split `data` into shards of at most `shard_size` bytes. An empty buffer
/// still yields one (empty) shard so the manifest always has a path.
pub fn split_shards(data: &[u8], shard_size: usize) -> Vec<&[u8]> {
    if data.is_empty() {
        return vec![data];
    }
    data.chunks(shard_size.max(1)).collect()
}
