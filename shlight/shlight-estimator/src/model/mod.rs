//! Inference-time model description: fixed input shape, ordered layer list, 27-float output.
//! Each layer is one schedulable unit of work for a backend.

mod builtin;

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EstimatorError, Result};
use crate::sh::COEFFICIENT_COUNT;

/// Shape of one activation, batch of 1 implied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl TensorShape {
    pub const fn new(channels: usize, height: usize, width: usize) -> Self {
        Self { channels, height, width }
    }

    pub fn len(&self) -> usize {
        self.channels * self.height * self.width
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn one() -> usize {
    1
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Layer {
    /// Square-kernel convolution with zero padding. Weights `[out][in][k][k]`.
    Conv2d {
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        #[serde(default = "one")]
        stride: usize,
        #[serde(default)]
        padding: usize,
        weights: Vec<f32>,
        /// Empty means zero bias.
        #[serde(default)]
        bias: Vec<f32>,
    },
    /// Inference-time batch norm folded into a per-channel affine.
    BatchNorm { scale: Vec<f32>, shift: Vec<f32> },
    Relu,
    /// Padded cells never win the max.
    MaxPool2d {
        kernel: usize,
        #[serde(default = "one")]
        stride: usize,
        #[serde(default)]
        padding: usize,
    },
    /// Unpadded average pool with `[height, width]` kernel and stride.
    AvgPool2d { kernel: [usize; 2], stride: [usize; 2] },
    GlobalAvgPool,
    /// Fully connected over the flattened CHW input. Weights `[out][in]`.
    Linear {
        in_features: usize,
        out_features: usize,
        weights: Vec<f32>,
        #[serde(default)]
        bias: Vec<f32>,
    },
}

impl Layer {
    pub fn name(&self) -> &'static str {
        match self {
            Layer::Conv2d { .. } => "conv2d",
            Layer::BatchNorm { .. } => "batch_norm",
            Layer::Relu => "relu",
            Layer::MaxPool2d { .. } => "max_pool2d",
            Layer::AvgPool2d { .. } => "avg_pool2d",
            Layer::GlobalAvgPool => "global_avg_pool",
            Layer::Linear { .. } => "linear",
        }
    }

    /// Output shape for `input`, checking weight sizes along the way.
    pub fn output_shape(&self, input: TensorShape) -> Result<TensorShape> {
        let err = |msg: String| Err(EstimatorError::Model(format!("{}: {msg}", self.name())));
        match self {
            Layer::Conv2d { in_channels, out_channels, kernel, stride, padding, weights, bias } => {
                if *in_channels != input.channels {
                    return err(format!(
                        "expects {in_channels} input channels, got {}",
                        input.channels
                    ));
                }
                if *kernel == 0 || *stride == 0 {
                    return err("kernel and stride must be non-zero".to_string());
                }
                let expected = out_channels * in_channels * kernel * kernel;
                if weights.len() != expected {
                    return err(format!("has {} weights, expected {expected}", weights.len()));
                }
                if !bias.is_empty() && bias.len() != *out_channels {
                    return err(format!("has {} biases, expected {out_channels}", bias.len()));
                }
                let (h, w) = (input.height + 2 * padding, input.width + 2 * padding);
                if h < *kernel || w < *kernel {
                    return err(format!("kernel {kernel} larger than padded input {h}x{w}"));
                }
                Ok(TensorShape::new(
                    *out_channels,
                    (h - kernel) / stride + 1,
                    (w - kernel) / stride + 1,
                ))
            }
            Layer::BatchNorm { scale, shift } => {
                if scale.len() != input.channels || shift.len() != input.channels {
                    return err(format!(
                        "has {}/{} scale/shift values for {} channels",
                        scale.len(),
                        shift.len(),
                        input.channels
                    ));
                }
                Ok(input)
            }
            Layer::Relu => Ok(input),
            Layer::MaxPool2d { kernel, stride, padding } => {
                if *kernel == 0 || *stride == 0 {
                    return err("kernel and stride must be non-zero".to_string());
                }
                if *padding >= *kernel {
                    return err(format!("padding {padding} must be smaller than kernel {kernel}"));
                }
                let (h, w) = (input.height + 2 * padding, input.width + 2 * padding);
                if h < *kernel || w < *kernel {
                    return err(format!("kernel {kernel} larger than padded input {h}x{w}"));
                }
                Ok(TensorShape::new(
                    input.channels,
                    (h - kernel) / stride + 1,
                    (w - kernel) / stride + 1,
                ))
            }
            Layer::AvgPool2d { kernel, stride } => {
                if kernel.contains(&0) || stride.contains(&0) {
                    return err("kernel and stride must be non-zero".to_string());
                }
                if input.height < kernel[0] || input.width < kernel[1] {
                    return err(format!(
                        "kernel {}x{} larger than input {}x{}",
                        kernel[0], kernel[1], input.height, input.width
                    ));
                }
                Ok(TensorShape::new(
                    input.channels,
                    (input.height - kernel[0]) / stride[0] + 1,
                    (input.width - kernel[1]) / stride[1] + 1,
                ))
            }
            Layer::GlobalAvgPool => Ok(TensorShape::new(input.channels, 1, 1)),
            Layer::Linear { in_features, out_features, weights, bias } => {
                if *in_features != input.len() {
                    return err(format!("expects {in_features} inputs, got {}", input.len()));
                }
                if weights.len() != in_features * out_features {
                    return err(format!(
                        "has {} weights, expected {}",
                        weights.len(),
                        in_features * out_features
                    ));
                }
                if !bias.is_empty() && bias.len() != *out_features {
                    return err(format!("has {} biases, expected {out_features}", bias.len()));
                }
                Ok(TensorShape::new(*out_features, 1, 1))
            }
        }
    }
}

fn infer_shapes(input: TensorShape, layers: &[Layer]) -> Result<Vec<TensorShape>> {
    let mut shapes = Vec::with_capacity(layers.len());
    let mut shape = input;
    for (i, layer) in layers.iter().enumerate() {
        shape = layer.output_shape(shape).map_err(|e| match e {
            EstimatorError::Model(msg) => EstimatorError::Model(format!("layer {i}: {msg}")),
            other => other,
        })?;
        shapes.push(shape);
    }
    if shape.len() != COEFFICIENT_COUNT {
        return Err(EstimatorError::Model(format!(
            "model produces {} values, expected {COEFFICIENT_COUNT}",
            shape.len()
        )));
    }
    Ok(shapes)
}

/// Validated model: every layer's output shape is known and the final output has 27 values.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Model {
    input: TensorShape,
    layers: Vec<Layer>,
    #[serde(skip)]
    shapes: Vec<TensorShape>,
}

#[derive(Deserialize)]
struct ModelFile {
    input: TensorShape,
    layers: Vec<Layer>,
}

impl Model {
    pub fn new(input: TensorShape, layers: Vec<Layer>) -> Result<Self> {
        if input.channels != 3 || input.is_empty() {
            return Err(EstimatorError::Model(format!(
                "input must be 3 x H x W with H, W > 0, got {input:?}"
            )));
        }
        if layers.is_empty() {
            return Err(EstimatorError::Model("model has no layers".to_string()));
        }
        let shapes = infer_shapes(input, &layers)?;
        Ok(Self { input, layers, shapes })
    }

    /// Re-run shape inference over the layer list.
    pub fn validate(&self) -> Result<()> {
        infer_shapes(self.input, &self.layers).map(|_| ())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: ModelFile = serde_json::from_str(json)?;
        Self::new(file.input, file.layers)
    }

    /// Load a model asset. A missing file is a misconfiguration.
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|source| EstimatorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn input_shape(&self) -> TensorShape {
        self.input
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Output shape of layer `index`.
    pub fn shape_after(&self, index: usize) -> TensorShape {
        self.shapes[index]
    }

    /// Input shape of layer `index`.
    pub fn shape_before(&self, index: usize) -> TensorShape {
        if index == 0 { self.input } else { self.shapes[index - 1] }
    }

    pub fn output_len(&self) -> usize {
        COEFFICIENT_COUNT
    }

    /// Units of schedulable work in one forward pass.
    pub fn unit_count(&self) -> usize {
        self.layers.len()
    }

    /// Largest activation, in floats.
    pub fn max_activation_len(&self) -> usize {
        self.shapes.iter().map(TensorShape::len).max().unwrap_or(0).max(self.input.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_model_json() -> String {
        let weights: Vec<f32> = vec![0.0; 27 * 3];
        format!(
            r#"{{
                "input": {{ "channels": 3, "height": 8, "width": 8 }},
                "layers": [
                    {{ "op": "max_pool2d", "kernel": 3, "stride": 2, "padding": 1 }},
                    {{ "op": "relu" }},
                    {{ "op": "global_avg_pool" }},
                    {{
                        "op": "linear", "in_features": 3, "out_features": 27,
                        "weights": {weights:?}
                    }}
                ]
            }}"#
        )
    }

    #[test]
    fn json_model_shapes() {
        let model = Model::from_json(&tiny_model_json()).unwrap();
        assert_eq!(model.unit_count(), 4);
        assert_eq!(model.shape_after(0), TensorShape::new(3, 4, 4));
        assert_eq!(model.shape_before(3), TensorShape::new(3, 1, 1));
        assert_eq!(model.max_activation_len(), 3 * 64);
    }

    #[test]
    fn conv_shape_follows_padding_and_stride() {
        let conv = Layer::Conv2d {
            in_channels: 3,
            out_channels: 8,
            kernel: 3,
            stride: 2,
            padding: 1,
            weights: vec![0.0; 8 * 3 * 9],
            bias: vec![],
        };
        assert_eq!(
            conv.output_shape(TensorShape::new(3, 512, 640)).unwrap(),
            TensorShape::new(8, 256, 320)
        );
        assert!(conv.output_shape(TensorShape::new(4, 8, 8)).is_err());
    }

    #[test]
    fn wrong_output_size_is_rejected() {
        let err = Model::new(TensorShape::new(3, 4, 4), vec![Layer::GlobalAvgPool]).unwrap_err();
        assert!(matches!(err, EstimatorError::Model(_)));
    }

    #[test]
    fn missing_weights_are_rejected() {
        let layers = vec![
            Layer::GlobalAvgPool,
            Layer::Linear {
                in_features: 3,
                out_features: 27,
                weights: vec![0.0; 10],
                bias: vec![],
            },
        ];
        let err = Model::new(TensorShape::new(3, 4, 4), layers).unwrap_err().to_string();
        assert!(err.contains("layer 1"), "{err}");
    }

    #[test]
    fn serializes_back_to_loadable_json() {
        let model = Model::from_json(&tiny_model_json()).unwrap();
        let again = Model::from_json(&model.to_json().unwrap()).unwrap();
        assert_eq!(again, model);
    }
}
