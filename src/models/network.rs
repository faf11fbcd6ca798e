//! Dense feed-forward classifier evaluated in-process.
//!
//! The weights come from an external optimizer and are exported layer by
//! layer. Dense weights are stored one row per output unit. Batch
//! normalization layers carry their moving statistics and are evaluated in
//! inference mode.

use crate::error::InferenceError;
use serde::{Deserialize, Serialize};

fn default_epsilon() -> f64 {
    1e-3
}

/// Activation applied after a dense layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
    Softmax,
}

/// One network layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Layer {
    Dense {
        weights: Vec<Vec<f64>>,
        bias: Vec<f64>,
        #[serde(default)]
        activation: Activation,
    },
    BatchNorm {
        gamma: Vec<f64>,
        beta: Vec<f64>,
        moving_mean: Vec<f64>,
        moving_variance: Vec<f64>,
        #[serde(default = "default_epsilon")]
        epsilon: f64,
    },
}

impl Layer {
    /// Width of the layer output, given its input width
    fn output_width(&self, input: usize) -> usize {
        match self {
            Layer::Dense { bias, .. } => bias.len(),
            Layer::BatchNorm { .. } => input,
        }
    }

    fn check(&self, index: usize, input: usize) -> Result<(), String> {
        let finite = |values: &[f64]| values.iter().all(|v| v.is_finite());

        match self {
            Layer::Dense { weights, bias, .. } => {
                if weights.is_empty() || weights.len() != bias.len() {
                    return Err(format!(
                        "layer {index}: {} weight rows for {} biases",
                        weights.len(),
                        bias.len()
                    ));
                }
                if let Some(row) = weights.iter().find(|row| row.len() != input) {
                    return Err(format!(
                        "layer {index}: weight row has {} inputs, expected {input}",
                        row.len()
                    ));
                }
                if !weights.iter().all(|row| finite(row)) || !finite(bias) {
                    return Err(format!("layer {index}: non-finite weights"));
                }
            }
            Layer::BatchNorm {
                gamma,
                beta,
                moving_mean,
                moving_variance,
                epsilon,
            } => {
                let params = [gamma, beta, moving_mean, moving_variance];
                if params.iter().any(|p| p.len() != input) {
                    return Err(format!(
                        "layer {index}: batch norm parameters must all have width {input}"
                    ));
                }
                if !params.iter().all(|p| finite(p)) || !epsilon.is_finite() {
                    return Err(format!("layer {index}: non-finite batch norm parameters"));
                }
                if moving_variance.iter().any(|v| v + epsilon <= 0.0) {
                    return Err(format!("layer {index}: non-positive variance"));
                }
            }
        }
        Ok(())
    }

    fn forward(&self, input: &[f64]) -> Vec<f64> {
        match self {
            Layer::Dense {
                weights,
                bias,
                activation,
            } => {
                let linear: Vec<f64> = weights
                    .iter()
                    .zip(bias)
                    .map(|(row, b)| row.iter().zip(input).map(|(w, x)| w * x).sum::<f64>() + b)
                    .collect();
                activate(*activation, linear)
            }
            Layer::BatchNorm {
                gamma,
                beta,
                moving_mean,
                moving_variance,
                epsilon,
            } => input
                .iter()
                .enumerate()
                .map(|(i, x)| {
                    gamma[i] * (x - moving_mean[i]) / (moving_variance[i] + epsilon).sqrt()
                        + beta[i]
                })
                .collect(),
        }
    }
}

fn activate(activation: Activation, values: Vec<f64>) -> Vec<f64> {
    match activation {
        Activation::Linear => values,
        Activation::Relu => values.into_iter().map(|v| v.max(0.0)).collect(),
        Activation::Softmax => softmax(&values),
    }
}

/// Numerically stable softmax
pub fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Stack of layers ending in a softmax dense layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseNetwork {
    input_width: usize,
    layers: Vec<Layer>,
}

impl DenseNetwork {
    /// Build a network, checking that layer shapes chain together.
    pub fn new(input_width: usize, layers: Vec<Layer>) -> Result<Self, String> {
        let network = Self {
            input_width,
            layers,
        };
        network.validate()?;
        Ok(network)
    }

    pub fn input_width(&self) -> usize {
        self.input_width
    }

    pub fn output_width(&self) -> usize {
        self.layers
            .iter()
            .fold(self.input_width, |width, layer| layer.output_width(width))
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Shape and value checks run once at load time.
    pub fn validate(&self) -> Result<(), String> {
        if self.input_width == 0 {
            return Err("network input width is zero".to_string());
        }

        let mut width = self.input_width;
        for (index, layer) in self.layers.iter().enumerate() {
            layer.check(index, width)?;
            width = layer.output_width(width);
        }

        match self.layers.last() {
            Some(Layer::Dense {
                activation: Activation::Softmax,
                ..
            }) => Ok(()),
            _ => Err("network must end in a dense softmax layer".to_string()),
        }
    }

    /// Forward pass for one input row.
    pub fn forward(&self, input: &[f64]) -> Result<Vec<f64>, InferenceError> {
        if input.len() != self.input_width {
            return Err(InferenceError::ShapeMismatch {
                expected: self.input_width,
                actual: input.len(),
            });
        }

        let output = self
            .layers
            .iter()
            .fold(input.to_vec(), |activations, layer| layer.forward(&activations));

        if let Some(index) = output.iter().position(|v| !v.is_finite()) {
            return Err(InferenceError::NonFinite { index });
        }
        Ok(output)
    }
}
