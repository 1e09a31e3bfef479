//! Transmission-time predictor models.
//!
//! One fully-connected network per lookahead horizon, loaded from the
//! sidecar files the training pipeline exports: `cpp-<i>.pt` holding the
//! layer weights as JSON, and `cpp-meta-<i>.json` holding the observation
//! mean/std used for input normalization. The forward pass is a plain
//! matmul/ReLU stack with a softmax head producing a distribution over
//! discretized sending-time buckets.

use std::path::Path;

use serde::Deserialize;

use super::AbrError;

/// Input feature dimension the models are trained with.
pub const TTP_INPUT_DIM: usize = 62;

#[derive(Debug, Deserialize)]
struct LayerSpec {
    /// Row-major `[out][in]` weight matrix.
    weights: Vec<Vec<f64>>,
    bias: Vec<f64>,
    #[serde(default)]
    activation: Activation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
enum Activation {
    Relu,
    #[default]
    Linear,
}

#[derive(Debug, Deserialize)]
struct ModelSpec {
    layers: Vec<LayerSpec>,
}

#[derive(Debug, Deserialize)]
struct MetaSpec {
    obs_mean: Vec<f64>,
    obs_std: Vec<f64>,
}

/// A loaded per-horizon predictor.
pub struct TtpModel {
    layers: Vec<LayerSpec>,
    obs_mean: Vec<f64>,
    obs_std: Vec<f64>,
}

impl TtpModel {
    /// Loads one horizon's model plus its normalization sidecar.
    pub fn load(model_path: &Path, meta_path: &Path) -> Result<Self, AbrError> {
        let model_err = |e: String| {
            AbrError::Model(format!("{}: {e}", model_path.display()))
        };

        let model_raw = std::fs::read(model_path).map_err(|e| model_err(e.to_string()))?;
        let spec: ModelSpec =
            serde_json::from_slice(&model_raw).map_err(|e| model_err(e.to_string()))?;

        let meta_raw = std::fs::read(meta_path)
            .map_err(|e| AbrError::Model(format!("{}: {e}", meta_path.display())))?;
        let meta: MetaSpec = serde_json::from_slice(&meta_raw)
            .map_err(|e| AbrError::Model(format!("{}: {e}", meta_path.display())))?;

        let model = Self {
            layers: spec.layers,
            obs_mean: meta.obs_mean,
            obs_std: meta.obs_std,
        };
        model.validate().map_err(model_err)?;
        Ok(model)
    }

    fn validate(&self) -> Result<(), String> {
        if self.obs_mean.len() != TTP_INPUT_DIM || self.obs_std.len() != TTP_INPUT_DIM {
            return Err(format!(
                "obs_mean/obs_std must have length {TTP_INPUT_DIM}, got {}/{}",
                self.obs_mean.len(),
                self.obs_std.len()
            ));
        }
        if self.layers.is_empty() {
            return Err("model has no layers".to_string());
        }

        let mut dim = TTP_INPUT_DIM;
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.weights.is_empty() {
                return Err(format!("layer {i} has no rows"));
            }
            for row in &layer.weights {
                if row.len() != dim {
                    return Err(format!(
                        "layer {i} expects input dim {dim}, weight row has {}",
                        row.len()
                    ));
                }
            }
            if layer.bias.len() != layer.weights.len() {
                return Err(format!(
                    "layer {i} bias length {} != rows {}",
                    layer.bias.len(),
                    layer.weights.len()
                ));
            }
            dim = layer.weights.len();
        }
        Ok(())
    }

    /// Output dimension, i.e. the number of sending-time buckets.
    pub fn output_dim(&self) -> usize {
        self.layers.last().map_or(0, |l| l.weights.len())
    }

    /// Normalizes the raw feature vector and runs the forward pass,
    /// returning a probability distribution via softmax.
    pub fn predict_pmf(&self, input: &[f64]) -> Result<Vec<f64>, AbrError> {
        if input.len() != TTP_INPUT_DIM {
            return Err(AbrError::Model(format!(
                "input has {} features, expected {TTP_INPUT_DIM}",
                input.len()
            )));
        }

        let mut x: Vec<f64> = input
            .iter()
            .zip(self.obs_mean.iter().zip(&self.obs_std))
            .map(|(&v, (&mean, &std))| {
                let centered = v - mean;
                if std != 0.0 {
                    centered / std
                } else {
                    centered
                }
            })
            .collect();

        for layer in &self.layers {
            let mut next = Vec::with_capacity(layer.weights.len());
            for (row, &bias) in layer.weights.iter().zip(&layer.bias) {
                let mut acc = bias;
                for (&w, &v) in row.iter().zip(&x) {
                    acc += w * v;
                }
                if layer.activation == Activation::Relu {
                    acc = acc.max(0.0);
                }
                next.push(acc);
            }
            x = next;
        }

        Ok(softmax(&x))
    }
}

/// Numerically stable softmax.
fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.iter().map(|&e| e / sum).collect()
}
