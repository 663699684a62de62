//! Normalization sublayer of the feed-forward block
//!
//! RMSNorm: `x * rsqrt(mean(x^2) + eps) * weight`
//! LayerNorm: `(x - mean) * rsqrt(var + eps) * weight + bias`
//!
//! Rows are normalized independently with f32 accumulation and rounded back
//! to f16 on store.

use crate::error::{Error, Result};
use crate::model::NormKind;
use crate::nn::weight_map::WeightMap;
use half::f16;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct MlpNorm {
    kind: NormKind,
    weight: Arc<[f16]>,
    bias: Option<Arc<[f16]>>,
    eps: f32,
}

impl MlpNorm {
    pub fn new(kind: NormKind, weight: Vec<f16>, bias: Option<Vec<f16>>, eps: f32) -> Result<Self> {
        if let Some(b) = &bias {
            if b.len() != weight.len() {
                return Err(Error::ModelError {
                    reason: format!(
                        "norm bias has {} elements, weight has {}",
                        b.len(),
                        weight.len()
                    ),
                });
            }
        }
        Ok(Self {
            kind,
            weight: weight.into(),
            bias: bias.map(Into::into),
            eps,
        })
    }

    /// Load `{key}.weight` and, if present, `{key}.bias`.
    pub fn load(weights: &WeightMap, key: &str, kind: NormKind, eps: f32) -> Result<Self> {
        let weight = weights.get(&format!("{key}.weight"))?.to_f16()?;
        let bias_key = format!("{key}.bias");
        let bias = if weights.contains(&bias_key) {
            Some(weights.get(&bias_key)?.to_f16()?)
        } else {
            None
        };
        Self::new(kind, weight, bias, eps)
    }

    pub fn hidden_size(&self) -> usize {
        self.weight.len()
    }

    pub fn kind(&self) -> NormKind {
        self.kind
    }

    pub fn is_rms(&self) -> bool {
        self.kind == NormKind::RmsNorm
    }

    pub fn eps(&self) -> f32 {
        self.eps
    }

    pub fn weight(&self) -> &[f16] {
        &self.weight
    }

    pub fn bias(&self) -> Option<&[f16]> {
        self.bias.as_deref()
    }

    pub fn weight_footprint(&self) -> usize {
        (self.weight.len() + self.bias.as_ref().map_or(0, |b| b.len())) * 2
    }

    /// Normalize one row of `hidden_size` values into `out`.
    pub fn normalize_row(&self, x: &[f16], out: &mut [f16]) {
        let n = x.len() as f32;
        let (mean, denom) = match self.kind {
            NormKind::RmsNorm => {
                let sq: f32 = x.iter().map(|v| v.to_f32() * v.to_f32()).sum();
                (0.0, (sq / n + self.eps).sqrt())
            }
            NormKind::LayerNorm => {
                let mean = x.iter().map(|v| v.to_f32()).sum::<f32>() / n;
                let var = x
                    .iter()
                    .map(|v| {
                        let d = v.to_f32() - mean;
                        d * d
                    })
                    .sum::<f32>()
                    / n;
                (mean, (var + self.eps).sqrt())
            }
        };
        let inv = 1.0 / denom;

        for (i, (o, v)) in out.iter_mut().zip(x).enumerate() {
            let mut y = (v.to_f32() - mean) * inv * self.weight[i].to_f32();
            if let Some(b) = &self.bias {
                y += b[i].to_f32();
            }
            *o = f16::from_f32(y);
        }
    }

    /// Normalize every row of a row-major `[rows, hidden_size]` buffer.
    pub fn forward(&self, x: &[f16]) -> Result<Vec<f16>> {
        let h = self.hidden_size();
        if x.len() % h != 0 {
            return Err(Error::InvalidArgument {
                arg: "hidden_states",
                reason: format!("{} values is not a multiple of hidden size {h}", x.len()),
            });
        }
        let mut out = vec![f16::ZERO; x.len()];
        for (row, dst) in x.chunks_exact(h).zip(out.chunks_exact_mut(h)) {
            self.normalize_row(row, dst);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(values: &[f32]) -> Vec<f16> {
        values.iter().map(|&v| f16::from_f32(v)).collect()
    }

    #[test]
    fn test_rmsnorm_unit_weight() {
        let norm = MlpNorm::new(NormKind::RmsNorm, row(&[1.0; 4]), None, 0.0).unwrap();
        let out = norm.forward(&row(&[2.0, 2.0, 2.0, 2.0])).unwrap();
        for v in out {
            assert!((v.to_f32() - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_layernorm_centers_and_biases() {
        let norm = MlpNorm::new(
            NormKind::LayerNorm,
            row(&[1.0; 4]),
            Some(row(&[0.5; 4])),
            1e-5,
        )
        .unwrap();
        let out = norm.forward(&row(&[1.0, 2.0, 3.0, 4.0])).unwrap();
        let mean: f32 = out.iter().map(|v| v.to_f32()).sum::<f32>() / 4.0;
        assert!((mean - 0.5).abs() < 1e-3);
        assert!(out[0] < out[3]);
        assert_eq!(norm.weight_footprint(), 16);
    }

    #[test]
    fn test_ragged_input_rejected() {
        let norm = MlpNorm::new(NormKind::RmsNorm, row(&[1.0; 4]), None, 1e-5).unwrap();
        assert!(norm.forward(&row(&[1.0; 6])).is_err());
        assert!(MlpNorm::new(NormKind::LayerNorm, row(&[1.0; 4]), Some(row(&[0.0; 3])), 1e-5).is_err());
    }
}
