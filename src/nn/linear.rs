//! Linear sublayer of the feed-forward block
//!
//! Holds either dense f16 weights or a 4-bit grouped [`QuantMatrix`], an
//! optional bias and the LoRA factors attached per adapter. The quantized
//! matrix is shared by `Arc` with the fused MLP handle.

use crate::error::{Error, Result};
use crate::format::DeviceId;
use crate::nn::lora::{AdapterId, LoraWeights};
use crate::nn::weight::Weight;
use crate::nn::weight_map::WeightMap;
use crate::quant::{QuantMatrix, SCRATCH_PAD};
use half::f16;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const RANK_REDUCE_ITERS: usize = 12;

#[derive(Debug, Clone)]
enum LinearWeight {
    /// `[out_features, in_features]`
    Dense(Vec<f16>),
    Quant(Arc<QuantMatrix>),
}

#[derive(Debug, Clone)]
pub struct MlpLinear {
    key: String,
    in_features: usize,
    out_features: usize,
    has_bias: bool,
    device: DeviceId,
    weight: Option<LinearWeight>,
    bias: Option<Vec<f16>>,
    loras: BTreeMap<AdapterId, LoraWeights>,
}

impl MlpLinear {
    pub fn new(key: impl Into<String>, in_features: usize, out_features: usize, has_bias: bool) -> Self {
        Self {
            key: key.into(),
            in_features,
            out_features,
            has_bias,
            device: DeviceId(0),
            weight: None,
            bias: None,
            loras: BTreeMap::new(),
        }
    }

    /// Load `{key}.weight` (and `{key}.bias` when the layer has one).
    pub fn load(&mut self, weights: &WeightMap) -> Result<()> {
        let weight = weights.get(&format!("{}.weight", self.key))?;
        let bias_key = format!("{}.bias", self.key);
        let bias = if self.has_bias && weights.contains(&bias_key) {
            Some(weights.get(&bias_key)?.to_f16()?)
        } else {
            None
        };
        self.load_weight(weight, bias)
    }

    /// Install a resolved checkpoint weight, dense or quantized.
    pub fn load_weight(&mut self, weight: &Weight, bias: Option<Vec<f16>>) -> Result<()> {
        let expected = vec![self.out_features, self.in_features];
        if weight.shape() != expected {
            return Err(Error::ModelError {
                reason: format!(
                    "{}: weight shape {:?}, expected {expected:?}",
                    self.key,
                    weight.shape()
                ),
            });
        }
        match weight {
            Weight::Standard(_) => self.load_dense(weight.to_f16()?, bias),
            Weight::Quantized(q) => {
                // quantized matrices carry their bias so the fused kernel sees it
                let q = match bias {
                    Some(b) => {
                        let b: Vec<f32> = b.iter().map(|v| v.to_f32()).collect();
                        q.clone().with_bias(&b)?
                    }
                    None => q.clone(),
                };
                self.weight = Some(LinearWeight::Quant(Arc::new(q)));
                self.bias = None;
                Ok(())
            }
        }
    }

    /// Install dense row-major `[out_features, in_features]` weights.
    pub fn load_dense(&mut self, weight: Vec<f16>, bias: Option<Vec<f16>>) -> Result<()> {
        if weight.len() != self.numel() {
            return Err(Error::ModelError {
                reason: format!(
                    "{}: {} weight values, expected {}x{}",
                    self.key,
                    weight.len(),
                    self.out_features,
                    self.in_features
                ),
            });
        }
        if let Some(b) = &bias {
            if b.len() != self.out_features {
                return Err(Error::ModelError {
                    reason: format!("{}: bias has {} elements", self.key, b.len()),
                });
            }
        }
        self.weight = Some(LinearWeight::Dense(weight));
        self.bias = bias;
        Ok(())
    }

    pub fn unload(&mut self) {
        self.weight = None;
        self.bias = None;
    }

    pub fn is_loaded(&self) -> bool {
        self.weight.is_some()
    }

    pub fn is_quant(&self) -> bool {
        matches!(self.weight, Some(LinearWeight::Quant(_)))
    }

    /// Quantized matrix handle for the fused kernel
    pub fn quant(&self) -> Option<&Arc<QuantMatrix>> {
        match &self.weight {
            Some(LinearWeight::Quant(q)) => Some(q),
            _ => None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn set_device(&mut self, device: DeviceId) {
        self.device = device;
    }

    pub fn numel(&self) -> usize {
        self.in_features * self.out_features
    }

    /// Scratch bytes needed to reconstruct the full weight
    pub fn temp_dq_size(&self) -> usize {
        self.in_features * self.out_features * 2 + SCRATCH_PAD
    }

    /// Resident bytes of the loaded weight and bias
    pub fn weight_footprint(&self) -> usize {
        let weight = match &self.weight {
            Some(LinearWeight::Dense(w)) => w.len() * 2,
            Some(LinearWeight::Quant(q)) => q.footprint(),
            None => 0,
        };
        weight + self.bias.as_ref().map_or(0, |b| b.len() * 2)
    }

    /// Full-precision weight, reconstructed when quantized.
    pub fn dense_weight(&self) -> Result<Cow<'_, [f16]>> {
        match &self.weight {
            Some(LinearWeight::Dense(w)) => Ok(Cow::Borrowed(w)),
            Some(LinearWeight::Quant(q)) => Ok(Cow::Owned(q.dequantize())),
            None => Err(self.not_loaded()),
        }
    }

    pub fn bias(&self) -> Option<&[f16]> {
        match &self.weight {
            Some(LinearWeight::Quant(q)) => q.bias(),
            _ => self.bias.as_deref(),
        }
    }

    pub fn add_lora(&mut self, id: AdapterId, lora: LoraWeights) -> Result<()> {
        if lora.in_features() != self.in_features || lora.out_features() != self.out_features {
            return Err(Error::InvalidArgument {
                arg: "lora",
                reason: format!(
                    "{}: adapter maps {}->{}, layer is {}->{}",
                    self.key,
                    lora.in_features(),
                    lora.out_features(),
                    self.in_features,
                    self.out_features
                ),
            });
        }
        self.loras.insert(id, lora);
        Ok(())
    }

    pub fn remove_lora(&mut self, id: AdapterId) -> bool {
        self.loras.remove(&id).is_some()
    }

    pub fn loras(&self) -> &BTreeMap<AdapterId, LoraWeights> {
        &self.loras
    }

    /// `x @ W^T + bias` plus the contribution of every listed adapter, over a
    /// row-major `[rows, in_features]` input.
    pub fn forward(&self, x: &[f16], adapters: Option<&[AdapterId]>) -> Result<Vec<f16>> {
        if x.len() % self.in_features != 0 {
            return Err(Error::InvalidArgument {
                arg: "input",
                reason: format!(
                    "{}: {} values is not a multiple of {}",
                    self.key,
                    x.len(),
                    self.in_features
                ),
            });
        }
        let weight = self.dense_weight()?;
        let bias = self.bias();
        let active: Vec<&LoraWeights> = adapters
            .unwrap_or(&[])
            .iter()
            .filter_map(|id| self.loras.get(id))
            .collect();
        let max_rank = active.iter().map(|l| l.rank()).max().unwrap_or(0);

        let rows = x.len() / self.in_features;
        let mut out = vec![f16::ZERO; rows * self.out_features];
        let mut acc = vec![0.0f32; self.out_features];
        let mut tmp = vec![0.0f32; max_rank];

        for (row, dst) in x
            .chunks_exact(self.in_features)
            .zip(out.chunks_exact_mut(self.out_features))
        {
            matvec(&weight, row, &mut acc);
            if let Some(b) = bias {
                for (a, b) in acc.iter_mut().zip(b) {
                    *a += b.to_f32();
                }
            }
            for lora in &active {
                lora.apply_row(row, &mut tmp, &mut acc);
            }
            for (d, a) in dst.iter_mut().zip(&acc) {
                *d = f16::from_f32(*a);
            }
        }
        Ok(out)
    }

    /// Replace dense weights by their best rank-`k` approximation, with
    /// `k = ceil(fraction * min(in, out))`.
    pub fn rank_reduce(&mut self, fraction: f32) -> Result<()> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(Error::InvalidArgument {
                arg: "fraction",
                reason: format!("{fraction} not in (0, 1]"),
            });
        }
        let (m, n) = (self.out_features, self.in_features);
        let w: Vec<f32> = match &self.weight {
            Some(LinearWeight::Dense(w)) => w.iter().map(|v| v.to_f32()).collect(),
            Some(LinearWeight::Quant(_)) => {
                return Err(Error::QuantError {
                    reason: format!("{}: rank reduction needs dense weights", self.key),
                })
            }
            None => return Err(self.not_loaded()),
        };
        let k = ((m.min(n) as f32 * fraction).ceil() as usize).clamp(1, m.min(n));

        let q = dominant_subspace(&w, m, n, k);
        // W ~= (W Q) Q^T
        let mut wq = vec![0.0f32; m * k];
        for (i, w_row) in w.chunks_exact(n).enumerate() {
            for c in 0..k {
                wq[i * k + c] = (0..n).map(|j| w_row[j] * q[j * k + c]).sum();
            }
        }
        let mut reduced = vec![f16::ZERO; m * n];
        for i in 0..m {
            for j in 0..n {
                let v: f32 = (0..k).map(|c| wq[i * k + c] * q[j * k + c]).sum();
                reduced[i * n + j] = f16::from_f32(v);
            }
        }
        self.weight = Some(LinearWeight::Dense(reduced));
        debug!(key = %self.key, rank = k, "rank-reduced linear weight");
        Ok(())
    }

    fn not_loaded(&self) -> Error {
        Error::ModelError {
            reason: format!("{}: weights not loaded", self.key),
        }
    }
}

/// `acc = W x` for row-major `W: [acc.len(), x.len()]`
pub(crate) fn matvec(weight: &[f16], x: &[f16], acc: &mut [f32]) {
    for (a, w_row) in acc.iter_mut().zip(weight.chunks_exact(x.len())) {
        *a = w_row
            .iter()
            .zip(x)
            .map(|(w, v)| w.to_f32() * v.to_f32())
            .sum();
    }
}

/// Orthonormal `[n, k]` basis of the dominant right singular subspace of the
/// row-major `[m, n]` matrix `w`, by subspace iteration on `W^T W`.
fn dominant_subspace(w: &[f32], m: usize, n: usize, k: usize) -> Vec<f32> {
    let mut q: Vec<f32> = (0..n * k)
        .map(|i| ((i as f32 + 1.0) * 0.618_034).sin())
        .collect();
    orthonormalize(&mut q, n, k);

    let mut y = vec![0.0f32; m * k];
    for _ in 0..RANK_REDUCE_ITERS {
        // Y = W Q
        for i in 0..m {
            for c in 0..k {
                y[i * k + c] = (0..n).map(|j| w[i * n + j] * q[j * k + c]).sum();
            }
        }
        // Q = W^T Y
        for j in 0..n {
            for c in 0..k {
                q[j * k + c] = (0..m).map(|i| w[i * n + j] * y[i * k + c]).sum();
            }
        }
        orthonormalize(&mut q, n, k);
    }
    q
}

/// Modified Gram-Schmidt over the columns of a row-major `[n, k]` matrix.
fn orthonormalize(q: &mut [f32], n: usize, k: usize) {
    for c in 0..k {
        for p in 0..c {
            let dot: f32 = (0..n).map(|j| q[j * k + c] * q[j * k + p]).sum();
            for j in 0..n {
                q[j * k + c] -= dot * q[j * k + p];
            }
        }
        let norm = (0..n).map(|j| q[j * k + c] * q[j * k + c]).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for j in 0..n {
                q[j * k + c] /= norm;
            }
        }
    }
}
