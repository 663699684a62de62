//! Feed-forward block with a fused quantized fast path
//!
//! [`FusedMlp`] owns the norm and the gate/up/down sublayers of one decoder
//! layer. When every linear sublayer is quantized, `load` builds a native
//! handle bound to the device scratch and `forward` runs the whole block in
//! one call. Otherwise, or when intermediates are requested, the block runs
//! through the reference path:
//!
//! ```text
//! post_norm = norm(x)
//! pre_down  = clamp(act(post_norm @ gate^T) * (post_norm @ up^T))   gated
//!           = act(post_norm @ up^T)                                 ungated
//! x         = x + pre_down @ down^T
//! ```

pub mod adapters;
pub mod scratch_plan;

pub use adapters::AdapterComposer;
pub use scratch_plan::{ScratchDims, ScratchPlan};

use crate::error::{Error, Result};
use crate::format::DeviceId;
use crate::inference::scratch::DeviceScratch;
use crate::model::{ArchConfig, ModelConfig};
use crate::nn::linear::MlpLinear;
use crate::nn::lora::{AdapterId, LoraWeights};
use crate::nn::norm::MlpNorm;
use crate::nn::weight_map::WeightMap;
use crate::ops::traits::{FusedMlpOps, QMlpDesc};
use half::f16;
use numr::runtime::cpu::{CpuClient, CpuRuntime};
use numr::tensor::Tensor;
use std::sync::Arc;
use tracing::{debug, info};

const F16_LIMIT: f32 = 65504.0;

/// Reference-path activations
#[derive(Debug, Clone)]
pub struct MlpIntermediates {
    pub post_norm: Vec<f16>,
    pub pre_down: Vec<f16>,
    pub hidden_states: Vec<f16>,
}

/// Adapter factors for the linear sublayers of one block
#[derive(Debug, Clone, Default)]
pub struct MlpAdapter {
    pub gate: Option<LoraWeights>,
    pub up: Option<LoraWeights>,
    pub down: Option<LoraWeights>,
}

pub struct FusedMlp<K: FusedMlpOps = CpuClient> {
    client: Arc<K>,
    key: String,
    layer_idx: usize,
    dims: ScratchDims,
    arch: ArchConfig,
    device: DeviceId,
    norm: Option<MlpNorm>,
    gate: Option<MlpLinear>,
    up: MlpLinear,
    down: MlpLinear,
    handle: Option<K::Handle>,
    composer: AdapterComposer,
}

impl<K: FusedMlpOps> FusedMlp<K> {
    /// Unloaded block for the layer whose checkpoint keys start with `key`.
    pub fn new(client: Arc<K>, config: &ModelConfig, key: impl Into<String>, layer_idx: usize) -> Self {
        let key = key.into();
        let arch = config.arch.clone();
        let (h, i) = (config.hidden_size, config.intermediate_size);
        let gate = arch
            .mlp_gate
            .then(|| MlpLinear::new(format!("{key}{}", arch.mlp_key_gate), h, i, arch.mlp_bias));
        let up = MlpLinear::new(format!("{key}{}", arch.mlp_key_up), h, i, arch.mlp_bias);
        let down = MlpLinear::new(format!("{key}{}", arch.mlp_key_down), i, h, arch.mlp_bias);
        Self {
            client,
            key,
            layer_idx,
            dims: ScratchDims::from_config(config),
            arch,
            device: DeviceId(0),
            norm: None,
            gate,
            up,
            down,
            handle: None,
            composer: AdapterComposer::default(),
        }
    }

    /// Load the norm and linear sublayers, then build the fused handle when
    /// all linear sublayers are quantized. A failed load leaves the block
    /// unloaded.
    pub fn load(&mut self, weights: &WeightMap, scratch: &mut DeviceScratch) -> Result<()> {
        self.unload();
        let result = self.load_inner(weights, scratch);
        if result.is_err() {
            self.unload();
        }
        result
    }

    fn load_inner(&mut self, weights: &WeightMap, scratch: &mut DeviceScratch) -> Result<()> {
        let norm_key = format!("{}{}", self.key, self.arch.norm_key_2);
        self.norm = Some(MlpNorm::load(
            weights,
            &norm_key,
            self.arch.norm,
            self.arch.norm_eps,
        )?);

        if self.arch.checkpoint_fused_mlp {
            self.load_fused_checkpoint(weights)?;
        } else {
            if let Some(gate) = &mut self.gate {
                gate.load(weights)?;
            }
            self.up.load(weights)?;
            self.down.load(weights)?;
        }

        let flags: Vec<bool> = self.linears().map(MlpLinear::is_quant).collect();
        let all_quant = flags.iter().all(|&q| q);
        if !all_quant && flags.iter().any(|&q| q) {
            return Err(Error::PartiallyQuantized {
                key: self.key.clone(),
            });
        }

        if all_quant {
            self.build_handle(scratch)?;
            info!(key = %self.key, layer = self.layer_idx, device = %self.device, "loaded MLP, fused path");
        } else {
            info!(key = %self.key, layer = self.layer_idx, "loaded MLP, reference path");
        }
        Ok(())
    }

    /// Split a concatenated `[2 * I, H]` gate/up tensor by rows.
    fn load_fused_checkpoint(&mut self, weights: &WeightMap) -> Result<()> {
        let (h, i) = (self.dims.hidden_size, self.dims.intermediate_size);
        let w12_key = format!("{}{}.weight", self.key, self.arch.fused_mlp_key_12);
        let w12 = weights.get(&w12_key)?;
        if w12.shape() != [2 * i, h] {
            return Err(Error::ModelError {
                reason: format!("{w12_key}: shape {:?}, expected [{}, {h}]", w12.shape(), 2 * i),
            });
        }
        let mut w1 = w12.to_f16()?;
        let w2 = w1.split_off(i * h);

        let gate = self.gate.as_mut().ok_or_else(|| Error::ModelError {
            reason: "fused MLP checkpoint on a block without a gate".into(),
        })?;
        gate.load_dense(w1, None)?;
        self.up.load_dense(w2, None)?;

        let w3 = weights.get(&format!("{}{}.weight", self.key, self.arch.fused_mlp_key_3))?;
        self.down.load_weight(w3, None)
    }

    fn build_handle(&mut self, scratch: &mut DeviceScratch) -> Result<()> {
        if scratch.device() != self.device {
            return Err(Error::InvalidArgument {
                arg: "scratch",
                reason: format!("scratch is on {}, block is on {}", scratch.device(), self.device),
            });
        }
        let plan = self.scratch_plan()?;
        let missing = || Error::ModelError {
            reason: "quantized sublayer without a matrix".into(),
        };
        let norm = self.norm.clone().ok_or_else(missing)?;
        let gate = match &self.gate {
            Some(g) => Some(g.quant().cloned().ok_or_else(missing)?),
            None => None,
        };
        let up = self.up.quant().cloned().ok_or_else(missing)?;
        let down = self.down.quant().cloned().ok_or_else(missing)?;

        scratch.begin_alloc();
        let desc = QMlpDesc {
            norm,
            gate,
            up,
            down,
            temp_state: scratch.slice(plan.state)?,
            temp_a: scratch.slice(plan.act_a)?,
            temp_b: scratch.slice(plan.act_b)?,
            temp_dq: scratch.slice(plan.dq)?,
            max_rows: self.dims.max_rows(),
            act: self.arch.mlp_act_func,
        };
        self.handle = Some(self.client.make_q_mlp(desc)?);
        let no_adapters = self.linears().all(|l| l.loras().is_empty());
        self.composer.reset(no_adapters);
        Ok(())
    }

    /// Free the fused handle, then the sublayer weights.
    pub fn unload(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.client.free_q_mlp(handle);
            debug!(key = %self.key, "freed fused MLP handle");
        }
        self.norm = None;
        if let Some(gate) = &mut self.gate {
            gate.unload();
        }
        self.up.unload();
        self.down.unload();
    }

    fn linears(&self) -> impl Iterator<Item = &MlpLinear> {
        self.gate.iter().chain([&self.up, &self.down])
    }

    /// Whether the fused handle exists
    pub fn is_quant(&self) -> bool {
        self.handle.is_some()
    }

    pub fn is_loaded(&self) -> bool {
        self.norm.is_some()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Place the block on `device`. Takes effect at the next `load`.
    pub fn set_device_idx(&mut self, device: DeviceId) {
        self.device = device;
        if let Some(gate) = &mut self.gate {
            gate.set_device(device);
        }
        self.up.set_device(device);
        self.down.set_device(device);
    }

    pub fn numel(&self) -> usize {
        self.linears().map(MlpLinear::numel).sum()
    }

    pub fn weight_footprint(&self) -> usize {
        let norm = self.norm.as_ref().map_or(0, MlpNorm::weight_footprint);
        if self.arch.checkpoint_fused_mlp {
            norm + 3 * self.dims.intermediate_size * self.dims.hidden_size * 2
        } else {
            norm + self.linears().map(MlpLinear::weight_footprint).sum::<usize>()
        }
    }

    fn dq_sizes(&self) -> Vec<usize> {
        self.linears().map(MlpLinear::temp_dq_size).collect()
    }

    /// Scratch plan, requiring `intermediate_size >= hidden_size`
    pub fn scratch_plan(&self) -> Result<ScratchPlan> {
        ScratchPlan::checked(self.dims, &self.dq_sizes())
    }

    pub fn scratch_space(&self) -> Result<usize> {
        Ok(self.scratch_plan()?.total())
    }

    pub fn scratch_space_fixed(&self) -> usize {
        ScratchPlan::fixed(self.dims, &self.dq_sizes()).total()
    }

    pub fn temp_lora_size(&self) -> usize {
        self.composer.temp_lora_size()
    }

    /// Attach adapter factors. Call `update_loras` before the next fused forward.
    pub fn attach_adapter(&mut self, id: AdapterId, adapter: MlpAdapter) -> Result<()> {
        match (&mut self.gate, adapter.gate) {
            (Some(gate), Some(lora)) => gate.add_lora(id, lora)?,
            (None, Some(_)) => {
                return Err(Error::InvalidArgument {
                    arg: "adapter",
                    reason: format!("{}: gate factors for a block without a gate", self.key),
                })
            }
            _ => {}
        }
        if let Some(lora) = adapter.up {
            self.up.add_lora(id, lora)?;
        }
        if let Some(lora) = adapter.down {
            self.down.add_lora(id, lora)?;
        }
        self.composer.mark_changed();
        Ok(())
    }

    pub fn detach_adapter(&mut self, id: AdapterId) -> bool {
        let mut removed = false;
        if let Some(gate) = &mut self.gate {
            removed |= gate.remove_lora(id);
        }
        removed |= self.up.remove_lora(id);
        removed |= self.down.remove_lora(id);
        if removed {
            self.composer.mark_changed();
        }
        removed
    }

    /// Upload the attached adapters to the fused handle. No-op without one.
    pub fn update_loras(&mut self) -> Result<()> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(());
        };
        self.composer.update(
            self.client.as_ref(),
            handle,
            self.gate.as_ref(),
            &self.up,
            &self.down,
            self.dims.max_rows(),
        )?;
        Ok(())
    }

    /// Whether adapters changed since the fused handle last saw them
    pub fn adapters_stale(&self) -> bool {
        self.handle.is_some() && self.composer.is_stale()
    }

    /// Run the block over a `[..., hidden_size]` tensor.
    pub fn forward(
        &self,
        hidden_states: &Tensor<CpuRuntime>,
        adapters: Option<&[AdapterId]>,
    ) -> Result<Tensor<CpuRuntime>> {
        let mut hidden: Vec<f16> = hidden_states
            .to_vec::<f32>()
            .into_iter()
            .map(f16::from_f32)
            .collect();
        self.forward_f16(&mut hidden, adapters)?;
        let out: Vec<f32> = hidden.iter().map(|v| v.to_f32()).collect();
        Ok(Tensor::<CpuRuntime>::from_slice(
            &out,
            hidden_states.shape(),
            hidden_states.device(),
        ))
    }

    /// Run the block in place over row-major `[rows, hidden_size]` values.
    pub fn forward_f16(&self, hidden: &mut [f16], adapters: Option<&[AdapterId]>) -> Result<()> {
        let Some(handle) = &self.handle else {
            let out = self.forward_reference(hidden, adapters)?;
            hidden.copy_from_slice(&out.hidden_states);
            return Ok(());
        };

        let temp_size = self.composer.temp_lora_size();
        let ids: &[AdapterId] = match adapters {
            Some(ids) if temp_size > 0 => ids,
            _ => &[],
        };
        let mut lora_temp = (!ids.is_empty()).then(|| vec![f16::ZERO; temp_size]);
        self.client
            .q_mlp_forward(handle, hidden, ids, lora_temp.as_deref_mut())
    }

    /// Reference path with its intermediate activations.
    pub fn forward_intermediates(
        &self,
        hidden: &[f16],
        adapters: Option<&[AdapterId]>,
    ) -> Result<MlpIntermediates> {
        self.forward_reference(hidden, adapters)
    }

    fn forward_reference(
        &self,
        hidden: &[f16],
        adapters: Option<&[AdapterId]>,
    ) -> Result<MlpIntermediates> {
        let norm = self.norm.as_ref().ok_or_else(|| Error::ModelError {
            reason: format!("{}: MLP not loaded", self.key),
        })?;
        let act = self.arch.mlp_act_func;

        let post_norm = norm.forward(hidden)?;
        let up = self.up.forward(&post_norm, adapters)?;
        let pre_down: Vec<f16> = match &self.gate {
            Some(gate) => gate
                .forward(&post_norm, adapters)?
                .iter()
                .zip(&up)
                .map(|(g, u)| {
                    let y = act.apply(g.to_f32()) * u.to_f32();
                    f16::from_f32(y.clamp(-F16_LIMIT, F16_LIMIT))
                })
                .collect(),
            None => up.iter().map(|u| f16::from_f32(act.apply(u.to_f32()))).collect(),
        };
        let down = self.down.forward(&pre_down, adapters)?;
        let hidden_states = hidden
            .iter()
            .zip(&down)
            .map(|(x, d)| f16::from_f32(x.to_f32() + d.to_f32()))
            .collect();

        Ok(MlpIntermediates {
            post_norm,
            pre_down,
            hidden_states,
        })
    }

    /// Replace dense sublayer weights by low-rank approximations.
    pub fn rank_reduce(&mut self, fraction: f32) -> Result<()> {
        if self.handle.is_some() {
            return Err(Error::QuantError {
                reason: format!("{}: cannot rank-reduce a quantized block", self.key),
            });
        }
        if let Some(gate) = &mut self.gate {
            gate.rank_reduce(fraction)?;
        }
        self.up.rank_reduce(fraction)?;
        self.down.rank_reduce(fraction)?;
        info!(key = %self.key, fraction, "rank-reduced MLP");
        Ok(())
    }
}

impl<K: FusedMlpOps> Drop for FusedMlp<K> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.client.free_q_mlp(handle);
        }
    }
}
