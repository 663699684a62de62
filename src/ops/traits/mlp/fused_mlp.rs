//! Fused feed-forward block traits
//!
//! One call runs the whole block over `rows` hidden states in place:
//!
//! ```text
//! state = norm(hidden)
//! a     = state @ gate^T        (gated blocks only)
//! b     = state @ up^T
//! a     = clamp(act(a) * b)     or act(b) without a gate
//! state = a @ down^T
//! hidden += state
//! ```
//!
//! Weights arrive as shared [`QuantMatrix`] handles; intermediate buffers are
//! the four scratch slices planned for the block. Adapters are attached per
//! linear sublayer with [`FusedMlpOps::q_mlp_set_loras`].

use crate::error::Result;
use crate::inference::scratch::ScratchSlice;
use crate::nn::lora::{AdapterId, LoraMatrix};
use crate::nn::{Activation, MlpNorm};
use crate::quant::QuantMatrix;
use half::f16;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything needed to construct a fused block
#[derive(Debug, Clone)]
pub struct QMlpDesc {
    pub norm: MlpNorm,
    /// Absent for non-gated blocks
    pub gate: Option<Arc<QuantMatrix>>,
    pub up: Arc<QuantMatrix>,
    pub down: Arc<QuantMatrix>,
    pub temp_state: ScratchSlice,
    pub temp_a: ScratchSlice,
    pub temp_b: ScratchSlice,
    pub temp_dq: ScratchSlice,
    /// Rows processed per pass over the scratch slices
    pub max_rows: usize,
    pub act: Activation,
}

/// Adapter factors of one linear sublayer, keyed by adapter
#[derive(Debug, Clone, Default)]
pub struct SublayerLoras {
    pub a: BTreeMap<AdapterId, Arc<LoraMatrix>>,
    pub b: BTreeMap<AdapterId, Arc<LoraMatrix>>,
}

impl SublayerLoras {
    pub fn is_empty(&self) -> bool {
        self.a.is_empty()
    }
}

/// Adapter factors of all three linear sublayers
#[derive(Debug, Clone, Default)]
pub struct MlpLoras {
    pub gate: SublayerLoras,
    pub up: SublayerLoras,
    pub down: SublayerLoras,
}

/// Fused MLP primitives of the native compute boundary
pub trait FusedMlpOps {
    /// Opaque per-block state owned by the caller
    type Handle;

    fn make_q_mlp(&self, desc: QMlpDesc) -> Result<Self::Handle>;

    /// Run the block over `hidden` (`[rows, hidden_size]`) in place.
    ///
    /// `lora_temp` must be provided whenever `adapters` is non-empty and hold
    /// the element count returned by the last `q_mlp_set_loras`, scaled by
    /// the row count.
    fn q_mlp_forward(
        &self,
        handle: &Self::Handle,
        hidden: &mut [f16],
        adapters: &[AdapterId],
        lora_temp: Option<&mut [f16]>,
    ) -> Result<()>;

    /// Replace the adapter factors of the block. Returns the blending buffer
    /// elements needed per row.
    fn q_mlp_set_loras(&self, handle: &mut Self::Handle, loras: MlpLoras) -> Result<usize>;

    fn free_q_mlp(&self, handle: Self::Handle);
}
