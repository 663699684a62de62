//! Scratch budget of the fused MLP kernel
//!
//! Four regions, all in bytes and all padded by [`SCRATCH_PAD`]:
//!
//! | region  | size                         |
//! |---------|------------------------------|
//! | state   | `L * B * H * 2 + 128`        |
//! | act_a   | `L * B * I * 2 + 128`        |
//! | act_b   | `L * B * I * 2 + 128`        |
//! | dq      | max sublayer `temp_dq_size`  |
//!
//! with `L` = max input length, `B` = max batch, `H` = hidden size and
//! `I` = intermediate size. The activation regions are reused for hidden-width
//! state, which is only sound when `I >= H`.
//!
//! Each region is carved as its own aligned scratch slice, so the total a
//! region must provide rounds every region up to [`crate::inference::SCRATCH_ALIGN`] first.

use crate::error::{Error, Result};
use crate::inference::scratch::align_up;
use crate::model::ModelConfig;
use crate::quant::SCRATCH_PAD;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchDims {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub max_input_len: usize,
    pub max_batch_size: usize,
}

impl ScratchDims {
    pub fn from_config(config: &ModelConfig) -> Self {
        Self {
            hidden_size: config.hidden_size,
            intermediate_size: config.intermediate_size,
            max_input_len: config.max_input_len,
            max_batch_size: config.max_batch_size,
        }
    }

    pub fn max_rows(&self) -> usize {
        self.max_input_len * self.max_batch_size
    }
}

/// Byte sizes of the four scratch regions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchPlan {
    pub state: usize,
    pub act_a: usize,
    pub act_b: usize,
    pub dq: usize,
}

impl ScratchPlan {
    /// Sizes without the `I >= H` precondition.
    pub fn fixed(dims: ScratchDims, dq_sizes: &[usize]) -> Self {
        let rows = dims.max_rows();
        let act = rows * dims.intermediate_size * 2 + SCRATCH_PAD;
        Self {
            state: rows * dims.hidden_size * 2 + SCRATCH_PAD,
            act_a: act,
            act_b: act,
            dq: dq_sizes.iter().copied().max().unwrap_or(0),
        }
    }

    /// Sizes, rejecting shapes whose activations cannot hold hidden state.
    pub fn checked(dims: ScratchDims, dq_sizes: &[usize]) -> Result<Self> {
        if dims.intermediate_size < dims.hidden_size {
            return Err(Error::ScratchBudget {
                hidden: dims.hidden_size,
                intermediate: dims.intermediate_size,
            });
        }
        Ok(Self::fixed(dims, dq_sizes))
    }

    /// Bytes a scratch region needs to hand out all four slices.
    pub fn total(&self) -> usize {
        [self.state, self.act_a, self.act_b, self.dq]
            .into_iter()
            .map(align_up)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(batch: usize) -> ScratchDims {
        ScratchDims {
            hidden_size: 64,
            intermediate_size: 176,
            max_input_len: 16,
            max_batch_size: batch,
        }
    }

    #[test]
    fn test_sizes() {
        let plan = ScratchPlan::fixed(dims(2), &[100, 300, 200]);
        assert_eq!(plan.state, 16 * 2 * 64 * 2 + 128);
        assert_eq!(plan.act_a, 16 * 2 * 176 * 2 + 128);
        assert_eq!(plan.act_b, plan.act_a);
        assert_eq!(plan.dq, 300);
        assert_eq!(plan.total(), plan.state + 2 * plan.act_a + 384);
    }

    #[test]
    fn test_total_covers_aligned_slices() {
        let odd = ScratchDims {
            hidden_size: 32,
            intermediate_size: 96,
            max_input_len: 1,
            max_batch_size: 1,
        };
        let plan = ScratchPlan::fixed(odd, &[96 * 32 * 2 + 128]);
        assert_eq!(plan.state, 192);
        assert_eq!(plan.act_a, 320);
        assert_eq!(plan.dq, 6272);
        assert_eq!(plan.total(), 256 + 384 + 384 + 6272);
        assert!(plan.total() > plan.state + plan.act_a + plan.act_b + plan.dq);
    }

    #[test]
    fn test_checked_requires_intermediate_ge_hidden() {
        let narrow = ScratchDims {
            intermediate_size: 32,
            ..dims(1)
        };
        assert!(matches!(
            ScratchPlan::checked(narrow, &[]),
            Err(Error::ScratchBudget {
                hidden: 64,
                intermediate: 32
            })
        ));
        assert_eq!(ScratchPlan::fixed(narrow, &[]).act_a, 16 * 32 * 2 + 128);
    }
}
