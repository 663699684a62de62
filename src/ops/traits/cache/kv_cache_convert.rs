//! KV cache conversion traits
//!
//! The four primitives that move a window of cache state between its storage
//! precision and the f16 staging representation attention consumes:
//! - FP8: e5m2 truncation, one byte per value, no scales
//! - Q4: grouped 4-bit codes with one f16 scale per 32 head-dim elements
//!
//! # Layout
//! - Staging (f16): `[batch, max_seq_len, num_kv_heads, head_dim]`
//! - FP8 storage: same shape, `u8`
//! - Q4 codes: `[..., head_dim / 2]`, scales: `[..., head_dim / 32]` f16
//!
//! Only positions `offset..offset + width` of rows `0..batch_size` are touched.

use crate::error::Result;
use crate::inference::kv_cache::{CacheLayout, CacheWindow};
use half::f16;

/// Read-only Q4 storage for one of keys/values
#[derive(Debug, Clone, Copy)]
pub struct Q4Plane<'a> {
    pub codes: &'a [u8],
    pub scales: &'a [f16],
}

/// Mutable Q4 storage for one of keys/values
#[derive(Debug)]
pub struct Q4PlaneMut<'a> {
    pub codes: &'a mut [u8],
    pub scales: &'a mut [f16],
}

/// Cache conversion primitives of the native compute boundary
pub trait KvConvertOps {
    /// Widen FP8 storage into f16 staging
    fn fp8_to_fp16(
        &self,
        input: &[u8],
        output: &mut [f16],
        layout: &CacheLayout,
        window: CacheWindow,
    ) -> Result<()>;

    /// Narrow f16 staging into FP8 storage
    fn fp16_to_fp8(
        &self,
        input: &[f16],
        output: &mut [u8],
        layout: &CacheLayout,
        window: CacheWindow,
    ) -> Result<()>;

    /// Dequantize keys and values together
    fn q4_to_fp16_kv(
        &self,
        keys: Q4Plane<'_>,
        key_out: &mut [f16],
        values: Q4Plane<'_>,
        value_out: &mut [f16],
        layout: &CacheLayout,
        window: CacheWindow,
    ) -> Result<()>;

    /// Quantize keys and values together, recomputing the scale of every
    /// group touched by the window
    fn fp16_to_q4_kv(
        &self,
        key_in: &[f16],
        keys: Q4PlaneMut<'_>,
        value_in: &[f16],
        values: Q4PlaneMut<'_>,
        layout: &CacheLayout,
        window: CacheWindow,
    ) -> Result<()>;
}
