//! Symmetric 4-bit grouped round-to-nearest codec
//!
//! Shared by the Q4 KV cache kernels and the quantized linear weights.
//! One f16 scale per group, `scale = max|x| / 7`, codes in `[-8, 7]` stored
//! with a +8 offset, two codes per byte (low nibble first).

use half::f16;

/// Elements sharing one scale along the head dimension of a Q4 cache
pub const Q4_GROUP_SIZE: usize = 32;

const Q4_MAX: f32 = 7.0;
const Q4_OFFSET: i32 = 8;

/// Quantize one group into `packed` and return its scale.
///
/// `packed.len()` must be `values.len() / 2`.
pub fn quantize_group(values: &[f32], packed: &mut [u8]) -> f16 {
    debug_assert_eq!(values.len() % 2, 0);
    debug_assert_eq!(packed.len() * 2, values.len());

    let max_abs = values.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    let scale = f16::from_f32(max_abs / Q4_MAX);
    // quantize against the rounded scale so dequantization sees the same value
    let s = scale.to_f32();
    let inv = if s > 0.0 { 1.0 / s } else { 0.0 };

    for (byte, pair) in packed.iter_mut().zip(values.chunks_exact(2)) {
        let lo = encode(pair[0] * inv);
        let hi = encode(pair[1] * inv);
        *byte = lo | (hi << 4);
    }
    scale
}

/// Dequantize one group of `2 * packed.len()` elements.
pub fn dequantize_group(packed: &[u8], scale: f16, out: &mut [f16]) {
    debug_assert_eq!(packed.len() * 2, out.len());

    let s = scale.to_f32();
    for (pair, &byte) in out.chunks_exact_mut(2).zip(packed) {
        pair[0] = f16::from_f32(decode(byte & 0xF) * s);
        pair[1] = f16::from_f32(decode(byte >> 4) * s);
    }
}

#[inline(always)]
fn encode(x: f32) -> u8 {
    (x.round().clamp(-8.0, Q4_MAX) as i32 + Q4_OFFSET) as u8
}

#[inline(always)]
fn decode(code: u8) -> f32 {
    (code as i32 - Q4_OFFSET) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_roundtrip_error_bound() {
        let values: Vec<f32> = (0..32).map(|i| (i as f32 * 0.37).sin()).collect();
        let mut packed = vec![0u8; 16];
        let scale = quantize_group(&values, &mut packed);

        let mut out = vec![f16::ZERO; 32];
        dequantize_group(&packed, scale, &mut out);

        let bound = scale.to_f32() * 0.5 + 1e-3;
        for (x, y) in values.iter().zip(&out) {
            assert!((x - y.to_f32()).abs() <= bound, "{x} vs {y}");
        }
    }

    #[test]
    fn test_zero_group() {
        let values = [0.0f32; 32];
        let mut packed = vec![0xFFu8; 16];
        let scale = quantize_group(&values, &mut packed);
        assert_eq!(scale.to_f32(), 0.0);

        let mut out = vec![f16::ONE; 32];
        dequantize_group(&packed, scale, &mut out);
        assert!(out.iter().all(|v| v.to_f32() == 0.0));
    }

    #[test]
    fn test_extremes_map_to_max_code() {
        let mut values = [0.0f32; 32];
        values[0] = 2.0;
        values[1] = -2.0;
        let mut packed = vec![0u8; 16];
        let scale = quantize_group(&values, &mut packed);
        assert_eq!(packed[0] & 0xF, 15);
        assert_eq!(packed[0] >> 4, 1);

        let mut out = vec![f16::ZERO; 32];
        dequantize_group(&packed, scale, &mut out);
        assert!((out[0].to_f32() - 2.0).abs() < 1e-2);
        assert!((out[1].to_f32() + 2.0).abs() < 1e-2);
    }
}
