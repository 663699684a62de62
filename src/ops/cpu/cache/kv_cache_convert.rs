//! CPU reference implementation of the cache conversion primitives
//!
//! Batch rows are processed in parallel; inside a row only the requested
//! window of positions is converted.

use crate::error::{Error, Result};
use crate::inference::kv_cache::layout::Strides;
use crate::inference::kv_cache::{CacheLayout, CacheWindow};
use crate::ops::traits::cache::kv_cache_convert::{KvConvertOps, Q4Plane, Q4PlaneMut};
use crate::quant::int4::{dequantize_group, quantize_group};
use crate::quant::Q4_GROUP_SIZE;
use half::f16;
use numr::runtime::cpu::CpuClient;
use rayon::prelude::*;

/// e5m2 is the high byte of an IEEE half
#[inline(always)]
fn narrow_fp8(x: f16) -> u8 {
    (x.to_bits() >> 8) as u8
}

#[inline(always)]
fn widen_fp8(x: u8) -> f16 {
    f16::from_bits((x as u16) << 8)
}

fn check_len(what: &str, got: usize, shape: [usize; 4]) -> Result<()> {
    let expected: usize = shape.iter().product();
    if got != expected {
        return Err(Error::KernelError {
            reason: format!("{what} has {got} elements, expected {expected} for shape {shape:?}"),
        });
    }
    Ok(())
}

fn dequant_plane(plane: Q4Plane<'_>, out: &mut [f16], layout: &CacheLayout, window: CacheWindow) {
    let out_strides = Strides::of(layout.shape_basic());
    let code_strides = Strides::of(layout.shape_w());
    let scale_strides = Strides::of(layout.shape_s());
    let half_group = Q4_GROUP_SIZE / 2;

    out.par_chunks_mut(out_strides.row)
        .take(window.batch_size)
        .enumerate()
        .for_each(|(b, row)| {
            let dst = &mut row[window.offset * out_strides.token..][..window.width * out_strides.token];
            let codes = &plane.codes[code_strides.span(b, window.offset, window.width)];
            let scales = &plane.scales[scale_strides.span(b, window.offset, window.width)];
            for ((group_out, packed), scale) in dst
                .chunks_exact_mut(Q4_GROUP_SIZE)
                .zip(codes.chunks_exact(half_group))
                .zip(scales)
            {
                dequantize_group(packed, *scale, group_out);
            }
        });
}

fn quant_plane(input: &[f16], plane: Q4PlaneMut<'_>, layout: &CacheLayout, window: CacheWindow) {
    let in_strides = Strides::of(layout.shape_basic());
    let code_strides = Strides::of(layout.shape_w());
    let scale_strides = Strides::of(layout.shape_s());
    let half_group = Q4_GROUP_SIZE / 2;

    plane
        .codes
        .par_chunks_mut(code_strides.row)
        .zip(plane.scales.par_chunks_mut(scale_strides.row))
        .take(window.batch_size)
        .enumerate()
        .for_each(|(b, (code_row, scale_row))| {
            let src = &input[in_strides.span(b, window.offset, window.width)];
            let codes = &mut code_row[window.offset * code_strides.token..]
                [..window.width * code_strides.token];
            let scales = &mut scale_row[window.offset * scale_strides.token..]
                [..window.width * scale_strides.token];
            let mut group = [0.0f32; Q4_GROUP_SIZE];
            for ((group_in, packed), scale) in src
                .chunks_exact(Q4_GROUP_SIZE)
                .zip(codes.chunks_exact_mut(half_group))
                .zip(scales.iter_mut())
            {
                for (dst, v) in group.iter_mut().zip(group_in) {
                    *dst = v.to_f32();
                }
                *scale = quantize_group(&group, packed);
            }
        });
}

impl KvConvertOps for CpuClient {
    fn fp8_to_fp16(
        &self,
        input: &[u8],
        output: &mut [f16],
        layout: &CacheLayout,
        window: CacheWindow,
    ) -> Result<()> {
        layout.check_window(window)?;
        check_len("fp8 input", input.len(), layout.shape_w())?;
        check_len("fp16 output", output.len(), layout.shape_basic())?;
        if window.is_empty() {
            return Ok(());
        }

        let strides = Strides::of(layout.shape_basic());
        output
            .par_chunks_mut(strides.row)
            .zip(input.par_chunks(strides.row))
            .take(window.batch_size)
            .for_each(|(out_row, in_row)| {
                let span = strides.span(0, window.offset, window.width);
                for (o, &i) in out_row[span.clone()].iter_mut().zip(&in_row[span]) {
                    *o = widen_fp8(i);
                }
            });
        Ok(())
    }

    fn fp16_to_fp8(
        &self,
        input: &[f16],
        output: &mut [u8],
        layout: &CacheLayout,
        window: CacheWindow,
    ) -> Result<()> {
        layout.check_window(window)?;
        check_len("fp16 input", input.len(), layout.shape_basic())?;
        check_len("fp8 output", output.len(), layout.shape_w())?;
        if window.is_empty() {
            return Ok(());
        }

        let strides = Strides::of(layout.shape_basic());
        output
            .par_chunks_mut(strides.row)
            .zip(input.par_chunks(strides.row))
            .take(window.batch_size)
            .for_each(|(out_row, in_row)| {
                let span = strides.span(0, window.offset, window.width);
                for (o, &i) in out_row[span.clone()].iter_mut().zip(&in_row[span]) {
                    *o = narrow_fp8(i);
                }
            });
        Ok(())
    }

    fn q4_to_fp16_kv(
        &self,
        keys: Q4Plane<'_>,
        key_out: &mut [f16],
        values: Q4Plane<'_>,
        value_out: &mut [f16],
        layout: &CacheLayout,
        window: CacheWindow,
    ) -> Result<()> {
        layout.check_window(window)?;
        for (what, plane) in [("key", &keys), ("value", &values)] {
            check_len(what, plane.codes.len(), layout.shape_w())?;
            check_len(what, plane.scales.len(), layout.shape_s())?;
        }
        check_len("key output", key_out.len(), layout.shape_basic())?;
        check_len("value output", value_out.len(), layout.shape_basic())?;
        if window.is_empty() {
            return Ok(());
        }

        rayon::join(
            || dequant_plane(keys, key_out, layout, window),
            || dequant_plane(values, value_out, layout, window),
        );
        Ok(())
    }

    fn fp16_to_q4_kv(
        &self,
        key_in: &[f16],
        keys: Q4PlaneMut<'_>,
        value_in: &[f16],
        values: Q4PlaneMut<'_>,
        layout: &CacheLayout,
        window: CacheWindow,
    ) -> Result<()> {
        layout.check_window(window)?;
        check_len("key input", key_in.len(), layout.shape_basic())?;
        check_len("value input", value_in.len(), layout.shape_basic())?;
        for (what, plane) in [("key", &keys), ("value", &values)] {
            check_len(what, plane.codes.len(), layout.shape_w())?;
            check_len(what, plane.scales.len(), layout.shape_s())?;
        }
        if window.is_empty() {
            return Ok(());
        }

        rayon::join(
            || quant_plane(key_in, keys, layout, window),
            || quant_plane(value_in, values, layout, window),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::kv_cache::CachePrecision;
    use crate::test_utils::cpu_setup;

    fn pattern(n: usize) -> Vec<f16> {
        (0..n)
            .map(|i| f16::from_f32((i as f32 * 0.13).sin() * 3.0))
            .collect()
    }

    #[test]
    fn test_fp8_truncation_bits() {
        let x = f16::from_f32(1.75);
        assert_eq!(widen_fp8(narrow_fp8(x)).to_f32(), 1.75);
        // 1.875 needs three mantissa bits, truncation keeps two
        assert_eq!(widen_fp8(narrow_fp8(f16::from_f32(1.875))).to_f32(), 1.75);
        assert_eq!(widen_fp8(narrow_fp8(f16::from_f32(-0.5))).to_f32(), -0.5);
    }

    #[test]
    fn test_fp8_window_only() {
        let (client, _) = cpu_setup();
        let layout = CacheLayout::new(1, 4, 1, 8, CachePrecision::Fp8).unwrap();
        let input = pattern(32);
        let mut stored = vec![0u8; 32];
        client
            .fp16_to_fp8(&input, &mut stored, &layout, CacheWindow::new(1, 1, 2))
            .unwrap();
        assert!(stored[..8].iter().all(|&b| b == 0));
        assert!(stored[24..].iter().all(|&b| b == 0));
        assert!(stored[8..24].iter().any(|&b| b != 0));
    }

    #[test]
    fn test_q4_kv_roundtrip() {
        let (client, _) = cpu_setup();
        let layout = CacheLayout::new(2, 4, 2, 64, CachePrecision::Q4).unwrap();
        let n = 2 * 4 * 2 * 64;
        let keys_in = pattern(n);
        let values_in: Vec<f16> = keys_in.iter().map(|v| -*v).collect();

        let mut k_codes = vec![0u8; n / 2];
        let mut v_codes = vec![0u8; n / 2];
        let mut k_scales = vec![f16::ZERO; n / 32];
        let mut v_scales = vec![f16::ZERO; n / 32];
        let window = CacheWindow::new(2, 0, 4);

        client
            .fp16_to_q4_kv(
                &keys_in,
                Q4PlaneMut { codes: &mut k_codes, scales: &mut k_scales },
                &values_in,
                Q4PlaneMut { codes: &mut v_codes, scales: &mut v_scales },
                &layout,
                window,
            )
            .unwrap();

        let mut k_out = vec![f16::ZERO; n];
        let mut v_out = vec![f16::ZERO; n];
        client
            .q4_to_fp16_kv(
                Q4Plane { codes: &k_codes, scales: &k_scales },
                &mut k_out,
                Q4Plane { codes: &v_codes, scales: &v_scales },
                &mut v_out,
                &layout,
                window,
            )
            .unwrap();

        for (i, (x, y)) in keys_in.iter().zip(&k_out).enumerate() {
            let bound = k_scales[i / 32].to_f32() * 0.5 + 1e-2;
            assert!((x.to_f32() - y.to_f32()).abs() <= bound);
        }
        for (x, y) in values_in.iter().zip(&v_out) {
            assert!((x.to_f32() - y.to_f32()).abs() <= 0.25);
        }
    }

    #[test]
    fn test_buffer_length_mismatch() {
        let (client, _) = cpu_setup();
        let layout = CacheLayout::new(1, 4, 1, 8, CachePrecision::Fp8).unwrap();
        let mut out = vec![f16::ZERO; 31];
        let err = client.fp8_to_fp16(&[0u8; 32], &mut out, &layout, CacheWindow::new(1, 0, 1));
        assert!(matches!(err, Err(Error::KernelError { .. })));
    }
}
