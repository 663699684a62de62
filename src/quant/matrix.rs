//! Quantized weight matrix handed by a linear sublayer to the fused MLP
//!
//! Weights are stored row-major `[out_features, in_features]` as 4-bit grouped
//! codes along the input dimension with one f16 scale per group.

use crate::error::{Error, Result};
use crate::quant::int4::{dequantize_group, quantize_group};
use half::f16;
use numr::runtime::cpu::CpuRuntime;
use numr::tensor::Tensor;

/// Padding added to every scratch request, matching the native allocator
pub const SCRATCH_PAD: usize = 128;

/// 4-bit grouped quantized weight matrix with optional bias
#[derive(Debug, Clone)]
pub struct QuantMatrix {
    in_features: usize,
    out_features: usize,
    group_size: usize,
    /// `[out_features, in_features / 2]`
    qweight: Vec<u8>,
    /// `[out_features, in_features / group_size]`
    scales: Vec<f16>,
    bias: Option<Vec<f16>>,
}

impl QuantMatrix {
    /// Quantize a dense row-major `[out_features, in_features]` weight.
    pub fn quantize(
        weight: &[f32],
        out_features: usize,
        in_features: usize,
        group_size: usize,
    ) -> Result<Self> {
        if group_size == 0 || group_size % 2 != 0 || in_features % group_size != 0 {
            return Err(Error::QuantError {
                reason: format!(
                    "group size {group_size} must be even and divide in_features {in_features}"
                ),
            });
        }
        if weight.len() != out_features * in_features {
            return Err(Error::QuantError {
                reason: format!(
                    "weight has {} elements, expected {out_features}x{in_features}",
                    weight.len()
                ),
            });
        }

        let groups_per_row = in_features / group_size;
        let mut qweight = vec![0u8; out_features * in_features / 2];
        let mut scales = Vec::with_capacity(out_features * groups_per_row);

        for (row, packed_row) in weight
            .chunks_exact(in_features)
            .zip(qweight.chunks_exact_mut(in_features / 2))
        {
            for (group, packed) in row
                .chunks_exact(group_size)
                .zip(packed_row.chunks_exact_mut(group_size / 2))
            {
                scales.push(quantize_group(group, packed));
            }
        }

        Ok(Self {
            in_features,
            out_features,
            group_size,
            qweight,
            scales,
            bias: None,
        })
    }

    /// Quantize a 2-D numr tensor of shape `[out_features, in_features]`.
    pub fn from_tensor(weight: &Tensor<CpuRuntime>, group_size: usize) -> Result<Self> {
        let shape = weight.shape();
        if shape.len() != 2 {
            return Err(Error::QuantError {
                reason: format!("expected 2-D weight, got shape {shape:?}"),
            });
        }
        let (out_features, in_features) = (shape[0], shape[1]);
        Self::quantize(&weight.to_vec::<f32>(), out_features, in_features, group_size)
    }

    /// Attach a bias vector of length `out_features`.
    pub fn with_bias(mut self, bias: &[f32]) -> Result<Self> {
        if bias.len() != self.out_features {
            return Err(Error::QuantError {
                reason: format!(
                    "bias has {} elements, expected {}",
                    bias.len(),
                    self.out_features
                ),
            });
        }
        self.bias = Some(bias.iter().map(|&b| f16::from_f32(b)).collect());
        Ok(self)
    }

    /// Reconstruct the full-precision weight into `out` (`[out, in]` row-major).
    pub fn dequantize_into(&self, out: &mut [f16]) -> Result<()> {
        let n = self.numel();
        if out.len() < n {
            return Err(Error::KernelError {
                reason: format!("dequant buffer holds {} elements, need {n}", out.len()),
            });
        }
        let half_group = self.group_size / 2;
        for ((packed, scale), dst) in self
            .qweight
            .chunks_exact(half_group)
            .zip(&self.scales)
            .zip(out[..n].chunks_exact_mut(self.group_size))
        {
            dequantize_group(packed, *scale, dst);
        }
        Ok(())
    }

    pub fn dequantize(&self) -> Vec<f16> {
        let mut out = vec![f16::ZERO; self.numel()];
        // buffer is exactly sized, cannot fail
        let _ = self.dequantize_into(&mut out);
        out
    }

    /// Scratch bytes the native kernel needs to reconstruct this matrix.
    pub fn temp_dq_size(&self) -> usize {
        self.in_features * self.out_features * 2 + SCRATCH_PAD
    }

    pub fn numel(&self) -> usize {
        self.in_features * self.out_features
    }

    /// Resident bytes of codes, scales and bias.
    pub fn footprint(&self) -> usize {
        self.qweight.len() + self.scales.len() * 2 + self.bias.as_ref().map_or(0, |b| b.len() * 2)
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn bias(&self) -> Option<&[f16]> {
        self.bias.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use numr::runtime::cpu::CpuDevice;

    fn pattern(n: usize) -> Vec<f32> {
        (0..n).map(|i| (i as f32 * 0.21).cos() * 0.3).collect()
    }

    #[test]
    fn test_quantize_dequantize() {
        let w = pattern(8 * 64);
        let q = QuantMatrix::quantize(&w, 8, 64, 32).unwrap();
        assert_eq!(q.numel(), 512);
        assert_eq!(q.temp_dq_size(), 512 * 2 + 128);

        let dq = q.dequantize();
        for (x, y) in w.iter().zip(&dq) {
            assert!((x - y.to_f32()).abs() < 0.03);
        }
    }

    #[test]
    fn test_bad_group_size() {
        let w = pattern(4 * 48);
        assert!(QuantMatrix::quantize(&w, 4, 48, 32).is_err());
        assert!(QuantMatrix::quantize(&w, 4, 48, 0).is_err());
    }

    #[test]
    fn test_from_tensor_and_bias() {
        let device = CpuDevice::new();
        let w = Tensor::<CpuRuntime>::from_slice(&pattern(4 * 32), &[4, 32], &device);
        let q = QuantMatrix::from_tensor(&w, 32).unwrap();
        assert_eq!(q.out_features(), 4);
        assert_eq!(q.in_features(), 32);

        assert!(q.clone().with_bias(&[0.0; 3]).is_err());
        let q = q.with_bias(&[0.5; 4]).unwrap();
        assert_eq!(q.bias().unwrap().len(), 4);
        assert_eq!(q.footprint(), 4 * 16 + 4 * 2 + 4 * 2);
    }
}
