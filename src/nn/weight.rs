//! Weight enum for checkpoint tensors handed to the MLP block

use crate::error::{Error, Result};
use crate::quant::QuantMatrix;
use half::f16;
use numr::runtime::cpu::CpuRuntime;
use numr::tensor::Tensor;

/// A weight that is either a dense tensor or a 4-bit grouped matrix.
///
/// Norm weights and biases always arrive dense; linear weights may be either.
pub enum Weight {
    /// Dense floating-point tensor
    Standard(Tensor<CpuRuntime>),
    /// 4-bit grouped quantized matrix
    Quantized(QuantMatrix),
}

impl Weight {
    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Quantized(_))
    }

    /// Get as a standard tensor, or error if quantized.
    pub fn as_tensor(&self) -> Result<&Tensor<CpuRuntime>> {
        match self {
            Self::Standard(t) => Ok(t),
            Self::Quantized(_) => Err(Error::ModelError {
                reason: "expected standard tensor, got quantized".into(),
            }),
        }
    }

    /// Logical `[out, in]` shape (or the tensor shape for dense weights).
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Self::Standard(t) => t.shape().to_vec(),
            Self::Quantized(q) => vec![q.out_features(), q.in_features()],
        }
    }

    /// Dense weight as f16, in row-major order.
    pub fn to_f16(&self) -> Result<Vec<f16>> {
        Ok(self
            .as_tensor()?
            .to_vec::<f32>()
            .into_iter()
            .map(f16::from_f32)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use numr::runtime::cpu::CpuDevice;

    #[test]
    fn test_standard_weight() {
        let d = CpuDevice::new();
        let t = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0, 3.0], &[3], &d);
        let w = Weight::Standard(t);

        assert!(!w.is_quantized());
        assert_eq!(w.shape(), vec![3]);
        assert_eq!(w.to_f16().unwrap()[2], f16::from_f32(3.0));
    }

    #[test]
    fn test_quantized_weight() {
        let q = QuantMatrix::quantize(&[0.5f32; 2 * 32], 2, 32, 32).unwrap();
        let w = Weight::Quantized(q);

        assert!(w.is_quantized());
        assert_eq!(w.shape(), vec![2, 32]);
        assert!(w.as_tensor().is_err());
        assert!(w.to_f16().is_err());
    }
}
