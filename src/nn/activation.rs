//! Activation function enum for configurable MLP architectures

use serde::{Deserialize, Serialize};

/// Feed-forward nonlinearity selected by the model config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Silu,
    Gelu,
}

impl Activation {
    /// Apply this activation to one value.
    #[inline(always)]
    pub fn apply(&self, x: f32) -> f32 {
        match self {
            Activation::Silu => silu(x),
            Activation::Gelu => gelu(x),
        }
    }
}

/// SiLU activation: x * sigmoid(x)
#[inline(always)]
pub fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// GELU, tanh approximation
#[inline(always)]
pub fn gelu(x: f32) -> f32 {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044_715 * x * x * x)).tanh())
}

impl std::fmt::Display for Activation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Activation::Silu => write!(f, "silu"),
            Activation::Gelu => write!(f, "gelu"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silu_values() {
        assert_eq!(silu(0.0), 0.0);
        assert!((silu(1.0) - 0.731_058_6).abs() < 1e-6);
        assert!((silu(-1.0) + 0.268_941_4).abs() < 1e-6);
    }

    #[test]
    fn test_gelu_values() {
        assert_eq!(gelu(0.0), 0.0);
        assert!((gelu(1.0) - 0.841_192).abs() < 1e-4);
        assert!((gelu(-3.0) + 0.003_637).abs() < 1e-4);
    }

    #[test]
    fn test_serde_roundtrip() {
        let act = Activation::Gelu;
        let json = serde_json::to_string(&act).unwrap();
        assert_eq!(json, "\"gelu\"");
        let back: Activation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Activation::Gelu);
    }
}
