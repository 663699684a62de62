//! Model configuration consumed by the cache and MLP core
//!
//! Supports YAML and JSON formats. Only the architecture metadata the cache
//! and feed-forward block read is modelled here.

use crate::error::{Error, Result};
use crate::nn::Activation;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Normalization applied before the feed-forward block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormKind {
    #[default]
    RmsNorm,
    LayerNorm,
}

/// Model dimensions plus limits used for cache and scratch sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_layers: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub max_seq_len: usize,

    #[serde(default = "default_max_input_len")]
    pub max_input_len: usize,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default)]
    pub arch: ArchConfig,
}

fn default_max_input_len() -> usize {
    2048
}

fn default_max_batch_size() -> usize {
    1
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("hidden_size", self.hidden_size),
            ("intermediate_size", self.intermediate_size),
            ("num_layers", self.num_layers),
            ("num_kv_heads", self.num_kv_heads),
            ("head_dim", self.head_dim),
            ("max_seq_len", self.max_seq_len),
            ("max_input_len", self.max_input_len),
            ("max_batch_size", self.max_batch_size),
        ] {
            if value == 0 {
                return Err(Error::ModelError {
                    reason: format!("{name} must be > 0"),
                });
            }
        }
        if self.arch.checkpoint_fused_mlp && !self.arch.mlp_gate {
            return Err(Error::ModelError {
                reason: "fused MLP checkpoints require a gated feed-forward block".into(),
            });
        }
        Ok(())
    }

    pub fn load_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::ModelError {
            reason: format!("IO error: {e}"),
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| Error::ModelError {
            reason: format!("YAML parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::ModelError {
            reason: format!("IO error: {e}"),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| Error::ModelError {
            reason: format!("JSON parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Rows the fused kernel may see in one call
    pub fn max_rows(&self) -> usize {
        self.max_input_len * self.max_batch_size
    }
}

/// Feed-forward architecture switches and checkpoint key naming
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchConfig {
    pub norm: NormKind,
    pub norm_eps: f32,
    pub mlp_act_func: Activation,
    pub mlp_gate: bool,
    pub mlp_bias: bool,
    pub checkpoint_fused_mlp: bool,
    pub norm_key_2: String,
    pub mlp_key_gate: String,
    pub mlp_key_up: String,
    pub mlp_key_down: String,
    pub fused_mlp_key_12: String,
    pub fused_mlp_key_3: String,
}

impl Default for ArchConfig {
    fn default() -> Self {
        Self {
            norm: NormKind::RmsNorm,
            norm_eps: 1e-5,
            mlp_act_func: Activation::Silu,
            mlp_gate: true,
            mlp_bias: false,
            checkpoint_fused_mlp: false,
            norm_key_2: ".post_attention_layernorm".into(),
            mlp_key_gate: ".mlp.gate_proj".into(),
            mlp_key_up: ".mlp.up_proj".into(),
            mlp_key_down: ".mlp.down_proj".into(),
            fused_mlp_key_12: ".feed_forward.w12".into(),
            fused_mlp_key_3: ".feed_forward.w3".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_yaml_defaults() {
        let yaml = r#"
hidden_size: 4096
intermediate_size: 14336
num_layers: 32
num_kv_heads: 8
head_dim: 128
max_seq_len: 8192
"#;
        let config: ModelConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.max_input_len, 2048);
        assert_eq!(config.max_batch_size, 1);
        assert_eq!(config.arch.norm, NormKind::RmsNorm);
        assert_eq!(config.arch.mlp_act_func, Activation::Silu);
        assert!(config.arch.mlp_gate);
        assert_eq!(config.arch.mlp_key_up, ".mlp.up_proj");
    }

    #[test]
    fn test_config_arch_overrides() {
        let yaml = r#"
hidden_size: 64
intermediate_size: 256
num_layers: 2
num_kv_heads: 2
head_dim: 32
max_seq_len: 128
max_input_len: 16
max_batch_size: 4
arch:
  norm: layernorm
  mlp_act_func: gelu
  mlp_gate: false
  mlp_bias: true
"#;
        let config: ModelConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.arch.norm, NormKind::LayerNorm);
        assert_eq!(config.arch.mlp_act_func, Activation::Gelu);
        assert!(!config.arch.mlp_gate);
        assert!(config.arch.mlp_bias);
        assert_eq!(config.max_rows(), 64);
    }

    #[test]
    fn test_validate_rejects_zero_dims() {
        let yaml = r#"
hidden_size: 0
intermediate_size: 256
num_layers: 2
num_kv_heads: 2
head_dim: 32
max_seq_len: 128
"#;
        let config: ModelConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fused_checkpoint_requires_gate() {
        let json = r#"{
            "hidden_size": 64, "intermediate_size": 128, "num_layers": 1,
            "num_kv_heads": 1, "head_dim": 64, "max_seq_len": 32,
            "arch": { "mlp_gate": false, "checkpoint_fused_mlp": true }
        }"#;
        let config: ModelConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"hidden_size": 64, "intermediate_size": 128, "num_layers": 2,
                "num_kv_heads": 2, "head_dim": 32, "max_seq_len": 64}"#,
        )
        .unwrap();
        let config = ModelConfig::load_json(&path).unwrap();
        assert_eq!(config.num_layers, 2);
        assert!(ModelConfig::load_yaml(dir.path().join("missing.yaml")).is_err());
    }
}
