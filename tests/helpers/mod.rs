//! Shared helpers for kvfuse integration tests.
#![allow(dead_code)]

use half::f16;
use kvfuse::{ArchConfig, ModelConfig};
use numr::runtime::cpu::{CpuClient, CpuDevice};

pub fn setup_cpu() -> (CpuClient, CpuDevice) {
    let device = CpuDevice::new();
    let client = CpuClient::new(device.clone());
    (client, device)
}

/// Small model: 2 layers, 2 KV heads of dim 32, H = 32, I = 64.
pub fn small_config() -> ModelConfig {
    ModelConfig {
        hidden_size: 32,
        intermediate_size: 64,
        num_layers: 2,
        num_kv_heads: 2,
        head_dim: 32,
        max_seq_len: 16,
        max_input_len: 4,
        max_batch_size: 2,
        arch: ArchConfig::default(),
    }
}

/// Deterministic pseudo-random values using a sin-based pattern.
pub fn det_f32(n: usize, seed: f32) -> Vec<f32> {
    (0..n).map(|i| ((i as f32 + seed) * 0.1).sin() * 0.5).collect()
}

pub fn det_f16(n: usize, seed: f32) -> Vec<f16> {
    det_f32(n, seed).into_iter().map(f16::from_f32).collect()
}

pub fn max_abs_diff(a: &[f16], b: &[f16]) -> f32 {
    assert_eq!(a.len(), b.len(), "length mismatch: {} vs {}", a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(x, y)| (x.to_f32() - y.to_f32()).abs())
        .fold(0.0, f32::max)
}

pub fn assert_close_f16(a: &[f16], b: &[f16], atol: f32, op: &str) {
    let diff = max_abs_diff(a, b);
    assert!(diff <= atol, "{op}: max abs diff {diff} exceeds {atol}");
}
