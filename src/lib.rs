//! # kvfuse
//!
//! **Quantized KV-cache sessions and a fused quantized MLP, built on numr.**
//!
//! kvfuse holds the per-layer key/value state of a decoder across devices in
//! f16, 8-bit or grouped 4-bit storage, and runs the feed-forward block of a
//! decoder layer through one native call when its weights are quantized.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  inference::kv_cache   Fp16Cache / Fp8Cache / Q4Cache     │
//! │  nn::mlp               FusedMlp + scratch plan + adapters │
//! └──────────────────────────┬───────────────────────────────┘
//! │  ops::traits            KvConvertOps, FusedMlpOps        │
//! │  ops::cpu               CpuClient implementations        │
//! └──────────────────────────┬───────────────────────────────┘
//! │                      numr                                │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design
//!
//! - **Extension traits**: conversion and fused-MLP kernels are traits
//!   implemented on numr's `CpuClient`
//! - **Window conversion**: caches convert only the `(batch, offset, width)`
//!   window a step touches
//! - **Device scratch**: the fused MLP borrows fixed slices of a per-device
//!   bump region sized by [`nn::ScratchPlan`]

pub mod error;
pub mod format;
pub mod inference;
pub mod model;
pub mod nn;
pub mod ops;
pub mod quant;

pub use error::{Error, Result};
pub use format::{CacheDeviceMap, DeviceId};
pub use inference::{
    CacheOptions, CachePrecision, CacheWindow, CopyRegion, DeviceScratch, Fp16Cache, Fp8Cache,
    KvCacheBackend, Q4Cache,
};
pub use model::{ArchConfig, ModelConfig};
pub use nn::{AdapterId, AdapterRegistry, FusedMlp, MlpAdapter, WeightMap};
pub use ops::{FusedMlpOps, KvConvertOps};
pub use quant::QuantMatrix;

// Re-export numr types that users will commonly need
pub use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
pub use numr::tensor::Tensor;
