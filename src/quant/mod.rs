//! Quantized storage formats
//!
//! - `int4`: grouped symmetric 4-bit codec shared by Q4 caches and weights
//! - `matrix`: quantized weight handle consumed by the fused MLP kernel

pub mod int4;
pub mod matrix;

pub use int4::Q4_GROUP_SIZE;
pub use matrix::{QuantMatrix, SCRATCH_PAD};
