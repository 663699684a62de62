pub mod fused_mlp;

pub use fused_mlp::{FusedMlpOps, MlpLoras, QMlpDesc, SublayerLoras};
