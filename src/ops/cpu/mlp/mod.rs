pub mod fused_mlp;

pub use fused_mlp::CpuQMlp;
