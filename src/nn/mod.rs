pub mod activation;
pub mod linear;
pub mod lora;
pub mod mlp;
pub mod norm;
pub mod weight;
pub mod weight_map;

pub use activation::Activation;
pub use linear::MlpLinear;
pub use lora::{AdapterId, AdapterRegistry, LoraMatrix, LoraWeights};
pub use mlp::{
    AdapterComposer, FusedMlp, MlpAdapter, MlpIntermediates, ScratchDims, ScratchPlan,
};
pub use norm::MlpNorm;
pub use weight::Weight;
pub use weight_map::WeightMap;
