pub mod cache;
pub mod mlp;

pub use cache::{KvConvertOps, Q4Plane, Q4PlaneMut};
pub use mlp::{FusedMlpOps, MlpLoras, QMlpDesc, SublayerLoras};
