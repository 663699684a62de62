pub mod cpu;
pub mod traits;

pub use traits::{FusedMlpOps, KvConvertOps, MlpLoras, QMlpDesc, Q4Plane, Q4PlaneMut, SublayerLoras};
