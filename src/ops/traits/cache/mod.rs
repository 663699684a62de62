pub mod kv_cache_convert;

pub use kv_cache_convert::{KvConvertOps, Q4Plane, Q4PlaneMut};
