pub mod kv_cache;
pub mod scratch;

pub use kv_cache::{
    CacheLayout, CacheOptions, CachePrecision, CacheWindow, CopyRegion, Fp16Cache, Fp8Cache,
    KvCacheBackend, KvView, KvViewMut, Q4Cache, StagingPool, StateBuffer, StateStore,
};
pub use scratch::{DeviceScratch, ScratchSlice, SCRATCH_ALIGN};
