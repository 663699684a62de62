//! Per-layer key/value cache with full, 8-bit and 4-bit storage
//!
//! All variants share one [`StateStore`] for their per-layer buffers and
//! differ only in how a native-precision window is produced for attention
//! (`read`) and committed back (`write`):
//!
//! ```text
//! Fp16Cache  store == staging, read/write are views only
//! Fp8Cache   store u8  <-> per-device f16 staging (fp8_to_fp16 / fp16_to_fp8)
//! Q4Cache    store u8 + f16 scales <-> per-device f16 staging (k and v together)
//! ```
//!
//! Only the requested `(batch_size, offset, width)` window is converted, so the
//! per-step cost follows the number of new tokens rather than history length.

pub mod buffer;
mod fp16;
mod fp8;
pub mod layout;
mod q4;
pub mod staging;
pub mod store;

pub use buffer::StateBuffer;
pub use fp16::Fp16Cache;
pub use fp8::Fp8Cache;
pub use layout::{CacheLayout, CachePrecision, CacheWindow, CopyRegion};
pub use q4::Q4Cache;
pub use staging::StagingPool;
pub use store::StateStore;

use crate::error::{Error, Result};
use crate::format::{CacheDeviceMap, DeviceId};
use crate::model::ModelConfig;
use half::f16;
use layout::Strides;
use numr::runtime::cpu::{CpuDevice, CpuRuntime};
use numr::tensor::Tensor;

/// Session construction options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    pub batch_size: usize,
    /// Defaults to the model's `max_seq_len`
    pub max_seq_len: Option<usize>,
    /// Defer layer buffers until their device is touched
    pub lazy: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            batch_size: 1,
            max_seq_len: None,
            lazy: false,
        }
    }
}

impl CacheOptions {
    pub(crate) fn layout(
        &self,
        config: &ModelConfig,
        device_map: &CacheDeviceMap,
        precision: CachePrecision,
    ) -> Result<CacheLayout> {
        if device_map.num_layers() != config.num_layers {
            return Err(Error::InvalidArgument {
                arg: "device_map",
                reason: format!(
                    "map covers {} layers, model has {}",
                    device_map.num_layers(),
                    config.num_layers
                ),
            });
        }
        CacheLayout::new(
            self.batch_size,
            self.max_seq_len.unwrap_or(config.max_seq_len),
            config.num_kv_heads,
            config.head_dim,
            precision,
        )
    }
}

/// Native-precision window handed to attention
#[derive(Debug, Clone, Copy)]
pub struct KvView<'a> {
    keys: &'a [f16],
    values: &'a [f16],
    shape: [usize; 4],
    window: CacheWindow,
}

impl<'a> KvView<'a> {
    pub(crate) fn new(
        keys: &'a StateBuffer<f16>,
        values: &'a StateBuffer<f16>,
        window: CacheWindow,
    ) -> Self {
        Self {
            keys: keys.as_slice(),
            values: values.as_slice(),
            shape: keys.shape(),
            window,
        }
    }

    /// Full `(batch, max_seq_len, heads, head_dim)` key buffer
    pub fn keys(&self) -> &'a [f16] {
        self.keys
    }

    pub fn values(&self) -> &'a [f16] {
        self.values
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn window(&self) -> CacheWindow {
        self.window
    }

    /// Windowed keys of batch row `b`
    pub fn key_window(&self, b: usize) -> &'a [f16] {
        &self.keys[Strides::of(self.shape).span(b, self.window.offset, self.window.width)]
    }

    pub fn value_window(&self, b: usize) -> &'a [f16] {
        &self.values[Strides::of(self.shape).span(b, self.window.offset, self.window.width)]
    }

    /// Copy the window out as `[batch_size, width, heads, head_dim]` tensors.
    pub fn to_tensors(&self, device: &CpuDevice) -> (Tensor<CpuRuntime>, Tensor<CpuRuntime>) {
        let shape = [
            self.window.batch_size,
            self.window.width,
            self.shape[2],
            self.shape[3],
        ];
        (
            Tensor::<CpuRuntime>::from_slice(&self.gather(self.keys), &shape, device),
            Tensor::<CpuRuntime>::from_slice(&self.gather(self.values), &shape, device),
        )
    }

    fn gather(&self, buf: &[f16]) -> Vec<f32> {
        let strides = Strides::of(self.shape);
        (0..self.window.batch_size)
            .flat_map(|b| buf[strides.span(b, self.window.offset, self.window.width)].iter())
            .map(|v| v.to_f32())
            .collect()
    }
}

/// Mutable native-precision buffers that attention fills before `write`
#[derive(Debug)]
pub struct KvViewMut<'a> {
    pub keys: &'a mut [f16],
    pub values: &'a mut [f16],
    pub shape: [usize; 4],
}

impl<'a> KvViewMut<'a> {
    pub(crate) fn new(keys: &'a mut StateBuffer<f16>, values: &'a mut StateBuffer<f16>) -> Self {
        let shape = keys.shape();
        Self {
            keys: keys.as_mut_slice(),
            values: values.as_mut_slice(),
            shape,
        }
    }

    /// Write one token position of batch row `b` for both keys and values.
    pub fn put_token(&mut self, b: usize, pos: usize, key: &[f16], value: &[f16]) {
        let span = Strides::of(self.shape).span(b, pos, 1);
        self.keys[span.clone()].copy_from_slice(key);
        self.values[span].copy_from_slice(value);
    }
}

/// Common contract of the three cache precisions.
///
/// Implementors supply storage access and the conversion pair; eviction,
/// rebalancing, copies and length bookkeeping are shared.
pub trait KvCacheBackend: Clone {
    /// Storage element of the key/value buffers
    type Elem: Copy + Default;

    fn store(&self) -> &StateStore<Self::Elem>;

    fn store_mut(&mut self) -> &mut StateStore<Self::Elem>;

    /// Native-precision view of `window` for `layer`, converting from storage
    /// when the precision requires it. Zero-width windows convert nothing.
    fn read(&mut self, layer: usize, window: CacheWindow) -> Result<KvView<'_>>;

    /// Native-precision buffers of `layer` that `write` commits from
    fn staging_mut(&mut self, layer: usize) -> Result<KvViewMut<'_>>;

    /// Commit `window` of the staging buffers of `layer` into storage.
    fn write(&mut self, layer: usize, window: CacheWindow) -> Result<()>;

    /// Materialize deferred layers and staging buffers for `device`.
    fn touch_device(&mut self, device: DeviceId);

    /// Resident bytes per device ordinal, staging included
    fn footprint(&self) -> Vec<usize>;

    fn precision(&self) -> CachePrecision {
        self.store().layout().precision
    }

    fn layout(&self) -> &CacheLayout {
        self.store().layout()
    }

    fn device_map(&self) -> &CacheDeviceMap {
        self.store().device_map()
    }

    fn num_layers(&self) -> usize {
        self.store().num_layers()
    }

    fn batch_size(&self) -> usize {
        self.layout().batch_size
    }

    fn max_seq_len(&self) -> usize {
        self.layout().max_seq_len
    }

    fn current_seq_len(&self) -> usize {
        self.store().current_seq_len()
    }

    fn set_current_seq_len(&mut self, len: usize) -> Result<()> {
        self.store_mut().set_current_seq_len(len)
    }

    /// Record `count` newly written tokens.
    fn advance(&mut self, count: usize) -> Result<()> {
        let len = self.current_seq_len() + count;
        self.set_current_seq_len(len)
    }

    /// Forget all tokens. Buffer contents are left in place.
    fn reset(&mut self) {
        self.store_mut().reset();
    }

    /// Deep copy of `source` into this (eagerly allocated) session.
    fn copy_from(&mut self, source: &Self) -> Result<()> {
        self.store_mut().copy_from(source.store())?;
        for device in self.device_map().devices() {
            self.touch_device(device);
        }
        Ok(())
    }

    /// Drop the oldest `count` tokens.
    fn evict_oldest(&mut self, count: usize) -> Result<()> {
        self.store_mut().evict_oldest(count)
    }

    /// Re-place layers on `device_map`. Moved layers come back zero-filled.
    fn rebalance(&mut self, device_map: &CacheDeviceMap) -> Result<Vec<usize>> {
        let moved = self.store_mut().rebalance(device_map)?;
        for device in device_map.devices() {
            self.touch_device(device);
        }
        Ok(moved)
    }

    /// Copy a sequence/row region of every layer into `target`.
    fn copy_region(&self, target: &mut Self, region: &CopyRegion) -> Result<()> {
        self.store().copy_region(target.store_mut(), region)
    }

    /// Region copy inside this session, e.g. fanning out a prefilled row.
    fn copy_region_within(&mut self, region: &CopyRegion) -> Result<()> {
        self.store_mut().copy_region_within(region)
    }
}
