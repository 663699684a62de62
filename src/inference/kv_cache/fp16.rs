//! Full-precision cache: the store is the working buffer

use crate::error::Result;
use crate::format::{CacheDeviceMap, DeviceId};
use crate::inference::kv_cache::{
    CacheOptions, CachePrecision, CacheWindow, KvCacheBackend, KvView, KvViewMut, StateStore,
};
use crate::model::ModelConfig;
use half::f16;

#[derive(Debug, Clone)]
pub struct Fp16Cache {
    store: StateStore<f16>,
}

impl Fp16Cache {
    pub fn new(
        config: &ModelConfig,
        device_map: &CacheDeviceMap,
        options: CacheOptions,
    ) -> Result<Self> {
        let layout = options.layout(config, device_map, CachePrecision::Fp16)?;
        Ok(Self {
            store: StateStore::allocate(layout, device_map, options.lazy)?,
        })
    }
}

impl KvCacheBackend for Fp16Cache {
    type Elem = f16;

    fn store(&self) -> &StateStore<f16> {
        &self.store
    }

    fn store_mut(&mut self) -> &mut StateStore<f16> {
        &mut self.store
    }

    fn read(&mut self, layer: usize, window: CacheWindow) -> Result<KvView<'_>> {
        if !window.is_empty() {
            self.store.layout().check_window(window)?;
        }
        let device = self.store.device_map().device(layer)?;
        self.touch_device(device);
        let (k, v) = self.store.layer(layer)?;
        Ok(KvView::new(k, v, window))
    }

    fn staging_mut(&mut self, layer: usize) -> Result<KvViewMut<'_>> {
        let device = self.store.device_map().device(layer)?;
        self.touch_device(device);
        let (k, v) = self.store.layer_mut(layer)?;
        Ok(KvViewMut::new(k, v))
    }

    fn write(&mut self, layer: usize, window: CacheWindow) -> Result<()> {
        if window.is_empty() {
            return Ok(());
        }
        self.store.layout().check_window(window)?;
        self.store.layer(layer).map(|_| ())
    }

    fn touch_device(&mut self, device: DeviceId) {
        self.store.touch_device(device);
    }

    fn footprint(&self) -> Vec<usize> {
        self.store.footprint()
    }
}
