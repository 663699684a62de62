//! 8-bit cache: e5m2 storage, converted per window through f16 staging

use crate::error::Result;
use crate::format::{CacheDeviceMap, DeviceId};
use crate::inference::kv_cache::{
    CacheOptions, CachePrecision, CacheWindow, KvCacheBackend, KvView, KvViewMut, StagingPool,
    StateStore,
};
use crate::model::ModelConfig;
use crate::ops::traits::KvConvertOps;
use numr::runtime::cpu::CpuClient;
use std::sync::Arc;

pub struct Fp8Cache<K: KvConvertOps = CpuClient> {
    client: Arc<K>,
    store: StateStore<u8>,
    staging: StagingPool,
}

impl<K: KvConvertOps> Fp8Cache<K> {
    pub fn new(
        client: Arc<K>,
        config: &ModelConfig,
        device_map: &CacheDeviceMap,
        options: CacheOptions,
    ) -> Result<Self> {
        let layout = options.layout(config, device_map, CachePrecision::Fp8)?;
        let mut cache = Self {
            client,
            store: StateStore::allocate(layout, device_map, options.lazy)?,
            staging: StagingPool::new(layout.shape_basic()),
        };
        if !options.lazy {
            for device in device_map.devices() {
                cache.staging.touch(device);
            }
        }
        Ok(cache)
    }
}

// Sessions never share staging: a clone gets zeroed buffers of its own.
impl<K: KvConvertOps> Clone for Fp8Cache<K> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            store: self.store.clone(),
            staging: self.staging.fresh(),
        }
    }
}

impl<K: KvConvertOps> KvCacheBackend for Fp8Cache<K> {
    type Elem = u8;

    fn store(&self) -> &StateStore<u8> {
        &self.store
    }

    fn store_mut(&mut self) -> &mut StateStore<u8> {
        &mut self.store
    }

    fn read(&mut self, layer: usize, window: CacheWindow) -> Result<KvView<'_>> {
        let device = self.store.device_map().device(layer)?;
        self.touch_device(device);
        let layout = *self.store.layout();
        let (k, v) = self.store.layer(layer)?;
        let (sk, sv) = self.staging.get_mut(device)?;
        if !window.is_empty() {
            self.client
                .fp8_to_fp16(k.as_slice(), sk.as_mut_slice(), &layout, window)?;
            self.client
                .fp8_to_fp16(v.as_slice(), sv.as_mut_slice(), &layout, window)?;
        }
        Ok(KvView::new(sk, sv, window))
    }

    fn staging_mut(&mut self, layer: usize) -> Result<KvViewMut<'_>> {
        let device = self.store.device_map().device(layer)?;
        self.touch_device(device);
        let (sk, sv) = self.staging.get_mut(device)?;
        Ok(KvViewMut::new(sk, sv))
    }

    fn write(&mut self, layer: usize, window: CacheWindow) -> Result<()> {
        if window.is_empty() {
            return Ok(());
        }
        let device = self.store.device_map().device(layer)?;
        let layout = *self.store.layout();
        let (sk, sv) = self.staging.get(device)?;
        let (k, v) = self.store.layer_mut(layer)?;
        self.client
            .fp16_to_fp8(sk.as_slice(), k.as_mut_slice(), &layout, window)?;
        self.client
            .fp16_to_fp8(sv.as_slice(), v.as_mut_slice(), &layout, window)
    }

    fn touch_device(&mut self, device: DeviceId) {
        self.store.touch_device(device);
        self.staging.touch(device);
    }

    fn footprint(&self) -> Vec<usize> {
        let mut fp = self.store.footprint();
        self.staging.add_footprint(&mut fp);
        fp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use half::f16;

    fn config() -> ModelConfig {
        serde_yaml::from_str(
            "hidden_size: 64\nintermediate_size: 128\nnum_layers: 2\n\
             num_kv_heads: 1\nhead_dim: 32\nmax_seq_len: 8\n",
        )
        .unwrap()
    }

    fn cache(map: &CacheDeviceMap) -> Fp8Cache {
        let client = Arc::new(CpuClient::new(numr::runtime::cpu::CpuDevice::new()));
        Fp8Cache::new(client, &config(), map, CacheOptions::default()).unwrap()
    }

    #[test]
    fn test_footprint_includes_staging() {
        let map = CacheDeviceMap::single(2, DeviceId(0));
        let cache = cache(&map);
        let store_bytes = 2 * 2 * (8 * 32);
        let staging_bytes = 2 * (8 * 32) * 2;
        assert_eq!(cache.footprint(), vec![store_bytes + staging_bytes]);
    }

    #[test]
    fn test_zero_width_ignores_range() {
        let map = CacheDeviceMap::single(2, DeviceId(0));
        let mut cache = cache(&map);
        cache.write(0, CacheWindow::new(1, 100, 0)).unwrap();
        assert!(cache.read(0, CacheWindow::new(1, 100, 0)).is_ok());
        assert!(matches!(
            cache.write(0, CacheWindow::new(1, 7, 2)),
            Err(Error::CacheRange { .. })
        ));
    }

    #[test]
    fn test_write_touches_only_window() {
        let map = CacheDeviceMap::single(2, DeviceId(0));
        let mut cache = cache(&map);
        {
            let staging = cache.staging_mut(0).unwrap();
            staging.keys.fill(f16::ONE);
            staging.values.fill(f16::ONE);
        }
        cache.write(0, CacheWindow::new(1, 2, 1)).unwrap();
        let (k, _) = cache.store().layer(0).unwrap();
        assert!(k.as_slice()[..64].iter().all(|&b| b == 0));
        assert!(k.as_slice()[64..96].iter().all(|&b| b == 0x3C));
        assert!(k.as_slice()[96..].iter().all(|&b| b == 0));
    }
}
