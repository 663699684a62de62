//! 4-bit cache: grouped codes plus f16 scales, keys and values converted
//! together through f16 staging

use crate::error::Result;
use crate::format::{CacheDeviceMap, DeviceId};
use crate::inference::kv_cache::{
    CacheOptions, CachePrecision, CacheWindow, KvCacheBackend, KvView, KvViewMut, StagingPool,
    StateStore,
};
use crate::model::ModelConfig;
use crate::ops::traits::{KvConvertOps, Q4Plane, Q4PlaneMut};
use numr::runtime::cpu::CpuClient;
use std::sync::Arc;

pub struct Q4Cache<K: KvConvertOps = CpuClient> {
    client: Arc<K>,
    store: StateStore<u8>,
    staging: StagingPool,
}

impl<K: KvConvertOps> Q4Cache<K> {
    pub fn new(
        client: Arc<K>,
        config: &ModelConfig,
        device_map: &CacheDeviceMap,
        options: CacheOptions,
    ) -> Result<Self> {
        let layout = options.layout(config, device_map, CachePrecision::Q4)?;
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

impl<K: KvConvertOps> Clone for Q4Cache<K> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            store: self.store.clone(),
            staging: self.staging.fresh(),
        }
    }
}

impl<K: KvConvertOps> KvCacheBackend for Q4Cache<K> {
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
        let (ks, vs) = self.store.layer_scales(layer)?;
        let (sk, sv) = self.staging.get_mut(device)?;
        if !window.is_empty() {
            self.client.q4_to_fp16_kv(
                Q4Plane {
                    codes: k.as_slice(),
                    scales: ks.as_slice(),
                },
                sk.as_mut_slice(),
                Q4Plane {
                    codes: v.as_slice(),
                    scales: vs.as_slice(),
                },
                sv.as_mut_slice(),
                &layout,
                window,
            )?;
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
        let (k, v, ks, vs) = self.store.layer_with_scales_mut(layer)?;
        self.client.fp16_to_q4_kv(
            sk.as_slice(),
            Q4PlaneMut {
                codes: k.as_mut_slice(),
                scales: ks.as_mut_slice(),
            },
            sv.as_slice(),
            Q4PlaneMut {
                codes: v.as_mut_slice(),
                scales: vs.as_mut_slice(),
            },
            &layout,
            window,
        )
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
    use half::f16;
    use numr::runtime::cpu::CpuDevice;

    fn config() -> ModelConfig {
        serde_yaml::from_str(
            "hidden_size: 64\nintermediate_size: 128\nnum_layers: 1\n\
             num_kv_heads: 2\nhead_dim: 64\nmax_seq_len: 4\n",
        )
        .unwrap()
    }

    #[test]
    fn test_scales_written_per_group() {
        let map = CacheDeviceMap::single(1, DeviceId(0));
        let client = Arc::new(CpuClient::new(CpuDevice::new()));
        let mut cache = Q4Cache::new(client, &config(), &map, CacheOptions::default()).unwrap();

        let key: Vec<f16> = (0..128).map(|i| f16::from_f32((i / 32) as f32 + 1.0)).collect();
        cache.staging_mut(0).unwrap().put_token(0, 1, &key, &key);
        cache.write(0, CacheWindow::new(1, 1, 1)).unwrap();

        let (ks, _) = cache.store().layer_scales(0).unwrap();
        // token 1 owns scales 4..8, one per 32-element group
        let scales: Vec<f32> = ks.as_slice()[4..8].iter().map(|s| s.to_f32()).collect();
        for (g, s) in scales.iter().enumerate() {
            let expected = (g as f32 + 1.0) / 7.0;
            assert!((s - expected).abs() < 1e-3, "group {g}: {s} vs {expected}");
        }
        assert!(ks.as_slice()[..4].iter().all(|s| *s == f16::ZERO));
    }

    #[test]
    fn test_constant_groups_are_exact() {
        let map = CacheDeviceMap::single(1, DeviceId(0));
        let client = Arc::new(CpuClient::new(CpuDevice::new()));
        let mut cache = Q4Cache::new(client, &config(), &map, CacheOptions::default()).unwrap();

        let key = vec![f16::from_f32(-2.0); 128];
        cache.staging_mut(0).unwrap().put_token(0, 0, &key, &key);
        cache.write(0, CacheWindow::new(1, 0, 1)).unwrap();
        cache.staging_mut(0).unwrap().keys.fill(f16::ZERO);

        let view = cache.read(0, CacheWindow::new(1, 0, 1)).unwrap();
        assert!(view
            .key_window(0)
            .iter()
            .all(|v| (v.to_f32() + 2.0).abs() < 1e-3));
    }
}
