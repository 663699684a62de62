//! Per-device f16 staging pairs for compressed cache precisions
//!
//! Attention reads and writes native-precision windows; the 8-bit and 4-bit
//! caches convert between these buffers and their storage on demand. One
//! key/value pair exists per device, shared by every layer placed there.

use crate::error::{Error, Result};
use crate::format::DeviceId;
use crate::inference::kv_cache::buffer::StateBuffer;
use crate::inference::kv_cache::store::add_bytes;
use half::f16;
use std::collections::BTreeMap;
use tracing::debug;

type StagingPair = (StateBuffer<f16>, StateBuffer<f16>);

#[derive(Debug)]
pub struct StagingPool {
    shape: [usize; 4],
    pairs: BTreeMap<DeviceId, StagingPair>,
}

impl StagingPool {
    pub fn new(shape: [usize; 4]) -> Self {
        Self {
            shape,
            pairs: BTreeMap::new(),
        }
    }

    /// Allocate the pair for `device` if it does not exist yet.
    pub fn touch(&mut self, device: DeviceId) {
        let shape = self.shape;
        self.pairs.entry(device).or_insert_with(|| {
            debug!(%device, "allocated staging buffers");
            (
                StateBuffer::zeros(shape, device),
                StateBuffer::zeros(shape, device),
            )
        });
    }

    pub fn get(&self, device: DeviceId) -> Result<(&StateBuffer<f16>, &StateBuffer<f16>)> {
        self.pairs
            .get(&device)
            .map(|(k, v)| (k, v))
            .ok_or(Error::StagingMissing { device })
    }

    pub fn get_mut(
        &mut self,
        device: DeviceId,
    ) -> Result<(&mut StateBuffer<f16>, &mut StateBuffer<f16>)> {
        self.pairs
            .get_mut(&device)
            .map(|(k, v)| (k, v))
            .ok_or(Error::StagingMissing { device })
    }

    pub fn devices(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.pairs.keys().copied()
    }

    /// Zeroed pool touching the same devices
    pub fn fresh(&self) -> Self {
        let mut pool = Self::new(self.shape);
        for device in self.devices() {
            pool.touch(device);
        }
        pool
    }

    pub fn add_footprint(&self, fp: &mut Vec<usize>) {
        for (device, (k, v)) in &self.pairs {
            add_bytes(fp, *device, k.byte_size() + v.byte_size());
        }
    }
}
