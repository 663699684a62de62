//! Device mapping for cache and layer placement
//!
//! Maps each transformer layer to the device that holds its KV state.
//! Caches consult the map on construction and when rebalancing.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Device ordinal
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub usize);

impl DeviceId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device:{}", self.0)
    }
}

/// Maps model layers to devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheDeviceMap {
    placements: Vec<DeviceId>,
}

impl CacheDeviceMap {
    /// All layers on a single device
    pub fn single(num_layers: usize, device: DeviceId) -> Self {
        Self {
            placements: vec![device; num_layers],
        }
    }

    /// Contiguous split: `layers_per_device[d]` consecutive layers go to device `d`
    pub fn split(layers_per_device: &[usize]) -> Self {
        let mut placements = Vec::with_capacity(layers_per_device.iter().sum());
        for (dev, &count) in layers_per_device.iter().enumerate() {
            placements.extend(std::iter::repeat(DeviceId(dev)).take(count));
        }
        Self { placements }
    }

    /// Explicit per-layer placement
    pub fn from_placements(placements: Vec<DeviceId>) -> Self {
        Self { placements }
    }

    /// Device for a specific layer
    pub fn device(&self, layer_idx: usize) -> Result<DeviceId> {
        self.placements
            .get(layer_idx)
            .copied()
            .ok_or_else(|| Error::InvalidArgument {
                arg: "layer_idx",
                reason: format!(
                    "layer {layer_idx} not in device map ({} layers)",
                    self.placements.len()
                ),
            })
    }

    /// Move one layer to another device
    pub fn set_device(&mut self, layer_idx: usize, device: DeviceId) -> Result<()> {
        let num_layers = self.placements.len();
        let slot = self
            .placements
            .get_mut(layer_idx)
            .ok_or_else(|| Error::InvalidArgument {
                arg: "layer_idx",
                reason: format!("layer {layer_idx} not in device map ({num_layers} layers)"),
            })?;
        *slot = device;
        Ok(())
    }

    /// Distinct devices referenced by the map, in ascending order
    pub fn devices(&self) -> Vec<DeviceId> {
        let mut devices = self.placements.clone();
        devices.sort_unstable();
        devices.dedup();
        devices
    }

    pub fn num_layers(&self) -> usize {
        self.placements.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, DeviceId)> + '_ {
        self.placements.iter().copied().enumerate()
    }

    /// Number of layers placed on `device`
    pub fn layer_count(&self, device: DeviceId) -> usize {
        self.placements.iter().filter(|d| **d == device).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_device() {
        let map = CacheDeviceMap::single(4, DeviceId(0));
        assert_eq!(map.num_layers(), 4);
        assert_eq!(map.devices(), vec![DeviceId(0)]);
        assert_eq!(map.layer_count(DeviceId(0)), 4);
    }

    #[test]
    fn test_split() {
        let map = CacheDeviceMap::split(&[2, 3]);
        assert_eq!(map.num_layers(), 5);
        assert_eq!(map.device(1).unwrap(), DeviceId(0));
        assert_eq!(map.device(2).unwrap(), DeviceId(1));
        assert_eq!(map.devices(), vec![DeviceId(0), DeviceId(1)]);
    }

    #[test]
    fn test_out_of_range_layer() {
        let mut map = CacheDeviceMap::single(2, DeviceId(0));
        assert!(map.device(2).is_err());
        assert!(map.set_device(5, DeviceId(1)).is_err());
        map.set_device(1, DeviceId(3)).unwrap();
        assert_eq!(map.devices(), vec![DeviceId(0), DeviceId(3)]);
    }
}
