//! Raw per-layer key/value buffers shared by every cache precision
//!
//! The store owns allocation, device placement, eviction and region copies.
//! Precision variants compose it with their own conversion strategy.

use crate::error::{Error, Result};
use crate::format::{CacheDeviceMap, DeviceId};
use crate::inference::kv_cache::buffer::StateBuffer;
use crate::inference::kv_cache::layout::{CacheLayout, CopyRegion};
use half::f16;
use tracing::{debug, info};

/// Per-layer key/value state (and scales when the precision has them)
#[derive(Debug, Clone)]
pub struct StateStore<E> {
    layout: CacheLayout,
    device_map: CacheDeviceMap,
    key_states: Vec<Option<StateBuffer<E>>>,
    value_states: Vec<Option<StateBuffer<E>>>,
    key_scales: Vec<Option<StateBuffer<f16>>>,
    value_scales: Vec<Option<StateBuffer<f16>>>,
    current_seq_len: usize,
    lazy: bool,
}

impl<E: Copy + Default> StateStore<E> {
    /// Allocate one buffer set per layer on its mapped device, or deferred
    /// placeholders when `lazy` is set.
    pub fn allocate(layout: CacheLayout, device_map: &CacheDeviceMap, lazy: bool) -> Result<Self> {
        let num_layers = device_map.num_layers();
        let has_scales = layout.precision.has_scales();
        let scale_layers = if has_scales { num_layers } else { 0 };

        let mut store = Self {
            layout,
            device_map: device_map.clone(),
            key_states: vec![None; num_layers],
            value_states: vec![None; num_layers],
            key_scales: vec![None; scale_layers],
            value_scales: vec![None; scale_layers],
            current_seq_len: 0,
            lazy,
        };

        if !lazy {
            for (layer, device) in device_map.iter() {
                store.materialize(layer, device);
            }
        }

        info!(
            precision = ?layout.precision,
            layers = num_layers,
            lazy,
            "allocated cache state"
        );
        Ok(store)
    }

    fn materialize(&mut self, layer: usize, device: DeviceId) {
        self.key_states[layer] = Some(StateBuffer::zeros(self.layout.shape_w(), device));
        self.value_states[layer] = Some(StateBuffer::zeros(self.layout.shape_w(), device));
        if self.layout.precision.has_scales() {
            self.key_scales[layer] = Some(StateBuffer::zeros(self.layout.shape_s(), device));
            self.value_scales[layer] = Some(StateBuffer::zeros(self.layout.shape_s(), device));
        }
    }

    /// Materialize every deferred layer mapped to `device`. Returns how many
    /// layers received buffers.
    pub fn touch_device(&mut self, device: DeviceId) -> usize {
        let pending: Vec<usize> = self
            .device_map
            .iter()
            .filter(|&(layer, d)| d == device && self.key_states[layer].is_none())
            .map(|(layer, _)| layer)
            .collect();
        for &layer in &pending {
            self.materialize(layer, device);
        }
        if !pending.is_empty() {
            debug!(%device, layers = pending.len(), "materialized deferred cache layers");
        }
        pending.len()
    }

    /// Deep-copy every buffer and the occupied length of `source`.
    pub fn copy_from(&mut self, source: &StateStore<E>) -> Result<()> {
        if self.lazy {
            return Err(Error::LazyCopy);
        }
        if self.layout != source.layout || self.num_layers() != source.num_layers() {
            return Err(Error::InvalidArgument {
                arg: "source",
                reason: "source cache has a different layout or layer count".into(),
            });
        }
        for layer in 0..source.num_layers() {
            if source.key_states[layer].is_none() {
                return Err(Error::LayerNotMaterialized { layer });
            }
        }
        self.key_states = source.key_states.clone();
        self.value_states = source.value_states.clone();
        self.key_scales = source.key_scales.clone();
        self.value_scales = source.value_scales.clone();
        self.device_map = source.device_map.clone();
        self.current_seq_len = source.current_seq_len;
        Ok(())
    }

    /// Re-place layers according to `device_map`.
    ///
    /// Layers already on their mapped device are untouched. Every other layer
    /// gets fresh zero-filled buffers on the new device; its previous content
    /// is dropped. Returns the indices of the reallocated layers.
    pub fn rebalance(&mut self, device_map: &CacheDeviceMap) -> Result<Vec<usize>> {
        if device_map.num_layers() != self.num_layers() {
            return Err(Error::InvalidArgument {
                arg: "device_map",
                reason: format!(
                    "map covers {} layers, cache has {}",
                    device_map.num_layers(),
                    self.num_layers()
                ),
            });
        }

        let mut moved = Vec::new();
        for (layer, device) in device_map.iter() {
            if let Some(existing) = &self.key_states[layer] {
                if existing.device() == device {
                    continue;
                }
            }
            self.materialize(layer, device);
            moved.push(layer);
        }
        self.device_map = device_map.clone();

        debug!(moved = ?moved, "rebalanced cache layers");
        Ok(moved)
    }

    /// Drop the oldest `count` tokens by rotating every layer left along
    /// the sequence dimension.
    pub fn evict_oldest(&mut self, count: usize) -> Result<()> {
        if count > self.current_seq_len {
            return Err(Error::InvalidArgument {
                arg: "count",
                reason: format!(
                    "cannot evict {count} tokens from a cache holding {}",
                    self.current_seq_len
                ),
            });
        }
        if count == 0 {
            return Ok(());
        }

        for buf in self
            .key_states
            .iter_mut()
            .chain(self.value_states.iter_mut())
            .flatten()
        {
            buf.roll_seq_left(count);
        }
        for buf in self
            .key_scales
            .iter_mut()
            .chain(self.value_scales.iter_mut())
            .flatten()
        {
            buf.roll_seq_left(count);
        }

        self.current_seq_len -= count;
        debug!(count, seq_len = self.current_seq_len, "evicted oldest tokens");
        Ok(())
    }

    /// Copy a sequence/row region of every layer into `target`.
    pub fn copy_region(&self, target: &mut StateStore<E>, region: &CopyRegion) -> Result<()> {
        region.check(&self.layout, &target.layout)?;
        if self.num_layers() != target.num_layers() {
            return Err(Error::InvalidArgument {
                arg: "target",
                reason: "layer count mismatch".into(),
            });
        }

        for layer in 0..self.num_layers() {
            copy_layer(&self.key_states, &mut target.key_states, layer, region)?;
            copy_layer(&self.value_states, &mut target.value_states, layer, region)?;
            if self.layout.precision.has_scales() {
                copy_layer(&self.key_scales, &mut target.key_scales, layer, region)?;
                copy_layer(&self.value_scales, &mut target.value_scales, layer, region)?;
            }
        }
        Ok(())
    }

    /// Region copy where source and target are the same session.
    pub fn copy_region_within(&mut self, region: &CopyRegion) -> Result<()> {
        region.check(&self.layout, &self.layout)?;
        for layer in 0..self.num_layers() {
            copy_layer_within(&mut self.key_states, layer, region)?;
            copy_layer_within(&mut self.value_states, layer, region)?;
            if self.layout.precision.has_scales() {
                copy_layer_within(&mut self.key_scales, layer, region)?;
                copy_layer_within(&mut self.value_scales, layer, region)?;
            }
        }
        Ok(())
    }

    /// Per-device resident bytes of all materialized buffers.
    pub fn footprint(&self) -> Vec<usize> {
        let mut fp = Vec::new();
        for buf in self.key_states.iter().chain(&self.value_states).flatten() {
            add_bytes(&mut fp, buf.device(), buf.byte_size());
        }
        for buf in self.key_scales.iter().chain(&self.value_scales).flatten() {
            add_bytes(&mut fp, buf.device(), buf.byte_size());
        }
        fp
    }

    /// Key and value buffers of a layer.
    pub fn layer(&self, layer: usize) -> Result<(&StateBuffer<E>, &StateBuffer<E>)> {
        match (self.key_states.get(layer), self.value_states.get(layer)) {
            (Some(Some(k)), Some(Some(v))) => Ok((k, v)),
            (Some(_), Some(_)) => Err(Error::LayerNotMaterialized { layer }),
            _ => Err(layer_out_of_range(layer, self.num_layers())),
        }
    }

    pub fn layer_mut(&mut self, layer: usize) -> Result<(&mut StateBuffer<E>, &mut StateBuffer<E>)> {
        let num_layers = self.num_layers();
        match (self.key_states.get_mut(layer), self.value_states.get_mut(layer)) {
            (Some(Some(k)), Some(Some(v))) => Ok((k, v)),
            (Some(_), Some(_)) => Err(Error::LayerNotMaterialized { layer }),
            _ => Err(layer_out_of_range(layer, num_layers)),
        }
    }

    /// Key and value scale buffers of a layer.
    pub fn layer_scales(&self, layer: usize) -> Result<(&StateBuffer<f16>, &StateBuffer<f16>)> {
        match (self.key_scales.get(layer), self.value_scales.get(layer)) {
            (Some(Some(k)), Some(Some(v))) => Ok((k, v)),
            (Some(_), Some(_)) => Err(Error::LayerNotMaterialized { layer }),
            _ => Err(no_scales(layer)),
        }
    }

    /// Codes and scales of a layer, mutably, in one borrow.
    #[allow(clippy::type_complexity)]
    pub fn layer_with_scales_mut(
        &mut self,
        layer: usize,
    ) -> Result<(
        &mut StateBuffer<E>,
        &mut StateBuffer<E>,
        &mut StateBuffer<f16>,
        &mut StateBuffer<f16>,
    )> {
        let num_layers = self.num_layers();
        match (
            self.key_states.get_mut(layer),
            self.value_states.get_mut(layer),
            self.key_scales.get_mut(layer),
            self.value_scales.get_mut(layer),
        ) {
            (Some(Some(k)), Some(Some(v)), Some(Some(ks)), Some(Some(vs))) => Ok((k, v, ks, vs)),
            (Some(_), Some(_), Some(_), Some(_)) => Err(Error::LayerNotMaterialized { layer }),
            (Some(_), Some(_), _, _) => Err(no_scales(layer)),
            _ => Err(layer_out_of_range(layer, num_layers)),
        }
    }

    /// Whether a layer has real buffers (lazy stores start without).
    pub fn is_materialized(&self, layer: usize) -> bool {
        matches!(self.key_states.get(layer), Some(Some(_)))
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn device_map(&self) -> &CacheDeviceMap {
        &self.device_map
    }

    pub fn num_layers(&self) -> usize {
        self.key_states.len()
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    pub fn current_seq_len(&self) -> usize {
        self.current_seq_len
    }

    pub fn reset(&mut self) {
        self.current_seq_len = 0;
    }

    pub fn set_current_seq_len(&mut self, len: usize) -> Result<()> {
        if len > self.layout.max_seq_len {
            return Err(Error::CacheRange {
                reason: format!(
                    "sequence length {len} exceeds max_seq_len {}",
                    self.layout.max_seq_len
                ),
            });
        }
        self.current_seq_len = len;
        Ok(())
    }
}

fn copy_layer<T: Copy + Default>(
    src: &[Option<StateBuffer<T>>],
    dst: &mut [Option<StateBuffer<T>>],
    layer: usize,
    region: &CopyRegion,
) -> Result<()> {
    let src_buf = src[layer]
        .as_ref()
        .ok_or(Error::LayerNotMaterialized { layer })?;
    let dst_buf = dst[layer]
        .as_mut()
        .ok_or(Error::LayerNotMaterialized { layer })?;
    for t in 0..region.to_rows {
        dst_buf.copy_span_from(
            src_buf,
            region.source_row(t),
            region.from_column,
            region.to_row + t,
            region.to_column,
            region.to_columns,
        );
    }
    Ok(())
}

fn copy_layer_within<T: Copy + Default>(
    bufs: &mut [Option<StateBuffer<T>>],
    layer: usize,
    region: &CopyRegion,
) -> Result<()> {
    let buf = bufs[layer]
        .as_mut()
        .ok_or(Error::LayerNotMaterialized { layer })?;
    // read from a snapshot so overlapping rows see pre-copy content
    let snapshot = buf.clone();
    for t in 0..region.to_rows {
        buf.copy_span_from(
            &snapshot,
            region.source_row(t),
            region.from_column,
            region.to_row + t,
            region.to_column,
            region.to_columns,
        );
    }
    Ok(())
}

pub(crate) fn add_bytes(fp: &mut Vec<usize>, device: DeviceId, bytes: usize) {
    let idx = device.index();
    if fp.len() <= idx {
        fp.resize(idx + 1, 0);
    }
    fp[idx] += bytes;
}

fn layer_out_of_range(layer: usize, num_layers: usize) -> Error {
    Error::InvalidArgument {
        arg: "layer",
        reason: format!("layer {layer} out of range ({num_layers} layers)"),
    }
}

fn no_scales(layer: usize) -> Error {
    Error::InvalidArgument {
        arg: "layer",
        reason: format!("layer {layer} has no scale buffers"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::kv_cache::layout::CachePrecision;

    fn layout(precision: CachePrecision) -> CacheLayout {
        CacheLayout::new(2, 8, 1, 32, precision).unwrap()
    }

    #[test]
    fn test_eager_allocation() {
        let map = CacheDeviceMap::split(&[1, 2]);
        let store = StateStore::<u8>::allocate(layout(CachePrecision::Q4), &map, false).unwrap();
        assert_eq!(store.num_layers(), 3);
        assert!(store.is_materialized(2));
        let (k, _) = store.layer(2).unwrap();
        assert_eq!(k.device(), DeviceId(1));
        assert_eq!(k.shape(), [2, 8, 1, 16]);
        let (ks, _) = store.layer_scales(0).unwrap();
        assert_eq!(ks.shape(), [2, 8, 1, 1]);
    }

    #[test]
    fn test_lazy_allocation_defers_buffers() {
        let map = CacheDeviceMap::single(2, DeviceId(0));
        let store = StateStore::<f16>::allocate(layout(CachePrecision::Fp16), &map, true).unwrap();
        assert!(!store.is_materialized(0));
        assert!(matches!(
            store.layer(0),
            Err(Error::LayerNotMaterialized { layer: 0 })
        ));
        assert!(store.footprint().is_empty());
    }

    #[test]
    fn test_copy_from_into_lazy_rejected() {
        let map = CacheDeviceMap::single(2, DeviceId(0));
        let source = StateStore::<u8>::allocate(layout(CachePrecision::Fp8), &map, false).unwrap();
        let mut lazy = StateStore::<u8>::allocate(layout(CachePrecision::Fp8), &map, true).unwrap();
        assert!(matches!(lazy.copy_from(&source), Err(Error::LazyCopy)));
    }

    #[test]
    fn test_copy_from_replicates_seq_len() {
        let map = CacheDeviceMap::single(1, DeviceId(0));
        let mut source = StateStore::<u8>::allocate(layout(CachePrecision::Fp8), &map, false).unwrap();
        source.layer_mut(0).unwrap().0.as_mut_slice()[5] = 42;
        source.set_current_seq_len(3).unwrap();

        let mut copy = StateStore::<u8>::allocate(layout(CachePrecision::Fp8), &map, false).unwrap();
        copy.copy_from(&source).unwrap();
        assert_eq!(copy.current_seq_len(), 3);
        assert_eq!(copy.layer(0).unwrap().0.as_slice()[5], 42);
    }

    #[test]
    fn test_evict_more_than_stored_fails() {
        let map = CacheDeviceMap::single(1, DeviceId(0));
        let mut store = StateStore::<u8>::allocate(layout(CachePrecision::Fp8), &map, false).unwrap();
        store.set_current_seq_len(2).unwrap();
        assert!(store.evict_oldest(3).is_err());
        store.evict_oldest(2).unwrap();
        assert_eq!(store.current_seq_len(), 0);
        assert!(store.set_current_seq_len(9).is_err());
    }

    #[test]
    fn test_footprint_counts_scales() {
        let map = CacheDeviceMap::split(&[1, 1]);
        let store = StateStore::<u8>::allocate(layout(CachePrecision::Q4), &map, false).unwrap();
        // codes: 2 * (2*8*1*16) bytes, scales: 2 * (2*8*1*1) * 2 bytes
        let per_device = 2 * 256 + 2 * 16 * 2;
        assert_eq!(store.footprint(), vec![per_device, per_device]);
    }

    #[test]
    fn test_copy_region_within_broadcasts() {
        let map = CacheDeviceMap::single(1, DeviceId(0));
        let mut store = StateStore::<u8>::allocate(layout(CachePrecision::Fp8), &map, false).unwrap();
        for (i, v) in store.layer_mut(0).unwrap().0.as_mut_slice()[..8 * 32]
            .iter_mut()
            .enumerate()
        {
            *v = (i % 251) as u8;
        }
        store
            .copy_region_within(&CopyRegion::broadcast(0..4, 0, 2))
            .unwrap();
        let k = store.layer(0).unwrap().0.as_slice();
        assert_eq!(&k[..4 * 32], &k[8 * 32..12 * 32]);
    }

    #[test]
    fn test_touch_device_materializes_only_its_layers() {
        let map = CacheDeviceMap::split(&[2, 1]);
        let mut store = StateStore::<u8>::allocate(layout(CachePrecision::Fp8), &map, true).unwrap();
        assert_eq!(store.touch_device(DeviceId(1)), 1);
        assert!(store.is_materialized(2));
        assert!(!store.is_materialized(0));
        assert_eq!(store.touch_device(DeviceId(1)), 0);
        assert_eq!(store.footprint(), vec![0, 2 * 2 * 8 * 32]);
    }
}
