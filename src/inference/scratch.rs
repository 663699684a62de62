//! Per-device scratch region with bump allocation
//!
//! A model load owns one region per device. Each MLP handle on that device
//! receives fixed slices carved out at load time; `begin_alloc` rewinds the
//! cursor so every layer reuses the same offsets. The region cannot be resized
//! while any slice is still held.

use crate::error::{Error, Result};
use crate::format::DeviceId;
use half::f16;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Byte alignment of every slice
pub const SCRATCH_ALIGN: usize = 128;

type Region = Arc<Mutex<Vec<f16>>>;

/// Byte range of a scratch region, bound to that region
#[derive(Debug, Clone)]
pub struct ScratchSlice {
    region: Region,
    device: DeviceId,
    offset: usize,
    len: usize,
}

impl ScratchSlice {
    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn byte_offset(&self) -> usize {
        self.offset
    }

    pub fn byte_len(&self) -> usize {
        self.len
    }

    /// Capacity in f16 elements
    pub fn elements(&self) -> usize {
        self.len / 2
    }

    /// f16 element range inside the region
    pub fn element_range(&self) -> Range<usize> {
        let start = self.offset / 2;
        start..start + self.elements()
    }

    pub fn same_region(&self, other: &ScratchSlice) -> bool {
        Arc::ptr_eq(&self.region, &other.region)
    }

    /// Lock the whole region this slice lives in.
    pub fn lock_region(&self) -> Result<MutexGuard<'_, Vec<f16>>> {
        self.region.lock().map_err(|e| Error::KernelError {
            reason: format!("scratch region on {} poisoned: {e}", self.device),
        })
    }
}

#[derive(Debug)]
pub struct DeviceScratch {
    device: DeviceId,
    region: Region,
    capacity: usize,
    cursor: usize,
}

impl DeviceScratch {
    pub fn new(device: DeviceId, bytes: usize) -> Self {
        let capacity = align_up(bytes);
        debug!(%device, bytes = capacity, "allocated scratch region");
        Self {
            device,
            region: Arc::new(Mutex::new(vec![f16::ZERO; capacity / 2])),
            capacity,
            cursor: 0,
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes handed out since the last `begin_alloc`
    pub fn used(&self) -> usize {
        self.cursor
    }

    /// Slices currently held outside the allocator
    pub fn bindings(&self) -> usize {
        Arc::strong_count(&self.region) - 1
    }

    /// Rewind the bump cursor. Previously handed-out slices stay valid and
    /// alias the slices handed out next.
    pub fn begin_alloc(&mut self) {
        self.cursor = 0;
    }

    pub fn slice(&mut self, bytes: usize) -> Result<ScratchSlice> {
        let aligned = align_up(bytes);
        let available = self.capacity - self.cursor;
        if aligned > available {
            return Err(Error::ScratchExhausted {
                device: self.device,
                requested: aligned,
                available,
            });
        }
        let slice = ScratchSlice {
            region: Arc::clone(&self.region),
            device: self.device,
            offset: self.cursor,
            len: bytes,
        };
        self.cursor += aligned;
        Ok(slice)
    }

    /// Replace the region with one of `bytes` bytes.
    pub fn resize(&mut self, bytes: usize) -> Result<()> {
        let bindings = self.bindings();
        if bindings > 0 {
            return Err(Error::ScratchInUse {
                device: self.device,
                bindings,
            });
        }
        self.capacity = align_up(bytes);
        self.region = Arc::new(Mutex::new(vec![f16::ZERO; self.capacity / 2]));
        self.cursor = 0;
        debug!(device = %self.device, bytes = self.capacity, "resized scratch region");
        Ok(())
    }
}

pub(crate) fn align_up(bytes: usize) -> usize {
    bytes.div_ceil(SCRATCH_ALIGN) * SCRATCH_ALIGN
}

/// Split `data` into disjoint mutable parts, one per range. `None` when the
/// ranges overlap or fall outside `data`.
pub(crate) fn carve<'a, const N: usize>(
    data: &'a mut [f16],
    ranges: [Range<usize>; N],
) -> Option<[&'a mut [f16]; N]> {
    let mut order: [usize; N] = std::array::from_fn(|i| i);
    order.sort_by_key(|&i| ranges[i].start);

    let mut parts: [Option<&'a mut [f16]>; N] = std::array::from_fn(|_| None);
    let mut rest = data;
    let mut base = 0;
    for i in order {
        let r = &ranges[i];
        if r.start < base || r.end < r.start || r.end - base > rest.len() {
            return None;
        }
        let (_, tail) = std::mem::take(&mut rest).split_at_mut(r.start - base);
        let (part, tail) = tail.split_at_mut(r.end - r.start);
        parts[i] = Some(part);
        rest = tail;
        base = r.end;
    }
    Some(parts.map(Option::unwrap_or_default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slices_are_aligned() {
        let mut scratch = DeviceScratch::new(DeviceId(0), 1000);
        assert_eq!(scratch.capacity(), 1024);
        let a = scratch.slice(130).unwrap();
        let b = scratch.slice(10).unwrap();
        assert_eq!(a.byte_offset(), 0);
        assert_eq!(b.byte_offset(), 256);
        assert_eq!(scratch.used(), 384);
        assert!(a.same_region(&b));
        assert_eq!(b.element_range(), 128..133);
    }

    #[test]
    fn test_exhaustion() {
        let mut scratch = DeviceScratch::new(DeviceId(1), 256);
        scratch.slice(200).unwrap();
        assert!(matches!(
            scratch.slice(1),
            Err(Error::ScratchExhausted { requested: 128, available: 0, .. })
        ));
        scratch.begin_alloc();
        assert!(scratch.slice(256).is_ok());
    }

    #[test]
    fn test_resize_refused_while_bound() {
        let mut scratch = DeviceScratch::new(DeviceId(0), 512);
        let slice = scratch.slice(128).unwrap();
        assert!(matches!(
            scratch.resize(1024),
            Err(Error::ScratchInUse { bindings: 1, .. })
        ));
        drop(slice);
        scratch.resize(1024).unwrap();
        assert_eq!(scratch.capacity(), 1024);
        assert_eq!(scratch.bindings(), 0);
    }

    #[test]
    fn test_carve_disjoint() {
        let mut data = vec![f16::ZERO; 10];
        let [a, b] = carve(&mut data, [6..10, 0..4]).unwrap();
        a.fill(f16::ONE);
        b[0] = f16::ONE;
        assert_eq!(data[0], f16::ONE);
        assert_eq!(data[5], f16::ZERO);
        assert_eq!(data[9], f16::ONE);

        let mut data = vec![f16::ZERO; 10];
        assert!(carve(&mut data, [0..4, 3..6]).is_none());
        assert!(carve(&mut data, [8..12]).is_none());
    }
}
