//! Per-layer state buffer placed on one device

use crate::format::DeviceId;
use crate::inference::kv_cache::layout::Strides;

/// Zero-initialised contiguous `(batch, seq, heads, inner)` buffer
#[derive(Debug, Clone, PartialEq)]
pub struct StateBuffer<T> {
    data: Vec<T>,
    shape: [usize; 4],
    device: DeviceId,
}

impl<T: Copy + Default> StateBuffer<T> {
    pub fn zeros(shape: [usize; 4], device: DeviceId) -> Self {
        Self {
            data: vec![T::default(); shape.iter().product()],
            shape,
            device,
        }
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Resident bytes
    pub fn byte_size(&self) -> usize {
        self.data.len() * std::mem::size_of::<T>()
    }

    pub fn strides(&self) -> Strides {
        Strides::of(self.shape)
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Rotate every batch row left by `count` positions along the sequence.
    pub fn roll_seq_left(&mut self, count: usize) {
        let strides = self.strides();
        if count == 0 || strides.row == 0 {
            return;
        }
        let shift = (count % self.shape[1]) * strides.token;
        for row in self.data.chunks_exact_mut(strides.row) {
            row.rotate_left(shift);
        }
    }

    /// Copy `width` positions from `src` row `src_row` at `src_col` into
    /// row `dst_row` at `dst_col` of `self`. Both buffers must share the
    /// trailing `(heads, inner)` dimensions.
    pub fn copy_span_from(
        &mut self,
        src: &StateBuffer<T>,
        src_row: usize,
        src_col: usize,
        dst_row: usize,
        dst_col: usize,
        width: usize,
    ) {
        debug_assert_eq!(src.strides().token, self.strides().token);
        let from = src.strides().span(src_row, src_col, width);
        let to = self.strides().span(dst_row, dst_col, width);
        self.data[to].copy_from_slice(&src.data[from]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeros_and_size() {
        let buf = StateBuffer::<u8>::zeros([2, 4, 1, 8], DeviceId(1));
        assert_eq!(buf.numel(), 64);
        assert_eq!(buf.byte_size(), 64);
        assert_eq!(buf.device(), DeviceId(1));
        assert!(buf.as_slice().iter().all(|&v| v == 0));
    }

    #[test]
    fn test_roll_seq_left_per_row() {
        let mut buf = StateBuffer::<u8>::zeros([2, 4, 1, 1], DeviceId(0));
        buf.as_mut_slice().copy_from_slice(&[0, 1, 2, 3, 10, 11, 12, 13]);
        buf.roll_seq_left(1);
        assert_eq!(buf.as_slice(), &[1, 2, 3, 0, 11, 12, 13, 10]);
    }

    #[test]
    fn test_copy_span() {
        let mut dst = StateBuffer::<u8>::zeros([2, 4, 1, 2], DeviceId(0));
        let mut src = StateBuffer::<u8>::zeros([1, 8, 1, 2], DeviceId(0));
        for (i, v) in src.as_mut_slice().iter_mut().enumerate() {
            *v = i as u8;
        }
        dst.copy_span_from(&src, 0, 1, 1, 0, 2);
        assert_eq!(&dst.as_slice()[8..12], &[2, 3, 4, 5]);
    }
}
