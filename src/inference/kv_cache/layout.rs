//! Cache precision variants, buffer shapes and access windows

use crate::error::{Error, Result};
use crate::quant::Q4_GROUP_SIZE;

/// Storage precision of a cache session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CachePrecision {
    /// Native f16, no conversion
    Fp16,
    /// e5m2 by truncation, one byte per value
    Fp8,
    /// Grouped 4-bit round-to-nearest with f16 side scales
    Q4,
}

impl CachePrecision {
    /// Logical values packed into one storage element
    pub const fn weights_per_element(self) -> usize {
        match self {
            Self::Fp16 | Self::Fp8 => 1,
            Self::Q4 => 2,
        }
    }

    /// Whether a parallel scale buffer exists per layer
    pub const fn has_scales(self) -> bool {
        matches!(self, Self::Q4)
    }

    /// Whether reads and writes go through per-device f16 staging buffers
    pub const fn uses_staging(self) -> bool {
        !matches!(self, Self::Fp16)
    }
}

/// Logical shape `(batch, max_seq_len, kv_heads, head_dim)` shared by every
/// per-layer buffer, plus the precision that decides the trailing storage width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLayout {
    pub batch_size: usize,
    pub max_seq_len: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub precision: CachePrecision,
}

impl CacheLayout {
    pub fn new(
        batch_size: usize,
        max_seq_len: usize,
        num_kv_heads: usize,
        head_dim: usize,
        precision: CachePrecision,
    ) -> Result<Self> {
        if batch_size == 0 || max_seq_len == 0 || num_kv_heads == 0 || head_dim == 0 {
            return Err(Error::InvalidArgument {
                arg: "layout",
                reason: format!(
                    "all dimensions must be > 0 (batch {batch_size}, seq {max_seq_len}, \
                     heads {num_kv_heads}, head_dim {head_dim})"
                ),
            });
        }
        if head_dim % precision.weights_per_element() != 0 {
            return Err(Error::InvalidArgument {
                arg: "head_dim",
                reason: format!(
                    "{head_dim} not divisible by {} values per element",
                    precision.weights_per_element()
                ),
            });
        }
        if precision.has_scales() && head_dim % Q4_GROUP_SIZE != 0 {
            return Err(Error::InvalidArgument {
                arg: "head_dim",
                reason: format!("{head_dim} not a multiple of the {Q4_GROUP_SIZE}-element scale group"),
            });
        }
        Ok(Self {
            batch_size,
            max_seq_len,
            num_kv_heads,
            head_dim,
            precision,
        })
    }

    /// Native-precision shape (staging buffers)
    pub fn shape_basic(&self) -> [usize; 4] {
        [self.batch_size, self.max_seq_len, self.num_kv_heads, self.head_dim]
    }

    /// Storage shape of key/value buffers
    pub fn shape_w(&self) -> [usize; 4] {
        [
            self.batch_size,
            self.max_seq_len,
            self.num_kv_heads,
            self.head_dim / self.precision.weights_per_element(),
        ]
    }

    /// Shape of the scale buffers
    pub fn shape_s(&self) -> [usize; 4] {
        [
            self.batch_size,
            self.max_seq_len,
            self.num_kv_heads,
            self.head_dim / Q4_GROUP_SIZE,
        ]
    }

    /// Head layout and precision match; batch and sequence length may differ
    pub fn is_compatible(&self, other: &CacheLayout) -> bool {
        self.num_kv_heads == other.num_kv_heads
            && self.head_dim == other.head_dim
            && self.precision == other.precision
    }

    /// Validate a read/write window against this layout.
    pub fn check_window(&self, window: CacheWindow) -> Result<()> {
        if window.batch_size > self.batch_size {
            return Err(Error::CacheRange {
                reason: format!(
                    "window batch {} exceeds cache batch {}",
                    window.batch_size, self.batch_size
                ),
            });
        }
        let end = span_end(window.offset, window.width, "window")?;
        if end > self.max_seq_len {
            return Err(Error::CacheRange {
                reason: format!(
                    "window {}..{end} exceeds max_seq_len {}",
                    window.offset, self.max_seq_len
                ),
            });
        }
        Ok(())
    }
}

/// Strides of a `(batch, seq, heads, inner)` buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strides {
    /// Elements per token position (all heads)
    pub token: usize,
    /// Elements per batch row (all positions)
    pub row: usize,
}

impl Strides {
    pub fn of(shape: [usize; 4]) -> Self {
        let token = shape[2] * shape[3];
        Self {
            token,
            row: shape[1] * token,
        }
    }

    /// Element range of positions `offset..offset + width` in batch row `b`
    pub fn span(&self, b: usize, offset: usize, width: usize) -> std::ops::Range<usize> {
        let start = b * self.row + offset * self.token;
        start..start + width * self.token
    }
}

/// `(batch_size, offset, width)` window over the sequence dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheWindow {
    pub batch_size: usize,
    pub offset: usize,
    pub width: usize,
}

impl CacheWindow {
    pub fn new(batch_size: usize, offset: usize, width: usize) -> Self {
        Self {
            batch_size,
            offset,
            width,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.batch_size == 0
    }
}

/// Sequence/row region copied between sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    pub from_column: usize,
    pub from_columns: usize,
    pub to_column: usize,
    pub to_columns: usize,
    pub from_row: usize,
    pub from_rows: usize,
    pub to_row: usize,
    pub to_rows: usize,
}

impl CopyRegion {
    /// Fan one source row out to `to_rows` destination rows
    pub fn broadcast(columns: std::ops::Range<usize>, from_row: usize, to_rows: usize) -> Self {
        let width = columns.end - columns.start;
        Self {
            from_column: columns.start,
            from_columns: width,
            to_column: columns.start,
            to_columns: width,
            from_row,
            from_rows: 1,
            to_row: 0,
            to_rows,
        }
    }

    pub(crate) fn check(&self, source: &CacheLayout, target: &CacheLayout) -> Result<()> {
        if !source.is_compatible(target) {
            return Err(Error::InvalidArgument {
                arg: "target",
                reason: "source and target caches have different head layout or precision".into(),
            });
        }
        if self.from_columns != self.to_columns {
            return Err(Error::CacheRange {
                reason: format!(
                    "source width {} differs from target width {}",
                    self.from_columns, self.to_columns
                ),
            });
        }
        let to_end = span_end(self.to_column, self.to_columns, "target columns")?;
        if to_end > target.max_seq_len {
            return Err(Error::CacheRange {
                reason: format!(
                    "target columns {}..{to_end} exceed max_seq_len {}",
                    self.to_column, target.max_seq_len
                ),
            });
        }
        let from_end = span_end(self.from_column, self.from_columns, "source columns")?;
        if from_end > source.max_seq_len {
            return Err(Error::CacheRange {
                reason: format!(
                    "source columns {}..{from_end} exceed max_seq_len {}",
                    self.from_column, source.max_seq_len
                ),
            });
        }
        if self.from_rows != self.to_rows && self.from_rows != 1 {
            return Err(Error::CacheRange {
                reason: format!(
                    "can only broadcast from a single row, got {} source rows for {} target rows",
                    self.from_rows, self.to_rows
                ),
            });
        }
        let from_end = span_end(self.from_row, self.from_rows, "source rows")?;
        if from_end > source.batch_size {
            return Err(Error::CacheRange {
                reason: format!(
                    "source rows {}..{from_end} exceed batch {}",
                    self.from_row, source.batch_size
                ),
            });
        }
        let to_end = span_end(self.to_row, self.to_rows, "target rows")?;
        if to_end > target.batch_size {
            return Err(Error::CacheRange {
                reason: format!(
                    "target rows {}..{to_end} exceed batch {}",
                    self.to_row, target.batch_size
                ),
            });
        }
        Ok(())
    }

    /// Source batch row feeding target row index `t` (relative to `to_row`)
    pub(crate) fn source_row(&self, t: usize) -> usize {
        if self.from_rows == 1 {
            self.from_row
        } else {
            self.from_row + t
        }
    }
}

/// `start + len`, or `CacheRange` when it does not fit in `usize`
fn span_end(start: usize, len: usize, what: &str) -> Result<usize> {
    start.checked_add(len).ok_or_else(|| Error::CacheRange {
        reason: format!("{what} {start}+{len} overflows"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shapes_per_precision() {
        let fp16 = CacheLayout::new(2, 16, 4, 64, CachePrecision::Fp16).unwrap();
        assert_eq!(fp16.shape_w(), [2, 16, 4, 64]);

        let q4 = CacheLayout::new(2, 16, 4, 64, CachePrecision::Q4).unwrap();
        assert_eq!(q4.shape_basic(), [2, 16, 4, 64]);
        assert_eq!(q4.shape_w(), [2, 16, 4, 32]);
        assert_eq!(q4.shape_s(), [2, 16, 4, 2]);
        assert!(!fp16.is_compatible(&q4));
    }

    #[test]
    fn test_q4_requires_group_multiple() {
        assert!(CacheLayout::new(1, 8, 1, 48, CachePrecision::Q4).is_err());
        assert!(CacheLayout::new(1, 8, 1, 48, CachePrecision::Fp8).is_ok());
        assert!(CacheLayout::new(0, 8, 1, 64, CachePrecision::Fp8).is_err());
    }

    #[test]
    fn test_window_range() {
        let layout = CacheLayout::new(2, 16, 1, 32, CachePrecision::Fp8).unwrap();
        assert!(layout.check_window(CacheWindow::new(2, 10, 6)).is_ok());
        assert!(layout.check_window(CacheWindow::new(2, 10, 7)).is_err());
        assert!(layout.check_window(CacheWindow::new(3, 0, 1)).is_err());
        assert!(matches!(
            layout.check_window(CacheWindow::new(1, usize::MAX, 2)),
            Err(Error::CacheRange { .. })
        ));
    }

    #[test]
    fn test_strides_span() {
        let s = Strides::of([2, 8, 2, 4]);
        assert_eq!(s.token, 8);
        assert_eq!(s.row, 64);
        assert_eq!(s.span(1, 2, 3), 80..104);
    }

    #[test]
    fn test_copy_region_checks() {
        let src = CacheLayout::new(1, 16, 1, 32, CachePrecision::Fp16).unwrap();
        let dst = CacheLayout::new(4, 16, 1, 32, CachePrecision::Fp16).unwrap();

        assert!(CopyRegion::broadcast(0..8, 0, 4).check(&src, &dst).is_ok());
        assert!(CopyRegion::broadcast(10..17, 0, 4).check(&src, &dst).is_err());

        let mut two_rows = CopyRegion::broadcast(0..8, 0, 4);
        two_rows.from_rows = 2;
        assert!(two_rows.check(&dst, &dst).is_err());

        let mut far = CopyRegion::broadcast(0..8, 0, 4);
        far.to_column = usize::MAX - 2;
        assert!(matches!(far.check(&src, &dst), Err(Error::CacheRange { .. })));
        let mut far = CopyRegion::broadcast(0..8, 0, 4);
        far.from_row = usize::MAX;
        assert!(matches!(far.check(&src, &dst), Err(Error::CacheRange { .. })));
    }
}
