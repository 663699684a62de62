//! Low-rank adapters
//!
//! An adapter contributes `x @ A @ B` to a linear sublayer, with
//! `A: [in_features, rank]` and `B: [rank, out_features]`. Adapters are keyed
//! by an [`AdapterId`] handed out at registration, so two adapters loaded from
//! identical files stay distinct.

use crate::error::{Error, Result};
use half::f16;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Stable adapter identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AdapterId(u64);

impl AdapterId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "adapter#{}", self.0)
    }
}

/// Assigns adapter ids. Ids are never reused.
#[derive(Debug, Default)]
pub struct AdapterRegistry {
    next: u64,
    names: BTreeMap<AdapterId, String>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>) -> AdapterId {
        let id = AdapterId(self.next);
        self.next += 1;
        self.names.insert(id, name.into());
        id
    }

    pub fn unregister(&mut self, id: AdapterId) -> bool {
        self.names.remove(&id).is_some()
    }

    pub fn name(&self, id: AdapterId) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    pub fn contains(&self, id: AdapterId) -> bool {
        self.names.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = AdapterId> + '_ {
        self.names.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Row-major f16 factor matrix
#[derive(Debug, Clone, PartialEq)]
pub struct LoraMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f16>,
}

impl LoraMatrix {
    pub fn new(data: &[f32], rows: usize, cols: usize) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::InvalidArgument {
                arg: "data",
                reason: format!("{} values for a {rows}x{cols} factor", data.len()),
            });
        }
        Ok(Self {
            rows,
            cols,
            data: data.iter().map(|&v| f16::from_f32(v)).collect(),
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn data(&self) -> &[f16] {
        &self.data
    }
}

/// A/B factor pair of one adapter on one linear sublayer
#[derive(Debug, Clone)]
pub struct LoraWeights {
    pub a: Arc<LoraMatrix>,
    pub b: Arc<LoraMatrix>,
}

impl LoraWeights {
    /// Build from dense factors, folding `scaling` into `B`.
    pub fn new(
        a: &[f32],
        b: &[f32],
        in_features: usize,
        out_features: usize,
        rank: usize,
        scaling: f32,
    ) -> Result<Self> {
        if rank == 0 {
            return Err(Error::InvalidArgument {
                arg: "rank",
                reason: "adapter rank must be > 0".into(),
            });
        }
        let scaled: Vec<f32> = b.iter().map(|v| v * scaling).collect();
        Ok(Self {
            a: Arc::new(LoraMatrix::new(a, in_features, rank)?),
            b: Arc::new(LoraMatrix::new(&scaled, rank, out_features)?),
        })
    }

    pub fn rank(&self) -> usize {
        self.a.cols()
    }

    pub fn in_features(&self) -> usize {
        self.a.rows()
    }

    pub fn out_features(&self) -> usize {
        self.b.cols()
    }

    /// `y += (x @ A) @ B` for one row with f32 accumulation. `tmp` holds at
    /// least `rank` values.
    pub fn apply_row(&self, x: &[f16], tmp: &mut [f32], y: &mut [f32]) {
        let rank = self.rank();
        let tmp = &mut tmp[..rank];
        tmp.fill(0.0);
        for (xi, a_row) in x.iter().zip(self.a.data.chunks_exact(rank)) {
            let xi = xi.to_f32();
            for (t, av) in tmp.iter_mut().zip(a_row) {
                *t += xi * av.to_f32();
            }
        }
        for (t, b_row) in tmp.iter().zip(self.b.data.chunks_exact(self.b.cols)) {
            for (yo, bv) in y.iter_mut().zip(b_row) {
                *yo += t * bv.to_f32();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_ids_are_unique() {
        let mut reg = AdapterRegistry::new();
        let a = reg.register("style");
        let b = reg.register("style");
        assert_ne!(a, b);
        assert!(reg.unregister(a));
        assert!(!reg.unregister(a));
        let c = reg.register("other");
        assert!(c > b);
        assert_eq!(reg.name(b), Some("style"));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_apply_row() {
        // A = [[1], [1]] (in=2, rank=1), B = [[2, 3]] (rank=1, out=2), scaling 0.5
        let lora = LoraWeights::new(&[1.0, 1.0], &[2.0, 3.0], 2, 2, 1, 0.5).unwrap();
        let x = [f16::from_f32(1.0), f16::from_f32(3.0)];
        let mut tmp = [0.0f32; 1];
        let mut y = [1.0f32, 1.0];
        lora.apply_row(&x, &mut tmp, &mut y);
        assert_eq!(y, [5.0, 7.0]);
    }

    #[test]
    fn test_shape_mismatch() {
        assert!(LoraWeights::new(&[1.0; 3], &[1.0; 2], 2, 2, 1, 1.0).is_err());
        assert!(LoraWeights::new(&[], &[], 2, 2, 0, 1.0).is_err());
    }
}
