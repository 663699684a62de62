//! Adapter composition for the fused MLP handle
//!
//! The handle only sees adapters after `update`; attaching or detaching one
//! bumps the generation so a forgotten update is detectable, but `forward`
//! never checks it.

use crate::error::Result;
use crate::nn::linear::MlpLinear;
use crate::ops::traits::{FusedMlpOps, MlpLoras, SublayerLoras};
use std::collections::BTreeSet;
use tracing::info;

#[derive(Debug, Default)]
pub struct AdapterComposer {
    temp_lora_size: usize,
    generation: u64,
    applied: Option<u64>,
}

impl AdapterComposer {
    /// Elements of the blending buffer passed to the fused call
    pub fn temp_lora_size(&self) -> usize {
        self.temp_lora_size
    }

    /// Whether the adapter set changed since the last `update`.
    pub fn is_stale(&self) -> bool {
        self.applied != Some(self.generation)
    }

    pub(crate) fn mark_changed(&mut self) {
        self.generation += 1;
    }

    /// Fresh handle: nothing uploaded yet. In sync when no adapter is attached.
    pub(crate) fn reset(&mut self, in_sync: bool) {
        self.temp_lora_size = 0;
        self.applied = in_sync.then_some(self.generation);
    }

    /// Upload the factors attached to each sublayer and resize the blending
    /// buffer to `per_row * max_rows` elements.
    pub fn update<K: FusedMlpOps>(
        &mut self,
        client: &K,
        handle: &mut K::Handle,
        gate: Option<&MlpLinear>,
        up: &MlpLinear,
        down: &MlpLinear,
        max_rows: usize,
    ) -> Result<usize> {
        let loras = MlpLoras {
            gate: gate.map(sublayer_loras).unwrap_or_default(),
            up: sublayer_loras(up),
            down: sublayer_loras(down),
        };
        let adapters = [&loras.gate, &loras.up, &loras.down]
            .iter()
            .flat_map(|l| l.a.keys())
            .collect::<BTreeSet<_>>()
            .len();

        let per_row = client.q_mlp_set_loras(handle, loras)?;
        self.temp_lora_size = per_row * max_rows;
        self.applied = Some(self.generation);
        info!(
            adapters,
            temp_lora_size = self.temp_lora_size,
            "updated MLP adapters"
        );
        Ok(self.temp_lora_size)
    }
}

fn sublayer_loras(linear: &MlpLinear) -> SublayerLoras {
    SublayerLoras {
        a: linear
            .loras()
            .iter()
            .map(|(id, l)| (*id, l.a.clone()))
            .collect(),
        b: linear
            .loras()
            .iter()
            .map(|(id, l)| (*id, l.b.clone()))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staleness_tracking() {
        let mut composer = AdapterComposer::default();
        assert!(composer.is_stale());
        composer.reset(true);
        assert!(!composer.is_stale());
        composer.mark_changed();
        assert!(composer.is_stale());
        composer.reset(false);
        assert!(composer.is_stale());
        assert_eq!(composer.temp_lora_size(), 0);
    }
}
