//! WeightMap: named checkpoint weights (dense and quantized)

use crate::error::{Error, Result};
use crate::nn::weight::Weight;
use crate::quant::QuantMatrix;
use numr::runtime::cpu::CpuRuntime;
use numr::tensor::Tensor;
use std::collections::HashMap;

/// Named collection of checkpoint weights, keyed by full tensor name.
#[derive(Default)]
pub struct WeightMap {
    data: HashMap<String, Weight>,
}

impl WeightMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a dense tensor.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor<CpuRuntime>) {
        self.data.insert(name.into(), Weight::Standard(tensor));
    }

    /// Insert a quantized matrix.
    pub fn insert_quant(&mut self, name: impl Into<String>, matrix: QuantMatrix) {
        self.data.insert(name.into(), Weight::Quantized(matrix));
    }

    pub fn get(&self, name: &str) -> Result<&Weight> {
        self.data.get(name).ok_or_else(|| Error::ModelError {
            reason: format!("weight not found: {name}"),
        })
    }

    /// Get a dense tensor by name.
    pub fn get_tensor(&self, name: &str) -> Result<&Tensor<CpuRuntime>> {
        self.get(name)?.as_tensor()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.data.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
