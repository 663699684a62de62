pub mod config;

pub use config::{ArchConfig, ModelConfig, NormKind};
