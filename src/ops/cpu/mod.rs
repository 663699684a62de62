pub mod cache;
pub mod mlp;
