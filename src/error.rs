//! kvfuse error types

use crate::format::DeviceId;

/// kvfuse result type
pub type Result<T> = std::result::Result<T, Error>;

/// kvfuse errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from numr operations
    #[error("numr error: {0}")]
    Numr(#[from] numr::error::Error),

    /// Invalid argument to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// A cache window or copy region falls outside the allocated sequence
    #[error("cache range error: {reason}")]
    CacheRange {
        /// Which endpoint is out of range
        reason: String,
    },

    /// Copying state into a lazily initialized store
    #[error("cannot copy cache state into a lazily initialized store")]
    LazyCopy,

    /// Layer buffers are still deferred placeholders
    #[error("cache layer {layer} has no buffers yet (lazy cache not touched for its device)")]
    LayerNotMaterialized {
        /// Layer index
        layer: usize,
    },

    /// Staging buffers missing for a device
    #[error("no staging buffers for {device}")]
    StagingMissing {
        /// Device the layer is mapped to
        device: DeviceId,
    },

    /// Some MLP sublayers are quantized and some are not
    #[error("partially quantized MLP layer '{key}'")]
    PartiallyQuantized {
        /// Checkpoint key of the block
        key: String,
    },

    /// Scratch sizing precondition violated
    #[error("scratch budget requires intermediate_size >= hidden_size (got {intermediate} < {hidden})")]
    ScratchBudget {
        /// Hidden size
        hidden: usize,
        /// Intermediate size
        intermediate: usize,
    },

    /// Bump allocation ran past the end of the scratch region
    #[error("scratch exhausted on {device}: requested {requested} bytes, {available} available")]
    ScratchExhausted {
        /// Device owning the region
        device: DeviceId,
        /// Requested bytes (aligned)
        requested: usize,
        /// Remaining bytes
        available: usize,
    },

    /// Scratch region resized while native handles still reference it
    #[error("scratch region on {device} is bound by {bindings} live handle(s)")]
    ScratchInUse {
        /// Device owning the region
        device: DeviceId,
        /// Outstanding bindings
        bindings: usize,
    },

    /// Model configuration or checkpoint error
    #[error("model error: {reason}")]
    ModelError {
        /// Description of what went wrong
        reason: String,
    },

    /// Quantization error
    #[error("quantization error: {reason}")]
    QuantError {
        /// Description of what went wrong
        reason: String,
    },

    /// Native kernel call failed
    #[error("kernel error: {reason}")]
    KernelError {
        /// Description of what went wrong
        reason: String,
    },
}
