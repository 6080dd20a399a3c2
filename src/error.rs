//! Error type for GPU acquisition and dispatch failures.
//!
//! Every failure in the pipeline is treated as fatal for the current
//! run; there are no retries.  The numeric stages are deterministic, so
//! the only things that can go wrong are device acquisition and the
//! final readback.

/// Errors produced while acquiring the GPU or running the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No suitable GPU adapter was found on the system.
    #[error("no suitable GPU adapter found: {0}")]
    NoAdapter(String),

    /// The selected adapter does not support compute shaders.
    #[error("selected adapter does not support compute shaders")]
    ComputeUnsupported,

    /// The logical device could not be created.
    #[error("failed to create GPU device: {0}")]
    Device(String),

    /// Reading the result buffer back to the host failed.
    #[error("failed to read back results from the GPU: {0}")]
    Readback(String),
}
