//! Histogram equalization for single-channel 8-bit images, on the GPU
//! using [wgpu](https://github.com/gfx-rs/wgpu) or on the CPU.  The
//! goal of this crate is to remap pixel intensities so that the output
//! histogram is approximately uniform, improving global contrast.  The
//! GPU path decomposes the work into three compute stages (an atomic
//! histogram accumulation, a single-workgroup parallel prefix scan over
//! the 256 bins, and a per-pixel lookup-table remap) and orchestrates
//! them from the host.  The CPU path is a straightforward sequential
//! reference that produces the same output (within one intensity level
//! of rounding).  The provided GPU API is synchronous and blocking: it
//! waits for the device to complete before returning the remapped
//! pixels.

pub mod buffer;
pub mod context;
pub mod cpu;
pub mod error;
pub mod gpu;

// Re-export the most common types at the crate root so that users can
// simply `use histeq::*;`.
pub use buffer::GpuBuffer;
pub use context::GpuContext;
pub use error::Error;
pub use gpu::GpuEqualizer;
