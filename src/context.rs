//! GPU context initialization.
//!
//! This module provides a thin wrapper around wgpu's instance, adapter,
//! device and queue objects.  Creating a [`GpuContext`] lazily
//! instantiates the GPU and prepares it for the equalization pipeline.
//! The `new_blocking` constructor hides the asynchronous nature of
//! requesting an adapter and device by using the [`pollster`] crate.

use wgpu::{Adapter, Device, Instance, Queue};

use crate::Error;

/// A GPU context encapsulates all state needed to submit compute work.
///
/// The context holds on to the `Instance`, `Adapter`, `Device` and
/// `Queue`.  Those types have internal reference counting so they can
/// cheaply be cloned if you need multiple references.  Creating a
/// context will pick the default high performance adapter on the
/// system.  If no adapter is available or it does not support compute
/// shaders, an error is returned.
pub struct GpuContext {
    /// The global GPU instance.  Keeps track of available backends; in
    /// a headless compute application it is only needed to request an
    /// adapter, but it must be kept alive for the device's lifetime.
    pub instance: Instance,
    /// The physical device selected for computation.
    pub adapter: Adapter,
    /// Logical device used to create resources and command encoders.
    pub device: Device,
    /// Command submission queue used to send recorded command buffers
    /// to the GPU.
    pub queue: Queue,
}

impl GpuContext {
    /// Create a new GPU context synchronously.
    ///
    /// This function will block the current thread while waiting for
    /// the asynchronous adapter and device requests to finish.  If you
    /// require asynchronous initialization, use the [`Self::new_async`]
    /// method instead.
    pub fn new_blocking() -> Result<Self, Error> {
        pollster::block_on(Self::new_async())
    }

    /// Create a new GPU context asynchronously.
    ///
    /// This function returns a future that resolves to a new context.
    /// It can be awaited inside an asynchronous runtime.  See
    /// [`Self::new_blocking`] for a synchronous alternative.
    pub async fn new_async() -> Result<Self, Error> {
        let instance = Instance::new(&wgpu::InstanceDescriptor::default());
        // The default options pick a high performance adapter if
        // available, which is sufficient for compute workloads.  No
        // surface is needed in this headless pipeline.
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await
            .map_err(|e| Error::NoAdapter(e.to_string()))?;
        // Downlevel devices may not support compute on all backends;
        // abort early if unsupported.
        let capabilities = adapter.get_downlevel_capabilities();
        if !capabilities
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
        {
            return Err(Error::ComputeUnsupported);
        }
        log::debug!("using adapter: {}", adapter.get_info().name);
        // Request a logical device and queue.  We require no special
        // features and use downlevel defaults for limits; the pipeline
        // only needs storage buffers, atomics and workgroup memory,
        // all of which are part of the compute baseline.
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("histeq_device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
                memory_hints: wgpu::MemoryHints::MemoryUsage,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| Error::Device(e.to_string()))?;

        Ok(Self {
            instance,
            adapter,
            device,
            queue,
        })
    }
}
