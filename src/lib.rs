//! Frame pacing, presentation and GPU resource lifetime core for a Vulkan
//! renderer.
//!
//! The crate lets a single CPU thread record and submit per-frame GPU work
//! while the GPU still consumes prior frames, bounded by a fixed number of
//! frames in flight. It covers:
//!
//! - the presentation engine: image acquisition, submission, present and
//!   recovery from surface invalidation (resize, minimize, device quirks)
//! - the frame timeline: one timeline semaphore gating reuse of per-frame
//!   command pools and resources
//! - the transient, fence-blocking command path for setup-time uploads and
//!   one-off GPU builds
//! - the staging/scratch buffer lifecycle, reclaimed lazily as the frame
//!   timeline proves consumption finished
//!
//! Shader compilation, pipelines, materials, scene data and windowing are
//! external collaborators; they consume resources and submit work through
//! the narrow interface here.
//!
//! # Usage
//!
//! ```no_run
//! # use frameloop::{Renderer, RendererConfig};
//! # fn surface_handles() -> (raw_window_handle::RawDisplayHandle, raw_window_handle::RawWindowHandle) { unimplemented!() }
//! let (display, window) = surface_handles();
//! let mut renderer = Renderer::new(RendererConfig::load(), display, window, 1280, 720)?;
//!
//! loop {
//!     if let Some(frame) = renderer.begin_frame()? {
//!         renderer.begin_default_pass(&frame);
//!         // record draw calls on frame.cmd ...
//!         renderer.end_default_pass(&frame);
//!         renderer.end_frame(frame)?;
//!     }
//! #   break;
//! }
//! # Ok::<(), frameloop::Error>(())
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod renderer;

pub use backend::{
    AcquireResult, AttachmentLoad, ColorAttachment, DepthAttachment, GpuBuffer, GpuImage,
    ImageDesc, ImageState, MemoryArena, MemoryClass, QueueClass, RenderAttachments, StagingPool,
    SurfacePrefs, Swapchain, TransientEncoder, VulkanDevice, ACQUIRE_TIMEOUT_NS,
};
pub use config::RendererConfig;
pub use error::{Error, Result};
pub use renderer::{FrameContext, FrameStats, Renderer, DEPTH_FORMAT, FRAME_WAIT_TIMEOUT_NS};

// Re-export ash so embedders use the same `vk` types this crate was built
// against
pub use ash;
