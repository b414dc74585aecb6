// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// Performance: Zero-cost abstractions, explicit control

pub mod arena;
pub mod command;
pub mod device;
pub mod shader;
pub mod staging;
pub mod swapchain;
pub mod sync;

pub use arena::{GpuBuffer, GpuImage, ImageDesc, MemoryArena, MemoryClass};
pub use command::{
    AttachmentLoad, ColorAttachment, DepthAttachment, ImageState, RenderAttachments,
    TransientEncoder,
};
pub use device::{QueueClass, VulkanDevice};
pub use staging::StagingPool;
pub use swapchain::{AcquireResult, SurfacePrefs, Swapchain, ACQUIRE_TIMEOUT_NS};
pub use sync::{FrameSlot, FrameTimeline};
