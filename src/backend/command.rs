// Command recording
//
// Two encoder lifetimes share the primitives here:
// - transient: own pool, submitted with a fence and waited on synchronously;
//   for setup-time uploads and one-off GPU work, never the frame loop
// - per-frame: the orchestrator records into a frame slot's pre-allocated
//   command buffer, paced by the frame timeline
//
// Image layouts are modelled as an explicit state machine: the caller names
// the before/after states and a single barrier-emitting function derives
// layouts, access masks and stages from that pure data.

use crate::backend::{QueueClass, VulkanDevice};
use crate::error::{Error, Result};
use ash::vk;
use std::sync::Arc;

/// Logical access state of an image, owned by whichever component last
/// transitioned it. The core does not track layouts globally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Undefined,
    ColorAttachment,
    DepthAttachment,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    PresentSrc,
}

impl ImageState {
    pub fn layout(self) -> vk::ImageLayout {
        match self {
            ImageState::Undefined => vk::ImageLayout::UNDEFINED,
            ImageState::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ImageState::DepthAttachment => vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            ImageState::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ImageState::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ImageState::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ImageState::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    pub fn access_mask(self) -> vk::AccessFlags {
        match self {
            ImageState::Undefined => vk::AccessFlags::empty(),
            ImageState::ColorAttachment => {
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            }
            ImageState::DepthAttachment => {
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
            }
            ImageState::ShaderReadOnly => vk::AccessFlags::SHADER_READ,
            ImageState::TransferSrc => vk::AccessFlags::TRANSFER_READ,
            ImageState::TransferDst => vk::AccessFlags::TRANSFER_WRITE,
            // Presentation engine access is outside the barrier's scope
            ImageState::PresentSrc => vk::AccessFlags::empty(),
        }
    }

    pub fn stage_mask(self) -> vk::PipelineStageFlags {
        match self {
            ImageState::Undefined => vk::PipelineStageFlags::TOP_OF_PIPE,
            ImageState::ColorAttachment => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            ImageState::DepthAttachment => {
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
            }
            ImageState::ShaderReadOnly => vk::PipelineStageFlags::FRAGMENT_SHADER,
            ImageState::TransferSrc | ImageState::TransferDst => vk::PipelineStageFlags::TRANSFER,
            ImageState::PresentSrc => vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        }
    }
}

/// Record a layout transition between two image states
pub fn transition_image(
    device: &VulkanDevice,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    from: ImageState,
    to: ImageState,
) {
    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(from.access_mask())
        .dst_access_mask(to.access_mask())
        .old_layout(from.layout())
        .new_layout(to.layout())
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
        .build();

    unsafe {
        device.device.cmd_pipeline_barrier(
            cmd,
            from.stage_mask(),
            to.stage_mask(),
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

/// Record a whole-range buffer copy
pub fn copy_buffer(
    device: &VulkanDevice,
    cmd: vk::CommandBuffer,
    src: vk::Buffer,
    dst: vk::Buffer,
    size: vk::DeviceSize,
) {
    let region = vk::BufferCopy::builder().size(size).build();
    unsafe {
        device.device.cmd_copy_buffer(cmd, src, dst, &[region]);
    }
}

/// Record a tightly-packed buffer-to-image copy.
///
/// The image must already be in `TransferDst` state.
pub fn copy_buffer_to_image(
    device: &VulkanDevice,
    cmd: vk::CommandBuffer,
    src: vk::Buffer,
    image: vk::Image,
    extent: vk::Extent2D,
    aspect: vk::ImageAspectFlags,
) {
    let region = vk::BufferImageCopy::builder()
        .image_subresource(vk::ImageSubresourceLayers {
            aspect_mask: aspect,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        })
        .image_extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .build();
    unsafe {
        device.device.cmd_copy_buffer_to_image(
            cmd,
            src,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
    }
}

/// Load behavior for a render attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentLoad {
    Clear,
    Load,
    DontCare,
}

impl AttachmentLoad {
    fn load_op(self) -> vk::AttachmentLoadOp {
        match self {
            AttachmentLoad::Clear => vk::AttachmentLoadOp::CLEAR,
            AttachmentLoad::Load => vk::AttachmentLoadOp::LOAD,
            AttachmentLoad::DontCare => vk::AttachmentLoadOp::DONT_CARE,
        }
    }
}

/// A color attachment for dynamic rendering
pub struct ColorAttachment {
    pub view: vk::ImageView,
    pub load: AttachmentLoad,
    pub clear_color: [f32; 4],
}

/// A depth attachment for dynamic rendering
pub struct DepthAttachment {
    pub view: vk::ImageView,
    pub load: AttachmentLoad,
    pub clear_depth: f32,
}

/// Attachment set handed to [`begin_rendering`]. External render systems
/// build one of these from their own targets; the renderer builds one for
/// the default swapchain pass.
pub struct RenderAttachments {
    pub colors: Vec<ColorAttachment>,
    pub depth: Option<DepthAttachment>,
    pub extent: vk::Extent2D,
}

/// Begin a dynamic rendering pass over the given attachments.
///
/// Attachment images must already be in their attachment states; callers
/// transition them with [`transition_image`].
pub fn begin_rendering(device: &VulkanDevice, cmd: vk::CommandBuffer, targets: &RenderAttachments) {
    let color_infos: Vec<vk::RenderingAttachmentInfo> = targets
        .colors
        .iter()
        .map(|color| {
            vk::RenderingAttachmentInfo::builder()
                .image_view(color.view)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(color.load.load_op())
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: color.clear_color,
                    },
                })
                .build()
        })
        .collect();

    let render_area = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: targets.extent,
    };

    let depth_info = targets.depth.as_ref().map(|depth| {
        vk::RenderingAttachmentInfo::builder()
            .image_view(depth.view)
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(depth.load.load_op())
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: depth.clear_depth,
                    stencil: 0,
                },
            })
            .build()
    });

    let mut rendering_info = vk::RenderingInfo::builder()
        .render_area(render_area)
        .layer_count(1)
        .color_attachments(&color_infos);
    if let Some(depth_info) = depth_info.as_ref() {
        rendering_info = rendering_info.depth_attachment(depth_info);
    }

    unsafe {
        device.device.cmd_begin_rendering(cmd, &rendering_info);
    }
}

/// End the current dynamic rendering pass
pub fn end_rendering(device: &VulkanDevice, cmd: vk::CommandBuffer) {
    unsafe {
        device.device.cmd_end_rendering(cmd);
    }
}

/// One-shot command encoder with its own transient pool.
///
/// `finish` submits with a fresh fence and blocks the calling thread until
/// the GPU completes, so everything the recording referenced (staging
/// buffers included) is safe to release afterwards. This is the slow path;
/// it must never run inside the steady-state frame loop.
pub struct TransientEncoder {
    device: Arc<VulkanDevice>,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    queue: vk::Queue,
}

impl TransientEncoder {
    pub fn new(device: Arc<VulkanDevice>, class: QueueClass) -> Result<Self> {
        let (queue, family) = device.queue(class);

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = match unsafe { device.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe { device.device.destroy_command_pool(pool, None) };
                return Err(e.into());
            }
        };

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.device.begin_command_buffer(cmd, &begin_info) }?;

        Ok(Self {
            device,
            pool,
            cmd,
            queue,
        })
    }

    /// Raw command buffer for callers recording their own commands
    /// (acceleration-structure builds and similar external work)
    pub fn cmd(&self) -> vk::CommandBuffer {
        self.cmd
    }

    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) {
        copy_buffer(&self.device, self.cmd, src, dst, size);
    }

    pub fn copy_buffer_to_image(
        &self,
        src: vk::Buffer,
        image: vk::Image,
        extent: vk::Extent2D,
        aspect: vk::ImageAspectFlags,
    ) {
        copy_buffer_to_image(&self.device, self.cmd, src, image, extent, aspect);
    }

    pub fn transition_image(
        &self,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        from: ImageState,
        to: ImageState,
    ) {
        transition_image(&self.device, self.cmd, image, aspect, from, to);
    }

    /// End recording, submit, and block until the GPU finishes.
    ///
    /// Driver errors here are fatal: the recorded work cannot be retried
    /// without re-deriving its inputs.
    pub fn finish(self) -> Result<()> {
        let device = &self.device.device;
        unsafe { device.end_command_buffer(self.cmd) }?;

        let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::builder(), None) }?;

        let command_buffers = [self.cmd];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

        let submit_result = unsafe { device.queue_submit(self.queue, &[submit_info.build()], fence) }
            .map_err(Error::from)
            .and_then(|_| {
                unsafe { device.wait_for_fences(&[fence], true, u64::MAX) }.map_err(Error::from)
            });

        unsafe { device.destroy_fence(fence, None) };
        submit_result
        // Drop destroys the pool and frees the command buffer with it
    }
}

impl Drop for TransientEncoder {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_command_pool(self.pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_states_map_to_expected_layouts() {
        assert_eq!(ImageState::Undefined.layout(), vk::ImageLayout::UNDEFINED);
        assert_eq!(
            ImageState::ColorAttachment.layout(),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            ImageState::PresentSrc.layout(),
            vk::ImageLayout::PRESENT_SRC_KHR
        );
        assert_eq!(
            ImageState::TransferDst.layout(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );
    }

    #[test]
    fn undefined_state_has_no_prior_access() {
        assert_eq!(ImageState::Undefined.access_mask(), vk::AccessFlags::empty());
        assert_eq!(
            ImageState::Undefined.stage_mask(),
            vk::PipelineStageFlags::TOP_OF_PIPE
        );
    }

    #[test]
    fn present_state_carries_no_access_mask() {
        // The presentation engine synchronizes via semaphores, not barriers
        assert_eq!(
            ImageState::PresentSrc.access_mask(),
            vk::AccessFlags::empty()
        );
    }

    #[test]
    fn transfer_states_use_transfer_stage() {
        assert_eq!(
            ImageState::TransferSrc.stage_mask(),
            vk::PipelineStageFlags::TRANSFER
        );
        assert_eq!(
            ImageState::TransferDst.access_mask(),
            vk::AccessFlags::TRANSFER_WRITE
        );
    }

    #[test]
    fn attachment_load_maps_to_vulkan_ops() {
        assert_eq!(AttachmentLoad::Clear.load_op(), vk::AttachmentLoadOp::CLEAR);
        assert_eq!(AttachmentLoad::Load.load_op(), vk::AttachmentLoadOp::LOAD);
        assert_eq!(
            AttachmentLoad::DontCare.load_op(),
            vk::AttachmentLoadOp::DONT_CARE
        );
    }
}
