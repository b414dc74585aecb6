// Frame orchestrator
//
// Composes the backend into the per-frame loop:
//   begin_frame -> wait on the frame timeline -> acquire image -> record ->
//   end_frame -> submit with semaphore/timeline signaling -> present.
//
// The CPU records at most N frames ahead of the GPU. A frame, once begun,
// is always submitted; the only cancellation-like operation is the
// swapchain rebuild, which drains in-flight frames first.

use crate::backend::command::{self, AttachmentLoad, ColorAttachment, DepthAttachment};
use crate::backend::{
    AcquireResult, GpuBuffer, GpuImage, ImageDesc, ImageState, MemoryArena, MemoryClass,
    QueueClass, RenderAttachments, StagingPool, SurfacePrefs, Swapchain, TransientEncoder,
    VulkanDevice,
};
use crate::backend::{FrameSlot, FrameTimeline};
use crate::config::RendererConfig;
use crate::error::{Error, Result};
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::time::Instant;

/// Bounded wait for a frame slot's timeline gate. Must always succeed in
/// correct operation; expiry surfaces as [`Error::DeviceHang`] instead of
/// an unkillable hang on device loss.
pub const FRAME_WAIT_TIMEOUT_NS: u64 = 5_000_000_000;

/// Depth attachment format for the default pass
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Handles for recording one frame. Returned by [`Renderer::begin_frame`],
/// consumed by [`Renderer::end_frame`]. Valid for the current frame only.
#[derive(Clone, Copy)]
pub struct FrameContext {
    pub cmd: vk::CommandBuffer,
    pub image_index: u32,
    pub extent: vk::Extent2D,
    /// The acquired swapchain image and its view
    pub image: vk::Image,
    pub view: vk::ImageView,
    slot: usize,
}

/// Frame counter and rolling FPS window
pub struct FrameStats {
    frame_count: u64,
    window_frames: u32,
    window_start: Instant,
    last_frame: Instant,
    fps: f32,
    frame_time_ms: f32,
}

impl FrameStats {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            frame_count: 0,
            window_frames: 0,
            window_start: now,
            last_frame: now,
            fps: 0.0,
            frame_time_ms: 0.0,
        }
    }

    fn on_frame(&mut self, log_stats: bool) {
        let now = Instant::now();
        self.frame_time_ms = now.duration_since(self.last_frame).as_secs_f32() * 1000.0;
        self.last_frame = now;
        self.frame_count += 1;
        self.window_frames += 1;

        let elapsed = now.duration_since(self.window_start).as_secs_f32();
        if elapsed >= 1.0 {
            self.fps = self.window_frames as f32 / elapsed;
            if log_stats {
                log::debug!(
                    "{:.0} FPS ({:.2} ms/frame)",
                    self.fps,
                    self.frame_time_ms
                );
            }
            self.window_frames = 0;
            self.window_start = now;
        }
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn fps(&self) -> f32 {
        self.fps
    }

    pub fn frame_time_ms(&self) -> f32 {
        self.frame_time_ms
    }
}

/// The renderer core: presentation, frame pacing and resource lifetime.
///
/// Single-threaded by design: all recording and submission calls come from
/// one CPU thread while the GPU executes asynchronously.
pub struct Renderer {
    config: RendererConfig,
    device: Arc<VulkanDevice>,
    surface_loader: ash::extensions::khr::Surface,
    surface: vk::SurfaceKHR,
    // Destroyed by hand before the surface in Drop
    swapchain: ManuallyDrop<Swapchain>,
    arena: MemoryArena,
    staging: StagingPool,
    timeline: FrameTimeline,
    slots: Vec<FrameSlot>,
    depth: Option<GpuImage>,

    extent_hint: vk::Extent2D,
    frame_counter: u64,
    current_slot: usize,
    needs_rebuild: bool,
    minimized: bool,
    stats: FrameStats,
}

impl Renderer {
    /// Initialize the renderer against a presentation surface.
    ///
    /// `width`/`height` are the initial window size and must be non-zero.
    pub fn new(
        config: RendererConfig,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::ZeroSize);
        }
        let config = config.validated();

        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let device = VulkanDevice::new(
            &config.graphics.app_name,
            enable_validation,
            display_handle,
        )?;

        let (surface, surface_loader) = device.create_surface(display_handle, window_handle)?;

        let arena = MemoryArena::new(device.clone());
        let staging = StagingPool::new();

        let n = config.graphics.frames_in_flight;
        let timeline = FrameTimeline::new(device.clone(), n)?;
        let slots = (0..n)
            .map(|k| FrameSlot::new(&device, k))
            .collect::<Result<Vec<_>>>()?;

        let extent_hint = vk::Extent2D { width, height };
        let prefs = SurfacePrefs {
            preferred_image_count: config.graphics.preferred_image_count,
            min_image_count: n as u32,
            preferred_present_mode: config.preferred_present_mode(),
        };
        let swapchain = Swapchain::new(
            device.clone(),
            surface,
            &surface_loader,
            extent_hint,
            &prefs,
        )?;

        let depth = Some(Self::create_depth_image(&arena, swapchain.extent)?);

        log::info!("Renderer initialized ({} frames in flight)", n);

        Ok(Self {
            config,
            device,
            surface_loader,
            surface,
            swapchain: ManuallyDrop::new(swapchain),
            arena,
            staging,
            timeline,
            slots,
            depth,
            extent_hint,
            frame_counter: 0,
            current_slot: 0,
            needs_rebuild: false,
            minimized: false,
            stats: FrameStats::new(),
        })
    }

    fn create_depth_image(arena: &MemoryArena, extent: vk::Extent2D) -> Result<GpuImage> {
        arena.create_image(&ImageDesc {
            format: DEPTH_FORMAT,
            extent,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            aspect: vk::ImageAspectFlags::DEPTH,
        })
    }

    fn surface_prefs(&self) -> SurfacePrefs {
        SurfacePrefs {
            preferred_image_count: self.config.graphics.preferred_image_count,
            min_image_count: self.slots.len() as u32,
            preferred_present_mode: self.config.preferred_present_mode(),
        }
    }

    // =========================================================================
    // FRAME LOOP
    // =========================================================================

    /// Begin a frame: wait for the slot's timeline gate, reset its pool,
    /// begin recording and acquire a swapchain image.
    ///
    /// Returns `Ok(None)` when no frame can be produced right now (window
    /// minimized, or the surface went out of date — it is rebuilt before the
    /// next frame). A returned frame MUST be finished with [`end_frame`];
    /// abandoning it desynchronizes the pipeline.
    ///
    /// [`end_frame`]: Self::end_frame
    pub fn begin_frame(&mut self) -> Result<Option<FrameContext>> {
        if self.needs_rebuild {
            self.rebuild_surface()?;
        }
        if self.minimized {
            return Ok(None);
        }

        let slot = &self.slots[self.current_slot];
        self.timeline.wait(slot.required_value, FRAME_WAIT_TIMEOUT_NS)?;

        // The wait just proved the timeline advanced; free whatever staging
        // memory it retired
        let completed = self.timeline.completed_value()?;
        self.staging.reclaim(&self.arena, completed);

        let device = &self.device.device;
        unsafe {
            device.reset_command_pool(slot.pool, vk::CommandPoolResetFlags::empty())?;
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(slot.cmd, &begin_info)?;
        }

        match self.swapchain.acquire(self.frame_counter)? {
            AcquireResult::OutOfDate => {
                // Abandon this frame; the open command buffer is discarded
                // by the pool reset on the next begin_frame
                log::debug!("Surface out of date on acquire, scheduling rebuild");
                self.needs_rebuild = true;
                Ok(None)
            }
            AcquireResult::Acquired {
                image_index,
                suboptimal,
            } => {
                if suboptimal {
                    log::debug!("Suboptimal acquire accepted for frame {}", self.frame_counter);
                }
                Ok(Some(FrameContext {
                    cmd: slot.cmd,
                    image_index,
                    extent: self.swapchain.extent,
                    image: self.swapchain.images[image_index as usize],
                    view: self.swapchain.image_views[image_index as usize],
                    slot: self.current_slot,
                }))
            }
        }
    }

    /// Finish a frame: submit its command buffer (waiting on the acquire
    /// semaphore, signaling the present-ready semaphore and the frame
    /// timeline) and present. Asynchronous; pacing happens in `begin_frame`.
    pub fn end_frame(&mut self, frame: FrameContext) -> Result<()> {
        debug_assert_eq!(frame.slot, self.current_slot, "frame finished out of order");

        let device = &self.device.device;
        unsafe { device.end_command_buffer(frame.cmd) }?;

        let n = self.timeline.frames_in_flight();
        let signal_value = self.slots[self.current_slot].advance(n);

        let wait_semaphores = [self.swapchain.acquire_semaphore(self.frame_counter)];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let wait_values = [0u64];
        let signal_semaphores = [
            self.swapchain.present_semaphore(frame.image_index),
            self.timeline.semaphore(),
        ];
        // Binary semaphore entries ignore their timeline value
        let signal_values = [0u64, signal_value];
        let command_buffers = [frame.cmd];

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        unsafe {
            device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                vk::Fence::null(),
            )
        }?;

        // Staging buffers recorded into this frame retire when it completes
        self.staging.seal(signal_value);

        let needs_rebuild = self
            .swapchain
            .present(self.device.graphics_queue, frame.image_index)?;
        if needs_rebuild {
            log::debug!("Present reported stale surface, scheduling rebuild");
            self.needs_rebuild = true;
        }

        self.frame_counter += 1;
        self.current_slot = (self.current_slot + 1) % self.slots.len();
        self.stats.on_frame(self.config.debug.log_frame_stats);

        Ok(())
    }

    /// Record the transitions and attachment setup for rendering into the
    /// acquired swapchain image (plus the renderer-owned depth buffer) with
    /// the configured clear values.
    pub fn begin_default_pass(&self, frame: &FrameContext) {
        command::transition_image(
            &self.device,
            frame.cmd,
            frame.image,
            vk::ImageAspectFlags::COLOR,
            ImageState::Undefined,
            ImageState::ColorAttachment,
        );

        let depth = self.depth.as_ref().map(|depth| {
            command::transition_image(
                &self.device,
                frame.cmd,
                depth.image,
                depth.aspect,
                ImageState::Undefined,
                ImageState::DepthAttachment,
            );
            DepthAttachment {
                view: depth.view,
                load: AttachmentLoad::Clear,
                clear_depth: self.config.graphics.clear_depth,
            }
        });

        let targets = RenderAttachments {
            colors: vec![ColorAttachment {
                view: frame.view,
                load: AttachmentLoad::Clear,
                clear_color: self.config.graphics.clear_color,
            }],
            depth,
            extent: frame.extent,
        };
        command::begin_rendering(&self.device, frame.cmd, &targets);
    }

    /// End the default pass and move the swapchain image to presentable
    /// layout
    pub fn end_default_pass(&self, frame: &FrameContext) {
        command::end_rendering(&self.device, frame.cmd);
        command::transition_image(
            &self.device,
            frame.cmd,
            frame.image,
            vk::ImageAspectFlags::COLOR,
            ImageState::ColorAttachment,
            ImageState::PresentSrc,
        );
    }

    // =========================================================================
    // SURFACE LIFECYCLE
    // =========================================================================

    /// Note a window size change. Zero extent marks the window minimized
    /// and frames are skipped until a non-zero size arrives.
    pub fn request_rebuild(&mut self, width: u32, height: u32) {
        self.extent_hint = vk::Extent2D { width, height };
        if width == 0 || height == 0 {
            self.minimized = true;
        } else {
            self.minimized = false;
            self.needs_rebuild = true;
        }
    }

    /// Drain in-flight frames, then rebuild the swapchain and the depth
    /// buffer over the existing surface
    fn rebuild_surface(&mut self) -> Result<()> {
        if self.extent_hint.width == 0 || self.extent_hint.height == 0 {
            self.minimized = true;
            return Ok(());
        }

        // Every slot's gate is the value its last submission signals;
        // reaching the maximum drains all recorded frames
        let max_required = self
            .slots
            .iter()
            .map(|slot| slot.required_value)
            .max()
            .unwrap_or(0);
        self.timeline.wait(max_required, FRAME_WAIT_TIMEOUT_NS)?;
        // Queued presents are not on the timeline; idle the device before
        // tearing presentation resources down
        self.device.wait_idle()?;

        if let Some(depth) = self.depth.take() {
            self.arena.destroy_image(depth);
        }

        let prefs = self.surface_prefs();
        self.swapchain
            .recreate(self.surface, &self.surface_loader, self.extent_hint, &prefs)?;
        self.depth = Some(Self::create_depth_image(&self.arena, self.swapchain.extent)?);

        self.needs_rebuild = false;
        log::info!(
            "Swapchain rebuilt: {}x{}",
            self.swapchain.extent.width,
            self.swapchain.extent.height
        );
        Ok(())
    }

    // =========================================================================
    // UPLOADS AND TRANSIENT WORK
    // =========================================================================

    /// Create a device-local buffer initialized with `data`.
    ///
    /// Stages through the pool, copies on a transient encoder and blocks
    /// until the GPU finishes, so the staging memory is immediately
    /// reclaimable (and `clear_staging_buffers` right after is safe).
    pub fn create_buffer_and_upload(
        &mut self,
        data: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> Result<GpuBuffer> {
        let size = data.len() as vk::DeviceSize;
        let dst = self.arena.create_buffer(
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryClass::DeviceLocal,
        )?;
        let src = self
            .staging
            .create_staging_buffer(&self.arena, size, Some(data))?;

        let encoder = TransientEncoder::new(self.device.clone(), QueueClass::Graphics)?;
        encoder.copy_buffer(src, dst.buffer, size);
        encoder.finish()?;

        // The fence wait completed: the staging buffer has no GPU reader
        self.staging.seal(0);

        Ok(dst)
    }

    /// One-shot encoder for setup work and external builders
    /// (acceleration structures). Must not be used inside the frame loop.
    pub fn create_transient_encoder(&self, class: QueueClass) -> Result<TransientEncoder> {
        TransientEncoder::new(self.device.clone(), class)
    }

    /// Register a host-visible staging buffer with the pool
    pub fn create_staging_buffer(
        &mut self,
        size: vk::DeviceSize,
        data: Option<&[u8]>,
    ) -> Result<vk::Buffer> {
        self.staging.create_staging_buffer(&self.arena, size, data)
    }

    /// Register a device-local scratch buffer for transient GPU-side builds
    pub fn create_scratch_buffer(
        &mut self,
        size: vk::DeviceSize,
    ) -> Result<(vk::Buffer, vk::DeviceAddress)> {
        self.staging.create_scratch_buffer(&self.arena, size)
    }

    /// Destroy every registered staging buffer.
    ///
    /// Only safe when no GPU work reading them is in flight, e.g. right
    /// after a transient encoder's blocking finish.
    pub fn clear_staging_buffers(&mut self) {
        self.staging.clear(&self.arena);
    }

    /// Load a SPIR-V shader module from disk
    pub fn create_shader_module<P: AsRef<std::path::Path>>(
        &self,
        path: P,
    ) -> Result<vk::ShaderModule> {
        crate::backend::shader::load_shader_module(&self.device, path)
    }

    pub fn release_shader_module(&self, module: vk::ShaderModule) {
        crate::backend::shader::release_shader_module(&self.device, module);
    }

    // =========================================================================
    // QUERIES (UI backends, external render systems)
    // =========================================================================

    pub fn surface_format(&self) -> vk::Format {
        self.swapchain.format
    }

    pub fn depth_format(&self) -> vk::Format {
        DEPTH_FORMAT
    }

    pub fn image_count(&self) -> u32 {
        self.swapchain.image_count()
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    pub fn arena(&self) -> &MemoryArena {
        &self.arena
    }

    pub fn staging_len(&self) -> usize {
        self.staging.len()
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Shutting down renderer...");

        let _ = self.device.wait_idle();

        self.staging.clear(&self.arena);
        if let Some(depth) = self.depth.take() {
            self.arena.destroy_image(depth);
        }
        for slot in &self.slots {
            slot.destroy(&self.device);
        }

        unsafe {
            // The swapchain must go before the surface it was built on
            ManuallyDrop::drop(&mut self.swapchain);
            self.surface_loader.destroy_surface(self.surface, None);
        }

        log::info!("Renderer shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_stats_count_frames() {
        let mut stats = FrameStats::new();
        assert_eq!(stats.frame_count(), 0);
        for _ in 0..5 {
            stats.on_frame(false);
        }
        assert_eq!(stats.frame_count(), 5);
        assert!(stats.frame_time_ms() >= 0.0);
    }
}
