// Swapchain - presentation surface
//
// Owns the presentable images and their per-image binary semaphore pairs
// (acquire, present-ready), detects surface invalidation, and supports
// in-place recreation while frames are still in flight. Image count, format
// and present mode selection are pure functions of the reported surface
// capabilities, so rebuilding over an unchanged surface reselects the same
// configuration.

use crate::backend::command::{ImageState, TransientEncoder};
use crate::backend::{QueueClass, VulkanDevice};
use crate::error::Result;
use ash::vk;
use std::sync::Arc;

/// Bounded wait for image acquisition. A stalled presentation engine must
/// not hang the frame loop; expiry is treated like an out-of-date surface.
pub const ACQUIRE_TIMEOUT_NS: u64 = 1_000_000_000;

/// Surface formats accepted without fallback, in preference order.
const FORMAT_ALLOW_LIST: [vk::Format; 4] = [
    vk::Format::B8G8R8A8_SRGB,
    vk::Format::B8G8R8A8_UNORM,
    vk::Format::R8G8B8A8_SRGB,
    vk::Format::R8G8B8A8_UNORM,
];

/// Selection inputs that do not come from the surface itself.
pub struct SurfacePrefs {
    /// Target image count before clamping to surface capabilities.
    pub preferred_image_count: u32,
    /// Floor required by the N-buffering model (frames in flight).
    pub min_image_count: u32,
    /// Present mode tried before the built-in policy chain.
    pub preferred_present_mode: Option<vk::PresentModeKHR>,
}

/// Outcome of an acquire call the frame loop must inspect before recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    Acquired { image_index: u32, suboptimal: bool },
    /// Surface invalid (out of date, lost) or the acquire timed out;
    /// the caller must rebuild before presenting again.
    OutOfDate,
}

/// Choose a surface format: allow-listed formats first, else the first one
/// the surface reports.
fn select_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    for candidate in FORMAT_ALLOW_LIST {
        if let Some(format) = formats.iter().find(|f| {
            f.format == candidate && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        }) {
            return Some(*format);
        }
    }
    formats.first().copied()
}

/// Choose a present mode: the caller's preference when supported, then
/// MAILBOX (low latency, no tear), then IMMEDIATE (low latency, may tear),
/// then FIFO which is always available.
fn select_present_mode(
    modes: &[vk::PresentModeKHR],
    preferred: Option<vk::PresentModeKHR>,
) -> vk::PresentModeKHR {
    let supported = |mode: vk::PresentModeKHR| modes.contains(&mode);

    if let Some(mode) = preferred {
        if supported(mode) {
            return mode;
        }
    }
    if supported(vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else if supported(vk::PresentModeKHR::IMMEDIATE) {
        vk::PresentModeKHR::IMMEDIATE
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Clamp the preferred image count to surface capabilities, never dropping
/// below the N-buffering floor the surface allows. `caps_max == 0` means
/// unbounded.
fn select_image_count(caps_min: u32, caps_max: u32, preferred: u32, floor: u32) -> u32 {
    let mut count = preferred.max(floor).max(caps_min);
    if caps_max > 0 {
        count = count.min(caps_max);
    }
    count
}

/// Resolve the swapchain extent from capabilities and the window hint
fn select_extent(caps: &vk::SurfaceCapabilitiesKHR, hint: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: hint
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: hint
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// Map a raw acquire outcome to an [`AcquireResult`].
///
/// Out-of-date, lost-surface and timeout outcomes all demand a rebuild;
/// other failures are genuine driver errors.
fn classify_acquire(
    raw: std::result::Result<(u32, bool), vk::Result>,
) -> Result<AcquireResult> {
    match raw {
        Ok((image_index, suboptimal)) => Ok(AcquireResult::Acquired {
            image_index,
            suboptimal,
        }),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR)
        | Err(vk::Result::ERROR_SURFACE_LOST_KHR)
        | Err(vk::Result::TIMEOUT)
        | Err(vk::Result::NOT_READY) => Ok(AcquireResult::OutOfDate),
        Err(e) => Err(e.into()),
    }
}

/// Map a raw present outcome to "needs rebuild"
fn classify_present(raw: std::result::Result<bool, vk::Result>) -> Result<bool> {
    match raw {
        Ok(suboptimal) => Ok(suboptimal),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) | Err(vk::Result::ERROR_SURFACE_LOST_KHR) => {
            Ok(true)
        }
        Err(e) => Err(e.into()),
    }
}

struct SwapchainParts {
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    acquire_semaphores: Vec<vk::Semaphore>,
    present_semaphores: Vec<vk::Semaphore>,
    format: vk::Format,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    swapchain_loader: ash::extensions::khr::Swapchain,
    /// Superseded handle kept alive one rebuild cycle; some drivers require
    /// the old swapchain to outlive presents queued against it.
    retired: Option<vk::SwapchainKHR>,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    acquire_semaphores: Vec<vk::Semaphore>,
    present_semaphores: Vec<vk::Semaphore>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    pub fn new(
        device: Arc<VulkanDevice>,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::extensions::khr::Surface,
        extent_hint: vk::Extent2D,
        prefs: &SurfacePrefs,
    ) -> Result<Self> {
        let swapchain_loader =
            ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        let parts = Self::build(
            &device,
            surface,
            surface_loader,
            &swapchain_loader,
            extent_hint,
            prefs,
            vk::SwapchainKHR::null(),
        )?;

        Ok(Self {
            swapchain: parts.swapchain,
            swapchain_loader,
            retired: None,
            images: parts.images,
            image_views: parts.image_views,
            acquire_semaphores: parts.acquire_semaphores,
            present_semaphores: parts.present_semaphores,
            format: parts.format,
            extent: parts.extent,
            present_mode: parts.present_mode,
            device,
        })
    }

    fn build(
        device: &Arc<VulkanDevice>,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::extensions::khr::Surface,
        swapchain_loader: &ash::extensions::khr::Swapchain,
        extent_hint: vk::Extent2D,
        prefs: &SurfacePrefs,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<SwapchainParts> {
        let surface_caps = unsafe {
            surface_loader
                .get_physical_device_surface_capabilities(device.physical_device, surface)
        }?;
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(device.physical_device, surface)
        }?;
        let present_modes = unsafe {
            surface_loader
                .get_physical_device_surface_present_modes(device.physical_device, surface)
        }?;

        let surface_format =
            select_surface_format(&formats).ok_or(crate::error::Error::NoSurfaceSupport)?;
        let present_mode = select_present_mode(&present_modes, prefs.preferred_present_mode);
        let image_count = select_image_count(
            surface_caps.min_image_count,
            surface_caps.max_image_count,
            prefs.preferred_image_count,
            prefs.min_image_count,
        );
        let extent = select_extent(&surface_caps, extent_hint);

        log::info!(
            "Creating swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            image_count,
            surface_format.format,
            present_mode
        );

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }?;

        let images = unsafe { swapchain_loader.get_swapchain_images(swapchain) }?;
        log::info!("Swapchain has {} images", images.len());

        let image_views: Result<Vec<_>> = images
            .iter()
            .map(|&image| {
                let create_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(surface_format.format)
                    .components(vk::ComponentMapping::default())
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });

                let view = unsafe { device.device.create_image_view(&create_info, None) }?;
                Ok(view)
            })
            .collect();
        let image_views = image_views?;

        // One (acquire, present-ready) binary semaphore pair per image
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let mut acquire_semaphores = Vec::with_capacity(images.len());
        let mut present_semaphores = Vec::with_capacity(images.len());
        for _ in 0..images.len() {
            acquire_semaphores
                .push(unsafe { device.device.create_semaphore(&semaphore_info, None) }?);
            present_semaphores
                .push(unsafe { device.device.create_semaphore(&semaphore_info, None) }?);
        }

        // Move every image to presentable layout up front so the first
        // frame's transitions start from a known state
        let encoder = TransientEncoder::new(device.clone(), QueueClass::Graphics)?;
        for &image in &images {
            encoder.transition_image(
                image,
                vk::ImageAspectFlags::COLOR,
                ImageState::Undefined,
                ImageState::PresentSrc,
            );
        }
        encoder.finish()?;

        Ok(SwapchainParts {
            swapchain,
            images,
            image_views,
            acquire_semaphores,
            present_semaphores,
            format: surface_format.format,
            extent,
            present_mode,
        })
    }

    /// Recreate the swapchain over the same surface.
    ///
    /// The caller must have drained in-flight frames first. The superseded
    /// handle is retired, not destroyed, until the next rebuild.
    pub fn recreate(
        &mut self,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::extensions::khr::Surface,
        extent_hint: vk::Extent2D,
        prefs: &SurfacePrefs,
    ) -> Result<()> {
        self.destroy_per_image_resources();
        if let Some(retired) = self.retired.take() {
            unsafe { self.swapchain_loader.destroy_swapchain(retired, None) };
        }

        let parts = Self::build(
            &self.device,
            surface,
            surface_loader,
            &self.swapchain_loader,
            extent_hint,
            prefs,
            self.swapchain,
        )?;

        self.retired = Some(self.swapchain);
        self.swapchain = parts.swapchain;
        self.images = parts.images;
        self.image_views = parts.image_views;
        self.acquire_semaphores = parts.acquire_semaphores;
        self.present_semaphores = parts.present_semaphores;
        self.format = parts.format;
        self.extent = parts.extent;
        self.present_mode = parts.present_mode;

        Ok(())
    }

    /// Acquire the next presentable image with a bounded wait.
    ///
    /// Check the result before recording: on [`AcquireResult::OutOfDate`]
    /// the frame must be abandoned and the swapchain rebuilt.
    pub fn acquire(&self, frame_counter: u64) -> Result<AcquireResult> {
        let semaphore = self.acquire_semaphore(frame_counter);
        let raw = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                ACQUIRE_TIMEOUT_NS,
                semaphore,
                vk::Fence::null(),
            )
        };
        let result = classify_acquire(raw)?;
        if let AcquireResult::Acquired {
            suboptimal: true, ..
        } = result
        {
            log::debug!("Acquired suboptimal swapchain image");
        }
        Ok(result)
    }

    /// Present an acquired image, waiting on its present-ready semaphore.
    ///
    /// Returns true when the surface needs a rebuild.
    pub fn present(&self, queue: vk::Queue, image_index: u32) -> Result<bool> {
        let wait_semaphores = [self.present_semaphore(image_index)];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let raw = unsafe { self.swapchain_loader.queue_present(queue, &present_info) };
        classify_present(raw)
    }

    /// Acquire semaphore used for the given frame counter (round-robin
    /// across the per-image pairs; the index is not known before acquire)
    pub fn acquire_semaphore(&self, frame_counter: u64) -> vk::Semaphore {
        self.acquire_semaphores[frame_counter as usize % self.acquire_semaphores.len()]
    }

    /// Present-ready semaphore belonging to an acquired image
    pub fn present_semaphore(&self, image_index: u32) -> vk::Semaphore {
        self.present_semaphores[image_index as usize]
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    fn destroy_per_image_resources(&mut self) {
        unsafe {
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            for &semaphore in self
                .acquire_semaphores
                .iter()
                .chain(self.present_semaphores.iter())
            {
                self.device.device.destroy_semaphore(semaphore, None);
            }
        }
        self.image_views.clear();
        self.acquire_semaphores.clear();
        self.present_semaphores.clear();
        self.images.clear();
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_per_image_resources();
        unsafe {
            if let Some(retired) = self.retired.take() {
                self.swapchain_loader.destroy_swapchain(retired, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn allow_listed_format_is_chosen_directly() {
        let formats = [format(
            vk::Format::B8G8R8A8_UNORM,
            vk::ColorSpaceKHR::SRGB_NONLINEAR,
        )];
        let selected = select_surface_format(&formats).unwrap();
        assert_eq!(selected.format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(selected.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn srgb_preferred_over_unorm_when_both_reported() {
        let formats = [
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let selected = select_surface_format(&formats).unwrap();
        assert_eq!(selected.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn unknown_formats_fall_back_to_first_reported() {
        let formats = [
            format(vk::Format::A2B10G10R10_UNORM_PACK32, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::R16G16B16A16_SFLOAT, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
        ];
        let selected = select_surface_format(&formats).unwrap();
        assert_eq!(selected.format, vk::Format::A2B10G10R10_UNORM_PACK32);
    }

    #[test]
    fn present_mode_policy_chain() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(select_present_mode(&all, None), vk::PresentModeKHR::MAILBOX);

        let no_mailbox = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            select_present_mode(&no_mailbox, None),
            vk::PresentModeKHR::IMMEDIATE
        );

        let fifo_only = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            select_present_mode(&fifo_only, None),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn preferred_present_mode_wins_when_supported() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(
            select_present_mode(&all, Some(vk::PresentModeKHR::IMMEDIATE)),
            vk::PresentModeKHR::IMMEDIATE
        );
        // Unsupported preference falls back to the policy chain
        let fifo_only = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            select_present_mode(&fifo_only, Some(vk::PresentModeKHR::MAILBOX)),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn image_count_clamps_to_surface_range() {
        // min 2 / max 8, preferred 3, double buffering floor
        assert_eq!(select_image_count(2, 8, 3, 2), 3);
        // surface min dominates
        assert_eq!(select_image_count(4, 8, 3, 2), 4);
        // surface max clamps down
        assert_eq!(select_image_count(2, 2, 3, 2), 2);
        // max == 0 means unbounded
        assert_eq!(select_image_count(2, 0, 3, 2), 3);
        // floor keeps triple buffering viable for 3 frames in flight
        assert_eq!(select_image_count(2, 8, 2, 3), 3);
    }

    #[test]
    fn selection_is_deterministic_across_rebuilds() {
        let formats = [
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];

        let first = (
            select_surface_format(&formats).unwrap().format,
            select_present_mode(&modes, None),
            select_image_count(2, 8, 3, 2),
        );
        let second = (
            select_surface_format(&formats).unwrap().format,
            select_present_mode(&modes, None),
            select_image_count(2, 8, 3, 2),
        );
        assert_eq!(first, second);
    }

    #[test]
    fn out_of_date_acquire_demands_rebuild() {
        let result = classify_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap();
        assert_eq!(result, AcquireResult::OutOfDate);
        // A timed-out acquire must not hang or panic the loop either
        let result = classify_acquire(Err(vk::Result::TIMEOUT)).unwrap();
        assert_eq!(result, AcquireResult::OutOfDate);
    }

    #[test]
    fn successful_acquire_reports_index_and_suboptimality() {
        let result = classify_acquire(Ok((1, true))).unwrap();
        assert_eq!(
            result,
            AcquireResult::Acquired {
                image_index: 1,
                suboptimal: true
            }
        );
    }

    #[test]
    fn genuine_driver_errors_propagate_from_acquire() {
        assert!(classify_acquire(Err(vk::Result::ERROR_DEVICE_LOST)).is_err());
    }

    #[test]
    fn present_failures_map_to_rebuild_flag() {
        assert!(!classify_present(Ok(false)).unwrap());
        assert!(classify_present(Ok(true)).unwrap());
        assert!(classify_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap());
        assert!(classify_present(Err(vk::Result::ERROR_DEVICE_LOST)).is_err());
    }

    #[test]
    fn extent_follows_surface_when_fixed() {
        let mut caps = vk::SurfaceCapabilitiesKHR::default();
        caps.current_extent = vk::Extent2D {
            width: 1920,
            height: 1080,
        };
        let extent = select_extent(
            &caps,
            vk::Extent2D {
                width: 640,
                height: 480,
            },
        );
        assert_eq!(extent.width, 1920);
        assert_eq!(extent.height, 1080);
    }

    #[test]
    fn extent_clamps_hint_when_surface_is_flexible() {
        let mut caps = vk::SurfaceCapabilitiesKHR::default();
        caps.current_extent = vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        };
        caps.min_image_extent = vk::Extent2D {
            width: 100,
            height: 100,
        };
        caps.max_image_extent = vk::Extent2D {
            width: 2000,
            height: 2000,
        };
        let extent = select_extent(
            &caps,
            vk::Extent2D {
                width: 4000,
                height: 50,
            },
        );
        assert_eq!(extent.width, 2000);
        assert_eq!(extent.height, 100);
    }
}
