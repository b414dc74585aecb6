// Device memory arena
//
// All GPU buffers and images are allocated here through gpu-allocator and
// destroyed explicitly. Every buffer carries a queryable device address so
// bindless and acceleration-structure consumers can take pointer-style
// references to it.

use crate::backend::VulkanDevice;
use crate::error::{Error, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// Memory placement policy for a new buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryClass {
    /// GPU-only memory, fastest for device access.
    DeviceLocal,
    /// CPU-writable memory for staging and per-frame uploads.
    HostVisible,
    /// CPU-readable memory for downloads from the GPU.
    Readback,
}

impl MemoryClass {
    fn location(self) -> MemoryLocation {
        match self {
            MemoryClass::DeviceLocal => MemoryLocation::GpuOnly,
            MemoryClass::HostVisible => MemoryLocation::CpuToGpu,
            MemoryClass::Readback => MemoryLocation::GpuToCpu,
        }
    }
}

/// Handle to a device buffer plus its backing allocation.
///
/// The device address is valid only between creation and destruction; do
/// not cache it past `destroy_buffer`.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub device_address: vk::DeviceAddress,
    allocation: Option<Allocation>,
}

impl GpuBuffer {
    /// CPU-visible bytes of the buffer, when its memory class allows mapping
    pub fn mapped_slice_mut(&mut self) -> Option<&mut [u8]> {
        self.allocation.as_mut().and_then(|a| a.mapped_slice_mut())
    }

    #[cfg(test)]
    pub(crate) fn null_for_tests(size: vk::DeviceSize) -> Self {
        Self {
            buffer: vk::Buffer::null(),
            size,
            usage: vk::BufferUsageFlags::empty(),
            device_address: 0,
            allocation: None,
        }
    }
}

/// Handle to a device image, its view and backing allocation.
pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub aspect: vk::ImageAspectFlags,
    allocation: Option<Allocation>,
}

/// Creation parameters for [`MemoryArena::create_image`].
pub struct ImageDesc {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
}

/// Allocates and frees GPU buffers/images from the device allocator.
///
/// Single-owner: called only from the renderer thread.
pub struct MemoryArena {
    device: Arc<VulkanDevice>,
}

impl MemoryArena {
    pub fn new(device: Arc<VulkanDevice>) -> Self {
        Self { device }
    }

    /// Create a buffer in the given memory class.
    ///
    /// The usage flags are augmented with `SHADER_DEVICE_ADDRESS` and the
    /// buffer's address is resolved immediately.
    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        class: MemoryClass,
    ) -> Result<GpuBuffer> {
        if size == 0 {
            return Err(Error::ZeroSize);
        }

        let usage = usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let device = &self.device.device;
        let buffer = unsafe { device.create_buffer(&buffer_info, None) }?;
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let allocation = self.device.allocator.lock().allocate(&AllocationCreateDesc {
            name: "arena buffer",
            requirements,
            location: class.location(),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) }?;

        let device_address = unsafe {
            device.get_buffer_device_address(&vk::BufferDeviceAddressInfo::builder().buffer(buffer))
        };

        Ok(GpuBuffer {
            buffer,
            size,
            usage,
            device_address,
            allocation: Some(allocation),
        })
    }

    /// Create a 2D image with a matching view
    pub fn create_image(&self, desc: &ImageDesc) -> Result<GpuImage> {
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(Error::ZeroSize);
        }

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let device = &self.device.device;
        let image = unsafe { device.create_image(&image_info, None) }?;
        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let allocation = self.device.allocator.lock().allocate(&AllocationCreateDesc {
            name: "arena image",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset()) }?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: desc.aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe { device.create_image_view(&view_info, None) }?;

        Ok(GpuImage {
            image,
            view,
            format: desc.format,
            extent: desc.extent,
            aspect: desc.aspect,
            allocation: Some(allocation),
        })
    }

    /// Destroy a buffer and return its memory to the allocator
    pub fn destroy_buffer(&self, mut buffer: GpuBuffer) {
        unsafe { self.device.device.destroy_buffer(buffer.buffer, None) };
        if let Some(allocation) = buffer.allocation.take() {
            if let Err(e) = self.device.allocator.lock().free(allocation) {
                log::error!("Failed to free buffer allocation: {}", e);
            }
        }
    }

    /// Destroy an image, its view and allocation
    pub fn destroy_image(&self, mut image: GpuImage) {
        unsafe {
            self.device.device.destroy_image_view(image.view, None);
            self.device.device.destroy_image(image.image, None);
        }
        if let Some(allocation) = image.allocation.take() {
            if let Err(e) = self.device.allocator.lock().free(allocation) {
                log::error!("Failed to free image allocation: {}", e);
            }
        }
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_class_maps_to_allocator_location() {
        assert_eq!(MemoryClass::DeviceLocal.location(), MemoryLocation::GpuOnly);
        assert_eq!(MemoryClass::HostVisible.location(), MemoryLocation::CpuToGpu);
        assert_eq!(MemoryClass::Readback.location(), MemoryLocation::GpuToCpu);
    }
}
