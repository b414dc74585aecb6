// Error taxonomy
//
// Fatal initialization and driver errors surface as Err values so the
// embedding application picks its own failure policy. Recoverable
// presentation errors ("out of date", "suboptimal") never reach this enum:
// acquire/present translate them into status data the frame loop reacts to.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to load the Vulkan library: {0}")]
    VulkanLoad(#[from] ash::LoadingError),

    #[error("no Vulkan-capable GPU satisfies the renderer requirements")]
    NoSuitableGpu,

    #[error("the selected GPU cannot present to the given surface")]
    NoSurfaceSupport,

    #[error("device memory allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    /// Contract violation: buffers and images must have non-zero size.
    #[error("attempted to create a buffer or image with zero size")]
    ZeroSize,

    #[error("Vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),

    /// A bounded GPU wait expired. In correct operation the frame timeline
    /// wait always succeeds; expiry means the device hung or was lost.
    #[error("timed out waiting for the GPU after {timeout_ns} ns")]
    DeviceHang { timeout_ns: u64 },

    #[error("failed to read shader file {path}: {source}")]
    ShaderIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to load config file {path}: {message}")]
    Config { path: PathBuf, message: String },
}

impl Error {
    /// True for errors with no valid renderer state to recover into.
    ///
    /// Non-fatal errors (bad shader path, zero-size request) leave the
    /// renderer usable; everything else means init or the driver failed.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::ShaderIo { .. } | Error::Config { .. } | Error::ZeroSize
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_errors_are_fatal() {
        assert!(Error::NoSuitableGpu.is_fatal());
        assert!(Error::Vulkan(vk::Result::ERROR_DEVICE_LOST).is_fatal());
        assert!(Error::DeviceHang {
            timeout_ns: 5_000_000_000
        }
        .is_fatal());
    }

    #[test]
    fn contract_and_io_errors_are_recoverable() {
        assert!(!Error::ZeroSize.is_fatal());
        let io = Error::ShaderIo {
            path: PathBuf::from("missing.spv"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(!io.is_fatal());
    }
}
