// Shader module loading
//
// Vulkan consumes SPIR-V bytecode. Shader compilation and reflection are
// external concerns; this module is only the file-backed factory for
// module handles.

use crate::backend::VulkanDevice;
use crate::error::{Error, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;

/// Create a shader module from SPIR-V bytes
pub fn create_shader_module(device: &VulkanDevice, code: &[u8]) -> Result<vk::ShaderModule> {
    // read_spv validates alignment and endianness of the word stream
    let words = ash::util::read_spv(&mut Cursor::new(code)).map_err(|source| Error::ShaderIo {
        path: "<embedded>".into(),
        source,
    })?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

    let module = unsafe { device.device.create_shader_module(&create_info, None) }?;
    Ok(module)
}

/// Create a shader module from a SPIR-V file on disk
pub fn load_shader_module<P: AsRef<Path>>(
    device: &VulkanDevice,
    path: P,
) -> Result<vk::ShaderModule> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|source| Error::ShaderIo {
        path: path.to_path_buf(),
        source,
    })?;
    log::debug!("Loaded shader {:?} ({} bytes)", path, bytes.len());
    create_shader_module(device, &bytes)
}

/// Destroy a shader module created by this factory
pub fn release_shader_module(device: &VulkanDevice, module: vk::ShaderModule) {
    unsafe {
        device.device.destroy_shader_module(module, None);
    }
}

/// Load an embedded SPIR-V shader at compile time
#[macro_export]
macro_rules! load_shader {
    ($device:expr, $path:expr) => {{
        let bytes = include_bytes!($path);
        $crate::backend::shader::create_shader_module($device, bytes)
    }};
}
