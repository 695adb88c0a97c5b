// Shader module loading
//
// Shaders arrive as precompiled SPIR-V blobs read by filename. A missing
// or malformed file is a fatal startup error.

use anyhow::{Context, Result};
use ash::util::read_spv;
use ash::vk;
use std::io::Cursor;
use std::path::Path;

use super::DeviceContext;

/// Read a SPIR-V blob from disk and wrap it in a shader module.
pub fn load_shader_module(device: &DeviceContext, path: &Path) -> Result<vk::ShaderModule> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read shader binary {}", path.display()))?;

    // SPIR-V is a stream of 4-byte words; read_spv handles alignment.
    let code = read_spv(&mut Cursor::new(&bytes))
        .with_context(|| format!("Shader binary {} is not valid SPIR-V", path.display()))?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .with_context(|| format!("Failed to create shader module from {}", path.display()))
    }
}
