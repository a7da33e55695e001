// Shader module loading
//
// Vulkan consumes SPIR-V bytecode. Shaders are compiled ahead of time
// (see build.rs) and read from disk at startup.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use super::VulkanDevice;

/// First word of every SPIR-V module
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Read a SPIR-V binary from disk into 32-bit words
pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Opening spv file {:?} failed", path))?;
    parse_spirv(&bytes).with_context(|| format!("Invalid SPIR-V in {:?}", path))
}

/// Convert raw bytes into aligned SPIR-V words, normalising endianness
pub fn parse_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    let words = ash::util::read_spv(&mut Cursor::new(bytes))?;

    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(&word) => anyhow::bail!("Bad magic number {:#010x}", word),
        None => anyhow::bail!("SPIR-V binary is empty"),
    }
}

pub struct ShaderModule {
    module: vk::ShaderModule,
    device: Arc<VulkanDevice>,
}

impl ShaderModule {
    pub fn new(device: &Arc<VulkanDevice>, code: &[u32]) -> Result<Self> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

        let module = unsafe { device.device.create_shader_module(&create_info, None) }
            .context("vkCreateShaderModule failed")?;

        Ok(Self {
            module,
            device: device.clone(),
        })
    }

    pub fn from_file(device: &Arc<VulkanDevice>, path: &Path) -> Result<Self> {
        let code = load_spirv(path)?;
        log::info!("Loaded shader {:?} ({} words)", path, code.len());
        Self::new(device, &code)
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_shader_module(self.module, None);
        }
    }
}
