// =============================================================================
// COMPUTE CONTEXT - every Vulkan object the compute bootstrap creates
// =============================================================================
//
// INITIALIZATION ORDER:
// 1. Instance, physical device, logical device + compute queue, allocator
// 2. Staging buffer (host visible) and device-local buffer
// 3. Command pool + command buffer
// 4. Fence
// 5. Shader module from a precompiled .spv file
// 6. Descriptor pool, set layout, set
// 7. Upload: staging -> device-local copy, waited on with the fence
// 8. Descriptor set binding 0 -> device-local buffer
//
// Teardown is the exact reverse and is driven by field drop order.
//
// =============================================================================

use crate::backend::buffer::{initial_payload, GpuBuffer};
use crate::backend::command::CommandContext;
use crate::backend::descriptor::{self, DescriptorPool, DescriptorSetLayout};
use crate::backend::shader::ShaderModule;
use crate::backend::sync::Fence;
use crate::backend::VulkanDevice;
use crate::config::Config;
use crate::error_log::ErrorLog;
use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use std::time::Duration;
use winit::window::Window;

/// Binding the device-local buffer is exposed at in set 0
pub const STORAGE_BINDING: u32 = 0;

/// All GPU objects for the compute bootstrap.
///
/// IMPORTANT: Field order matters for Drop! Fields are declared in reverse
/// order of creation so they are destroyed newest first. Every wrapper also
/// holds the device, which therefore goes last.
pub struct ComputeContext {
    // Freed together with the pool
    descriptor_set: vk::DescriptorSet,
    descriptor_set_layout: DescriptorSetLayout,
    descriptor_pool: DescriptorPool,
    shader: ShaderModule,
    fence: Fence,
    commands: CommandContext,
    device_local_buffer: GpuBuffer,
    staging_buffer: GpuBuffer,
    device: Arc<VulkanDevice>,

    copy_size: vk::DeviceSize,
    fence_timeout: Duration,
}

impl ComputeContext {
    /// Create every object in dependency order, stopping at the first failure.
    ///
    /// `window` is only inspected for logging; nothing here presents to it.
    /// Validation errors raised along the way are pushed into `errors`.
    pub fn initialize(config: &Config, window: Option<&Window>, errors: &ErrorLog) -> Result<Self> {
        log::info!("Initializing Vulkan compute context...");

        if let Some(window) = window {
            log_native_handle(window);
        }

        let device = VulkanDevice::new(
            &config.window.title,
            config.validation_enabled(),
            config.device.preferred_index,
            errors,
        )?;
        log::info!("{} GPU(s) enumerated", device.physical_devices.len());

        let buffer_size = config.compute.buffer_size;
        let mut staging_buffer = GpuBuffer::staging(&device, buffer_size)?;
        let device_local_buffer = GpuBuffer::device_local(&device, buffer_size)?;
        staging_buffer.write(0, &initial_payload(buffer_size as usize))?;

        let commands = CommandContext::new(&device)?;
        let fence = Fence::new(&device, false)?;

        let shader = ShaderModule::from_file(&device, &config.compute.shader_path)?;

        let descriptor_pool = DescriptorPool::new(
            &device,
            config.descriptors.max_sets,
            config.descriptors.storage_buffer_count,
        )?;
        let descriptor_set_layout = DescriptorSetLayout::storage_buffer(&device, STORAGE_BINDING)?;
        let descriptor_set = descriptor_pool.allocate(&descriptor_set_layout)?;

        let context = Self {
            descriptor_set,
            descriptor_set_layout,
            descriptor_pool,
            shader,
            fence,
            commands,
            device_local_buffer,
            staging_buffer,
            device,
            copy_size: config.compute.copy_size,
            fence_timeout: config.fence_timeout(),
        };

        if config.compute.submit_copy {
            context.copy_staging_to_device()?;
        }
        context.update_descriptor_set();
        context.log_handles();

        log::info!("Vulkan compute context initialized successfully!");
        Ok(context)
    }

    /// Record and submit the staging -> device-local copy, then wait for it
    pub fn copy_staging_to_device(&self) -> Result<()> {
        self.commands.record_copy(
            self.staging_buffer.handle(),
            self.device_local_buffer.handle(),
            self.copy_size,
        )?;
        self.commands.submit(&self.fence)?;
        self.fence
            .wait(self.fence_timeout)
            .context("Staging copy did not complete")?;
        self.fence.reset()?;

        log::info!("Copied {} bytes into the device-local buffer", self.copy_size);
        Ok(())
    }

    /// Point the storage binding at the whole device-local buffer
    pub fn update_descriptor_set(&self) {
        descriptor::write_storage_buffer(
            &self.device,
            self.descriptor_set,
            STORAGE_BINDING,
            self.device_local_buffer.handle(),
            self.device_local_buffer.size(),
        );
    }

    /// Wait for the GPU and release every object, newest first
    pub fn terminate(self) {
        log::info!("Terminating Vulkan compute context...");
        drop(self);
    }

    fn log_handles(&self) {
        log::debug!(
            "Device: physical {:?}, queue {:?} (family {})",
            self.device.physical_device,
            self.device.compute_queue,
            self.device.compute_queue_family
        );
        log::debug!(
            "Buffers: staging {:?}, device-local {:?}",
            self.staging_buffer.handle(),
            self.device_local_buffer.handle()
        );
        log::debug!(
            "Commands: pool {:?}, buffer {:?}, fence {:?}",
            self.commands.pool(),
            self.commands.buffer(),
            self.fence.handle()
        );
        log::debug!(
            "Shader {:?}, descriptor pool {:?}, layout {:?}, set {:?}",
            self.shader.handle(),
            self.descriptor_pool.handle(),
            self.descriptor_set_layout.handle(),
            self.descriptor_set
        );
    }
}

#[cfg(test)]
impl ComputeContext {
    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    pub fn staging_buffer(&self) -> &GpuBuffer {
        &self.staging_buffer
    }

    pub fn device_local_buffer(&self) -> &GpuBuffer {
        &self.device_local_buffer
    }

    pub fn commands(&self) -> &CommandContext {
        &self.commands
    }

    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    pub fn shader(&self) -> &ShaderModule {
        &self.shader
    }

    pub fn descriptor_pool(&self) -> &DescriptorPool {
        &self.descriptor_pool
    }

    pub fn descriptor_set_layout(&self) -> &DescriptorSetLayout {
        &self.descriptor_set_layout
    }

    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.descriptor_set
    }
}

impl Drop for ComputeContext {
    fn drop(&mut self) {
        // Nothing may still be executing when the fields start dropping
        if let Err(e) = self.device.wait_idle() {
            log::error!("Failed to wait for device idle: {:#}", e);
        }
    }
}

fn log_native_handle(window: &Window) {
    use raw_window_handle::HasWindowHandle;

    match window.window_handle() {
        Ok(handle) => log::info!("Native window handle: {:?}", handle.as_raw()),
        Err(e) => log::warn!("Native window handle unavailable: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::path::PathBuf;

    fn is_set<H: Handle>(handle: H) -> bool {
        handle.as_raw() != 0
    }

    fn gpu_config() -> Config {
        let mut config = Config::default();
        config.compute.shader_path =
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("shaders/add.comp.spv");
        config
    }

    #[test]
    #[ignore = "requires a Vulkan driver and a compiled shaders/add.comp.spv"]
    fn initialize_creates_every_handle() {
        let errors = ErrorLog::new();
        let context = ComputeContext::initialize(&gpu_config(), None, &errors).unwrap();

        assert!(is_set(context.device().physical_device));
        assert!(!context.device().physical_devices.is_empty());
        assert!(is_set(context.device().compute_queue));
        assert!(is_set(context.staging_buffer().handle()));
        assert!(is_set(context.device_local_buffer().handle()));
        assert!(is_set(context.commands().pool()));
        assert!(is_set(context.commands().buffer()));
        assert!(is_set(context.fence().handle()));
        assert!(is_set(context.shader().handle()));
        assert!(is_set(context.descriptor_pool().handle()));
        assert!(is_set(context.descriptor_set_layout().handle()));
        assert!(is_set(context.descriptor_set()));

        // Copy finished and the fence was reset for reuse
        assert!(!context.fence().is_signaled().unwrap());
        assert!(errors.is_empty(), "{}", errors.render());

        context.terminate();
        assert!(errors.is_empty(), "{}", errors.render());
    }

    #[test]
    fn null_handles_are_not_set() {
        assert!(!is_set(vk::Buffer::null()));
        assert!(!is_set(vk::DescriptorSet::null()));
        assert!(is_set(vk::Fence::from_raw(1)));
    }

    #[test]
    #[ignore = "requires a Vulkan driver and a compiled shaders/add.comp.spv"]
    fn copy_can_be_repeated() {
        let errors = ErrorLog::new();
        let context = ComputeContext::initialize(&gpu_config(), None, &errors).unwrap();

        context.copy_staging_to_device().unwrap();
        context.copy_staging_to_device().unwrap();
        assert!(!context.fence().is_signaled().unwrap());
        assert!(errors.is_empty(), "{}", errors.render());

        context.terminate();
        assert!(errors.is_empty(), "{}", errors.render());
    }

    #[test]
    #[ignore = "requires a Vulkan driver"]
    fn missing_shader_stops_initialization() {
        let mut config = gpu_config();
        config.compute.shader_path = PathBuf::from("missing/shader.spv");

        let err = ComputeContext::initialize(&config, None, &ErrorLog::new())
            .err()
            .unwrap();
        assert!(format!("{:#}", err).contains("missing/shader.spv"));
    }
}
