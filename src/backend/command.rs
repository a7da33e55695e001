// Command pool and the single primary command buffer
//
// The buffer is recorded once (staging -> device-local copy) and submitted
// to the compute queue, which also accepts transfer commands.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use super::sync::Fence;
use super::VulkanDevice;

/// The copy buffer is re-recorded on every upload, so it must be resettable
pub const POOL_FLAGS: vk::CommandPoolCreateFlags = vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER;

pub struct CommandContext {
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    device: Arc<VulkanDevice>,
}

impl CommandContext {
    /// Create a command pool on the compute queue family and allocate one
    /// primary command buffer from it
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.compute_queue_family)
            .flags(POOL_FLAGS);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("vkCreateCommandPool failed")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffer = match unsafe { device.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe { device.device.destroy_command_pool(pool, None) };
                return Err(e).context("vkAllocateCommandBuffers failed");
            }
        };

        Ok(Self {
            pool,
            buffer,
            device: device.clone(),
        })
    }

    pub fn pool(&self) -> vk::CommandPool {
        self.pool
    }

    pub fn buffer(&self) -> vk::CommandBuffer {
        self.buffer
    }

    /// Record a one-shot copy of the first `size` bytes of `src` into `dst`.
    ///
    /// The buffer is reset first, so any earlier submission must have completed.
    pub fn record_copy(&self, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) -> Result<()> {
        let device = &self.device.device;
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            device
                .reset_command_buffer(self.buffer, vk::CommandBufferResetFlags::empty())
                .context("vkResetCommandBuffer failed")?;
            device
                .begin_command_buffer(self.buffer, &begin_info)
                .context("vkBeginCommandBuffer failed")?;
            device.cmd_copy_buffer(self.buffer, src, dst, &[copy_region(size)]);
            device
                .end_command_buffer(self.buffer)
                .context("vkEndCommandBuffer failed")?;
        }

        Ok(())
    }

    /// Submit the recorded buffer; `fence` is signaled once the GPU is done
    pub fn submit(&self, fence: &Fence) -> Result<()> {
        let command_buffers = [self.buffer];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

        unsafe {
            self.device.device.queue_submit(
                self.device.compute_queue,
                &[submit_info.build()],
                fence.handle(),
            )
        }
        .context("vkQueueSubmit failed")
    }
}

impl Drop for CommandContext {
    fn drop(&mut self) {
        // Frees the command buffer as well
        unsafe {
            self.device.device.destroy_command_pool(self.pool, None);
        }
    }
}

/// Region copying `size` bytes from the start of one buffer to the start of another
pub fn copy_region(size: vk::DeviceSize) -> vk::BufferCopy {
    vk::BufferCopy {
        src_offset: 0,
        dst_offset: 0,
        size,
    }
}
