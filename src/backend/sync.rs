// Synchronization primitives
//
// A single fence tracks completion of work submitted to the compute queue.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use std::time::Duration;
use super::VulkanDevice;

/// GPU -> CPU completion signal
pub struct Fence {
    fence: vk::Fence,
    device: Arc<VulkanDevice>,
}

impl Fence {
    pub fn new(device: &Arc<VulkanDevice>, signaled: bool) -> Result<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence_info = vk::FenceCreateInfo::builder().flags(flags);

        let fence = unsafe { device.device.create_fence(&fence_info, None) }
            .context("vkCreateFence failed")?;

        Ok(Self {
            fence,
            device: device.clone(),
        })
    }

    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Block until the fence is signaled or `timeout` elapses
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        unsafe { self.device.device.wait_for_fences(&[self.fence], true, timeout_ns) }
            .with_context(|| format!("Fence not signaled within {:?}", timeout))
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.device.device.reset_fences(&[self.fence]) }.context("vkResetFences failed")
    }

    #[cfg(test)]
    pub fn is_signaled(&self) -> Result<bool> {
        unsafe { self.device.device.get_fence_status(self.fence) }
            .context("vkGetFenceStatus failed")
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_fence(self.fence, None);
        }
    }
}
