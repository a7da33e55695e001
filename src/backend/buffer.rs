// Buffer utilities for staging and storage buffers
//
// Memory comes from the shared gpu-allocator; each GpuBuffer owns exactly the
// allocation bound to it and returns both on drop.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;
use super::VulkanDevice;

/// Host-visible buffer used as the source of uploads
pub const STAGING_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::TRANSFER_SRC.as_raw() | vk::BufferUsageFlags::TRANSFER_DST.as_raw(),
);

/// Device-only buffer read and written by compute shaders
pub const DEVICE_LOCAL_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::TRANSFER_SRC.as_raw()
        | vk::BufferUsageFlags::TRANSFER_DST.as_raw()
        | vk::BufferUsageFlags::STORAGE_BUFFER.as_raw(),
);

/// A Vulkan buffer together with the allocation backing it
pub struct GpuBuffer {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
    device: Arc<VulkanDevice>,
}

impl GpuBuffer {
    /// Create a buffer, allocate memory for it in `location` and bind the two
    pub fn new(
        device: &Arc<VulkanDevice>,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .with_context(|| format!("vkCreateBuffer failed for {}", name))?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device.allocator().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e).with_context(|| format!("Allocating memory for {} failed", name));
            }
        };

        let bound = unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            let _ = device.allocator().free(allocation);
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(e).with_context(|| format!("vkBindBufferMemory failed for {}", name));
        }

        log::debug!("Created {} ({} bytes, {:?})", name, size, location);

        Ok(Self {
            buffer,
            allocation: Some(allocation),
            size,
            device: device.clone(),
        })
    }

    /// Memory visible to both CPU and GPU, used to feed the device-local buffer
    pub fn staging(device: &Arc<VulkanDevice>, size: vk::DeviceSize) -> Result<Self> {
        Self::new(device, "staging buffer", size, STAGING_USAGE, MemoryLocation::CpuToGpu)
            .context("Creating the staging buffer failed")
    }

    /// Memory only the GPU can see
    pub fn device_local(device: &Arc<VulkanDevice>, size: vk::DeviceSize) -> Result<Self> {
        Self::new(
            device,
            "device-local buffer",
            size,
            DEVICE_LOCAL_USAGE,
            MemoryLocation::GpuOnly,
        )
        .context("Creating the device-local buffer failed")
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Copy `data` into the mapped memory at `offset`
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let mapped = self
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .context("Buffer memory is not host visible")?;

        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= mapped.len())
            .with_context(|| {
                format!(
                    "Write of {} bytes at offset {} exceeds mapped size {}",
                    data.len(),
                    offset,
                    mapped.len()
                )
            })?;

        mapped[offset..end].copy_from_slice(data);
        Ok(())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator().free(allocation) {
                log::error!("Failed to free buffer memory: {}", e);
            }
        }

        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
        }
    }
}

/// Ascending native-endian u32 values filling `len` bytes
pub fn initial_payload(len: usize) -> Vec<u8> {
    let mut payload: Vec<u8> = (0..len / 4).flat_map(|i| (i as u32).to_ne_bytes()).collect();
    payload.resize(len, 0);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_usage_is_transfer_only() {
        assert!(STAGING_USAGE.contains(vk::BufferUsageFlags::TRANSFER_SRC));
        assert!(STAGING_USAGE.contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(!STAGING_USAGE.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
    }

    #[test]
    fn device_local_usage_includes_storage() {
        assert_eq!(
            DEVICE_LOCAL_USAGE,
            vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::STORAGE_BUFFER
        );
    }

    #[test]
    fn payload_counts_up_in_words() {
        let payload = initial_payload(12);
        let words: Vec<u32> = payload
            .chunks_exact(4)
            .map(|w| u32::from_ne_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        assert_eq!(words, vec![0, 1, 2]);
    }

    #[test]
    fn payload_pads_partial_word() {
        let payload = initial_payload(1000 + 2);
        assert_eq!(payload.len(), 1002);
        assert_eq!(&payload[1000..], &[0, 0]);
        assert!(initial_payload(0).is_empty());
    }
}
