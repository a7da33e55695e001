// Descriptor pool, set layout and set updates
//
// Compute shaders see the device-local buffer through a single storage-buffer
// descriptor at binding 0.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use super::VulkanDevice;

/// Pool sizes for a pool that only hands out storage-buffer descriptors
pub fn storage_pool_sizes(storage_buffer_count: u32) -> [vk::DescriptorPoolSize; 1] {
    [vk::DescriptorPoolSize {
        ty: vk::DescriptorType::STORAGE_BUFFER,
        descriptor_count: storage_buffer_count,
    }]
}

/// Layout binding for one storage buffer visible to the compute stage
pub fn storage_buffer_binding(binding: u32) -> vk::DescriptorSetLayoutBinding {
    vk::DescriptorSetLayoutBinding::builder()
        .binding(binding)
        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
        .descriptor_count(1)
        .stage_flags(vk::ShaderStageFlags::COMPUTE)
        .build()
}

pub struct DescriptorPool {
    pool: vk::DescriptorPool,
    device: Arc<VulkanDevice>,
}

impl DescriptorPool {
    /// Sets may be freed individually (`FREE_DESCRIPTOR_SET`)
    pub fn new(
        device: &Arc<VulkanDevice>,
        max_sets: u32,
        storage_buffer_count: u32,
    ) -> Result<Self> {
        let pool_sizes = storage_pool_sizes(storage_buffer_count);
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes);

        let pool = unsafe { device.device.create_descriptor_pool(&create_info, None) }
            .context("vkCreateDescriptorPool failed")?;

        Ok(Self {
            pool,
            device: device.clone(),
        })
    }

    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Allocate one descriptor set. It lives as long as the pool and can be
    /// reused for any pipeline sharing `layout`.
    pub fn allocate(&self, layout: &DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        let set_layouts = [layout.handle()];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(&set_layouts);

        let sets = unsafe { self.device.device.allocate_descriptor_sets(&alloc_info) }
            .context("vkAllocateDescriptorSets failed")?;

        sets.into_iter()
            .next()
            .context("vkAllocateDescriptorSets returned no set")
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_descriptor_pool(self.pool, None);
        }
    }
}

pub struct DescriptorSetLayout {
    layout: vk::DescriptorSetLayout,
    device: Arc<VulkanDevice>,
}

impl DescriptorSetLayout {
    pub fn storage_buffer(device: &Arc<VulkanDevice>, binding: u32) -> Result<Self> {
        let bindings = [storage_buffer_binding(binding)];
        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

        let layout = unsafe { device.device.create_descriptor_set_layout(&create_info, None) }
            .context("vkCreateDescriptorSetLayout failed")?;

        Ok(Self {
            layout,
            device: device.clone(),
        })
    }

    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// Point `binding` of `set` at the first `range` bytes of `buffer`
pub fn write_storage_buffer(
    device: &VulkanDevice,
    set: vk::DescriptorSet,
    binding: u32,
    buffer: vk::Buffer,
    range: vk::DeviceSize,
) {
    let buffer_info = [vk::DescriptorBufferInfo {
        buffer,
        offset: 0,
        range,
    }];

    let write = vk::WriteDescriptorSet::builder()
        .dst_set(set)
        .dst_binding(binding)
        .dst_array_element(0)
        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
        .buffer_info(&buffer_info)
        .build();

    unsafe {
        device.device.update_descriptor_sets(&[write], &[]);
    }
}
