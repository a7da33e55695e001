// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash; every handle is destroyed by its owner's Drop

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod shader;
pub mod sync;

pub use device::VulkanDevice;
