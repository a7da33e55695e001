// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Physical device selection (needs a compute queue, prefers discrete GPU)
// - Logical device + compute queue creation
// - Memory allocator setup

use crate::error_log::ErrorLog;
use anyhow::{Context, Result};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use gpu_allocator::AllocatorDebugSettings;
use parking_lot::{Mutex, MutexGuard};
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

const ENGINE_NAME: &CStr = c"Lava";
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Dropped by hand before the device is destroyed
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    /// Every GPU the instance reported, in enumeration order
    pub physical_devices: Vec<vk::PhysicalDevice>,
    pub instance: ash::Instance,
    _entry: Entry,

    pub compute_queue: vk::Queue,
    pub compute_queue_family: u32,

    debug_utils: Option<DebugMessenger>,
    // Target of the messenger's user-data pointer, must outlive the messenger
    _debug_sink: Box<ErrorLog>,
}

/// What device selection needs to know about one enumerated GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCandidate {
    pub index: usize,
    pub device_type: vk::PhysicalDeviceType,
    pub compute_family: Option<u32>,
}

impl VulkanDevice {
    /// Create Vulkan device
    ///
    /// # Arguments
    /// * `app_name` - Application name reported to the driver
    /// * `enable_validation` - Enable Vulkan validation layers
    /// * `preferred_index` - Enumeration index of the GPU to favour
    /// * `errors` - Receives validation errors
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        preferred_index: Option<usize>,
        errors: &ErrorLog,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let validation = enable_validation && Self::validation_layer_available(&entry)?;
        let instance = Self::create_instance(&entry, app_name, validation)?;

        let debug_sink = Box::new(errors.clone());
        let debug_utils = if validation {
            match Self::setup_debug_messenger(&entry, &instance, &debug_sink) {
                Ok(debug_utils) => Some(debug_utils),
                Err(e) => {
                    unsafe { destroy_instance(&instance, None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        // From here on a failure must tear down the instance (and messenger)
        let selected = unsafe { instance.enumerate_physical_devices() }
            .context("vkEnumeratePhysicalDevices failed")
            .and_then(|devices| {
                let (physical_device, family) =
                    Self::select_physical_device(&instance, &devices, preferred_index)?;
                let (device, queue) =
                    Self::create_logical_device(&instance, physical_device, family)?;
                Ok((devices, physical_device, family, device, queue))
            });
        let (physical_devices, physical_device, compute_queue_family, device, compute_queue) =
            match selected {
                Ok(selected) => selected,
                Err(e) => {
                    unsafe { destroy_instance(&instance, debug_utils) };
                    return Err(e);
                }
            };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        log::info!(
            "Selected GPU: {} (compute queue family {})",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy(),
            compute_queue_family
        );

        let allocator = match Self::create_allocator(&instance, physical_device, &device) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe {
                    device.destroy_device(None);
                    destroy_instance(&instance, debug_utils);
                }
                return Err(e);
            }
        };

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            physical_devices,
            instance,
            _entry: entry,
            compute_queue,
            compute_queue_family,
            debug_utils,
            _debug_sink: debug_sink,
        }))
    }

    fn validation_layer_available(entry: &Entry) -> Result<bool> {
        let layers = entry
            .enumerate_instance_layer_properties()
            .context("vkEnumerateInstanceLayerProperties failed")?;

        let available = layers
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);

        if !available {
            log::warn!(
                "{} not installed, continuing without validation",
                VALIDATION_LAYER.to_string_lossy()
            );
        }
        Ok(available)
    }

    fn create_instance(entry: &Entry, app_name: &str, validation: bool) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(ENGINE_NAME)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_2);

        let (extensions, layer_names) = if validation {
            (
                vec![ash::extensions::ext::DebugUtils::name().as_ptr()],
                vec![VALIDATION_LAYER.as_ptr()],
            )
        } else {
            (vec![], vec![])
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Create instance failed")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
        sink: &ErrorLog,
    ) -> Result<DebugMessenger> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback))
            .user_data(sink as *const ErrorLog as *mut std::ffi::c_void);

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("vkCreateDebugUtilsMessengerEXT failed")?;

        Ok((debug_utils, messenger))
    }

    fn select_physical_device(
        instance: &ash::Instance,
        devices: &[vk::PhysicalDevice],
        preferred_index: Option<usize>,
    ) -> Result<(vk::PhysicalDevice, u32)> {
        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        let candidates: Vec<DeviceCandidate> = devices
            .iter()
            .enumerate()
            .map(|(index, &device)| {
                let properties = Self::log_device_properties(instance, index, device);
                let queue_families =
                    unsafe { instance.get_physical_device_queue_family_properties(device) };
                DeviceCandidate {
                    index,
                    device_type: properties.device_type,
                    compute_family: find_compute_queue_family(&queue_families),
                }
            })
            .collect();

        let chosen = choose_device(&candidates, preferred_index)
            .ok_or_else(|| anyhow::anyhow!("No GPU exposes a compute-capable queue family"))?;
        let family = chosen
            .compute_family
            .context("Selected GPU has no compute queue family")?;

        Ok((devices[chosen.index], family))
    }

    /// Query core and Vulkan 1.1 properties and log them
    fn log_device_properties(
        instance: &ash::Instance,
        index: usize,
        device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceProperties {
        let mut properties11 = vk::PhysicalDeviceVulkan11Properties::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::builder().push_next(&mut properties11);
        unsafe { instance.get_physical_device_properties2(device, &mut properties2) };
        let properties = properties2.properties;

        log::info!(
            "GPU {}: {} ({:?}), API {}.{}.{}, subgroup size {}",
            index,
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy(),
            properties.device_type,
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version),
            properties11.subgroup_size,
        );

        properties
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        compute_queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(compute_queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info));

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Create device failed")?;

        let compute_queue = unsafe { device.get_device_queue(compute_queue_family, 0) };

        Ok((device, compute_queue))
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                ..Default::default()
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Creating the memory allocator failed")?;

        Ok(allocator)
    }

    /// Exclusive access to the memory allocator
    pub fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock()
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("vkDeviceWaitIdle failed")?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        unsafe {
            // Remaining allocations are reported as leaks by the allocator
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);
            destroy_instance(&self.instance, self.debug_utils.take());
        }
    }
}

type DebugMessenger = (ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT);

/// Destroy the messenger (if any), then the instance it belongs to
///
/// # Safety
/// Every object created from `instance` must already be destroyed.
unsafe fn destroy_instance(instance: &ash::Instance, debug_utils: Option<DebugMessenger>) {
    if let Some((debug_utils, messenger)) = debug_utils {
        debug_utils.destroy_debug_utils_messenger(messenger, None);
    }
    instance.destroy_instance(None);
}

/// Index of the first queue family that supports compute
pub fn find_compute_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    families
        .iter()
        .position(|props| props.queue_count > 0 && props.queue_flags.contains(vk::QueueFlags::COMPUTE))
        .map(|i| i as u32)
}

/// Prefer discrete GPUs, then integrated, then anything else
pub fn device_type_score(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        _ => 1,
    }
}

/// Pick the GPU to run on.
///
/// A usable `preferred` index wins; otherwise the highest scoring device with
/// a compute queue, ties going to the earliest enumerated.
pub fn choose_device(
    candidates: &[DeviceCandidate],
    preferred: Option<usize>,
) -> Option<&DeviceCandidate> {
    if let Some(index) = preferred {
        match candidates.iter().find(|c| c.index == index) {
            Some(candidate) if candidate.compute_family.is_some() => return Some(candidate),
            Some(_) => log::warn!("GPU {} has no compute queue, selecting automatically", index),
            None => log::warn!("GPU {} does not exist, selecting automatically", index),
        }
    }

    let mut best: Option<&DeviceCandidate> = None;
    for candidate in candidates.iter().filter(|c| c.compute_family.is_some()) {
        let better = best.map_or(true, |b| {
            device_type_score(candidate.device_type) > device_type_score(b.device_type)
        });
        if better {
            best = Some(candidate);
        }
    }
    best
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message);
        }
        _ => {
            log::debug!("[Vulkan] {}", message);
        }
    }

    if message_severity == vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        if let Some(errors) = (p_user_data as *const ErrorLog).as_ref() {
            errors.push(format!("[Vulkan] {}", message));
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn candidate(
        index: usize,
        device_type: vk::PhysicalDeviceType,
        compute_family: Option<u32>,
    ) -> DeviceCandidate {
        DeviceCandidate {
            index,
            device_type,
            compute_family,
        }
    }

    #[test]
    fn first_compute_family_is_chosen() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        assert_eq!(find_compute_queue_family(&families), Some(1));
    }

    #[test]
    fn no_compute_family() {
        let families = [family(vk::QueueFlags::TRANSFER), family(vk::QueueFlags::SPARSE_BINDING)];
        assert_eq!(find_compute_queue_family(&families), None);
        assert_eq!(find_compute_queue_family(&[]), None);
    }

    #[test]
    fn empty_compute_family_is_skipped() {
        let mut empty = family(vk::QueueFlags::COMPUTE);
        empty.queue_count = 0;
        let families = [empty, family(vk::QueueFlags::COMPUTE)];
        assert_eq!(find_compute_queue_family(&families), Some(1));
    }

    #[test]
    fn discrete_gpu_wins() {
        let candidates = [
            candidate(0, vk::PhysicalDeviceType::INTEGRATED_GPU, Some(0)),
            candidate(1, vk::PhysicalDeviceType::DISCRETE_GPU, Some(2)),
            candidate(2, vk::PhysicalDeviceType::CPU, Some(0)),
        ];
        assert_eq!(choose_device(&candidates, None).map(|c| c.index), Some(1));
    }

    #[test]
    fn devices_without_compute_are_ignored() {
        let candidates = [
            candidate(0, vk::PhysicalDeviceType::DISCRETE_GPU, None),
            candidate(1, vk::PhysicalDeviceType::CPU, Some(0)),
        ];
        assert_eq!(choose_device(&candidates, None).map(|c| c.index), Some(1));

        let unusable = [candidate(0, vk::PhysicalDeviceType::DISCRETE_GPU, None)];
        assert!(choose_device(&unusable, None).is_none());
    }

    #[test]
    fn ties_go_to_first_enumerated() {
        let candidates = [
            candidate(0, vk::PhysicalDeviceType::INTEGRATED_GPU, Some(0)),
            candidate(1, vk::PhysicalDeviceType::INTEGRATED_GPU, Some(0)),
        ];
        assert_eq!(choose_device(&candidates, None).map(|c| c.index), Some(0));
    }

    #[test]
    fn preferred_index_overrides_score() {
        let candidates = [
            candidate(0, vk::PhysicalDeviceType::DISCRETE_GPU, Some(0)),
            candidate(1, vk::PhysicalDeviceType::INTEGRATED_GPU, Some(1)),
        ];
        assert_eq!(choose_device(&candidates, Some(1)).map(|c| c.index), Some(1));
    }

    #[test]
    fn unusable_preference_falls_back() {
        let candidates = [
            candidate(0, vk::PhysicalDeviceType::DISCRETE_GPU, Some(0)),
            candidate(1, vk::PhysicalDeviceType::INTEGRATED_GPU, None),
        ];
        assert_eq!(choose_device(&candidates, Some(1)).map(|c| c.index), Some(0));
        assert_eq!(choose_device(&candidates, Some(7)).map(|c| c.index), Some(0));
    }

    #[test]
    #[ignore = "requires a Vulkan driver with the validation layer"]
    fn repeated_create_and_drop_leaves_nothing_behind() {
        // The validation layer reports objects still alive at vkDestroyInstance
        let errors = ErrorLog::new();
        for _ in 0..3 {
            let device = VulkanDevice::new("lava-test", true, None, &errors).unwrap();
            drop(device);
        }
        assert!(errors.is_empty(), "{}", errors.render());
    }

    #[test]
    fn scores_are_ordered() {
        assert!(
            device_type_score(vk::PhysicalDeviceType::DISCRETE_GPU)
                > device_type_score(vk::PhysicalDeviceType::INTEGRATED_GPU)
        );
        assert!(
            device_type_score(vk::PhysicalDeviceType::INTEGRATED_GPU)
                > device_type_score(vk::PhysicalDeviceType::VIRTUAL_GPU)
        );
    }
}
