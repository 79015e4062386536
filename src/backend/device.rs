// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Physical device selection (first device passing every filter, no scoring)
// - Logical device + graphics/compute/present queue creation
// - Memory type lookup for raw allocations

use ash::extensions::khr;
use ash::vk;
use std::ffi::CStr;
use std::sync::Arc;

use super::{Instance, Surface};
use crate::error::{RenderError, RenderResult, VkResultExt};

/// Queue family indices; any two may be equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// First family with graphics, first with compute (graphics family if none),
    /// first able to present.
    pub fn find(
        families: &[vk::QueueFamilyProperties],
        supports_present: impl Fn(u32) -> bool,
    ) -> Option<Self> {
        let with_flags = |flags: vk::QueueFlags| {
            families
                .iter()
                .position(|f| f.queue_count > 0 && f.queue_flags.contains(flags))
                .map(|i| i as u32)
        };

        let graphics = with_flags(vk::QueueFlags::GRAPHICS)?;
        let compute = with_flags(vk::QueueFlags::COMPUTE).unwrap_or(graphics);
        let present = (0..families.len() as u32).find(|&i| supports_present(i))?;

        Some(Self {
            graphics,
            compute,
            present,
        })
    }

    /// Distinct indices in graphics, compute, present order.
    pub fn unique(&self) -> Vec<u32> {
        let mut indices = Vec::with_capacity(3);
        for index in [self.graphics, self.compute, self.present] {
            if !indices.contains(&index) {
                indices.push(index);
            }
        }
        indices
    }
}

/// Logical device, its queues and the memory table of the owning GPU.
pub struct Device {
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    swapchain_loader: khr::Swapchain,

    pub families: QueueFamilies,
    pub graphics_queue: vk::Queue,
    pub compute_queue: vk::Queue,
    pub present_queue: vk::Queue,

    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl Device {
    /// Pick the first suitable GPU and create the logical device on it.
    ///
    /// A device whose logical-device creation fails is skipped, not fatal.
    pub fn new(instance: &Instance, surface: &Surface) -> RenderResult<Arc<Self>> {
        let ash_instance = instance.ash_instance();

        let physical_devices = unsafe { ash_instance.enumerate_physical_devices() }
            .vk_context("vkEnumeratePhysicalDevices")?;
        if physical_devices.is_empty() {
            return Err(RenderError::Enumeration {
                what: "physical devices",
            });
        }

        for physical_device in physical_devices {
            let properties =
                unsafe { ash_instance.get_physical_device_properties(physical_device) };
            let name =
                unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy();

            let Some(families) = Self::check_physical_device(ash_instance, surface, physical_device)
            else {
                log::info!("Skipping GPU '{}': requirements not met", name);
                continue;
            };

            let created = Self::create_logical_device(ash_instance, physical_device, families);
            let device = match created {
                Ok(device) => device,
                Err(e) => {
                    log::warn!("Skipping GPU '{}': {}", name, e);
                    continue;
                }
            };

            let memory_properties =
                unsafe { ash_instance.get_physical_device_memory_properties(physical_device) };

            let (graphics_queue, compute_queue, present_queue) = unsafe {
                (
                    device.get_device_queue(families.graphics, 0),
                    device.get_device_queue(families.compute, 0),
                    device.get_device_queue(families.present, 0),
                )
            };

            log::info!("Selected GPU: {}", name);
            log::info!(
                "API Version: {}.{}.{}",
                vk::api_version_major(properties.api_version),
                vk::api_version_minor(properties.api_version),
                vk::api_version_patch(properties.api_version)
            );
            log::debug!("Queue families: {:?}", families);

            let swapchain_loader = khr::Swapchain::new(ash_instance, &device);

            return Ok(Arc::new(Self {
                device,
                physical_device,
                swapchain_loader,
                families,
                graphics_queue,
                compute_queue,
                present_queue,
                properties,
                memory_properties,
            }));
        }

        Err(RenderError::NoSuitableDevice)
    }

    /// Geometry shaders, the swapchain extension, and graphics + present queues.
    fn check_physical_device(
        instance: &ash::Instance,
        surface: &Surface,
        physical_device: vk::PhysicalDevice,
    ) -> Option<QueueFamilies> {
        let features = unsafe { instance.get_physical_device_features(physical_device) };
        if features.geometry_shader != vk::TRUE {
            return None;
        }

        let extensions =
            unsafe { instance.enumerate_device_extension_properties(physical_device) }.ok()?;
        if !has_extension(&extensions, khr::Swapchain::name()) {
            return None;
        }

        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        QueueFamilies::find(&queue_families, |index| {
            surface.supports_present(physical_device, index)
        })
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: QueueFamilies,
    ) -> RenderResult<ash::Device> {
        let queue_priorities = [0.0];
        let queue_create_infos: Vec<_> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions = [khr::Swapchain::name().as_ptr()];
        let features = vk::PhysicalDeviceFeatures::builder().geometry_shader(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .vk_context("vkCreateDevice")?;

        if device.handle() == vk::Device::null() {
            return Err(RenderError::NullHandle {
                what: "logical device",
            });
        }
        Ok(device)
    }

    pub fn ash_device(&self) -> &ash::Device {
        &self.device
    }

    pub fn raw_physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn swapchain_loader(&self) -> &khr::Swapchain {
        &self.swapchain_loader
    }

    /// Index of the first memory type allowed by `type_bits` that has all `required` flags.
    pub fn get_memory_type(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    ) -> RenderResult<u32> {
        find_memory_type(&self.memory_properties, type_bits, required).ok_or_else(|| {
            RenderError::Unsupported(format!(
                "no memory type in mask {:#b} with {:?}",
                type_bits, required
            ))
        })
    }

    pub fn format_properties(
        &self,
        instance: &Instance,
        format: vk::Format,
    ) -> vk::FormatProperties {
        unsafe {
            instance
                .ash_instance()
                .get_physical_device_format_properties(self.physical_device, format)
        }
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> RenderResult<()> {
        unsafe { self.device.device_wait_idle() }.vk_context("vkDeviceWaitIdle")
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        log::debug!("Destroying logical device");
        if let Err(e) = self.wait_idle() {
            log::error!("Device did not go idle before destruction: {}", e);
        }
        unsafe { self.device.destroy_device(None) };
    }
}

pub fn has_extension(available: &[vk::ExtensionProperties], name: &CStr) -> bool {
    available
        .iter()
        .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == name)
}

pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        let allowed = type_bits & (1 << i) != 0;
        allowed
            && memory_properties.memory_types[i as usize]
                .property_flags
                .contains(required)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    fn memory(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = *flags;
        }
        props
    }

    fn extension(name: &CStr) -> vk::ExtensionProperties {
        let mut props = vk::ExtensionProperties::default();
        for (dst, src) in props.extension_name.iter_mut().zip(name.to_bytes()) {
            *dst = *src as std::ffi::c_char;
        }
        props
    }

    #[test]
    fn single_family_serves_every_role() {
        let families = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            16,
        )];
        let found = QueueFamilies::find(&families, |_| true).unwrap();

        assert_eq!(
            found,
            QueueFamilies {
                graphics: 0,
                compute: 0,
                present: 0
            }
        );
        assert_eq!(found.unique(), vec![0]);
    }

    #[test]
    fn distinct_families_are_deduplicated_in_order() {
        let families = [
            family(vk::QueueFlags::TRANSFER, 1),
            family(vk::QueueFlags::GRAPHICS, 1),
            family(vk::QueueFlags::COMPUTE, 2),
        ];
        let found = QueueFamilies::find(&families, |i| i == 2).unwrap();

        assert_eq!(found.graphics, 1);
        assert_eq!(found.compute, 2);
        assert_eq!(found.present, 2);
        assert_eq!(found.unique(), vec![1, 2]);
    }

    #[test]
    fn empty_families_are_ignored() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, 0),
            family(vk::QueueFlags::GRAPHICS, 1),
        ];
        let found = QueueFamilies::find(&families, |_| true).unwrap();
        assert_eq!(found.graphics, 1);
        // no compute family anywhere: falls back to graphics
        assert_eq!(found.compute, 1);
    }

    #[test]
    fn missing_graphics_or_present_rejects_device() {
        let compute_only = [family(vk::QueueFlags::COMPUTE, 1)];
        assert!(QueueFamilies::find(&compute_only, |_| true).is_none());

        let graphics = [family(vk::QueueFlags::GRAPHICS, 1)];
        assert!(QueueFamilies::find(&graphics, |_| false).is_none());
    }

    #[test]
    fn memory_type_respects_mask_and_flags() {
        let props = memory(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        assert_eq!(find_memory_type(&props, 0b111, host), Some(2));
        assert_eq!(
            find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::HOST_VISIBLE),
            Some(1)
        );
        assert_eq!(
            find_memory_type(&props, 0b001, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
        assert_eq!(find_memory_type(&props, 0b011, host), None);
    }

    #[test]
    fn memory_type_superset_matches() {
        let props = memory(&[vk::MemoryPropertyFlags::DEVICE_LOCAL
            | vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT]);
        assert_eq!(
            find_memory_type(&props, u32::MAX, vk::MemoryPropertyFlags::HOST_VISIBLE),
            Some(0)
        );
        assert_eq!(find_memory_type(&props, 0, vk::MemoryPropertyFlags::empty()), None);
    }

    #[test]
    fn extension_lookup_compares_names() {
        let available = [
            extension(c"VK_KHR_maintenance1"),
            extension(khr::Swapchain::name()),
        ];
        assert!(has_extension(&available, khr::Swapchain::name()));
        assert!(!has_extension(&available[..1], khr::Swapchain::name()));
    }
}
