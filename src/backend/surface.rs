// Presentation surface - binding between the instance and a native window
//
// Capability/format/present-mode queries are uncached; the swapchain asks
// again on every (re)creation.

use ash::extensions::khr;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;

use super::Instance;
use crate::error::{RenderError, RenderResult, VkResultExt};

/// Format the renderer asks for first.
pub const DESIRED_SURFACE_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_UNORM,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

pub struct Surface {
    surface: vk::SurfaceKHR,
    loader: khr::Surface,
    // Held so the instance outlives the surface
    _instance: Arc<Instance>,
}

impl Surface {
    pub fn new(
        instance: Arc<Instance>,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> RenderResult<Self> {
        let surface = unsafe {
            ash_window::create_surface(
                instance.entry(),
                instance.ash_instance(),
                display,
                window,
                None,
            )
        }
        .vk_context("create presentation surface")?;

        if surface == vk::SurfaceKHR::null() {
            return Err(RenderError::NullHandle {
                what: "presentation surface",
            });
        }

        let loader = khr::Surface::new(instance.entry(), instance.ash_instance());

        Ok(Self {
            surface,
            loader,
            _instance: instance,
        })
    }

    pub fn raw_surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn get_capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> RenderResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)
        }
        .vk_context("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")
    }

    pub fn get_supported_formats(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> RenderResult<Vec<vk::SurfaceFormatKHR>> {
        let formats = unsafe {
            self.loader
                .get_physical_device_surface_formats(physical_device, self.surface)
        }
        .vk_context("vkGetPhysicalDeviceSurfaceFormatsKHR")?;

        if formats.is_empty() {
            return Err(RenderError::Enumeration {
                what: "surface formats",
            });
        }
        Ok(formats)
    }

    pub fn get_present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> RenderResult<Vec<vk::PresentModeKHR>> {
        let modes = unsafe {
            self.loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)
        }
        .vk_context("vkGetPhysicalDeviceSurfacePresentModesKHR")?;

        if modes.is_empty() {
            return Err(RenderError::Enumeration {
                what: "present modes",
            });
        }
        Ok(modes)
    }

    /// Whether `queue_family` can present to this surface. A failed query counts as "no".
    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, queue_family: u32) -> bool {
        unsafe {
            self.loader.get_physical_device_surface_support(
                physical_device,
                queue_family,
                self.surface,
            )
        }
        .unwrap_or(false)
    }

    /// Query the formats and pick one, see [`choose_surface_format`].
    pub fn get_format(
        &self,
        physical_device: vk::PhysicalDevice,
        desired: vk::SurfaceFormatKHR,
    ) -> RenderResult<vk::SurfaceFormatKHR> {
        let formats = self.get_supported_formats(physical_device)?;
        choose_surface_format(&formats, desired).ok_or(RenderError::Enumeration {
            what: "surface formats",
        })
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        log::debug!("Destroying presentation surface");
        unsafe { self.loader.destroy_surface(self.surface, None) };
    }
}

/// Pick a surface format. Only returns `None` for an empty list.
///
/// 1. A single UNDEFINED entry means "anything goes": take `desired`.
/// 2. Exact format + colorspace match.
/// 3. Same format, other colorspace (logged).
/// 4. First reported pair (logged).
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    desired: vk::SurfaceFormatKHR,
) -> Option<vk::SurfaceFormatKHR> {
    if let [only] = formats {
        if only.format == vk::Format::UNDEFINED {
            return Some(desired);
        }
    }

    if formats
        .iter()
        .any(|f| f.format == desired.format && f.color_space == desired.color_space)
    {
        return Some(desired);
    }

    if let Some(found) = formats.iter().find(|f| f.format == desired.format) {
        log::warn!(
            "Surface format {:?} not available with {:?}, using colorspace {:?}",
            desired.format,
            desired.color_space,
            found.color_space
        );
        return Some(*found);
    }

    let first = formats.first().copied()?;
    log::warn!(
        "Surface format {:?} not supported, using {:?} / {:?}",
        desired.format,
        first.format,
        first.color_space
    );
    Some(first)
}
