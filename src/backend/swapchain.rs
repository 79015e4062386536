// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// Replaced wholesale on resize; the previous handle is handed to the driver
// as a reuse hint and destroyed once the replacement exists.

use ash::vk;
use std::sync::Arc;

use super::surface::DESIRED_SURFACE_FORMAT;
use super::{Device, Surface};
use crate::error::{RenderError, RenderResult, VkResultExt};

pub struct Swapchain {
    image_views: Vec<vk::ImageView>,
    images: Vec<vk::Image>,
    swapchain: vk::SwapchainKHR,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    device: Arc<Device>,
}

impl Swapchain {
    pub fn new(
        device: Arc<Device>,
        surface: &Surface,
        preferred_mode: vk::PresentModeKHR,
        width: u32,
        height: u32,
    ) -> RenderResult<Self> {
        Self::create(
            device,
            surface,
            preferred_mode,
            width,
            height,
            vk::SwapchainKHR::null(),
        )
    }

    /// Build a replacement chain, then release this one.
    ///
    /// On failure `self` keeps ownership of its (now retired) handle and views.
    pub fn recreate(
        &mut self,
        surface: &Surface,
        preferred_mode: vk::PresentModeKHR,
        width: u32,
        height: u32,
    ) -> RenderResult<()> {
        let replacement = Self::create(
            self.device.clone(),
            surface,
            preferred_mode,
            width,
            height,
            self.swapchain,
        )?;
        // Drops the old chain: views first, then the retired handle.
        *self = replacement;
        Ok(())
    }

    fn create(
        device: Arc<Device>,
        surface: &Surface,
        preferred_mode: vk::PresentModeKHR,
        width: u32,
        height: u32,
        old_swapchain: vk::SwapchainKHR,
    ) -> RenderResult<Self> {
        log::info!("Creating swapchain: {}x{}", width, height);

        let physical_device = device.raw_physical_device();

        let present_modes = surface.get_present_modes(physical_device)?;
        let present_mode = choose_present_mode(&present_modes, preferred_mode)?;
        log::info!("Present mode: {:?}", present_mode);

        let format = surface.get_format(physical_device, DESIRED_SURFACE_FORMAT)?;

        let caps = surface.get_capabilities(physical_device)?;
        let image_count = choose_image_count(&caps);
        let extent = choose_extent(&caps, width, height);
        let usage = choose_image_usage(&caps)?;
        let pre_transform = choose_pre_transform(&caps);
        let composite_alpha = choose_composite_alpha(&caps)?;

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.raw_surface())
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(pre_transform)
            .composite_alpha(composite_alpha)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { device.swapchain_loader().create_swapchain(&create_info, None) }
            .vk_context("vkCreateSwapchainKHR")?;
        if swapchain == vk::SwapchainKHR::null() {
            return Err(RenderError::NullHandle { what: "swapchain" });
        }

        // From here on, Drop cleans up whatever has been created so far.
        let mut chain = Self {
            image_views: Vec::new(),
            images: Vec::new(),
            swapchain,
            format,
            extent,
            present_mode,
            device,
        };

        chain.images = unsafe { chain.device.swapchain_loader().get_swapchain_images(swapchain) }
            .vk_context("vkGetSwapchainImagesKHR")?;
        if chain.images.is_empty() {
            return Err(RenderError::Enumeration {
                what: "swapchain images",
            });
        }

        for i in 0..chain.images.len() {
            let view = chain.create_view(chain.images[i])?;
            chain.image_views.push(view);
        }

        log::info!(
            "Created swapchain with {} images ({}x{}, {:?})",
            chain.images.len(),
            extent.width,
            extent.height,
            format.format
        );

        Ok(chain)
    }

    fn create_view(&self, image: vk::Image) -> RenderResult<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.format.format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        unsafe { self.device.ash_device().create_image_view(&create_info, None) }
            .vk_context("vkCreateImageView (swapchain)")
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    /// Index of the next presentable image.
    ///
    /// Suboptimal counts as success; the image is still rendered and presented.
    pub fn acquire_next_image_index(
        &self,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> RenderResult<u32> {
        let (index, suboptimal) = unsafe {
            self.device
                .swapchain_loader()
                .acquire_next_image(self.swapchain, u64::MAX, semaphore, fence)
        }
        .vk_context("vkAcquireNextImageKHR")?;

        if suboptimal {
            log::debug!("Acquired image {} from a suboptimal swapchain", index);
        }
        Ok(index)
    }

    /// Present rendered image to screen
    pub fn queue_present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: Option<vk::Semaphore>,
    ) -> RenderResult<()> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let wait_semaphores: Vec<_> = wait_semaphore.into_iter().collect();

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe {
            self.device
                .swapchain_loader()
                .queue_present(queue, &present_info)
        }
        .vk_context("vkQueuePresentKHR")?;
        Ok(())
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        log::debug!("Destroying swapchain ({} views)", self.image_views.len());
        unsafe {
            for &view in &self.image_views {
                self.device.ash_device().destroy_image_view(view, None);
            }
            self.device
                .swapchain_loader()
                .destroy_swapchain(self.swapchain, None);
        }
    }
}

/// MAILBOX: No vsync, no tearing, triple buffered
/// FIFO: Vsync enabled, guaranteed available
///
/// `preferred` when present, FIFO otherwise.
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> RenderResult<vk::PresentModeKHR> {
    if available.contains(&preferred) {
        return Ok(preferred);
    }
    if available.contains(&vk::PresentModeKHR::FIFO) {
        log::warn!("Present mode {:?} unavailable, falling back to FIFO", preferred);
        return Ok(vk::PresentModeKHR::FIFO);
    }
    Err(RenderError::Unsupported(format!(
        "neither {:?} nor FIFO present mode is available",
        preferred
    )))
}

/// One more than the minimum, bounded by the maximum (0 = unbounded).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

/// The surface's current extent, or the requested size clamped to the
/// surface limits when the surface leaves it to us.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

pub fn choose_image_usage(caps: &vk::SurfaceCapabilitiesKHR) -> RenderResult<vk::ImageUsageFlags> {
    let supported = caps.supported_usage_flags;
    if !supported.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT) {
        return Err(RenderError::Unsupported(
            "swapchain images cannot be color attachments".into(),
        ));
    }

    let mut usage = vk::ImageUsageFlags::COLOR_ATTACHMENT;
    for extra in [
        vk::ImageUsageFlags::TRANSFER_SRC,
        vk::ImageUsageFlags::TRANSFER_DST,
    ] {
        if supported.contains(extra) {
            usage |= extra;
        }
    }
    Ok(usage)
}

pub fn choose_pre_transform(caps: &vk::SurfaceCapabilitiesKHR) -> vk::SurfaceTransformFlagsKHR {
    if caps
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        caps.current_transform
    }
}

pub fn choose_composite_alpha(
    caps: &vk::SurfaceCapabilitiesKHR,
) -> RenderResult<vk::CompositeAlphaFlagsKHR> {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::INHERIT,
    ]
    .into_iter()
    .find(|&flag| caps.supported_composite_alpha.contains(flag))
    .ok_or_else(|| RenderError::Unsupported("no composite alpha mode".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            current_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT,
        }
    }

    fn size(extent: vk::Extent2D) -> (u32, u32) {
        (extent.width, extent.height)
    }

    #[test]
    fn mailbox_preferred_when_available() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX).unwrap(),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn fifo_fallback_when_mailbox_missing() {
        let modes = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX).unwrap(),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn present_mode_fails_without_mailbox_or_fifo() {
        let modes = [vk::PresentModeKHR::IMMEDIATE];
        let err = choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX).unwrap_err();
        assert!(matches!(err, RenderError::Unsupported(_)));
        assert!(choose_present_mode(&[], vk::PresentModeKHR::MAILBOX).is_err());
    }

    #[test]
    fn image_count_is_min_plus_one_clamped() {
        let mut c = caps();
        assert_eq!(choose_image_count(&c), 3);

        c.max_image_count = 2;
        assert_eq!(choose_image_count(&c), 2);

        // zero maximum means no limit
        c.min_image_count = 3;
        c.max_image_count = 0;
        assert_eq!(choose_image_count(&c), 4);
    }

    #[test]
    fn current_extent_is_authoritative() {
        let c = caps();
        assert_eq!(size(choose_extent(&c, 640, 480)), (1280, 720));
    }

    #[test]
    fn undefined_extent_uses_clamped_request() {
        let mut c = caps();
        c.current_extent = vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        };
        assert_eq!(size(choose_extent(&c, 640, 480)), (640, 480));

        c.max_image_extent = vk::Extent2D {
            width: 800,
            height: 400,
        };
        assert_eq!(size(choose_extent(&c, 1920, 1080)), (800, 400));
        assert_eq!(size(choose_extent(&c, 0, 0)), (1, 1));
    }

    #[test]
    fn usage_adds_transfer_only_when_supported() {
        let mut c = caps();
        assert_eq!(
            choose_image_usage(&c).unwrap(),
            vk::ImageUsageFlags::COLOR_ATTACHMENT
        );

        c.supported_usage_flags |=
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED;
        assert_eq!(
            choose_image_usage(&c).unwrap(),
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST
        );

        c.supported_usage_flags = vk::ImageUsageFlags::TRANSFER_SRC;
        assert!(choose_image_usage(&c).is_err());
    }

    #[test]
    fn identity_transform_preferred() {
        let mut c = caps();
        c.supported_transforms =
            vk::SurfaceTransformFlagsKHR::IDENTITY | vk::SurfaceTransformFlagsKHR::ROTATE_90;
        c.current_transform = vk::SurfaceTransformFlagsKHR::ROTATE_90;
        assert_eq!(choose_pre_transform(&c), vk::SurfaceTransformFlagsKHR::IDENTITY);

        c.supported_transforms = vk::SurfaceTransformFlagsKHR::ROTATE_90;
        assert_eq!(choose_pre_transform(&c), vk::SurfaceTransformFlagsKHR::ROTATE_90);
    }

    #[test]
    fn composite_alpha_follows_preference_order() {
        let mut c = caps();
        c.supported_composite_alpha =
            vk::CompositeAlphaFlagsKHR::INHERIT | vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED;
        assert_eq!(
            choose_composite_alpha(&c).unwrap(),
            vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED
        );

        c.supported_composite_alpha = vk::CompositeAlphaFlagsKHR::empty();
        assert!(choose_composite_alpha(&c).is_err());
    }
}
