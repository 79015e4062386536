// Buffer utilities for vertex, index, uniform and depth resources
//
// Memory is allocated directly per resource; memory types come from
// `Device::get_memory_type`.

use ash::vk;
use std::sync::Arc;

use super::{Device, Instance};
use crate::error::{RenderError, RenderResult, VkResultExt};

/// Host-visible, host-coherent buffer with its own allocation.
pub struct HostBuffer {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    device: Arc<Device>,
}

impl HostBuffer {
    pub fn new(
        device: Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> RenderResult<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let raw = device.ash_device();
        let buffer = unsafe { raw.create_buffer(&buffer_info, None) }.vk_context("vkCreateBuffer")?;

        // Owns the handle from here; early returns release it.
        let mut host = Self {
            buffer,
            memory: vk::DeviceMemory::null(),
            size,
            device: device.clone(),
        };

        let requirements = unsafe { raw.get_buffer_memory_requirements(buffer) };
        let memory_type_index = device.get_memory_type(
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        host.memory = unsafe { raw.allocate_memory(&alloc_info, None) }
            .vk_context("vkAllocateMemory (buffer)")?;

        unsafe { raw.bind_buffer_memory(buffer, host.memory, 0) }
            .vk_context("vkBindBufferMemory")?;

        Ok(host)
    }

    /// Create a buffer sized for `data` and fill it
    pub fn with_data<T: bytemuck::Pod>(
        device: Arc<Device>,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> RenderResult<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let buffer = Self::new(device, bytes.len() as vk::DeviceSize, usage)?;
        buffer.write(bytes)?;
        Ok(buffer)
    }

    /// Overwrite the start of the buffer. Coherent memory: no flush needed.
    pub fn write(&self, bytes: &[u8]) -> RenderResult<()> {
        let len = bytes.len() as vk::DeviceSize;
        if len > self.size {
            return Err(RenderError::Unsupported(format!(
                "write of {} bytes into a {} byte buffer",
                len, self.size
            )));
        }

        let raw = self.device.ash_device();
        unsafe {
            let ptr = raw
                .map_memory(self.memory, 0, len, vk::MemoryMapFlags::empty())
                .vk_context("vkMapMemory")? as *mut u8;
            ptr.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
            raw.unmap_memory(self.memory);
        }
        Ok(())
    }

    pub fn raw(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        let raw = self.device.ash_device();
        unsafe {
            raw.destroy_buffer(self.buffer, None);
            if self.memory != vk::DeviceMemory::null() {
                raw.free_memory(self.memory, None);
            }
        }
    }
}

/// Depth formats in order of preference.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 5] = [
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D32_SFLOAT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D16_UNORM_S8_UINT,
    vk::Format::D16_UNORM,
];

/// First candidate usable as an optimally tiled depth/stencil attachment.
pub fn choose_depth_format(
    optimal_features: impl Fn(vk::Format) -> vk::FormatFeatureFlags,
) -> Option<vk::Format> {
    DEPTH_FORMAT_CANDIDATES.into_iter().find(|&format| {
        optimal_features(format).contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    })
}

pub fn find_depth_format(instance: &Instance, device: &Device) -> RenderResult<vk::Format> {
    let format = choose_depth_format(|format| {
        device
            .format_properties(instance, format)
            .optimal_tiling_features
    })
    .ok_or_else(|| RenderError::Unsupported("no depth/stencil attachment format".into()))?;

    log::debug!("Depth format: {:?}", format);
    Ok(format)
}

pub fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::S8_UINT
    )
}

pub fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    if has_stencil(format) {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else {
        vk::ImageAspectFlags::DEPTH
    }
}

/// Depth image, memory and view sized to the drawable.
pub struct DepthBuffer {
    view: vk::ImageView,
    image: vk::Image,
    memory: vk::DeviceMemory,
    pub format: vk::Format,
    device: Arc<Device>,
}

impl DepthBuffer {
    pub fn new(
        device: Arc<Device>,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> RenderResult<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let raw = device.ash_device();
        let image = unsafe { raw.create_image(&image_info, None) }
            .vk_context("vkCreateImage (depth)")?;

        let mut depth = Self {
            view: vk::ImageView::null(),
            image,
            memory: vk::DeviceMemory::null(),
            format,
            device: device.clone(),
        };

        let requirements = unsafe { raw.get_image_memory_requirements(image) };
        let memory_type_index = device.get_memory_type(
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        depth.memory = unsafe { raw.allocate_memory(&alloc_info, None) }
            .vk_context("vkAllocateMemory (depth)")?;

        unsafe { raw.bind_image_memory(image, depth.memory, 0) }.vk_context("vkBindImageMemory")?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: depth_aspect(format),
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        depth.view = unsafe { raw.create_image_view(&view_info, None) }
            .vk_context("vkCreateImageView (depth)")?;

        log::debug!(
            "Created depth buffer {}x{} ({:?})",
            extent.width,
            extent.height,
            format
        );
        Ok(depth)
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }
}

impl Drop for DepthBuffer {
    fn drop(&mut self) {
        let raw = self.device.ash_device();
        unsafe {
            if self.view != vk::ImageView::null() {
                raw.destroy_image_view(self.view, None);
            }
            raw.destroy_image(self.image, None);
            if self.memory != vk::DeviceMemory::null() {
                raw.free_memory(self.memory, None);
            }
        }
    }
}
