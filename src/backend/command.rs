// Command pool and per-image command buffers
//
// One primary buffer per swapchain image, recorded once and replayed every
// frame. Re-recorded only when the swapchain is rebuilt.

use ash::vk;
use std::sync::Arc;

use super::pipeline::Framebuffers;
use super::Device;
use crate::error::{RenderError, RenderResult, VkResultExt};

/// Everything a recorded draw refers to.
#[derive(Debug, Clone, Copy)]
pub struct DrawCommand {
    pub render_pass: vk::RenderPass,
    pub pipeline: vk::Pipeline,
    pub pipeline_layout: vk::PipelineLayout,
    pub descriptor_set: vk::DescriptorSet,
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub index_count: u32,
    pub viewport: vk::Viewport,
    pub scissor: vk::Rect2D,
    pub clear_color: [f32; 4],
}

pub fn clear_values(color: [f32; 4]) -> [vk::ClearValue; 2] {
    [
        vk::ClearValue {
            color: vk::ClearColorValue { float32: color },
        },
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        },
    ]
}

pub fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

pub fn full_scissor(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

pub struct Commands {
    buffers: Vec<vk::CommandBuffer>,
    pool: vk::CommandPool,
    device: Arc<Device>,
}

impl Commands {
    /// Pool on `queue_family` whose buffers can be reset individually.
    pub fn new(device: Arc<Device>, queue_family: u32, count: usize) -> RenderResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);

        let pool = unsafe { device.ash_device().create_command_pool(&pool_info, None) }
            .vk_context("vkCreateCommandPool")?;

        let mut commands = Self {
            buffers: Vec::new(),
            pool,
            device,
        };
        commands.allocate(count)?;
        Ok(commands)
    }

    /// Free every buffer and allocate `count` fresh primaries.
    pub fn reallocate(&mut self, count: usize) -> RenderResult<()> {
        self.free();
        self.allocate(count)
    }

    fn allocate(&mut self, count: usize) -> RenderResult<()> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count as u32);

        self.buffers = unsafe { self.device.ash_device().allocate_command_buffers(&alloc_info) }
            .vk_context("vkAllocateCommandBuffers")?;
        Ok(())
    }

    fn free(&mut self) {
        if self.buffers.is_empty() {
            return;
        }
        unsafe {
            self.device
                .ash_device()
                .free_command_buffers(self.pool, &self.buffers)
        };
        self.buffers.clear();
    }

    pub fn get(&self, index: usize) -> Option<vk::CommandBuffer> {
        self.buffers.get(index).copied()
    }

    /// Record the triangle draw into every buffer, one framebuffer each.
    pub fn record(&self, framebuffers: &Framebuffers, draw: &DrawCommand) -> RenderResult<()> {
        if framebuffers.len() != self.buffers.len() {
            return Err(RenderError::Unsupported(format!(
                "{} command buffers for {} framebuffers",
                self.buffers.len(),
                framebuffers.len()
            )));
        }

        let raw = self.device.ash_device();
        let clear_values = clear_values(draw.clear_color);
        let viewports = [draw.viewport];
        let scissors = [draw.scissor];

        for (index, &command_buffer) in self.buffers.iter().enumerate() {
            let framebuffer = framebuffers.get(index).ok_or(RenderError::Enumeration {
                what: "framebuffers",
            })?;

            let begin_info = vk::CommandBufferBeginInfo::builder();
            let render_pass_info = vk::RenderPassBeginInfo::builder()
                .render_pass(draw.render_pass)
                .framebuffer(framebuffer)
                .render_area(draw.scissor)
                .clear_values(&clear_values);

            unsafe {
                raw.begin_command_buffer(command_buffer, &begin_info)
                    .vk_context("vkBeginCommandBuffer")?;

                raw.cmd_begin_render_pass(
                    command_buffer,
                    &render_pass_info,
                    vk::SubpassContents::INLINE,
                );

                raw.cmd_set_viewport(command_buffer, 0, &viewports);
                raw.cmd_set_scissor(command_buffer, 0, &scissors);

                raw.cmd_bind_descriptor_sets(
                    command_buffer,
                    vk::PipelineBindPoint::GRAPHICS,
                    draw.pipeline_layout,
                    0,
                    &[draw.descriptor_set],
                    &[],
                );
                raw.cmd_bind_pipeline(
                    command_buffer,
                    vk::PipelineBindPoint::GRAPHICS,
                    draw.pipeline,
                );

                raw.cmd_bind_vertex_buffers(command_buffer, 0, &[draw.vertex_buffer], &[0]);
                raw.cmd_bind_index_buffer(
                    command_buffer,
                    draw.index_buffer,
                    0,
                    vk::IndexType::UINT32,
                );

                raw.cmd_draw_indexed(command_buffer, draw.index_count, 1, 0, 0, 0);

                raw.cmd_end_render_pass(command_buffer);
                raw.end_command_buffer(command_buffer)
                    .vk_context("vkEndCommandBuffer")?;
            }
        }

        log::debug!(
            "Recorded {} command buffers at {}x{}",
            self.buffers.len(),
            draw.scissor.extent.width,
            draw.scissor.extent.height
        );
        Ok(())
    }
}

impl Drop for Commands {
    fn drop(&mut self) {
        self.free();
        unsafe {
            self.device
                .ash_device()
                .destroy_command_pool(self.pool, None)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clears_to_color_and_far_depth() {
        let [color, depth] = clear_values([0.0, 0.0, 0.2, 1.0]);
        unsafe {
            assert_eq!(color.color.float32, [0.0, 0.0, 0.2, 1.0]);
            assert_eq!(depth.depth_stencil.depth, 1.0);
            assert_eq!(depth.depth_stencil.stencil, 0);
        }
    }

    #[test]
    fn viewport_and_scissor_cover_extent() {
        let extent = vk::Extent2D {
            width: 640,
            height: 480,
        };

        let viewport = full_viewport(extent);
        assert_eq!((viewport.x, viewport.y), (0.0, 0.0));
        assert_eq!((viewport.width, viewport.height), (640.0, 480.0));
        assert_eq!((viewport.min_depth, viewport.max_depth), (0.0, 1.0));

        let scissor = full_scissor(extent);
        assert_eq!((scissor.offset.x, scissor.offset.y), (0, 0));
        assert_eq!((scissor.extent.width, scissor.extent.height), (640, 480));
    }
}
