// VulkanContext - every GPU object the triangle renderer owns
//
// Field order is teardown order: Rust drops fields top to bottom, so the
// per-frame objects go first and the instance last.

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;

use super::buffer::{find_depth_format, DepthBuffer, HostBuffer};
use super::command::{full_scissor, full_viewport, Commands, DrawCommand};
use super::pipeline::{
    Descriptors, Framebuffers, GraphicsPipeline, PipelineDesc, PipelineLayout, RenderPass,
};
use super::shader::{ShaderModule, ShaderSource};
use super::sync::FrameSync;
use super::{Device, Instance, Surface, Swapchain};
use crate::config::Config;
use crate::error::{RenderError, RenderResult, VkResultExt};
use crate::renderer::scene::{ModelViewProjection, Vertex, TRIANGLE_INDICES, TRIANGLE_VERTICES};
use crate::renderer::FrameBackend;

/// Values derived from the swapchain extent on every build and rebuild.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SizeDependent {
    pub extent: vk::Extent2D,
    pub viewport: vk::Viewport,
    pub scissor: vk::Rect2D,
    pub mvp: ModelViewProjection,
}

impl SizeDependent {
    pub fn new(extent: vk::Extent2D) -> Self {
        Self {
            extent,
            viewport: full_viewport(extent),
            scissor: full_scissor(extent),
            mvp: ModelViewProjection::new(extent.width, extent.height),
        }
    }
}

pub struct VulkanContext {
    sync: FrameSync,
    pipeline: GraphicsPipeline,
    descriptors: Descriptors,
    index_buffer: HostBuffer,
    vertex_buffer: HostBuffer,
    uniform_buffer: HostBuffer,
    framebuffers: Framebuffers,
    render_pass: RenderPass,
    layout: PipelineLayout,
    commands: Commands,
    depth: DepthBuffer,
    swapchain: Swapchain,
    surface: Surface,
    device: Arc<Device>,
    instance: Arc<Instance>,

    present_mode: vk::PresentModeKHR,
    clear_color: [f32; 4],
}

impl VulkanContext {
    /// Create every object in dependency order.
    ///
    /// A failure part-way releases what was already built, in reverse.
    pub fn new(
        display: RawDisplayHandle,
        window: RawWindowHandle,
        config: &Config,
        width: u32,
        height: u32,
    ) -> RenderResult<Self> {
        let instance = Arc::new(Instance::new(
            &config.window.title,
            display,
            config.validation_enabled(),
        )?);
        let surface = Surface::new(instance.clone(), display, window)?;
        let device = Device::new(&instance, &surface)?;

        let present_mode = config.preferred_present_mode();
        let swapchain = Swapchain::new(device.clone(), &surface, present_mode, width, height)?;
        let extent = swapchain.extent;
        let sized = SizeDependent::new(extent);

        let depth_format = find_depth_format(&instance, &device)?;
        let depth = DepthBuffer::new(device.clone(), depth_format, extent)?;

        let commands = Commands::new(
            device.clone(),
            device.families.graphics,
            swapchain.image_count(),
        )?;

        let layout = PipelineLayout::new(device.clone())?;
        let render_pass = RenderPass::new(device.clone(), swapchain.format.format, depth_format)?;
        let framebuffers = Framebuffers::new(
            device.clone(),
            &render_pass,
            swapchain.image_views(),
            depth.view(),
            extent,
        )?;

        let uniform_buffer = HostBuffer::with_data(
            device.clone(),
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            &[sized.mvp],
        )?;
        let vertex_buffer = HostBuffer::with_data(
            device.clone(),
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &TRIANGLE_VERTICES,
        )?;
        let index_buffer = HostBuffer::with_data(
            device.clone(),
            vk::BufferUsageFlags::INDEX_BUFFER,
            &TRIANGLE_INDICES,
        )?;

        let descriptors = Descriptors::new(device.clone(), &layout, &uniform_buffer)?;

        let pipeline = {
            // Modules are only needed until the pipeline exists
            let vertex_shader =
                ShaderModule::load(device.clone(), &ShaderSource::path(&config.shaders.vertex))?;
            let fragment_shader =
                ShaderModule::load(device.clone(), &ShaderSource::path(&config.shaders.fragment))?;

            GraphicsPipeline::new(
                device.clone(),
                &render_pass,
                &layout,
                &vertex_shader,
                &fragment_shader,
                &Vertex::layout(),
                &PipelineDesc::default(),
            )?
        };

        let sync = FrameSync::new(device.clone(), swapchain.image_count())?;

        let context = Self {
            sync,
            pipeline,
            descriptors,
            index_buffer,
            vertex_buffer,
            uniform_buffer,
            framebuffers,
            render_pass,
            layout,
            commands,
            depth,
            swapchain,
            surface,
            device,
            instance,
            present_mode,
            clear_color: config.graphics.clear_color,
        };
        context.record_commands(&sized)?;

        Ok(context)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    fn draw_command(&self, sized: &SizeDependent) -> DrawCommand {
        DrawCommand {
            render_pass: self.render_pass.raw(),
            pipeline: self.pipeline.raw(),
            pipeline_layout: self.layout.raw(),
            descriptor_set: self.descriptors.set(),
            vertex_buffer: self.vertex_buffer.raw(),
            index_buffer: self.index_buffer.raw(),
            index_count: TRIANGLE_INDICES.len() as u32,
            viewport: sized.viewport,
            scissor: sized.scissor,
            clear_color: self.clear_color,
        }
    }

    fn record_commands(&self, sized: &SizeDependent) -> RenderResult<()> {
        self.commands
            .record(&self.framebuffers, &self.draw_command(sized))
    }

    fn image_index(&self, image_index: u32) -> RenderResult<usize> {
        let index = image_index as usize;
        if index >= self.swapchain.image_count() {
            return Err(RenderError::Unsupported(format!(
                "image index {} out of range ({} images)",
                image_index,
                self.swapchain.image_count()
            )));
        }
        Ok(index)
    }
}

impl FrameBackend for VulkanContext {
    fn image_count(&self) -> usize {
        self.swapchain.image_count()
    }

    fn acquire_next_image(&mut self) -> RenderResult<u32> {
        self.swapchain
            .acquire_next_image_index(self.sync.image_acquired, vk::Fence::null())
    }

    fn wait_for_fence(&mut self, image_index: u32) -> RenderResult<()> {
        self.sync.wait(self.image_index(image_index)?)
    }

    fn reset_fence(&mut self, image_index: u32) -> RenderResult<()> {
        self.sync.reset(self.image_index(image_index)?)
    }

    fn submit(&mut self, image_index: u32) -> RenderResult<()> {
        let index = self.image_index(image_index)?;
        let command_buffer = self.commands.get(index).ok_or(RenderError::Enumeration {
            what: "command buffers",
        })?;

        let wait_semaphores = [self.sync.image_acquired];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [self.sync.render_complete];
        let command_buffers = [command_buffer];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            self.device.ash_device().queue_submit(
                self.device.graphics_queue,
                &[submit_info],
                self.sync.fence(index)?,
            )
        }
        .vk_context("vkQueueSubmit")
    }

    fn present(&mut self, image_index: u32) -> RenderResult<()> {
        self.swapchain.queue_present(
            self.device.present_queue,
            image_index,
            Some(self.sync.render_complete),
        )
    }

    fn rebuild(&mut self, width: u32, height: u32) -> RenderResult<(u32, u32)> {
        self.device.wait_idle()?;

        self.swapchain
            .recreate(&self.surface, self.present_mode, width, height)?;
        let sized = SizeDependent::new(self.swapchain.extent);
        let image_count = self.swapchain.image_count();

        self.depth = DepthBuffer::new(self.device.clone(), self.depth.format, sized.extent)?;
        self.framebuffers = Framebuffers::new(
            self.device.clone(),
            &self.render_pass,
            self.swapchain.image_views(),
            self.depth.view(),
            sized.extent,
        )?;

        self.commands.reallocate(image_count)?;
        self.record_commands(&sized)?;

        if self.sync.fence_count() != image_count {
            self.sync.recreate_fences(image_count)?;
        }

        self.device.wait_idle()?;

        self.uniform_buffer.write(bytemuck::bytes_of(&sized.mvp))?;

        Ok((sized.extent.width, sized.extent.height))
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        // Nothing may be in flight when the fields below start dropping
        if let Err(e) = self.device.wait_idle() {
            log::error!("Device did not go idle before teardown: {}", e);
        }
        log::debug!("Releasing GPU resources");
    }
}
