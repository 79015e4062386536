// Graphics pipeline creation and management
//
// The graphics pipeline defines how vertices are processed and rasterized.
// It includes: vertex input, shaders, rasterization, depth/stencil, blending.
//
// Everything here is resolution independent (viewport and scissor are
// dynamic) except the framebuffers, which are rebuilt with the swapchain.

use ash::vk;
use std::sync::Arc;

use super::buffer::HostBuffer;
use super::shader::ShaderModule;
use super::Device;
use crate::error::{RenderError, RenderResult, VkResultExt};

const ENTRY_POINT: &std::ffi::CStr = c"main";

/// Color attachment 0 (cleared, stored, presented) and depth attachment 1
/// (cleared, discarded).
pub fn attachment_descriptions(
    color_format: vk::Format,
    depth_format: vk::Format,
) -> [vk::AttachmentDescription; 2] {
    let color = vk::AttachmentDescription::builder()
        .format(color_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build();

    let depth = vk::AttachmentDescription::builder()
        .format(depth_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    [color, depth]
}

/// Explicit barriers for the layout transitions at render pass entry and exit.
pub fn subpass_dependencies() -> [vk::SubpassDependency; 2] {
    // Entry: wait for the presentation engine to finish reading the image
    let entry = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        )
        .src_access_mask(vk::AccessFlags::MEMORY_READ)
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_READ
                | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .dependency_flags(vk::DependencyFlags::BY_REGION)
        .build();

    // Exit: make color writes visible before presentation
    let exit = vk::SubpassDependency::builder()
        .src_subpass(0)
        .dst_subpass(vk::SUBPASS_EXTERNAL)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
        .src_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        )
        .dst_access_mask(vk::AccessFlags::MEMORY_READ)
        .dependency_flags(vk::DependencyFlags::BY_REGION)
        .build();

    [entry, exit]
}

pub struct RenderPass {
    render_pass: vk::RenderPass,
    device: Arc<Device>,
}

impl RenderPass {
    /// Create a render pass for color attachment rendering with depth
    pub fn new(
        device: Arc<Device>,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> RenderResult<Self> {
        let attachments = attachment_descriptions(color_format, depth_format);

        let color_attachment_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_attachment_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        let subpasses = [vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_attachment_refs)
            .depth_stencil_attachment(&depth_attachment_ref)
            .build()];

        let dependencies = subpass_dependencies();

        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let render_pass = unsafe { device.ash_device().create_render_pass(&render_pass_info, None) }
            .vk_context("vkCreateRenderPass")?;

        Ok(Self {
            render_pass,
            device,
        })
    }

    pub fn raw(&self) -> vk::RenderPass {
        self.render_pass
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe {
            self.device
                .ash_device()
                .destroy_render_pass(self.render_pass, None)
        };
    }
}

/// One framebuffer per swapchain image: `[color view i, shared depth view]`.
pub struct Framebuffers {
    framebuffers: Vec<vk::Framebuffer>,
    device: Arc<Device>,
}

impl Framebuffers {
    pub fn new(
        device: Arc<Device>,
        render_pass: &RenderPass,
        color_views: &[vk::ImageView],
        depth_view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> RenderResult<Self> {
        let mut set = Self {
            framebuffers: Vec::with_capacity(color_views.len()),
            device,
        };

        for &color_view in color_views {
            let attachments = [color_view, depth_view];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass.raw())
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            let framebuffer =
                unsafe { set.device.ash_device().create_framebuffer(&framebuffer_info, None) }
                    .vk_context("vkCreateFramebuffer")?;
            set.framebuffers.push(framebuffer);
        }

        Ok(set)
    }

    pub(crate) fn len(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn get(&self, index: usize) -> Option<vk::Framebuffer> {
        self.framebuffers.get(index).copied()
    }
}

impl Drop for Framebuffers {
    fn drop(&mut self) {
        unsafe {
            for &framebuffer in &self.framebuffers {
                self.device
                    .ash_device()
                    .destroy_framebuffer(framebuffer, None);
            }
        }
    }
}

/// Descriptor set layout (one vertex-stage uniform buffer at binding 0) and
/// the pipeline layout built on it. No push constants.
pub struct PipelineLayout {
    layout: vk::PipelineLayout,
    set_layout: vk::DescriptorSetLayout,
    device: Arc<Device>,
}

impl PipelineLayout {
    pub fn new(device: Arc<Device>) -> RenderResult<Self> {
        let bindings = [vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .build()];

        let set_layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let raw = device.ash_device();
        let set_layout = unsafe { raw.create_descriptor_set_layout(&set_layout_info, None) }
            .vk_context("vkCreateDescriptorSetLayout")?;

        let mut layouts = Self {
            layout: vk::PipelineLayout::null(),
            set_layout,
            device: device.clone(),
        };

        let set_layouts = [set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        layouts.layout = unsafe { raw.create_pipeline_layout(&layout_info, None) }
            .vk_context("vkCreatePipelineLayout")?;

        Ok(layouts)
    }

    pub fn raw(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        let raw = self.device.ash_device();
        unsafe {
            if self.layout != vk::PipelineLayout::null() {
                raw.destroy_pipeline_layout(self.layout, None);
            }
            raw.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

/// Pool sized for exactly one uniform-buffer descriptor, and the set allocated from it.
pub struct Descriptors {
    set: vk::DescriptorSet,
    pool: vk::DescriptorPool,
    device: Arc<Device>,
}

impl Descriptors {
    pub fn new(
        device: Arc<Device>,
        layout: &PipelineLayout,
        uniform_buffer: &HostBuffer,
    ) -> RenderResult<Self> {
        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 1,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&pool_sizes)
            .max_sets(1);

        let raw = device.ash_device();
        let pool = unsafe { raw.create_descriptor_pool(&pool_info, None) }
            .vk_context("vkCreateDescriptorPool")?;

        let mut descriptors = Self {
            set: vk::DescriptorSet::null(),
            pool,
            device: device.clone(),
        };

        let set_layouts = [layout.set_layout()];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&set_layouts);
        let sets = unsafe { raw.allocate_descriptor_sets(&alloc_info) }
            .vk_context("vkAllocateDescriptorSets")?;
        descriptors.set = sets.first().copied().ok_or(RenderError::Enumeration {
            what: "descriptor sets",
        })?;

        let buffer_infos = [vk::DescriptorBufferInfo {
            buffer: uniform_buffer.raw(),
            offset: 0,
            range: uniform_buffer.size(),
        }];
        let writes = [vk::WriteDescriptorSet::builder()
            .dst_set(descriptors.set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&buffer_infos)
            .build()];
        unsafe { raw.update_descriptor_sets(&writes, &[]) };

        Ok(descriptors)
    }

    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }
}

impl Drop for Descriptors {
    fn drop(&mut self) {
        // Destroying the pool frees the set.
        unsafe {
            self.device
                .ash_device()
                .destroy_descriptor_pool(self.pool, None)
        };
    }
}

/// Fixed-function state of the graphics pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PipelineDesc {
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
}

impl Default for PipelineDesc {
    /// Filled triangle list, no culling, depth test and write with LESS_OR_EQUAL.
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS_OR_EQUAL,
        }
    }
}

/// Vertex input layout the pipeline consumes.
pub struct VertexLayout {
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

/// The graphics pipeline and the cache it was built through.
pub struct GraphicsPipeline {
    pipeline: vk::Pipeline,
    cache: vk::PipelineCache,
    device: Arc<Device>,
}

impl GraphicsPipeline {
    pub fn new(
        device: Arc<Device>,
        render_pass: &RenderPass,
        layout: &PipelineLayout,
        vertex_shader: &ShaderModule,
        fragment_shader: &ShaderModule,
        vertex_layout: &VertexLayout,
        desc: &PipelineDesc,
    ) -> RenderResult<Self> {
        let raw = device.ash_device();

        let cache_info = vk::PipelineCacheCreateInfo::builder();
        let cache = unsafe { raw.create_pipeline_cache(&cache_info, None) }
            .vk_context("vkCreatePipelineCache")?;

        let mut graphics = Self {
            pipeline: vk::Pipeline::null(),
            cache,
            device: device.clone(),
        };

        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex_shader.raw())
                .name(ENTRY_POINT)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment_shader.raw())
                .name(ENTRY_POINT)
                .build(),
        ];

        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&vertex_layout.bindings)
            .vertex_attribute_descriptions(&vertex_layout.attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(desc.topology)
            .primitive_restart_enable(false);

        // Counts only; the rectangles are set at record time
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(desc.polygon_mode)
            .line_width(1.0)
            .cull_mode(desc.cull_mode)
            .front_face(desc.front_face)
            .depth_bias_enable(false);

        // Multisampling (disabled)
        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let stencil_op = vk::StencilOpState {
            fail_op: vk::StencilOp::KEEP,
            pass_op: vk::StencilOp::KEEP,
            depth_fail_op: vk::StencilOp::KEEP,
            compare_op: vk::CompareOp::ALWAYS,
            ..Default::default()
        };
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(desc.depth_test)
            .depth_write_enable(desc.depth_write)
            .depth_compare_op(desc.depth_compare)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false)
            .front(stencil_op)
            .back(stencil_op);

        // Color blending (no blending, opaque)
        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build()];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout.raw())
            .render_pass(render_pass.raw())
            .subpass(0)
            .build();

        let pipelines = unsafe { raw.create_graphics_pipelines(cache, &[pipeline_info], None) }
            .map_err(|(_, e)| e)
            .vk_context("vkCreateGraphicsPipelines")?;

        graphics.pipeline = pipelines.first().copied().ok_or(RenderError::NullHandle {
            what: "graphics pipeline",
        })?;

        log::info!("Graphics pipeline created");
        Ok(graphics)
    }

    pub fn raw(&self) -> vk::Pipeline {
        self.pipeline
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        let raw = self.device.ash_device();
        unsafe {
            if self.pipeline != vk::Pipeline::null() {
                raw.destroy_pipeline(self.pipeline, None);
            }
            raw.destroy_pipeline_cache(self.cache, None);
        }
    }
}
