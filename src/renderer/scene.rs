// Scene data - the one triangle and its camera
//
// Vertex/index data is uploaded once. The MVP block is recomputed whenever
// the drawable changes aspect ratio.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

use crate::backend::pipeline::VertexLayout;

/// Interleaved per-vertex data: location 0 = position, location 1 = color.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
}

impl Vertex {
    pub fn layout() -> VertexLayout {
        let bindings = vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }];

        let attributes = vec![
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, position) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, color) as u32,
            },
        ];

        VertexLayout {
            bindings,
            attributes,
        }
    }
}

pub const TRIANGLE_VERTICES: [Vertex; 3] = [
    Vertex {
        position: [1.0, 1.0, 0.0],
        color: [1.0, 0.0, 0.0],
    },
    Vertex {
        position: [-1.0, 1.0, 0.0],
        color: [0.0, 1.0, 0.0],
    },
    Vertex {
        position: [0.0, -1.0, 0.0],
        color: [0.0, 0.0, 1.0],
    },
];

pub const TRIANGLE_INDICES: [u32; 3] = [0, 1, 2];

const FOV_Y_DEGREES: f32 = 60.0;
const Z_NEAR: f32 = 0.1;
const Z_FAR: f32 = 256.0;
const EYE: Vec3 = Vec3::new(0.0, 0.0, -10.0);

/// Uniform block at binding 0, laid out as three column-major mat4s.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ModelViewProjection {
    pub model: Mat4,
    pub view: Mat4,
    pub projection: Mat4,
}

impl ModelViewProjection {
    pub fn new(width: u32, height: u32) -> Self {
        let aspect = width as f32 / height.max(1) as f32;
        Self {
            model: Mat4::IDENTITY,
            view: Mat4::look_at_rh(EYE, Vec3::ZERO, Vec3::Y),
            projection: Mat4::perspective_rh(FOV_Y_DEGREES.to_radians(), aspect, Z_NEAR, Z_FAR),
        }
    }

    /// Aspect ratio baked into the projection.
    pub fn aspect(&self) -> f32 {
        self.projection.y_axis.y / self.projection.x_axis.x
    }
}
