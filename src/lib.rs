//! A Vulkan renderer for a single, fixed triangle.
//!
//! [`Renderer`] drives the lifecycle (`initialize`, `render`, `resize`,
//! `shutdown`) over a [`FrameBackend`]; [`VulkanContext`] is the backend that
//! owns the real GPU objects.

pub mod backend;
pub mod config;
pub mod error;
pub mod renderer;

pub use backend::VulkanContext;
pub use config::Config;
pub use error::{RenderError, RenderResult};
pub use renderer::{FrameBackend, Renderer, RendererState};
