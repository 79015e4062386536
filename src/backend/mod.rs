// Backend module - Vulkan abstraction layer
//
// Design: Thin RAII wrappers around ash. Each wrapper destroys its handle on
// drop and keeps the objects it was created from alive through `Arc`.

pub mod buffer;
pub mod command;
pub mod context;
pub mod device;
pub mod instance;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use context::VulkanContext;
pub use device::Device;
pub use instance::Instance;
pub use surface::Surface;
pub use swapchain::Swapchain;
