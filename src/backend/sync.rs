// Synchronization primitives
//
// Two semaphores order acquire -> submit -> present on the GPU. One fence per
// swapchain image keeps the CPU from re-submitting a command buffer that is
// still executing.

use ash::vk;
use std::sync::Arc;

use super::Device;
use crate::error::{RenderError, RenderResult, VkResultExt};

pub struct FrameSync {
    pub image_acquired: vk::Semaphore,
    pub render_complete: vk::Semaphore,
    fences: Vec<vk::Fence>,
    device: Arc<Device>,
}

impl FrameSync {
    pub fn new(device: Arc<Device>, image_count: usize) -> RenderResult<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let raw = device.ash_device();

        let image_acquired = unsafe { raw.create_semaphore(&semaphore_info, None) }
            .vk_context("vkCreateSemaphore (image acquired)")?;

        let mut sync = Self {
            image_acquired,
            render_complete: vk::Semaphore::null(),
            fences: Vec::new(),
            device: device.clone(),
        };

        sync.render_complete = unsafe { raw.create_semaphore(&semaphore_info, None) }
            .vk_context("vkCreateSemaphore (render complete)")?;

        sync.create_fences(image_count)?;
        Ok(sync)
    }

    /// Replace every fence with `count` fresh signaled ones.
    ///
    /// Only valid while the device is idle.
    pub fn recreate_fences(&mut self, count: usize) -> RenderResult<()> {
        self.destroy_fences();
        self.create_fences(count)
    }

    fn create_fences(&mut self, count: usize) -> RenderResult<()> {
        // Start signaled so the first wait on each slot returns immediately
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        for _ in 0..count {
            let fence = unsafe { self.device.ash_device().create_fence(&fence_info, None) }
                .vk_context("vkCreateFence")?;
            self.fences.push(fence);
        }
        Ok(())
    }

    fn destroy_fences(&mut self) {
        for fence in self.fences.drain(..) {
            unsafe { self.device.ash_device().destroy_fence(fence, None) };
        }
    }

    pub fn fence_count(&self) -> usize {
        self.fences.len()
    }

    pub fn fence(&self, index: usize) -> RenderResult<vk::Fence> {
        self.fences.get(index).copied().ok_or_else(|| {
            RenderError::Unsupported(format!(
                "no fence for image {} ({} fences)",
                index,
                self.fences.len()
            ))
        })
    }

    /// Block until the previous submission into slot `index` has finished.
    pub fn wait(&self, index: usize) -> RenderResult<()> {
        let fences = [self.fence(index)?];
        unsafe { self.device.ash_device().wait_for_fences(&fences, true, u64::MAX) }
            .vk_context("vkWaitForFences")
    }

    pub fn reset(&self, index: usize) -> RenderResult<()> {
        let fences = [self.fence(index)?];
        unsafe { self.device.ash_device().reset_fences(&fences) }.vk_context("vkResetFences")
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        self.destroy_fences();
        let raw = self.device.ash_device();
        unsafe {
            if self.render_complete != vk::Semaphore::null() {
                raw.destroy_semaphore(self.render_complete, None);
            }
            raw.destroy_semaphore(self.image_acquired, None);
        }
    }
}
