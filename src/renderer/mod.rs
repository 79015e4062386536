// Renderer - lifecycle state machine and per-frame protocol
//
// Uninitialized -> Ready -> (Resizing -> Ready)* -> ShutDown
//
// The GPU side sits behind `FrameBackend`; `VulkanContext` is the real one.

pub mod scene;

use crate::backend::VulkanContext;
use crate::config::Config;
use crate::error::{RenderError, RenderResult};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};

/// Per-frame operations the renderer drives, in call order.
pub trait FrameBackend {
    /// Swapchain images, framebuffers, command buffers and fences all have this count.
    fn image_count(&self) -> usize;

    /// Next presentable image; signals the image-acquired semaphore.
    fn acquire_next_image(&mut self) -> RenderResult<u32>;

    /// Block until the last submission into slot `image_index` has completed.
    fn wait_for_fence(&mut self, image_index: u32) -> RenderResult<()>;

    fn reset_fence(&mut self, image_index: u32) -> RenderResult<()>;

    /// Submit the command buffer recorded for `image_index`, signalling its fence.
    fn submit(&mut self, image_index: u32) -> RenderResult<()>;

    fn present(&mut self, image_index: u32) -> RenderResult<()>;

    /// Rebuild every size-dependent resource for a `width` x `height` drawable.
    ///
    /// Returns the extent actually used, which the surface may override.
    fn rebuild(&mut self, width: u32, height: u32) -> RenderResult<(u32, u32)>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererState {
    Uninitialized,
    Ready,
    Resizing,
    ShutDown,
}

pub struct Renderer<B: FrameBackend> {
    backend: Option<B>,
    state: RendererState,
    extent: (u32, u32),
}

impl<B: FrameBackend> Default for Renderer<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: FrameBackend> Renderer<B> {
    pub fn new() -> Self {
        Self {
            backend: None,
            state: RendererState::Uninitialized,
            extent: (0, 0),
        }
    }

    pub fn state(&self) -> RendererState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == RendererState::Ready
    }

    pub fn extent(&self) -> (u32, u32) {
        self.extent
    }

    pub fn backend(&self) -> Option<&B> {
        self.backend.as_ref()
    }

    /// Build the backend and enter `Ready`.
    ///
    /// On failure the renderer stays `Uninitialized`; whatever the factory had
    /// created is already released.
    pub fn initialize_with<F>(&mut self, width: u32, height: u32, create: F) -> RenderResult<()>
    where
        F: FnOnce(u32, u32) -> RenderResult<(B, (u32, u32))>,
    {
        if self.state != RendererState::Uninitialized {
            return Err(RenderError::Unsupported(format!(
                "initialize called in state {:?}",
                self.state
            )));
        }

        let (backend, extent) = create(width, height)?;
        log::info!(
            "Renderer ready: {}x{}, {} swapchain images",
            extent.0,
            extent.1,
            backend.image_count()
        );

        self.backend = Some(backend);
        self.extent = extent;
        self.state = RendererState::Ready;
        Ok(())
    }

    /// Draw one frame. No-op unless `Ready`.
    ///
    /// An out-of-date swapchain is rebuilt at the current size and the frame
    /// dropped. Any other error is unrecoverable.
    pub fn render(&mut self) -> RenderResult<()> {
        if self.state != RendererState::Ready {
            return Ok(());
        }

        match self.draw_frame() {
            Ok(()) => Ok(()),
            Err(e) if e.is_out_of_date() => {
                log::debug!("Swapchain out of date, rebuilding");
                let (width, height) = self.extent;
                self.rebuild(width, height)
            }
            Err(e) => Err(e),
        }
    }

    fn draw_frame(&mut self) -> RenderResult<()> {
        let Some(backend) = self.backend.as_mut() else {
            return Ok(());
        };

        let image_index = backend.acquire_next_image()?;
        backend.wait_for_fence(image_index)?;
        backend.reset_fence(image_index)?;
        backend.submit(image_index)?;
        backend.present(image_index)
    }

    /// Rebuild size-dependent resources. No-op unless `Ready`, or for a zero-sized drawable.
    pub fn resize(&mut self, width: u32, height: u32) -> RenderResult<()> {
        if self.state != RendererState::Ready {
            return Ok(());
        }
        if width == 0 || height == 0 {
            log::debug!("Ignoring resize to {}x{}", width, height);
            return Ok(());
        }
        self.rebuild(width, height)
    }

    fn rebuild(&mut self, width: u32, height: u32) -> RenderResult<()> {
        let Some(backend) = self.backend.as_mut() else {
            return Ok(());
        };

        self.state = RendererState::Resizing;
        match backend.rebuild(width, height) {
            Ok(extent) => {
                log::info!("Resized to {}x{}", extent.0, extent.1);
                self.extent = extent;
                self.state = RendererState::Ready;
                Ok(())
            }
            Err(e) => {
                log::error!("Rebuild at {}x{} failed: {}", width, height, e);
                self.shutdown();
                Err(e)
            }
        }
    }

    /// Release every GPU object. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(backend) = self.backend.take() {
            log::info!("Shutting down renderer");
            drop(backend);
        }
        self.state = RendererState::ShutDown;
    }
}

impl Renderer<VulkanContext> {
    /// Create every GPU object for `window` and enter `Ready`.
    pub fn initialize<W>(
        &mut self,
        window: &W,
        config: &Config,
        width: u32,
        height: u32,
    ) -> RenderResult<()>
    where
        W: HasRawWindowHandle + HasRawDisplayHandle,
    {
        self.initialize_with(width, height, |width, height| {
            VulkanContext::new(
                window.raw_display_handle(),
                window.raw_window_handle(),
                config,
                width,
                height,
            )
            .map(|context| {
                let extent = context.extent();
                (context, (extent.width, extent.height))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::scene::ModelViewProjection;
    use super::*;
    use ash::vk;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Acquire(u32),
        Wait(u32),
        Reset(u32),
        Submit(u32),
        Present(u32),
        Rebuild(u32, u32),
    }

    /// Records calls and models fences as signaled/unsignaled flags.
    struct MockBackend {
        calls: Rc<RefCell<Vec<Call>>>,
        drops: Rc<Cell<u32>>,
        image_count: usize,
        next_image: u32,
        fence_signaled: Vec<bool>,
        framebuffers: usize,
        command_buffers: usize,
        uniform: ModelViewProjection,
        out_of_date_acquires: u32,
        out_of_date_presents: u32,
        rebuild_image_count: Option<usize>,
        fail_rebuild: bool,
    }

    impl MockBackend {
        fn new(image_count: usize, width: u32, height: u32) -> Self {
            Self {
                calls: Rc::default(),
                drops: Rc::default(),
                image_count,
                next_image: 0,
                fence_signaled: vec![true; image_count],
                framebuffers: image_count,
                command_buffers: image_count,
                uniform: ModelViewProjection::new(width, height),
                out_of_date_acquires: 0,
                out_of_date_presents: 0,
                rebuild_image_count: None,
                fail_rebuild: false,
            }
        }

        fn log(&self, call: Call) {
            self.calls.borrow_mut().push(call);
        }
    }

    impl FrameBackend for MockBackend {
        fn image_count(&self) -> usize {
            self.image_count
        }

        fn acquire_next_image(&mut self) -> RenderResult<u32> {
            if self.out_of_date_acquires > 0 {
                self.out_of_date_acquires -= 1;
                return Err(RenderError::vulkan(
                    "vkAcquireNextImageKHR",
                    vk::Result::ERROR_OUT_OF_DATE_KHR,
                ));
            }
            let index = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count as u32;
            self.log(Call::Acquire(index));
            Ok(index)
        }

        fn wait_for_fence(&mut self, image_index: u32) -> RenderResult<()> {
            // GPU work completes by the time the wait returns
            self.fence_signaled[image_index as usize] = true;
            self.log(Call::Wait(image_index));
            Ok(())
        }

        fn reset_fence(&mut self, image_index: u32) -> RenderResult<()> {
            self.fence_signaled[image_index as usize] = false;
            self.log(Call::Reset(image_index));
            Ok(())
        }

        fn submit(&mut self, image_index: u32) -> RenderResult<()> {
            self.log(Call::Submit(image_index));
            Ok(())
        }

        fn present(&mut self, image_index: u32) -> RenderResult<()> {
            self.log(Call::Present(image_index));
            if self.out_of_date_presents > 0 {
                self.out_of_date_presents -= 1;
                return Err(RenderError::vulkan(
                    "vkQueuePresentKHR",
                    vk::Result::ERROR_OUT_OF_DATE_KHR,
                ));
            }
            Ok(())
        }

        fn rebuild(&mut self, width: u32, height: u32) -> RenderResult<(u32, u32)> {
            self.log(Call::Rebuild(width, height));
            if self.fail_rebuild {
                return Err(RenderError::vulkan(
                    "vkCreateSwapchainKHR",
                    vk::Result::ERROR_SURFACE_LOST_KHR,
                ));
            }
            // A new surface may hand back a different number of images
            if let Some(count) = self.rebuild_image_count.take() {
                self.image_count = count;
            }
            self.framebuffers = self.image_count;
            self.command_buffers = self.image_count;
            self.fence_signaled = vec![true; self.image_count];
            self.next_image = 0;
            self.uniform = ModelViewProjection::new(width, height);
            Ok((width, height))
        }
    }

    impl Drop for MockBackend {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
        }
    }

    fn ready(backend: MockBackend) -> Renderer<MockBackend> {
        let mut renderer = Renderer::new();
        renderer
            .initialize_with(1280, 720, |w, h| Ok((backend, (w, h))))
            .unwrap();
        renderer
    }

    fn count(calls: &[Call], pred: impl Fn(&Call) -> bool) -> usize {
        calls.iter().filter(|c| pred(c)).count()
    }

    #[test]
    fn render_before_initialize_is_noop() {
        let mut renderer = Renderer::<MockBackend>::new();
        renderer.render().unwrap();
        renderer.resize(640, 480).unwrap();

        assert_eq!(renderer.state(), RendererState::Uninitialized);
        assert!(renderer.backend().is_none());
    }

    #[test]
    fn first_frame_runs_protocol_once() {
        let backend = MockBackend::new(3, 1280, 720);
        let calls = backend.calls.clone();
        let mut renderer = ready(backend);

        renderer.render().unwrap();

        assert_eq!(
            *calls.borrow(),
            vec![
                Call::Acquire(0),
                Call::Wait(0),
                Call::Reset(0),
                Call::Submit(0),
                Call::Present(0)
            ]
        );
    }

    #[test]
    fn submissions_follow_a_wait_on_the_same_slot() {
        let backend = MockBackend::new(2, 1280, 720);
        let calls = backend.calls.clone();
        let mut renderer = ready(backend);

        for _ in 0..7 {
            renderer.render().unwrap();
        }

        let calls = calls.borrow();
        let mut last_wait = None;
        for call in calls.iter() {
            match *call {
                Call::Wait(i) => last_wait = Some(i),
                Call::Submit(i) => {
                    assert_eq!(last_wait, Some(i), "submit to {i} without waiting on its fence");
                    last_wait = None;
                }
                _ => {}
            }
        }
        assert_eq!(count(&calls, |c| matches!(c, Call::Submit(_))), 7);
        assert_eq!(count(&calls, |c| matches!(c, Call::Present(_))), 7);
    }

    #[test]
    fn resize_keeps_per_image_counts_equal() {
        let mut renderer = ready(MockBackend::new(3, 1280, 720));

        for (w, h) in [(640, 480), (1920, 1080), (333, 777)] {
            renderer.resize(w, h).unwrap();

            let backend = renderer.backend().unwrap();
            assert_eq!(backend.framebuffers, backend.image_count());
            assert_eq!(backend.command_buffers, backend.image_count());
            assert_eq!(backend.fence_signaled.len(), backend.image_count());
            assert!((backend.uniform.aspect() - w as f32 / h as f32).abs() < 1e-5);
            assert_eq!(renderer.extent(), (w, h));
            assert_eq!(renderer.state(), RendererState::Ready);
        }
    }

    #[test]
    fn resize_follows_a_changed_image_count() {
        let mut backend = MockBackend::new(3, 1280, 720);
        backend.rebuild_image_count = Some(2);
        let calls = backend.calls.clone();
        let mut renderer = ready(backend);

        renderer.render().unwrap();
        renderer.resize(640, 480).unwrap();

        let backend = renderer.backend().unwrap();
        assert_eq!(backend.image_count(), 2);
        assert_eq!(backend.framebuffers, 2);
        assert_eq!(backend.command_buffers, 2);
        assert_eq!(backend.fence_signaled, vec![true, true]);

        // Every slot of the smaller swapchain is reachable after the rebuild
        calls.borrow_mut().clear();
        for _ in 0..4 {
            renderer.render().unwrap();
        }
        let presented: Vec<Call> = calls
            .borrow()
            .iter()
            .copied()
            .filter(|c| matches!(c, Call::Present(_)))
            .collect();
        assert_eq!(
            presented,
            vec![
                Call::Present(0),
                Call::Present(1),
                Call::Present(0),
                Call::Present(1)
            ]
        );
    }

    #[test]
    fn zero_sized_resize_is_ignored() {
        let backend = MockBackend::new(2, 1280, 720);
        let calls = backend.calls.clone();
        let mut renderer = ready(backend);

        renderer.resize(0, 720).unwrap();
        renderer.resize(1280, 0).unwrap();

        assert!(calls.borrow().is_empty());
        assert_eq!(renderer.extent(), (1280, 720));
    }

    #[test]
    fn out_of_date_rebuilds_and_drops_frame() {
        let mut backend = MockBackend::new(2, 1280, 720);
        backend.out_of_date_acquires = 1;
        let calls = backend.calls.clone();
        let mut renderer = ready(backend);

        renderer.render().unwrap();
        assert_eq!(*calls.borrow(), vec![Call::Rebuild(1280, 720)]);
        assert!(renderer.is_ready());

        renderer.render().unwrap();
        assert_eq!(count(&calls.borrow(), |c| matches!(c, Call::Present(_))), 1);
    }

    #[test]
    fn out_of_date_present_rebuilds_once() {
        let mut backend = MockBackend::new(2, 1280, 720);
        backend.out_of_date_presents = 1;
        let calls = backend.calls.clone();
        let mut renderer = ready(backend);

        renderer.render().unwrap();
        assert_eq!(
            *calls.borrow(),
            vec![
                Call::Acquire(0),
                Call::Wait(0),
                Call::Reset(0),
                Call::Submit(0),
                Call::Present(0),
                Call::Rebuild(1280, 720)
            ]
        );
        assert!(renderer.is_ready());

        renderer.render().unwrap();
        renderer.render().unwrap();
        let calls = calls.borrow();
        assert_eq!(count(&calls, |c| matches!(c, Call::Rebuild(..))), 1);
        assert_eq!(count(&calls, |c| matches!(c, Call::Present(_))), 3);
    }

    #[test]
    fn failed_rebuild_shuts_down() {
        let mut backend = MockBackend::new(2, 1280, 720);
        backend.fail_rebuild = true;
        let drops = backend.drops.clone();
        let mut renderer = ready(backend);

        let err = renderer.resize(640, 480).unwrap_err();
        assert_eq!(err.status(), Some(vk::Result::ERROR_SURFACE_LOST_KHR));
        assert_eq!(renderer.state(), RendererState::ShutDown);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let backend = MockBackend::new(2, 1280, 720);
        let drops = backend.drops.clone();
        let calls = backend.calls.clone();
        let mut renderer = ready(backend);

        renderer.shutdown();
        renderer.shutdown();
        renderer.render().unwrap();
        renderer.resize(640, 480).unwrap();

        assert_eq!(drops.get(), 1);
        assert!(calls.borrow().is_empty());
        assert_eq!(renderer.state(), RendererState::ShutDown);
    }

    #[test]
    fn failed_initialize_stays_uninitialized() {
        let mut renderer = Renderer::<MockBackend>::new();
        let err = renderer
            .initialize_with(1280, 720, |_, _| Err(RenderError::NoSuitableDevice))
            .unwrap_err();

        assert!(matches!(err, RenderError::NoSuitableDevice));
        assert_eq!(renderer.state(), RendererState::Uninitialized);
        assert!(renderer.backend().is_none());
    }

    #[test]
    fn second_initialize_is_rejected() {
        let mut renderer = ready(MockBackend::new(2, 1280, 720));
        let result =
            renderer.initialize_with(640, 480, |w, h| Ok((MockBackend::new(2, w, h), (w, h))));

        assert!(result.is_err());
        assert_eq!(renderer.extent(), (1280, 720));
    }
}
