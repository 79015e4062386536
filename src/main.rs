// =============================================================================
// VULKAN TRIANGLE - windowed host
// =============================================================================
//
// The host owns the window and the renderer; the renderer never reaches
// back into window state.
//
// FRAME FLOW:
// 1. Acquire swapchain image
// 2. Wait for the previous submission into that image slot
// 3. Submit the pre-recorded command buffer
// 4. Present
//
// =============================================================================

use anyhow::Result;
use std::sync::Arc;
use tri_renderer::{Config, RenderError, Renderer, VulkanContext};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting Vulkan triangle");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        config.window.title
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    // Surfaces the fatal error, if any, as a non-zero exit
    match app.fatal.take() {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

/// `RUST_LOG` overrides the configured level.
fn init_logging(config: &Config) {
    env_logger::Builder::new()
        .filter_level(config.log_level())
        .parse_default_env()
        .init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the renderer must go before the window
/// its surface was created from.
struct App {
    renderer: Renderer<VulkanContext>,
    window: Option<Arc<Window>>,
    config: Config,
    is_minimized: bool,
    fatal: Option<RenderError>,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            renderer: Renderer::new(),
            window: None,
            config,
            is_minimized: false,
            fatal: None,
        }
    }

    /// Blocking teardown, then leave the event loop.
    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        self.renderer.shutdown();
        event_loop.exit();
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: RenderError) {
        log::error!("Fatal renderer error: {}", error);
        self.fatal = Some(error);
        self.shutdown(event_loop);
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        let size = window.inner_size();
        if let Err(e) = self
            .renderer
            .initialize(window.as_ref(), &self.config, size.width, size.height)
        {
            self.fail(event_loop, e);
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                // Minimized: nothing to draw into until the window comes back
                self.is_minimized = size.width == 0 || size.height == 0;
                if self.is_minimized {
                    return;
                }
                if let Err(e) = self.renderer.resize(size.width, size.height) {
                    self.fail(event_loop, e);
                }
            }

            WindowEvent::RedrawRequested => {
                if self.is_minimized {
                    return;
                }
                if let Err(e) = self.renderer.render() {
                    self.fail(event_loop, e);
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    self.shutdown(event_loop);
                }
            }

            _ => {}
        }
    }

    /// Continuous redraw.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            if self.renderer.is_ready() {
                window.request_redraw();
            }
        }
    }
}
