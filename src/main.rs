// =============================================================================
// LAVA - Minimal Vulkan compute bootstrap
// =============================================================================
//
// Opens a window, brings up everything a compute dispatch needs and then
// just pumps window events until the user closes it.
//
// FLOW:
// 1. Load and validate config.toml
// 2. Create window (winit)
// 3. Initialize the compute context (instance -> ... -> descriptor set)
// 4. Report collected errors
// 5. Idle in the event loop
// 6. Terminate the context on close
//
// =============================================================================

mod backend;
mod config;
mod context;
mod error_log;

use anyhow::{anyhow, Result};
use config::Config;
use context::ComputeContext;
use error_log::ErrorLog;
use std::path::Path;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    init_logging();

    let config = Config::load();
    config.validate()?;

    log::info!("Starting {}", config.window.title);
    log::info!(
        "Window: {}x{}, shader: {:?}",
        config.window.width,
        config.window.height,
        config.compute.shader_path
    );

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Wait);
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    app.finish()
}

/// Initialize logging; RUST_LOG overrides the default `info` level
fn init_logging() {
    use env_logger::{Builder, Env};

    Builder::from_env(Env::default().default_filter_or("info")).init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,
    errors: ErrorLog,
    // Dropped before the window it was initialized against
    context: Option<ComputeContext>,
    window: Option<Window>,
    // Set when setup failed; turned into the process exit status
    failure: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            config,
            errors: ErrorLog::new(),
            context: None,
            window: None,
            failure: None,
        }
    }

    /// Record a fatal setup error in the report and keep it for `finish`
    fn record_failure(&mut self, error: anyhow::Error) {
        self.errors.push(format!("{:#}", error));
        self.errors.report(self.error_log_path());
        self.failure = Some(error);
    }

    /// Outcome of the run once the event loop has returned
    fn finish(self) -> Result<()> {
        match self.failure {
            Some(error) => Err(error.context("Setup failed")),
            None => Ok(()),
        }
    }

    fn error_log_path(&self) -> Option<&Path> {
        self.config
            .debug
            .log_to_file
            .then(|| Path::new(&self.config.debug.log_file))
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(context) = self.context.take() {
            context.terminate();
        }
        event_loop.exit();
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
            ))
            .with_resizable(self.config.window.resizable);

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => w,
            Err(e) => {
                self.record_failure(anyhow!("Failed to create window: {}", e));
                event_loop.exit();
                return;
            }
        };

        let result = ComputeContext::initialize(&self.config, Some(&window), &self.errors);
        self.window = Some(window);

        match result {
            Ok(context) => {
                self.context = Some(context);
                self.errors.report(self.error_log_path());
            }
            Err(e) => {
                self.record_failure(e);
                event_loop.exit();
            }
        }
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
}
