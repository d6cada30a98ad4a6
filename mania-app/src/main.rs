#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::Parser;
use mgpu::{
    ash::vk,
    device::Device,
    instance::Instance,
    pipeline::PipelineState,
    render_pass::RenderPass,
    renderer::FrameRenderer,
    shader::{ShaderModule, ShaderStage},
    surface::Surface,
    swapchain::Swapchain,
};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};
use winit::{
    application::ApplicationHandler,
    dpi::LogicalSize,
    event::WindowEvent,
    event_loop::ControlFlow,
    window::{Window as WinitWindow, WindowAttributes},
};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, clap::ValueEnum)]
enum TracingLogLevel {
    Off,
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<TracingLogLevel> for tracing::Level {
    fn from(value: TracingLogLevel) -> Self {
        match value {
            //We clamp this to the lowest possible level but this shouldn't happen
            TracingLogLevel::Off => tracing::Level::TRACE,
            TracingLogLevel::Trace => tracing::Level::TRACE,
            TracingLogLevel::Debug => tracing::Level::DEBUG,
            TracingLogLevel::Info => tracing::Level::INFO,
            TracingLogLevel::Warn => tracing::Level::WARN,
            TracingLogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliVulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl From<CliVulkanLogLevel> for mgpu::log::VulkanLogLevel {
    fn from(value: CliVulkanLogLevel) -> Self {
        match value {
            CliVulkanLogLevel::Verbose => mgpu::log::VulkanLogLevel::Verbose,
            CliVulkanLogLevel::Info => mgpu::log::VulkanLogLevel::Info,
            CliVulkanLogLevel::Warning => mgpu::log::VulkanLogLevel::Warning,
            CliVulkanLogLevel::Error => mgpu::log::VulkanLogLevel::Error,
        }
    }
}

#[derive(clap::Parser, Debug)]
struct CliArgs {
    #[arg(short, long, default_value = "info")]
    tracing_log_level: TracingLogLevel,

    /// Enables the validation layer at the given severity.
    #[arg(short, long)]
    graphics_debug_level: Option<CliVulkanLogLevel>,

    #[arg(long, default_value_t = 800)]
    width: u32,

    #[arg(long, default_value_t = 600)]
    height: u32,

    /// Precompiled SPIR-V vertex shader. Defaults to
    /// assets/shaders/triangle.vert.spv found by walking up from the
    /// current directory.
    #[arg(long)]
    vertex_shader: Option<PathBuf>,

    /// Precompiled SPIR-V fragment shader. Defaults to
    /// assets/shaders/triangle.frag.spv found by walking up from the
    /// current directory.
    #[arg(long)]
    fragment_shader: Option<PathBuf>,
}

/// Walk up from the current directory until a directory containing
/// `assets/` is found, mirroring how the client is usually launched from a
/// nested build directory.
fn find_assets_dir() -> Option<PathBuf> {
    let mut dir = std::env::current_dir().ok()?;
    loop {
        let candidate = dir.join("assets");
        if candidate.is_dir() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

fn resolve_shader_path(explicit: Option<PathBuf>, default_name: &str) -> eyre::Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    let assets = find_assets_dir()
        .ok_or_else(|| eyre::eyre!("Could not find an assets directory above the current one"))?;
    Ok(assets.join("shaders").join(default_name))
}

fn read_spirv(path: &Path) -> eyre::Result<Vec<u8>> {
    fs::read(path).map_err(|e| eyre::eyre!("Could not read shader blob {}: {e}", path.display()))
}

fn main() -> eyre::Result<()> {
    let cli_args = CliArgs::parse();

    if cli_args.tracing_log_level != TracingLogLevel::Off {
        let app_dirs = directories::ProjectDirs::from("", "mania", "mania-app");
        let log_dir = match app_dirs
            .as_ref()
            .and_then(|x| x.runtime_dir().or_else(|| Some(x.data_dir())))
            .map(|p| p.to_owned())
        {
            Some(path) => path,
            None => std::env::current_dir()?,
        };
        fs::create_dir_all(&log_dir)?;

        let mut log_file_path = log_dir.clone();
        log_file_path.push("log-file");
        log_file_path.set_extension("txt");
        let log_file = File::create(&log_file_path)?;
        let file_log = tracing_subscriber::fmt::layer()
            .with_writer(log_file)
            .with_ansi(false);

        let stdout_log = tracing_subscriber::fmt::layer().pretty();

        tracing_subscriber::registry()
            .with(
                stdout_log
                    .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
                        cli_args.tracing_log_level.into(),
                    ))
                    .and_then(file_log),
            )
            .init();
    }

    let vertex_shader_path =
        resolve_shader_path(cli_args.vertex_shader.clone(), "triangle.vert.spv")?;
    let fragment_shader_path =
        resolve_shader_path(cli_args.fragment_shader.clone(), "triangle.frag.spv")?;

    let event_loop = winit::event_loop::EventLoop::builder().build()?;

    //SAFETY: Loads vulkan via libloading, which runs library init code; we
    //accept that for the process entry point
    let instance = Arc::new(unsafe {
        Instance::new(
            "mania-app",
            cli_args.graphics_debug_level.map(Into::into),
            &event_loop,
        )
    }?);

    let mut app = AppRunner(Some(App::Initializing(InitializingState {
        instance,
        window_size: LogicalSize {
            width: cli_args.width,
            height: cli_args.height,
        },
        vertex_shader_path,
        fragment_shader_path,
    })));

    tracing::trace!("Entering main event loop");
    Ok(event_loop.run_app(&mut app)?)
}

/// The full graphics stack, created in dependency order on resume.
///
/// Teardown must run in reverse creation order, and the framebuffers have
/// to go before the render pass they were created against; `Drop`
/// sequences all of it explicitly.
struct GfxStack {
    _instance: Arc<Instance>,
    _surface: Arc<Surface<WinitWindow>>,
    _device: Arc<Device>,
    swapchain: Option<Swapchain<WinitWindow>>,
    _vertex_shader: Option<ShaderModule>,
    _fragment_shader: Option<ShaderModule>,
    render_pass: Option<RenderPass>,
    pipeline: Option<PipelineState>,
    renderer: Option<FrameRenderer>,
}

impl GfxStack {
    fn new(
        instance: Arc<Instance>,
        window: Arc<WinitWindow>,
        vertex_spirv: &[u8],
        fragment_spirv: &[u8],
    ) -> eyre::Result<Self> {
        //SAFETY: the surface holds an Arc to the window and is dropped with
        //this stack, before the window goes away
        let surface = Arc::new(unsafe { Surface::new(&instance, Arc::clone(&window)) }?);

        let device = Arc::new(Device::new(&instance, &surface)?);

        let window_size = window.inner_size();
        let mut swapchain = Swapchain::new(
            &device,
            &surface,
            vk::Extent2D {
                width: window_size.width,
                height: window_size.height,
            },
        )?;

        let vertex_shader = ShaderModule::new(&device, vertex_spirv)?;
        let fragment_shader = ShaderModule::new(&device, fragment_spirv)?;

        let render_pass = RenderPass::new(&device, swapchain.format())?;

        // Framebuffers can only exist once the render pass does.
        swapchain.create_framebuffers(&render_pass)?;

        let vertex_entry = vertex_shader.entry_point("main", ShaderStage::Vertex)?;
        let fragment_entry = fragment_shader.entry_point("main", ShaderStage::Fragment)?;
        let pipeline = PipelineState::new(
            &device,
            &[vertex_entry, fragment_entry],
            &render_pass,
            swapchain.extent(),
        )?;

        let renderer = FrameRenderer::new(&device, &swapchain, &pipeline)?;

        Ok(Self {
            _instance: instance,
            _surface: surface,
            _device: device,
            swapchain: Some(swapchain),
            _vertex_shader: Some(vertex_shader),
            _fragment_shader: Some(fragment_shader),
            render_pass: Some(render_pass),
            pipeline: Some(pipeline),
            renderer: Some(renderer),
        })
    }

    /// Render one frame. Returns `false` when rendering can no longer make
    /// progress on this stack.
    fn render_frame(&mut self) -> bool {
        let (Some(renderer), Some(swapchain), Some(render_pass), Some(pipeline)) = (
            self.renderer.as_mut(),
            self.swapchain.as_ref(),
            self.render_pass.as_ref(),
            self.pipeline.as_ref(),
        ) else {
            return false;
        };

        match renderer.render_frame(swapchain, render_pass, pipeline) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Rendering failed: {e}");
                false
            }
        }
    }
}

impl Drop for GfxStack {
    fn drop(&mut self) {
        // Renderer first: its drop waits for the device to go idle before
        // releasing per-frame resources.
        self.renderer.take();
        self.pipeline.take();
        self._vertex_shader.take();
        self._fragment_shader.take();
        // Framebuffers reference the render pass, so they go before it.
        if let Some(swapchain) = self.swapchain.as_mut() {
            swapchain.destroy_framebuffers();
        }
        self.render_pass.take();
        self.swapchain.take();
        // device, surface, and instance drop with the remaining fields, in
        // declaration order.
    }
}

#[derive(Debug)]
struct InitializingState {
    instance: Arc<Instance>,
    window_size: LogicalSize<u32>,
    vertex_shader_path: PathBuf,
    fragment_shader_path: PathBuf,
}

struct RunningState {
    window: Arc<WinitWindow>,
    stack: GfxStack,
}

struct AppRunner(Option<App>);

enum App {
    Initializing(InitializingState),
    Running(RunningState),
    Exiting,
}

impl AppRunner {
    fn transition_to_exiting(
        &mut self,
        from_state: &'static str,
        event_loop: &winit::event_loop::ActiveEventLoop,
    ) {
        tracing::debug!("State transition: {} -> Exiting", from_state);
        self.0 = Some(App::Exiting);
        event_loop.exit();
    }

    fn take_initializing(&mut self) -> Option<InitializingState> {
        if matches!(self.0, Some(App::Initializing(_))) {
            match self.0.take() {
                Some(App::Initializing(s)) => Some(s),
                _ => unreachable!(),
            }
        } else {
            None
        }
    }

    fn as_running_mut(&mut self) -> Option<&mut RunningState> {
        match &mut self.0 {
            Some(App::Running(s)) => Some(s),
            _ => None,
        }
    }
}

impl ApplicationHandler for AppRunner {
    fn resumed(&mut self, event_loop: &winit::event_loop::ActiveEventLoop) {
        let Some(initializing_state) = self.take_initializing() else {
            // Suspend/resume cycles are not handled; the stack is built once.
            return;
        };
        event_loop.set_control_flow(ControlFlow::Poll);

        let window = match event_loop.create_window(
            WindowAttributes::default()
                .with_title("mania")
                .with_inner_size(initializing_state.window_size),
        ) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                tracing::error!("Error while creating window: {e}");
                self.transition_to_exiting("Initializing", event_loop);
                return;
            }
        };

        let vertex_spirv = match read_spirv(&initializing_state.vertex_shader_path) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("{e}");
                self.transition_to_exiting("Initializing", event_loop);
                return;
            }
        };
        let fragment_spirv = match read_spirv(&initializing_state.fragment_shader_path) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("{e}");
                self.transition_to_exiting("Initializing", event_loop);
                return;
            }
        };

        let stack = match GfxStack::new(
            initializing_state.instance,
            Arc::clone(&window),
            &vertex_spirv,
            &fragment_spirv,
        ) {
            Ok(stack) => stack,
            Err(e) => {
                tracing::error!("Error while bringing up the graphics stack: {e}");
                self.transition_to_exiting("Initializing", event_loop);
                return;
            }
        };

        tracing::debug!("State transition: Initializing -> Running");
        self.0 = Some(App::Running(RunningState { window, stack }));
    }

    fn window_event(
        &mut self,
        event_loop: &winit::event_loop::ActiveEventLoop,
        window_id: winit::window::WindowId,
        window_event: WindowEvent,
    ) {
        let Some(running_state) = self.as_running_mut() else {
            return;
        };
        if window_id != running_state.window.id() {
            return;
        }

        match window_event {
            WindowEvent::CloseRequested => {
                tracing::trace!("Close window request received");
                self.0 = None;
                self.transition_to_exiting("Running", event_loop);
            }
            WindowEvent::Resized(size) => {
                // No swapchain recreation path exists; a mismatched extent
                // surfaces as suboptimal acquire/present warnings.
                tracing::trace!("Window resized to {}x{}, ignored", size.width, size.height);
            }
            WindowEvent::RedrawRequested => {
                if !running_state.stack.render_frame() {
                    self.0 = None;
                    self.transition_to_exiting("Running", event_loop);
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &winit::event_loop::ActiveEventLoop) {
        if let Some(running_state) = self.as_running_mut() {
            running_state.window.request_redraw();
        }
    }
}
