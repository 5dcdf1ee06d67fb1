use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use glam::{Vec2, Vec3};
use log::{error, info, warn};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowId};

use crate::camera::FpsController;
use crate::context::{GpuContext, WindowSurface, WindowViewport};
use crate::input::InputState;
use crate::lights::{Flashlight, LightAnimator};
use crate::material::MaterialLayout;
use crate::model::{Instance, Model};
use crate::obj;
use crate::passes::{geometry, shadow};
use crate::renderer::{DeferredRenderer, RendererParams};
use crate::scene::SceneConfig;
use crate::shading::{GBufferTexel, RsmImage, ShadingContext, MAX_VPLS};
use crate::texture::TextureCache;

pub const WINDOW_TITLE: &str = "Deferred RSM";

const FOG_STEP: f32 = 0.005;
const VPL_STEP: u32 = 8;
const REFLECTION_STEP: f32 = 0.1;
const PARALLAX_STEP: f32 = 0.005;

/// Window or event loop creation failed; callers may fall back to
/// summary mode.
#[derive(Debug)]
pub struct WindowInitError {
    message: String,
}

impl WindowInitError {
    fn from_panic(stage: &str, panic: Box<dyn Any + Send>) -> Self {
        Self {
            message: format!("failed to initialize {stage}: {}", panic_message(panic)),
        }
    }

    fn from_error(stage: &str, err: impl fmt::Display) -> Self {
        Self {
            message: format!("failed to initialize {stage}: {err}"),
        }
    }
}

impl fmt::Display for WindowInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for WindowInitError {}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(msg) => *msg,
        Err(panic) => match panic.downcast::<&'static str>() {
            Ok(msg) => (*msg).to_string(),
            Err(_) => "unknown panic".into(),
        },
    }
}

/// Maps one frame of key presses onto the tunables.
///
/// F flashlight follow, T tone mapping, I indirect light, V indirect only,
/// H shadow factor, G/B cycle G-buffer/RSM channels, Up/Down fog density,
/// `[`/`]` VPL count, `-`/`=` reflection factor, P/O parallax depth.
pub fn apply_key_bindings(input: &InputState, params: &mut RendererParams, flashlight: &mut Flashlight) {
    let pressed = |key| input.was_key_pressed(key);
    if pressed(KeyCode::KeyF) {
        flashlight.follow_camera = !flashlight.follow_camera;
        info!("flashlight follow: {}", flashlight.follow_camera);
    }
    if pressed(KeyCode::KeyT) {
        params.tone_mapping = !params.tone_mapping;
    }
    if pressed(KeyCode::KeyI) {
        params.indirect_enabled = !params.indirect_enabled;
    }
    if pressed(KeyCode::KeyV) {
        params.visualize_indirect = !params.visualize_indirect;
    }
    if pressed(KeyCode::KeyH) {
        params.visualize_shadow = !params.visualize_shadow;
    }
    if pressed(KeyCode::KeyG) {
        params.visualize_buffer = cycle_channel(params.visualize_buffer, geometry::GBUFFER_FORMATS.len());
        params.visualize_rsm_buffer = -1;
        info!("visualizing G-buffer channel {}", params.visualize_buffer);
    }
    if pressed(KeyCode::KeyB) {
        params.visualize_rsm_buffer =
            cycle_channel(params.visualize_rsm_buffer, shadow::RSM_FORMATS.len() + 1);
        params.visualize_buffer = -1;
        info!("visualizing RSM channel {}", params.visualize_rsm_buffer);
    }
    if pressed(KeyCode::ArrowUp) {
        params.fog_density += FOG_STEP;
    }
    if pressed(KeyCode::ArrowDown) {
        params.fog_density = (params.fog_density - FOG_STEP).max(0.0);
    }
    if pressed(KeyCode::BracketRight) {
        params.vpl_count = (params.vpl_count + VPL_STEP).min(MAX_VPLS as u32);
    }
    if pressed(KeyCode::BracketLeft) {
        params.vpl_count = params.vpl_count.saturating_sub(VPL_STEP);
    }
    if pressed(KeyCode::Equal) {
        params.reflection_factor += REFLECTION_STEP;
    }
    if pressed(KeyCode::Minus) {
        params.reflection_factor = (params.reflection_factor - REFLECTION_STEP).max(0.0);
    }
    if pressed(KeyCode::KeyP) {
        params.parallax_depth += PARALLAX_STEP;
    }
    if pressed(KeyCode::KeyO) {
        params.parallax_depth = (params.parallax_depth - PARALLAX_STEP).max(0.0);
    }
}

/// -1, 0, 1, .., channels - 1, then back to -1.
fn cycle_channel(current: i32, channels: usize) -> i32 {
    let next = current + 1;
    if next >= channels as i32 {
        -1
    } else {
        next
    }
}

/// Loads every model the scene names once and places its instances.
pub fn load_instances(
    ctx: &GpuContext,
    layout: &MaterialLayout,
    config: &SceneConfig,
) -> Result<Vec<Instance>> {
    let mut cache = TextureCache::new(ctx);
    let mut models = HashMap::new();
    for entry in &config.models {
        let model = Model::load(ctx, &mut cache, layout, &entry.path)
            .with_context(|| format!("failed to load model '{}'", entry.name))?;
        models.insert(entry.name.as_str(), Arc::new(model));
    }
    info!("{} textures resident", cache.len());

    config
        .instances
        .iter()
        .map(|instance| {
            let model = models
                .get(instance.model.as_str())
                .ok_or_else(|| anyhow!("instance refers to unknown model '{}'", instance.model))?;
            Ok(Instance::new(Arc::clone(model), instance.transform.matrix()))
        })
        .collect()
}

/// CPU-only report of a scene: what it loads and what one probe pixel
/// straight ahead of the camera resolves to.
#[derive(Debug, Clone)]
pub struct SceneSummary {
    pub models: Vec<ModelSummary>,
    pub instances: usize,
    pub lights: usize,
    pub params: RendererParams,
    pub probe: Vec3,
}

#[derive(Debug, Clone)]
pub struct ModelSummary {
    pub name: String,
    pub groups: usize,
    pub materials: usize,
    pub triangles: usize,
}

impl SceneSummary {
    pub fn collect(config: &SceneConfig) -> Result<Self> {
        let models = config
            .models
            .iter()
            .map(|entry| {
                let scene = obj::load_obj(&entry.path)
                    .with_context(|| format!("failed to load model '{}'", entry.name))?;
                Ok(ModelSummary {
                    name: entry.name.clone(),
                    groups: scene.groups.len(),
                    materials: scene.materials.len(),
                    triangles: scene
                        .groups
                        .iter()
                        .map(|group| group.mesh.indices.len() / 3)
                        .sum(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let params = config.params.sanitized();
        let lights = config.lights.animator().sample(0.0);
        let camera = config.camera;
        let mut flashlight = config.flashlight;
        if flashlight.follow_camera {
            flashlight.camera = camera;
        }
        let shading = ShadingContext::new(&params, camera.position(), &lights, &flashlight);
        let probe_position = camera.position() + camera.direction() * 2.0;
        let texel = GBufferTexel::surface(probe_position, -camera.direction(), Vec3::ONE);
        let probe = shading
            .resolve(&RsmImage::empty(1), &texel, Vec2::splat(0.5))
            .truncate();

        Ok(Self {
            models,
            instances: config.instances.len(),
            lights: lights.len(),
            params,
            probe,
        })
    }
}

impl fmt::Display for SceneSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Scene with {} models, {} instances, {} lights",
            self.models.len(),
            self.instances,
            self.lights
        )?;
        for model in &self.models {
            writeln!(
                f,
                " - {}: {} groups, {} materials, {} triangles",
                model.name, model.groups, model.materials, model.triangles
            )?;
        }
        writeln!(
            f,
            "Indirect: {} ({} VPLs, radius {:.3}), fog density {:.3}, gamma {:.2}",
            if self.params.indirect_enabled { "on" } else { "off" },
            self.params.vpl_count,
            self.params.rsm_radius,
            self.params.fog_density,
            self.params.gamma
        )?;
        write!(
            f,
            "Probe pixel: ({:.3}, {:.3}, {:.3})",
            self.probe.x, self.probe.y, self.probe.z
        )
    }
}

struct RunningState {
    surface: WindowSurface,
    ctx: GpuContext,
    viewport: Arc<WindowViewport>,
    renderer: DeferredRenderer,
    instances: Vec<Instance>,
}

/// Event loop state: created windowless, the GPU side comes up on `resumed`.
pub struct App {
    config: SceneConfig,
    size: PhysicalSize<u32>,
    input: InputState,
    controller: FpsController,
    animator: LightAnimator,
    start: Instant,
    state: Option<RunningState>,
    last_error: Option<anyhow::Error>,
}

impl App {
    pub fn new(config: SceneConfig, width: u32, height: u32) -> Self {
        let controller = FpsController::new(config.camera);
        let animator = config.lights.animator();
        Self {
            config,
            size: PhysicalSize::new(width.max(1), height.max(1)),
            input: InputState::new(),
            controller,
            animator,
            start: Instant::now(),
            state: None,
            last_error: None,
        }
    }

    fn init(&self, event_loop: &ActiveEventLoop) -> Result<RunningState> {
        let window = Arc::new(
            event_loop
                .create_window(
                    Window::default_attributes()
                        .with_title(WINDOW_TITLE)
                        .with_inner_size(self.size),
                )
                .map_err(|err| WindowInitError::from_error("window", err))?,
        );
        let (surface, ctx) = pollster::block_on(WindowSurface::new(Arc::clone(&window)))?;
        let size = window.inner_size();
        let viewport = Arc::new(WindowViewport::new(size.width, size.height));

        let mut renderer = DeferredRenderer::new(&ctx, surface.format(), &viewport)?;
        *renderer.params_mut() = self.config.params.clone();
        *renderer.flashlight_mut() = self.config.flashlight;
        *renderer.projection_mut() = self.config.projection;
        let instances = load_instances(&ctx, renderer.material_layout(), &self.config)?;
        info!("Scene ready with {} instances", instances.len());

        Ok(RunningState {
            surface,
            ctx,
            viewport,
            renderer,
            instances,
        })
    }

    fn redraw(&mut self) -> Result<()> {
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };
        self.controller.update(&self.input);
        let (params, flashlight) = state.renderer.tunables_mut();
        apply_key_bindings(&self.input, params, flashlight);
        self.input.begin_frame();

        let lights = self.animator.sample(self.start.elapsed().as_secs_f32());
        state.renderer.set_lights(lights);
        state
            .renderer
            .update(&state.ctx, &self.controller.camera, &state.viewport)?;

        let frame = match state.surface.acquire() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                let size = state.surface.window().inner_size();
                state.surface.resize(&state.ctx, size);
                return Ok(());
            }
            Err(wgpu::SurfaceError::OutOfMemory) => {
                return Err(anyhow!("GPU is out of memory"));
            }
            Err(wgpu::SurfaceError::Timeout) => {
                info!("Surface timeout; retrying next frame");
                return Ok(());
            }
            Err(err) => {
                warn!("skipping frame: {err}");
                return Ok(());
            }
        };
        let view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        state
            .renderer
            .render_frame(&state.ctx, &state.instances, &view)?;
        state.surface.window().pre_present_notify();
        frame.present();
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        error!("{err:?}");
        self.last_error = Some(err);
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }
        match self.init(event_loop) {
            Ok(state) => self.state = Some(state),
            Err(err) => self.fail(event_loop, err),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => event_loop.exit(),
            WindowEvent::Resized(size) => {
                if let Some(state) = self.state.as_mut() {
                    state.surface.resize(&state.ctx, size);
                    state.viewport.update(size.width, size.height);
                }
            }
            WindowEvent::KeyboardInput { event, .. } => {
                let PhysicalKey::Code(code) = event.physical_key else {
                    return;
                };
                if code == KeyCode::Escape {
                    event_loop.exit();
                    return;
                }
                match event.state {
                    ElementState::Pressed => self.input.set_key_down(code),
                    ElementState::Released => self.input.set_key_up(code),
                }
            }
            WindowEvent::MouseInput { state, button, .. } => match state {
                ElementState::Pressed => self.input.set_mouse_button_down(button),
                ElementState::Released => self.input.set_mouse_button_up(button),
            },
            WindowEvent::CursorMoved { position, .. } => {
                self.input
                    .set_mouse_position(Vec2::new(position.x as f32, position.y as f32));
            }
            WindowEvent::RedrawRequested => {
                if let Err(err) = self.redraw() {
                    self.fail(event_loop, err);
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.surface.window().request_redraw();
        }
    }
}

/// Opens the window and renders until it closes or a frame fails.
pub fn run(config: SceneConfig, width: u32, height: u32) -> Result<()> {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(|_| {}));
    let event_loop = panic::catch_unwind(AssertUnwindSafe(EventLoop::new));
    panic::set_hook(default_hook);
    let event_loop = event_loop
        .map_err(|panic| WindowInitError::from_panic("event loop", panic))?
        .map_err(|err| WindowInitError::from_error("event loop", err))?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config, width, height);
    event_loop
        .run_app(&mut app)
        .context("event loop terminated abnormally")?;
    match app.last_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(key: KeyCode) -> InputState {
        let mut input = InputState::new();
        input.set_key_down(key);
        input
    }

    #[test]
    fn channel_cycling_wraps_to_normal_shading() {
        assert_eq!(cycle_channel(-1, 5), 0);
        assert_eq!(cycle_channel(3, 5), 4);
        assert_eq!(cycle_channel(4, 5), -1);
    }

    #[test]
    fn toggles_flip_on_press() {
        let mut params = RendererParams::default();
        let mut flashlight = Flashlight::default();
        apply_key_bindings(&press(KeyCode::KeyI), &mut params, &mut flashlight);
        assert!(!params.indirect_enabled);
        apply_key_bindings(&press(KeyCode::KeyF), &mut params, &mut flashlight);
        assert!(flashlight.follow_camera);
    }

    #[test]
    fn held_keys_do_not_repeat() {
        let mut params = RendererParams::default();
        let mut flashlight = Flashlight::default();
        let mut input = press(KeyCode::KeyT);
        input.begin_frame();
        apply_key_bindings(&input, &mut params, &mut flashlight);
        assert!(params.tone_mapping);
    }

    #[test]
    fn steps_stay_in_range() {
        let mut params = RendererParams {
            vpl_count: 4,
            fog_density: 0.001,
            ..RendererParams::default()
        };
        let mut flashlight = Flashlight::default();
        apply_key_bindings(&press(KeyCode::BracketLeft), &mut params, &mut flashlight);
        apply_key_bindings(&press(KeyCode::ArrowDown), &mut params, &mut flashlight);
        assert_eq!(params.vpl_count, 0);
        assert_eq!(params.fog_density, 0.0);

        params.vpl_count = MAX_VPLS as u32;
        apply_key_bindings(&press(KeyCode::BracketRight), &mut params, &mut flashlight);
        assert_eq!(params.vpl_count, MAX_VPLS as u32);
    }

    #[test]
    fn selecting_a_gbuffer_channel_clears_the_rsm_one() {
        let mut params = RendererParams {
            visualize_rsm_buffer: 2,
            ..RendererParams::default()
        };
        let mut flashlight = Flashlight::default();
        apply_key_bindings(&press(KeyCode::KeyG), &mut params, &mut flashlight);
        assert_eq!(params.visualize_buffer, 0);
        assert_eq!(params.visualize_rsm_buffer, -1);
    }

    #[test]
    fn summary_of_empty_scene_has_a_finite_probe() {
        let config = SceneConfig::default();
        let summary = SceneSummary::collect(&config).unwrap();
        assert!(summary.models.is_empty());
        assert!(summary.probe.is_finite());
        assert!(summary.probe.cmpge(Vec3::ZERO).all());
        assert!(summary.to_string().contains("Probe pixel"));
    }
}
