use std::sync::Arc;

use log::{error, info, warn};
use parking_lot::RwLock;
use winit::dpi::PhysicalSize;
use winit::window::Window;

use crate::error::Result;

/// Device handles every render component receives explicitly.
pub struct GpuContext {
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl GpuContext {
    pub fn create_instance() -> wgpu::Instance {
        wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        })
    }

    /// Acquires an adapter and device, compatible with `surface` when given.
    pub async fn new(instance: wgpu::Instance, surface: Option<&wgpu::Surface<'_>>) -> Result<Self> {
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: surface,
                force_fallback_adapter: false,
            })
            .await?;
        info!("Using adapter {:?}", adapter.get_info().name);

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("renderer-device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                ..Default::default()
            })
            .await?;
        // Setup and render_frame capture errors through scopes; this only sees stray calls
        device.on_uncaptured_error(Box::new(|err| {
            error!("uncaptured GPU error: {err}");
        }));

        Ok(Self {
            instance,
            adapter,
            device,
            queue,
        })
    }

    /// Context without a presentation surface, for offscreen rendering.
    pub async fn headless() -> Result<Self> {
        Self::new(Self::create_instance(), None).await
    }
}

/// Swap chain bound to the application window.
pub struct WindowSurface {
    window: Arc<Window>,
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
}

impl WindowSurface {
    /// Creates the surface and the context that drives it.
    pub async fn new(window: Arc<Window>) -> Result<(Self, GpuContext)> {
        let instance = GpuContext::create_instance();
        let surface = instance.create_surface(Arc::clone(&window))?;
        let ctx = GpuContext::new(instance, Some(&surface)).await?;

        let size = window.inner_size();
        let caps = surface.get_capabilities(&ctx.adapter);
        // The lighting resolve applies gamma itself, so avoid a second encode
        let format = caps
            .formats
            .iter()
            .find(|format| !format.is_srgb())
            .copied()
            .unwrap_or(caps.formats[0]);
        if format.is_srgb() {
            warn!("no linear surface format available, output will be double gamma corrected");
        }
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            desired_maximum_frame_latency: 2,
            alpha_mode: caps.alpha_modes[0],
            view_formats: vec![],
        };
        surface.configure(&ctx.device, &config);

        Ok((
            Self {
                window,
                surface,
                config,
            },
            ctx,
        ))
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        self.config.format
    }

    pub fn resize(&mut self, ctx: &GpuContext, size: PhysicalSize<u32>) {
        if size.width == 0 || size.height == 0 {
            return;
        }
        self.config.width = size.width;
        self.config.height = size.height;
        self.surface.configure(&ctx.device, &self.config);
    }

    pub fn acquire(&self) -> std::result::Result<wgpu::SurfaceTexture, wgpu::SurfaceError> {
        self.surface.get_current_texture()
    }
}

/// Reports the drawable size render targets should match.
pub trait ViewportProvider {
    fn viewport_size(&self) -> (u32, u32);
}

/// Viewport that always reports the same resolution.
#[derive(Debug, Clone, Copy)]
pub struct StaticViewport {
    pub width: u32,
    pub height: u32,
}

impl StaticViewport {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl ViewportProvider for StaticViewport {
    fn viewport_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Window size as last reported by the event loop.
#[derive(Debug)]
pub struct WindowViewport {
    size: RwLock<(u32, u32)>,
}

impl WindowViewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: RwLock::new((width.max(1), height.max(1))),
        }
    }

    pub fn update(&self, width: u32, height: u32) {
        *self.size.write() = (width.max(1), height.max(1));
    }
}

impl ViewportProvider for WindowViewport {
    fn viewport_size(&self) -> (u32, u32) {
        *self.size.read()
    }
}

impl<T> ViewportProvider for Arc<T>
where
    T: ViewportProvider + ?Sized,
{
    fn viewport_size(&self) -> (u32, u32) {
        (**self).viewport_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_viewport_never_reports_zero() {
        let viewport = WindowViewport::new(640, 480);
        assert_eq!(viewport.viewport_size(), (640, 480));
        viewport.update(0, 0);
        assert_eq!(viewport.viewport_size(), (1, 1));
        let shared: Arc<dyn ViewportProvider> = Arc::new(StaticViewport::new(8, 4));
        assert_eq!(shared.viewport_size(), (8, 4));
    }
}
