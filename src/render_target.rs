use log::{debug, info};

use crate::context::{GpuContext, ViewportProvider};
use crate::error::{Incompleteness, RenderError, Result};

/// Combined depth/stencil format of every set that asks for one.
pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth24PlusStencil8;

/// Where a set takes its dimensions from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderTargetSize {
    /// Follow the viewport, reallocating when it changes.
    TrackWindow,
    /// Allocated once and never resized.
    Fixed(u32, u32),
}

/// Shape of a render target set; immutable after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderTargetDesc {
    pub label: String,
    pub color_formats: Vec<wgpu::TextureFormat>,
    pub include_depth_stencil: bool,
    pub size: RenderTargetSize,
}

/// Validates an attachment layout against device limits, the way a
/// framebuffer completeness check would.
pub fn check_completeness(
    limits: &wgpu::Limits,
    color_formats: &[wgpu::TextureFormat],
    include_depth_stencil: bool,
    width: u32,
    height: u32,
) -> std::result::Result<(), Incompleteness> {
    if color_formats.is_empty() && !include_depth_stencil {
        return Err(Incompleteness::MissingAttachment);
    }
    let max = limits.max_texture_dimension_2d;
    if width == 0 || height == 0 || width > max || height > max {
        return Err(Incompleteness::IncompleteDimensions { width, height, max });
    }
    if color_formats.len() > limits.max_color_attachments as usize {
        return Err(Incompleteness::TooManyAttachments {
            count: color_formats.len(),
            max: limits.max_color_attachments,
        });
    }

    let mut bytes = 0u32;
    for (slot, &format) in color_formats.iter().enumerate() {
        let renderable = !format.is_depth_stencil_format()
            && format
                .guaranteed_format_features(wgpu::Features::empty())
                .allowed_usages
                .contains(wgpu::TextureUsages::RENDER_ATTACHMENT);
        let (Some(cost), Some(alignment), true) = (
            format.target_pixel_byte_cost(),
            format.target_component_alignment(),
            renderable,
        ) else {
            return Err(Incompleteness::UnsupportedFormat { slot, format });
        };
        bytes = bytes.next_multiple_of(alignment) + cost;
    }
    if bytes > limits.max_color_attachment_bytes_per_sample {
        return Err(Incompleteness::AttachmentBytesExceeded {
            bytes,
            max: limits.max_color_attachment_bytes_per_sample,
        });
    }
    Ok(())
}

struct Channel {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

struct DepthAttachment {
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
    sample_view: wgpu::TextureView,
}

/// Color attachments plus an optional depth/stencil attachment, rendered
/// to together and sampled by later passes.
pub struct RenderTargetSet {
    desc: RenderTargetDesc,
    channels: Vec<Channel>,
    depth: Option<DepthAttachment>,
    width: u32,
    height: u32,
    generation: u64,
}

impl RenderTargetSet {
    pub fn new(ctx: &GpuContext, desc: RenderTargetDesc, viewport: &dyn ViewportProvider) -> Result<Self> {
        let (width, height) = match desc.size {
            RenderTargetSize::TrackWindow => viewport.viewport_size(),
            RenderTargetSize::Fixed(width, height) => (width, height),
        };
        let mut set = Self {
            desc,
            channels: Vec::new(),
            depth: None,
            width,
            height,
            generation: 0,
        };
        set.allocate(ctx, width, height)?;
        info!(
            "Created render target '{}' ({} channels, {}x{})",
            set.desc.label,
            set.channels.len(),
            width,
            height
        );
        Ok(set)
    }

    /// Reallocates a window-tracking set when the viewport size changed.
    /// Returns whether anything was recreated.
    pub fn update(&mut self, ctx: &GpuContext, viewport: &dyn ViewportProvider) -> Result<bool> {
        if self.desc.size != RenderTargetSize::TrackWindow {
            return Ok(false);
        }
        let (width, height) = viewport.viewport_size();
        if (width, height) == (self.width, self.height) {
            return Ok(false);
        }
        info!(
            "Resizing render target '{}' from {}x{} to {width}x{height}",
            self.desc.label, self.width, self.height
        );
        self.allocate(ctx, width, height)?;
        Ok(true)
    }

    fn allocate(&mut self, ctx: &GpuContext, width: u32, height: u32) -> Result<()> {
        check_completeness(
            &ctx.device.limits(),
            &self.desc.color_formats,
            self.desc.include_depth_stencil,
            width,
            height,
        )
        .map_err(|reason| RenderError::IncompleteFramebuffer {
            label: self.desc.label.clone(),
            reason,
        })?;

        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let label = &self.desc.label;
        self.channels = self
            .desc
            .color_formats
            .iter()
            .enumerate()
            .map(|(slot, &format)| {
                let texture = ctx.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some(&format!("{label}-{slot}")),
                    size,
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format,
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                        | wgpu::TextureUsages::TEXTURE_BINDING
                        | wgpu::TextureUsages::COPY_SRC,
                    view_formats: &[],
                });
                let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
                Channel { texture, view }
            })
            .collect();

        self.depth = self.desc.include_depth_stencil.then(|| {
            let texture = ctx.device.create_texture(&wgpu::TextureDescriptor {
                label: Some(&format!("{label}-depth")),
                size,
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: DEPTH_FORMAT,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                    | wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            });
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            let sample_view = texture.create_view(&wgpu::TextureViewDescriptor {
                label: Some(&format!("{label}-depth-sample")),
                aspect: wgpu::TextureAspect::DepthOnly,
                ..Default::default()
            });
            DepthAttachment {
                _texture: texture,
                view,
                sample_view,
            }
        });

        self.width = width;
        self.height = height;
        self.generation += 1;
        debug!(
            "render target '{}' generation {}",
            self.desc.label, self.generation
        );
        Ok(())
    }

    pub fn label(&self) -> &str {
        &self.desc.label
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn color_formats(&self) -> &[wgpu::TextureFormat] {
        &self.desc.color_formats
    }

    pub fn has_depth(&self) -> bool {
        self.depth.is_some()
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Bumped on every (re)allocation; bind groups built over older views are stale.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn texture(&self, index: usize) -> Option<&wgpu::Texture> {
        self.channels.get(index).map(|channel| &channel.texture)
    }

    pub fn view(&self, index: usize) -> Option<&wgpu::TextureView> {
        self.channels.get(index).map(|channel| &channel.view)
    }

    /// Depth-only view of the depth/stencil attachment, for sampling.
    pub fn depth_view(&self) -> Option<&wgpu::TextureView> {
        self.depth.as_ref().map(|depth| &depth.sample_view)
    }

    /// Opens a pass drawing into every attachment, clearing colors to
    /// `clear` and depth to the far plane.
    pub fn begin_pass<'e>(
        &self,
        encoder: &'e mut wgpu::CommandEncoder,
        clear: wgpu::Color,
    ) -> wgpu::RenderPass<'e> {
        let color_attachments: Vec<_> = self
            .channels
            .iter()
            .map(|channel| {
                Some(wgpu::RenderPassColorAttachment {
                    view: &channel.view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(clear),
                        store: wgpu::StoreOp::Store,
                    },
                })
            })
            .collect();
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(&self.desc.label),
            color_attachments: &color_attachments,
            depth_stencil_attachment: self.depth.as_ref().map(|depth| {
                wgpu::RenderPassDepthStencilAttachment {
                    view: &depth.view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(0),
                        store: wgpu::StoreOp::Store,
                    }),
                }
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        })
    }
}
