use std::path::PathBuf;
use std::sync::Arc;

use crate::context::GpuContext;
use crate::error::Result;
use crate::texture::{ColorSpace, Texture, TextureCache};

/// Number of texture slots a material binds.
pub const TEXTURE_SLOTS: u32 = 5;
/// Binding index of the shared sampler, after the texture slots.
pub const SAMPLER_BINDING: u32 = TEXTURE_SLOTS;

/// Texture file paths a material was declared with; `None` selects the default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterialTextures {
    pub diffuse: Option<PathBuf>,
    pub specular: Option<PathBuf>,
    pub normal: Option<PathBuf>,
    pub bump: Option<PathBuf>,
    pub translucency: Option<PathBuf>,
}

/// Bind group layout and sampler every material is created against.
pub struct MaterialLayout {
    layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
}

impl MaterialLayout {
    pub fn new(device: &wgpu::Device) -> Self {
        let texture_entry = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        };
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("material-bind-layout"),
            entries: &[
                texture_entry(0),
                texture_entry(1),
                texture_entry(2),
                texture_entry(3),
                texture_entry(4),
                wgpu::BindGroupLayoutEntry {
                    binding: SAMPLER_BINDING,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("material-sampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            address_mode_w: wgpu::AddressMode::Repeat,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        Self { layout, sampler }
    }

    pub fn layout(&self) -> &wgpu::BindGroupLayout {
        &self.layout
    }
}

/// Surface description of one mesh: five texture slots bound together.
pub struct Material {
    pub diffuse: Arc<Texture>,
    pub specular: Arc<Texture>,
    pub normal: Arc<Texture>,
    pub bump: Arc<Texture>,
    pub translucency: Arc<Texture>,
    translucent: bool,
    bind_group: wgpu::BindGroup,
}

impl Material {
    /// Resolves every declared path through `cache`, substituting defaults
    /// for the slots left empty.
    pub fn load(
        ctx: &GpuContext,
        cache: &mut TextureCache,
        layout: &MaterialLayout,
        label: &str,
        textures: &MaterialTextures,
    ) -> Result<Self> {
        let defaults = cache.defaults().clone();
        let mut resolve = |path: &Option<PathBuf>, space, fallback: &Arc<Texture>| match path {
            Some(path) => cache.load(ctx, path, space),
            None => Ok(Arc::clone(fallback)),
        };
        let diffuse = resolve(&textures.diffuse, ColorSpace::Srgb, &defaults.white)?;
        let specular = resolve(&textures.specular, ColorSpace::Linear, &defaults.black)?;
        let normal = resolve(&textures.normal, ColorSpace::Linear, &defaults.flat_normal)?;
        let bump = resolve(&textures.bump, ColorSpace::Linear, &defaults.black)?;
        let translucency = resolve(&textures.translucency, ColorSpace::Linear, &defaults.black)?;
        Ok(Self::new(
            &ctx.device,
            layout,
            label,
            [diffuse, specular, normal, bump, translucency],
        ))
    }

    /// Textures in slot order: diffuse, specular, normal, bump, translucency.
    pub fn new(
        device: &wgpu::Device,
        layout: &MaterialLayout,
        label: &str,
        textures: [Arc<Texture>; 5],
    ) -> Self {
        let [diffuse, specular, normal, bump, translucency] = textures;
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &layout.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(diffuse.view()),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(specular.view()),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(normal.view()),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(bump.view()),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::TextureView(translucency.view()),
                },
                wgpu::BindGroupEntry {
                    binding: SAMPLER_BINDING,
                    resource: wgpu::BindingResource::Sampler(&layout.sampler),
                },
            ],
        });
        Self {
            translucent: diffuse.has_alpha(),
            diffuse,
            specular,
            normal,
            bump,
            translucency,
            bind_group,
        }
    }

    /// Drawn without back-face culling and alpha clipped.
    pub fn is_translucent(&self) -> bool {
        self.translucent
    }

    pub fn bind_group(&self) -> &wgpu::BindGroup {
        &self.bind_group
    }
}
