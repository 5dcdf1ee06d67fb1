use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::imageops::FilterType;
use image::{DynamicImage, RgbaImage};
use log::{debug, info};

use crate::context::GpuContext;
use crate::error::{RenderError, Result};

/// How texel values are interpreted when sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorSpace {
    /// Color data (diffuse), decoded to linear on sampling.
    Srgb,
    /// Data maps (specular, normal, height, masks).
    Linear,
}

impl ColorSpace {
    fn format(self) -> wgpu::TextureFormat {
        match self {
            Self::Srgb => wgpu::TextureFormat::Rgba8UnormSrgb,
            Self::Linear => wgpu::TextureFormat::Rgba8Unorm,
        }
    }
}

/// Sampled 2D texture with a full mip chain.
#[derive(Debug)]
pub struct Texture {
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
    has_alpha: bool,
}

impl Texture {
    pub fn from_image(ctx: &GpuContext, label: &str, image: &DynamicImage, space: ColorSpace) -> Self {
        let has_alpha = carries_alpha(image);
        Self::from_rgba(ctx, label, image.to_rgba8(), space, has_alpha)
    }

    /// 1x1 texture filled with one color.
    pub fn solid(ctx: &GpuContext, label: &str, rgba: [u8; 4], space: ColorSpace) -> Self {
        let image = RgbaImage::from_pixel(1, 1, image::Rgba(rgba));
        Self::from_rgba(ctx, label, image, space, rgba[3] < u8::MAX)
    }

    fn from_rgba(
        ctx: &GpuContext,
        label: &str,
        base: RgbaImage,
        space: ColorSpace,
        has_alpha: bool,
    ) -> Self {
        let (width, height) = base.dimensions();
        let levels = mip_level_count(width, height);
        let texture = ctx.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: levels,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: space.format(),
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        for level in 0..levels {
            let level_width = (width >> level).max(1);
            let level_height = (height >> level).max(1);
            let pixels = if level == 0 {
                base.clone()
            } else {
                image::imageops::resize(&base, level_width, level_height, FilterType::Triangle)
            };
            ctx.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: &texture,
                    mip_level: level,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                pixels.as_raw(),
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(4 * level_width),
                    rows_per_image: Some(level_height),
                },
                wgpu::Extent3d {
                    width: level_width,
                    height: level_height,
                    depth_or_array_layers: 1,
                },
            );
        }

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            _texture: texture,
            view,
            width,
            height,
            has_alpha,
        }
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// True when the source image had an alpha channel that is actually used.
    pub fn has_alpha(&self) -> bool {
        self.has_alpha
    }
}

/// An image carries alpha when it has an alpha channel with at least one
/// texel that is not fully opaque.
///
/// A four-channel image whose alpha is 255 everywhere counts as opaque, so
/// exported RGBA textures without cut-outs keep back-face culling and skip
/// the alpha clip.
pub fn carries_alpha(image: &DynamicImage) -> bool {
    if !image.color().has_alpha() {
        return false;
    }
    image.to_rgba8().pixels().any(|pixel| pixel[3] < u8::MAX)
}

pub fn mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Textures substituted for material slots the asset leaves empty.
#[derive(Debug, Clone)]
pub struct DefaultTextures {
    pub white: Arc<Texture>,
    pub black: Arc<Texture>,
    pub flat_normal: Arc<Texture>,
}

impl DefaultTextures {
    pub fn new(ctx: &GpuContext) -> Self {
        Self {
            white: Arc::new(Texture::solid(ctx, "default-white", [255; 4], ColorSpace::Srgb)),
            black: Arc::new(Texture::solid(
                ctx,
                "default-black",
                [0, 0, 0, 255],
                ColorSpace::Linear,
            )),
            flat_normal: Arc::new(Texture::solid(
                ctx,
                "default-normal",
                [128, 128, 255, 255],
                ColorSpace::Linear,
            )),
        }
    }
}

/// Path keyed texture store; repeated references share one GPU texture.
pub struct TextureCache {
    loaded: HashMap<(PathBuf, ColorSpace), Arc<Texture>>,
    defaults: DefaultTextures,
}

impl TextureCache {
    pub fn new(ctx: &GpuContext) -> Self {
        Self {
            loaded: HashMap::new(),
            defaults: DefaultTextures::new(ctx),
        }
    }

    pub fn defaults(&self) -> &DefaultTextures {
        &self.defaults
    }

    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }

    pub fn load(&mut self, ctx: &GpuContext, path: &Path, space: ColorSpace) -> Result<Arc<Texture>> {
        let key = (path.to_path_buf(), space);
        if let Some(texture) = self.loaded.get(&key) {
            debug!("texture cache hit for {}", path.display());
            return Ok(Arc::clone(texture));
        }
        if !path.is_file() {
            return Err(RenderError::TextureNotFound {
                path: path.to_path_buf(),
            });
        }
        info!("Loading texture from {}", path.display());
        let image = image::open(path).map_err(|source| RenderError::TextureDecode {
            path: path.to_path_buf(),
            source,
        })?;
        let texture = Arc::new(Texture::from_image(
            ctx,
            &path.display().to_string(),
            &image,
            space,
        ));
        self.loaded.insert(key, Arc::clone(&texture));
        Ok(texture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba};

    #[test]
    fn rgb_image_is_opaque() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([10, 20, 30])));
        assert!(!carries_alpha(&image));
    }

    #[test]
    fn cutout_alpha_is_detected() {
        let mut rgba = RgbaImage::from_pixel(4, 4, Rgba([10, 200, 30, 255]));
        rgba.put_pixel(1, 2, Rgba([0, 0, 0, 0]));
        assert!(carries_alpha(&DynamicImage::ImageRgba8(rgba)));
    }

    #[test]
    fn fully_opaque_alpha_channel_is_ignored() {
        let rgba = RgbaImage::from_pixel(4, 4, Rgba([10, 200, 30, 255]));
        assert!(!carries_alpha(&DynamicImage::ImageRgba8(rgba)));
    }

    #[test]
    fn mip_chain_reaches_one_texel() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(2, 2), 2);
        assert_eq!(mip_level_count(1024, 512), 11);
        assert_eq!(mip_level_count(300, 7), 9);
    }
}
