use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Failure modes of renderer setup.
///
/// None of these are retryable: each one means the render target layout, a
/// shader or an asset does not match what the pipeline was built for.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("framebuffer '{label}' is incomplete: {reason}")]
    IncompleteFramebuffer {
        label: String,
        reason: Incompleteness,
    },
    #[error("{name}: shader error: {diagnostic}")]
    ShaderCompile { name: String, diagnostic: String },
    #[error("mesh '{mesh}' is missing required attribute '{attribute}'")]
    MissingAttribute { mesh: String, attribute: &'static str },
    #[error("mesh '{mesh}' rejected: {reason}")]
    InvalidMesh { mesh: String, reason: String },
    #[error("texture not found: {}", path.display())]
    TextureNotFound { path: PathBuf },
    #[error("failed to decode texture {}: {source}", path.display())]
    TextureDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("render_frame called before the first update")]
    NotUpdated,
    #[error("GPU rejected {stage}: {diagnostic}")]
    Validation { stage: String, diagnostic: String },
    #[error("surface error: {0}")]
    Surface(#[from] wgpu::SurfaceError),
    #[error("failed to create surface: {0}")]
    CreateSurface(#[from] wgpu::CreateSurfaceError),
    #[error("failed to acquire GPU adapter: {0}")]
    Adapter(#[from] wgpu::RequestAdapterError),
    #[error("failed to create GPU device: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
}

pub type Result<T> = std::result::Result<T, RenderError>;

/// Reason a render target set failed its completeness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Incompleteness {
    /// Neither a color nor a depth attachment was declared.
    MissingAttachment,
    /// Zero sized, or larger than the device allows.
    IncompleteDimensions { width: u32, height: u32, max: u32 },
    /// The format cannot be used in the given color slot.
    UnsupportedFormat {
        slot: usize,
        format: wgpu::TextureFormat,
    },
    TooManyAttachments { count: usize, max: u32 },
    AttachmentBytesExceeded { bytes: u32, max: u32 },
}

impl fmt::Display for Incompleteness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingAttachment => f.write_str("INCOMPLETE_MISSING_ATTACHMENT"),
            Self::IncompleteDimensions { width, height, max } => write!(
                f,
                "INCOMPLETE_DIMENSIONS ({width}x{height}, device maximum {max})"
            ),
            Self::UnsupportedFormat { slot, format } => {
                write!(f, "UNSUPPORTED (color slot {slot} uses {format:?})")
            }
            Self::TooManyAttachments { count, max } => write!(
                f,
                "INCOMPLETE_ATTACHMENT ({count} color attachments, device maximum {max})"
            ),
            Self::AttachmentBytesExceeded { bytes, max } => write!(
                f,
                "INCOMPLETE_ATTACHMENT ({bytes} bytes per sample, device maximum {max})"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incompleteness_names_the_reason() {
        let err = RenderError::IncompleteFramebuffer {
            label: "gbuffer".into(),
            reason: Incompleteness::UnsupportedFormat {
                slot: 2,
                format: wgpu::TextureFormat::Depth32Float,
            },
        };
        let text = err.to_string();
        assert!(text.contains("gbuffer"));
        assert!(text.contains("color slot 2"));
        assert!(text.contains("Depth32Float"));
    }
}
