//! Deferred renderer with a shadow-casting flashlight and one bounce of
//! indirect light gathered from a reflective shadow map.
//!
//! A frame renders the scene from the flashlight into the RSM, then from the
//! camera into the G-buffer, then resolves both in a full-screen lighting
//! pass. `shading` mirrors that resolve on the CPU so lighting behavior can
//! be checked without a GPU.

pub mod app;
pub mod camera;
pub mod context;
pub mod error;
pub mod input;
pub mod lights;
pub mod material;
pub mod mesh;
pub mod model;
pub mod obj;
pub mod passes;
pub mod render_target;
pub mod renderer;
pub mod scene;
pub mod shader;
pub mod shading;
pub mod texture;

pub use camera::{Camera, FpsController, Projection};
pub use context::{GpuContext, StaticViewport, ViewportProvider, WindowViewport};
pub use error::{Incompleteness, RenderError};
pub use input::InputState;
pub use lights::{Flashlight, LightAnimator, PointLight, MAX_LIGHTS};
pub use model::{Instance, Model, Transform};
pub use render_target::{RenderTargetDesc, RenderTargetSet, RenderTargetSize};
pub use renderer::{DeferredRenderer, RendererParams};
pub use scene::SceneConfig;
