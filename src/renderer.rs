use std::fmt::Debug;

use glam::{Mat4, Vec3};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::camera::{Camera, Projection};
use crate::context::{GpuContext, ViewportProvider};
use crate::error::{RenderError, Result};
use crate::lights::{Flashlight, PointLight, MAX_LIGHTS};
use crate::material::MaterialLayout;
use crate::model::Instance;
use crate::passes::geometry::{self, GeometryStage, GeometryUniform};
use crate::passes::lighting::{LightingStage, LightingUniform};
use crate::passes::shadow::{self, ShadowStage, ShadowUniform, RSM_RESOLUTION};
use crate::passes::TransformStack;
use crate::render_target::RenderTargetSet;
use crate::shading::{MAX_MARCH_STEPS, MAX_VPLS, MIN_GAMMA};

/// Initial transform slots; the stack grows on demand.
const TRANSFORM_CAPACITY: usize = 64;

/// Every tunable of the pipeline. Changes apply on the next `update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererParams {
    pub ambient: Vec3,
    /// Point lights evaluated, capped at `MAX_LIGHTS`.
    pub light_count: usize,
    pub parallax_depth: f32,
    pub gamma: f32,
    pub tone_mapping: bool,
    pub fog_density: f32,
    pub march_steps: u32,
    /// Sampling radius around the receiver, in RSM uv units.
    pub rsm_radius: f32,
    pub vpl_count: u32,
    pub reflection_factor: f32,
    pub indirect_enabled: bool,
    /// Drop the direct term to show only the bounce.
    pub visualize_indirect: bool,
    /// G-buffer channel to show raw, or -1.
    pub visualize_buffer: i32,
    /// RSM channel to show raw (3 is depth), or -1.
    pub visualize_rsm_buffer: i32,
    pub visualize_shadow: bool,
    pub shadow_bias: f32,
}

impl Default for RendererParams {
    fn default() -> Self {
        Self {
            ambient: Vec3::new(0.075, 0.075, 0.125),
            light_count: MAX_LIGHTS,
            parallax_depth: 0.04,
            gamma: 2.2,
            tone_mapping: true,
            fog_density: 0.02,
            march_steps: 16,
            rsm_radius: 0.1,
            vpl_count: 64,
            reflection_factor: 1.0,
            indirect_enabled: true,
            visualize_indirect: false,
            visualize_buffer: -1,
            visualize_rsm_buffer: -1,
            visualize_shadow: false,
            shadow_bias: 0.0005,
        }
    }
}

impl RendererParams {
    /// Copy with every value clamped to the range the shaders support.
    pub fn sanitized(&self) -> Self {
        let defaults = Self::default();
        let mut params = self.clone();
        params.light_count = clamped("light_count", self.light_count, 0, MAX_LIGHTS);
        params.vpl_count = clamped("vpl_count", self.vpl_count, 0, MAX_VPLS as u32);
        params.march_steps = clamped("march_steps", self.march_steps, 1, MAX_MARCH_STEPS);
        params.gamma = clamped_f32("gamma", self.gamma, defaults.gamma, MIN_GAMMA, f32::MAX);
        params.fog_density =
            clamped_f32("fog_density", self.fog_density, defaults.fog_density, 0.0, f32::MAX);
        params.rsm_radius =
            clamped_f32("rsm_radius", self.rsm_radius, defaults.rsm_radius, 0.0, 1.0);
        params.reflection_factor = clamped_f32(
            "reflection_factor",
            self.reflection_factor,
            defaults.reflection_factor,
            0.0,
            f32::MAX,
        );
        params.parallax_depth = clamped_f32(
            "parallax_depth",
            self.parallax_depth,
            defaults.parallax_depth,
            0.0,
            1.0,
        );
        params.shadow_bias =
            clamped_f32("shadow_bias", self.shadow_bias, defaults.shadow_bias, 0.0, 1.0);
        params.ambient = if self.ambient.is_finite() {
            self.ambient.max(Vec3::ZERO)
        } else {
            defaults.ambient
        };
        if params.ambient != self.ambient {
            warn!("ambient {:?} out of range, using {:?}", self.ambient, params.ambient);
        }
        params.visualize_buffer =
            debug_channel("visualize_buffer", self.visualize_buffer, geometry::GBUFFER_FORMATS.len());
        // The depth attachment is the extra RSM channel
        params.visualize_rsm_buffer = debug_channel(
            "visualize_rsm_buffer",
            self.visualize_rsm_buffer,
            shadow::RSM_FORMATS.len() + 1,
        );
        params
    }
}

fn clamped<T: PartialOrd + Copy + Debug>(name: &str, value: T, min: T, max: T) -> T {
    let result = if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    };
    if result != value {
        warn!("{name} {value:?} out of range, clamped to {result:?}");
    }
    result
}

/// Like `clamped`, but NaN and infinities fall back to `default`.
fn clamped_f32(name: &str, value: f32, default: f32, min: f32, max: f32) -> f32 {
    if value.is_finite() {
        clamped(name, value, min, max)
    } else {
        warn!("{name} {value} is not finite, using {default}");
        default
    }
}

fn debug_channel(name: &str, value: i32, channels: usize) -> i32 {
    if value < -1 || value >= channels as i32 {
        warn!("{name} {value} names no channel, shading normally");
        -1
    } else {
        value
    }
}

/// Owns the targets and stages and drives one frame at a time:
/// shadow, then geometry, then lighting.
pub struct DeferredRenderer {
    gbuffer: RenderTargetSet,
    rsm: RenderTargetSet,
    materials: MaterialLayout,
    transforms: TransformStack,
    geometry: GeometryStage,
    shadow: ShadowStage,
    lighting: LightingStage,
    params: RendererParams,
    lights: Vec<PointLight>,
    flashlight: Flashlight,
    projection: Projection,
    slots: Vec<u32>,
    updated: bool,
}

impl DeferredRenderer {
    pub fn new(
        ctx: &GpuContext,
        output_format: wgpu::TextureFormat,
        viewport: &dyn ViewportProvider,
    ) -> Result<Self> {
        let gbuffer = RenderTargetSet::new(ctx, geometry::gbuffer_desc(), viewport)?;
        let rsm = RenderTargetSet::new(ctx, shadow::rsm_desc(RSM_RESOLUTION), viewport)?;
        let materials = MaterialLayout::new(&ctx.device);
        let transforms = TransformStack::new(&ctx.device, TRANSFORM_CAPACITY);
        let geometry = GeometryStage::new(&ctx.device, &transforms, &materials)?;
        let shadow = ShadowStage::new(&ctx.device, &transforms, &materials)?;
        let lighting = LightingStage::new(&ctx.device, output_format)?;
        Ok(Self {
            gbuffer,
            rsm,
            materials,
            transforms,
            geometry,
            shadow,
            lighting,
            params: RendererParams::default(),
            lights: Vec::new(),
            flashlight: Flashlight::default(),
            projection: Projection::default(),
            slots: Vec::new(),
            updated: false,
        })
    }

    /// Layout every material drawn by this renderer must be created with.
    pub fn material_layout(&self) -> &MaterialLayout {
        &self.materials
    }

    pub fn gbuffer(&self) -> &RenderTargetSet {
        &self.gbuffer
    }

    pub fn rsm(&self) -> &RenderTargetSet {
        &self.rsm
    }

    pub fn params(&self) -> &RendererParams {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut RendererParams {
        &mut self.params
    }

    pub fn lights(&self) -> &[PointLight] {
        &self.lights
    }

    pub fn set_lights(&mut self, lights: Vec<PointLight>) {
        self.lights = lights;
    }

    pub fn flashlight(&self) -> &Flashlight {
        &self.flashlight
    }

    pub fn flashlight_mut(&mut self) -> &mut Flashlight {
        &mut self.flashlight
    }

    /// Parameters and flashlight together, for input handlers that edit both.
    pub fn tunables_mut(&mut self) -> (&mut RendererParams, &mut Flashlight) {
        (&mut self.params, &mut self.flashlight)
    }

    pub fn projection_mut(&mut self) -> &mut Projection {
        &mut self.projection
    }

    /// Pipeline switches in the last geometry pass.
    pub fn geometry_pipeline_binds(&self) -> usize {
        self.geometry.pipeline_binds()
    }

    /// Resizes window-tracking targets and uploads camera, light and
    /// parameter uniforms for every stage.
    pub fn update(
        &mut self,
        ctx: &GpuContext,
        camera: &Camera,
        viewport: &dyn ViewportProvider,
    ) -> Result<()> {
        self.gbuffer.update(ctx, viewport)?;
        self.rsm.update(ctx, viewport)?;

        if self.flashlight.follow_camera {
            self.flashlight.camera = *camera;
        }
        self.params = self.params.sanitized();
        let params = &self.params;

        let (width, height) = self.gbuffer.size();
        let aspect = width as f32 / height.max(1) as f32;
        let view_proj: Mat4 = self.projection.matrix(aspect) * camera.view_matrix();
        self.transforms
            .set_view_projections(view_proj, self.flashlight.view_projection());

        self.geometry.write_uniforms(
            &ctx.queue,
            &GeometryUniform::new(camera.position(), params.parallax_depth),
        );
        self.shadow
            .write_uniforms(&ctx.queue, &ShadowUniform::new(&self.flashlight));
        let lighting =
            LightingUniform::new(params, camera.position(), &self.lights, &self.flashlight);
        self.lighting
            .write_uniforms(&ctx.queue, &lighting, params.vpl_count as usize);
        self.updated = true;
        Ok(())
    }

    /// Records and submits one frame into `output`.
    ///
    /// Anything the device rejects while recording or submitting comes back as
    /// `RenderError::Validation`.
    pub fn render_frame(
        &mut self,
        ctx: &GpuContext,
        instances: &[Instance],
        output: &wgpu::TextureView,
    ) -> Result<()> {
        ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame-encoder"),
            });
        let recorded = self.encode_frame(ctx, &mut encoder, instances, output);
        if recorded.is_ok() {
            ctx.queue.submit(std::iter::once(encoder.finish()));
        }
        let rejected = pollster::block_on(ctx.device.pop_error_scope());
        recorded?;
        match rejected {
            Some(err) => Err(RenderError::Validation {
                stage: "frame".to_string(),
                diagnostic: err.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Records the three stages into `encoder` without submitting.
    pub fn encode_frame(
        &mut self,
        ctx: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        instances: &[Instance],
        output: &wgpu::TextureView,
    ) -> Result<()> {
        if !self.updated {
            return Err(RenderError::NotUpdated);
        }

        self.transforms.reset();
        self.slots.clear();
        for instance in instances {
            let slot = self.transforms.set_model_matrix(instance.transform);
            self.slots.push(slot);
        }
        self.transforms.upload(&ctx.device, &ctx.queue);
        debug!(
            "recording frame with {} instances ({} transform slots)",
            instances.len(),
            self.transforms.len()
        );

        let mut pass = self.shadow.begin_stage(encoder, &self.rsm);
        self.shadow
            .draw(&mut pass, &self.transforms, instances, &self.slots);
        self.shadow.end_stage(pass);

        let mut pass = self.geometry.begin_stage(encoder, &self.gbuffer);
        self.geometry
            .draw(&mut pass, &self.transforms, instances, &self.slots);
        self.geometry.end_stage(pass);

        self.lighting
            .do_stage(&ctx.device, encoder, &self.gbuffer, &self.rsm, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_already_sane() {
        let params = RendererParams::default();
        assert_eq!(params.sanitized(), params);
        assert_eq!(params.ambient, Vec3::new(0.075, 0.075, 0.125));
        assert_eq!(params.visualize_buffer, -1);
    }

    #[test]
    fn sanitizing_clamps_to_shader_limits() {
        let params = RendererParams {
            light_count: 1000,
            vpl_count: 10_000,
            march_steps: 0,
            gamma: 0.0,
            fog_density: -1.0,
            reflection_factor: -2.0,
            ambient: Vec3::new(-1.0, 0.5, 0.5),
            ..RendererParams::default()
        }
        .sanitized();
        assert_eq!(params.light_count, MAX_LIGHTS);
        assert_eq!(params.vpl_count, MAX_VPLS as u32);
        assert_eq!(params.march_steps, 1);
        assert_eq!(params.gamma, MIN_GAMMA);
        assert_eq!(params.fog_density, 0.0);
        assert_eq!(params.reflection_factor, 0.0);
        assert_eq!(params.ambient, Vec3::new(0.0, 0.5, 0.5));
    }

    #[test]
    fn non_finite_values_fall_back_to_defaults() {
        let defaults = RendererParams::default();
        let params = RendererParams {
            gamma: f32::NAN,
            rsm_radius: f32::NAN,
            fog_density: f32::INFINITY,
            shadow_bias: f32::NEG_INFINITY,
            ambient: Vec3::new(f32::NAN, 0.5, 0.5),
            ..RendererParams::default()
        }
        .sanitized();
        assert_eq!(params.gamma, defaults.gamma);
        assert_eq!(params.rsm_radius, defaults.rsm_radius);
        assert_eq!(params.fog_density, defaults.fog_density);
        assert_eq!(params.shadow_bias, defaults.shadow_bias);
        assert_eq!(params.ambient, defaults.ambient);
    }

    #[test]
    fn unknown_debug_channels_fall_back_to_shading() {
        let params = RendererParams {
            visualize_buffer: 5,
            visualize_rsm_buffer: 3,
            ..RendererParams::default()
        }
        .sanitized();
        assert_eq!(params.visualize_buffer, -1);
        assert_eq!(params.visualize_rsm_buffer, 3);
    }
}
