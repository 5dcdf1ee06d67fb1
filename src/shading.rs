//! Scalar model of the lighting resolve.
//!
//! Every term the lighting shader evaluates per pixel is computed here on the
//! CPU with the same constants, so lighting behaviour can be checked without
//! a GPU and probed from the command line.

use std::f32::consts::PI;

use glam::{Mat4, Vec2, Vec3, Vec4, Vec4Swizzles};

use crate::lights::{Flashlight, PointLight, MAX_LIGHTS};
use crate::renderer::RendererParams;

pub const ATTENUATION_LINEAR: f32 = 0.09;
pub const ATTENUATION_QUADRATIC: f32 = 0.032;
pub const SHININESS: f32 = 32.0;
/// The cone is at full strength inside this fraction of the cutoff angle.
pub const CONE_INNER_RATIO: f32 = 0.9;
pub const MAX_VPLS: usize = 256;
pub const MAX_MARCH_STEPS: u32 = 128;
pub const INDIRECT_EPSILON: f32 = 1e-4;
pub const MIN_GAMMA: f32 = 0.01;

pub fn attenuation(distance: f32) -> f32 {
    1.0 / (1.0 + ATTENUATION_LINEAR * distance + ATTENUATION_QUADRATIC * distance * distance)
}

/// Cosines of the outer (cutoff) and inner (full strength) cone angles.
pub fn cone_cosines(cutoff_degrees: f32) -> (f32, f32) {
    let cutoff = cutoff_degrees.clamp(0.5, 89.5).to_radians();
    (cutoff.cos(), (cutoff * CONE_INNER_RATIO).cos())
}

pub fn spot_cone(flashlight: &Flashlight, world: Vec3) -> f32 {
    let to_point = (world - flashlight.camera.position()).normalize_or_zero();
    let (outer, inner) = cone_cosines(flashlight.cutoff);
    smoothstep(outer, inner, to_point.dot(flashlight.direction()))
}

fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Light-space texture coordinates (v down) and depth, or `None` behind the light.
pub fn light_space(view_proj: Mat4, world: Vec3) -> Option<Vec3> {
    let clip = view_proj * world.extend(1.0);
    if clip.w <= 1e-6 {
        return None;
    }
    let ndc = clip.xyz() / clip.w;
    Some(Vec3::new(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5, ndc.z))
}

pub fn tone_map(color: Vec3) -> Vec3 {
    color / (Vec3::ONE + color)
}

pub fn gamma_correct(color: Vec3, gamma: f32) -> Vec3 {
    color.max(Vec3::ZERO).powf(1.0 / gamma.max(MIN_GAMMA))
}

/// One virtual point light lookup around the shaded point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VplSample {
    /// Offset in units of the sampling radius.
    pub offset: Vec2,
    pub weight: f32,
}

/// Deterministic polar sampling kernel: radius ξ₁, golden-angle rotation, weight ξ₁².
pub fn rsm_kernel(count: usize) -> Vec<VplSample> {
    let golden_angle = PI * (3.0 - 5f32.sqrt());
    (0..count)
        .map(|i| {
            let xi = (i as f32 + 0.5) / count as f32;
            let angle = i as f32 * golden_angle;
            VplSample {
                offset: Vec2::new(xi * angle.cos(), xi * angle.sin()),
                weight: xi * xi,
            }
        })
        .collect()
}

/// Contents of one G-buffer pixel; an uncovered pixel is all zeros.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GBufferTexel {
    pub position: Vec3,
    pub covered: bool,
    pub albedo: Vec3,
    pub specular: f32,
    pub normal: Vec3,
    pub translucency: f32,
}

impl GBufferTexel {
    pub fn surface(position: Vec3, normal: Vec3, albedo: Vec3) -> Self {
        Self {
            position,
            covered: true,
            albedo,
            specular: 0.0,
            normal: normal.normalize_or_zero(),
            translucency: 0.0,
        }
    }

    /// Raw channel value as stored in the render target.
    pub fn channel(&self, index: usize) -> Option<Vec4> {
        if !self.covered {
            return (index < 5).then_some(Vec4::ZERO);
        }
        match index {
            0 => Some(self.position.extend(1.0)),
            1 => Some(self.albedo.extend(1.0)),
            2 => Some(Vec4::new(self.specular, 0.0, 0.0, 1.0)),
            3 => Some(self.normal.extend(0.0)),
            4 => Some(Vec4::new(self.translucency, 0.0, 0.0, 1.0)),
            _ => None,
        }
    }
}

/// Contents of one reflective shadow map texel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RsmTexel {
    pub position: Vec3,
    pub normal: Vec3,
    pub flux: Vec3,
    pub depth: f32,
}

impl RsmTexel {
    /// Raw channel value; index 3 is the depth attachment.
    pub fn channel(&self, index: usize) -> Option<Vec4> {
        match index {
            0 => Some(self.position.extend(1.0)),
            1 => Some(self.normal.extend(0.0)),
            2 => Some(self.flux.extend(1.0)),
            3 => Some(Vec4::new(self.depth, 0.0, 0.0, 1.0)),
            _ => None,
        }
    }
}

/// Reflective shadow map addressed by light-space coordinates.
///
/// Lookups outside `[0, 1]²` and texels nothing was rendered into return
/// `None`: no flux and no occlusion.
pub trait ReflectiveShadowMap {
    fn texel(&self, uv: Vec2) -> Option<RsmTexel>;
}

/// Square RSM held in memory.
#[derive(Debug, Clone)]
pub struct RsmImage {
    resolution: u32,
    texels: Vec<Option<RsmTexel>>,
}

impl RsmImage {
    /// Fills each texel from `render`, evaluated at the texel center.
    pub fn from_fn(resolution: u32, render: impl Fn(Vec2) -> Option<RsmTexel>) -> Self {
        let resolution = resolution.max(1);
        let mut texels = Vec::with_capacity((resolution * resolution) as usize);
        for y in 0..resolution {
            for x in 0..resolution {
                let uv = (Vec2::new(x as f32, y as f32) + 0.5) / resolution as f32;
                texels.push(render(uv));
            }
        }
        Self { resolution, texels }
    }

    pub fn empty(resolution: u32) -> Self {
        Self::from_fn(resolution, |_| None)
    }
}

impl ReflectiveShadowMap for RsmImage {
    fn texel(&self, uv: Vec2) -> Option<RsmTexel> {
        if !(0.0..=1.0).contains(&uv.x) || !(0.0..=1.0).contains(&uv.y) {
            return None;
        }
        let last = self.resolution - 1;
        let x = ((uv.x * self.resolution as f32) as u32).min(last);
        let y = ((uv.y * self.resolution as f32) as u32).min(last);
        self.texels[(y * self.resolution + x) as usize]
    }
}

/// Per-frame inputs of the resolve.
pub struct ShadingContext<'a> {
    pub params: &'a RendererParams,
    pub camera_position: Vec3,
    pub lights: &'a [PointLight],
    pub flashlight: &'a Flashlight,
    light_view_proj: Mat4,
}

impl<'a> ShadingContext<'a> {
    pub fn new(
        params: &'a RendererParams,
        camera_position: Vec3,
        lights: &'a [PointLight],
        flashlight: &'a Flashlight,
    ) -> Self {
        Self {
            params,
            camera_position,
            lights,
            flashlight,
            light_view_proj: flashlight.view_projection(),
        }
    }

    /// 1 when lit by the flashlight, 0 when the shadow map holds something closer.
    pub fn shadow_factor(&self, rsm: &dyn ReflectiveShadowMap, world: Vec3) -> f32 {
        let Some(coords) = light_space(self.light_view_proj, world) else {
            return 1.0;
        };
        if !(0.0..=1.0).contains(&coords.z) {
            return 1.0;
        }
        match rsm.texel(coords.truncate()) {
            Some(texel) if coords.z - self.params.shadow_bias > texel.depth => 0.0,
            _ => 1.0,
        }
    }

    fn light_term(&self, light_position: Vec3, color: Vec3, texel: &GBufferTexel) -> Vec3 {
        let to_light = light_position - texel.position;
        let distance = to_light.length();
        if distance < 1e-4 {
            return Vec3::ZERO;
        }
        let l = to_light / distance;
        let v = (self.camera_position - texel.position).normalize_or_zero();
        let n_dot_l = texel.normal.dot(l);
        let diffuse = n_dot_l.max(0.0) + (n_dot_l.abs() - n_dot_l.max(0.0)) * texel.translucency;
        let specular = if n_dot_l > 0.0 {
            let h = (l + v).normalize_or_zero();
            texel.normal.dot(h).max(0.0).powf(SHININESS) * texel.specular
        } else {
            0.0
        };
        color * (texel.albedo * diffuse + Vec3::splat(specular)) * attenuation(distance)
    }

    /// Point lights plus the cone- and shadow-gated flashlight.
    pub fn direct(&self, rsm: &dyn ReflectiveShadowMap, texel: &GBufferTexel) -> Vec3 {
        let count = self.params.light_count.min(MAX_LIGHTS);
        let mut sum: Vec3 = self
            .lights
            .iter()
            .take(count)
            .map(|light| self.light_term(light.position, light.color, texel))
            .sum();
        let gate = spot_cone(self.flashlight, texel.position)
            * self.shadow_factor(rsm, texel.position);
        if gate > 0.0 {
            sum += self.light_term(self.flashlight.camera.position(), self.flashlight.color, texel)
                * gate;
        }
        sum
    }

    /// One-bounce light gathered from the RSM around the point.
    pub fn indirect(&self, rsm: &dyn ReflectiveShadowMap, world: Vec3, normal: Vec3) -> Vec3 {
        let params = self.params;
        let count = (params.vpl_count as usize).min(MAX_VPLS);
        if !params.indirect_enabled || count == 0 {
            return Vec3::ZERO;
        }
        let Some(center) = light_space(self.light_view_proj, world) else {
            return Vec3::ZERO;
        };
        let mut sum = Vec3::ZERO;
        for sample in rsm_kernel(count) {
            let uv = center.truncate() + sample.offset * params.rsm_radius;
            let Some(vpl) = rsm.texel(uv) else {
                continue;
            };
            let d = world - vpl.position;
            let dist2 = d.length_squared();
            let emitted = vpl.normal.dot(d).max(0.0);
            let received = normal.dot(-d).max(0.0);
            sum += vpl.flux * (emitted * received / (dist2 * dist2 + INDIRECT_EPSILON) * sample.weight);
        }
        sum * params.reflection_factor.max(0.0) / count as f32
    }

    /// Transmittance from the camera to `world` and the light scattered in on the way.
    pub fn fog(&self, world: Vec3) -> (f32, Vec3) {
        let density = self.params.fog_density;
        let to_point = world - self.camera_position;
        let distance = to_point.length();
        if density <= 0.0 || distance <= 0.0 {
            return (1.0, Vec3::ZERO);
        }
        let steps = self.params.march_steps.clamp(1, MAX_MARCH_STEPS);
        let step = distance / steps as f32;
        let direction = to_point / distance;
        let segment = (-density * step).exp();
        let mut transmittance = 1.0;
        let mut inscatter = Vec3::ZERO;
        for i in 0..steps {
            let sample = self.camera_position + direction * ((i as f32 + 0.5) * step);
            let flash_distance = sample.distance(self.flashlight.camera.position());
            let light = self.params.ambient
                + self.flashlight.color
                    * spot_cone(self.flashlight, sample)
                    * attenuation(flash_distance);
            inscatter += light * (transmittance * (1.0 - segment));
            transmittance *= segment;
        }
        (transmittance, inscatter)
    }

    /// Final output color of one pixel, including the debug bypasses.
    pub fn resolve(&self, rsm: &dyn ReflectiveShadowMap, texel: &GBufferTexel, screen_uv: Vec2) -> Vec4 {
        let params = self.params;
        if params.visualize_buffer >= 0 {
            return texel
                .channel(params.visualize_buffer as usize)
                .unwrap_or(Vec4::ZERO);
        }
        if params.visualize_rsm_buffer >= 0 {
            return rsm
                .texel(screen_uv)
                .and_then(|vpl| vpl.channel(params.visualize_rsm_buffer as usize))
                .unwrap_or(Vec4::ZERO);
        }
        if !texel.covered {
            return Vec4::new(0.0, 0.0, 0.0, 1.0);
        }
        let shadow = self.shadow_factor(rsm, texel.position);
        if params.visualize_shadow {
            return Vec4::new(shadow, shadow, shadow, 1.0);
        }

        let direct = if params.visualize_indirect {
            Vec3::ZERO
        } else {
            self.direct(rsm, texel)
        };
        let indirect = self.indirect(rsm, texel.position, texel.normal);
        let (transmittance, inscatter) = self.fog(texel.position);
        let mut color = (params.ambient * texel.albedo + direct + indirect) * transmittance + inscatter;
        if params.tone_mapping {
            color = tone_map(color);
        }
        gamma_correct(color, params.gamma).extend(1.0)
    }
}
