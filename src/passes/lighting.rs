use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use log::debug;

use super::{geometry, shadow};
use crate::error::{Incompleteness, RenderError, Result};
use crate::lights::{Flashlight, PointLight, MAX_LIGHTS};
use crate::mesh::ScreenQuad;
use crate::render_target::RenderTargetSet;
use crate::renderer::RendererParams;
use crate::shader::{self, UniformBuffer};
use crate::shading::{self, MAX_VPLS};

/// Texture bindings of the resolve, in binding order.
///
/// 0..=4 are the G-buffer channels, then RSM position (5), normal (6),
/// flux (7) and the RSM depth (8).
pub const GBUFFER_BINDINGS: [u32; 5] = [0, 1, 2, 3, 4];
pub const RSM_POSITION_BINDING: u32 = 5;
pub const RSM_NORMAL_BINDING: u32 = 6;
pub const RSM_FLUX_BINDING: u32 = 7;
pub const RSM_DEPTH_BINDING: u32 = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct PointLightUniform {
    pub position: [f32; 4],
    pub color: [f32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct LightingUniform {
    pub camera_position: [f32; 4],
    pub ambient: [f32; 4],
    pub flashlight_position: [f32; 4],
    pub flashlight_direction: [f32; 4],
    pub flashlight_color: [f32; 4],
    pub light_view_proj: [[f32; 4]; 4],
    /// Outer cosine, inner cosine, shadow bias.
    pub cone: [f32; 4],
    /// Density, march steps.
    pub fog: [f32; 4],
    /// Sampling radius, VPL count, reflection factor, enabled.
    pub rsm: [f32; 4],
    /// Gamma, tone mapping.
    pub tone: [f32; 4],
    /// G-buffer channel, RSM channel, shadow, indirect only.
    pub debug: [i32; 4],
    pub light_count: [u32; 4],
    pub lights: [PointLightUniform; MAX_LIGHTS],
}

impl LightingUniform {
    pub fn new(
        params: &RendererParams,
        camera_position: Vec3,
        lights: &[PointLight],
        flashlight: &Flashlight,
    ) -> Self {
        let (outer, inner) = shading::cone_cosines(flashlight.cutoff);
        let count = params.light_count.min(lights.len()).min(MAX_LIGHTS);
        let mut uniform = Self::zeroed();
        for (slot, light) in uniform.lights.iter_mut().zip(&lights[..count]) {
            *slot = PointLightUniform {
                position: light.position.extend(1.0).into(),
                color: light.color.extend(1.0).into(),
            };
        }
        let flag = |value: bool| if value { 1.0 } else { 0.0 };
        uniform.camera_position = camera_position.extend(1.0).into();
        uniform.ambient = params.ambient.extend(1.0).into();
        uniform.flashlight_position = flashlight.camera.position().extend(1.0).into();
        uniform.flashlight_direction = flashlight.direction().extend(0.0).into();
        uniform.flashlight_color = flashlight.color.extend(1.0).into();
        uniform.light_view_proj = flashlight.view_projection().to_cols_array_2d();
        uniform.cone = [outer, inner, params.shadow_bias, 0.0];
        uniform.fog = [params.fog_density, params.march_steps as f32, 0.0, 0.0];
        uniform.rsm = [
            params.rsm_radius,
            params.vpl_count as f32,
            params.reflection_factor,
            flag(params.indirect_enabled),
        ];
        uniform.tone = [params.gamma, flag(params.tone_mapping), 0.0, 0.0];
        uniform.debug = [
            params.visualize_buffer,
            params.visualize_rsm_buffer,
            params.visualize_shadow as i32,
            params.visualize_indirect as i32,
        ];
        uniform.light_count = [count as u32, 0, 0, 0];
        uniform
    }
}

/// RSM sampling pattern; `xy` offset in radius units, `z` weight.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct KernelUniform {
    pub samples: [[f32; 4]; MAX_VPLS],
}

impl KernelUniform {
    pub fn new(count: usize) -> Self {
        let mut uniform = Self::zeroed();
        for (slot, sample) in uniform
            .samples
            .iter_mut()
            .zip(shading::rsm_kernel(count.min(MAX_VPLS)))
        {
            *slot = [sample.offset.x, sample.offset.y, sample.weight, 0.0];
        }
        uniform
    }
}

struct BoundTargets {
    gbuffer_generation: u64,
    rsm_generation: u64,
    bind_group: wgpu::BindGroup,
}

/// Full-screen resolve of the G-buffer and RSM into the output view.
pub struct LightingStage {
    pipeline: wgpu::RenderPipeline,
    texture_layout: wgpu::BindGroupLayout,
    uniforms: UniformBuffer<LightingUniform>,
    kernel: UniformBuffer<KernelUniform>,
    kernel_count: Option<usize>,
    uniform_bind_group: wgpu::BindGroup,
    targets: Option<BoundTargets>,
    quad: ScreenQuad,
}

impl LightingStage {
    pub fn new(device: &wgpu::Device, output_format: wgpu::TextureFormat) -> Result<Self> {
        let color_entry = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: false },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        };
        let mut entries: Vec<_> = GBUFFER_BINDINGS
            .iter()
            .chain(&[RSM_POSITION_BINDING, RSM_NORMAL_BINDING, RSM_FLUX_BINDING])
            .map(|&binding| color_entry(binding))
            .collect();
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: RSM_DEPTH_BINDING,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Depth,
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        });
        let texture_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("lighting-texture-layout"),
            entries: &entries,
        });

        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("lighting-uniform-layout"),
            entries: &[
                UniformBuffer::<LightingUniform>::layout_entry(0, wgpu::ShaderStages::FRAGMENT),
                UniformBuffer::<KernelUniform>::layout_entry(1, wgpu::ShaderStages::FRAGMENT),
            ],
        });
        let uniforms = UniformBuffer::new(device, "lighting-uniforms", &LightingUniform::zeroed());
        let kernel = UniformBuffer::new(device, "rsm-kernel", &KernelUniform::zeroed());
        let uniform_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("lighting-uniforms"),
            layout: &uniform_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniforms.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: kernel.binding(),
                },
            ],
        });

        let module = shader::compile(device, "lighting", &shader_source())?;
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("lighting-pipeline-layout"),
            bind_group_layouts: &[&texture_layout, &uniform_layout],
            push_constant_ranges: &[],
        });
        let pipeline = shader::validated(device, "lighting", || {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("lighting-pipeline"),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: &module,
                    entry_point: Some("vs_main"),
                    compilation_options: Default::default(),
                    buffers: &[ScreenQuad::LAYOUT],
                },
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    cull_mode: None,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                fragment: Some(wgpu::FragmentState {
                    module: &module,
                    entry_point: Some("fs_main"),
                    compilation_options: Default::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: output_format,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                multiview: None,
                cache: None,
            })
        })?;

        Ok(Self {
            pipeline,
            texture_layout,
            uniforms,
            kernel,
            kernel_count: None,
            uniform_bind_group,
            targets: None,
            quad: ScreenQuad::new(device),
        })
    }

    pub fn write_uniforms(&mut self, queue: &wgpu::Queue, uniform: &LightingUniform, vpl_count: usize) {
        self.uniforms.write(queue, uniform);
        if self.kernel_count != Some(vpl_count) {
            debug!("rebuilding RSM kernel for {vpl_count} samples");
            self.kernel.write(queue, &KernelUniform::new(vpl_count));
            self.kernel_count = Some(vpl_count);
        }
    }

    /// Rebuilds the texture bind group when either target set was reallocated.
    fn bind_targets(
        &mut self,
        device: &wgpu::Device,
        gbuffer: &RenderTargetSet,
        rsm: &RenderTargetSet,
    ) -> Result<()> {
        let current = (gbuffer.generation(), rsm.generation());
        if let Some(bound) = &self.targets {
            if (bound.gbuffer_generation, bound.rsm_generation) == current {
                return Ok(());
            }
        }

        let missing = |set: &RenderTargetSet| RenderError::IncompleteFramebuffer {
            label: set.label().to_string(),
            reason: Incompleteness::MissingAttachment,
        };
        let mut views = Vec::with_capacity(9);
        for channel in 0..geometry::GBUFFER_FORMATS.len() {
            views.push(gbuffer.view(channel).ok_or_else(|| missing(gbuffer))?);
        }
        for channel in [
            shadow::POSITION_CHANNEL,
            shadow::NORMAL_CHANNEL,
            shadow::FLUX_CHANNEL,
        ] {
            views.push(rsm.view(channel).ok_or_else(|| missing(rsm))?);
        }
        views.push(rsm.depth_view().ok_or_else(|| missing(rsm))?);

        let entries: Vec<_> = views
            .into_iter()
            .enumerate()
            .map(|(binding, view)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: wgpu::BindingResource::TextureView(view),
            })
            .collect();
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("lighting-targets"),
            layout: &self.texture_layout,
            entries: &entries,
        });
        debug!(
            "lighting inputs rebound (gbuffer generation {}, rsm generation {})",
            current.0, current.1
        );
        self.targets = Some(BoundTargets {
            gbuffer_generation: current.0,
            rsm_generation: current.1,
            bind_group,
        });
        Ok(())
    }

    /// Resolves into `output`, clearing it first.
    pub fn do_stage(
        &mut self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        gbuffer: &RenderTargetSet,
        rsm: &RenderTargetSet,
        output: &wgpu::TextureView,
    ) -> Result<()> {
        self.bind_targets(device, gbuffer, rsm)?;
        let Some(targets) = &self.targets else {
            return Ok(());
        };
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("lighting-pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: output,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &targets.bind_group, &[]);
        pass.set_bind_group(1, &self.uniform_bind_group, &[]);
        self.quad.draw(&mut pass);
        Ok(())
    }
}

/// Resolve shader with the shared shading constants prepended.
pub fn shader_source() -> String {
    format!(
        "const MAX_LIGHTS: u32 = {}u;\n\
         const MAX_VPLS: u32 = {}u;\n\
         const MAX_MARCH_STEPS: u32 = {}u;\n\
         const ATTENUATION_LINEAR: f32 = {:?};\n\
         const ATTENUATION_QUADRATIC: f32 = {:?};\n\
         const SHININESS: f32 = {:?};\n\
         const INDIRECT_EPSILON: f32 = {:?};\n\
         const MIN_GAMMA: f32 = {:?};\n{}",
        MAX_LIGHTS,
        MAX_VPLS,
        shading::MAX_MARCH_STEPS,
        shading::ATTENUATION_LINEAR,
        shading::ATTENUATION_QUADRATIC,
        shading::SHININESS,
        shading::INDIRECT_EPSILON,
        shading::MIN_GAMMA,
        SHADER
    )
}

const SHADER: &str = r#"
struct PointLight {
    position: vec4<f32>,
    color: vec4<f32>,
}

struct Lighting {
    camera_position: vec4<f32>,
    ambient: vec4<f32>,
    flashlight_position: vec4<f32>,
    flashlight_direction: vec4<f32>,
    flashlight_color: vec4<f32>,
    light_view_proj: mat4x4<f32>,
    cone: vec4<f32>,
    fog: vec4<f32>,
    rsm: vec4<f32>,
    tone: vec4<f32>,
    debug: vec4<i32>,
    light_count: vec4<u32>,
    lights: array<PointLight, 32>,
}

struct Kernel {
    samples: array<vec4<f32>, 256>,
}

struct Surface {
    position: vec3<f32>,
    albedo: vec3<f32>,
    specular: f32,
    normal: vec3<f32>,
    translucency: f32,
    view_dir: vec3<f32>,
}

@group(0) @binding(0) var g_position: texture_2d<f32>;
@group(0) @binding(1) var g_albedo: texture_2d<f32>;
@group(0) @binding(2) var g_specular: texture_2d<f32>;
@group(0) @binding(3) var g_normal: texture_2d<f32>;
@group(0) @binding(4) var g_translucency: texture_2d<f32>;
@group(0) @binding(5) var rsm_position: texture_2d<f32>;
@group(0) @binding(6) var rsm_normal: texture_2d<f32>;
@group(0) @binding(7) var rsm_flux: texture_2d<f32>;
@group(0) @binding(8) var rsm_depth: texture_depth_2d;

@group(1) @binding(0) var<uniform> lighting: Lighting;
@group(1) @binding(1) var<uniform> vpl_kernel: Kernel;

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
}

@vertex
fn vs_main(@location(0) position: vec2<f32>) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = vec4<f32>(position, 0.0, 1.0);
    return out;
}

fn safe_normalize(v: vec3<f32>) -> vec3<f32> {
    let len = length(v);
    if (len <= 1e-8) {
        return vec3<f32>(0.0);
    }
    return v / len;
}

fn attenuation(dist: f32) -> f32 {
    return 1.0 / (1.0 + ATTENUATION_LINEAR * dist + ATTENUATION_QUADRATIC * dist * dist);
}

// xy: light-space uv with v down, z: depth, w: 0 behind the light
fn light_space(world: vec3<f32>) -> vec4<f32> {
    let clip = lighting.light_view_proj * vec4<f32>(world, 1.0);
    if (clip.w <= 1e-6) {
        return vec4<f32>(0.0);
    }
    let ndc = clip.xyz / clip.w;
    return vec4<f32>(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5, ndc.z, 1.0);
}

fn inside_unit(uv: vec2<f32>) -> bool {
    return all(uv >= vec2<f32>(0.0)) && all(uv <= vec2<f32>(1.0));
}

fn rsm_texel(uv: vec2<f32>) -> vec2<i32> {
    let size = textureDimensions(rsm_depth);
    return vec2<i32>(min(vec2<u32>(uv * vec2<f32>(size)), size - vec2<u32>(1u)));
}

fn load_gbuffer(channel: i32, pixel: vec2<i32>) -> vec4<f32> {
    var value = vec4<f32>(0.0);
    switch channel {
        case 0: { value = textureLoad(g_position, pixel, 0); }
        case 1: { value = textureLoad(g_albedo, pixel, 0); }
        case 2: { value = textureLoad(g_specular, pixel, 0); }
        case 3: { value = textureLoad(g_normal, pixel, 0); }
        case 4: { value = textureLoad(g_translucency, pixel, 0); }
        default: {}
    }
    return value;
}

fn load_rsm(channel: i32, uv: vec2<f32>) -> vec4<f32> {
    let texel = rsm_texel(uv);
    var value = vec4<f32>(0.0);
    switch channel {
        case 0: { value = textureLoad(rsm_position, texel, 0); }
        case 1: { value = textureLoad(rsm_normal, texel, 0); }
        case 2: { value = textureLoad(rsm_flux, texel, 0); }
        case 3: { value = vec4<f32>(textureLoad(rsm_depth, texel, 0), 0.0, 0.0, 1.0); }
        default: {}
    }
    return value;
}

fn shadow_factor(world: vec3<f32>) -> f32 {
    let coords = light_space(world);
    if (coords.w == 0.0 || coords.z < 0.0 || coords.z > 1.0 || !inside_unit(coords.xy)) {
        return 1.0;
    }
    let stored = textureLoad(rsm_depth, rsm_texel(coords.xy), 0);
    return select(1.0, 0.0, coords.z - lighting.cone.z > stored);
}

fn spot_cone(world: vec3<f32>) -> f32 {
    let to_point = safe_normalize(world - lighting.flashlight_position.xyz);
    return smoothstep(lighting.cone.x, lighting.cone.y, dot(to_point, lighting.flashlight_direction.xyz));
}

fn light_term(light_position: vec3<f32>, color: vec3<f32>, s: Surface) -> vec3<f32> {
    let to_light = light_position - s.position;
    let dist = length(to_light);
    if (dist < 1e-4) {
        return vec3<f32>(0.0);
    }
    let l = to_light / dist;
    let n_dot_l = dot(s.normal, l);
    let diffuse = mix(max(n_dot_l, 0.0), abs(n_dot_l), s.translucency);
    var specular = 0.0;
    if (n_dot_l > 0.0) {
        let h = safe_normalize(l + s.view_dir);
        specular = pow(max(dot(s.normal, h), 0.0), SHININESS) * s.specular;
    }
    return color * (s.albedo * diffuse + vec3<f32>(specular)) * attenuation(dist);
}

fn indirect_light(world: vec3<f32>, normal: vec3<f32>) -> vec3<f32> {
    let count = min(u32(lighting.rsm.y), MAX_VPLS);
    if (lighting.rsm.w < 0.5 || count == 0u) {
        return vec3<f32>(0.0);
    }
    let center = light_space(world);
    if (center.w == 0.0) {
        return vec3<f32>(0.0);
    }
    var sum = vec3<f32>(0.0);
    for (var i = 0u; i < count; i = i + 1u) {
        let vpl = vpl_kernel.samples[i];
        let uv = center.xy + vpl.xy * lighting.rsm.x;
        if (!inside_unit(uv)) {
            continue;
        }
        let texel = rsm_texel(uv);
        let vpl_position = textureLoad(rsm_position, texel, 0);
        if (vpl_position.w == 0.0) {
            continue;
        }
        let vpl_normal = textureLoad(rsm_normal, texel, 0).xyz;
        let flux = textureLoad(rsm_flux, texel, 0).rgb;
        let d = world - vpl_position.xyz;
        let dist2 = dot(d, d);
        let emitted = max(dot(vpl_normal, d), 0.0);
        let received = max(dot(normal, -d), 0.0);
        sum += flux * (emitted * received / (dist2 * dist2 + INDIRECT_EPSILON) * vpl.z);
    }
    return sum * max(lighting.rsm.z, 0.0) / f32(count);
}

// rgb: in-scattered light, a: transmittance
fn fog(world: vec3<f32>) -> vec4<f32> {
    let density = lighting.fog.x;
    let to_point = world - lighting.camera_position.xyz;
    let dist = length(to_point);
    if (density <= 0.0 || dist <= 0.0) {
        return vec4<f32>(0.0, 0.0, 0.0, 1.0);
    }
    let steps = clamp(u32(lighting.fog.y), 1u, MAX_MARCH_STEPS);
    let step_length = dist / f32(steps);
    let direction = to_point / dist;
    let segment = exp(-density * step_length);
    var transmittance = 1.0;
    var inscatter = vec3<f32>(0.0);
    for (var i = 0u; i < steps; i = i + 1u) {
        let p = lighting.camera_position.xyz + direction * ((f32(i) + 0.5) * step_length);
        let flash = lighting.flashlight_color.rgb * spot_cone(p)
            * attenuation(length(p - lighting.flashlight_position.xyz));
        inscatter += (lighting.ambient.rgb + flash) * (transmittance * (1.0 - segment));
        transmittance *= segment;
    }
    return vec4<f32>(inscatter, transmittance);
}

@fragment
fn fs_main(@builtin(position) frag_coord: vec4<f32>) -> @location(0) vec4<f32> {
    let pixel = vec2<i32>(frag_coord.xy);
    if (lighting.debug.x >= 0) {
        return load_gbuffer(lighting.debug.x, pixel);
    }
    if (lighting.debug.y >= 0) {
        let screen = vec2<f32>(textureDimensions(g_position));
        return load_rsm(lighting.debug.y, frag_coord.xy / screen);
    }

    let position = textureLoad(g_position, pixel, 0);
    if (position.w == 0.0) {
        return vec4<f32>(0.0, 0.0, 0.0, 1.0);
    }
    var s: Surface;
    s.position = position.xyz;
    s.albedo = textureLoad(g_albedo, pixel, 0).rgb;
    s.specular = textureLoad(g_specular, pixel, 0).r;
    s.normal = safe_normalize(textureLoad(g_normal, pixel, 0).xyz);
    s.translucency = textureLoad(g_translucency, pixel, 0).r;
    s.view_dir = safe_normalize(lighting.camera_position.xyz - s.position);

    let shadow = shadow_factor(s.position);
    if (lighting.debug.z != 0) {
        return vec4<f32>(vec3<f32>(shadow), 1.0);
    }

    var direct = vec3<f32>(0.0);
    if (lighting.debug.w == 0) {
        let count = min(lighting.light_count.x, MAX_LIGHTS);
        for (var i = 0u; i < count; i = i + 1u) {
            let light = lighting.lights[i];
            direct += light_term(light.position.xyz, light.color.rgb, s);
        }
        let gate = spot_cone(s.position) * shadow;
        if (gate > 0.0) {
            direct += light_term(lighting.flashlight_position.xyz, lighting.flashlight_color.rgb, s) * gate;
        }
    }
    let indirect = indirect_light(s.position, s.normal);
    let medium = fog(s.position);

    var color = (lighting.ambient.rgb * s.albedo + direct + indirect) * medium.a + medium.rgb;
    if (lighting.tone.y > 0.5) {
        color = color / (vec3<f32>(1.0) + color);
    }
    color = pow(max(color, vec3<f32>(0.0)), vec3<f32>(1.0 / max(lighting.tone.x, MIN_GAMMA)));
    return vec4<f32>(color, 1.0);
}
"#;
