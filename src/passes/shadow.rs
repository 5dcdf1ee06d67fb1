use bytemuck::{Pod, Zeroable};

use super::{draw_instances, SceneProgram, ScenePipelines, TransformStack, FRAME_GROUP};
use crate::error::Result;
use crate::lights::Flashlight;
use crate::material::MaterialLayout;
use crate::model::Instance;
use crate::render_target::{RenderTargetDesc, RenderTargetSize, RenderTargetSet};
use crate::shader::UniformBuffer;

/// Resolution of the reflective shadow map.
pub const RSM_RESOLUTION: u32 = 1024;

/// Channel order of the RSM: world position, world normal, reflected flux.
pub const RSM_FORMATS: [wgpu::TextureFormat; 3] = [wgpu::TextureFormat::Rgba16Float; 3];

pub const POSITION_CHANNEL: usize = 0;
pub const NORMAL_CHANNEL: usize = 1;
pub const FLUX_CHANNEL: usize = 2;

pub fn rsm_desc(resolution: u32) -> RenderTargetDesc {
    RenderTargetDesc {
        label: "rsm".to_string(),
        color_formats: RSM_FORMATS.to_vec(),
        include_depth_stencil: true,
        size: RenderTargetSize::Fixed(resolution, resolution),
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ShadowUniform {
    pub light_position: [f32; 4],
    pub light_color: [f32; 4],
}

impl ShadowUniform {
    pub fn new(flashlight: &Flashlight) -> Self {
        Self {
            light_position: flashlight.camera.position().extend(1.0).into(),
            light_color: flashlight.color.extend(1.0).into(),
        }
    }
}

/// Renders the scene from the flashlight into the RSM and its depth buffer.
pub struct ShadowStage {
    pipelines: ScenePipelines,
    uniforms: UniformBuffer<ShadowUniform>,
    frame_bind_group: wgpu::BindGroup,
}

impl ShadowStage {
    pub fn new(
        device: &wgpu::Device,
        transforms: &TransformStack,
        materials: &MaterialLayout,
    ) -> Result<Self> {
        let frame_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("shadow-frame-layout"),
            entries: &[UniformBuffer::<ShadowUniform>::layout_entry(
                0,
                wgpu::ShaderStages::FRAGMENT,
            )],
        });
        let uniforms = UniformBuffer::new(
            device,
            "shadow-uniforms",
            &ShadowUniform::new(&Flashlight::default()),
        );
        let frame_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("shadow-frame"),
            layout: &frame_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: uniforms.binding(),
            }],
        });
        let targets: Vec<Option<wgpu::ColorTargetState>> = RSM_FORMATS
            .iter()
            .map(|&format| Some(format.into()))
            .collect();
        let source = shader_source();
        let pipelines = ScenePipelines::new(
            device,
            &SceneProgram {
                name: "shadow",
                source: &source,
                frame_layout: &frame_layout,
                transform_layout: transforms.layout(),
                material_layout: materials,
                targets: &targets,
            },
        )?;
        Ok(Self {
            pipelines,
            uniforms,
            frame_bind_group,
        })
    }

    pub fn write_uniforms(&self, queue: &wgpu::Queue, uniform: &ShadowUniform) {
        self.uniforms.write(queue, uniform);
    }

    /// Opens the RSM pass; cleared texels read back as "nothing here".
    pub fn begin_stage<'e>(
        &mut self,
        encoder: &'e mut wgpu::CommandEncoder,
        rsm: &RenderTargetSet,
    ) -> wgpu::RenderPass<'e> {
        self.pipelines.begin();
        let mut pass = rsm.begin_pass(encoder, wgpu::Color::TRANSPARENT);
        pass.set_bind_group(FRAME_GROUP, &self.frame_bind_group, &[]);
        pass
    }

    pub fn draw(
        &mut self,
        pass: &mut wgpu::RenderPass<'_>,
        transforms: &TransformStack,
        instances: &[Instance],
        slots: &[u32],
    ) {
        draw_instances(pass, &mut self.pipelines, transforms, instances, slots);
    }

    pub fn end_stage(&mut self, pass: wgpu::RenderPass<'_>) {
        drop(pass);
    }
}

pub fn shader_source() -> String {
    format!("{}{}{}", super::TRANSFORM_WGSL, super::MATERIAL_WGSL, SHADER)
}

const SHADER: &str = r#"
struct Light {
    position: vec4<f32>,
    color: vec4<f32>,
}

@group(0) @binding(0)
var<uniform> light: Light;

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) color: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) normal: vec3<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_pos: vec3<f32>,
    @location(1) color: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) normal: vec3<f32>,
}

struct RsmOutput {
    @location(0) position: vec4<f32>,
    @location(1) normal: vec4<f32>,
    @location(2) flux: vec4<f32>,
}

@vertex
fn vs_main(input: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    let normal_matrix = mat3x3<f32>(
        transform.normal[0].xyz,
        transform.normal[1].xyz,
        transform.normal[2].xyz
    );
    out.clip_position = transform.light_mvp * vec4<f32>(input.position, 1.0);
    out.world_pos = (transform.model * vec4<f32>(input.position, 1.0)).xyz;
    out.color = input.color;
    out.uv = input.uv;
    out.normal = normal_matrix * input.normal;
    return out;
}

@fragment
fn fs_main(input: VertexOutput, @builtin(front_facing) front_facing: bool) -> RsmOutput {
    let albedo = textureSample(diffuse_texture, material_sampler, input.uv);
    if (albedo.a < 0.5) {
        discard;
    }
    var n = normalize(input.normal);
    if (!front_facing) {
        n = -n;
    }
    let to_light = normalize(light.position.xyz - input.world_pos);
    let flux = light.color.rgb * albedo.rgb * input.color * max(dot(n, to_light), 0.0);

    var out: RsmOutput;
    out.position = vec4<f32>(input.world_pos, 1.0);
    out.normal = vec4<f32>(n, 0.0);
    out.flux = vec4<f32>(flux, 1.0);
    return out;
}
"#;
