use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use super::{draw_instances, SceneProgram, ScenePipelines, TransformStack, FRAME_GROUP};
use crate::error::Result;
use crate::material::MaterialLayout;
use crate::model::Instance;
use crate::render_target::{RenderTargetDesc, RenderTargetSize, RenderTargetSet};
use crate::shader::UniformBuffer;

/// Channel order of the G-buffer: position, albedo, specular, normal, translucency.
pub const GBUFFER_FORMATS: [wgpu::TextureFormat; 5] = [
    wgpu::TextureFormat::Rgba16Float,
    wgpu::TextureFormat::Rgba8UnormSrgb,
    wgpu::TextureFormat::R8Unorm,
    wgpu::TextureFormat::Rgba16Float,
    wgpu::TextureFormat::R8Unorm,
];

pub const POSITION_CHANNEL: usize = 0;
pub const ALBEDO_CHANNEL: usize = 1;
pub const SPECULAR_CHANNEL: usize = 2;
pub const NORMAL_CHANNEL: usize = 3;
pub const TRANSLUCENCY_CHANNEL: usize = 4;

pub fn gbuffer_desc() -> RenderTargetDesc {
    RenderTargetDesc {
        label: "gbuffer".to_string(),
        color_formats: GBUFFER_FORMATS.to_vec(),
        include_depth_stencil: true,
        size: RenderTargetSize::TrackWindow,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GeometryUniform {
    pub camera_position: [f32; 4],
    /// x: parallax depth scale.
    pub params: [f32; 4],
}

impl GeometryUniform {
    pub fn new(camera_position: Vec3, parallax_depth: f32) -> Self {
        Self {
            camera_position: camera_position.extend(1.0).into(),
            params: [parallax_depth, 0.0, 0.0, 0.0],
        }
    }
}

/// Rasterizes the scene from the main camera into the G-buffer.
pub struct GeometryStage {
    pipelines: ScenePipelines,
    uniforms: UniformBuffer<GeometryUniform>,
    frame_bind_group: wgpu::BindGroup,
}

impl GeometryStage {
    pub fn new(
        device: &wgpu::Device,
        transforms: &TransformStack,
        materials: &MaterialLayout,
    ) -> Result<Self> {
        let frame_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("geometry-frame-layout"),
            entries: &[UniformBuffer::<GeometryUniform>::layout_entry(
                0,
                wgpu::ShaderStages::VERTEX_FRAGMENT,
            )],
        });
        let uniforms = UniformBuffer::new(
            device,
            "geometry-uniforms",
            &GeometryUniform::new(Vec3::ZERO, 0.0),
        );
        let frame_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("geometry-frame"),
            layout: &frame_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: uniforms.binding(),
            }],
        });
        let targets: Vec<_> = GBUFFER_FORMATS
            .iter()
            .map(|&format| {
                Some(wgpu::ColorTargetState {
                    format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();
        let source = shader_source();
        let pipelines = ScenePipelines::new(
            device,
            &SceneProgram {
                name: "geometry",
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

    pub fn write_uniforms(&self, queue: &wgpu::Queue, uniform: &GeometryUniform) {
        self.uniforms.write(queue, uniform);
    }

    /// Opens the G-buffer pass with every channel and depth cleared.
    pub fn begin_stage<'e>(
        &mut self,
        encoder: &'e mut wgpu::CommandEncoder,
        gbuffer: &RenderTargetSet,
    ) -> wgpu::RenderPass<'e> {
        self.pipelines.begin();
        let mut pass = gbuffer.begin_pass(encoder, wgpu::Color::TRANSPARENT);
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

    /// Pipeline switches issued in the last recorded pass.
    pub fn pipeline_binds(&self) -> usize {
        self.pipelines.binds()
    }
}

pub fn shader_source() -> String {
    format!("{}{}{}", super::TRANSFORM_WGSL, super::MATERIAL_WGSL, SHADER)
}

const SHADER: &str = r#"
struct Frame {
    camera_position: vec4<f32>,
    params: vec4<f32>,
}

@group(0) @binding(0)
var<uniform> frame: Frame;

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) color: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) normal: vec3<f32>,
    @location(4) tangent: vec3<f32>,
    @location(5) bitangent: vec3<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_pos: vec3<f32>,
    @location(1) color: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) normal: vec3<f32>,
    @location(4) tangent: vec3<f32>,
    @location(5) bitangent: vec3<f32>,
}

struct GBufferOutput {
    @location(0) position: vec4<f32>,
    @location(1) albedo: vec4<f32>,
    @location(2) specular: vec4<f32>,
    @location(3) normal: vec4<f32>,
    @location(4) translucency: vec4<f32>,
}

@vertex
fn vs_main(input: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    let world_position = transform.model * vec4<f32>(input.position, 1.0);
    let normal_matrix = mat3x3<f32>(
        transform.normal[0].xyz,
        transform.normal[1].xyz,
        transform.normal[2].xyz
    );
    let model_matrix = mat3x3<f32>(
        transform.model[0].xyz,
        transform.model[1].xyz,
        transform.model[2].xyz
    );
    out.clip_position = transform.mvp * vec4<f32>(input.position, 1.0);
    out.world_pos = world_position.xyz;
    out.color = input.color;
    out.uv = input.uv;
    out.normal = normal_matrix * input.normal;
    out.tangent = model_matrix * input.tangent;
    out.bitangent = model_matrix * input.bitangent;
    return out;
}

@fragment
fn fs_main(input: VertexOutput, @builtin(front_facing) front_facing: bool) -> GBufferOutput {
    var n = normalize(input.normal);
    var t = normalize(input.tangent);
    var b = normalize(input.bitangent);
    if (!front_facing) {
        n = -n;
        t = -t;
        b = -b;
    }
    let tbn = mat3x3<f32>(t, b, n);

    // Parallax: shift the lookup towards the viewer in proportion to height
    let to_eye = normalize(frame.camera_position.xyz - input.world_pos);
    let view_ts = transpose(tbn) * to_eye;
    let height = textureSample(bump_texture, material_sampler, input.uv).r;
    let uv = input.uv + view_ts.xy / max(view_ts.z, 0.1) * (height * frame.params.x);

    let albedo = textureSample(diffuse_texture, material_sampler, uv);
    let specular = textureSample(specular_texture, material_sampler, uv).r;
    let mapped = textureSample(normal_texture, material_sampler, uv).xyz * 2.0 - 1.0;
    let mask = textureSample(translucency_texture, material_sampler, uv).r;

    // Alpha clip; opaque materials never fall below the threshold
    if (albedo.a < 0.5) {
        discard;
    }

    var out: GBufferOutput;
    out.position = vec4<f32>(input.world_pos, 1.0);
    out.albedo = vec4<f32>(albedo.rgb * input.color, 1.0);
    out.specular = vec4<f32>(specular, 0.0, 0.0, 1.0);
    out.normal = vec4<f32>(normalize(tbn * mapped), 0.0);
    out.translucency = vec4<f32>(mask, 0.0, 0.0, 1.0);
    return out;
}
"#;
