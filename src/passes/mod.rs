//! The three render stages and the per-instance transform storage they share.
//!
//! A frame records shadow, then geometry, then lighting into one encoder. The
//! shadow and geometry stages draw the same instance list with the same
//! transform slots, so each slot carries both the camera and the light MVP.

pub mod geometry;
pub mod lighting;
pub mod shadow;

use std::num::NonZeroU64;

use bytemuck::{Pod, Zeroable};
use glam::{Mat3, Mat4};
use log::debug;

use crate::error::Result;
use crate::material::MaterialLayout;
use crate::model::Instance;
use crate::shader;

/// Dynamic offsets into the transform buffer are multiples of this.
pub const TRANSFORM_ALIGNMENT: u64 = 256;

/// Bind group indices shared by the scene stages.
pub(crate) const FRAME_GROUP: u32 = 0;
pub(crate) const TRANSFORM_GROUP: u32 = 1;
pub(crate) const MATERIAL_GROUP: u32 = 2;

/// WGSL declaration matching `TransformUniform`.
pub(crate) const TRANSFORM_WGSL: &str = r#"
struct Transform {
    model: mat4x4<f32>,
    normal: mat3x4<f32>,
    mvp: mat4x4<f32>,
    light_mvp: mat4x4<f32>,
}

@group(1) @binding(0)
var<uniform> transform: Transform;
"#;

/// WGSL declarations matching `MaterialLayout`.
pub(crate) const MATERIAL_WGSL: &str = r#"
@group(2) @binding(0) var diffuse_texture: texture_2d<f32>;
@group(2) @binding(1) var specular_texture: texture_2d<f32>;
@group(2) @binding(2) var normal_texture: texture_2d<f32>;
@group(2) @binding(3) var bump_texture: texture_2d<f32>;
@group(2) @binding(4) var translucency_texture: texture_2d<f32>;
@group(2) @binding(5) var material_sampler: sampler;
"#;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TransformUniform {
    pub model: [[f32; 4]; 4],
    pub normal: [[f32; 4]; 3],
    pub mvp: [[f32; 4]; 4],
    pub light_mvp: [[f32; 4]; 4],
}

impl TransformUniform {
    pub fn new(model: Mat4, camera_view_proj: Mat4, light_view_proj: Mat4) -> Self {
        let normal = Mat3::from_mat4(model).inverse().transpose();
        Self {
            model: model.to_cols_array_2d(),
            normal: mat3_to_3x4(normal),
            mvp: (camera_view_proj * model).to_cols_array_2d(),
            light_mvp: (light_view_proj * model).to_cols_array_2d(),
        }
    }
}

fn mat3_to_3x4(matrix: Mat3) -> [[f32; 4]; 3] {
    let cols = matrix.to_cols_array();
    [
        [cols[0], cols[1], cols[2], 0.0],
        [cols[3], cols[4], cols[5], 0.0],
        [cols[6], cols[7], cols[8], 0.0],
    ]
}

/// Per-frame list of model transforms, one aligned slot per instance.
///
/// Slot 0 always holds the identity. `set_model_matrix` appends a slot and
/// returns its index; `upload` grows the GPU buffer when needed.
pub struct TransformStack {
    layout: wgpu::BindGroupLayout,
    buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
    capacity: usize,
    slots: Vec<TransformUniform>,
    camera_view_proj: Mat4,
    light_view_proj: Mat4,
}

impl TransformStack {
    pub fn new(device: &wgpu::Device, capacity: usize) -> Self {
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("transform-bind-layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: NonZeroU64::new(
                        std::mem::size_of::<TransformUniform>() as u64,
                    ),
                },
                count: None,
            }],
        });
        let capacity = capacity.max(1);
        let (buffer, bind_group) = Self::allocate(device, &layout, capacity);
        let mut stack = Self {
            layout,
            buffer,
            bind_group,
            capacity,
            slots: Vec::with_capacity(capacity),
            camera_view_proj: Mat4::IDENTITY,
            light_view_proj: Mat4::IDENTITY,
        };
        stack.reset();
        stack
    }

    fn allocate(
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        capacity: usize,
    ) -> (wgpu::Buffer, wgpu::BindGroup) {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("transform-stack"),
            size: capacity as u64 * TRANSFORM_ALIGNMENT,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("transform-bind-group"),
            layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &buffer,
                    offset: 0,
                    size: NonZeroU64::new(std::mem::size_of::<TransformUniform>() as u64),
                }),
            }],
        });
        (buffer, bind_group)
    }

    /// Camera and light view-projections applied to every slot set afterwards.
    pub fn set_view_projections(&mut self, camera: Mat4, light: Mat4) {
        self.camera_view_proj = camera;
        self.light_view_proj = light;
        self.reset();
    }

    /// Drops every slot except the identity.
    pub fn reset(&mut self) {
        self.slots.clear();
        self.slots.push(TransformUniform::new(
            Mat4::IDENTITY,
            self.camera_view_proj,
            self.light_view_proj,
        ));
    }

    pub fn set_model_matrix(&mut self, model: Mat4) -> u32 {
        self.slots.push(TransformUniform::new(
            model,
            self.camera_view_proj,
            self.light_view_proj,
        ));
        (self.slots.len() - 1) as u32
    }

    pub fn slot(&self, index: u32) -> Option<&TransformUniform> {
        self.slots.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn offset(slot: u32) -> u32 {
        slot * TRANSFORM_ALIGNMENT as u32
    }

    pub fn upload(&mut self, device: &wgpu::Device, queue: &wgpu::Queue) {
        if self.slots.len() > self.capacity {
            self.capacity = self.slots.len().next_power_of_two();
            debug!("growing transform stack to {} slots", self.capacity);
            let (buffer, bind_group) = Self::allocate(device, &self.layout, self.capacity);
            self.buffer = buffer;
            self.bind_group = bind_group;
        }
        let stride = TRANSFORM_ALIGNMENT as usize;
        let mut bytes = vec![0u8; self.slots.len() * stride];
        for (chunk, slot) in bytes.chunks_exact_mut(stride).zip(&self.slots) {
            let data = bytemuck::bytes_of(slot);
            chunk[..data.len()].copy_from_slice(data);
        }
        queue.write_buffer(&self.buffer, 0, &bytes);
    }

    pub fn layout(&self) -> &wgpu::BindGroupLayout {
        &self.layout
    }

    pub fn bind_group(&self) -> &wgpu::BindGroup {
        &self.bind_group
    }
}

/// Culling state a scene pipeline was built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceCulling {
    Back,
    /// Double sided, used for translucent materials.
    Disabled,
}

impl FaceCulling {
    pub fn for_material(translucent: bool) -> Self {
        if translucent {
            Self::Disabled
        } else {
            Self::Back
        }
    }
}

/// Back-face culled and double sided variants of one scene program, plus the
/// variant currently bound in the open pass.
pub(crate) struct ScenePipelines {
    culled: wgpu::RenderPipeline,
    double_sided: wgpu::RenderPipeline,
    bound: Option<FaceCulling>,
    binds: usize,
}

/// What a scene stage feeds into its pipeline pair.
pub(crate) struct SceneProgram<'a> {
    pub name: &'a str,
    pub source: &'a str,
    pub frame_layout: &'a wgpu::BindGroupLayout,
    pub transform_layout: &'a wgpu::BindGroupLayout,
    pub material_layout: &'a MaterialLayout,
    pub targets: &'a [Option<wgpu::ColorTargetState>],
}

impl ScenePipelines {
    pub(crate) fn new(device: &wgpu::Device, program: &SceneProgram<'_>) -> Result<Self> {
        let module = shader::compile(device, program.name, program.source)?;
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(program.name),
            bind_group_layouts: &[
                program.frame_layout,
                program.transform_layout,
                program.material_layout.layout(),
            ],
            push_constant_ranges: &[],
        });
        let buffers = crate::mesh::vertex_buffer_layouts();
        let build = |cull_mode| {
            shader::validated(device, program.name, || {
                device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some(program.name),
                    layout: Some(&layout),
                    vertex: wgpu::VertexState {
                        module: &module,
                        entry_point: Some("vs_main"),
                        compilation_options: Default::default(),
                        buffers: &buffers,
                    },
                    primitive: wgpu::PrimitiveState {
                        topology: wgpu::PrimitiveTopology::TriangleList,
                        front_face: wgpu::FrontFace::Ccw,
                        cull_mode,
                        polygon_mode: wgpu::PolygonMode::Fill,
                        ..Default::default()
                    },
                    depth_stencil: Some(wgpu::DepthStencilState {
                        format: crate::render_target::DEPTH_FORMAT,
                        depth_write_enabled: true,
                        depth_compare: wgpu::CompareFunction::Less,
                        stencil: Default::default(),
                        bias: Default::default(),
                    }),
                    multisample: wgpu::MultisampleState::default(),
                    fragment: Some(wgpu::FragmentState {
                        module: &module,
                        entry_point: Some("fs_main"),
                        compilation_options: Default::default(),
                        targets: program.targets,
                    }),
                    multiview: None,
                    cache: None,
                })
            })
        };
        Ok(Self {
            culled: build(Some(wgpu::Face::Back))?,
            double_sided: build(None)?,
            bound: None,
            binds: 0,
        })
    }

    /// Forget the bound variant; a new pass starts with nothing bound.
    pub(crate) fn begin(&mut self) {
        self.bound = None;
        self.binds = 0;
    }

    /// Binds the variant for `culling` unless it is already bound.
    pub(crate) fn bind(&mut self, pass: &mut wgpu::RenderPass<'_>, culling: FaceCulling) {
        if self.bound == Some(culling) {
            return;
        }
        let pipeline = match culling {
            FaceCulling::Back => &self.culled,
            FaceCulling::Disabled => &self.double_sided,
        };
        pass.set_pipeline(pipeline);
        self.bound = Some(culling);
        self.binds += 1;
    }

    /// Pipeline binds issued since the pass began.
    pub(crate) fn binds(&self) -> usize {
        self.binds
    }
}

/// Draws every instance with the transform slot recorded for it.
pub(crate) fn draw_instances(
    pass: &mut wgpu::RenderPass<'_>,
    pipelines: &mut ScenePipelines,
    transforms: &TransformStack,
    instances: &[Instance],
    slots: &[u32],
) {
    for (instance, &slot) in instances.iter().zip(slots) {
        pass.set_bind_group(
            TRANSFORM_GROUP,
            transforms.bind_group(),
            &[TransformStack::offset(slot)],
        );
        for part in instance.model.parts() {
            pipelines.bind(pass, FaceCulling::for_material(part.material.is_translucent()));
            pass.set_bind_group(MATERIAL_GROUP, part.material.bind_group(), &[]);
            part.mesh.draw(pass);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn transform_uniform_fits_one_aligned_slot() {
        assert!(std::mem::size_of::<TransformUniform>() as u64 <= TRANSFORM_ALIGNMENT);
        assert_eq!(TransformStack::offset(3), 768);
    }

    #[test]
    fn normal_matrix_undoes_non_uniform_scale() {
        let model = Mat4::from_scale(Vec3::new(2.0, 1.0, 1.0));
        let uniform = TransformUniform::new(model, Mat4::IDENTITY, Mat4::IDENTITY);
        assert_eq!(uniform.normal[0][0], 0.5);
        assert_eq!(uniform.normal[1][1], 1.0);
    }

    #[test]
    fn camera_and_light_mvp_share_the_model_matrix() {
        let model = Mat4::from_translation(Vec3::X);
        let camera = Mat4::from_scale(Vec3::splat(2.0));
        let light = Mat4::from_translation(Vec3::Y);
        let uniform = TransformUniform::new(model, camera, light);
        assert_eq!(uniform.mvp, (camera * model).to_cols_array_2d());
        assert_eq!(uniform.light_mvp, (light * model).to_cols_array_2d());
    }

    #[test]
    fn culling_follows_translucency() {
        assert_eq!(FaceCulling::for_material(true), FaceCulling::Disabled);
        assert_eq!(FaceCulling::for_material(false), FaceCulling::Back);
    }
}
