use glam::{Vec2, Vec3};
use wgpu::util::DeviceExt;

use crate::error::{RenderError, Result};

/// CPU side vertex streams of one triangle mesh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    pub name: String,
    pub positions: Vec<Vec3>,
    pub colors: Vec<Vec3>,
    pub tex_coords: Vec<Vec2>,
    pub normals: Vec<Vec3>,
    pub tangents: Vec<Vec3>,
    pub bitangents: Vec<Vec3>,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    /// Checks that every stream has one entry per vertex and that the
    /// index list is made of in-range triangles.
    pub fn validate(&self) -> Result<()> {
        let count = self.vertex_count();
        if count == 0 || self.indices.is_empty() {
            return Err(self.invalid("mesh has no triangles".to_string()));
        }
        let streams = [
            ("color", self.colors.len()),
            ("tex_coord", self.tex_coords.len()),
            ("normal", self.normals.len()),
            ("tangent", self.tangents.len()),
            ("bitangent", self.bitangents.len()),
        ];
        for (stream, len) in streams {
            if len != count {
                return Err(self.invalid(format!(
                    "{stream} stream has {len} entries for {count} positions"
                )));
            }
        }
        if self.indices.len() % 3 != 0 {
            return Err(self.invalid(format!(
                "index count {} is not a multiple of 3",
                self.indices.len()
            )));
        }
        if let Some(bad) = self.indices.iter().find(|&&i| i as usize >= count) {
            return Err(self.invalid(format!("index {bad} out of range for {count} vertices")));
        }
        Ok(())
    }

    fn invalid(&self, reason: String) -> RenderError {
        RenderError::InvalidMesh {
            mesh: self.name.clone(),
            reason,
        }
    }

    /// Derives per-vertex tangent and bitangent from positions and UVs.
    pub fn compute_tangent_space(&mut self) {
        let count = self.vertex_count();
        let mut tangents = vec![Vec3::ZERO; count];
        let mut bitangents = vec![Vec3::ZERO; count];

        for tri in self.indices.chunks_exact(3) {
            let [i0, i1, i2] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
            if i0 >= count || i1 >= count || i2 >= count {
                continue;
            }
            let e1 = self.positions[i1] - self.positions[i0];
            let e2 = self.positions[i2] - self.positions[i0];
            let d1 = self.tex_coords[i1] - self.tex_coords[i0];
            let d2 = self.tex_coords[i2] - self.tex_coords[i0];
            let det = d1.x * d2.y - d2.x * d1.y;
            if det.abs() < f32::EPSILON {
                continue;
            }
            let r = 1.0 / det;
            let tangent = (e1 * d2.y - e2 * d1.y) * r;
            let bitangent = (e2 * d1.x - e1 * d2.x) * r;
            for i in [i0, i1, i2] {
                tangents[i] += tangent;
                bitangents[i] += bitangent;
            }
        }

        for i in 0..count {
            let n = self.normals.get(i).copied().unwrap_or(Vec3::Y);
            // Gram-Schmidt against the normal; fall back to any perpendicular axis
            let t = (tangents[i] - n * n.dot(tangents[i])).normalize_or_zero();
            let t = if t == Vec3::ZERO { n.any_orthonormal_vector() } else { t };
            let mut b = n.cross(t);
            if b.dot(bitangents[i]) < 0.0 {
                b = -b;
            }
            tangents[i] = t;
            bitangents[i] = b;
        }
        self.tangents = tangents;
        self.bitangents = bitangents;
    }
}

const fn attribute(location: u32, format: wgpu::VertexFormat) -> [wgpu::VertexAttribute; 1] {
    [wgpu::VertexAttribute {
        format,
        offset: 0,
        shader_location: location,
    }]
}

static POSITION: [wgpu::VertexAttribute; 1] = attribute(0, wgpu::VertexFormat::Float32x3);
static COLOR: [wgpu::VertexAttribute; 1] = attribute(1, wgpu::VertexFormat::Float32x3);
static TEX_COORD: [wgpu::VertexAttribute; 1] = attribute(2, wgpu::VertexFormat::Float32x2);
static NORMAL: [wgpu::VertexAttribute; 1] = attribute(3, wgpu::VertexFormat::Float32x3);
static TANGENT: [wgpu::VertexAttribute; 1] = attribute(4, wgpu::VertexFormat::Float32x3);
static BITANGENT: [wgpu::VertexAttribute; 1] = attribute(5, wgpu::VertexFormat::Float32x3);

/// One vertex buffer per stream, in the slot order `GpuMesh::draw` binds them.
pub(crate) fn vertex_buffer_layouts() -> [wgpu::VertexBufferLayout<'static>; 6] {
    [&POSITION, &COLOR, &TEX_COORD, &NORMAL, &TANGENT, &BITANGENT].map(|attributes| {
        wgpu::VertexBufferLayout {
            array_stride: attributes[0].format.size(),
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: attributes.as_slice(),
        }
    })
}

/// Immutable GPU copy of a validated `MeshData`, one buffer per stream.
pub struct GpuMesh {
    streams: [wgpu::Buffer; 6],
    index: wgpu::Buffer,
    index_count: u32,
}

impl GpuMesh {
    pub fn upload(device: &wgpu::Device, mesh: &MeshData) -> Result<Self> {
        mesh.validate()?;
        let label = &mesh.name;
        let stream = |suffix: &str, contents: &[u8]| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(&format!("{label}-{suffix}")),
                contents,
                usage: wgpu::BufferUsages::VERTEX,
            })
        };
        let streams = [
            stream("positions", bytemuck::cast_slice(&mesh.positions)),
            stream("colors", bytemuck::cast_slice(&mesh.colors)),
            stream("tex-coords", bytemuck::cast_slice(&mesh.tex_coords)),
            stream("normals", bytemuck::cast_slice(&mesh.normals)),
            stream("tangents", bytemuck::cast_slice(&mesh.tangents)),
            stream("bitangents", bytemuck::cast_slice(&mesh.bitangents)),
        ];
        let index = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(&format!("{label}-indices")),
            contents: bytemuck::cast_slice(&mesh.indices),
            usage: wgpu::BufferUsages::INDEX,
        });
        Ok(Self {
            streams,
            index,
            index_count: mesh.indices.len() as u32,
        })
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn draw(&self, pass: &mut wgpu::RenderPass<'_>) {
        for (slot, buffer) in self.streams.iter().enumerate() {
            pass.set_vertex_buffer(slot as u32, buffer.slice(..));
        }
        pass.set_index_buffer(self.index.slice(..), wgpu::IndexFormat::Uint32);
        pass.draw_indexed(0..self.index_count, 0, 0..1);
    }
}

/// Two triangles covering clip space, used by the full-screen resolve.
pub struct ScreenQuad {
    vertex: wgpu::Buffer,
}

impl ScreenQuad {
    const VERTICES: [[f32; 2]; 6] = [
        [-1.0, -1.0],
        [1.0, -1.0],
        [1.0, 1.0],
        [-1.0, -1.0],
        [1.0, 1.0],
        [-1.0, 1.0],
    ];

    pub const LAYOUT: wgpu::VertexBufferLayout<'static> = wgpu::VertexBufferLayout {
        array_stride: 8,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &[wgpu::VertexAttribute {
            format: wgpu::VertexFormat::Float32x2,
            offset: 0,
            shader_location: 0,
        }],
    };

    pub fn new(device: &wgpu::Device) -> Self {
        let vertex = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("screen-quad"),
            contents: bytemuck::cast_slice(&Self::VERTICES),
            usage: wgpu::BufferUsages::VERTEX,
        });
        Self { vertex }
    }

    pub fn draw(&self, pass: &mut wgpu::RenderPass<'_>) {
        pass.set_vertex_buffer(0, self.vertex.slice(..));
        pass.draw(0..Self::VERTICES.len() as u32, 0..1);
    }
}

#[cfg(test)]
pub(crate) fn quad_mesh(name: &str) -> MeshData {
    let mut mesh = MeshData {
        name: name.to_string(),
        positions: vec![
            Vec3::new(-1.0, -1.0, 0.0),
            Vec3::new(1.0, -1.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(-1.0, 1.0, 0.0),
        ],
        colors: vec![Vec3::ONE; 4],
        tex_coords: vec![
            Vec2::new(0.0, 1.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(0.0, 0.0),
        ],
        normals: vec![Vec3::Z; 4],
        tangents: Vec::new(),
        bitangents: Vec::new(),
        indices: vec![0, 1, 2, 0, 2, 3],
    };
    mesh.compute_tangent_space();
    mesh
}
