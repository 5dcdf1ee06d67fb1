use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use glam::{Mat4, Vec3};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::context::GpuContext;
use crate::material::{Material, MaterialLayout, MaterialTextures};
use crate::mesh::{GpuMesh, MeshData};
use crate::obj;
use crate::texture::TextureCache;

/// A drawable mesh paired with the material it is shaded with.
pub struct ModelPart {
    pub mesh: GpuMesh,
    pub material: Arc<Material>,
}

/// Loaded once, immutable afterwards.
pub struct Model {
    name: String,
    parts: Vec<ModelPart>,
}

impl Model {
    /// Imports an OBJ file; groups sharing a material share its bind group.
    pub fn load(
        ctx: &GpuContext,
        cache: &mut TextureCache,
        layout: &MaterialLayout,
        path: &Path,
    ) -> Result<Self> {
        let scene = obj::load_obj(path)?;
        let name = path.display().to_string();
        let mut materials: HashMap<Option<String>, Arc<Material>> = HashMap::new();
        let mut parts = Vec::with_capacity(scene.groups.len());

        for group in &scene.groups {
            let material = match materials.get(&group.material) {
                Some(material) => Arc::clone(material),
                None => {
                    let textures = match &group.material {
                        Some(material_name) => match scene.materials.get(material_name) {
                            Some(textures) => textures.clone(),
                            None => {
                                warn!("{name}: material '{material_name}' is not defined, using defaults");
                                MaterialTextures::default()
                            }
                        },
                        None => MaterialTextures::default(),
                    };
                    let label = group.material.as_deref().unwrap_or("default");
                    let material = Arc::new(
                        Material::load(ctx, cache, layout, label, &textures)
                            .with_context(|| format!("failed to load material '{label}' of {name}"))?,
                    );
                    materials.insert(group.material.clone(), Arc::clone(&material));
                    material
                }
            };
            let mesh = GpuMesh::upload(&ctx.device, &group.mesh)?;
            parts.push(ModelPart { mesh, material });
        }

        info!(
            "Loaded model {name}: {} parts, {} materials",
            parts.len(),
            materials.len()
        );
        Ok(Self { name, parts })
    }

    /// Builds a model from meshes already in memory.
    pub fn from_meshes(
        ctx: &GpuContext,
        cache: &mut TextureCache,
        layout: &MaterialLayout,
        name: &str,
        meshes: &[(MeshData, MaterialTextures)],
    ) -> crate::error::Result<Self> {
        let parts = meshes
            .iter()
            .map(|(mesh, textures)| {
                let material = Material::load(ctx, cache, layout, &mesh.name, textures)?;
                Ok(ModelPart {
                    mesh: GpuMesh::upload(&ctx.device, mesh)?,
                    material: Arc::new(material),
                })
            })
            .collect::<crate::error::Result<Vec<_>>>()?;
        Ok(Self {
            name: name.to_string(),
            parts,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parts(&self) -> &[ModelPart] {
        &self.parts
    }
}

/// Translation, Euler rotation in degrees (applied X, then Y, then Z) and scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Vec3,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn matrix(&self) -> Mat4 {
        let translation = Mat4::from_translation(self.position);
        let rotation = Mat4::from_rotation_z(self.rotation.z.to_radians())
            * Mat4::from_rotation_y(self.rotation.y.to_radians())
            * Mat4::from_rotation_x(self.rotation.x.to_radians());
        translation * rotation * Mat4::from_scale(self.scale)
    }
}

/// One placement of a model in the world.
#[derive(Clone)]
pub struct Instance {
    pub model: Arc<Model>,
    pub transform: Mat4,
}

impl Instance {
    pub fn new(model: Arc<Model>, transform: Mat4) -> Self {
        Self { model, transform }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_scales_before_rotating_and_translating() {
        let transform = Transform {
            position: Vec3::new(0.0, 1.0, 0.0),
            rotation: Vec3::new(0.0, 90.0, 0.0),
            scale: Vec3::splat(2.0),
        };
        let moved = transform.matrix().transform_point3(Vec3::X);
        assert!((moved - Vec3::new(0.0, 1.0, -2.0)).length() < 1e-5, "{moved}");
    }

    #[test]
    fn default_transform_is_identity() {
        assert_eq!(Transform::default().matrix(), Mat4::IDENTITY);
    }
}
