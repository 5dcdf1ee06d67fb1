use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use glam::{Vec2, Vec3};
use log::{debug, info, warn};

use crate::error::RenderError;
use crate::material::MaterialTextures;
use crate::mesh::MeshData;

/// One `usemtl` run of faces, turned into indexed vertex streams.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjGroup {
    pub material: Option<String>,
    pub mesh: MeshData,
}

/// Everything an OBJ file and its material libraries describe.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjScene {
    pub groups: Vec<ObjGroup>,
    pub materials: HashMap<String, MaterialTextures>,
}

/// Parsed but not yet resolved OBJ text.
#[derive(Debug, Default)]
struct ObjDocument {
    positions: Vec<Vec3>,
    colors: Vec<Vec3>,
    tex_coords: Vec<Vec2>,
    normals: Vec<Vec3>,
    material_libraries: Vec<String>,
    runs: Vec<FaceRun>,
}

#[derive(Debug, Default)]
struct FaceRun {
    material: Option<String>,
    triangles: Vec<[FaceIndex; 3]>,
}

/// Reads `path`, follows its `mtllib` references and builds one mesh per material run.
pub fn load_obj(path: &Path) -> Result<ObjScene> {
    info!("Loading model from {}", path.display());
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read OBJ file {}", path.display()))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string());

    let document =
        parse_document(&data).with_context(|| format!("failed to parse {}", path.display()))?;
    let mut materials = HashMap::new();
    for library in &document.material_libraries {
        let library_path = base_dir.join(library);
        match fs::read_to_string(&library_path) {
            Ok(text) => materials.extend(parse_mtl(&text, base_dir)),
            Err(err) => warn!(
                "material library {} unavailable: {err}",
                library_path.display()
            ),
        }
    }
    let groups = build_groups(&name, &document)?;
    debug!(
        "{} parsed into {} groups, {} materials",
        path.display(),
        groups.len(),
        materials.len()
    );
    Ok(ObjScene { groups, materials })
}

/// Parses OBJ text without touching the filesystem; material libraries are ignored.
pub fn load_obj_from_str(name: &str, data: &str) -> Result<ObjScene> {
    let document = parse_document(data)?;
    Ok(ObjScene {
        groups: build_groups(name, &document)?,
        materials: HashMap::new(),
    })
}

fn parse_document(data: &str) -> Result<ObjDocument> {
    let mut document = ObjDocument::default();
    let mut current = FaceRun::default();

    for (line_no, line) in data.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let mut parts = trimmed.split_whitespace();
        let Some(tag) = parts.next() else {
            continue;
        };
        match tag {
            "v" => {
                let values = parse_floats(parts)
                    .with_context(|| format!("invalid vertex on line {}", line_no + 1))?;
                if values.len() < 3 {
                    return Err(anyhow!("vertex on line {} has fewer than 3 components", line_no + 1));
                }
                document
                    .positions
                    .push(Vec3::new(values[0], values[1], values[2]));
                // Optional per-vertex color extension: v x y z r g b
                let color = if values.len() >= 6 {
                    Vec3::new(values[3], values[4], values[5])
                } else {
                    Vec3::ONE
                };
                document.colors.push(color);
            }
            "vt" => {
                let values = parse_floats(parts)
                    .with_context(|| format!("invalid texture coordinate on line {}", line_no + 1))?;
                let u = values.first().copied().unwrap_or(0.0);
                let v = values.get(1).copied().unwrap_or(0.0);
                // Image rows start at the top, OBJ v starts at the bottom
                document.tex_coords.push(Vec2::new(u, 1.0 - v));
            }
            "vn" => {
                let values = parse_floats(parts)
                    .with_context(|| format!("invalid normal on line {}", line_no + 1))?;
                if values.len() < 3 {
                    return Err(anyhow!("normal on line {} has fewer than 3 components", line_no + 1));
                }
                document
                    .normals
                    .push(Vec3::new(values[0], values[1], values[2]));
            }
            "f" => {
                let polygon = parse_face(parts)
                    .with_context(|| format!("invalid face on line {}", line_no + 1))?;
                triangulate_face(&polygon, &mut current.triangles);
            }
            "usemtl" => {
                let material = rest_of_line(trimmed, tag);
                if current.material.as_deref() != Some(material.as_str()) {
                    let finished = std::mem::replace(
                        &mut current,
                        FaceRun {
                            material: Some(material),
                            triangles: Vec::new(),
                        },
                    );
                    if !finished.triangles.is_empty() {
                        document.runs.push(finished);
                    }
                }
            }
            "mtllib" => document.material_libraries.push(rest_of_line(trimmed, tag)),
            _ => {}
        }
    }
    if !current.triangles.is_empty() {
        document.runs.push(current);
    }

    if document.positions.is_empty() {
        return Err(anyhow!("OBJ file does not define any vertices"));
    }
    Ok(document)
}

/// Parses material library text into texture paths resolved against `base_dir`.
pub fn parse_mtl(data: &str, base_dir: &Path) -> HashMap<String, MaterialTextures> {
    let mut materials = HashMap::new();
    let mut current: Option<(String, MaterialTextures)> = None;

    for line in data.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some(tag) = trimmed.split_whitespace().next() else {
            continue;
        };
        if tag == "newmtl" {
            if let Some((name, textures)) = current.take() {
                materials.insert(name, textures);
            }
            current = Some((rest_of_line(trimmed, tag), MaterialTextures::default()));
            continue;
        }
        let Some((_, textures)) = current.as_mut() else {
            continue;
        };
        let slot = match tag.to_ascii_lowercase().as_str() {
            "map_kd" => &mut textures.diffuse,
            "map_ks" => &mut textures.specular,
            "map_bump" | "bump" | "norm" | "map_kn" => &mut textures.normal,
            "disp" | "map_disp" => &mut textures.bump,
            "map_d" => &mut textures.translucency,
            _ => continue,
        };
        if let Some(file) = texture_file(trimmed, tag) {
            *slot = Some(base_dir.join(file));
        }
    }
    if let Some((name, textures)) = current {
        materials.insert(name, textures);
    }
    materials
}

/// Last token of a map statement; leading options such as `-bm 0.5` are skipped.
fn texture_file(line: &str, tag: &str) -> Option<PathBuf> {
    let args = rest_of_line(line, tag);
    let file = args.split_whitespace().last()?;
    Some(PathBuf::from(file.replace('\\', "/")))
}

fn rest_of_line(line: &str, tag: &str) -> String {
    line[tag.len()..].trim().to_string()
}

fn parse_floats<'a>(parts: impl Iterator<Item = &'a str>) -> Result<Vec<f32>> {
    parts
        .map(|part| {
            part.parse::<f32>()
                .with_context(|| format!("'{part}' is not a number"))
        })
        .collect()
}

fn parse_face<'a>(parts: impl Iterator<Item = &'a str>) -> Result<Vec<FaceIndex>> {
    let mut indices = Vec::new();
    for part in parts {
        let mut segments = part.split('/');
        let v = segments
            .next()
            .ok_or_else(|| anyhow!("missing vertex index"))?
            .parse::<i32>()?;
        let mut optional = || -> Result<i32> {
            match segments.next() {
                Some(s) if !s.is_empty() => Ok(s.parse::<i32>()?),
                _ => Ok(0),
            }
        };
        let vt = optional()?;
        let vn = optional()?;
        indices.push(FaceIndex { v, vt, vn });
    }
    if indices.len() < 3 {
        return Err(anyhow!("faces must reference at least 3 vertices"));
    }
    Ok(indices)
}

fn triangulate_face(polygon: &[FaceIndex], triangles: &mut Vec<[FaceIndex; 3]>) {
    for i in 1..polygon.len().saturating_sub(1) {
        triangles.push([polygon[0], polygon[i], polygon[i + 1]]);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Key {
    position: usize,
    tex_coord: usize,
    normal: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct FaceIndex {
    v: i32,
    vt: i32,
    vn: i32,
}

fn build_groups(name: &str, document: &ObjDocument) -> Result<Vec<ObjGroup>> {
    document
        .runs
        .iter()
        .enumerate()
        .map(|(index, run)| {
            let mesh_name = match &run.material {
                Some(material) => format!("{name}/{material}"),
                None => format!("{name}/{index}"),
            };
            let mesh = build_mesh(mesh_name, document, &run.triangles)?;
            Ok(ObjGroup {
                material: run.material.clone(),
                mesh,
            })
        })
        .collect()
}

fn build_mesh(name: String, document: &ObjDocument, triangles: &[[FaceIndex; 3]]) -> Result<MeshData> {
    let mut lookup: HashMap<Key, u32> = HashMap::new();
    let mut mesh = MeshData {
        name,
        ..MeshData::default()
    };
    let mut missing_normals = false;

    for triangle in triangles {
        for idx in triangle {
            let position = fix_index(idx.v, document.positions.len())
                .ok_or_else(|| anyhow!("invalid vertex index {} in '{}'", idx.v, mesh.name))?;
            // Normal mapping needs a UV parameterisation to derive tangents from
            let tex_coord = fix_index(idx.vt, document.tex_coords.len()).ok_or_else(|| {
                RenderError::MissingAttribute {
                    mesh: mesh.name.clone(),
                    attribute: "tex_coord",
                }
            })?;
            let normal = fix_index(idx.vn, document.normals.len());
            missing_normals |= normal.is_none();
            let key = Key {
                position,
                tex_coord,
                normal,
            };
            let next_index = mesh.positions.len() as u32;
            let entry = *lookup.entry(key).or_insert_with(|| {
                mesh.positions.push(document.positions[position]);
                mesh.colors.push(document.colors[position]);
                mesh.tex_coords.push(document.tex_coords[tex_coord]);
                mesh.normals
                    .push(normal.map(|i| document.normals[i]).unwrap_or(Vec3::ZERO));
                next_index
            });
            mesh.indices.push(entry);
        }
    }

    if missing_normals {
        compute_normals(&mut mesh);
    }
    mesh.compute_tangent_space();
    mesh.validate()?;
    Ok(mesh)
}

fn fix_index(index: i32, len: usize) -> Option<usize> {
    if index > 0 {
        let zero_based = index as usize - 1;
        (zero_based < len).then_some(zero_based)
    } else if index < 0 {
        let abs = index.unsigned_abs() as usize;
        (abs <= len).then_some(len - abs)
    } else {
        None
    }
}

/// Area weighted vertex normals for vertices the file gave none.
fn compute_normals(mesh: &mut MeshData) {
    let mut accum = vec![Vec3::ZERO; mesh.positions.len()];
    for triangle in mesh.indices.chunks_exact(3) {
        let [i0, i1, i2] = [triangle[0] as usize, triangle[1] as usize, triangle[2] as usize];
        let p0 = mesh.positions[i0];
        let normal = (mesh.positions[i1] - p0).cross(mesh.positions[i2] - p0);
        accum[i0] += normal;
        accum[i1] += normal;
        accum[i2] += normal;
    }
    for (normal, generated) in mesh.normals.iter_mut().zip(accum) {
        if *normal == Vec3::ZERO {
            *normal = generated.normalize_or_zero();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUAD: &str = "
mtllib quad.mtl
v -1 -1 0
v 1 -1 0
v 1 1 0
v -1 1 0
vt 0 0
vt 1 0
vt 1 1
vt 0 1
usemtl brick
f 1/1 2/2 3/3 4/4
";

    #[test]
    fn quad_is_fan_triangulated_with_flipped_uvs() {
        let scene = load_obj_from_str("quad", QUAD).unwrap();
        assert_eq!(scene.groups.len(), 1);
        let group = &scene.groups[0];
        assert_eq!(group.material.as_deref(), Some("brick"));
        assert_eq!(group.mesh.indices, vec![0, 1, 2, 0, 2, 3]);
        assert_eq!(group.mesh.tex_coords[0], Vec2::new(0.0, 1.0));
        assert_eq!(group.mesh.tex_coords[2], Vec2::new(1.0, 0.0));
    }

    #[test]
    fn missing_normals_are_generated() {
        let scene = load_obj_from_str("quad", QUAD).unwrap();
        for normal in &scene.groups[0].mesh.normals {
            assert!((*normal - Vec3::Z).length() < 1e-5);
        }
        for tangent in &scene.groups[0].mesh.tangents {
            assert!((*tangent - Vec3::X).length() < 1e-5);
        }
    }

    #[test]
    fn negative_indices_count_from_the_end() {
        let obj = "v 0 0 0\nv 1 0 0\nv 0 1 0\nvt 0 0\nvn 0 0 1\nf -3/1/1 -2/1/1 -1/1/1\n";
        let scene = load_obj_from_str("tri", obj).unwrap();
        let mesh = &scene.groups[0].mesh;
        assert_eq!(mesh.positions[1], Vec3::X);
        assert_eq!(mesh.normals[0], Vec3::Z);
    }

    #[test]
    fn faces_without_uvs_are_rejected() {
        let obj = "v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n";
        let err = load_obj_from_str("tri", obj).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RenderError>(),
            Some(RenderError::MissingAttribute { attribute: "tex_coord", .. })
        ));
    }

    #[test]
    fn material_runs_split_groups() {
        let obj = "v 0 0 0\nv 1 0 0\nv 0 1 0\nvt 0 0\nusemtl a\nf 1/1 2/1 3/1\nusemtl b\nf 3/1 2/1 1/1\n";
        let scene = load_obj_from_str("two", obj).unwrap();
        let names: Vec<_> = scene.groups.iter().map(|g| g.material.clone()).collect();
        assert_eq!(names, vec![Some("a".to_string()), Some("b".to_string())]);
    }

    #[test]
    fn vertex_colors_are_read_when_present() {
        let obj = "v 0 0 0 1 0 0\nv 1 0 0 1 0 0\nv 0 1 0 1 0 0\nvt 0 0\nf 1/1 2/1 3/1\n";
        let scene = load_obj_from_str("tri", obj).unwrap();
        assert!(scene.groups[0].mesh.colors.iter().all(|c| *c == Vec3::X));
    }

    #[test]
    fn mtl_maps_resolve_against_the_model_directory() {
        let mtl = "newmtl leaf\nmap_Kd leaf.png\nmap_Ks leaf_spec.png\nmap_bump -bm 0.5 leaf_n.png\ndisp leaf_h.png\nmap_d leaf_mask.png\nnewmtl plain\nKd 1 1 1\n";
        let materials = parse_mtl(mtl, Path::new("assets/sponza"));
        let leaf = &materials["leaf"];
        assert_eq!(leaf.diffuse.as_deref(), Some(Path::new("assets/sponza/leaf.png")));
        assert_eq!(leaf.normal.as_deref(), Some(Path::new("assets/sponza/leaf_n.png")));
        assert_eq!(leaf.bump.as_deref(), Some(Path::new("assets/sponza/leaf_h.png")));
        assert_eq!(
            leaf.translucency.as_deref(),
            Some(Path::new("assets/sponza/leaf_mask.png"))
        );
        assert_eq!(materials["plain"], MaterialTextures::default());
    }

    #[test]
    fn load_obj_reads_material_library_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("quad.obj"), QUAD).unwrap();
        fs::write(dir.path().join("quad.mtl"), "newmtl brick\nmap_Kd brick.png\n").unwrap();
        let scene = load_obj(&dir.path().join("quad.obj")).unwrap();
        assert_eq!(
            scene.materials["brick"].diffuse,
            Some(dir.path().join("brick.png"))
        );
    }
}
