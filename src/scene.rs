use std::collections::HashSet;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use glam::Vec3;
use log::{info, warn};
use roxmltree::{Document, Node};

use crate::camera::{Camera, Projection};
use crate::lights::{Flashlight, LightAnimator, LightBounds, PointLight, MAX_LIGHTS};
use crate::model::Transform;
use crate::renderer::RendererParams;

const DEFAULT_LIGHT_SEED: u64 = 0x5eed;

/// A model file and the name instances refer to it by.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelEntry {
    pub name: String,
    pub path: PathBuf,
}

/// One placement of a named model.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceEntry {
    pub model: String,
    pub transform: Transform,
}

/// Where the point lights come from.
#[derive(Debug, Clone, PartialEq)]
pub enum LightSetup {
    /// Two random sets the animator blends between.
    Random {
        count: usize,
        seed: u64,
        bounds: LightBounds,
    },
    /// Static lights listed in the file.
    Fixed(Vec<PointLight>),
}

impl LightSetup {
    pub fn animator(&self) -> LightAnimator {
        match self {
            Self::Random {
                count,
                seed,
                bounds,
            } => LightAnimator::random(*seed, *count, *bounds),
            Self::Fixed(lights) => LightAnimator::new(lights.clone(), lights.clone()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Random { count, .. } => *count,
            Self::Fixed(lights) => lights.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LightSetup {
    fn default() -> Self {
        Self::Random {
            count: MAX_LIGHTS,
            seed: DEFAULT_LIGHT_SEED,
            bounds: LightBounds::default(),
        }
    }
}

/// Everything a scene file describes. Every element is optional.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneConfig {
    pub camera: Camera,
    pub projection: Projection,
    pub models: Vec<ModelEntry>,
    pub instances: Vec<InstanceEntry>,
    pub lights: LightSetup,
    pub flashlight: Flashlight,
    pub params: RendererParams,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            camera: Camera::new(Vec3::new(0.0, 2.0, 2.0), 0.0, 0.0),
            projection: Projection::default(),
            models: Vec::new(),
            instances: Vec::new(),
            lights: LightSetup::default(),
            flashlight: Flashlight::default(),
            params: RendererParams::default(),
        }
    }
}

impl SceneConfig {
    /// Reads a scene file; model paths resolve against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let xml = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scene {}", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
        let config = Self::from_xml(&xml, base_dir)
            .with_context(|| format!("failed to parse scene {}", path.display()))?;
        info!(
            "Loaded scene {} ({} models, {} instances, {} lights)",
            path.display(),
            config.models.len(),
            config.instances.len(),
            config.lights.len()
        );
        Ok(config)
    }

    pub fn from_xml(xml: &str, base_dir: &Path) -> Result<Self> {
        let document = Document::parse(xml).context("invalid scene XML")?;
        let root = document.root_element();
        if !root.has_tag_name("scene") {
            bail!("root element is <{}>, expected <scene>", root.tag_name().name());
        }

        let mut config = Self::default();
        if let Some(node) = child(root, "camera") {
            let position = parse_attr(node, "position", config.camera.position())?;
            let pitch = parse_attr(node, "pitch", config.camera.pitch())?;
            let yaw = parse_attr(node, "yaw", config.camera.yaw())?;
            config.camera = Camera::new(position, pitch, yaw);
            config.projection.fov_y_degrees =
                parse_attr(node, "fov", config.projection.fov_y_degrees)?;
        }

        let mut names = HashSet::new();
        for node in root.children().filter(|n| n.has_tag_name("model")) {
            let name = required_attr(node, "name")?;
            if !names.insert(name.to_string()) {
                bail!("model '{name}' is declared twice");
            }
            let path = base_dir.join(required_attr(node, "path")?);
            config.models.push(ModelEntry {
                name: name.to_string(),
                path,
            });
        }

        for node in root.children().filter(|n| n.has_tag_name("instance")) {
            let model = required_attr(node, "model")?;
            if !names.contains(model) {
                bail!("instance refers to unknown model '{model}'");
            }
            let defaults = Transform::default();
            config.instances.push(InstanceEntry {
                model: model.to_string(),
                transform: Transform {
                    position: parse_attr(node, "position", defaults.position)?,
                    rotation: parse_attr(node, "rotation", defaults.rotation)?,
                    scale: parse_scale(node, defaults.scale)?,
                },
            });
        }

        config.lights = parse_lights(root)?;

        if let Some(node) = child(root, "flashlight") {
            let defaults = config.flashlight;
            config.flashlight = Flashlight {
                camera: Camera::new(
                    parse_attr(node, "position", defaults.camera.position())?,
                    parse_attr(node, "pitch", defaults.camera.pitch())?,
                    parse_attr(node, "yaw", defaults.camera.yaw())?,
                ),
                color: parse_attr(node, "color", defaults.color)?,
                cutoff: parse_attr(node, "cutoff", defaults.cutoff)?,
                follow_camera: parse_attr(node, "follow", defaults.follow_camera)?,
            };
        }

        if let Some(node) = child(root, "ambient") {
            let text = node.text().map(str::trim).unwrap_or_default();
            config.params.ambient = Vec3Value::from_str(text)
                .map_err(|err| anyhow!("<ambient>: {err}"))?
                .0;
        }
        if let Some(node) = child(root, "renderer") {
            parse_renderer(node, &mut config.params)?;
        }
        Ok(config)
    }
}

fn parse_lights(root: Node<'_, '_>) -> Result<LightSetup> {
    let listed = root
        .children()
        .filter(|n| n.has_tag_name("light"))
        .map(|node| {
            Ok(PointLight {
                position: parse_attr(node, "position", Vec3::ZERO)?,
                color: parse_attr(node, "color", Vec3::ONE)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let random = child(root, "lights");

    let setup = match (listed.is_empty(), random) {
        (false, random) => {
            if random.is_some() {
                warn!("<lights> ignored because <light> elements are present");
            }
            LightSetup::Fixed(listed)
        }
        (true, Some(node)) => {
            let defaults = LightBounds::default();
            let bounds = LightBounds {
                min: parse_attr(node, "min", defaults.min)?,
                max: parse_attr(node, "max", defaults.max)?,
            };
            if !bounds.min.is_finite() || !bounds.max.is_finite() {
                bail!("<lights> bounds must be finite");
            }
            if bounds.min.cmpgt(bounds.max).any() {
                bail!(
                    "<lights> min {} exceeds max {} on some axis",
                    bounds.min,
                    bounds.max
                );
            }
            LightSetup::Random {
                count: parse_attr(node, "count", MAX_LIGHTS)?,
                seed: parse_attr(node, "seed", DEFAULT_LIGHT_SEED)?,
                bounds,
            }
        }
        (true, None) => LightSetup::default(),
    };
    if setup.len() > MAX_LIGHTS {
        warn!(
            "scene declares {} lights, only {MAX_LIGHTS} are shaded",
            setup.len()
        );
    }
    Ok(setup)
}

fn parse_renderer(node: Node<'_, '_>, params: &mut RendererParams) -> Result<()> {
    for attribute in node.attributes() {
        let value = attribute.value();
        let name = attribute.name();
        match name {
            "light_count" => params.light_count = parse_value(name, value)?,
            "parallax_depth" => params.parallax_depth = parse_value(name, value)?,
            "gamma" => params.gamma = parse_value(name, value)?,
            "tone_mapping" => params.tone_mapping = parse_value(name, value)?,
            "fog_density" => params.fog_density = parse_value(name, value)?,
            "march_steps" => params.march_steps = parse_value(name, value)?,
            "rsm_radius" => params.rsm_radius = parse_value(name, value)?,
            "vpl_count" => params.vpl_count = parse_value(name, value)?,
            "reflection_factor" => params.reflection_factor = parse_value(name, value)?,
            "indirect" => params.indirect_enabled = parse_value(name, value)?,
            "visualize_indirect" => params.visualize_indirect = parse_value(name, value)?,
            "visualize_buffer" => params.visualize_buffer = parse_value(name, value)?,
            "visualize_rsm_buffer" => params.visualize_rsm_buffer = parse_value(name, value)?,
            "visualize_shadow" => params.visualize_shadow = parse_value(name, value)?,
            "shadow_bias" => params.shadow_bias = parse_value(name, value)?,
            other => warn!("unknown <renderer> attribute '{other}' ignored"),
        }
    }
    Ok(())
}

fn child<'a, 'input>(node: Node<'a, 'input>, tag: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|child| child.has_tag_name(tag))
}

fn required_attr<'a>(node: Node<'a, '_>, name: &str) -> Result<&'a str> {
    node.attribute(name)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("<{}> is missing the '{name}' attribute", node.tag_name().name()))
}

/// Parses an optional attribute, keeping `default` when it is absent.
fn parse_attr<T: SceneValue>(node: Node<'_, '_>, name: &str, default: T) -> Result<T> {
    match node.attribute(name) {
        Some(value) => T::parse(value.trim()).map_err(|err| {
            anyhow!("<{}> attribute '{name}': {err}", node.tag_name().name())
        }),
        None => Ok(default),
    }
}

/// `scale` takes either one uniform factor or three components.
fn parse_scale(node: Node<'_, '_>, default: Vec3) -> Result<Vec3> {
    match node.attribute("scale").map(str::trim) {
        Some(value) if !value.contains(char::is_whitespace) => {
            let factor: f32 = parse_value("scale", value)?;
            Ok(Vec3::splat(factor))
        }
        _ => parse_attr(node, "scale", default),
    }
}

fn parse_value<T: SceneValue>(name: &str, value: &str) -> Result<T> {
    T::parse(value.trim()).map_err(|err| anyhow!("'{name}': {err}"))
}

/// Attribute values the scene format understands.
trait SceneValue: Sized {
    fn parse(text: &str) -> std::result::Result<Self, String>;
}

macro_rules! scene_value_from_str {
    ($($ty:ty),*) => {
        $(impl SceneValue for $ty {
            fn parse(text: &str) -> std::result::Result<Self, String> {
                from_str(text)
            }
        })*
    };
}

scene_value_from_str!(f32, u32, u64, i32, usize);

impl SceneValue for bool {
    fn parse(text: &str) -> std::result::Result<Self, String> {
        match text {
            "1" | "true" | "on" | "yes" => Ok(true),
            "0" | "false" | "off" | "no" => Ok(false),
            other => Err(format!("'{other}' is not a boolean")),
        }
    }
}

impl SceneValue for Vec3 {
    fn parse(text: &str) -> std::result::Result<Self, String> {
        Vec3Value::from_str(text).map(|value| value.0)
    }
}

fn from_str<T>(text: &str) -> std::result::Result<T, String>
where
    T: FromStr,
    T::Err: Display,
{
    text.parse::<T>()
        .map_err(|err| format!("'{text}' is invalid: {err}"))
}

/// Three whitespace separated floats.
struct Vec3Value(Vec3);

impl FromStr for Vec3Value {
    type Err = String;

    fn from_str(text: &str) -> std::result::Result<Self, Self::Err> {
        let components = text
            .split_whitespace()
            .map(from_str::<f32>)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        match components.as_slice() {
            [x, y, z] => Ok(Self(Vec3::new(*x, *y, *z))),
            _ => Err(format!(
                "expected 3 components, found {} in '{text}'",
                components.len()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
    <scene>
        <camera position="1 2 3" pitch="-10" yaw="45" fov="70"/>
        <model name="sponza" path="models/sponza.obj"/>
        <model name="cube" path="/abs/cube.obj"/>
        <instance model="sponza" scale="0.01"/>
        <instance model="cube" position="0 1 0" rotation="0 90 0" scale="1 2 1"/>
        <flashlight position="0 3 0" pitch="-30" color="2 2 1.5" cutoff="25" follow="true"/>
        <ambient>0.1 0.1 0.2</ambient>
        <renderer gamma="1.8" vpl_count="32" indirect="off" visualize_buffer="2"/>
    </scene>
    "#;

    #[test]
    fn parse_scene_populates_every_section() {
        let config = SceneConfig::from_xml(SAMPLE, Path::new("/data")).unwrap();
        assert_eq!(config.camera.position(), Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(config.camera.pitch(), -10.0);
        assert_eq!(config.projection.fov_y_degrees, 70.0);

        assert_eq!(config.models.len(), 2);
        assert_eq!(config.models[0].path, PathBuf::from("/data/models/sponza.obj"));
        assert_eq!(config.models[1].path, PathBuf::from("/abs/cube.obj"));

        assert_eq!(config.instances[0].transform.scale, Vec3::splat(0.01));
        assert_eq!(config.instances[1].transform.rotation, Vec3::new(0.0, 90.0, 0.0));
        assert_eq!(config.instances[1].transform.scale, Vec3::new(1.0, 2.0, 1.0));

        assert_eq!(config.flashlight.cutoff, 25.0);
        assert!(config.flashlight.follow_camera);
        assert_eq!(config.flashlight.color, Vec3::new(2.0, 2.0, 1.5));

        assert_eq!(config.params.ambient, Vec3::new(0.1, 0.1, 0.2));
        assert_eq!(config.params.gamma, 1.8);
        assert_eq!(config.params.vpl_count, 32);
        assert!(!config.params.indirect_enabled);
        assert_eq!(config.params.visualize_buffer, 2);
    }

    #[test]
    fn empty_scene_uses_demo_defaults() {
        let config = SceneConfig::from_xml("<scene/>", Path::new("")).unwrap();
        assert_eq!(config.camera.position(), Vec3::new(0.0, 2.0, 2.0));
        assert_eq!(config.lights.len(), MAX_LIGHTS);
        assert_eq!(config.params, RendererParams::default());
        assert!(config.instances.is_empty());
    }

    #[test]
    fn listed_lights_override_random_ones() {
        let xml = r#"
        <scene>
            <lights count="8"/>
            <light position="1 1 1" color="1 0 0"/>
        </scene>"#;
        let config = SceneConfig::from_xml(xml, Path::new("")).unwrap();
        let LightSetup::Fixed(lights) = &config.lights else {
            panic!("expected fixed lights");
        };
        assert_eq!(lights.len(), 1);
        assert_eq!(lights[0].color, Vec3::X);
        let sampled = config.lights.animator().sample(1.3);
        assert_eq!(sampled[0].position, Vec3::ONE);
    }

    #[test]
    fn random_lights_follow_count_and_seed() {
        let xml = r#"<scene><lights count="4" seed="9" min="0 0 0" max="1 1 1"/></scene>"#;
        let config = SceneConfig::from_xml(xml, Path::new("")).unwrap();
        assert_eq!(
            config.lights,
            LightSetup::Random {
                count: 4,
                seed: 9,
                bounds: LightBounds {
                    min: Vec3::ZERO,
                    max: Vec3::ONE,
                },
            }
        );
        assert_eq!(config.lights.animator().len(), 4);
    }

    #[test]
    fn inverted_or_infinite_light_bounds_are_rejected() {
        let xml = r#"<scene><lights count="4" min="1 1 1" max="0 0 0"/></scene>"#;
        let err = SceneConfig::from_xml(xml, Path::new("")).unwrap_err();
        assert!(err.to_string().contains("exceeds max"), "{err}");

        let xml = r#"<scene><lights min="0 0 0" max="1 inf 1"/></scene>"#;
        assert!(SceneConfig::from_xml(xml, Path::new("")).is_err());

        let xml = r#"<scene><lights min="0 0 0" max="0 0 0"/></scene>"#;
        let config = SceneConfig::from_xml(xml, Path::new("")).unwrap();
        assert!(config.lights.animator().sample(0.0).iter().all(|l| l.position == Vec3::ZERO));
    }

    #[test]
    fn instance_of_unknown_model_is_rejected() {
        let xml = r#"<scene><instance model="ghost"/></scene>"#;
        let err = SceneConfig::from_xml(xml, Path::new("")).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn malformed_values_report_the_attribute() {
        let xml = r#"<scene><camera position="1 2"/></scene>"#;
        let err = SceneConfig::from_xml(xml, Path::new("")).unwrap_err();
        assert!(err.to_string().contains("position"), "{err}");

        let xml = r#"<scene><renderer tone_mapping="maybe"/></scene>"#;
        assert!(SceneConfig::from_xml(xml, Path::new("")).is_err());
    }

    #[test]
    fn wrong_root_is_rejected() {
        assert!(SceneConfig::from_xml("<level/>", Path::new("")).is_err());
    }

    #[test]
    fn duplicate_model_names_are_rejected() {
        let xml = r#"<scene><model name="a" path="a.obj"/><model name="a" path="b.obj"/></scene>"#;
        assert!(SceneConfig::from_xml(xml, Path::new("")).is_err());
    }
}
