use glam::{Mat4, Vec3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::camera::Camera;

/// Upper bound on point lights the lighting pass evaluates.
pub const MAX_LIGHTS: usize = 32;

const SHADOW_NEAR: f32 = 0.1;
const SHADOW_FAR: f32 = 100.0;

/// Point light.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointLight {
    pub position: Vec3,
    pub color: Vec3,
}

/// Spotlight that also renders the shadow map and the RSM.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Flashlight {
    pub camera: Camera,
    pub color: Vec3,
    /// Half angle of the cone in degrees.
    pub cutoff: f32,
    /// Copy the main camera pose every frame.
    pub follow_camera: bool,
}

impl Default for Flashlight {
    fn default() -> Self {
        Self {
            camera: Camera::new(Vec3::new(0.0, 2.0, 2.0), 0.0, 0.0),
            color: Vec3::splat(1.0),
            cutoff: 30.0,
            follow_camera: false,
        }
    }
}

impl Flashlight {
    pub fn direction(&self) -> Vec3 {
        self.camera.direction()
    }

    /// Perspective covering the full cone (field of view = 2 x cutoff).
    pub fn projection_matrix(&self) -> Mat4 {
        let fov = (2.0 * self.cutoff).clamp(1.0, 179.0);
        Mat4::perspective_rh(fov.to_radians(), 1.0, SHADOW_NEAR, SHADOW_FAR)
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection_matrix() * self.camera.view_matrix()
    }
}

/// Axis aligned region random lights are scattered in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LightBounds {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for LightBounds {
    fn default() -> Self {
        Self {
            min: Vec3::new(-7.5, 0.0, -15.0),
            max: Vec3::new(7.5, 7.5, 5.0),
        }
    }
}

/// Generates `count` lights with random positions inside `bounds` and random colors.
pub fn random_lights(rng: &mut impl Rng, count: usize, bounds: LightBounds) -> Vec<PointLight> {
    (0..count)
        .map(|_| PointLight {
            position: Vec3::new(
                rng.gen_range(bounds.min.x..=bounds.max.x),
                rng.gen_range(bounds.min.y..=bounds.max.y),
                rng.gen_range(bounds.min.z..=bounds.max.z),
            ),
            color: Vec3::new(rng.gen(), rng.gen(), rng.gen()),
        })
        .collect()
}

/// Blends between two light sets of equal length.
///
/// The blend factor oscillates with `(sin(t) + 1) / 2` and is smoothed with a
/// smoothstep before interpolating positions and colors.
#[derive(Debug, Clone)]
pub struct LightAnimator {
    from: Vec<PointLight>,
    to: Vec<PointLight>,
}

impl LightAnimator {
    pub fn new(from: Vec<PointLight>, to: Vec<PointLight>) -> Self {
        let len = from.len().min(to.len());
        let mut from = from;
        let mut to = to;
        from.truncate(len);
        to.truncate(len);
        Self { from, to }
    }

    pub fn random(seed: u64, count: usize, bounds: LightBounds) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let from = random_lights(&mut rng, count, bounds);
        let to = random_lights(&mut rng, count, bounds);
        Self::new(from, to)
    }

    pub fn len(&self) -> usize {
        self.from.len()
    }

    pub fn is_empty(&self) -> bool {
        self.from.is_empty()
    }

    pub fn sample(&self, time_seconds: f32) -> Vec<PointLight> {
        let factor = smoothstep((time_seconds.sin() + 1.0) / 2.0);
        self.from
            .iter()
            .zip(&self.to)
            .map(|(a, b)| PointLight {
                position: a.position.lerp(b.position, factor),
                color: a.color.lerp(b.color, factor),
            })
            .collect()
    }
}

fn smoothstep(x: f32) -> f32 {
    let t = x.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_lights_stay_in_bounds() {
        let bounds = LightBounds::default();
        let mut rng = StdRng::seed_from_u64(7);
        for light in random_lights(&mut rng, 64, bounds) {
            assert!(light.position.cmpge(bounds.min).all());
            assert!(light.position.cmple(bounds.max).all());
            assert!(light.color.cmpge(Vec3::ZERO).all());
            assert!(light.color.cmple(Vec3::ONE).all());
        }
    }

    #[test]
    fn animator_hits_both_endpoints() {
        let a = PointLight {
            position: Vec3::ZERO,
            color: Vec3::X,
        };
        let b = PointLight {
            position: Vec3::splat(2.0),
            color: Vec3::Y,
        };
        let animator = LightAnimator::new(vec![a], vec![b]);
        let start = animator.sample(-std::f32::consts::FRAC_PI_2);
        assert!((start[0].position - a.position).length() < 1e-5);
        let end = animator.sample(std::f32::consts::FRAC_PI_2);
        assert!((end[0].position - b.position).length() < 1e-5);
        assert!((end[0].color - b.color).length() < 1e-5);
    }

    #[test]
    fn flashlight_frustum_contains_its_axis() {
        let flashlight = Flashlight::default();
        let ahead = flashlight.camera.position() + flashlight.direction() * 5.0;
        let clip = flashlight.view_projection() * ahead.extend(1.0);
        let ndc = clip.truncate() / clip.w;
        assert!(ndc.x.abs() < 1e-4 && ndc.y.abs() < 1e-4);
        assert!(ndc.z > 0.0 && ndc.z < 1.0);
    }
}
