use glam::{Mat3, Mat4, Vec3};
use serde::{Deserialize, Serialize};
use winit::event::MouseButton;
use winit::keyboard::KeyCode;

use crate::input::InputState;

/// Margin that keeps the pitch away from the poles of the look-at basis.
pub const PITCH_EPSILON: f32 = 0.1;

const WORLD_UP: Vec3 = Vec3::Y;
const MOUSE_SENSITIVITY: f32 = 0.1;
const MOVEMENT_SPEED: f32 = 0.1;

/// First person pose: pitch/yaw in degrees plus a position.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Camera {
    pitch: f32,
    yaw: f32,
    position: Vec3,
}

impl Camera {
    pub fn new(position: Vec3, pitch: f32, yaw: f32) -> Self {
        let mut camera = Self {
            position,
            ..Self::default()
        };
        camera.set_pitch(pitch);
        camera.set_yaw(yaw);
        camera
    }

    /// Clamps into `[-(90 - ε), 90 - ε]`.
    pub fn set_pitch(&mut self, pitch: f32) {
        let limit = 90.0 - PITCH_EPSILON;
        self.pitch = if pitch.is_nan() {
            0.0
        } else {
            pitch.clamp(-limit, limit)
        };
    }

    /// Wraps into `[0, 360)`.
    pub fn set_yaw(&mut self, yaw: f32) {
        if !yaw.is_finite() {
            self.yaw = 0.0;
            return;
        }
        let wrapped = yaw.rem_euclid(360.0);
        // rem_euclid can round up to exactly 360 for tiny negative inputs
        self.yaw = if wrapped >= 360.0 { 0.0 } else { wrapped };
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    pub fn pitch(&self) -> f32 {
        self.pitch
    }

    pub fn yaw(&self) -> f32 {
        self.yaw
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    /// Forward vector: -Z pitched about X, then turned about Y.
    pub fn direction(&self) -> Vec3 {
        let pitched = Mat3::from_rotation_x(self.pitch.to_radians()) * Vec3::NEG_Z;
        Mat3::from_rotation_y(self.yaw.to_radians()) * pitched
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.position + self.direction(), WORLD_UP)
    }
}

/// Perspective parameters of the main view.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub fov_y_degrees: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Projection {
    fn default() -> Self {
        Self {
            fov_y_degrees: 60.0,
            near: 0.1,
            far: 250.0,
        }
    }
}

impl Projection {
    pub fn matrix(&self, aspect: f32) -> Mat4 {
        Mat4::perspective_rh(
            self.fov_y_degrees.to_radians(),
            aspect.max(0.01),
            self.near,
            self.far,
        )
    }
}

/// Mouse-look and WASD movement around a `Camera`.
#[derive(Debug, Clone, Default)]
pub struct FpsController {
    pub camera: Camera,
}

impl FpsController {
    pub fn new(camera: Camera) -> Self {
        Self { camera }
    }

    pub fn update(&mut self, input: &InputState) {
        if input.is_mouse_button_down(MouseButton::Right) {
            let delta = input.mouse_delta();
            let yaw = self.camera.yaw() - delta.x * MOUSE_SENSITIVITY;
            let pitch = self.camera.pitch() - delta.y * MOUSE_SENSITIVITY;
            self.camera.set_yaw(yaw);
            self.camera.set_pitch(pitch);
        }

        let forward = self.camera.direction();
        let right = Mat3::from_rotation_y(-90f32.to_radians()) * Vec3::new(forward.x, 0.0, forward.z);
        let axis = |positive: KeyCode, negative: KeyCode| {
            let mut value = 0.0;
            if input.is_key_down(positive) {
                value += 1.0;
            }
            if input.is_key_down(negative) {
                value -= 1.0;
            }
            value
        };
        let mut wish = forward * axis(KeyCode::KeyW, KeyCode::KeyS)
            + right * axis(KeyCode::KeyD, KeyCode::KeyA);
        if wish.length() > 0.001 {
            wish = wish.normalize();
        }
        self.camera
            .set_position(self.camera.position() + wish * MOVEMENT_SPEED);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec2;

    fn approx(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-5
    }

    #[test]
    fn pitch_is_clamped_away_from_the_poles() {
        let mut camera = Camera::default();
        for pitch in [-1000.0, -90.0, -89.95, 0.0, 45.0, 89.95, 90.0, 1000.0] {
            camera.set_pitch(pitch);
            assert!(camera.pitch() > -90.0 && camera.pitch() < 90.0);
            assert!(camera.pitch().abs() <= 90.0 - PITCH_EPSILON + 1e-4);
        }
        camera.set_pitch(30.0);
        assert_eq!(camera.pitch(), 30.0);
    }

    #[test]
    fn yaw_wraps_into_range() {
        let mut camera = Camera::default();
        for (input, expected) in [(0.0, 0.0), (360.0, 0.0), (370.0, 10.0), (-10.0, 350.0), (725.0, 5.0)] {
            camera.set_yaw(input);
            assert!((camera.yaw() - expected).abs() < 1e-3, "{input} -> {}", camera.yaw());
        }
        camera.set_yaw(-1e-9);
        assert!(camera.yaw() >= 0.0 && camera.yaw() < 360.0);
    }

    #[test]
    fn direction_follows_pitch_and_yaw() {
        let camera = Camera::new(Vec3::ZERO, 0.0, 0.0);
        assert!(approx(camera.direction(), Vec3::NEG_Z));

        let camera = Camera::new(Vec3::ZERO, 0.0, 90.0);
        assert!(approx(camera.direction(), Vec3::NEG_X));

        let camera = Camera::new(Vec3::ZERO, 45.0, 0.0);
        let dir = camera.direction();
        assert!(dir.y > 0.7 && dir.z < -0.7);
    }

    #[test]
    fn view_matrix_maps_forward_to_negative_z() {
        let camera = Camera::new(Vec3::new(1.0, 2.0, 3.0), 20.0, 135.0);
        let ahead = camera.position() + camera.direction() * 5.0;
        let view_space = camera.view_matrix().transform_point3(ahead);
        assert!(approx(view_space, Vec3::new(0.0, 0.0, -5.0)));
    }

    #[test]
    fn controller_moves_forward_and_strafes() {
        let mut controller = FpsController::new(Camera::default());
        let mut input = InputState::new();
        input.set_key_down(KeyCode::KeyW);
        controller.update(&input);
        assert!(approx(controller.camera.position(), Vec3::new(0.0, 0.0, -MOVEMENT_SPEED)));

        input.set_key_up(KeyCode::KeyW);
        input.set_key_down(KeyCode::KeyD);
        controller.update(&input);
        assert!(controller.camera.position().x > 0.0);
    }

    #[test]
    fn controller_mouse_look_requires_right_button() {
        let mut controller = FpsController::new(Camera::default());
        let mut input = InputState::new();
        input.begin_frame();
        input.set_mouse_position(Vec2::new(50.0, 0.0));
        controller.update(&input);
        assert_eq!(controller.camera.yaw(), 0.0);

        input.set_mouse_button_down(MouseButton::Right);
        controller.update(&input);
        assert!((controller.camera.yaw() - 355.0).abs() < 1e-3);
    }
}
