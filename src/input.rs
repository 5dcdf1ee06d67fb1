use std::collections::HashSet;

use glam::Vec2;
use winit::event::MouseButton;
use winit::keyboard::KeyCode;

/// Keyboard and mouse state captured for a single frame.
#[derive(Debug, Clone, Default, PartialEq)]
struct FrameInput {
    keys: HashSet<KeyCode>,
    mouse_buttons: HashSet<MouseButton>,
    mouse_position: Vec2,
}

/// Input snapshot for the current and the previous frame.
///
/// Window events mutate the current frame; `begin_frame` rolls it over so
/// edge queries (`was_key_pressed`) and the mouse delta compare the two.
#[derive(Debug, Default)]
pub struct InputState {
    this_frame: FrameInput,
    last_frame: FrameInput,
}

impl InputState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new frame, remembering the state seen during the last one.
    pub fn begin_frame(&mut self) {
        self.last_frame = self.this_frame.clone();
    }

    pub fn set_key_down(&mut self, key: KeyCode) {
        self.this_frame.keys.insert(key);
    }

    pub fn set_key_up(&mut self, key: KeyCode) {
        self.this_frame.keys.remove(&key);
    }

    pub fn set_mouse_button_down(&mut self, button: MouseButton) {
        self.this_frame.mouse_buttons.insert(button);
    }

    pub fn set_mouse_button_up(&mut self, button: MouseButton) {
        self.this_frame.mouse_buttons.remove(&button);
    }

    pub fn set_mouse_position(&mut self, position: Vec2) {
        self.this_frame.mouse_position = position;
    }

    pub fn is_key_down(&self, key: KeyCode) -> bool {
        self.this_frame.keys.contains(&key)
    }

    pub fn is_mouse_button_down(&self, button: MouseButton) -> bool {
        self.this_frame.mouse_buttons.contains(&button)
    }

    pub fn was_key_pressed(&self, key: KeyCode) -> bool {
        self.this_frame.keys.contains(&key) && !self.last_frame.keys.contains(&key)
    }

    pub fn was_key_released(&self, key: KeyCode) -> bool {
        !self.this_frame.keys.contains(&key) && self.last_frame.keys.contains(&key)
    }

    pub fn mouse_position(&self) -> Vec2 {
        self.this_frame.mouse_position
    }

    pub fn mouse_delta(&self) -> Vec2 {
        self.this_frame.mouse_position - self.last_frame.mouse_position
    }
}
