use ultraviolet::{Rotor3, Vec3};

use super::{Camera, CameraController};

const MIN_DISTANCE: f32 = 0.05;

/// Circles a target point at a fixed distance.
#[derive(Debug, Clone)]
pub struct OrbitController {
    pub target: Vec3,
    pub distance: f32,
    pub pitch: f32,
    pub yaw: f32,
    pub sensitivity: f32,
}

impl OrbitController {
    pub fn new(target: Vec3, distance: f32, sensitivity: f32) -> Self {
        Self {
            target,
            distance: distance.max(MIN_DISTANCE),
            pitch: 0.0,
            yaw: 0.0,
            sensitivity,
        }
    }

    pub fn rotate(&mut self, dx: f32, dy: f32) {
        let max_pitch = 88f32.to_radians();
        self.yaw -= dx * self.sensitivity;
        self.pitch = (self.pitch - dy * self.sensitivity).clamp(-max_pitch, max_pitch);
    }

    /// Moves towards the target, never through it.
    pub fn move_forward(&mut self, amount: f32) {
        self.distance = (self.distance - amount).max(MIN_DISTANCE);
    }

    /// Pans the target in the view plane.
    pub fn move_perpendicular(&mut self, dx: f32, dy: f32) {
        let orientation = self.orientation();
        self.target += orientation * Camera::right() * dx + orientation * Camera::up() * dy;
    }
}

impl CameraController for OrbitController {
    fn position(&self) -> Vec3 {
        self.target - (self.orientation() * Camera::forward()) * self.distance
    }

    fn orientation(&self) -> Rotor3 {
        Rotor3::from_rotation_xz(self.yaw) * Rotor3::from_rotation_yz(self.pitch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_on_sphere_and_faces_target() {
        let mut orbit = OrbitController::new(Vec3::new(1.0, 0.5, 0.0), 4.0, 0.01);
        orbit.rotate(40.0, -25.0);

        let mut camera = Camera::new(Default::default());
        camera.update_camera(&orbit);
        assert!(((camera.position - orbit.target).mag() - 4.0).abs() < 1e-4);
        let to_target = (orbit.target - camera.position).normalized();
        assert!((camera.target() - camera.position - to_target).mag() < 1e-4);
    }

    #[test]
    fn pitch_is_clamped() {
        let mut orbit = OrbitController::new(Vec3::zero(), 2.0, 1.0);
        orbit.rotate(0.0, 1000.0);
        assert!(orbit.pitch.abs() <= 88f32.to_radians() + 1e-6);
        orbit.move_forward(10.0);
        assert_eq!(orbit.distance, MIN_DISTANCE);
    }
}
