pub mod orbit_controller;

use ultraviolet::{projection, Mat4, Rotor3, Vec3};

use crate::render::shader_types::{mat4_to_array, Params};

/// Anything that can place the camera.
pub trait CameraController {
    fn position(&self) -> Vec3;
    fn orientation(&self) -> Rotor3;
}

#[derive(Debug)]
pub struct Camera {
    pub position: Vec3,
    pub orientation: Rotor3,
    pub settings: CameraSettings,
}

#[derive(Debug, Clone, Copy)]
pub struct CameraSettings {
    pub z_near: f32,
    pub z_far: f32,
    /// Vertical, in radians.
    pub fov: f32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            z_near: 0.1,
            z_far: 10000.0,
            fov: 60f32.to_radians(),
        }
    }
}

impl Camera {
    pub fn new(settings: CameraSettings) -> Self {
        Self {
            position: Vec3::zero(),
            orientation: Rotor3::identity(),
            settings,
        }
    }

    /// Positions the camera
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at(self.position, self.target(), Camera::up())
    }

    pub fn projection_matrix(&self, aspect_ratio: f32) -> Mat4 {
        projection::rh_yup::perspective_vk(
            self.settings.fov,
            aspect_ratio,
            self.settings.z_near,
            self.settings.z_far,
        )
    }

    /// The point one unit in front of the camera.
    pub fn target(&self) -> Vec3 {
        self.position + self.orientation * Camera::forward()
    }

    pub fn update_camera(&mut self, controller: &impl CameraController) {
        self.position = controller.position();
        self.orientation = controller.orientation();
    }

    /// View state for a `width` x `height` frame. The sample index in `eye.w`
    /// is left at 0, the view channel stamps it.
    pub fn view_params(&self, width: u32, height: u32, ao_radius: f32) -> Params {
        let (width, height) = (width.max(1) as f32, height.max(1) as f32);
        let view_projection = self.projection_matrix(width / height) * self.view_matrix();
        let (eye, center) = (self.position, self.target());

        Params {
            eye: [eye.x, eye.y, eye.z, 0.0],
            center: [center.x, center.y, center.z, 0.0],
            near_far: [self.settings.z_near, self.settings.z_far, ao_radius, 0.0],
            screen_dims: [width, height, 1.0 / width, 1.0 / height],
            view_proj_inv: mat4_to_array(&view_projection.inversed()),
        }
    }

    /// in world-space
    pub const fn forward() -> Vec3 {
        Vec3::new(0.0, 0.0, -1.0)
    }

    /// in world-space
    pub const fn right() -> Vec3 {
        Vec3::new(1.0, 0.0, 0.0)
    }

    /// in world-space
    pub const fn up() -> Vec3 {
        Vec3::new(0.0, 1.0, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::camera_ray;

    #[test]
    fn center_pixel_looks_forward() {
        let mut camera = Camera::new(CameraSettings::default());
        camera.position = Vec3::new(0.0, 1.0, 5.0);

        let params = camera.view_params(3, 3, 2.0);
        assert_eq!(params.width(), 3);
        assert_eq!(params.near_far[2], 2.0);

        let ray = camera_ray(&params, 4, 0);
        assert!((ray.origin() - camera.position).mag() < 1e-5);
        assert!((ray.direction() - Camera::forward()).mag() < 1e-3);
    }

    #[test]
    fn top_left_pixel_looks_up_and_left() {
        let camera = Camera::new(CameraSettings::default());
        let params = camera.view_params(4, 4, 1.0);
        let direction = camera_ray(&params, 0, 0).direction();
        assert!(direction.x < 0.0);
        assert!(direction.y > 0.0);
        assert!(direction.z < 0.0);
    }
}
