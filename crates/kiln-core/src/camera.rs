//! Perspective camera producing a view-projection matrix.

use glam::{Mat4, Vec3};

use crate::constants::DEFAULT_FOV_DEGREES;

/// First-person camera.
///
/// The projection depends on the presentation extent, so callers refresh it
/// with [`Camera::set_viewport`] whenever the swapchain is recreated.
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    /// Rotation around the world up axis, in degrees.
    pub yaw: f32,
    /// Rotation above the horizon, in degrees.
    pub pitch: f32,
    /// Vertical field of view, in degrees.
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
    pub mouse_sensitivity: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 3.0),
            yaw: -90.0,
            pitch: 0.0,
            fov: DEFAULT_FOV_DEGREES,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
            mouse_sensitivity: 0.25,
        }
    }
}

impl Camera {
    /// Create a camera for a viewport of the given size.
    pub fn new(fov: f32, width: u32, height: u32) -> Self {
        let mut camera = Self {
            fov,
            ..Default::default()
        };
        camera.set_viewport(width, height);
        camera
    }

    /// Update the aspect ratio after a resize. Zero-sized viewports are ignored.
    pub fn set_viewport(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.aspect = width as f32 / height as f32;
        }
    }

    /// Unit vector the camera looks along.
    pub fn front(&self) -> Vec3 {
        let (yaw, pitch) = (self.yaw.to_radians(), self.pitch.to_radians());
        Vec3::new(yaw.cos() * pitch.cos(), pitch.sin(), yaw.sin() * pitch.cos()).normalize()
    }

    /// Unit vector to the camera's right.
    pub fn right(&self) -> Vec3 {
        self.front().cross(Vec3::Y).normalize()
    }

    pub fn move_front(&mut self, amount: f32) {
        self.position += self.front() * amount;
    }

    pub fn move_right(&mut self, amount: f32) {
        self.position += self.right() * amount;
    }

    pub fn move_down(&mut self, amount: f32) {
        self.position -= Vec3::Y * amount;
    }

    /// Apply relative mouse motion. Pitch is clamped short of the poles.
    pub fn on_mouse_move(&mut self, dx: f32, dy: f32) {
        self.yaw += dx * self.mouse_sensitivity;
        self.pitch = (self.pitch - dy * self.mouse_sensitivity).clamp(-89.0, 89.0);
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.front(), Vec3::Y)
    }

    /// Projection with Vulkan's downward Y and `[0, 1]` depth.
    pub fn projection_matrix(&self) -> Mat4 {
        let mut projection =
            Mat4::perspective_rh(self.fov.to_radians(), self.aspect, self.near, self.far);
        projection.y_axis.y *= -1.0;
        projection
    }

    /// Get the view-projection matrix.
    pub fn view_projection(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn viewport_updates_aspect() {
        let mut camera = Camera::new(45.0, 800, 600);
        assert_relative_eq!(camera.aspect, 800.0 / 600.0);

        camera.set_viewport(1920, 1080);
        assert_relative_eq!(camera.aspect, 1920.0 / 1080.0);

        camera.set_viewport(0, 1080);
        assert_relative_eq!(camera.aspect, 1920.0 / 1080.0);
    }

    #[test]
    fn default_camera_looks_down_negative_z() {
        let camera = Camera::default();
        let front = camera.front();
        assert_relative_eq!(front.z, -1.0, epsilon = 1e-5);
    }

    #[test]
    fn point_in_front_lands_inside_clip_volume() {
        let camera = Camera::new(45.0, 800, 600);
        let clip = camera.view_projection() * Vec3::ZERO.extend(1.0);
        let ndc = clip.truncate() / clip.w;
        assert!(ndc.x.abs() <= 1.0 && ndc.y.abs() <= 1.0);
        assert!((0.0..=1.0).contains(&ndc.z));
    }

    #[test]
    fn pitch_is_clamped() {
        let mut camera = Camera::default();
        camera.on_mouse_move(0.0, -10_000.0);
        assert_relative_eq!(camera.pitch, 89.0);
    }
}
