//! Model transform composition.
//!
//! Operations compose onto the existing matrix in world space, so a sequence of
//! calls reads in the order the transforms are applied.

use glam::{Mat4, Vec3, Vec4};

/// A model-to-world transform.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    matrix: Mat4,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    /// The identity transform.
    pub const IDENTITY: Self = Self {
        matrix: Mat4::IDENTITY,
    };

    /// Wrap an existing matrix.
    #[inline]
    pub const fn from_matrix(matrix: Mat4) -> Self {
        Self { matrix }
    }

    /// The composed matrix.
    #[inline]
    pub const fn matrix(&self) -> Mat4 {
        self.matrix
    }

    /// World-space translation component.
    #[inline]
    pub fn translation(&self) -> Vec3 {
        self.matrix.w_axis.truncate()
    }

    /// Translate in world space.
    pub fn translate(&mut self, offset: Vec3) -> &mut Self {
        self.matrix = Mat4::from_translation(offset) * self.matrix;
        self
    }

    /// Scale about the world origin.
    pub fn scale(&mut self, factors: Vec3) -> &mut Self {
        self.matrix = Mat4::from_scale(factors) * self.matrix;
        self
    }

    /// Rotate about the object's own position, keeping its translation.
    pub fn rotate(&mut self, degrees: f32, axis: Vec3) -> &mut Self {
        let translation = self.translation();
        self.matrix.w_axis = Vec4::new(0.0, 0.0, 0.0, self.matrix.w_axis.w);
        self.matrix = Mat4::from_axis_angle(axis.normalize(), degrees.to_radians()) * self.matrix;
        self.translate(translation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn translate_accumulates() {
        let mut t = Transform::default();
        t.translate(Vec3::X).translate(Vec3::Y * 2.0);
        assert_eq!(t.translation(), Vec3::new(1.0, 2.0, 0.0));
    }

    #[test]
    fn rotate_keeps_position() {
        let mut t = Transform::default();
        t.translate(Vec3::new(3.0, 0.0, 0.0)).rotate(90.0, Vec3::Y);

        let origin = t.matrix().transform_point3(Vec3::ZERO);
        assert_relative_eq!(origin.x, 3.0, epsilon = 1e-5);
        assert_relative_eq!(origin.z, 0.0, epsilon = 1e-5);

        // +X in object space now points along -Z in world space
        let tip = t.matrix().transform_point3(Vec3::X);
        assert_relative_eq!(tip.x, 3.0, epsilon = 1e-5);
        assert_relative_eq!(tip.z, -1.0, epsilon = 1e-5);
    }

    #[test]
    fn scale_after_translate_scales_translation() {
        let mut t = Transform::default();
        t.translate(Vec3::X).scale(Vec3::splat(2.0));
        assert_relative_eq!(t.translation().x, 2.0);
    }
}
