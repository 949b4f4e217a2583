//! Vertex and mesh types handed to the GPU layer.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4};

use crate::error::{Error, Result};

/// A single mesh vertex as laid out in the vertex buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    /// Object-space position
    pub pos: Vec3,
    /// Unit normal
    pub normal: Vec3,
    /// Texture coordinate, `(-1, -1)` when the mesh has none
    pub tex: Vec2,
    /// Linear RGBA color
    pub color: Vec4,
}

impl Vertex {
    /// Create a new vertex.
    #[inline]
    pub const fn new(pos: Vec3, normal: Vec3, tex: Vec2, color: Vec4) -> Self {
        Self {
            pos,
            normal,
            tex,
            color,
        }
    }
}

/// Per-draw constant block pushed to the vertex stage.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct PushConstants {
    /// Model-view-projection matrix
    pub mvp: Mat4,
}

impl PushConstants {
    /// Combine a view-projection matrix with a model matrix.
    #[inline]
    pub fn new(view_projection: Mat4, model: Mat4) -> Self {
        Self {
            mvp: view_projection * model,
        }
    }

    /// Raw bytes for `vkCmdPushConstants`.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// CPU-resident mesh data produced by an asset loader.
#[derive(Clone, Debug, Default)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl MeshData {
    /// Create mesh data, checking that every index refers to a vertex.
    pub fn new(vertices: Vec<Vertex>, indices: Vec<u32>) -> Result<Self> {
        if let Some(&bad) = indices.iter().find(|&&i| i as usize >= vertices.len()) {
            return Err(Error::InvalidData(format!(
                "index {bad} out of range for {} vertices",
                vertices.len()
            )));
        }
        if indices.len() % 3 != 0 {
            return Err(Error::InvalidData(format!(
                "index count {} is not a multiple of 3",
                indices.len()
            )));
        }
        Ok(Self { vertices, indices })
    }

    /// Number of indices to draw.
    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    /// Vertex data as bytes.
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Index data as bytes.
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    /// A unit cube centered at the origin with one color per face.
    pub fn cube() -> Self {
        // (normal, tangent u, tangent v, color)
        let faces = [
            (Vec3::X, Vec3::NEG_Z, Vec3::Y, Vec4::new(0.9, 0.2, 0.2, 1.0)),
            (Vec3::NEG_X, Vec3::Z, Vec3::Y, Vec4::new(0.2, 0.9, 0.9, 1.0)),
            (Vec3::Y, Vec3::X, Vec3::NEG_Z, Vec4::new(0.2, 0.9, 0.2, 1.0)),
            (Vec3::NEG_Y, Vec3::X, Vec3::Z, Vec4::new(0.9, 0.2, 0.9, 1.0)),
            (Vec3::Z, Vec3::X, Vec3::Y, Vec4::new(0.2, 0.2, 0.9, 1.0)),
            (Vec3::NEG_Z, Vec3::NEG_X, Vec3::Y, Vec4::new(0.9, 0.9, 0.2, 1.0)),
        ];

        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);

        for (normal, u, v, color) in faces {
            let base = vertices.len() as u32;
            let center = normal * 0.5;
            for (su, sv) in [(-0.5, -0.5), (0.5, -0.5), (0.5, 0.5), (-0.5, 0.5)] {
                vertices.push(Vertex::new(
                    center + u * su + v * sv,
                    normal,
                    Vec2::new(su + 0.5, 0.5 - sv),
                    color,
                ));
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        Self { vertices, indices }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 48);
        assert_eq!(std::mem::size_of::<PushConstants>(), 64);
    }

    #[test]
    fn cube_faces_point_outward() {
        let cube = MeshData::cube();
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.index_count(), 36);

        for tri in cube.indices.chunks_exact(3) {
            let a = cube.vertices[tri[0] as usize];
            let b = cube.vertices[tri[1] as usize];
            let c = cube.vertices[tri[2] as usize];
            let winding = (b.pos - a.pos).cross(c.pos - a.pos);
            assert!(winding.dot(a.normal) > 0.0, "triangle {tri:?} faces inward");
        }
    }

    #[test]
    fn rejects_out_of_range_indices() {
        let vertices = vec![Vertex::default(); 3];
        assert!(MeshData::new(vertices.clone(), vec![0, 1, 2]).is_ok());
        assert!(MeshData::new(vertices.clone(), vec![0, 1, 3]).is_err());
        assert!(MeshData::new(vertices, vec![0, 1]).is_err());
    }

    #[test]
    fn byte_views_match_lengths() {
        let cube = MeshData::cube();
        assert_eq!(cube.vertex_bytes().len(), 24 * 48);
        assert_eq!(cube.index_bytes().len(), 36 * 4);
    }
}
