//! Shaders for the Kiln engine.
//!
//! The GLSL sources in `shaders/` are compiled to SPIR-V at build time with
//! shaderc and embedded in the crate.

use std::io::{self, Cursor};

/// Embedded SPIR-V bytecode (raw bytes, may not be aligned).
mod spirv_bytes {
    /// Mesh vertex shader: push-constant MVP, forwards normal, UV and color.
    pub static MESH_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/mesh.vert.spv"));

    /// Mesh fragment shader: directional light (binding 0), frame tint (binding 1).
    pub static MESH_FRAG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/mesh.frag.spv"));
}

fn words(bytes: &[u8]) -> io::Result<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(bytes))
}

/// Mesh vertex shader as SPIR-V words.
pub fn mesh_vertex_shader() -> io::Result<Vec<u32>> {
    words(spirv_bytes::MESH_VERT)
}

/// Mesh fragment shader as SPIR-V words.
pub fn mesh_fragment_shader() -> io::Result<Vec<u32>> {
    words(spirv_bytes::MESH_FRAG)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn mesh_shaders_load() {
        for shader in [mesh_vertex_shader().unwrap(), mesh_fragment_shader().unwrap()] {
            assert_eq!(shader[0], SPIRV_MAGIC, "Invalid SPIR-V magic number");
            assert!(shader.len() > 20, "Shader too small");
        }
    }

    #[test]
    fn truncated_bytecode_is_rejected() {
        assert!(words(&spirv_bytes::MESH_VERT[..6]).is_err());
    }
}
