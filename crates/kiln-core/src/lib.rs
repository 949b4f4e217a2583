//! Core types shared across the Kiln engine.
//!
//! This crate provides the plain data the GPU layer consumes from its
//! collaborators:
//! - Vertex and mesh data as produced by an asset loader
//! - Push-constant blocks
//! - Transform composition and a perspective camera
//! - Common error types

pub mod camera;
pub mod error;
pub mod transform;
pub mod types;

pub use camera::Camera;
pub use error::{Error, Result};
pub use transform::Transform;
pub use types::{MeshData, PushConstants, Vertex};

/// Engine-wide constants
pub mod constants {
    /// Default number of frames the host may record ahead of the GPU.
    pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;
    /// Default vertical field of view in degrees.
    pub const DEFAULT_FOV_DEGREES: f32 = 45.0;
}
