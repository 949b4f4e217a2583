//! Per-frame context for rendering.

use ash::vk;
use kiln_gpu::FrameSlot;

/// Context for the frame being recorded.
pub struct FrameContext {
    /// Command buffer with the render pass already begun.
    pub command_buffer: vk::CommandBuffer,
    /// Index of the acquired swapchain image.
    pub image_index: u32,
    /// Framebuffer wrapping the acquired image.
    pub framebuffer: vk::Framebuffer,
    /// Render area.
    pub extent: vk::Extent2D,
    /// Frame-in-flight slot the commands belong to.
    pub slot: FrameSlot,
    /// Delta time since last frame in seconds.
    pub dt: f32,
    /// Current frame number.
    pub frame_number: u64,
}

impl FrameContext {
    /// Width over height of the render area.
    pub fn aspect_ratio(&self) -> f32 {
        self.extent.width as f32 / self.extent.height.max(1) as f32
    }
}
