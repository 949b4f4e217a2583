//! `KilnApp` trait definition.

use crate::context::AppContext;
use crate::frame::FrameContext;
use winit::event::{DeviceEvent, DeviceId, WindowEvent};

/// Trait for Kiln applications.
///
/// The framework owns the window, GPU context, swapchain and frame
/// synchronization; an application only records draw commands.
pub trait KilnApp: Sized {
    /// Initialize the application.
    ///
    /// Called once after the GPU context, swapchain and render pass exist.
    /// Upload meshes and build pipelines here.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state.
    ///
    /// Called every frame before the slot fence wait.
    ///
    /// # Arguments
    /// * `ctx` - Application context with GPU and window access
    /// * `dt` - Delta time in seconds since last frame
    fn update(&mut self, ctx: &AppContext, dt: f32);

    /// Record a frame.
    ///
    /// The render pass is already begun on `frame.command_buffer` with the
    /// acquired image's framebuffer; the framework ends it, submits and
    /// presents.
    fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()>;

    /// Called after the swapchain was recreated with a new extent. Refresh
    /// anything derived from the window size, such as the camera projection.
    ///
    /// Default implementation does nothing.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle window events.
    ///
    /// Return `true` if the event was handled and should not be processed
    /// further.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Handle device events (raw input).
    #[allow(unused_variables)]
    fn on_device_event(&mut self, device_id: DeviceId, event: &DeviceEvent) {}

    /// Destroy application GPU resources.
    ///
    /// The device is idle when this is called.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
