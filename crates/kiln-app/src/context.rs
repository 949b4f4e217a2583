//! Application context.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use kiln_gpu::gpu_allocator::MemoryLocation;
use kiln_gpu::{
    upload_buffer, CommandContext, FrameSlots, FrameSyncSet, GpuBuffer,
    GpuContext, GpuError, QueueRole, RenderPass, Swapchain, SwapchainPreferences, SyncPool,
};
use winit::window::Window;

use crate::config::AppConfig;

/// Color the render pass clears each frame to.
pub const CLEAR_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

/// Application context shared across all app methods.
///
/// Owns every window-dependent GPU object. Teardown happens in
/// [`AppContext::cleanup`], children first and the GPU context last.
pub struct AppContext {
    /// The window handle.
    pub window: Arc<Window>,
    /// GPU context with device and queues.
    pub gpu: GpuContext,
    /// Current swapchain with one framebuffer per image.
    pub swapchain: Swapchain,
    /// Render pass targeting the swapchain images.
    pub render_pass: RenderPass,
    /// Per-role command pools.
    pub commands: CommandContext,
    /// Owner of every semaphore and fence.
    pub(crate) sync: SyncPool,
    /// Sync ids per frame-in-flight slot.
    pub(crate) frame_sync: FrameSyncSet,
    /// Frame-in-flight slot tracker.
    pub(crate) slots: FrameSlots,
    /// Total frames rendered.
    pub frame_count: u64,
    /// Time of last frame (for delta time calculation).
    pub(crate) last_frame_time: Instant,
    /// Set when the swapchain must be rebuilt before the next frame.
    pub(crate) recreate_pending: bool,
    /// Runtime configuration.
    pub config: AppConfig,
    cleaned_up: bool,
}

impl AppContext {
    /// Create the swapchain, render pass, sync objects and command pools.
    ///
    /// # Safety
    /// `gpu` must have been built for `window`.
    pub(crate) unsafe fn new(
        window: Arc<Window>,
        gpu: GpuContext,
        config: AppConfig,
    ) -> anyhow::Result<Self> {
        let frames = config.frames_in_flight;
        let slots = FrameSlots::new(frames)?;
        let size = window.inner_size();
        let initial = vk::Extent2D {
            width: size.width.max(1),
            height: size.height.max(1),
        };
        let preferences = SwapchainPreferences {
            present_mode: config.present_mode.to_vk(),
            ..Default::default()
        };

        // SAFETY: gpu is valid and owns a window surface
        let (swapchain, render_pass, sync, frame_sync, commands) = unsafe {
            let device = gpu.device();
            let mut swapchain = Swapchain::new(&gpu, &initial, preferences)?;
            let render_pass = RenderPass::new(device, swapchain.format(), CLEAR_COLOR)?;
            swapchain.create_framebuffers(device, render_pass.handle())?;

            let mut sync = SyncPool::new();
            let frame_sync = FrameSyncSet::new(&mut sync, device, frames)?;

            let mut commands = CommandContext::new(device, &gpu.queue_families())?;
            // One primary graphics buffer per slot, reached via frame_buffer()
            commands.add_buffers(device, QueueRole::Graphics, frames as u32)?;
            (swapchain, render_pass, sync, frame_sync, commands)
        };

        tracing::info!(
            "Frame resources ready: {} frames in flight, {} swapchain images",
            frames,
            swapchain.image_count()
        );

        Ok(Self {
            window,
            gpu,
            swapchain,
            render_pass,
            commands,
            sync,
            frame_sync,
            slots,
            frame_count: 0,
            last_frame_time: Instant::now(),
            recreate_pending: false,
            config,
            cleaned_up: false,
        })
    }

    /// Get the current swapchain extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    /// Get the swapchain width.
    pub fn width(&self) -> u32 {
        self.swapchain.extent().width
    }

    /// Get the swapchain height.
    pub fn height(&self) -> u32 {
        self.swapchain.extent().height
    }

    /// Get the aspect ratio (width / height).
    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.swapchain.extent();
        extent.width as f32 / extent.height.max(1) as f32
    }

    /// Get the number of frames in flight.
    pub fn frames_in_flight(&self) -> usize {
        self.slots.count()
    }

    /// Ask for the swapchain to be rebuilt before the next frame.
    pub fn request_swapchain_recreation(&mut self) {
        self.recreate_pending = true;
    }

    /// Whether a swapchain rebuild is pending.
    pub fn swapchain_recreation_pending(&self) -> bool {
        self.recreate_pending
    }

    /// Copy `data` into a device-local buffer through the transfer queue.
    pub fn upload(
        &self,
        data: &[u8],
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> anyhow::Result<GpuBuffer> {
        // SAFETY: all handles come from the same context
        let buffer = unsafe {
            upload_buffer(
                self.gpu.device(),
                self.gpu.allocator(),
                &self.commands,
                self.gpu.transfer_queue(),
                self.gpu.queue_families().graphics,
                data,
                usage,
                name,
            )?
        };
        Ok(buffer)
    }

    /// Allocate a persistently mapped buffer for per-frame host writes.
    pub fn create_host_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> anyhow::Result<GpuBuffer> {
        let graphics = self.gpu.queue_families().graphics;
        let buffer = self.gpu.allocator().lock().create_buffer(
            size,
            usage,
            MemoryLocation::CpuToGpu,
            &[graphics],
            name,
        )?;
        Ok(buffer)
    }

    /// Release a buffer from [`AppContext::upload`] or
    /// [`AppContext::create_host_buffer`].
    pub fn free_buffer(&self, buffer: &mut GpuBuffer) -> anyhow::Result<()> {
        self.gpu.allocator().lock().free_buffer(buffer)?;
        Ok(())
    }

    /// Rebuild the swapchain at the window's current size.
    ///
    /// Returns `false` while the window has no area; the rebuild stays
    /// pending and the caller should skip the frame.
    pub(crate) fn recreate_swapchain(&mut self) -> anyhow::Result<bool> {
        let window = Arc::clone(&self.window);
        let extent_source = move || {
            let size = window.inner_size();
            (size.width, size.height)
        };

        // SAFETY: the swapchain was created from self.gpu
        match unsafe { self.swapchain.recreate(&self.gpu, &extent_source) } {
            Ok(()) => {
                // recreate() idled the device, so no slot is still in flight
                self.slots.device_idle();
                self.recreate_pending = false;
                Ok(true)
            }
            Err(GpuError::ZeroExtent { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Destroy every object this context created, then the GPU context.
    ///
    /// # Safety
    /// The application must already have released its own GPU resources.
    pub(crate) unsafe fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;

        if let Err(e) = self.gpu.wait_idle() {
            tracing::error!("Failed to wait idle: {e}");
        }

        // SAFETY: the device is idle and nothing else references these objects
        unsafe {
            let device = self.gpu.device();
            self.commands.destroy(self.gpu.logical_device());
            self.sync.destroy(device);
            self.swapchain.destroy(device);
            self.render_pass.destroy(device);
            self.gpu.destroy();
        }
    }
}
