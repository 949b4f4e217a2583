//! Application runner and event loop.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use kiln_gpu::{ErrorSeverity, FixedChooser, GpuContextBuilder, GpuError, QueueRole};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
#[cfg(feature = "profiling-tracy")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{DeviceEvent, DeviceId, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::KilnApp;
use crate::config::AppConfig;
use crate::context::AppContext;
use crate::frame::FrameContext;
use crate::pacing::FramePacer;

/// Run a KilnApp with the given configuration.
///
/// Initializes logging, creates the window and GPU context, and runs the
/// event loop until the window closes or a frame fails fatally.
pub fn run_app<A: KilnApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    init_tracing();
    config.validate()?;

    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
    };

    if let Err(e) = event_loop.run_app(&mut runner) {
        error!("Event loop error: {e}");
    }

    Ok(())
}

fn init_tracing() {
    #[cfg(feature = "profiling-tracy")]
    {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,kiln_app=trace,kiln_gpu=trace,kiln_viewer=trace")
        });

        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }
    #[cfg(not(feature = "profiling-tracy"))]
    {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    }
}

/// Decide how the loop reacts to a failed frame. Anything that is not a
/// [`GpuError`] came from the application and is fatal.
pub(crate) fn classify(err: &anyhow::Error, surface_stale: bool) -> ErrorSeverity {
    err.downcast_ref::<GpuError>()
        .map_or(ErrorSeverity::Fatal, |gpu| {
            gpu.severity_with_stale_surface(surface_stale)
        })
}

/// What happened to a frame that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameOutcome {
    Presented,
    /// Nothing was submitted because the acquire found the surface out of date.
    Skipped,
    /// The window has no area; nothing can be drawn until it is resized.
    Minimized,
}

impl FrameOutcome {
    /// How the event loop should wait before the next frame.
    fn control_flow(self) -> ControlFlow {
        match self {
            Self::Presented | Self::Skipped => ControlFlow::Poll,
            Self::Minimized => ControlFlow::Wait,
        }
    }
}

/// Internal application runner that implements winit's ApplicationHandler.
struct AppRunner<A: KilnApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
}

/// Internal application state.
struct AppState<A: KilnApp> {
    ctx: AppContext,
    app: A,
    pacer: FramePacer,
    /// Set while the window has no area; redraws wait for a resize.
    minimized: bool,
}

impl<A: KilnApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        // Let the app handle the event first
        if let Some(state) = &mut self.state {
            if state.app.on_event(&event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                self.shutdown(event_loop);
            }
            WindowEvent::RedrawRequested => {
                let Some(state) = &mut self.state else {
                    return;
                };
                let outcome = match state.render_frame() {
                    Ok(outcome) => Some(outcome),
                    Err(e) => match classify(&e, state.ctx.recreate_pending) {
                        ErrorSeverity::Transient => {
                            warn!("Recoverable frame error: {e:#}");
                            state.ctx.request_swapchain_recreation();
                            Some(FrameOutcome::Skipped)
                        }
                        ErrorSeverity::Fatal => {
                            error!("Fatal frame error: {e:#}");
                            None
                        }
                    },
                };

                let Some(outcome) = outcome else {
                    self.shutdown(event_loop);
                    return;
                };
                event_loop.set_control_flow(outcome.control_flow());
                state.minimized = outcome == FrameOutcome::Minimized;
                if !state.minimized {
                    state.ctx.window.request_redraw();
                }
            }
            WindowEvent::Resized(size) => {
                if let Some(state) = &mut self.state {
                    tracing::debug!("Window resized to {}x{}", size.width, size.height);
                    state.ctx.request_swapchain_recreation();
                    state.minimized = false;
                    event_loop.set_control_flow(ControlFlow::Poll);
                    state.ctx.window.request_redraw();
                }
            }
            _ => {}
        }
    }

    fn device_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        device_id: DeviceId,
        event: DeviceEvent,
    ) {
        if let Some(state) = &mut self.state {
            state.app.on_device_event(device_id, &event);
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = self.state.as_ref().filter(|state| !state.minimized) {
            state.ctx.window.request_redraw();
        }
    }

    fn exiting(&mut self, event_loop: &ActiveEventLoop) {
        self.shutdown(event_loop);
    }
}

impl<A: KilnApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));

        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let mut builder = GpuContextBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.validation)
            .preferred_device_type(self.config.device_class.to_vk());
        if let Some(index) = self.config.device_index {
            builder = builder.chooser(FixedChooser(index));
        }
        let gpu = builder.build(window.as_ref())?;

        // SAFETY: gpu was built for this window
        let mut ctx = unsafe { AppContext::new(window, gpu, self.config.clone())? };

        let app = match A::init(&mut ctx) {
            Ok(app) => app,
            Err(e) => {
                // SAFETY: the application never finished creating resources
                unsafe { ctx.cleanup() };
                return Err(e);
            }
        };

        Ok(AppState {
            ctx,
            app,
            pacer: FramePacer::new(self.config.min_frame_time()),
            minimized: false,
        })
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(mut state) = self.state.take() {
            state.cleanup();
        }
        event_loop.exit();
    }
}

impl<A: KilnApp> AppState<A> {
    /// One pass of the frame cycle: wait the slot fence, acquire, record,
    /// reset the fence, submit, present, advance.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render_frame(&mut self) -> anyhow::Result<FrameOutcome> {
        let frame_start = Instant::now();

        if self.ctx.recreate_pending {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.recreate_swapchain").entered();

            if !self.ctx.recreate_swapchain()? {
                return Ok(FrameOutcome::Minimized);
            }
            let (width, height) = (self.ctx.width(), self.ctx.height());
            self.app.on_resize(&mut self.ctx, width, height)?;
            info!("Resized to {width}x{height}");
        }

        let dt = {
            let now = Instant::now();
            let dt = now.duration_since(self.ctx.last_frame_time).as_secs_f32();
            self.ctx.last_frame_time = now;
            dt
        };

        {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.update").entered();
            self.app.update(&self.ctx, dt);
        }

        let slot = self.ctx.slots.current();
        let sync = self.ctx.frame_sync.get(slot);
        let image_available = self.ctx.sync.semaphore(sync.image_available);
        let render_finished = self.ctx.sync.semaphore(sync.render_finished);
        let in_flight = self.ctx.sync.fence(sync.in_flight);

        let image_index = {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.gpu_sync").entered();

            let device = self.ctx.gpu.device();
            // SAFETY: the fence and semaphore belong to this device
            unsafe {
                self.ctx.sync.wait_for_fence(
                    device,
                    sync.in_flight,
                    self.ctx.config.fence_timeout_ns(),
                )?;
                self.ctx.slots.fence_waited(slot)?;

                match self
                    .ctx
                    .swapchain
                    .acquire_next_image(image_available, self.ctx.config.acquire_timeout_ns())
                {
                    Ok((index, suboptimal)) => {
                        if suboptimal {
                            self.ctx.recreate_pending = true;
                        }
                        index
                    }
                    Err(GpuError::SurfaceOutOfDate) => {
                        self.ctx.recreate_pending = true;
                        return Ok(FrameOutcome::Skipped);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.record").entered();

            let device = self.ctx.gpu.device();
            // SAFETY: the slot fence was waited on, so its buffer is idle
            unsafe {
                let slot = self.ctx.slots.begin_recording()?;
                let cmd_id = self.ctx.commands.frame_buffer(QueueRole::Graphics, slot)?;
                let cmd = self.ctx.commands.begin(device, cmd_id)?;

                let framebuffer = self.ctx.swapchain.framebuffer(image_index)?;
                let extent = self.ctx.swapchain.extent();
                self.ctx
                    .render_pass
                    .begin(device, cmd, framebuffer, extent);

                let mut frame = FrameContext {
                    command_buffer: cmd,
                    image_index,
                    framebuffer,
                    extent,
                    slot,
                    dt,
                    frame_number: self.ctx.frame_count,
                };
                let rendered = self.app.render(&self.ctx, &mut frame);

                self.ctx.render_pass.end(device, cmd);
                self.ctx.commands.end(device, cmd_id)?;
                if let Err(e) = rendered {
                    self.ctx.slots.abort_recording(slot);
                    return Err(e);
                }

                #[cfg(feature = "profiling-tracy")]
                let _submit = tracing::trace_span!("frame.submit").entered();
                self.ctx.sync.reset_fence(device, sync.in_flight)?;
                self.ctx.slots.fence_reset(slot)?;
                self.ctx.commands.submit_frame(
                    device,
                    cmd_id,
                    self.ctx.gpu.graphics_queue(),
                    image_available,
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                    render_finished,
                    in_flight,
                )?;
                self.ctx.slots.submitted(slot)?;
            }
        }

        let presented = {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.present").entered();

            let queue = self.ctx.gpu.present_queue()?;
            // SAFETY: the image was acquired this frame and render_finished is
            // signaled by the submission above
            unsafe {
                self.ctx
                    .swapchain
                    .present(queue, image_index, render_finished)
            }
        };

        self.ctx.slots.advance();
        self.ctx.frame_count += 1;

        match presented {
            Ok(false) => {}
            Ok(true) | Err(GpuError::SurfaceOutOfDate) => self.ctx.recreate_pending = true,
            Err(e) => return Err(e.into()),
        }

        #[cfg(feature = "profiling-tracy")]
        let _span = tracing::trace_span!("frame.pacing").entered();
        let timing = self.pacer.end_frame(frame_start);
        tracing::trace!(
            frame = self.ctx.frame_count,
            work_ms = timing.work.as_secs_f64() * 1000.0,
            "frame presented"
        );

        Ok(FrameOutcome::Presented)
    }

    fn cleanup(&mut self) {
        self.pacer.log_statistics();

        info!("Starting cleanup...");
        if let Err(e) = self.ctx.gpu.wait_idle() {
            error!("Failed to wait idle: {e}");
        }

        // Let the app cleanup first
        self.app.cleanup(&mut self.ctx);

        // SAFETY: the device is idle and the app released its resources
        unsafe { self.ctx.cleanup() };

        info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_date_is_recovered() {
        let err = anyhow::Error::from(GpuError::SurfaceOutOfDate);
        assert_eq!(classify(&err, false), ErrorSeverity::Transient);
    }

    #[test]
    fn timeout_fatal_unless_surface_stale() {
        let err = anyhow::Error::from(GpuError::Timeout("frame fence"));
        assert_eq!(classify(&err, false), ErrorSeverity::Fatal);
        assert_eq!(classify(&err, true), ErrorSeverity::Transient);
    }

    #[test]
    fn application_errors_are_fatal() {
        let err = anyhow::anyhow!("shader missing");
        assert_eq!(classify(&err, true), ErrorSeverity::Fatal);
    }

    #[test]
    fn minimized_window_stops_polling() {
        assert_eq!(FrameOutcome::Minimized.control_flow(), ControlFlow::Wait);
        assert_eq!(FrameOutcome::Skipped.control_flow(), ControlFlow::Poll);
        assert_eq!(FrameOutcome::Presented.control_flow(), ControlFlow::Poll);
    }

    #[test]
    fn context_wrapped_gpu_errors_still_classified() {
        let err = anyhow::Error::from(GpuError::SurfaceOutOfDate).context("presenting");
        assert_eq!(classify(&err, false), ErrorSeverity::Transient);
    }
}
