//! Application framework for the Kiln engine.
//!
//! This crate provides a trait-based application framework that handles
//! common boilerplate like:
//! - Window creation and accelerator selection
//! - Swapchain creation and recreation on resize or out-of-date results
//! - Frame-in-flight synchronization
//! - Frame pacing
//! - Event loop handling
//!
//! # Example
//!
//! ```no_run
//! use kiln_app::{run_app, AppConfig, AppContext, FrameContext, KilnApp};
//!
//! struct MyApp {
//!     // Application state
//! }
//!
//! impl KilnApp for MyApp {
//!     fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp {})
//!     }
//!
//!     fn update(&mut self, ctx: &AppContext, dt: f32) {
//!         // Update logic
//!     }
//!
//!     fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()> {
//!         // Record draw commands into frame.command_buffer
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::default())
//! }
//! ```

mod app;
pub mod config;
mod context;
mod frame;
pub mod pacing;
mod runner;

pub use app::KilnApp;
pub use config::{AppConfig, DeviceClass, PresentModeSetting};
pub use context::{AppContext, CLEAR_COLOR};
pub use frame::FrameContext;
pub use pacing::{FramePacer, FrameTiming};
pub use runner::run_app;

// Re-export commonly used types for convenience
pub use kiln_core::Camera;
pub use kiln_gpu::{GpuContext, GpuContextBuilder};
pub use winit::event::{DeviceEvent, DeviceId, WindowEvent};
