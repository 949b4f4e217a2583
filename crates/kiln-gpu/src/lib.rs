//! Vulkan device, presentation and frame synchronization layer for the Kiln engine.
//!
//! This crate provides:
//! - Accelerator selection and queue family assignment
//! - Logical device and role queues
//! - Swapchain creation and recreation
//! - Semaphore/fence pool and frame-in-flight tracking
//! - Per-role command pools
//! - Descriptor set aggregation
//! - Memory allocation via gpu-allocator

pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod frame;
pub mod instance;
pub mod memory;
pub mod physical_device;
pub mod pipeline;
pub mod render_pass;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use capabilities::{AcceleratorInfo, GpuVendor, QueueFamilyProbe};
pub use command::{BufferState, CommandBufferId, CommandContext, CommandPool};
pub use context::{GpuContext, GpuContextBuilder, SurfaceTarget};
pub use descriptors::{DescriptorAggregator, DescriptorPlan, DescriptorResource};
pub use device::{LogicalDevice, QueueRole};
pub use error::{ErrorSeverity, GpuError, Result};
pub use frame::{FrameSlot, FrameSlots};
pub use memory::{upload_buffer, GpuAllocator, GpuBuffer};
pub use physical_device::{
    AcceleratorChooser, ConsoleChooser, DeviceRequirements, FixedChooser, PhysicalDevice,
    QueueFamilyIndices,
};
pub use pipeline::{GraphicsPipeline, GraphicsPipelineConfig};
pub use render_pass::RenderPass;
pub use surface::{SurfaceContext, SurfaceSupport};
pub use swapchain::{ExtentSource, Swapchain, SwapchainPlan, SwapchainPreferences};
pub use sync::{FenceId, FrameSync, FrameSyncSet, SemaphoreId, SyncPool};

// Re-export ash and gpu-allocator for downstream crates
pub use ash;
pub use gpu_allocator;
