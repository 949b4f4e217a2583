//! GPU context management.

use crate::capabilities::AcceleratorInfo;
use crate::device::LogicalDevice;
use crate::error::{GpuError, Result};
use crate::instance::create_instance;
use crate::memory::GpuAllocator;
use crate::physical_device::{
    AcceleratorChooser, ConsoleChooser, DeviceRequirements, PhysicalDevice, QueueFamilyIndices,
    swapchain_extension,
};
use crate::surface::SurfaceContext;
use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};

/// Whether the context renders to a window.
pub enum SurfaceTarget {
    Windowed(SurfaceContext),
    Headless,
}

/// Main GPU context holding Vulkan resources.
///
/// Sole owner of the instance, surface and logical device. Everything else
/// borrows it and must be destroyed before [`GpuContext::destroy`] runs.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    surface: SurfaceTarget,
    physical: PhysicalDevice,
    device: LogicalDevice,
    allocator: Mutex<GpuAllocator>,
    destroyed: bool,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        self.device.device()
    }

    /// Get the logical device with its queues.
    pub fn logical_device(&self) -> &LogicalDevice {
        &self.device
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical.handle()
    }

    /// Capabilities of the selected accelerator.
    pub fn accelerator(&self) -> &AcceleratorInfo {
        self.physical.info()
    }

    /// Queue family assignment.
    pub fn queue_families(&self) -> QueueFamilyIndices {
        self.physical.queue_families()
    }

    /// Get the graphics queue.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.device.graphics_queue()
    }

    /// Get the compute queue.
    pub fn compute_queue(&self) -> vk::Queue {
        self.device.compute_queue()
    }

    /// Get the transfer queue.
    pub fn transfer_queue(&self) -> vk::Queue {
        self.device.transfer_queue()
    }

    /// Get the present queue.
    pub fn present_queue(&self) -> Result<vk::Queue> {
        self.device.present_queue()
    }

    /// Get the window surface.
    pub fn surface(&self) -> Result<&SurfaceContext> {
        match &self.surface {
            SurfaceTarget::Windowed(surface) => Ok(surface),
            SurfaceTarget::Headless => Err(GpuError::Headless),
        }
    }

    /// Whether the context was built without a window.
    pub fn is_headless(&self) -> bool {
        matches!(self.surface, SurfaceTarget::Headless)
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }

    /// Tear down allocator, device, surface and instance, in that order.
    ///
    /// # Safety
    /// Every object created from this context must already be destroyed.
    ///
    /// # Panics
    /// Panics when called a second time.
    pub unsafe fn destroy(&mut self) {
        assert!(!self.destroyed, "GPU context destroyed twice");
        self.destroyed = true;

        if let Err(e) = self.device.wait_idle() {
            tracing::warn!("Device wait before teardown failed: {e}");
        }

        // Frees all VkDeviceMemory, so it must precede the device.
        self.allocator.lock().shutdown();
        self.device.destroy();

        if let SurfaceTarget::Windowed(surface) = &self.surface {
            surface.destroy();
        }
        self.instance.destroy_instance(None);
        tracing::info!("GPU context destroyed");
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        if !self.destroyed {
            tracing::warn!("GpuContext dropped without destroy(); Vulkan objects leaked");
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    requirements: DeviceRequirements,
    chooser: Box<dyn AcceleratorChooser>,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Kiln".to_string(),
            enable_validation: cfg!(debug_assertions),
            requirements: DeviceRequirements::default(),
            chooser: Box::new(ConsoleChooser),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Require a device extension.
    pub fn required_extension(mut self, name: impl Into<String>) -> Self {
        self.requirements.required_extensions.push(name.into());
        self
    }

    /// Enable a device extension when available.
    pub fn optional_extension(mut self, name: impl Into<String>) -> Self {
        self.requirements.optional_extensions.push(name.into());
        self
    }

    /// Only accept devices of this class; `None` accepts any.
    pub fn preferred_device_type(mut self, device_type: Option<vk::PhysicalDeviceType>) -> Self {
        self.requirements.preferred_type = device_type;
        self
    }

    /// Decide between several suitable devices.
    pub fn chooser(mut self, chooser: impl AcceleratorChooser + 'static) -> Self {
        self.chooser = Box::new(chooser);
        self
    }

    /// Build a context presenting to `window`.
    pub fn build<W>(mut self, window: &W) -> Result<GpuContext>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?
            .as_raw();

        if !self
            .requirements
            .required_extensions
            .iter()
            .any(|ext| *ext == swapchain_extension())
        {
            self.requirements
                .required_extensions
                .push(swapchain_extension().into_owned());
        }

        self.build_inner(Some(display), |entry, instance| unsafe {
            SurfaceContext::new(entry, instance, window).map(SurfaceTarget::Windowed)
        })
    }

    /// Build a context without presentation support.
    pub fn build_headless(self) -> Result<GpuContext> {
        self.build_inner(None, |_, _| Ok(SurfaceTarget::Headless))
    }

    fn build_inner<F>(mut self, display: Option<RawDisplayHandle>, make_surface: F) -> Result<GpuContext>
    where
        F: FnOnce(&ash::Entry, &ash::Instance) -> Result<SurfaceTarget>,
    {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Loading(e.to_string()))?;

        let instance =
            unsafe { create_instance(&entry, &self.app_name, self.enable_validation, display) }?;

        let surface = match make_surface(&entry, &instance) {
            Ok(surface) => surface,
            Err(e) => {
                unsafe {
                    roll_back(BuildStage::Instance, &instance, &SurfaceTarget::Headless, None);
                }
                return Err(e);
            }
        };

        let physical = {
            let surface_ref = match &surface {
                SurfaceTarget::Windowed(s) => Some(s),
                SurfaceTarget::Headless => None,
            };
            unsafe {
                PhysicalDevice::select(
                    &instance,
                    surface_ref,
                    &self.requirements,
                    self.chooser.as_mut(),
                )
            }
        };

        let physical = match physical {
            Ok(physical) => physical,
            Err(e) => {
                unsafe { roll_back(BuildStage::Surface, &instance, &surface, None) };
                return Err(e);
            }
        };

        tracing::info!("Selected GPU: {}", physical.info().summary());

        let device = unsafe {
            LogicalDevice::new(
                &instance,
                physical.handle(),
                physical.queue_families(),
                physical.extensions(),
            )
        };
        let mut device = match device {
            Ok(device) => device,
            Err(e) => {
                unsafe { roll_back(BuildStage::Surface, &instance, &surface, None) };
                return Err(e);
            }
        };

        let allocator =
            match unsafe { GpuAllocator::new(&instance, device.shared(), physical.handle()) } {
                Ok(allocator) => allocator,
                Err(e) => {
                    unsafe {
                        roll_back(BuildStage::Device, &instance, &surface, Some(&mut device));
                    }
                    return Err(e);
                }
            };

        Ok(GpuContext {
            entry,
            instance,
            surface,
            physical,
            device,
            allocator: Mutex::new(allocator),
            destroyed: false,
        })
    }
}

/// How far a context build got before failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildStage {
    Instance,
    Surface,
    Device,
}

impl BuildStage {
    /// Objects to destroy, newest first, after a failure at this stage.
    const fn rollback(self) -> &'static [Self] {
        match self {
            Self::Instance => &[Self::Instance],
            Self::Surface => &[Self::Surface, Self::Instance],
            Self::Device => &[Self::Device, Self::Surface, Self::Instance],
        }
    }
}

/// Release everything a failed build created.
///
/// # Safety
/// The objects must not be used afterwards.
unsafe fn roll_back(
    reached: BuildStage,
    instance: &ash::Instance,
    surface: &SurfaceTarget,
    mut device: Option<&mut LogicalDevice>,
) {
    for stage in reached.rollback() {
        match stage {
            BuildStage::Device => {
                if let Some(device) = device.take() {
                    device.destroy();
                }
            }
            BuildStage::Surface => {
                if let SurfaceTarget::Windowed(surface) = surface {
                    surface.destroy();
                }
            }
            BuildStage::Instance => instance.destroy_instance(None),
        }
    }
    tracing::warn!("GPU context build failed after {reached:?}; released partial state");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_rollback_ends_with_the_instance() {
        for stage in [BuildStage::Instance, BuildStage::Surface, BuildStage::Device] {
            assert_eq!(stage.rollback().last(), Some(&BuildStage::Instance));
        }
    }

    #[test]
    fn device_failure_releases_surface_and_instance() {
        assert_eq!(
            BuildStage::Surface.rollback(),
            &[BuildStage::Surface, BuildStage::Instance]
        );
    }

    #[test]
    fn allocator_failure_releases_everything_newest_first() {
        assert_eq!(
            BuildStage::Device.rollback(),
            &[BuildStage::Device, BuildStage::Surface, BuildStage::Instance]
        );
    }
}
