//! Logical device and its role queues.

use ash::vk;
use std::ffi::CString;
use std::sync::Arc;

use crate::error::{GpuError, Result};
use crate::physical_device::QueueFamilyIndices;

/// Queue roles the engine submits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Graphics,
    Compute,
    Transfer,
}

impl QueueRole {
    /// All roles, in pool creation order.
    pub const ALL: [Self; 3] = [Self::Graphics, Self::Compute, Self::Transfer];

    /// Position in [`Self::ALL`].
    pub const fn index(self) -> usize {
        match self {
            Self::Graphics => 0,
            Self::Compute => 1,
            Self::Transfer => 2,
        }
    }

    /// Family assigned to this role.
    pub fn family(self, families: &QueueFamilyIndices) -> u32 {
        match self {
            Self::Graphics => families.graphics,
            Self::Compute => families.compute,
            Self::Transfer => families.transfer,
        }
    }
}

/// The logical device with one queue per distinct family.
///
/// Roles that share a family share the queue handle.
pub struct LogicalDevice {
    device: Arc<ash::Device>,
    families: QueueFamilyIndices,
    graphics_queue: vk::Queue,
    compute_queue: vk::Queue,
    transfer_queue: vk::Queue,
    present_queue: Option<vk::Queue>,
    destroyed: bool,
}

impl LogicalDevice {
    /// Create the device and fetch its queues.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: QueueFamilyIndices,
        extensions: &[CString],
    ) -> Result<Self> {
        let queue_priority = 1.0_f32;
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(std::slice::from_ref(&queue_priority))
            })
            .collect();

        let extension_names: Vec<_> = extensions.iter().map(|ext| ext.as_ptr()).collect();
        let features = vk::PhysicalDeviceFeatures::default();

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .enabled_features(&features);

        let device = instance
            .create_device(physical_device, &device_create_info, None)
            .map_err(GpuError::from)?;

        tracing::info!(
            "Created logical device with {} queue(s), extensions: {:?}",
            queue_create_infos.len(),
            extensions
        );

        Ok(Self {
            graphics_queue: device.get_device_queue(families.graphics, 0),
            compute_queue: device.get_device_queue(families.compute, 0),
            transfer_queue: device.get_device_queue(families.transfer, 0),
            present_queue: families.present.map(|family| device.get_device_queue(family, 0)),
            device: Arc::new(device),
            families,
            destroyed: false,
        })
    }

    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Shared handle for long-lived helpers such as the allocator.
    pub fn shared(&self) -> Arc<ash::Device> {
        Arc::clone(&self.device)
    }

    /// Queue family assignment.
    pub fn families(&self) -> QueueFamilyIndices {
        self.families
    }

    /// Get the graphics queue.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Get the compute queue.
    pub fn compute_queue(&self) -> vk::Queue {
        self.compute_queue
    }

    /// Get the transfer queue.
    pub fn transfer_queue(&self) -> vk::Queue {
        self.transfer_queue
    }

    /// Queue for a role.
    pub fn queue(&self, role: QueueRole) -> vk::Queue {
        match role {
            QueueRole::Graphics => self.graphics_queue,
            QueueRole::Compute => self.compute_queue,
            QueueRole::Transfer => self.transfer_queue,
        }
    }

    /// Get the present queue.
    pub fn present_queue(&self) -> Result<vk::Queue> {
        self.present_queue.ok_or(GpuError::Headless)
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }

    /// Destroy the device.
    ///
    /// # Safety
    /// Every object created from the device must already be destroyed.
    ///
    /// # Panics
    /// Panics when called a second time.
    pub unsafe fn destroy(&mut self) {
        assert!(!self.destroyed, "logical device destroyed twice");
        self.destroyed = true;
        self.device.destroy_device(None);
        tracing::info!("Destroyed logical device");
    }

    /// Whether [`Self::destroy`] already ran.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_map_to_assigned_families() {
        let families = QueueFamilyIndices {
            graphics: 0,
            compute: 2,
            transfer: 1,
            present: None,
        };
        assert_eq!(QueueRole::Graphics.family(&families), 0);
        assert_eq!(QueueRole::Compute.family(&families), 2);
        assert_eq!(QueueRole::Transfer.family(&families), 1);
    }
}
