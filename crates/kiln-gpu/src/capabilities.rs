//! Accelerator capability snapshots.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

use crate::error::Result;
use crate::surface::SurfaceContext;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Capabilities of one queue family as seen during enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyProbe {
    /// Advertised capability bits.
    pub flags: vk::QueueFlags,
    /// Number of queues in the family.
    pub queue_count: u32,
    /// Whether the family can present to the window surface.
    pub present: bool,
}

impl QueueFamilyProbe {
    /// Probe with a single queue.
    pub const fn new(flags: vk::QueueFlags, present: bool) -> Self {
        Self {
            flags,
            queue_count: 1,
            present,
        }
    }
}

/// Snapshot of a physical accelerator, captured once at selection time.
#[derive(Debug, Clone)]
pub struct AcceleratorInfo {
    /// Position in the driver's enumeration order.
    pub index: usize,
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Device class (discrete, integrated, ...)
    pub device_type: vk::PhysicalDeviceType,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,
    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Device extensions the driver reports
    pub available_extensions: HashSet<String>,
    /// Queue families in driver order
    pub queue_families: Vec<QueueFamilyProbe>,
    /// Surface formats offered for the window surface (0 when headless)
    pub surface_format_count: usize,
    /// Present modes offered for the window surface (0 when headless)
    pub present_mode_count: usize,
}

impl AcceleratorInfo {
    /// Query a snapshot from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid, and `surface` must have
    /// been created from the same instance.
    pub unsafe fn query(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        index: usize,
        surface: Option<&SurfaceContext>,
    ) -> Result<Self> {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let available_extensions: HashSet<String> = instance
            .enumerate_device_extension_properties(physical_device)?
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let family_properties =
            instance.get_physical_device_queue_family_properties(physical_device);
        let mut queue_families = Vec::with_capacity(family_properties.len());
        for (i, family) in family_properties.iter().enumerate() {
            let present = match surface {
                Some(surface) => surface.loader.get_physical_device_surface_support(
                    physical_device,
                    i as u32,
                    surface.surface,
                )?,
                None => false,
            };
            queue_families.push(QueueFamilyProbe {
                flags: family.queue_flags,
                queue_count: family.queue_count,
                present,
            });
        }

        let (surface_format_count, present_mode_count) = match surface {
            Some(surface) => (
                surface
                    .loader
                    .get_physical_device_surface_formats(physical_device, surface.surface)?
                    .len(),
                surface
                    .loader
                    .get_physical_device_surface_present_modes(physical_device, surface.surface)?
                    .len(),
            ),
            None => (0, 0),
        };

        Ok(Self {
            index,
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            device_type: properties.device_type,
            api_version: properties.api_version,
            driver_version: properties.driver_version,
            device_local_memory_mb,
            available_extensions,
            queue_families,
            surface_format_count,
            present_mode_count,
        })
    }

    /// Check whether the device reports an extension.
    pub fn supports_extension(&self, name: &str) -> bool {
        self.available_extensions.contains(name)
    }

    /// Whether a swapchain could be built for the window surface.
    pub fn supports_presentation(&self) -> bool {
        self.surface_format_count > 0 && self.present_mode_count > 0
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            self.device_type,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }
}
