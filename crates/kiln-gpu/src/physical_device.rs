//! Accelerator enumeration, selection and queue-family assignment.

use ash::vk;
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::ffi::CString;
use std::io::BufRead;

use crate::capabilities::{AcceleratorInfo, QueueFamilyProbe};
use crate::error::{GpuError, Result};
use crate::surface::SurfaceContext;

/// Name of the swapchain device extension.
pub fn swapchain_extension() -> Cow<'static, str> {
    ash::khr::swapchain::NAME.to_string_lossy()
}

/// Capability bits whose absence makes a family more specialized.
const SPECIALIZATION_BITS: [vk::QueueFlags; 5] = [
    vk::QueueFlags::GRAPHICS,
    vk::QueueFlags::COMPUTE,
    vk::QueueFlags::PROTECTED,
    vk::QueueFlags::TRANSFER,
    vk::QueueFlags::SPARSE_BINDING,
];

/// What an accelerator has to offer to be considered.
#[derive(Debug, Clone)]
pub struct DeviceRequirements {
    /// Extensions every candidate must support.
    pub required_extensions: Vec<String>,
    /// Extensions enabled when present.
    pub optional_extensions: Vec<String>,
    /// Device class to accept, `None` for any.
    pub preferred_type: Option<vk::PhysicalDeviceType>,
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        Self {
            required_extensions: Vec::new(),
            optional_extensions: Vec::new(),
            preferred_type: Some(vk::PhysicalDeviceType::DISCRETE_GPU),
        }
    }
}

impl DeviceRequirements {
    /// Check a candidate against the requirements.
    pub fn is_satisfied_by(&self, info: &AcceleratorInfo) -> bool {
        for ext in &self.required_extensions {
            if !info.supports_extension(ext) {
                return false;
            }
            if *ext == swapchain_extension() && !info.supports_presentation() {
                return false;
            }
        }

        self.preferred_type
            .map_or(true, |preferred| info.device_type == preferred)
    }

    /// Optional extensions the candidate lacks.
    pub fn missing_optional<'a>(&'a self, info: &AcceleratorInfo) -> Vec<&'a str> {
        self.optional_extensions
            .iter()
            .filter(|ext| !info.supports_extension(ext))
            .map(String::as_str)
            .collect()
    }

    /// Required extensions plus the optional ones the candidate supports.
    pub fn enabled_extensions(&self, info: &AcceleratorInfo) -> Vec<String> {
        self.required_extensions
            .iter()
            .chain(
                self.optional_extensions
                    .iter()
                    .filter(|ext| info.supports_extension(ext)),
            )
            .cloned()
            .collect()
    }
}

/// Picks one accelerator when several are suitable.
pub trait AcceleratorChooser {
    /// Return the [`AcceleratorInfo::index`] of the chosen candidate, or
    /// `None` to give up.
    fn choose(&mut self, candidates: &[&AcceleratorInfo]) -> Option<usize>;
}

impl<F> AcceleratorChooser for F
where
    F: FnMut(&[&AcceleratorInfo]) -> Option<usize>,
{
    fn choose(&mut self, candidates: &[&AcceleratorInfo]) -> Option<usize> {
        self(candidates)
    }
}

/// Asks on the terminal until one of the listed indices is typed.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleChooser;

impl AcceleratorChooser for ConsoleChooser {
    fn choose(&mut self, candidates: &[&AcceleratorInfo]) -> Option<usize> {
        println!("Select one of the suitable GPUs by typing the number:");
        for info in candidates {
            println!("    {} {}", info.index, info.summary());
        }

        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { return None };
            match line.trim().parse::<usize>() {
                Ok(index) if candidates.iter().any(|c| c.index == index) => return Some(index),
                _ => println!("Not a listed GPU, try again:"),
            }
        }
        None
    }
}

/// Always picks the same accelerator index (e.g. from configuration).
#[derive(Debug, Clone, Copy)]
pub struct FixedChooser(pub usize);

impl AcceleratorChooser for FixedChooser {
    fn choose(&mut self, _candidates: &[&AcceleratorInfo]) -> Option<usize> {
        Some(self.0)
    }
}

/// Filter candidates and pick one.
///
/// A single survivor is selected without consulting `chooser`.
pub fn select_accelerator<'a>(
    candidates: &'a [AcceleratorInfo],
    requirements: &DeviceRequirements,
    chooser: &mut dyn AcceleratorChooser,
) -> Result<&'a AcceleratorInfo> {
    let mut suitable = Vec::new();
    for info in candidates {
        if requirements.is_satisfied_by(info) {
            tracing::info!(
                "  {} {} (suitable, {} missing optional extensions)",
                info.index,
                info.device_name,
                requirements.missing_optional(info).len()
            );
            suitable.push(info);
        } else {
            tracing::info!("  {} {} (not suitable)", info.index, info.device_name);
        }
    }

    match suitable.as_slice() {
        [] => Err(GpuError::NoSuitableDevice),
        [only] => {
            tracing::info!("Only one suitable GPU, using {}", only.device_name);
            Ok(only)
        }
        _ => {
            let index = chooser.choose(&suitable).ok_or(GpuError::NoSuitableDevice)?;
            suitable
                .iter()
                .find(|info| info.index == index)
                .copied()
                .ok_or_else(|| {
                    GpuError::InvalidState(format!(
                        "GPU {index} is not among the suitable candidates"
                    ))
                })
        }
    }
}

/// Resolved queue family indices.
///
/// Several roles may share one family. `present` is `None` only for headless
/// contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    /// Distinct families in ascending order.
    pub fn unique(&self) -> Vec<u32> {
        let mut set = BTreeSet::from([self.graphics, self.compute, self.transfer]);
        set.extend(self.present);
        set.into_iter().collect()
    }
}

/// Specialization score of a family for `target`.
///
/// Returns `-1` if the family lacks `target`; otherwise one point for every
/// capability bit the family does not advertise.
pub fn queue_score(flags: vk::QueueFlags, target: vk::QueueFlags) -> i32 {
    if !flags.contains(target) {
        return -1;
    }
    SPECIALIZATION_BITS
        .iter()
        .filter(|&&bit| !flags.contains(bit))
        .count() as i32
}

struct Best {
    score: i32,
    index: Option<u32>,
}

impl Best {
    fn new() -> Self {
        Self {
            score: -1,
            index: None,
        }
    }

    /// Strictly greater wins, so ties keep the first family encountered.
    fn offer(&mut self, score: i32, index: u32) -> bool {
        if score > self.score {
            self.score = score;
            self.index = Some(index);
            true
        } else {
            false
        }
    }
}

/// Assign graphics, compute, transfer and present families.
///
/// Present takes the first family that can present, but is moved to the
/// graphics family when that family can present too.
pub fn assign_queue_families(families: &[QueueFamilyProbe]) -> Result<QueueFamilyIndices> {
    let mut graphics = Best::new();
    let mut compute = Best::new();
    let mut transfer = Best::new();
    // -1 unset, 0 any present-capable family, 1 shared with graphics
    let mut present_score = -1;
    let mut present = None;

    for (i, family) in families.iter().enumerate() {
        let i = i as u32;

        if family.present && present_score < 0 {
            present_score = 0;
            present = Some(i);
        }

        let graphics_score = queue_score(family.flags, vk::QueueFlags::GRAPHICS);
        if graphics.offer(graphics_score, i) && family.present && present_score < 1 {
            present_score = 1;
            present = Some(i);
        }

        compute.offer(queue_score(family.flags, vk::QueueFlags::COMPUTE), i);
        transfer.offer(queue_score(family.flags, vk::QueueFlags::TRANSFER), i);
    }

    let missing: Vec<&str> = [
        ("graphics", graphics.index),
        ("compute", compute.index),
        ("transfer", transfer.index),
    ]
    .iter()
    .filter(|(_, index)| index.is_none())
    .map(|(name, _)| *name)
    .collect();

    match (graphics.index, compute.index, transfer.index) {
        (Some(graphics), Some(compute), Some(transfer)) => Ok(QueueFamilyIndices {
            graphics,
            compute,
            transfer,
            present,
        }),
        _ => Err(GpuError::UnsatisfiedQueueFamilies(missing.join(", "))),
    }
}

/// The selected accelerator together with its queue assignment.
pub struct PhysicalDevice {
    handle: vk::PhysicalDevice,
    info: AcceleratorInfo,
    queue_families: QueueFamilyIndices,
    extensions: Vec<CString>,
}

impl PhysicalDevice {
    /// Enumerate, filter and select an accelerator.
    ///
    /// With a surface, a present-capable queue family is mandatory.
    ///
    /// # Safety
    /// The instance must be valid and `surface` must belong to it.
    pub unsafe fn select(
        instance: &ash::Instance,
        surface: Option<&SurfaceContext>,
        requirements: &DeviceRequirements,
        chooser: &mut dyn AcceleratorChooser,
    ) -> Result<Self> {
        tracing::info!("Creating physical device");
        let handles = instance.enumerate_physical_devices()?;

        let mut candidates = Vec::with_capacity(handles.len());
        for (index, &handle) in handles.iter().enumerate() {
            candidates.push(AcceleratorInfo::query(instance, handle, index, surface)?);
        }

        tracing::info!("Found {} physical devices:", candidates.len());
        let info = select_accelerator(&candidates, requirements, chooser)?.clone();

        let missing = requirements.missing_optional(&info);
        if !missing.is_empty() {
            tracing::warn!("Missing optional extensions: {}", missing.join(", "));
        }

        let queue_families = assign_queue_families(&info.queue_families)?;
        if surface.is_some() && queue_families.present.is_none() {
            return Err(GpuError::UnsatisfiedQueueFamilies("present".to_string()));
        }

        tracing::info!(
            "Queue family indices: graphics {}, compute {}, transfer {}, present {:?}",
            queue_families.graphics,
            queue_families.compute,
            queue_families.transfer,
            queue_families.present
        );

        let extensions = requirements
            .enabled_extensions(&info)
            .into_iter()
            .map(|name| {
                CString::new(name).map_err(|e| GpuError::ExtensionNotSupported(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            handle: handles[info.index],
            info,
            queue_families,
            extensions,
        })
    }

    /// Get the raw physical device handle.
    pub fn handle(&self) -> vk::PhysicalDevice {
        self.handle
    }

    /// Capability snapshot taken at selection time.
    pub fn info(&self) -> &AcceleratorInfo {
        &self.info
    }

    /// Queue family assignment.
    pub fn queue_families(&self) -> QueueFamilyIndices {
        self.queue_families
    }

    /// Extensions to enable on the logical device.
    pub fn extensions(&self) -> &[CString] {
        &self.extensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn accelerator(
        index: usize,
        device_type: vk::PhysicalDeviceType,
        extensions: &[&str],
    ) -> AcceleratorInfo {
        AcceleratorInfo {
            index,
            vendor: crate::capabilities::GpuVendor::Other(0),
            device_name: format!("gpu{index}"),
            device_type,
            api_version: vk::API_VERSION_1_3,
            driver_version: 0,
            device_local_memory_mb: 4096,
            available_extensions: extensions.iter().map(|s| s.to_string()).collect::<HashSet<_>>(),
            queue_families: vec![QueueFamilyProbe::new(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                true,
            )],
            surface_format_count: 2,
            present_mode_count: 1,
        }
    }

    fn windowed() -> DeviceRequirements {
        DeviceRequirements {
            required_extensions: vec![swapchain_extension().into_owned()],
            ..Default::default()
        }
    }

    fn never_asked(_: &[&AcceleratorInfo]) -> Option<usize> {
        panic!("chooser must not be consulted for a single candidate")
    }

    #[test]
    fn swapchain_extension_comes_from_the_loader_bindings() {
        assert_eq!(swapchain_extension(), "VK_KHR_swapchain");
        assert!(windowed().is_satisfied_by(&accelerator(
            0,
            vk::PhysicalDeviceType::DISCRETE_GPU,
            &[&*swapchain_extension()],
        )));
    }

    #[test]
    fn single_suitable_device_is_selected_silently() {
        let devices = [accelerator(
            0,
            vk::PhysicalDeviceType::DISCRETE_GPU,
            &[&*swapchain_extension()],
        )];
        let chosen = select_accelerator(&devices, &windowed(), &mut never_asked).unwrap();
        assert_eq!(chosen.index, 0);
    }

    #[test]
    fn unsuitable_devices_are_filtered() {
        let mut no_formats = accelerator(
            2,
            vk::PhysicalDeviceType::DISCRETE_GPU,
            &[&*swapchain_extension()],
        );
        no_formats.surface_format_count = 0;

        let devices = [
            accelerator(0, vk::PhysicalDeviceType::DISCRETE_GPU, &[]),
            accelerator(1, vk::PhysicalDeviceType::INTEGRATED_GPU, &[&*swapchain_extension()]),
            no_formats,
            accelerator(3, vk::PhysicalDeviceType::DISCRETE_GPU, &[&*swapchain_extension()]),
        ];
        let chosen = select_accelerator(&devices, &windowed(), &mut never_asked).unwrap();
        assert_eq!(chosen.index, 3);
    }

    #[test]
    fn no_suitable_device_fails() {
        let devices = [accelerator(0, vk::PhysicalDeviceType::CPU, &[&*swapchain_extension()])];
        let result = select_accelerator(&devices, &windowed(), &mut never_asked);
        assert!(matches!(result, Err(GpuError::NoSuitableDevice)));
    }

    #[test]
    fn multiple_candidates_consult_chooser() {
        let devices = [
            accelerator(0, vk::PhysicalDeviceType::DISCRETE_GPU, &[&*swapchain_extension()]),
            accelerator(1, vk::PhysicalDeviceType::DISCRETE_GPU, &[&*swapchain_extension()]),
        ];

        let mut offered = Vec::new();
        let mut chooser = |candidates: &[&AcceleratorInfo]| {
            offered.extend(candidates.iter().map(|c| c.index));
            Some(1)
        };
        let chosen = select_accelerator(&devices, &windowed(), &mut chooser).unwrap();
        assert_eq!(chosen.index, 1);
        assert_eq!(offered, vec![0, 1]);

        let result = select_accelerator(&devices, &windowed(), &mut FixedChooser(7));
        assert!(matches!(result, Err(GpuError::InvalidState(_))));
    }

    #[test]
    fn any_device_class_when_unconstrained() {
        let devices = [accelerator(0, vk::PhysicalDeviceType::INTEGRATED_GPU, &[])];
        let requirements = DeviceRequirements {
            preferred_type: None,
            ..Default::default()
        };
        assert!(select_accelerator(&devices, &requirements, &mut never_asked).is_ok());
    }

    #[test]
    fn optional_extensions_only_enabled_when_available() {
        let info = accelerator(
            0,
            vk::PhysicalDeviceType::DISCRETE_GPU,
            &[&*swapchain_extension(), "VK_EXT_memory_budget"],
        );
        let requirements = DeviceRequirements {
            optional_extensions: vec![
                "VK_EXT_memory_budget".to_string(),
                "VK_KHR_ray_query".to_string(),
            ],
            ..windowed()
        };
        assert_eq!(requirements.missing_optional(&info), vec!["VK_KHR_ray_query"]);
        assert_eq!(
            requirements.enabled_extensions(&info),
            vec![swapchain_extension().into_owned(), "VK_EXT_memory_budget".to_string()]
        );
    }

    #[test]
    fn score_rewards_specialization() {
        let all = vk::QueueFlags::GRAPHICS
            | vk::QueueFlags::COMPUTE
            | vk::QueueFlags::TRANSFER
            | vk::QueueFlags::SPARSE_BINDING;
        assert_eq!(queue_score(all, vk::QueueFlags::GRAPHICS), 1);
        assert_eq!(queue_score(vk::QueueFlags::TRANSFER, vk::QueueFlags::TRANSFER), 4);
        assert!(queue_score(all, vk::QueueFlags::TRANSFER) < 4);
    }

    #[test]
    fn family_lacking_capability_is_never_selected() {
        let flag_sets = [
            vk::QueueFlags::GRAPHICS,
            vk::QueueFlags::COMPUTE,
            vk::QueueFlags::TRANSFER,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            vk::QueueFlags::TRANSFER | vk::QueueFlags::SPARSE_BINDING,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        ];
        for flags in flag_sets {
            for target in [
                vk::QueueFlags::GRAPHICS,
                vk::QueueFlags::COMPUTE,
                vk::QueueFlags::TRANSFER,
            ] {
                if !flags.contains(target) {
                    assert!(queue_score(flags, target) < 0);
                }
            }
        }

        // Every assignment must land on a family advertising the capability.
        for a in flag_sets {
            for b in flag_sets {
                let families = [QueueFamilyProbe::new(a, false), QueueFamilyProbe::new(b, false)];
                if let Ok(indices) = assign_queue_families(&families) {
                    assert!(families[indices.graphics as usize]
                        .flags
                        .contains(vk::QueueFlags::GRAPHICS));
                    assert!(families[indices.compute as usize]
                        .flags
                        .contains(vk::QueueFlags::COMPUTE));
                    assert!(families[indices.transfer as usize]
                        .flags
                        .contains(vk::QueueFlags::TRANSFER));
                }
            }
        }
    }

    #[test]
    fn dedicated_transfer_family_wins_transfer() {
        let families = [
            QueueFamilyProbe::new(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, true),
            QueueFamilyProbe::new(vk::QueueFlags::TRANSFER, false),
        ];
        let indices = assign_queue_families(&families).unwrap();
        assert_eq!(
            indices,
            QueueFamilyIndices {
                graphics: 0,
                compute: 0,
                transfer: 1,
                present: Some(0),
            }
        );
        assert_eq!(indices.unique(), vec![0, 1]);
    }

    #[test]
    fn present_prefers_graphics_family() {
        let families = [
            QueueFamilyProbe::new(vk::QueueFlags::TRANSFER, true),
            QueueFamilyProbe::new(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                true,
            ),
            QueueFamilyProbe::new(vk::QueueFlags::COMPUTE, false),
        ];
        let indices = assign_queue_families(&families).unwrap();
        assert_eq!(indices.graphics, 1);
        assert_eq!(indices.present, Some(1));
        assert_eq!(indices.compute, 2);
        assert_eq!(indices.transfer, 0);
    }

    #[test]
    fn present_falls_back_to_first_capable_family() {
        let families = [
            QueueFamilyProbe::new(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, false),
            QueueFamilyProbe::new(vk::QueueFlags::TRANSFER, true),
        ];
        let indices = assign_queue_families(&families).unwrap();
        assert_eq!(indices.graphics, 0);
        assert_eq!(indices.present, Some(1));
    }

    #[test]
    fn ties_keep_first_family() {
        let flags = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER;
        let families = [
            QueueFamilyProbe::new(flags, false),
            QueueFamilyProbe::new(flags, false),
        ];
        let indices = assign_queue_families(&families).unwrap();
        assert_eq!((indices.graphics, indices.compute, indices.transfer), (0, 0, 0));
        assert_eq!(indices.present, None);
    }

    #[test]
    fn missing_capability_fails() {
        let families = [QueueFamilyProbe::new(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER,
            true,
        )];
        match assign_queue_families(&families) {
            Err(GpuError::UnsatisfiedQueueFamilies(missing)) => assert_eq!(missing, "compute"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
