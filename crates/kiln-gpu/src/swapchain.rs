//! Swapchain management.
//!
//! Choosing the swapchain configuration ([`SwapchainPlan::choose`]) is pure and
//! runs against a [`SurfaceSupport`] snapshot, so it is re-evaluated from fresh
//! surface capabilities on every recreation.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::physical_device::QueueFamilyIndices;
use crate::surface::SurfaceSupport;
use ash::vk;

/// Supplies the window's drawable size in pixels.
///
/// Only consulted when the surface leaves the extent up to the application.
pub trait ExtentSource {
    /// Current drawable size as `(width, height)`.
    fn drawable_size(&self) -> (u32, u32);
}

impl<F> ExtentSource for F
where
    F: Fn() -> (u32, u32),
{
    fn drawable_size(&self) -> (u32, u32) {
        self()
    }
}

impl ExtentSource for vk::Extent2D {
    fn drawable_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Configuration the caller would like, subject to what the surface offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainPreferences {
    /// Preferred format and color space.
    pub surface_format: vk::SurfaceFormatKHR,
    /// Preferred present mode; FIFO is the fallback.
    pub present_mode: vk::PresentModeKHR,
}

impl Default for SwapchainPreferences {
    fn default() -> Self {
        Self {
            surface_format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            present_mode: vk::PresentModeKHR::IMMEDIATE,
        }
    }
}

/// Select the surface format, falling back to the first one offered.
pub fn choose_surface_format(
    available: &[vk::SurfaceFormatKHR],
    preferred: vk::SurfaceFormatKHR,
) -> Option<vk::SurfaceFormatKHR> {
    let found = available
        .iter()
        .find(|f| f.format == preferred.format && f.color_space == preferred.color_space)
        .copied();

    if found.is_none() {
        if let Some(first) = available.first() {
            tracing::warn!(
                "Preferred surface format {:?} unavailable, using {:?}",
                preferred.format,
                first.format
            );
        }
    }
    found.or_else(|| available.first().copied())
}

/// Select the present mode, falling back to FIFO (always supported).
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        tracing::warn!("Present mode {preferred:?} unavailable, using FIFO");
        vk::PresentModeKHR::FIFO
    }
}

/// One image more than the minimum, capped by the maximum when bounded.
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        desired.min(capabilities.max_image_count)
    } else {
        desired
    }
}

/// Use the surface's extent, or the drawable size clamped into the supported
/// range when the surface reports the "undefined" sentinel.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    source: &dyn ExtentSource,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    let (width, height) = source.drawable_size();
    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// Concurrent sharing across graphics and present when they differ.
pub fn choose_sharing(graphics: u32, present: u32) -> (vk::SharingMode, Vec<u32>) {
    if graphics == present {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (vk::SharingMode::CONCURRENT, vec![graphics, present])
    }
}

/// Everything needed to create a swapchain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapchainPlan {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub image_count: u32,
    pub extent: vk::Extent2D,
    pub sharing_mode: vk::SharingMode,
    pub queue_family_indices: Vec<u32>,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

impl SwapchainPlan {
    /// Derive a plan from the surface's current support.
    ///
    /// Fails with [`GpuError::ZeroExtent`] while the window has no drawable
    /// area; the caller should retry later.
    pub fn choose(
        support: &SurfaceSupport,
        extent_source: &dyn ExtentSource,
        preferences: &SwapchainPreferences,
        families: &QueueFamilyIndices,
    ) -> Result<Self> {
        let present_family = families.present.ok_or(GpuError::Headless)?;
        let caps = &support.capabilities;

        let surface_format = choose_surface_format(&support.formats, preferences.surface_format)
            .ok_or_else(|| GpuError::SwapchainCreation("surface reports no formats".to_string()))?;

        let extent = choose_extent(caps, extent_source);
        if extent.width == 0 || extent.height == 0 {
            return Err(GpuError::ZeroExtent {
                width: extent.width,
                height: extent.height,
            });
        }

        let (sharing_mode, queue_family_indices) =
            choose_sharing(families.graphics, present_family);

        Ok(Self {
            surface_format,
            present_mode: choose_present_mode(&support.present_modes, preferences.present_mode),
            image_count: choose_image_count(caps),
            extent,
            sharing_mode,
            queue_family_indices,
            pre_transform: caps.current_transform,
        })
    }
}

/// Swapchain with its images, views and framebuffers.
pub struct Swapchain {
    loader: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
    render_pass: vk::RenderPass,
    plan: SwapchainPlan,
    preferences: SwapchainPreferences,
}

impl Swapchain {
    /// Create a swapchain for the context's window surface.
    ///
    /// # Safety
    /// The GPU context must be valid.
    pub unsafe fn new(
        gpu: &GpuContext,
        extent_source: &dyn ExtentSource,
        preferences: SwapchainPreferences,
    ) -> Result<Self> {
        let surface = gpu.surface()?;
        let support = surface.support(gpu.physical_device())?;
        let plan = SwapchainPlan::choose(
            &support,
            extent_source,
            &preferences,
            &gpu.queue_families(),
        )?;

        let loader = ash::khr::swapchain::Device::new(gpu.instance(), gpu.device());
        let (swapchain, images, image_views) =
            create_chain(gpu.device(), &loader, surface.surface, &plan, vk::SwapchainKHR::null())?;

        tracing::info!(
            "Created swapchain: {}x{}, {:?}, {:?}, {} images",
            plan.extent.width,
            plan.extent.height,
            plan.surface_format.format,
            plan.present_mode,
            images.len()
        );

        Ok(Self {
            loader,
            swapchain,
            images,
            image_views,
            framebuffers: Vec::new(),
            render_pass: vk::RenderPass::null(),
            plan,
            preferences,
        })
    }

    /// Create one framebuffer per image for `render_pass`; rebuilt on every
    /// recreation.
    ///
    /// # Safety
    /// The render pass must be compatible with the swapchain format.
    pub unsafe fn create_framebuffers(
        &mut self,
        device: &ash::Device,
        render_pass: vk::RenderPass,
    ) -> Result<()> {
        self.destroy_framebuffers(device);
        self.render_pass = render_pass;

        for &view in &self.image_views {
            let attachments = [view];
            let create_info = vk::FramebufferCreateInfo::default()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(self.plan.extent.width)
                .height(self.plan.extent.height)
                .layers(1);
            self.framebuffers
                .push(device.create_framebuffer(&create_info, None)?);
        }
        Ok(())
    }

    unsafe fn destroy_framebuffers(&mut self, device: &ash::Device) {
        for framebuffer in self.framebuffers.drain(..) {
            device.destroy_framebuffer(framebuffer, None);
        }
    }

    /// Rebuild the chain against the surface's current capabilities.
    ///
    /// Waits for the device to go idle first. A zero-area surface returns
    /// [`GpuError::ZeroExtent`] and leaves the current chain untouched. A
    /// format change is fatal since the render pass depends on it.
    ///
    /// # Safety
    /// The GPU context must be the one the swapchain was created from.
    pub unsafe fn recreate(
        &mut self,
        gpu: &GpuContext,
        extent_source: &dyn ExtentSource,
    ) -> Result<()> {
        gpu.wait_idle()?;

        let surface = gpu.surface()?;
        let support = surface.support(gpu.physical_device())?;
        let plan = SwapchainPlan::choose(
            &support,
            extent_source,
            &self.preferences,
            &gpu.queue_families(),
        )?;

        if plan.surface_format != self.plan.surface_format {
            return Err(GpuError::SwapchainCreation(format!(
                "surface format changed from {:?} to {:?}",
                self.plan.surface_format.format, plan.surface_format.format
            )));
        }

        let device = gpu.device();
        let (swapchain, images, image_views) =
            create_chain(device, &self.loader, surface.surface, &plan, self.swapchain)?;

        self.destroy_framebuffers(device);
        self.destroy_chain(device);

        self.swapchain = swapchain;
        self.images = images;
        self.image_views = image_views;
        self.plan = plan;

        if self.render_pass != vk::RenderPass::null() {
            self.create_framebuffers(device, self.render_pass)?;
        }

        tracing::info!(
            "Recreated swapchain: {}x{}",
            self.plan.extent.width,
            self.plan.extent.height
        );
        Ok(())
    }

    /// Acquire the next image. Returns the index and whether the chain is
    /// suboptimal.
    ///
    /// # Safety
    /// The semaphore must be unsignaled with no pending signal.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn acquire_next_image(
        &self,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<(u32, bool)> {
        let result =
            self.loader
                .acquire_next_image(self.swapchain, timeout_ns, semaphore, vk::Fence::null());

        match result {
            Ok((index, suboptimal)) => Ok((index, suboptimal)),
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => {
                Err(GpuError::Timeout("swapchain image"))
            }
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Present an image. Returns whether the chain is suboptimal.
    ///
    /// # Safety
    /// `image_index` must have been acquired and `wait` must be signaled by
    /// the submission that rendered it.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<bool> {
        let wait_semaphores = [wait];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        self.loader
            .queue_present(queue, &present_info)
            .map_err(GpuError::from)
    }

    /// Get the image extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.plan.extent
    }

    /// Get the image format.
    pub fn format(&self) -> vk::Format {
        self.plan.surface_format.format
    }

    /// Get the chosen present mode.
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.plan.present_mode
    }

    /// Configuration the chain was built from.
    pub fn plan(&self) -> &SwapchainPlan {
        &self.plan
    }

    /// Swapchain images in presentation-engine order.
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    /// Number of images.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Framebuffer for an acquired image.
    pub fn framebuffer(&self, image_index: u32) -> Result<vk::Framebuffer> {
        self.framebuffers
            .get(image_index as usize)
            .copied()
            .ok_or_else(|| {
                GpuError::InvalidState(format!("no framebuffer for image {image_index}"))
            })
    }

    unsafe fn destroy_chain(&mut self, device: &ash::Device) {
        for view in self.image_views.drain(..) {
            device.destroy_image_view(view, None);
        }
        self.images.clear();
        self.loader.destroy_swapchain(self.swapchain, None);
        self.swapchain = vk::SwapchainKHR::null();
    }

    /// Destroy the swapchain.
    ///
    /// # Safety
    /// No image may still be in use by the GPU.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        self.destroy_framebuffers(device);
        self.destroy_chain(device);
        tracing::debug!("Destroyed swapchain");
    }
}

unsafe fn create_chain(
    device: &ash::Device,
    loader: &ash::khr::swapchain::Device,
    surface: vk::SurfaceKHR,
    plan: &SwapchainPlan,
    old_swapchain: vk::SwapchainKHR,
) -> Result<(vk::SwapchainKHR, Vec<vk::Image>, Vec<vk::ImageView>)> {
    let create_info = vk::SwapchainCreateInfoKHR::default()
        .surface(surface)
        .min_image_count(plan.image_count)
        .image_format(plan.surface_format.format)
        .image_color_space(plan.surface_format.color_space)
        .image_extent(plan.extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        .image_sharing_mode(plan.sharing_mode)
        .queue_family_indices(&plan.queue_family_indices)
        .pre_transform(plan.pre_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(plan.present_mode)
        .clipped(true)
        .old_swapchain(old_swapchain);

    let swapchain = loader
        .create_swapchain(&create_info, None)
        .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

    let images = loader.get_swapchain_images(swapchain)?;

    let image_views = images
        .iter()
        .map(|&image| {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(plan.surface_format.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_mip_level(0)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(1),
                );

            device.create_image_view(&view_info, None)
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok((swapchain, images, image_views))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRGB: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_SRGB,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };
    const UNORM: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
        format: vk::Format::R8G8B8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };

    fn capabilities(min: u32, max: u32, current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    fn support(current: (u32, u32)) -> SurfaceSupport {
        SurfaceSupport {
            capabilities: capabilities(2, 8, current),
            formats: vec![UNORM, SRGB],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE],
        }
    }

    fn families(graphics: u32, present: u32) -> QueueFamilyIndices {
        QueueFamilyIndices {
            graphics,
            compute: graphics,
            transfer: graphics,
            present: Some(present),
        }
    }

    #[test]
    fn image_count_respects_bounds() {
        assert_eq!(choose_image_count(&capabilities(2, 8, (1, 1))), 3);
        assert_eq!(choose_image_count(&capabilities(3, 3, (1, 1))), 3);
        assert_eq!(choose_image_count(&capabilities(2, 0, (1, 1))), 3);
    }

    #[test]
    fn undefined_extent_uses_drawable_size() {
        let caps = capabilities(2, 8, (u32::MAX, u32::MAX));
        let extent = choose_extent(&caps, &|| (800, 600));
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn drawable_size_is_clamped() {
        let mut caps = capabilities(2, 8, (u32::MAX, u32::MAX));
        caps.min_image_extent = vk::Extent2D {
            width: 100,
            height: 100,
        };
        let extent = choose_extent(&caps, &vk::Extent2D {
            width: 5000,
            height: 10,
        });
        assert_eq!((extent.width, extent.height), (4096, 100));
    }

    #[test]
    fn defined_extent_wins_over_drawable_size() {
        let caps = capabilities(2, 8, (1024, 768));
        let extent = choose_extent(&caps, &|| (800, 600));
        assert_eq!((extent.width, extent.height), (1024, 768));
    }

    #[test]
    fn format_and_present_mode_fallbacks() {
        assert_eq!(choose_surface_format(&[UNORM, SRGB], SRGB), Some(SRGB));
        assert_eq!(choose_surface_format(&[UNORM], SRGB), Some(UNORM));
        assert_eq!(choose_surface_format(&[], SRGB), None);

        let fifo_only = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&fifo_only, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(
                &[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
                vk::PresentModeKHR::MAILBOX
            ),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn sharing_follows_family_split() {
        assert_eq!(choose_sharing(0, 0), (vk::SharingMode::EXCLUSIVE, vec![]));
        assert_eq!(
            choose_sharing(0, 2),
            (vk::SharingMode::CONCURRENT, vec![0, 2])
        );
    }

    #[test]
    fn plan_for_undefined_extent() {
        let plan = SwapchainPlan::choose(
            &support((u32::MAX, u32::MAX)),
            &|| (800, 600),
            &SwapchainPreferences::default(),
            &families(0, 0),
        )
        .unwrap();

        assert_eq!(plan.surface_format, SRGB);
        assert_eq!(plan.present_mode, vk::PresentModeKHR::IMMEDIATE);
        assert_eq!(plan.image_count, 3);
        assert_eq!((plan.extent.width, plan.extent.height), (800, 600));
        assert_eq!(plan.sharing_mode, vk::SharingMode::EXCLUSIVE);
    }

    #[test]
    fn plan_is_idempotent_for_unchanged_surface() {
        let support = support((1280, 720));
        let prefs = SwapchainPreferences::default();
        let first = SwapchainPlan::choose(&support, &|| (1, 1), &prefs, &families(0, 1)).unwrap();
        let second = SwapchainPlan::choose(&support, &|| (1, 1), &prefs, &families(0, 1)).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.queue_family_indices, vec![0, 1]);
    }

    #[test]
    fn zero_extent_is_transient() {
        let result = SwapchainPlan::choose(
            &support((0, 0)),
            &|| (0, 0),
            &SwapchainPreferences::default(),
            &families(0, 0),
        );
        let err = result.unwrap_err();
        assert!(matches!(err, GpuError::ZeroExtent { width: 0, height: 0 }));
        assert_eq!(err.severity(), crate::error::ErrorSeverity::Transient);
    }

    #[test]
    fn headless_families_cannot_plan() {
        let mut headless = families(0, 0);
        headless.present = None;
        let result = SwapchainPlan::choose(
            &support((640, 480)),
            &|| (640, 480),
            &SwapchainPreferences::default(),
            &headless,
        );
        assert!(matches!(result, Err(GpuError::Headless)));
    }
}
