//! Single-subpass render pass targeting the swapchain.

use crate::error::Result;
use ash::vk;

/// Render pass with one color attachment that is cleared on load and left in
/// `PRESENT_SRC_KHR` for presentation.
pub struct RenderPass {
    render_pass: vk::RenderPass,
    format: vk::Format,
    clear_color: [f32; 4],
}

impl RenderPass {
    /// Create a render pass for images of `format`.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device, format: vk::Format, clear_color: [f32; 4]) -> Result<Self> {
        let attachments = [vk::AttachmentDescription::default()
            .format(format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)];

        let color_refs = [vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];

        let subpasses = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)];

        // Layout transition must wait for the acquire semaphore, which the
        // submit waits on at COLOR_ATTACHMENT_OUTPUT.
        let dependencies = [vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)];

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let render_pass = device.create_render_pass(&create_info, None)?;
        tracing::debug!("Created render pass for {format:?}");

        Ok(Self {
            render_pass,
            format,
            clear_color,
        })
    }

    /// Get the raw render pass handle.
    pub fn handle(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Attachment format.
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Begin the pass over a framebuffer covering `extent`.
    ///
    /// # Safety
    /// The command buffer must be recording.
    pub unsafe fn begin(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
    ) {
        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        }];
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            })
            .clear_values(&clear_values);

        device.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
    }

    /// End the pass.
    ///
    /// # Safety
    /// The pass must have been begun on `cmd`.
    pub unsafe fn end(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        device.cmd_end_render_pass(cmd);
    }

    /// Destroy the render pass.
    ///
    /// # Safety
    /// No framebuffer or pipeline using it may be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_render_pass(self.render_pass, None);
    }
}
