//! Viewer application: a lit, spinning cube.

use std::collections::HashSet;
use std::mem::size_of;

use anyhow::Context;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};
use tracing::{error, info};
use winit::event::{ElementState, KeyEvent};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{CursorGrabMode, Window};

use kiln_app::{AppContext, Camera, DeviceEvent, DeviceId, FrameContext, KilnApp, WindowEvent};
use kiln_core::{MeshData, PushConstants, Transform};
use kiln_gpu::{
    DescriptorAggregator, DescriptorResource, GpuBuffer, GraphicsPipeline, GraphicsPipelineConfig,
};

/// Camera movement speed in units per second.
const CAMERA_SPEED: f32 = 2.5;

/// Cube rotation speed in degrees per second.
const SPIN_SPEED: f32 = 45.0;

/// Edge tint drawn around each cube face.
const EDGE_TINT: Vec4 = Vec4::new(0.05, 0.05, 0.05, 1.0);

/// Shared by every descriptor set (binding 0).
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct LightUniform {
    direction: Vec4,
    color: Vec4,
}

/// Rewritten each frame into the slot's own buffer (binding 1).
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct FrameUniform {
    tint: Vec4,
    params: Vec4,
}

/// Viewer application state.
pub struct Viewer {
    camera: Camera,
    model: Transform,
    elapsed: f32,
    vertex_buffer: GpuBuffer,
    index_buffer: GpuBuffer,
    index_count: u32,
    light_buffer: GpuBuffer,
    /// One per frame in flight, indexed by slot.
    frame_uniforms: Vec<GpuBuffer>,
    descriptors: DescriptorAggregator,
    pipeline: GraphicsPipeline,
    keys: HashSet<KeyCode>,
    mouse_look: bool,
    toggle_mouse_look: bool,
}

impl KilnApp for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let pipeline_config = GraphicsPipelineConfig {
            vertex_shader: kiln_shaders::mesh_vertex_shader()
                .context("embedded mesh vertex shader")?,
            fragment_shader: kiln_shaders::mesh_fragment_shader()
                .context("embedded mesh fragment shader")?,
            ..Default::default()
        };

        let mesh = MeshData::cube();
        let vertex_buffer = ctx.upload(
            mesh.vertex_bytes(),
            vk::BufferUsageFlags::VERTEX_BUFFER,
            "cube vertices",
        )?;
        let index_buffer = ctx.upload(
            mesh.index_bytes(),
            vk::BufferUsageFlags::INDEX_BUFFER,
            "cube indices",
        )?;
        info!(
            "Uploaded cube: {} vertices, {} indices",
            mesh.vertices.len(),
            mesh.index_count()
        );

        let light_buffer = ctx.create_host_buffer(
            size_of::<LightUniform>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            "light uniforms",
        )?;
        light_buffer.write(&[LightUniform {
            direction: Vec4::new(-0.4, -1.0, -0.6, 0.0),
            color: Vec4::ONE,
        }])?;

        let frame_uniforms = (0..ctx.frames_in_flight())
            .map(|slot| {
                ctx.create_host_buffer(
                    size_of::<FrameUniform>() as u64,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    &format!("frame uniforms {slot}"),
                )
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut descriptors = DescriptorAggregator::new();
        descriptors.add_binding(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::ShaderStageFlags::FRAGMENT,
        )?;
        descriptors.add_binding(
            1,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::ShaderStageFlags::FRAGMENT,
        )?;
        descriptors
            .apply_descriptor_to_new_sets(0, DescriptorResource::whole_buffer(light_buffer.buffer))?;
        for buffer in &frame_uniforms {
            descriptors.new_set()?;
            descriptors.add_descriptor(1, DescriptorResource::whole_buffer(buffer.buffer))?;
        }
        descriptors.reset_auto_apply_descriptors()?;

        // Every set shares one layout shape
        let set_layouts: Vec<vk::DescriptorSetLayout> = unsafe {
            descriptors.construct(ctx.gpu.device())?;
            descriptors.layouts().iter().take(1).copied().collect()
        };

        let push_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .offset(0)
            .size(size_of::<PushConstants>() as u32);
        let pipeline = unsafe {
            GraphicsPipeline::new(
                ctx.gpu.device(),
                ctx.render_pass.handle(),
                &pipeline_config,
                &set_layouts,
                &[push_range],
            )?
        };

        let camera = Camera::new(
            kiln_core::constants::DEFAULT_FOV_DEGREES,
            ctx.width(),
            ctx.height(),
        );

        info!("Viewer initialized successfully!");

        Ok(Self {
            camera,
            model: Transform::IDENTITY,
            elapsed: 0.0,
            vertex_buffer,
            index_buffer,
            index_count: mesh.index_count(),
            light_buffer,
            frame_uniforms,
            descriptors,
            pipeline,
            keys: HashSet::new(),
            mouse_look: false,
            toggle_mouse_look: false,
        })
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn update(&mut self, ctx: &AppContext, dt: f32) {
        if std::mem::take(&mut self.toggle_mouse_look) {
            self.mouse_look = !self.mouse_look;
            apply_mouse_look(&ctx.window, self.mouse_look);
        }

        let step = CAMERA_SPEED * dt;
        let forward = self.axis(KeyCode::KeyW, KeyCode::KeyS);
        let right = self.axis(KeyCode::KeyD, KeyCode::KeyA);
        let down = self.axis(KeyCode::ShiftLeft, KeyCode::Space);

        self.camera.move_front(forward * step);
        self.camera.move_right(right * step);
        self.camera.move_down(down * step);

        self.elapsed += dt;
        let mut model = Transform::IDENTITY;
        model
            .rotate(20.0, Vec3::X)
            .rotate(self.elapsed * SPIN_SPEED, Vec3::Y);
        self.model = model;
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()> {
        let slot = frame.slot.index();
        let set = self
            .descriptors
            .sets()
            .get(slot)
            .copied()
            .with_context(|| format!("no descriptor set for slot {slot}"))?;

        // The slot fence was waited on, so the GPU is done with this buffer
        self.frame_uniforms[slot].write(&[FrameUniform {
            tint: EDGE_TINT,
            params: Vec4::new(self.elapsed, 0.0, 0.0, 0.0),
        }])?;

        let push = PushConstants::new(self.camera.view_projection(), self.model.matrix());
        let device = ctx.gpu.device();
        let cmd = frame.command_buffer;

        unsafe {
            self.pipeline.bind(device, cmd, frame.extent);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.layout,
                0,
                &[set],
                &[],
            );
            device.cmd_push_constants(
                cmd,
                self.pipeline.layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                push.as_bytes(),
            );
            device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, self.index_buffer.buffer, 0, vk::IndexType::UINT32);
            device.cmd_draw_indexed(cmd, self.index_count, 1, 0, 0, 0);
        }

        Ok(())
    }

    fn on_resize(&mut self, _ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        self.camera.set_viewport(width, height);
        Ok(())
    }

    fn on_event(&mut self, event: &WindowEvent) -> bool {
        let WindowEvent::KeyboardInput {
            event:
                KeyEvent {
                    physical_key: PhysicalKey::Code(code),
                    state,
                    repeat,
                    ..
                },
            ..
        } = event
        else {
            return false;
        };

        match state {
            ElementState::Pressed => {
                if *code == KeyCode::Escape && !repeat {
                    self.toggle_mouse_look = true;
                }
                self.keys.insert(*code);
            }
            ElementState::Released => {
                self.keys.remove(code);
            }
        }
        true
    }

    fn on_device_event(&mut self, _device_id: DeviceId, event: &DeviceEvent) {
        if let DeviceEvent::MouseMotion { delta: (dx, dy) } = event {
            if self.mouse_look {
                self.camera.on_mouse_move(*dx as f32, *dy as f32);
            }
        }
    }

    fn cleanup(&mut self, ctx: &mut AppContext) {
        let device = ctx.gpu.device();
        unsafe {
            self.pipeline.destroy(device);
            self.descriptors.destroy(device);
        }

        let buffers = [&mut self.vertex_buffer, &mut self.index_buffer, &mut self.light_buffer]
            .into_iter()
            .chain(self.frame_uniforms.iter_mut());
        for buffer in buffers {
            if let Err(e) = ctx.free_buffer(buffer) {
                error!("Failed to free buffer: {e}");
            }
        }
        self.frame_uniforms.clear();
    }
}

impl Viewer {
    /// `1.0`, `-1.0` or `0.0` depending on which of two opposing keys is held.
    fn axis(&self, positive: KeyCode, negative: KeyCode) -> f32 {
        let held = |key: KeyCode| if self.keys.contains(&key) { 1.0 } else { 0.0 };
        held(positive) - held(negative)
    }
}

fn apply_mouse_look(window: &Window, enabled: bool) {
    let grab_mode = if enabled {
        CursorGrabMode::Locked
    } else {
        CursorGrabMode::None
    };

    // Not every platform can lock; confine instead
    if let Err(e) = window.set_cursor_grab(grab_mode) {
        if grab_mode == CursorGrabMode::Locked {
            if let Err(e2) = window.set_cursor_grab(CursorGrabMode::Confined) {
                tracing::warn!("Failed to confine cursor: {e2}");
            }
        } else {
            tracing::warn!("Failed to set cursor grab mode: {e}");
        }
    }

    window.set_cursor_visible(!enabled);
}
