//! Command buffer management.
//!
//! [`CommandContext`] owns one [`CommandPool`] per queue role. Each pool keeps
//! its buffers together with a recording state so misuse (submitting a buffer
//! that was never begun, beginning one twice) surfaces as an error instead of
//! undefined driver behavior.

use ash::vk;

use crate::device::{LogicalDevice, QueueRole};
use crate::error::{GpuError, Result};
use crate::frame::FrameSlot;
use crate::physical_device::QueueFamilyIndices;

/// Host-side view of a command buffer's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Allocated, never recorded.
    Initial,
    /// Between begin and end.
    Recording,
    /// Ended and ready to submit.
    Executable,
    /// Submitted and not yet known to be complete.
    Pending,
}

/// Recording state of every buffer in a pool.
#[derive(Debug, Clone, Default)]
pub struct RecordingTracker {
    states: Vec<BufferState>,
}

impl RecordingTracker {
    /// Track `count` more buffers; returns the index of the first.
    pub fn extend(&mut self, count: usize) -> usize {
        let first = self.states.len();
        self.states
            .extend(std::iter::repeat(BufferState::Initial).take(count));
        first
    }

    /// Number of tracked buffers.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Current state of a buffer.
    pub fn state(&self, index: usize) -> Option<BufferState> {
        self.states.get(index).copied()
    }

    fn slot(&mut self, index: usize) -> Result<&mut BufferState> {
        self.states.get_mut(index).ok_or_else(|| {
            GpuError::ContractViolation(format!("command buffer {index} was never allocated"))
        })
    }

    /// Start recording. A pending buffer may be re-begun once the caller has
    /// observed its completion; the pool resets it implicitly.
    pub fn begin(&mut self, index: usize) -> Result<()> {
        let state = self.slot(index)?;
        if *state == BufferState::Recording {
            return Err(GpuError::ContractViolation(format!(
                "command buffer {index} is already recording"
            )));
        }
        *state = BufferState::Recording;
        Ok(())
    }

    /// Finish recording.
    pub fn end(&mut self, index: usize) -> Result<()> {
        let state = self.slot(index)?;
        if *state != BufferState::Recording {
            return Err(GpuError::ContractViolation(format!(
                "command buffer {index} ended while {state:?}"
            )));
        }
        *state = BufferState::Executable;
        Ok(())
    }

    /// Check that a buffer may be submitted. Returns `true` if it is still
    /// recording and must be ended first.
    pub fn check_submit(&self, index: usize) -> Result<bool> {
        match self.states.get(index) {
            Some(BufferState::Recording) => Ok(true),
            Some(BufferState::Executable) => Ok(false),
            Some(BufferState::Initial) => Err(GpuError::ContractViolation(format!(
                "command buffer {index} submitted without being begun"
            ))),
            Some(BufferState::Pending) => Err(GpuError::ContractViolation(format!(
                "command buffer {index} submitted while still pending"
            ))),
            None => Err(GpuError::ContractViolation(format!(
                "command buffer {index} was never allocated"
            ))),
        }
    }

    /// Mark a buffer as submitted.
    pub fn submitted(&mut self, index: usize) -> Result<()> {
        *self.slot(index)? = BufferState::Pending;
        Ok(())
    }

    /// Mark a buffer as finished executing.
    pub fn completed(&mut self, index: usize) -> Result<()> {
        let state = self.slot(index)?;
        if *state == BufferState::Pending {
            *state = BufferState::Executable;
        }
        Ok(())
    }
}

/// Identifies a buffer inside a [`CommandContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandBufferId {
    pub role: QueueRole,
    pub index: usize,
}

/// Command pool for one queue role.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
    buffers: Vec<vk::CommandBuffer>,
    tracker: RecordingTracker,
}

impl CommandPool {
    /// Create a new command pool whose buffers can be individually reset.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(device: &ash::Device, queue_family: u32) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = device.create_command_pool(&create_info, None)?;

        Ok(Self {
            pool,
            queue_family,
            buffers: Vec::new(),
            tracker: RecordingTracker::default(),
        })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Number of allocated buffers.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether no buffers are allocated.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Allocate primary command buffers; returns the index of the first.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(&mut self, device: &ash::Device, count: u32) -> Result<usize> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        let buffers = device.allocate_command_buffers(&alloc_info)?;
        self.buffers.extend(buffers);
        Ok(self.tracker.extend(count as usize))
    }

    /// Free all buffers and destroy the pool.
    ///
    /// # Safety
    /// No buffer from this pool may be pending.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        if !self.buffers.is_empty() {
            device.free_command_buffers(self.pool, &self.buffers);
            self.buffers.clear();
        }
        self.tracker = RecordingTracker::default();
        device.destroy_command_pool(self.pool, None);
    }
}

/// Command pools for the graphics, compute and transfer roles.
pub struct CommandContext {
    /// Indexed by [`QueueRole::index`].
    pools: Vec<CommandPool>,
}

impl CommandContext {
    /// Create one pool per role on its assigned family.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device, families: &QueueFamilyIndices) -> Result<Self> {
        let mut pools = Vec::with_capacity(QueueRole::ALL.len());
        for role in QueueRole::ALL {
            pools.push(CommandPool::new(device, role.family(families))?);
        }
        tracing::debug!("Created command pools for {} roles", pools.len());
        Ok(Self { pools })
    }

    /// Get the pool for a role.
    pub fn pool(&self, role: QueueRole) -> &CommandPool {
        &self.pools[role.index()]
    }

    fn pool_mut(&mut self, role: QueueRole) -> &mut CommandPool {
        &mut self.pools[role.index()]
    }

    /// Allocate `count` buffers for a role.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn add_buffers(
        &mut self,
        device: &ash::Device,
        role: QueueRole,
        count: u32,
    ) -> Result<Vec<CommandBufferId>> {
        let first = self.pool_mut(role).allocate(device, count)?;
        Ok((first..first + count as usize)
            .map(|index| CommandBufferId { role, index })
            .collect())
    }

    /// The buffer of `role` reserved for a frame slot.
    pub fn frame_buffer(&self, role: QueueRole, slot: FrameSlot) -> Result<CommandBufferId> {
        let available = self.pool(role).len();
        if slot.index() >= available {
            return Err(GpuError::ContractViolation(format!(
                "no {role:?} command buffer for frame slot {} ({available} allocated)",
                slot.index()
            )));
        }
        Ok(CommandBufferId {
            role,
            index: slot.index(),
        })
    }

    /// Raw handle of a buffer.
    pub fn raw(&self, id: CommandBufferId) -> Result<vk::CommandBuffer> {
        self.pool(id.role)
            .buffers
            .get(id.index)
            .copied()
            .ok_or_else(|| {
                GpuError::ContractViolation(format!("unknown command buffer {id:?}"))
            })
    }

    /// Recording state of a buffer.
    pub fn state(&self, id: CommandBufferId) -> Option<BufferState> {
        self.pool(id.role).tracker.state(id.index)
    }

    /// Begin recording and return the raw buffer.
    ///
    /// # Safety
    /// The buffer must not be executing on the GPU.
    pub unsafe fn begin(
        &mut self,
        device: &ash::Device,
        id: CommandBufferId,
    ) -> Result<vk::CommandBuffer> {
        let cmd = self.raw(id)?;
        self.pool_mut(id.role).tracker.begin(id.index)?;
        let begin_info = vk::CommandBufferBeginInfo::default();
        device.begin_command_buffer(cmd, &begin_info)?;
        Ok(cmd)
    }

    /// End recording.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn end(&mut self, device: &ash::Device, id: CommandBufferId) -> Result<()> {
        let cmd = self.raw(id)?;
        self.pool_mut(id.role).tracker.end(id.index)?;
        device.end_command_buffer(cmd)?;
        Ok(())
    }

    unsafe fn prepare_submit(
        &mut self,
        device: &ash::Device,
        id: CommandBufferId,
    ) -> Result<vk::CommandBuffer> {
        let cmd = self.raw(id)?;
        if self.pool(id.role).tracker.check_submit(id.index)? {
            self.end(device, id)?;
        }
        Ok(cmd)
    }

    /// Submit a buffer without synchronization primitives, ending it first if
    /// it is still recording. Blocks until the queue drains only if
    /// `wait_idle` is set.
    ///
    /// # Safety
    /// The queue must belong to the buffer's family.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn submit(
        &mut self,
        device: &ash::Device,
        id: CommandBufferId,
        queue: vk::Queue,
        wait_idle: bool,
    ) -> Result<()> {
        let cmd = self.prepare_submit(device, id)?;

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        device.queue_submit(queue, &[submit_info], vk::Fence::null())?;
        self.pool_mut(id.role).tracker.submitted(id.index)?;

        if wait_idle {
            device.queue_wait_idle(queue)?;
            self.pool_mut(id.role).tracker.completed(id.index)?;
        }
        Ok(())
    }

    /// Submit a frame's buffer: wait `wait` at `stage`, signal `signal` and
    /// `fence`. Never blocks.
    ///
    /// # Safety
    /// All handles must be valid and `fence` must be unsignaled.
    #[allow(clippy::too_many_arguments)]
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn submit_frame(
        &mut self,
        device: &ash::Device,
        id: CommandBufferId,
        queue: vk::Queue,
        wait: vk::Semaphore,
        stage: vk::PipelineStageFlags,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()> {
        let cmd = self.prepare_submit(device, id)?;

        let command_buffers = [cmd];
        let wait_semaphores = [wait];
        let wait_stages = [stage];
        let signal_semaphores = [signal];
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&command_buffers)
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .signal_semaphores(&signal_semaphores);

        device.queue_submit(queue, &[submit_info], fence)?;
        self.pool_mut(id.role).tracker.submitted(id.index)
    }

    /// Record and execute a throwaway buffer, waiting for it to finish.
    ///
    /// # Safety
    /// The queue must belong to `role`'s family.
    pub unsafe fn one_shot<F>(
        &self,
        device: &ash::Device,
        role: QueueRole,
        queue: vk::Queue,
        record: F,
    ) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let pool = self.pool(role).handle();
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = device.allocate_command_buffers(&alloc_info)?[0];

        let result = (|| -> Result<()> {
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(cmd, &begin_info)?;
            record(cmd);
            device.end_command_buffer(cmd)?;

            let command_buffers = [cmd];
            let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
            device.queue_submit(queue, &[submit_info], vk::Fence::null())?;
            device.queue_wait_idle(queue)?;
            Ok(())
        })();

        device.free_command_buffers(pool, &[cmd]);
        result
    }

    /// Wait each role's queue idle, then free buffers and destroy the pools.
    ///
    /// # Safety
    /// `device` must be the device the pools were created on.
    pub unsafe fn destroy(&mut self, device: &LogicalDevice) {
        for (role, pool) in QueueRole::ALL.into_iter().zip(&mut self.pools) {
            if let Err(e) = device.device().queue_wait_idle(device.queue(role)) {
                tracing::warn!("Waiting for {role:?} queue before teardown failed: {e}");
            }
            pool.destroy(device.device());
        }
        self.pools.clear();
        tracing::debug!("Destroyed command context");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_begun_buffer_cannot_be_submitted() {
        let mut tracker = RecordingTracker::default();
        let first = tracker.extend(2);
        assert_eq!(first, 0);
        assert!(matches!(
            tracker.check_submit(0),
            Err(GpuError::ContractViolation(_))
        ));
    }

    #[test]
    fn recording_buffer_is_ended_on_submit() {
        let mut tracker = RecordingTracker::default();
        tracker.extend(1);
        tracker.begin(0).unwrap();
        assert!(tracker.check_submit(0).unwrap());

        tracker.end(0).unwrap();
        assert!(!tracker.check_submit(0).unwrap());
    }

    #[test]
    fn full_cycle() {
        let mut tracker = RecordingTracker::default();
        tracker.extend(1);
        tracker.begin(0).unwrap();
        tracker.end(0).unwrap();
        tracker.submitted(0).unwrap();
        assert_eq!(tracker.state(0), Some(BufferState::Pending));
        assert!(tracker.check_submit(0).is_err());

        // Re-recording after the slot fence was observed.
        tracker.begin(0).unwrap();
        assert_eq!(tracker.state(0), Some(BufferState::Recording));
    }

    #[test]
    fn double_begin_and_stray_end_rejected() {
        let mut tracker = RecordingTracker::default();
        tracker.extend(1);
        assert!(tracker.end(0).is_err());
        tracker.begin(0).unwrap();
        assert!(tracker.begin(0).is_err());
    }

    #[test]
    fn completion_returns_to_executable() {
        let mut tracker = RecordingTracker::default();
        tracker.extend(1);
        tracker.begin(0).unwrap();
        tracker.end(0).unwrap();
        tracker.submitted(0).unwrap();
        tracker.completed(0).unwrap();
        assert_eq!(tracker.state(0), Some(BufferState::Executable));
        assert!(!tracker.check_submit(0).unwrap());
    }

    #[test]
    fn unknown_index_rejected() {
        let mut tracker = RecordingTracker::default();
        assert!(tracker.begin(3).is_err());
        assert_eq!(tracker.state(3), None);
    }
}
