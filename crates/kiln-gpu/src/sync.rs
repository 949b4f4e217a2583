//! Synchronization primitives.
//!
//! Semaphores and fences live in a growable [`SyncPool`] and are addressed by
//! typed ids handed out at registration. The pool never shrinks, so an id stays
//! valid until [`SyncPool::destroy`].

use crate::error::{GpuError, Result};
use crate::frame::FrameSlot;
use ash::vk;

/// Handle to a semaphore registered in a [`SyncPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreId(usize);

/// Handle to a fence registered in a [`SyncPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceId(usize);

/// Owner of every semaphore and fence used by the frame loop.
#[derive(Debug, Default)]
pub struct SyncPool {
    semaphores: Vec<vk::Semaphore>,
    fences: Vec<vk::Fence>,
}

impl SyncPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a semaphore and register it.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn add_semaphore(&mut self, device: &ash::Device) -> Result<SemaphoreId> {
        let create_info = vk::SemaphoreCreateInfo::default();
        let semaphore = device.create_semaphore(&create_info, None)?;
        Ok(self.register_semaphore(semaphore))
    }

    /// Create a fence and register it.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn add_fence(&mut self, device: &ash::Device, signaled: bool) -> Result<FenceId> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::default().flags(flags);
        let fence = device.create_fence(&create_info, None)?;
        Ok(self.register_fence(fence))
    }

    fn register_semaphore(&mut self, semaphore: vk::Semaphore) -> SemaphoreId {
        self.semaphores.push(semaphore);
        SemaphoreId(self.semaphores.len() - 1)
    }

    fn register_fence(&mut self, fence: vk::Fence) -> FenceId {
        self.fences.push(fence);
        FenceId(self.fences.len() - 1)
    }

    /// Look up a semaphore.
    pub fn semaphore(&self, id: SemaphoreId) -> vk::Semaphore {
        self.semaphores[id.0]
    }

    /// Look up a fence.
    pub fn fence(&self, id: FenceId) -> vk::Fence {
        self.fences[id.0]
    }

    /// Number of registered semaphores.
    pub fn semaphore_count(&self) -> usize {
        self.semaphores.len()
    }

    /// Number of registered fences.
    pub fn fence_count(&self) -> usize {
        self.fences.len()
    }

    /// Wait for a fence to be signaled.
    ///
    /// # Safety
    /// The device must be the one the fence was created on.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn wait_for_fence(
        &self,
        device: &ash::Device,
        id: FenceId,
        timeout_ns: u64,
    ) -> Result<()> {
        match device.wait_for_fences(&[self.fence(id)], true, timeout_ns) {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(GpuError::Timeout("frame fence")),
            Err(e) => Err(e.into()),
        }
    }

    /// Reset a fence to unsignaled state.
    ///
    /// # Safety
    /// The fence must not be pending on any queue.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn reset_fence(&self, device: &ash::Device, id: FenceId) -> Result<()> {
        device.reset_fences(&[self.fence(id)])?;
        Ok(())
    }

    /// Destroy every registered primitive.
    ///
    /// # Safety
    /// None of the primitives may still be in use by the GPU.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        tracing::debug!(
            "Destroying {} semaphores and {} fences",
            self.semaphores.len(),
            self.fences.len()
        );
        for semaphore in self.semaphores.drain(..) {
            device.destroy_semaphore(semaphore, None);
        }
        for fence in self.fences.drain(..) {
            device.destroy_fence(fence, None);
        }
    }
}

/// Synchronization ids for one frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSync {
    /// Signaled when the acquired image is ready to be rendered to
    pub image_available: SemaphoreId,
    /// Signaled when rendering is complete
    pub render_finished: SemaphoreId,
    /// Signaled when the slot's submission has finished executing
    pub in_flight: FenceId,
}

/// Per-slot synchronization for `N` frames in flight.
#[derive(Debug, Clone)]
pub struct FrameSyncSet {
    frames: Vec<FrameSync>,
}

impl FrameSyncSet {
    /// Register `2N` semaphores and `N` signaled fences in `pool`.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(pool: &mut SyncPool, device: &ash::Device, frames: usize) -> Result<Self> {
        let semaphores = (0..frames * 2)
            .map(|_| pool.add_semaphore(device))
            .collect::<Result<Vec<_>>>()?;
        let fences = (0..frames)
            .map(|_| pool.add_fence(device, true))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::from_ids(&semaphores, &fences))
    }

    fn from_ids(semaphores: &[SemaphoreId], fences: &[FenceId]) -> Self {
        let frames = fences
            .iter()
            .enumerate()
            .map(|(i, &in_flight)| FrameSync {
                image_available: semaphores[2 * i],
                render_finished: semaphores[2 * i + 1],
                in_flight,
            })
            .collect();
        Self { frames }
    }

    /// Sync ids for a slot.
    pub fn get(&self, slot: FrameSlot) -> FrameSync {
        self.frames[slot.index()]
    }

    /// Number of frames covered.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether no frames are covered.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Fences of every slot, e.g. for a teardown wait.
    pub fn fences(&self) -> impl Iterator<Item = FenceId> + '_ {
        self.frames.iter().map(|frame| frame.in_flight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameSlots;
    use ash::vk::Handle;

    fn fake_pool(frames: usize) -> (SyncPool, FrameSyncSet) {
        let mut pool = SyncPool::new();
        let semaphores: Vec<_> = (0..frames * 2)
            .map(|i| pool.register_semaphore(vk::Semaphore::from_raw(i as u64 + 1)))
            .collect();
        let fences: Vec<_> = (0..frames)
            .map(|i| pool.register_fence(vk::Fence::from_raw(i as u64 + 100)))
            .collect();
        let set = FrameSyncSet::from_ids(&semaphores, &fences);
        (pool, set)
    }

    #[test]
    fn ids_are_sequential_and_stable() {
        let mut pool = SyncPool::new();
        let a = pool.register_semaphore(vk::Semaphore::from_raw(7));
        let b = pool.register_semaphore(vk::Semaphore::from_raw(9));
        assert_ne!(a, b);
        assert_eq!(pool.semaphore(a).as_raw(), 7);
        assert_eq!(pool.semaphore(b).as_raw(), 9);
        assert_eq!(pool.semaphore_count(), 2);
    }

    #[test]
    fn frame_set_registers_two_semaphores_and_one_fence_per_frame() {
        let (pool, set) = fake_pool(3);
        assert_eq!(pool.semaphore_count(), 6);
        assert_eq!(pool.fence_count(), 3);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn slots_get_distinct_primitives() {
        let (pool, set) = fake_pool(2);
        let slots = FrameSlots::new(2).unwrap();

        let mut semaphores = std::collections::HashSet::new();
        let mut fences = std::collections::HashSet::new();
        for slot in slots.iter() {
            let sync = set.get(slot);
            assert!(semaphores.insert(pool.semaphore(sync.image_available).as_raw()));
            assert!(semaphores.insert(pool.semaphore(sync.render_finished).as_raw()));
            assert!(fences.insert(pool.fence(sync.in_flight).as_raw()));
        }
        assert_eq!(set.fences().count(), 2);
    }
}
