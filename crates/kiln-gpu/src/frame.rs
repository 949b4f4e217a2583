//! Frame-in-flight slot tracking.
//!
//! [`FrameSlots`] is a pure state machine: it owns no Vulkan objects and only
//! records which step each slot has reached, so the render loop cannot start
//! recording into a slot whose previous submission may still be executing.

use crate::error::{GpuError, Result};

/// Identifies one frame-in-flight slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameSlot(usize);

impl FrameSlot {
    /// Zero-based slot index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Where a slot is in its submit cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Never submitted.
    Idle,
    /// The slot fence has been observed signaled.
    Waited,
    /// Commands are being recorded for the slot.
    Recording,
    /// The slot fence was reset; the slot must now be submitted.
    Submitting,
    /// Submitted, the GPU may still be executing.
    InFlight,
}

/// Round-robin tracker for `N` frames in flight.
#[derive(Debug, Clone)]
pub struct FrameSlots {
    states: Vec<SlotState>,
    current: usize,
}

impl FrameSlots {
    /// Create a tracker for `count` slots.
    pub fn new(count: usize) -> Result<Self> {
        if count == 0 {
            return Err(GpuError::ContractViolation(
                "at least one frame in flight is required".to_string(),
            ));
        }
        Ok(Self {
            states: vec![SlotState::Idle; count],
            current: 0,
        })
    }

    /// Number of slots.
    pub fn count(&self) -> usize {
        self.states.len()
    }

    /// The slot the next frame will use.
    pub fn current(&self) -> FrameSlot {
        FrameSlot(self.current)
    }

    /// All slots in order.
    pub fn iter(&self) -> impl Iterator<Item = FrameSlot> {
        (0..self.states.len()).map(FrameSlot)
    }

    /// State of a slot.
    pub fn state(&self, slot: FrameSlot) -> SlotState {
        self.states[slot.0]
    }

    /// Record that the slot fence was waited on and found signaled.
    pub fn fence_waited(&mut self, slot: FrameSlot) -> Result<()> {
        match self.states[slot.0] {
            SlotState::Idle | SlotState::InFlight | SlotState::Waited => {
                self.states[slot.0] = SlotState::Waited;
                Ok(())
            }
            state @ (SlotState::Recording | SlotState::Submitting) => {
                Err(GpuError::ContractViolation(format!(
                    "slot {} fence waited in state {state:?}",
                    slot.0
                )))
            }
        }
    }

    /// Hand out the current slot for recording.
    ///
    /// Fails unless the slot fence wait has been observed since its last
    /// submission.
    pub fn begin_recording(&mut self) -> Result<FrameSlot> {
        let slot = self.current();
        match self.states[slot.0] {
            SlotState::Waited => {
                self.states[slot.0] = SlotState::Recording;
                Ok(slot)
            }
            state => Err(GpuError::ContractViolation(format!(
                "slot {} handed out for recording in state {state:?}",
                slot.0
            ))),
        }
    }

    /// Give up on a recording that was never submitted.
    pub fn abort_recording(&mut self, slot: FrameSlot) {
        if self.states[slot.0] == SlotState::Recording {
            self.states[slot.0] = SlotState::Waited;
        }
    }

    /// Record that the slot fence was reset ahead of submission.
    ///
    /// Only a finished recording may reset the fence, so a failure while
    /// recording leaves it signaled for the next wait.
    pub fn fence_reset(&mut self, slot: FrameSlot) -> Result<()> {
        if self.states[slot.0] != SlotState::Recording {
            return Err(GpuError::ContractViolation(format!(
                "slot {} fence reset in state {:?}",
                slot.0, self.states[slot.0]
            )));
        }
        self.states[slot.0] = SlotState::Submitting;
        Ok(())
    }

    /// Mark the slot as submitted.
    pub fn submitted(&mut self, slot: FrameSlot) -> Result<()> {
        if self.states[slot.0] != SlotState::Submitting {
            return Err(GpuError::ContractViolation(format!(
                "slot {} submitted without a fence reset",
                slot.0
            )));
        }
        self.states[slot.0] = SlotState::InFlight;
        Ok(())
    }

    /// Move on to the next slot.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.states.len();
    }

    /// Forget in-flight work after a device-wide idle wait.
    pub fn device_idle(&mut self) {
        for state in &mut self.states {
            if *state == SlotState::InFlight {
                *state = SlotState::Waited;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_slots_rejected() {
        assert!(FrameSlots::new(0).is_err());
    }

    #[test]
    fn recording_requires_fence_wait() {
        let mut slots = FrameSlots::new(2).unwrap();
        assert!(matches!(
            slots.begin_recording(),
            Err(GpuError::ContractViolation(_))
        ));

        let slot = slots.current();
        slots.fence_waited(slot).unwrap();
        assert_eq!(slots.begin_recording().unwrap(), slot);
        assert_eq!(slots.state(slot), SlotState::Recording);
    }

    #[test]
    fn slot_reuse_needs_new_wait() {
        let mut slots = FrameSlots::new(2).unwrap();

        for _ in 0..2 {
            let slot = slots.current();
            slots.fence_waited(slot).unwrap();
            slots.begin_recording().unwrap();
            slots.fence_reset(slot).unwrap();
            slots.submitted(slot).unwrap();
            slots.advance();
        }

        // Back at slot 0, still in flight.
        assert_eq!(slots.current().index(), 0);
        assert_eq!(slots.state(slots.current()), SlotState::InFlight);
        assert!(slots.begin_recording().is_err());

        slots.fence_waited(slots.current()).unwrap();
        assert!(slots.begin_recording().is_ok());
    }

    #[test]
    fn slots_cycle_modulo_count() {
        let mut slots = FrameSlots::new(3).unwrap();
        let order: Vec<usize> = (0..7)
            .map(|_| {
                let index = slots.current().index();
                slots.advance();
                index
            })
            .collect();
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(slots.iter().count(), 3);
    }

    #[test]
    fn submit_without_recording_is_rejected() {
        let mut slots = FrameSlots::new(1).unwrap();
        let slot = slots.current();
        slots.fence_waited(slot).unwrap();
        assert!(slots.submitted(slot).is_err());
    }

    #[test]
    fn fence_reset_only_after_recording() {
        let mut slots = FrameSlots::new(1).unwrap();
        let slot = slots.current();
        slots.fence_waited(slot).unwrap();
        assert!(slots.fence_reset(slot).is_err());

        slots.begin_recording().unwrap();
        assert!(slots.submitted(slot).is_err());
        slots.fence_reset(slot).unwrap();
        assert_eq!(slots.state(slot), SlotState::Submitting);
        assert!(slots.fence_waited(slot).is_err());
        slots.submitted(slot).unwrap();
        assert_eq!(slots.state(slot), SlotState::InFlight);
    }

    #[test]
    fn aborted_recording_keeps_wait() {
        let mut slots = FrameSlots::new(1).unwrap();
        let slot = slots.current();
        slots.fence_waited(slot).unwrap();
        slots.begin_recording().unwrap();
        slots.abort_recording(slot);
        assert_eq!(slots.state(slot), SlotState::Waited);

        // The fence was never reset, so the next frame can reuse the wait.
        slots.fence_waited(slot).unwrap();
        assert!(slots.begin_recording().is_ok());
    }

    #[test]
    fn device_idle_releases_in_flight_slots() {
        let mut slots = FrameSlots::new(2).unwrap();
        let slot = slots.current();
        slots.fence_waited(slot).unwrap();
        slots.begin_recording().unwrap();
        slots.fence_reset(slot).unwrap();
        slots.submitted(slot).unwrap();
        slots.device_idle();
        assert_eq!(slots.state(slot), SlotState::Waited);
    }
}
