//! Frame pacing and frame-time statistics.

use std::thread;
use std::time::{Duration, Instant};

/// How long to sleep so a frame lasts at least `min_frame_time`.
pub fn sleep_for(elapsed: Duration, min_frame_time: Option<Duration>) -> Duration {
    min_frame_time.map_or(Duration::ZERO, |min| min.saturating_sub(elapsed))
}

/// Timing of one finished frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTiming {
    /// Time spent on the frame, excluding the pacing sleep.
    pub work: Duration,
    /// Time slept to honor the minimum frame time.
    pub slept: Duration,
}

/// Enforces a minimum frame time and tracks frame statistics.
#[derive(Debug, Clone)]
pub struct FramePacer {
    min_frame_time: Option<Duration>,
    frames: u64,
    min_work: Duration,
    max_work: Duration,
    total_work: Duration,
}

impl FramePacer {
    /// Create a pacer; `None` disables sleeping.
    pub fn new(min_frame_time: Option<Duration>) -> Self {
        Self {
            min_frame_time,
            frames: 0,
            min_work: Duration::MAX,
            max_work: Duration::ZERO,
            total_work: Duration::ZERO,
        }
    }

    /// Sleep out the rest of the frame that began at `frame_start`.
    pub fn end_frame(&mut self, frame_start: Instant) -> FrameTiming {
        let work = frame_start.elapsed();
        let sleep = sleep_for(work, self.min_frame_time);
        if !sleep.is_zero() {
            thread::sleep(sleep);
        }
        let total = frame_start.elapsed();
        self.record(total, total.saturating_sub(work))
    }

    /// Account for a frame whose total duration included `slept`.
    pub fn record(&mut self, total: Duration, slept: Duration) -> FrameTiming {
        let timing = FrameTiming {
            work: total.saturating_sub(slept),
            slept,
        };
        self.frames += 1;
        self.min_work = self.min_work.min(timing.work);
        self.max_work = self.max_work.max(timing.work);
        self.total_work += timing.work;
        timing
    }

    /// Number of frames recorded.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Mean work time per frame.
    pub fn average_work(&self) -> Option<Duration> {
        (self.frames > 0).then(|| {
            Duration::from_secs_f64(self.total_work.as_secs_f64() / self.frames as f64)
        })
    }

    /// Log min/max/avg frame times.
    pub fn log_statistics(&self) {
        let Some(average) = self.average_work() else {
            return;
        };
        tracing::info!("Frame time statistics:");
        tracing::info!("  Min: {:.2} ms", self.min_work.as_secs_f64() * 1000.0);
        tracing::info!("  Max: {:.2} ms", self.max_work.as_secs_f64() * 1000.0);
        tracing::info!("  Avg: {:.2} ms", average.as_secs_f64() * 1000.0);
        tracing::info!("  Total frames: {}", self.frames);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn sleeps_only_below_minimum() {
        let min = Some(Duration::from_millis(5));
        assert_eq!(sleep_for(Duration::from_millis(2), min), Duration::from_millis(3));
        assert_eq!(sleep_for(Duration::from_millis(7), min), Duration::ZERO);
        assert_eq!(sleep_for(Duration::from_millis(2), None), Duration::ZERO);
    }

    #[test]
    fn reported_time_excludes_sleep() {
        let mut pacer = FramePacer::new(Some(Duration::from_millis(5)));
        let timing = pacer.record(Duration::from_millis(5), Duration::from_millis(3));
        assert_eq!(timing.work, Duration::from_millis(2));
        assert_eq!(timing.slept, Duration::from_millis(3));
    }

    #[test]
    fn statistics_track_work_time() {
        let mut pacer = FramePacer::new(None);
        assert!(pacer.average_work().is_none());

        pacer.record(Duration::from_millis(2), Duration::ZERO);
        pacer.record(Duration::from_millis(4), Duration::ZERO);
        assert_eq!(pacer.frames(), 2);
        assert_relative_eq!(
            pacer.average_work().unwrap().as_secs_f64(),
            0.003,
            epsilon = 1e-9
        );
    }

    #[test]
    fn end_frame_honors_minimum() {
        let mut pacer = FramePacer::new(Some(Duration::from_millis(2)));
        let start = Instant::now();
        pacer.end_frame(start);
        assert!(start.elapsed() >= Duration::from_millis(2));
    }

    #[test]
    fn end_frame_keeps_work_separate_from_sleep() {
        let mut pacer = FramePacer::new(Some(Duration::from_millis(50)));
        let start = Instant::now();
        thread::sleep(Duration::from_millis(20));
        let timing = pacer.end_frame(start);

        assert!(timing.work >= Duration::from_millis(20));
        assert!(timing.slept > Duration::ZERO);
        assert!(timing.work + timing.slept >= Duration::from_millis(50));
        assert_eq!(pacer.frames(), 1);
    }
}
