//! Progress reporting.

use serde::Serialize;

use crate::state::Stage;

/// Per-frame work units: pyramid, filter, reconstruct, readback.
const UNITS_PER_FRAME: u64 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ProgressUpdate {
    /// Monotonically non-decreasing, in `[0, 1]`.
    pub fraction: f64,
    pub stage: &'static str,
    /// Frames that have been read back.
    pub frames_completed: u64,
    pub total_frames: u64,
}

/// Receives progress from the orchestrator task.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, update: &ProgressUpdate);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressUpdate) + Send + Sync,
{
    fn on_progress(&self, update: &ProgressUpdate) {
        self(update)
    }
}

/// Discards every update.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _update: &ProgressUpdate) {}
}

/// Turns per-stage frame completions into monotonic fractions.
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    total_frames: u64,
    units_done: u64,
    frames_completed: u64,
    last_fraction: f64,
}

impl ProgressTracker {
    pub(crate) fn new(total_frames: u64) -> Self {
        Self {
            total_frames,
            units_done: 0,
            frames_completed: 0,
            last_fraction: 0.0,
        }
    }

    /// Count one frame finishing `stage`.
    pub(crate) fn frame_done(&mut self, stage: Stage) -> ProgressUpdate {
        self.units_done += 1;
        if stage == Stage::ReadingBack {
            self.frames_completed += 1;
        }
        let total_units = (self.total_frames * UNITS_PER_FRAME).max(1);
        let fraction = (self.units_done as f64 / total_units as f64).min(1.0);
        self.last_fraction = self.last_fraction.max(fraction);
        self.update(stage.as_str())
    }

    /// Report `stage` without completing work, e.g. "initializing".
    pub(crate) fn update(&self, stage: &'static str) -> ProgressUpdate {
        ProgressUpdate {
            fraction: self.last_fraction,
            stage,
            frames_completed: self.frames_completed,
            total_frames: self.total_frames,
        }
    }

    pub(crate) fn complete(&mut self) -> ProgressUpdate {
        self.last_fraction = 1.0;
        self.update("complete")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fractions_are_monotonic_and_reach_one() {
        let mut t = ProgressTracker::new(2);
        let mut last = 0.0;
        for stage in [
            Stage::PyramidBuilding,
            Stage::PyramidBuilding,
            Stage::TemporalFiltering,
            Stage::Reconstructing,
            Stage::ReadingBack,
            Stage::TemporalFiltering,
            Stage::Reconstructing,
            Stage::ReadingBack,
        ] {
            let u = t.frame_done(stage);
            assert!(u.fraction >= last && u.fraction <= 1.0);
            last = u.fraction;
        }
        assert_eq!(last, 1.0);
        assert_eq!(t.update("x").frames_completed, 2);
        assert_eq!(t.complete().fraction, 1.0);
    }

    #[test]
    fn closures_are_sinks() {
        let seen = std::sync::Mutex::new(Vec::new());
        let sink = |u: &ProgressUpdate| seen.lock().unwrap().push(u.stage);
        let mut t = ProgressTracker::new(1);
        sink.on_progress(&t.frame_done(Stage::PyramidBuilding));
        assert_eq!(*seen.lock().unwrap(), vec!["pyramid_building"]);
    }
}
