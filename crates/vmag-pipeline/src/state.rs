//! Run state machine.
//!
//! ```text
//! Idle -> Initializing -> PyramidBuilding -> TemporalFiltering
//!      -> Reconstructing -> ReadingBack -> Complete | Cancelled | Failed
//! ```
//!
//! Stages overlap across frames, so the tracker records the furthest stage
//! reached.  Transitions only move forward; a terminal state ends the run.

use std::fmt;
use std::sync::Mutex;

use serde::Serialize;

use vmag_core::error::ErrorKind;

/// Where in the run an event happened or a failure occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Initializing,
    PyramidBuilding,
    TemporalFiltering,
    Reconstructing,
    ReadingBack,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::PyramidBuilding => "pyramid_building",
            Self::TemporalFiltering => "temporal_filtering",
            Self::Reconstructing => "reconstructing",
            Self::ReadingBack => "reading_back",
        }
    }

    /// Human phrase used in failure messages.
    pub fn describe(self) -> &'static str {
        match self {
            Self::Initializing => "initialization",
            Self::PyramidBuilding => "pyramid building",
            Self::TemporalFiltering => "temporal filtering",
            Self::Reconstructing => "reconstruction",
            Self::ReadingBack => "readback",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum PipelineState {
    Idle,
    Running { stage: Stage },
    Complete,
    Cancelled,
    Failed { stage: Stage, kind: ErrorKind },
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Failed { .. })
    }

    fn rank(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Running { stage } => 1 + stage as u8,
            Self::Complete | Self::Cancelled | Self::Failed { .. } => u8::MAX,
        }
    }
}

impl From<Stage> for PipelineState {
    fn from(stage: Stage) -> Self {
        Self::Running { stage }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Running { stage } => write!(f, "{stage}"),
            Self::Complete => f.write_str("complete"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Failed { stage, kind } => write!(f, "failed({stage}, {kind})"),
        }
    }
}

/// Forward-only transition log of the most recent run.
#[derive(Debug)]
pub struct StateTracker {
    history: Mutex<Vec<PipelineState>>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self {
            history: Mutex::new(vec![PipelineState::Idle]),
        }
    }
}

impl StateTracker {
    /// Start a fresh history at `Idle`.
    pub fn reset(&self) {
        if let Ok(mut h) = self.history.lock() {
            h.clear();
            h.push(PipelineState::Idle);
        }
    }

    /// Move to `next` if it lies ahead of the current state.  Returns
    /// whether the transition was recorded.
    pub fn advance(&self, next: PipelineState) -> bool {
        let Ok(mut h) = self.history.lock() else {
            return false;
        };
        let current = h.last().copied().unwrap_or(PipelineState::Idle);
        if current.is_terminal() || next.rank() <= current.rank() {
            return false;
        }
        h.push(next);
        true
    }

    pub fn current(&self) -> PipelineState {
        self.history
            .lock()
            .ok()
            .and_then(|h| h.last().copied())
            .unwrap_or(PipelineState::Idle)
    }

    pub fn history(&self) -> Vec<PipelineState> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_only_move_forward() {
        let t = StateTracker::default();
        assert!(t.advance(Stage::Initializing.into()));
        assert!(t.advance(Stage::TemporalFiltering.into()));
        assert!(!t.advance(Stage::PyramidBuilding.into()));
        assert!(!t.advance(Stage::TemporalFiltering.into()));
        assert!(t.advance(PipelineState::Complete));
        assert!(!t.advance(PipelineState::Cancelled));
        assert_eq!(
            t.history(),
            vec![
                PipelineState::Idle,
                Stage::Initializing.into(),
                Stage::TemporalFiltering.into(),
                PipelineState::Complete,
            ]
        );
    }

    #[test]
    fn failure_is_terminal_from_any_stage() {
        let t = StateTracker::default();
        t.advance(Stage::Initializing.into());
        let failed = PipelineState::Failed {
            stage: Stage::Initializing,
            kind: ErrorKind::Configuration,
        };
        assert!(t.advance(failed));
        assert_eq!(t.current(), failed);
        assert_eq!(failed.to_string(), "failed(initializing, configuration)");

        t.reset();
        assert_eq!(t.history(), vec![PipelineState::Idle]);
    }
}
