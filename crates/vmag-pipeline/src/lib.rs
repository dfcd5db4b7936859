//! Orchestration layer of the vmag motion-magnification engine.
//!
//! [`MagnificationPipeline`] runs a frame sequence through three concurrent
//! stages (pyramid construction, temporal band-pass filtering, and
//! reconstruction with readback) and reports a terminal [`RunOutcome`].
//!
//! Supporting modules:
//!
//! - [`job`]: processing parameters, JSON job files and run reports.
//! - [`state`]: the forward-only run state machine.
//! - [`progress`]: monotonic progress fractions and sinks.
//! - [`runtime`]: device setup and raw frame file I/O for front ends.
//! - [`synthetic`]: oscillating test scenes and amplitude measurement.

pub mod job;
pub mod pipeline;
pub mod progress;
pub mod runtime;
pub mod state;
pub mod synthetic;

pub use job::{FrequencyBand, MagnifyJob, ProcessingParameters, RunReport, StageTimingReport};
pub use pipeline::{
    MagnificationPipeline, MagnifiedOutput, PipelineConfig, PipelineFailure, PipelineMetrics,
    RunOutcome, working_set_bytes,
};
pub use progress::{NoProgress, ProgressSink, ProgressUpdate};
pub use state::{PipelineState, Stage};
