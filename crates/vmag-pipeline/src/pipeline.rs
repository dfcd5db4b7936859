//! Bounded magnification pipeline: pyramid → temporal filter → reconstruct
//! and read back.
//!
//! # Architecture
//!
//! Three concurrent stages, each with its own device stream, connected by
//! bounded `tokio::sync::mpsc` channels:
//!
//! ```text
//! ┌──────────────┐  ch(2)  ┌─────────────┐  ch(2)  ┌──────────────────────┐
//! │ crop, upload │────────►│  temporal   │────────►│ amplify + collapse,  │
//! │ + pyramid    │         │  band-pass  │         │ readback, composite  │
//! └──────────────┘         └─────────────┘         └──────────────────────┘
//! ```
//!
//! The pyramid for frame `t + 1` is built while frame `t` is filtered.  The
//! filter stage is the single owner of the recurrence state and receives
//! frames in order over one FIFO channel.
//!
//! # Shutdown protocol
//!
//! 1. **Normal EOS**: the pyramid stage runs out of frames and drops its
//!    sender; the closure cascades downstream.
//! 2. **Cancellation**: every stage polls the token between frames, stops
//!    issuing work and returns.
//! 3. **Error**: the failing stage returns `Err`; the orchestrator cancels
//!    the remaining stages and keeps the first root-cause error.
//!
//! After every task is joined the orchestrator sweeps all buffers tagged
//! with the run's owner, so no handle outlives the run on any exit path.
//!
//! # Metrics
//!
//! [`PipelineMetrics`] tracks per-stage frame counts with atomic counters and
//! cumulative wall-clock latency per stage.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use vmag_core::backend::{BufferDesc, BufferUsage};
use vmag_core::context::{BufferHandle, DeviceContext, Stream};
use vmag_core::error::{EngineError, ErrorKind, Result};
use vmag_core::types::{Frame, FrameSequence, Roi};
use vmag_kernels::{
    FramePyramid, PyramidBuilder, PyramidLayout, ReconstructedFrame, Reconstructor,
    TemporalCoefficients, TemporalFilter,
};

use crate::job::{Fnv1a, ProcessingParameters, REPORT_SCHEMA_VERSION, RunReport, StageTimingReport};
use crate::progress::{ProgressSink, ProgressTracker};
use crate::state::{PipelineState, Stage, StateTracker};

// ─── Metrics ────────────────────────────────────────────────────────────────

/// Atomic per-stage frame counters and latency tracking.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Frames whose pyramid has been built.
    pub frames_pyramid: AtomicU64,
    /// Frames folded into the temporal filter.
    pub frames_filtered: AtomicU64,
    /// Frames collapsed back to full resolution.
    pub frames_reconstructed: AtomicU64,
    /// Frames read back and composited.
    pub frames_read_back: AtomicU64,
    pub pyramid_total_us: AtomicU64,
    pub filter_total_us: AtomicU64,
    pub reconstruct_total_us: AtomicU64,
    pub readback_total_us: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn reset(&self) {
        for counter in [
            &self.frames_pyramid,
            &self.frames_filtered,
            &self.frames_reconstructed,
            &self.frames_read_back,
            &self.pyramid_total_us,
            &self.filter_total_us,
            &self.reconstruct_total_us,
            &self.readback_total_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Validate ordering invariants.  Should hold at shutdown.
    pub fn validate(&self) -> bool {
        let (p, f, r, b) = self.ordering_counts();
        p >= f && f >= r && r >= b
    }

    fn ordering_counts(&self) -> (u64, u64, u64, u64) {
        (
            self.frames_pyramid.load(Ordering::Acquire),
            self.frames_filtered.load(Ordering::Acquire),
            self.frames_reconstructed.load(Ordering::Acquire),
            self.frames_read_back.load(Ordering::Acquire),
        )
    }

    /// Average per-frame latency of each stage.
    pub fn timing(&self) -> StageTimingReport {
        let avg = |total: &AtomicU64, count: &AtomicU64| -> u64 {
            match count.load(Ordering::Relaxed) {
                0 => 0,
                n => total.load(Ordering::Relaxed) / n,
            }
        };
        StageTimingReport {
            pyramid_us: avg(&self.pyramid_total_us, &self.frames_pyramid),
            filter_us: avg(&self.filter_total_us, &self.frames_filtered),
            reconstruct_us: avg(&self.reconstruct_total_us, &self.frames_reconstructed),
            readback_us: avg(&self.readback_total_us, &self.frames_read_back),
        }
    }

    /// Report stage latencies (avg microseconds).
    pub fn report(&self) {
        let t = self.timing();
        info!(
            pyramid_avg_us = t.pyramid_us,
            filter_avg_us = t.filter_us,
            reconstruct_avg_us = t.reconstruct_us,
            readback_avg_us = t.readback_us,
            "Stage latencies"
        );
    }
}

fn enforce_metrics_invariants(metrics: &PipelineMetrics, strict: bool) -> Result<()> {
    if !strict || metrics.validate() {
        return Ok(());
    }

    let (pyramid, filtered, reconstructed, read_back) = metrics.ordering_counts();
    Err(EngineError::InvariantViolation(format!(
        "Pipeline ordering violation: pyramid={pyramid} filtered={filtered} \
         reconstructed={reconstructed} read_back={read_back}"
    )))
}

fn elapsed_us(start: Instant) -> u64 {
    start.elapsed().as_micros().min(u64::MAX as u128) as u64
}

// ─── Configuration ──────────────────────────────────────────────────────────

/// Runtime configuration for a [`MagnificationPipeline`] instance.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Channel capacity: pyramid → temporal filter.
    pub pyramid_capacity: usize,
    /// Channel capacity: temporal filter → reconstruction.
    pub filtered_capacity: usize,
    /// Live device memory budget applied to the context, `None` = unlimited.
    pub memory_budget_bytes: Option<usize>,
    /// Promote metrics monotonicity violations into a hard error at shutdown.
    pub strict_invariants: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pyramid_capacity: 2,
            filtered_capacity: 2,
            memory_budget_bytes: None,
            strict_invariants: false,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pyramid_capacity == 0 || self.filtered_capacity == 0 {
            return Err(EngineError::InvalidConfig(format!(
                "channel capacities must be at least 1 (pyramid={}, filtered={})",
                self.pyramid_capacity, self.filtered_capacity
            )));
        }
        Ok(())
    }
}

/// Worst-case live bytes of one run: filter state plus every frame that can
/// be in flight between and inside the stages.
pub fn working_set_bytes(layout: &PyramidLayout, config: &PipelineConfig) -> usize {
    let residuals = layout.residual_samples();
    // Pyramid, band planes, collapse targets and the clamp counter.
    let per_frame = (3 * residuals + layout.coarsest().len() + 1) * size_of::<f32>();
    let in_flight = config.pyramid_capacity + config.filtered_capacity + 3;
    TemporalFilter::state_bytes(layout) + per_frame * in_flight
}

// ─── Outcomes ───────────────────────────────────────────────────────────────

/// A failed run: which stage, which taxonomy bucket, and why.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("failed during {}: {}", .stage.describe(), .message)]
pub struct PipelineFailure {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub code: u32,
    pub message: String,
}

impl PipelineFailure {
    pub fn new(stage: Stage, err: &EngineError) -> Self {
        let mut message = err.to_string();
        if let EngineError::OutOfMemory { .. } = err {
            message.push_str("; try a smaller region or a shallower pyramid");
        }
        Self {
            stage,
            kind: err.kind(),
            code: err.error_code(),
            message,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MagnifiedOutput {
    /// Same dimensions, count, format and frame rate as the input.
    pub sequence: FrameSequence,
    pub report: RunReport,
}

/// Terminal result of [`MagnificationPipeline::run`].
#[derive(Debug)]
pub enum RunOutcome {
    Success(MagnifiedOutput),
    Cancelled,
    Failed(PipelineFailure),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn state(&self) -> PipelineState {
        match self {
            Self::Success(_) => PipelineState::Complete,
            Self::Cancelled => PipelineState::Cancelled,
            Self::Failed(f) => PipelineState::Failed {
                stage: f.stage,
                kind: f.kind,
            },
        }
    }
}

// ─── Stage plumbing ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct StageError {
    stage: Stage,
    error: EngineError,
}

type StageResult<T> = std::result::Result<T, StageError>;

trait AtStage<T> {
    fn at(self, stage: Stage) -> StageResult<T>;
}

impl<T> AtStage<T> for Result<T> {
    fn at(self, stage: Stage) -> StageResult<T> {
        self.map_err(|error| StageError { stage, error })
    }
}

/// What a stage task hands back when it finishes cleanly.
enum StageExit {
    Upstream,
    Output(Collected),
}

/// Stage tasks tagged with the stage each one runs, so a panic is charged
/// to the task that raised it.
struct StageTasks<T> {
    set: JoinSet<StageResult<T>>,
    stages: HashMap<task::Id, Stage>,
}

impl<T: Send + 'static> StageTasks<T> {
    fn new() -> Self {
        Self {
            set: JoinSet::new(),
            stages: HashMap::new(),
        }
    }

    fn spawn<F>(&mut self, stage: Stage, fut: F)
    where
        F: Future<Output = StageResult<T>> + Send + 'static,
    {
        let handle = self.set.spawn(fut);
        self.stages.insert(handle.id(), stage);
    }

    async fn join_next(&mut self) -> Option<StageResult<T>> {
        let joined = self.set.join_next().await?;
        Some(joined.unwrap_or_else(|join_err| {
            let stage = self
                .stages
                .get(&join_err.id())
                .copied()
                .unwrap_or(Stage::Initializing);
            error!(%stage, %join_err, "Pipeline task panicked");
            Err(StageError::new(
                stage,
                EngineError::PanicRecovered {
                    stage: stage.as_str(),
                    message: join_err.to_string(),
                },
            ))
        }))
    }
}

struct Collected {
    frames: Vec<Frame>,
    clamped: u64,
    checksum: Fnv1a,
}

/// Pyramid plus band-pass planes of one frame.
struct FilteredFrame {
    pyramid: FramePyramid,
    bands: Vec<BufferHandle>,
}

impl FilteredFrame {
    fn release(self, ctx: &DeviceContext) {
        self.pyramid.release(ctx);
        for band in self.bands {
            ctx.release(band);
        }
    }
}

/// Shared by every stage task of one run.
#[derive(Clone)]
struct StageCtx {
    ctx: Arc<DeviceContext>,
    owner: Arc<str>,
    metrics: Arc<PipelineMetrics>,
    events: mpsc::UnboundedSender<Stage>,
    cancel: CancellationToken,
}

impl StageCtx {
    fn frame_done(&self, stage: Stage) {
        // The orchestrator may already have stopped listening.
        let _ = self.events.send(stage);
    }

    /// Downstream hung up.  Expected after cancellation, an error otherwise.
    fn closed(&self, stage: Stage) -> StageResult<()> {
        if self.cancel.is_cancelled() {
            Ok(())
        } else {
            Err(StageError {
                stage,
                error: EngineError::ChannelClosed,
            })
        }
    }
}

/// Validated inputs of a run.
struct RunPlan {
    roi: Roi,
    coefficients: TemporalCoefficients,
    layout: Arc<PyramidLayout>,
}

// ─── Pipeline ───────────────────────────────────────────────────────────────

/// Motion-magnification pipeline over one device context.
///
/// Call [`run`](Self::run) once per sequence.  Cancelling the token returned
/// by [`cancel_token`](Self::cancel_token) stops the current run and every
/// later one.
pub struct MagnificationPipeline {
    ctx: Arc<DeviceContext>,
    config: PipelineConfig,
    cancel: CancellationToken,
    metrics: Arc<PipelineMetrics>,
    state: StateTracker,
    runs: AtomicU64,
}

impl MagnificationPipeline {
    /// Create a pipeline.  A configured memory budget is applied to `ctx`.
    pub fn new(ctx: Arc<DeviceContext>, config: PipelineConfig) -> Self {
        if config.memory_budget_bytes.is_some() {
            ctx.set_memory_budget(config.memory_budget_bytes);
        }
        Self {
            ctx,
            config,
            cancel: CancellationToken::new(),
            metrics: PipelineMetrics::new(),
            state: StateTracker::default(),
            runs: AtomicU64::new(0),
        }
    }

    /// Return a clone of the pipeline's cancellation token.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    /// Current state of the most recent run.
    pub fn state(&self) -> PipelineState {
        self.state.current()
    }

    /// Every state the most recent run passed through, in order.
    pub fn state_history(&self) -> Vec<PipelineState> {
        self.state.history()
    }

    /// Magnify `roi` of every frame in `sequence`.
    ///
    /// # Shutdown guarantee
    ///
    /// When this function returns, every stage task is joined and every
    /// buffer the run allocated has been released.
    #[instrument(skip_all, name = "magnify_pipeline", fields(frames = sequence.len(), roi = %roi))]
    pub async fn run(
        &self,
        sequence: &FrameSequence,
        roi: Roi,
        params: &ProcessingParameters,
        progress: &dyn ProgressSink,
    ) -> RunOutcome {
        self.state.reset();
        self.metrics.reset();
        self.state.advance(Stage::Initializing.into());
        let mut tracker = ProgressTracker::new(sequence.len() as u64);
        progress.on_progress(&tracker.update(Stage::Initializing.as_str()));

        let plan = match self.prepare(sequence, roi, params) {
            Ok(plan) => plan,
            Err(err) => return self.fail(StageError::new(Stage::Initializing, err)),
        };

        let owner: Arc<str> = Arc::from(format!("run-{}", self.runs.fetch_add(1, Ordering::Relaxed)));
        self.ctx.reset_peak();
        info!(
            owner = %owner,
            alpha_low = plan.coefficients.alpha_low,
            alpha_high = plan.coefficients.alpha_high,
            levels = plan.layout.depth(),
            gain = params.gain,
            "Run initialized"
        );

        let executed = self
            .execute(sequence, &plan, params.gain, owner.clone(), progress, &mut tracker)
            .await;

        // Shutdown barrier: every task is joined, sweep whatever is left.
        let swept = self.ctx.release_owner(&owner);
        if swept.failed > 0 {
            warn!(owner = %owner, failed = swept.failed, "Owner sweep incomplete");
        } else if swept.released > 0 {
            debug!(owner = %owner, released = swept.released, "Owner sweep released leftovers");
        }

        let (current, peak) = self.ctx.memory_usage();
        info!(
            pyramid = self.metrics.frames_pyramid.load(Ordering::Relaxed),
            filtered = self.metrics.frames_filtered.load(Ordering::Relaxed),
            reconstructed = self.metrics.frames_reconstructed.load(Ordering::Relaxed),
            read_back = self.metrics.frames_read_back.load(Ordering::Relaxed),
            memory_current_bytes = current,
            memory_peak_bytes = peak,
            "Pipeline finished"
        );
        self.metrics.report();
        self.ctx.report_pool_stats();

        match executed {
            Err(err) => self.fail(err),
            Ok(None) => {
                self.state.advance(PipelineState::Cancelled);
                info!("Run cancelled");
                progress.on_progress(&tracker.update("cancelled"));
                RunOutcome::Cancelled
            }
            Ok(Some(collected)) => match self.finish(sequence, &plan, params, collected, peak) {
                Ok(output) => {
                    self.state.advance(PipelineState::Complete);
                    progress.on_progress(&tracker.complete());
                    RunOutcome::Success(output)
                }
                Err(err) => self.fail(err),
            },
        }
    }

    fn prepare(
        &self,
        sequence: &FrameSequence,
        roi: Roi,
        params: &ProcessingParameters,
    ) -> Result<RunPlan> {
        self.config.validate()?;
        roi.validate(sequence.width(), sequence.height())?;
        let coefficients = params.validate(sequence.frame_rate())?;
        let layout = Arc::new(params.layout(roi.extent(sequence.format().channels()))?);

        let working_set = working_set_bytes(&layout, &self.config);
        debug!(working_set, "Working-set preflight");
        self.ctx.check_headroom(working_set)?;

        Ok(RunPlan {
            roi,
            coefficients,
            layout,
        })
    }

    fn fail(&self, err: StageError) -> RunOutcome {
        let failure = PipelineFailure::new(err.stage, &err.error);
        self.state.advance(PipelineState::Failed {
            stage: failure.stage,
            kind: failure.kind,
        });
        error!(
            stage = %failure.stage,
            kind = %failure.kind,
            code = failure.code,
            "{failure}"
        );
        RunOutcome::Failed(failure)
    }

    /// Spawn the stages and join them.  `Ok(None)` means cancelled.
    async fn execute(
        &self,
        sequence: &FrameSequence,
        plan: &RunPlan,
        gain: f64,
        owner: Arc<str>,
        progress: &dyn ProgressSink,
        tracker: &mut ProgressTracker,
    ) -> StageResult<Option<Collected>> {
        let ctx = self.ctx.clone();

        // Filter state is allocated once, up front.
        let filter = TemporalFilter::new(
            ctx.clone(),
            owner.clone(),
            plan.layout.clone(),
            plan.coefficients,
        )
        .at(Stage::Initializing)?;
        let [pyramid_stream, filter_stream, output_stream] = match open_streams(&ctx) {
            Ok(streams) => streams,
            Err(err) => {
                filter.release();
                return Err(StageError::new(Stage::Initializing, err));
            }
        };

        let abort = self.cancel.child_token();
        let (tx_pyramid, rx_pyramid) = mpsc::channel::<FramePyramid>(self.config.pyramid_capacity);
        let (tx_filtered, rx_filtered) =
            mpsc::channel::<FilteredFrame>(self.config.filtered_capacity);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Stage>();

        let sc = StageCtx {
            ctx: ctx.clone(),
            owner: owner.clone(),
            metrics: self.metrics.clone(),
            events: events_tx,
            cancel: abort.clone(),
        };
        let frames: Arc<[Frame]> = Arc::from(sequence.frames());

        let mut tasks: StageTasks<StageExit> = StageTasks::new();

        // ── Stage 1: crop, upload, pyramid ──
        {
            let sc = sc.clone();
            let builder = PyramidBuilder::new(ctx.clone(), owner.clone(), plan.layout.clone());
            let frames = frames.clone();
            let roi = plan.roi;
            tasks.spawn(Stage::PyramidBuilding, async move {
                pyramid_stage(&sc, &builder, &pyramid_stream, &frames, roi, tx_pyramid).await
            });
        }

        // ── Stage 2: temporal band-pass (single owner of the filter state) ──
        {
            let sc = sc.clone();
            tasks.spawn(Stage::TemporalFiltering, async move {
                filter_stage(&sc, filter, &filter_stream, rx_pyramid, tx_filtered).await
            });
        }

        // ── Stage 3: amplify, collapse, read back, composite ──
        {
            let reconstructor =
                Reconstructor::new(ctx.clone(), owner.clone(), plan.layout.clone(), gain);
            let roi = plan.roi;
            tasks.spawn(Stage::Reconstructing, async move {
                output_stage(&sc, &reconstructor, &output_stream, &frames, roi, rx_filtered).await
            });
        }

        // ── Collect results and forward progress ──

        let mut first_error: Option<StageError> = None;
        let mut collected: Option<Collected> = None;

        loop {
            tokio::select! {
                biased;

                Some(stage) = events_rx.recv() => {
                    self.on_frame_done(stage, tracker, progress);
                }
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok(StageExit::Output(out)) => collected = Some(out),
                        Ok(StageExit::Upstream) => {}
                        Err(err) => {
                            error!(stage = %err.stage, error = %err.error, "Pipeline stage failed");
                            abort.cancel();
                            keep_root_cause(&mut first_error, err);
                        }
                    }
                }
            }
        }
        while let Ok(stage) = events_rx.try_recv() {
            self.on_frame_done(stage, tracker, progress);
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        enforce_metrics_invariants(&self.metrics, self.config.strict_invariants)
            .at(Stage::ReadingBack)?;
        match collected {
            Some(out) if out.frames.len() == sequence.len() => Ok(Some(out)),
            Some(out) => Err(StageError::new(
                Stage::ReadingBack,
                EngineError::InvariantViolation(format!(
                    "read back {} of {} frames",
                    out.frames.len(),
                    sequence.len()
                )),
            )),
            None => Err(StageError::new(
                Stage::ReadingBack,
                EngineError::InvariantViolation("output stage returned no frames".into()),
            )),
        }
    }

    fn on_frame_done(&self, stage: Stage, tracker: &mut ProgressTracker, progress: &dyn ProgressSink) {
        if self.state.advance(stage.into()) {
            debug!(%stage, "Stage reached");
        }
        progress.on_progress(&tracker.frame_done(stage));
    }

    fn finish(
        &self,
        sequence: &FrameSequence,
        plan: &RunPlan,
        params: &ProcessingParameters,
        collected: Collected,
        peak_memory_bytes: usize,
    ) -> StageResult<MagnifiedOutput> {
        let frames = collected.frames.len() as u64;
        let output = FrameSequence::new(collected.frames, sequence.frame_rate())
            .at(Stage::ReadingBack)?;
        let report = RunReport {
            schema_version: REPORT_SCHEMA_VERSION,
            frames,
            roi: plan.roi,
            gain: params.gain,
            pyramid_depth: params.pyramid_depth,
            alpha_low: plan.coefficients.alpha_low,
            alpha_high: plan.coefficients.alpha_high,
            stage_timing: self.metrics.timing(),
            clamped_samples: collected.clamped,
            peak_memory_bytes,
            pool_hit_rate_pct: self.ctx.health_snapshot().pool.map(|p| p.hit_rate()),
            output_checksum: collected.checksum.finish_hex(),
        };
        info!(
            frames,
            clamped_samples = report.clamped_samples,
            checksum = %report.output_checksum,
            "Run complete"
        );
        Ok(MagnifiedOutput {
            sequence: output,
            report,
        })
    }
}

impl StageError {
    fn new(stage: Stage, error: EngineError) -> Self {
        Self { stage, error }
    }
}

fn open_streams(ctx: &DeviceContext) -> Result<[Stream; 3]> {
    Ok([
        ctx.create_stream("pyramid")?,
        ctx.create_stream("filter")?,
        ctx.create_stream("output")?,
    ])
}

/// Keep the first error, unless it was only a closed channel caused by the
/// real failure elsewhere.
fn keep_root_cause(slot: &mut Option<StageError>, err: StageError) {
    let replace = match slot {
        None => true,
        Some(prev) => {
            matches!(prev.error, EngineError::ChannelClosed)
                && !matches!(err.error, EngineError::ChannelClosed)
        }
    };
    if replace {
        *slot = Some(err);
    } else {
        debug!(stage = %err.stage, error = %err.error, "Secondary stage error");
    }
}

// ─── Stage implementations ──────────────────────────────────────────────────

async fn pyramid_stage(
    sc: &StageCtx,
    builder: &PyramidBuilder,
    stream: &Stream,
    frames: &[Frame],
    roi: Roi,
    tx: mpsc::Sender<FramePyramid>,
) -> StageResult<StageExit> {
    const STAGE: Stage = Stage::PyramidBuilding;
    for (t, frame) in frames.iter().enumerate() {
        if sc.cancel.is_cancelled() {
            debug!(frame = t, "Pyramid stage cancelled");
            break;
        }
        let start = Instant::now();
        let planes = frame.roi_planes(&roi);
        let level0 = sc
            .ctx
            .allocate(
                &sc.owner,
                BufferDesc::f32(planes.len()),
                BufferUsage::UPLOAD | BufferUsage::STORAGE,
            )
            .at(STAGE)?;
        if let Err(err) = stream.upload(&level0, planes).await {
            sc.ctx.release(level0);
            return Err(StageError::new(STAGE, err));
        }
        let pyramid = builder.build(stream, t as u64, level0).await.at(STAGE)?;
        sc.metrics.frames_pyramid.fetch_add(1, Ordering::AcqRel);
        sc.metrics
            .pyramid_total_us
            .fetch_add(elapsed_us(start), Ordering::Relaxed);
        sc.frame_done(STAGE);

        tokio::select! {
            biased;
            _ = sc.cancel.cancelled() => {
                pyramid.release(&sc.ctx);
                break;
            }
            permit = tx.reserve() => match permit {
                Ok(permit) => permit.send(pyramid),
                Err(_) => {
                    pyramid.release(&sc.ctx);
                    sc.closed(STAGE)?;
                    break;
                }
            },
        }
    }
    debug!("Pyramid stage: EOS");
    Ok(StageExit::Upstream)
}

async fn filter_stage(
    sc: &StageCtx,
    mut filter: TemporalFilter,
    stream: &Stream,
    rx: mpsc::Receiver<FramePyramid>,
    tx: mpsc::Sender<FilteredFrame>,
) -> StageResult<StageExit> {
    let result = filter_loop(sc, &mut filter, stream, rx, tx).await;
    let frames = filter.frames_applied();
    let released = filter.release();
    debug!(frames, released, "Temporal filter state released");
    result
}

async fn filter_loop(
    sc: &StageCtx,
    filter: &mut TemporalFilter,
    stream: &Stream,
    mut rx: mpsc::Receiver<FramePyramid>,
    tx: mpsc::Sender<FilteredFrame>,
) -> StageResult<StageExit> {
    const STAGE: Stage = Stage::TemporalFiltering;
    loop {
        let pyramid = tokio::select! {
            biased;
            _ = sc.cancel.cancelled() => {
                debug!("Filter stage cancelled");
                break;
            }
            next = rx.recv() => match next {
                Some(pyramid) => pyramid,
                None => break,
            },
        };
        let start = Instant::now();
        let bands = match filter.apply(stream, &pyramid).await {
            Ok(bands) => bands,
            Err(err) => {
                pyramid.release(&sc.ctx);
                return Err(StageError::new(STAGE, err));
            }
        };
        sc.metrics.frames_filtered.fetch_add(1, Ordering::AcqRel);
        sc.metrics
            .filter_total_us
            .fetch_add(elapsed_us(start), Ordering::Relaxed);
        sc.frame_done(STAGE);

        let item = FilteredFrame { pyramid, bands };
        tokio::select! {
            biased;
            _ = sc.cancel.cancelled() => {
                item.release(&sc.ctx);
                break;
            }
            permit = tx.reserve() => match permit {
                Ok(permit) => permit.send(item),
                Err(_) => {
                    item.release(&sc.ctx);
                    sc.closed(STAGE)?;
                    break;
                }
            },
        }
    }
    debug!(frames = filter.frames_applied(), "Filter stage: EOS");
    Ok(StageExit::Upstream)
}

async fn output_stage(
    sc: &StageCtx,
    reconstructor: &Reconstructor,
    stream: &Stream,
    frames: &[Frame],
    roi: Roi,
    mut rx: mpsc::Receiver<FilteredFrame>,
) -> StageResult<StageExit> {
    let mut out = Collected {
        frames: Vec::with_capacity(frames.len()),
        clamped: 0,
        checksum: Fnv1a::default(),
    };
    loop {
        let item = tokio::select! {
            biased;
            _ = sc.cancel.cancelled() => {
                debug!("Output stage cancelled");
                break;
            }
            next = rx.recv() => match next {
                Some(item) => item,
                None => break,
            },
        };

        let start = Instant::now();
        let reconstructed = reconstructor
            .reconstruct(stream, &item.pyramid, &item.bands)
            .await;
        item.release(&sc.ctx);
        let reconstructed = reconstructed.at(Stage::Reconstructing)?;
        sc.metrics.frames_reconstructed.fetch_add(1, Ordering::AcqRel);
        sc.metrics
            .reconstruct_total_us
            .fetch_add(elapsed_us(start), Ordering::Relaxed);
        sc.frame_done(Stage::Reconstructing);

        let start = Instant::now();
        let frame_index = reconstructed.frame_index;
        let read = read_back(stream, &reconstructed).await;
        reconstructed.release(&sc.ctx);
        let (planes, clamped) = read.at(Stage::ReadingBack)?;

        if frame_index != out.frames.len() as u64 {
            return Err(StageError::new(
                Stage::ReadingBack,
                EngineError::InvariantViolation(format!(
                    "frame {frame_index} arrived, expected frame {}",
                    out.frames.len()
                )),
            ));
        }
        let source = frames.get(out.frames.len()).ok_or_else(|| {
            StageError::new(
                Stage::ReadingBack,
                EngineError::InvariantViolation(format!("no source frame {frame_index}")),
            )
        })?;
        let frame = source.composite_roi(&roi, &planes).at(Stage::ReadingBack)?;
        out.checksum.update(&frame.to_le_bytes());
        out.clamped += clamped;
        out.frames.push(frame);

        sc.metrics.frames_read_back.fetch_add(1, Ordering::AcqRel);
        sc.metrics
            .readback_total_us
            .fetch_add(elapsed_us(start), Ordering::Relaxed);
        sc.frame_done(Stage::ReadingBack);
    }
    debug!(frames = out.frames.len(), "Output stage: EOS");
    Ok(StageExit::Output(out))
}

/// Read the clamped planes and the clamp counter of one frame.
async fn read_back(stream: &Stream, frame: &ReconstructedFrame) -> Result<(Vec<f32>, u64)> {
    let planes = stream.readback(&frame.output);
    let stats = stream.readback(&frame.stats);
    // Await both so nothing stays queued against these buffers.
    let (planes, stats) = (planes.await, stats.await);
    let stats = stats?;
    Ok((planes?, stats.first().copied().unwrap_or(0.0) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_invariants_fail_on_monotonicity_violation() {
        let metrics = PipelineMetrics::new();
        metrics.frames_pyramid.store(1, Ordering::Release);
        metrics.frames_filtered.store(2, Ordering::Release);

        let err = enforce_metrics_invariants(&metrics, true)
            .expect_err("strict invariants must fail on monotonicity violation");
        assert!(matches!(err, EngineError::InvariantViolation(_)));
    }

    #[test]
    fn default_invariants_do_not_fail_release_path() {
        let metrics = PipelineMetrics::new();
        metrics.frames_pyramid.store(1, Ordering::Release);
        metrics.frames_filtered.store(2, Ordering::Release);

        enforce_metrics_invariants(&metrics, false)
            .expect("non-strict mode should preserve release behavior");
    }

    #[test]
    fn timing_averages_per_frame() {
        let metrics = PipelineMetrics::new();
        metrics.frames_filtered.store(4, Ordering::Relaxed);
        metrics.filter_total_us.store(400, Ordering::Relaxed);
        let t = metrics.timing();
        assert_eq!(t.filter_us, 100);
        assert_eq!(t.pyramid_us, 0);
    }

    #[test]
    fn zero_capacity_is_a_configuration_error() {
        let config = PipelineConfig {
            filtered_capacity: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn working_set_covers_filter_state() {
        let layout = PyramidLayout::new(vmag_core::types::Extent::new(64, 64, 1), 2).unwrap();
        let config = PipelineConfig::default();
        assert!(working_set_bytes(&layout, &config) > TemporalFilter::state_bytes(&layout));
    }

    #[test]
    fn out_of_memory_failures_carry_a_hint() {
        let err = EngineError::OutOfMemory {
            budget_bytes: 10,
            current_bytes: 0,
            requested_bytes: 20,
            would_be_bytes: 20,
        };
        let failure = PipelineFailure::new(Stage::TemporalFiltering, &err);
        assert_eq!(failure.kind, ErrorKind::Resource);
        assert_eq!(failure.code, 200);
        let text = failure.to_string();
        assert!(text.starts_with("failed during temporal filtering: "));
        assert!(text.contains("smaller region"));
    }

    #[test]
    fn closed_channel_yields_to_root_cause() {
        let mut slot = None;
        keep_root_cause(
            &mut slot,
            StageError::new(Stage::PyramidBuilding, EngineError::ChannelClosed),
        );
        keep_root_cause(
            &mut slot,
            StageError::new(Stage::ReadingBack, EngineError::Readback("x".into())),
        );
        keep_root_cause(
            &mut slot,
            StageError::new(Stage::TemporalFiltering, EngineError::DeviceLost("y".into())),
        );
        let kept = slot.unwrap();
        assert_eq!(kept.stage, Stage::ReadingBack);
        assert!(matches!(kept.error, EngineError::Readback(_)));
    }

    #[tokio::test]
    async fn panicking_task_is_charged_to_its_own_stage() {
        let mut tasks: StageTasks<u32> = StageTasks::new();
        tasks.spawn(Stage::Reconstructing, async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(3)
        });
        tasks.spawn(Stage::PyramidBuilding, async {
            let levels: Vec<u32> = Vec::new();
            Ok(levels[0])
        });

        let mut panicked = None;
        let mut finished = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(_) => finished += 1,
                Err(err) => panicked = Some(err),
            }
        }
        assert_eq!(finished, 1);
        let err = panicked.expect("panic must surface as a stage error");
        assert_eq!(err.stage, Stage::PyramidBuilding);
        assert!(matches!(
            err.error,
            EngineError::PanicRecovered { stage: "pyramid_building", .. }
        ));
    }
}
