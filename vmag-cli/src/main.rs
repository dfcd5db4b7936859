//! vmag CLI entrypoint.
//!
//! ```bash
//! vmag magnify --input chest.gray --output out.gray --width 320 --height 240 --roi 96,60,128,96
//! vmag magnify -i in.rgb -o out.rgb --width 64 --height 64 --format rgb8 --config job.json --json
//! vmag synth --json --progress jsonl
//! vmag validate --config job.json --width 320 --height 240 --json
//! ```

use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Instant;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::{info, warn};

use vmag_core::error::{EngineError, ErrorKind};
use vmag_core::types::{FrameSequence, Roi};
use vmag_pipeline::job::MagnifyJob;
use vmag_pipeline::runtime::{
    RawVideoSpec, RuntimeRequest, parse_pixel_format, prepare_runtime, read_raw_frames,
    write_raw_frames,
};
use vmag_pipeline::synthetic::OscillationScene;
use vmag_pipeline::{
    FrequencyBand, MagnificationPipeline, MagnifiedOutput, PipelineFailure, ProcessingParameters,
    ProgressSink, ProgressUpdate, RunOutcome,
};

#[derive(Parser, Debug)]
#[command(
    name = "vmag",
    version,
    about = "Magnify subtle periodic motion in video",
    arg_required_else_help = true,
    after_help = "Examples:\n  vmag synth --json\n  vmag magnify -i in.gray -o out.gray --width 320 --height 240 --roi 96,60,128,96\n  vmag magnify -i in.rgb -o out.rgb --width 64 --height 64 --format rgb8 --gain 20 --progress jsonl\n  vmag validate --config job.json --width 320 --height 240 --json"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Magnify a raw 8-bit video file (frames back to back, no header).
    Magnify(MagnifyArgs),
    /// Magnify a synthetic single-pixel oscillation and measure the gain.
    Synth(SynthArgs),
    /// Check a job file against a frame geometry without processing.
    Validate(ValidateArgs),
}

#[derive(Args, Debug, Clone)]
struct ParamArgs {
    /// JSON job file; the flags below override its values.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Amplification gain.
    #[arg(short = 'g', long = "gain")]
    gain: Option<f64>,

    /// Lower edge of the magnified band in Hz.
    #[arg(long = "f-min")]
    f_min: Option<f64>,

    /// Upper edge of the magnified band in Hz.
    #[arg(long = "f-max")]
    f_max: Option<f64>,

    /// Number of residual pyramid levels.
    #[arg(long = "depth")]
    depth: Option<u32>,

    /// Region of interest as x,y,width,height (default: whole frame).
    #[arg(long = "roi", value_parser = parse_roi)]
    roi: Option<Roi>,
}

impl ParamArgs {
    fn resolve_job(&self) -> Result<MagnifyJob, EngineError> {
        let mut job = match &self.config {
            Some(path) => MagnifyJob::from_json_file(path)?,
            None => MagnifyJob::default(),
        };
        if let Some(gain) = self.gain {
            job.params.gain = gain;
        }
        if let Some(f_min) = self.f_min {
            job.params.band.f_min_hz = f_min;
        }
        if let Some(f_max) = self.f_max {
            job.params.band.f_max_hz = f_max;
        }
        if let Some(depth) = self.depth {
            job.params.pyramid_depth = depth;
        }
        if self.roi.is_some() {
            job.roi = self.roi;
        }
        Ok(job)
    }
}

#[derive(Args, Debug, Clone)]
struct EngineArgs {
    /// Kernel worker threads (default: one per core).
    #[arg(long = "threads")]
    threads: Option<usize>,

    /// Device memory limit in MiB (0 = unlimited).
    #[arg(long = "memory-limit-mib")]
    memory_limit_mib: Option<usize>,

    /// Channel capacity: pyramid -> temporal filter.
    #[arg(long = "pyramid-cap")]
    pyramid_cap: Option<usize>,

    /// Channel capacity: temporal filter -> reconstruction.
    #[arg(long = "filtered-cap")]
    filtered_cap: Option<usize>,

    /// Fail the run if stage frame counts break their ordering.
    #[arg(long = "strict-invariants", default_value_t = false)]
    strict_invariants: bool,

    /// Progress output mode (stderr only).
    #[arg(long = "progress", value_enum, default_value_t = ProgressArg::Auto)]
    progress: ProgressArg,

    /// Emit a single JSON summary on stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

impl EngineArgs {
    fn runtime_request(&self) -> RuntimeRequest {
        RuntimeRequest {
            threads: self.threads,
            memory_limit_mib: self.memory_limit_mib,
            pyramid_cap: self.pyramid_cap,
            filtered_cap: self.filtered_cap,
            strict_invariants: self.strict_invariants,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct MagnifyArgs {
    /// Raw input file.
    #[arg(short = 'i', long = "input")]
    input: PathBuf,

    /// Raw output file (same geometry and format as the input).
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// Frame width in pixels.
    #[arg(long = "width")]
    width: u32,

    /// Frame height in pixels.
    #[arg(long = "height")]
    height: u32,

    /// Raw pixel format: gray8 or rgb8.
    #[arg(long = "format", default_value = "gray8")]
    format: String,

    /// Input frame rate in frames per second.
    #[arg(long = "fps", default_value_t = 30.0)]
    fps: f64,

    #[command(flatten)]
    params: ParamArgs,

    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Args, Debug, Clone)]
struct SynthArgs {
    /// Frame width and height in pixels.
    #[arg(long = "size", default_value_t = 64)]
    size: u32,

    /// Number of frames to render.
    #[arg(long = "frames", default_value_t = 90)]
    frames: usize,

    #[arg(long = "fps", default_value_t = 30.0)]
    fps: f64,

    /// Oscillation amplitude around mid-gray.
    #[arg(long = "amplitude", default_value_t = 0.1)]
    amplitude: f64,

    /// Oscillation frequency in Hz.
    #[arg(long = "frequency", default_value_t = 0.3)]
    frequency: f64,

    /// Frames skipped before fitting, while the filter settles.
    #[arg(long = "settle", default_value_t = 30)]
    settle: usize,

    #[arg(long = "gain", default_value_t = 5.0)]
    gain: f64,

    #[arg(long = "f-min", default_value_t = 0.1)]
    f_min: f64,

    #[arg(long = "f-max", default_value_t = 0.5)]
    f_max: f64,

    #[arg(long = "depth", default_value_t = 2)]
    depth: u32,

    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Args, Debug, Clone)]
struct ValidateArgs {
    /// JSON job file.
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Frame width to check the region and depth against.
    #[arg(long = "width", requires = "height")]
    width: Option<u32>,

    /// Frame height to check the region and depth against.
    #[arg(long = "height", requires = "width")]
    height: Option<u32>,

    /// Raw pixel format: gray8 or rgb8.
    #[arg(long = "format", default_value = "gray8")]
    format: String,

    #[arg(long = "fps", default_value_t = 30.0)]
    fps: f64,

    /// Emit a JSON summary on stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProgressArg {
    Auto,
    Off,
    Human,
    Jsonl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgressMode {
    Off,
    Human,
    Jsonl,
}

#[derive(Debug, thiserror::Error)]
enum CommandError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Failed(PipelineFailure),
    #[error("run cancelled")]
    Cancelled,
    #[error(
        "measured amplitude {measured:.4} is {:.1}% off the expected {expected:.4}",
        .relative_error * 100.0
    )]
    OutOfTolerance {
        measured: f64,
        expected: f64,
        relative_error: f64,
    },
}

impl CommandError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Engine(err) => err.error_code() as i32,
            Self::Failed(failure) => failure.code as i32,
            Self::Cancelled => EXIT_CANCELLED,
            Self::OutOfTolerance { .. } => EXIT_OUT_OF_TOLERANCE,
        }
    }

    fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Engine(err) => Some(err.kind()),
            Self::Failed(failure) => Some(failure.kind),
            Self::Cancelled | Self::OutOfTolerance { .. } => None,
        }
    }

    /// The command already printed its full JSON document.
    fn reported_on_stdout(&self) -> bool {
        matches!(self, Self::OutOfTolerance { .. })
    }
}

const JSON_SCHEMA_VERSION: u32 = 1;
/// Conventional exit status for SIGINT.
const EXIT_CANCELLED: i32 = 130;
/// `synth` ran but the measured amplitude missed the expected one.
const EXIT_OUT_OF_TOLERANCE: i32 = 1;
/// Relative error `synth` accepts between measured and expected amplitude.
const SYNTH_TOLERANCE: f64 = 0.15;

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let json_error_command = match &cli.command {
        Commands::Magnify(args) if args.engine.json => Some("magnify"),
        Commands::Synth(args) if args.engine.json => Some("synth"),
        Commands::Validate(args) if args.json => Some("validate"),
        _ => None,
    };

    let result = match cli.command {
        Commands::Magnify(args) => build_runtime().and_then(|rt| rt.block_on(run_magnify(args))),
        Commands::Synth(args) => build_runtime().and_then(|rt| rt.block_on(run_synth(args))),
        Commands::Validate(args) => run_validate(args),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            if err.reported_on_stdout() {
                tracing::error!(error = %err, "Command failed");
            } else if let Some(command) = json_error_command {
                println!("{}", command_error_json(command, &err));
            } else if matches!(err, CommandError::Cancelled) {
                warn!("Run cancelled");
            } else {
                tracing::error!(error = %err, code = err.exit_code(), "Command failed");
            }
            std::process::exit(err.exit_code());
        }
    }
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

fn build_runtime() -> Result<tokio::runtime::Runtime, CommandError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            CommandError::Engine(EngineError::DeviceLost(format!(
                "failed to build tokio runtime: {err}"
            )))
        })
}

fn parse_roi(raw: &str) -> Result<Roi, String> {
    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    let [x, y, w, h] = parts.as_slice() else {
        return Err(format!("expected x,y,width,height, got '{raw}'"));
    };
    let num = |s: &str| {
        s.parse::<u32>()
            .map_err(|err| format!("invalid ROI component '{s}': {err}"))
    };
    Ok(Roi::new(num(*x)?, num(*y)?, num(*w)?, num(*h)?))
}

// ─── Commands ───────────────────────────────────────────────────────────────

async fn run_magnify(args: MagnifyArgs) -> Result<(), CommandError> {
    let job = args.params.resolve_job()?;
    let format = parse_pixel_format(&args.format)?;
    job.validate(args.width, args.height, format.channels(), args.fps)?;

    let spec = RawVideoSpec {
        width: args.width,
        height: args.height,
        format,
        frame_rate: args.fps,
    };
    let input = read_raw_frames(&args.input, &spec)?;
    let roi = job.roi.unwrap_or(Roi::full(args.width, args.height));

    let wall_start = Instant::now();
    let output = run_pipeline("magnify", &args.engine, &input, roi, &job.params).await?;
    let written = write_raw_frames(&args.output, &output.sequence)?;
    let elapsed = wall_start.elapsed();

    info!(
        output = %args.output.display(),
        bytes = written,
        elapsed_s = format!("{:.2}", elapsed.as_secs_f64()),
        "Magnify complete"
    );
    if args.engine.json {
        println!(
            "{}",
            json!({
                "schema_version": JSON_SCHEMA_VERSION,
                "command": "magnify",
                "ok": true,
                "input": args.input.display().to_string(),
                "output": args.output.display().to_string(),
                "width": args.width,
                "height": args.height,
                "format": format.as_str(),
                "elapsed_ms": elapsed.as_secs_f64() * 1000.0,
                "report": output.report,
            })
        );
    } else {
        println!(
            "magnify: ok output={} frames={} clamped={} checksum={} elapsed_s={:.3}",
            args.output.display(),
            output.report.frames,
            output.report.clamped_samples,
            output.report.output_checksum,
            elapsed.as_secs_f64()
        );
    }
    Ok(())
}

async fn run_synth(args: SynthArgs) -> Result<(), CommandError> {
    let scene = OscillationScene {
        width: args.size,
        height: args.size,
        frames: args.frames,
        frame_rate: args.fps,
        pixel: (args.size / 2, args.size / 2),
        amplitude: args.amplitude,
        frequency_hz: args.frequency,
        ..OscillationScene::default()
    };
    let params = ProcessingParameters {
        gain: args.gain,
        band: FrequencyBand {
            f_min_hz: args.f_min,
            f_max_hz: args.f_max,
        },
        pyramid_depth: args.depth,
    };
    let expected = scene.expected_amplitude(&params)?;
    let input = scene.render()?;
    let roi = Roi::full(scene.width, scene.height);

    let output = run_pipeline("synth", &args.engine, &input, roi, &params).await?;
    let measured = scene.measure(&input, &output.sequence, args.settle)?;
    let relative_error = (measured - expected).abs() / expected;
    let within_tolerance = relative_error <= SYNTH_TOLERANCE;

    if args.engine.json {
        println!(
            "{}",
            json!({
                "schema_version": JSON_SCHEMA_VERSION,
                "command": "synth",
                "ok": within_tolerance,
                "scene": scene,
                "params": params,
                "expected_amplitude": expected,
                "measured_amplitude": measured,
                "relative_error": relative_error,
                "within_tolerance": within_tolerance,
                "report": output.report,
            })
        );
    } else {
        println!(
            "synth: expected={expected:.4} measured={measured:.4} error={:.1}% within_tolerance={within_tolerance} clamped={}",
            relative_error * 100.0,
            output.report.clamped_samples
        );
    }
    if within_tolerance {
        Ok(())
    } else {
        Err(CommandError::OutOfTolerance {
            measured,
            expected,
            relative_error,
        })
    }
}

fn run_validate(args: ValidateArgs) -> Result<(), CommandError> {
    let job = MagnifyJob::from_json_file(&args.config)?;
    let coefficients = job.params.validate(args.fps)?;
    let geometry = match (args.width, args.height) {
        (Some(width), Some(height)) => {
            let format = parse_pixel_format(&args.format)?;
            job.validate(width, height, format.channels(), args.fps)?;
            Some((width, height))
        }
        _ => None,
    };
    info!(config = %args.config.display(), "Job file valid");

    if args.json {
        println!(
            "{}",
            json!({
                "schema_version": JSON_SCHEMA_VERSION,
                "command": "validate",
                "ok": true,
                "config": args.config.display().to_string(),
                "geometry_checked": geometry.is_some(),
                "roi": job.roi,
                "params": job.params,
                "alpha_low": coefficients.alpha_low,
                "alpha_high": coefficients.alpha_high,
            })
        );
    } else {
        let roi = job
            .roi
            .map(|r| r.to_string())
            .unwrap_or_else(|| "full".to_string());
        println!(
            "validate: ok config={} roi={} gain={} band={}..{}Hz depth={} geometry_checked={}",
            args.config.display(),
            roi,
            job.params.gain,
            job.params.band.f_min_hz,
            job.params.band.f_max_hz,
            job.params.pyramid_depth,
            geometry.is_some()
        );
    }
    Ok(())
}

/// Run one sequence with Ctrl-C wired to the pipeline's cancel token.
async fn run_pipeline(
    command: &'static str,
    engine: &EngineArgs,
    input: &FrameSequence,
    roi: Roi,
    params: &ProcessingParameters,
) -> Result<MagnifiedOutput, CommandError> {
    let setup = prepare_runtime(&engine.runtime_request())?;
    let pipeline = MagnificationPipeline::new(setup.ctx, setup.config);
    let sink = StderrProgress {
        command,
        mode: resolve_progress_mode(engine.progress),
        start: Instant::now(),
    };

    let token = pipeline.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            token.cancel();
        }
    });
    let outcome = pipeline.run(input, roi, params, &sink).await;
    interrupt.abort();

    match outcome {
        RunOutcome::Success(output) => Ok(output),
        RunOutcome::Cancelled => Err(CommandError::Cancelled),
        RunOutcome::Failed(failure) => Err(CommandError::Failed(failure)),
    }
}

// ─── Progress ───────────────────────────────────────────────────────────────

fn resolve_progress_mode(progress: ProgressArg) -> ProgressMode {
    match progress {
        ProgressArg::Auto => {
            if std::io::stderr().is_terminal() {
                ProgressMode::Human
            } else {
                ProgressMode::Off
            }
        }
        ProgressArg::Off => ProgressMode::Off,
        ProgressArg::Human => ProgressMode::Human,
        ProgressArg::Jsonl => ProgressMode::Jsonl,
    }
}

struct StderrProgress {
    command: &'static str,
    mode: ProgressMode,
    start: Instant,
}

impl ProgressSink for StderrProgress {
    fn on_progress(&self, update: &ProgressUpdate) {
        // One line per finished frame plus the lifecycle edges.
        if !matches!(
            update.stage,
            "initializing" | "reading_back" | "complete" | "cancelled"
        ) {
            return;
        }
        let final_line = matches!(update.stage, "complete" | "cancelled");
        // Progress contract: progress events are written to stderr only.
        match self.mode {
            ProgressMode::Off => {}
            ProgressMode::Human => {
                eprintln!(
                    "progress: command={} elapsed_s={:.3} fraction={:.3} frames={}/{} stage={} final={}",
                    self.command,
                    self.start.elapsed().as_secs_f64(),
                    update.fraction,
                    update.frames_completed,
                    update.total_frames,
                    update.stage,
                    final_line
                );
            }
            ProgressMode::Jsonl => {
                eprintln!(
                    "{}",
                    json!({
                        "schema_version": JSON_SCHEMA_VERSION,
                        "type": "progress",
                        "command": self.command,
                        "elapsed_ms": self.start.elapsed().as_millis() as u64,
                        "fraction": update.fraction,
                        "stage": update.stage,
                        "frames": {
                            "completed": update.frames_completed,
                            "total": update.total_frames,
                        },
                        "final": final_line,
                    })
                );
            }
        }
    }
}

fn command_error_json(command: &str, err: &CommandError) -> String {
    let mut doc = json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": false,
        "error": err.to_string(),
        "code": err.exit_code(),
    });
    if let Some(kind) = err.kind() {
        doc["kind"] = json!(kind.as_str());
    }
    match err {
        CommandError::Failed(failure) => doc["stage"] = json!(failure.stage.as_str()),
        CommandError::Cancelled => doc["cancelled"] = json!(true),
        CommandError::Engine(_) | CommandError::OutOfTolerance { .. } => {}
    }
    doc.to_string()
}
