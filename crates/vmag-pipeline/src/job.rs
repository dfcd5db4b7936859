//! Processing parameters, job files and run reports.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use vmag_core::error::{EngineError, Result};
use vmag_core::types::{Extent, Roi};
use vmag_kernels::{PyramidLayout, TemporalCoefficients};

pub const JOB_SCHEMA_VERSION: u32 = 1;
pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// Gains outside this range are accepted but logged.
pub const RECOMMENDED_GAIN: (f64, f64) = (1.0, 100.0);

/// Kernels amplify in f32; larger gains would overflow to infinity.
pub const MAX_GAIN: f64 = f32::MAX as f64;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrequencyBand {
    pub f_min_hz: f64,
    pub f_max_hz: f64,
}

impl Default for FrequencyBand {
    fn default() -> Self {
        Self {
            f_min_hz: 0.1,
            f_max_hz: 0.5,
        }
    }
}

/// Per-run magnification settings.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingParameters {
    pub gain: f64,
    pub band: FrequencyBand,
    pub pyramid_depth: u32,
}

impl Default for ProcessingParameters {
    fn default() -> Self {
        Self {
            gain: 10.0,
            band: FrequencyBand::default(),
            pyramid_depth: 3,
        }
    }
}

impl ProcessingParameters {
    /// Check gain and band against `frame_rate` and derive the filter
    /// coefficients.
    pub fn validate(&self, frame_rate: f64) -> Result<TemporalCoefficients> {
        if !(self.gain > 0.0 && self.gain <= MAX_GAIN) {
            return Err(EngineError::InvalidGain(self.gain));
        }
        let (lo, hi) = RECOMMENDED_GAIN;
        if self.gain < lo || self.gain > hi {
            warn!(gain = self.gain, lo, hi, "gain outside the recommended range");
        }
        TemporalCoefficients::new(self.band.f_min_hz, self.band.f_max_hz, frame_rate)
    }

    /// Pyramid layout for a region of `roi_extent`.
    pub fn layout(&self, roi_extent: Extent) -> Result<PyramidLayout> {
        PyramidLayout::new(roi_extent, self.pyramid_depth)
    }
}

/// A saved magnification request: region plus parameters.
///
/// `roi = None` selects the whole frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MagnifyJob {
    pub schema_version: u32,
    #[serde(default)]
    pub roi: Option<Roi>,
    #[serde(default)]
    pub params: ProcessingParameters,
}

impl Default for MagnifyJob {
    fn default() -> Self {
        Self {
            schema_version: JOB_SCHEMA_VERSION,
            roi: None,
            params: ProcessingParameters::default(),
        }
    }
}

impl MagnifyJob {
    pub fn from_json_str(data: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(data)
            .map_err(|err| EngineError::InvalidConfig(format!("Invalid job JSON: {err}")))?;

        let Some(version_value) = value.get("schema_version") else {
            return Err(EngineError::InvalidConfig(format!(
                "Job schema mismatch: expected {JOB_SCHEMA_VERSION}, got missing"
            )));
        };
        let Some(version) = version_value.as_u64() else {
            return Err(EngineError::InvalidConfig(format!(
                "Job schema mismatch: expected {JOB_SCHEMA_VERSION}, got non-integer"
            )));
        };
        if version != JOB_SCHEMA_VERSION as u64 {
            return Err(EngineError::InvalidConfig(format!(
                "Job schema mismatch: expected {JOB_SCHEMA_VERSION}, got {version}"
            )));
        }

        serde_json::from_value(value)
            .map_err(|err| EngineError::InvalidConfig(format!("Invalid job JSON: {err}")))
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|err| {
            EngineError::InvalidConfig(format!(
                "Failed to read job file {}: {err}",
                path.display()
            ))
        })?;
        Self::from_json_str(&data)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| EngineError::InvalidConfig(format!("Failed to encode job: {err}")))
    }

    /// Validate against a `width x height` sequence at `frame_rate`.
    pub fn validate(&self, width: u32, height: u32, channels: usize, frame_rate: f64) -> Result<()> {
        let roi = self.roi.unwrap_or(Roi::full(width, height));
        roi.validate(width, height)?;
        self.params.validate(frame_rate)?;
        self.params.layout(roi.extent(channels))?;
        Ok(())
    }
}

// ─── Reports ────────────────────────────────────────────────────────────────

/// Average per-frame wall-clock time of each stage.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimingReport {
    pub pyramid_us: u64,
    pub filter_us: u64,
    pub reconstruct_us: u64,
    pub readback_us: u64,
}

/// Summary of a completed run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub schema_version: u32,
    pub frames: u64,
    pub roi: Roi,
    pub gain: f64,
    pub pyramid_depth: u32,
    pub alpha_low: f64,
    pub alpha_high: f64,
    pub stage_timing: StageTimingReport,
    /// Output samples pulled back into `[0, 1]` by the final clamp.
    pub clamped_samples: u64,
    pub peak_memory_bytes: usize,
    pub pool_hit_rate_pct: Option<f64>,
    /// FNV-1a over every output frame, in order.
    pub output_checksum: String,
}

/// Incremental 64-bit FNV-1a.
#[derive(Clone, Copy, Debug)]
pub struct Fnv1a(u64);

impl Default for Fnv1a {
    fn default() -> Self {
        Self(0xcbf29ce484222325)
    }
}

impl Fnv1a {
    pub fn update(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 ^= *byte as u64;
            self.0 = self.0.wrapping_mul(0x100000001b3);
        }
    }

    pub fn finish_hex(&self) -> String {
        format!("{:016x}", self.0)
    }
}
