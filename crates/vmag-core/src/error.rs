//! Typed error hierarchy for the engine.
//!
//! Uses `thiserror` for library-grade errors.  Every variant belongs to one
//! [`ErrorKind`] of the caller-visible taxonomy and maps to a stable integer
//! code via [`EngineError::error_code`] for structured telemetry without
//! string parsing.

use serde::{Deserialize, Serialize};

use crate::types::PixelFormat;

/// Caller-visible failure category.
///
/// Cancellation is deliberately absent: it is a terminal outcome, not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid ROI, band, gain, depth or input sequence.  Raised before any
    /// device allocation.
    Configuration,
    /// Budget exceeded, device lost, unsupported capability or a broken
    /// internal contract.
    Resource,
    /// Upload or readback failure.
    Io,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Resource => "resource",
            Self::Io => "io",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All errors originating from the magnification engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ── Configuration ────────────────────────────────────────────────
    #[error("Invalid region of interest: {0}")]
    InvalidRoi(String),

    #[error(
        "Invalid frequency band [{f_min_hz}, {f_max_hz}] Hz: require 0 < f_min < f_max < {nyquist_hz} Hz (Nyquist)"
    )]
    InvalidFrequencyBand {
        f_min_hz: f64,
        f_max_hz: f64,
        nyquist_hz: f64,
    },

    #[error("Invalid gain {0}: gain must be positive and within f32 range")]
    InvalidGain(f64),

    #[error("Pyramid depth {depth} is too deep for a {width}x{height} region (coarsest level below 1x1)")]
    PyramidTooDeep { depth: u32, width: u32, height: u32 },

    #[error("Invalid frame sequence: {0}")]
    InvalidSequence(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Resource / device ────────────────────────────────────────────
    #[error(
        "Device memory budget exceeded: budget {budget_bytes} B, in use {current_bytes} B, requested {requested_bytes} B (would be {would_be_bytes} B)"
    )]
    OutOfMemory {
        budget_bytes: usize,
        current_bytes: usize,
        requested_bytes: usize,
        would_be_bytes: usize,
    },

    #[error("Device lost: {0}")]
    DeviceLost(String),

    #[error("Unsupported device capability: {0}")]
    Unsupported(String),

    #[error("Unknown device buffer #{0} (never allocated or already released)")]
    UnknownBuffer(u64),

    #[error("Kernel `{kernel}` failed: {message}")]
    KernelFailed {
        kernel: &'static str,
        message: String,
    },

    // ── IO ───────────────────────────────────────────────────────────
    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Readback failed: {0}")]
    Readback(String),

    #[error("File I/O failed for {path}: {message}")]
    File { path: String, message: String },

    // ── Pipeline / contracts ─────────────────────────────────────────
    #[error("Pipeline channel closed unexpectedly")]
    ChannelClosed,

    #[error("Pixel format mismatch: expected {expected:?}, got {actual:?}")]
    FormatMismatch {
        expected: PixelFormat,
        actual: PixelFormat,
    },

    #[error("Buffer size mismatch: need {need} elements, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Panic recovered in {stage}: {message}")]
    PanicRecovered {
        stage: &'static str,
        message: String,
    },
}

impl EngineError {
    /// Taxonomy bucket this error is reported under.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRoi(_)
            | Self::InvalidFrequencyBand { .. }
            | Self::InvalidGain(_)
            | Self::PyramidTooDeep { .. }
            | Self::InvalidSequence(_)
            | Self::InvalidConfig(_) => ErrorKind::Configuration,
            Self::Upload(_) | Self::Readback(_) | Self::File { .. } => ErrorKind::Io,
            Self::OutOfMemory { .. }
            | Self::DeviceLost(_)
            | Self::Unsupported(_)
            | Self::UnknownBuffer(_)
            | Self::KernelFailed { .. }
            | Self::ChannelClosed
            | Self::FormatMismatch { .. }
            | Self::BufferTooSmall { .. }
            | Self::InvariantViolation(_)
            | Self::PanicRecovered { .. } => ErrorKind::Resource,
        }
    }

    /// Stable integer error code for structured telemetry.
    ///
    /// Codes are grouped by category:
    /// - 1xx: configuration
    /// - 2xx: resource/device
    /// - 3xx: io
    /// - 4xx: pipeline contracts
    pub fn error_code(&self) -> u32 {
        match self {
            Self::InvalidRoi(_) => 100,
            Self::InvalidFrequencyBand { .. } => 101,
            Self::InvalidGain(_) => 102,
            Self::PyramidTooDeep { .. } => 103,
            Self::InvalidSequence(_) => 104,
            Self::InvalidConfig(_) => 105,
            Self::OutOfMemory { .. } => 200,
            Self::DeviceLost(_) => 201,
            Self::Unsupported(_) => 202,
            Self::UnknownBuffer(_) => 203,
            Self::KernelFailed { .. } => 204,
            Self::Upload(_) => 300,
            Self::Readback(_) => 301,
            Self::File { .. } => 302,
            Self::ChannelClosed => 400,
            Self::FormatMismatch { .. } => 401,
            Self::BufferTooSmall { .. } => 402,
            Self::InvariantViolation(_) => 403,
            Self::PanicRecovered { .. } => 404,
        }
    }

    /// Whether the error was caught by configuration validation, i.e. before
    /// any device resource existed.
    pub fn is_configuration(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }
}

/// Convenience alias used throughout the engine crates.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_classified_before_resource_errors() {
        assert_eq!(EngineError::InvalidGain(0.0).kind(), ErrorKind::Configuration);
        assert_eq!(
            EngineError::PyramidTooDeep {
                depth: 9,
                width: 16,
                height: 16
            }
            .kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            EngineError::OutOfMemory {
                budget_bytes: 1,
                current_bytes: 0,
                requested_bytes: 2,
                would_be_bytes: 2,
            }
            .kind(),
            ErrorKind::Resource
        );
        assert_eq!(EngineError::Readback("x".into()).kind(), ErrorKind::Io);
    }

    #[test]
    fn error_codes_follow_category_ranges() {
        assert_eq!(EngineError::InvalidRoi("x".into()).error_code() / 100, 1);
        assert_eq!(EngineError::DeviceLost("x".into()).error_code() / 100, 2);
        assert_eq!(EngineError::Upload("x".into()).error_code() / 100, 3);
        assert_eq!(EngineError::ChannelClosed.error_code() / 100, 4);
    }

    #[test]
    fn band_error_message_names_nyquist() {
        let err = EngineError::InvalidFrequencyBand {
            f_min_hz: 1.0,
            f_max_hz: 20.0,
            nyquist_hz: 15.0,
        };
        assert!(err.to_string().contains("Nyquist"));
    }
}
