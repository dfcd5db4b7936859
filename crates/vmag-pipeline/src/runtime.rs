//! CLI/runtime bridge helpers.
//!
//! This module keeps device construction and raw frame I/O inside
//! `vmag-pipeline` so callers can depend on pipeline contracts without
//! importing the core device types directly.

use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use vmag_core::context::DeviceContext;
use vmag_core::error::{EngineError, Result};
use vmag_core::host::HostDevice;
use vmag_core::types::{Frame, FrameSequence, PixelData, PixelFormat};

use crate::pipeline::PipelineConfig;

pub struct RuntimeRequest {
    /// Kernel worker threads, `None` = one per core.
    pub threads: Option<usize>,
    /// Live memory limit in MiB (0 = unlimited).
    pub memory_limit_mib: Option<usize>,
    pub pyramid_cap: Option<usize>,
    pub filtered_cap: Option<usize>,
    pub strict_invariants: bool,
}

pub struct RuntimeSetup {
    pub ctx: Arc<DeviceContext>,
    pub config: PipelineConfig,
}

pub fn prepare_runtime(request: &RuntimeRequest) -> Result<RuntimeSetup> {
    let device = match request.threads {
        Some(threads) => HostDevice::with_threads(threads)?,
        None => HostDevice::new()?,
    };
    let ctx = DeviceContext::new(Arc::new(device));
    let info = ctx.device_info();
    info!(device = %info.name, parallelism = info.parallelism, "Device ready");

    let defaults = PipelineConfig::default();
    let config = PipelineConfig {
        pyramid_capacity: request.pyramid_cap.unwrap_or(defaults.pyramid_capacity),
        filtered_capacity: request.filtered_cap.unwrap_or(defaults.filtered_capacity),
        memory_budget_bytes: request
            .memory_limit_mib
            .filter(|mib| *mib > 0)
            .map(|mib| mib * 1024 * 1024),
        strict_invariants: request.strict_invariants,
    };
    config.validate()?;
    Ok(RuntimeSetup { ctx, config })
}

pub fn parse_pixel_format(s: &str) -> Result<PixelFormat> {
    match s.to_ascii_lowercase().as_str() {
        "gray8" | "gray" | "y8" => Ok(PixelFormat::Gray8),
        "rgb8" | "rgb24" | "rgb" => Ok(PixelFormat::Rgb8),
        other => Err(EngineError::InvalidConfig(format!(
            "Unknown raw pixel format '{other}'. Use gray8 or rgb8."
        ))),
    }
}

/// Geometry of a headerless raw video file: 8-bit frames back to back.
#[derive(Clone, Copy, Debug)]
pub struct RawVideoSpec {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub frame_rate: f64,
}

impl RawVideoSpec {
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * self.format.channels()
    }
}

fn file_error(path: &Path, err: impl std::fmt::Display) -> EngineError {
    EngineError::File {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

/// Load every frame of a raw 8-bit video file.
pub fn read_raw_frames(path: &Path, spec: &RawVideoSpec) -> Result<FrameSequence> {
    if spec.format.is_float() {
        return Err(EngineError::Unsupported(format!(
            "raw files carry 8-bit samples, not {}",
            spec.format.as_str()
        )));
    }
    let frame_bytes = spec.frame_bytes();
    if frame_bytes == 0 {
        return Err(EngineError::InvalidSequence(format!(
            "frame size {}x{} is empty",
            spec.width, spec.height
        )));
    }

    let mut data = Vec::new();
    std::fs::File::open(path)
        .and_then(|mut f| f.read_to_end(&mut data))
        .map_err(|err| file_error(path, err))?;
    if data.len() % frame_bytes != 0 {
        return Err(EngineError::InvalidSequence(format!(
            "{} holds {} bytes, not a multiple of the {frame_bytes}-byte frame",
            path.display(),
            data.len()
        )));
    }

    let frames = data
        .chunks_exact(frame_bytes)
        .map(|chunk| Frame::from_u8(spec.width, spec.height, spec.format, chunk.to_vec()))
        .collect::<Result<Vec<_>>>()?;
    info!(
        path = %path.display(),
        frames = frames.len(),
        width = spec.width,
        height = spec.height,
        format = spec.format.as_str(),
        "Raw input loaded"
    );
    FrameSequence::new(frames, spec.frame_rate)
}

/// Write `sequence` as raw 8-bit frames.  Returns the bytes written.
pub fn write_raw_frames(path: &Path, sequence: &FrameSequence) -> Result<u64> {
    let file = std::fs::File::create(path).map_err(|err| file_error(path, err))?;
    let mut out = BufWriter::new(file);
    let mut written = 0u64;
    for frame in sequence.frames() {
        let PixelData::U8(bytes) = frame.data() else {
            return Err(EngineError::Unsupported(format!(
                "raw output needs 8-bit frames, got {}",
                frame.format().as_str()
            )));
        };
        out.write_all(bytes).map_err(|err| file_error(path, err))?;
        written += bytes.len() as u64;
    }
    out.flush().map_err(|err| file_error(path, err))?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("vmag-runtime-{}-{name}", std::process::id()))
    }

    #[test]
    fn raw_frames_survive_a_file_round_trip() {
        let spec = RawVideoSpec {
            width: 3,
            height: 2,
            format: PixelFormat::Rgb8,
            frame_rate: 25.0,
        };
        let frames = (0..4u8)
            .map(|t| Frame::from_u8(3, 2, PixelFormat::Rgb8, vec![t * 10; 18]).unwrap())
            .collect();
        let seq = FrameSequence::new(frames, 25.0).unwrap();
        let path = temp_path("roundtrip.rgb");

        assert_eq!(write_raw_frames(&path, &seq).unwrap(), 72);
        let back = read_raw_frames(&path, &spec).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(back.len(), 4);
        assert_eq!(back.frames()[3].to_le_bytes(), vec![30u8; 18]);
        assert_eq!(back.frame_rate(), 25.0);
    }

    #[test]
    fn truncated_raw_file_is_rejected() {
        let path = temp_path("truncated.gray");
        std::fs::write(&path, [0u8; 10]).unwrap();
        let spec = RawVideoSpec {
            width: 2,
            height: 2,
            format: PixelFormat::Gray8,
            frame_rate: 30.0,
        };
        let err = read_raw_frames(&path, &spec).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, EngineError::InvalidSequence(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let spec = RawVideoSpec {
            width: 2,
            height: 2,
            format: PixelFormat::Gray8,
            frame_rate: 30.0,
        };
        let err = read_raw_frames(Path::new("/nonexistent/vmag.raw"), &spec).unwrap_err();
        assert_eq!(err.kind(), vmag_core::ErrorKind::Io);
        assert_eq!(err.error_code(), 302);
    }

    #[test]
    fn pixel_format_names() {
        assert_eq!(parse_pixel_format("GRAY8").unwrap(), PixelFormat::Gray8);
        assert_eq!(parse_pixel_format("rgb24").unwrap(), PixelFormat::Rgb8);
        assert!(parse_pixel_format("yuv420p").unwrap_err().is_configuration());
    }

    #[test]
    fn zero_memory_limit_means_unlimited() {
        let setup = prepare_runtime(&RuntimeRequest {
            threads: Some(1),
            memory_limit_mib: Some(0),
            pyramid_cap: None,
            filtered_cap: Some(3),
            strict_invariants: true,
        })
        .unwrap();
        assert_eq!(setup.config.memory_budget_bytes, None);
        assert_eq!(setup.config.filtered_capacity, 3);
        assert_eq!(setup.config.pyramid_capacity, 2);
    }
}
