//! Frame, sequence and region types shared by every engine stage.
//!
//! Frames are immutable, reference-counted rasters.  The engine only ever
//! reads them; magnified output is composited onto fresh copies.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Interleaved pixel layouts accepted by the engine.
///
/// `*8` formats map `0..=255` onto `[0, 1]`; `*F32` formats are already
/// nominally in `[0, 1]` and are clamped on entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Gray8,
    Rgb8,
    GrayF32,
    RgbF32,
}

impl PixelFormat {
    #[inline]
    pub const fn channels(self) -> usize {
        match self {
            Self::Gray8 | Self::GrayF32 => 1,
            Self::Rgb8 | Self::RgbF32 => 3,
        }
    }

    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::GrayF32 | Self::RgbF32)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gray8 => "gray8",
            Self::Rgb8 => "rgb8",
            Self::GrayF32 => "gray_f32",
            Self::RgbF32 => "rgb_f32",
        }
    }
}

/// Backing storage of a [`Frame`].
#[derive(Clone, Debug)]
pub enum PixelData {
    U8(Arc<[u8]>),
    F32(Arc<[f32]>),
}

impl PixelData {
    pub fn len(&self) -> usize {
        match self {
            Self::U8(d) => d.len(),
            Self::F32(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Immutable raster buffer with fixed dimensions and format.
#[derive(Clone, Debug)]
pub struct Frame {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: PixelData,
}

impl Frame {
    /// Wrap 8-bit interleaved samples.  `format` must be `Gray8` or `Rgb8`.
    pub fn from_u8(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Result<Self> {
        if format.is_float() {
            return Err(EngineError::FormatMismatch {
                expected: PixelFormat::Gray8,
                actual: format,
            });
        }
        Self::check_len(width, height, format, data.len())?;
        Ok(Self {
            width,
            height,
            format,
            data: PixelData::U8(data.into()),
        })
    }

    /// Wrap float interleaved samples.  `format` must be `GrayF32` or `RgbF32`.
    pub fn from_f32(width: u32, height: u32, format: PixelFormat, data: Vec<f32>) -> Result<Self> {
        if !format.is_float() {
            return Err(EngineError::FormatMismatch {
                expected: PixelFormat::GrayF32,
                actual: format,
            });
        }
        Self::check_len(width, height, format, data.len())?;
        Ok(Self {
            width,
            height,
            format,
            data: PixelData::F32(data.into()),
        })
    }

    /// Single-channel float frame.
    pub fn gray_f32(width: u32, height: u32, data: Vec<f32>) -> Result<Self> {
        Self::from_f32(width, height, PixelFormat::GrayF32, data)
    }

    fn check_len(width: u32, height: u32, format: PixelFormat, have: usize) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(EngineError::InvalidSequence(format!(
                "frame dimensions must be non-zero, got {width}x{height}"
            )));
        }
        let need = width as usize * height as usize * format.channels();
        if have != need {
            return Err(EngineError::BufferTooSmall { need, have });
        }
        Ok(())
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    #[inline]
    pub fn data(&self) -> &PixelData {
        &self.data
    }

    /// Normalised sample at `(x, y)` for channel `c`, without clamping.
    #[inline]
    pub fn sample(&self, x: u32, y: u32, c: usize) -> f32 {
        let idx = (y as usize * self.width as usize + x as usize) * self.format.channels() + c;
        match &self.data {
            PixelData::U8(d) => d[idx] as f32 / 255.0,
            PixelData::F32(d) => d[idx],
        }
    }

    /// Raw little-endian bytes of the samples, used for checksumming.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match &self.data {
            PixelData::U8(d) => d.to_vec(),
            PixelData::F32(d) => d.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    /// Crop `roi` into planar, normalised samples clamped to `[0, 1]`.
    ///
    /// The result holds `channels` planes of `roi.width * roi.height`
    /// samples each, back to back.  Non-finite inputs map to `0`.
    pub fn roi_planes(&self, roi: &Roi) -> Vec<f32> {
        let channels = self.format.channels();
        let (rw, rh) = (roi.width as usize, roi.height as usize);
        let mut planes = vec![0.0f32; channels * rw * rh];
        for c in 0..channels {
            let plane = &mut planes[c * rw * rh..(c + 1) * rw * rh];
            for y in 0..rh {
                for x in 0..rw {
                    let v = self.sample(roi.x + x as u32, roi.y + y as u32, c);
                    plane[y * rw + x] = clamp_unit(v);
                }
            }
        }
        planes
    }

    /// Copy of this frame with the ROI replaced by `planes` (planar layout as
    /// produced by [`Frame::roi_planes`]).  Pixels outside the ROI are copied
    /// unchanged.
    pub fn composite_roi(&self, roi: &Roi, planes: &[f32]) -> Result<Frame> {
        let channels = self.format.channels();
        let (rw, rh) = (roi.width as usize, roi.height as usize);
        let need = channels * rw * rh;
        if planes.len() != need {
            return Err(EngineError::BufferTooSmall {
                need,
                have: planes.len(),
            });
        }
        let stride = self.width as usize * channels;
        let dst_index = |x: usize, y: usize, c: usize| {
            (roi.y as usize + y) * stride + (roi.x as usize + x) * channels + c
        };

        let data = match &self.data {
            PixelData::U8(src) => {
                let mut out = src.to_vec();
                for c in 0..channels {
                    for y in 0..rh {
                        for x in 0..rw {
                            let v = clamp_unit(planes[c * rw * rh + y * rw + x]);
                            out[dst_index(x, y, c)] = (v * 255.0).round() as u8;
                        }
                    }
                }
                PixelData::U8(out.into())
            }
            PixelData::F32(src) => {
                let mut out = src.to_vec();
                for c in 0..channels {
                    for y in 0..rh {
                        for x in 0..rw {
                            out[dst_index(x, y, c)] = planes[c * rw * rh + y * rw + x];
                        }
                    }
                }
                PixelData::F32(out.into())
            }
        };

        Ok(Frame {
            width: self.width,
            height: self.height,
            format: self.format,
            data,
        })
    }
}

#[inline]
fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

/// Ordered, fixed-length collection of frames sharing dimensions and format.
#[derive(Clone, Debug)]
pub struct FrameSequence {
    frames: Vec<Frame>,
    frame_rate: f64,
}

impl FrameSequence {
    pub fn new(frames: Vec<Frame>, frame_rate: f64) -> Result<Self> {
        if !(frame_rate.is_finite() && frame_rate > 0.0) {
            return Err(EngineError::InvalidSequence(format!(
                "frame rate must be a finite positive number, got {frame_rate}"
            )));
        }
        let Some(first) = frames.first() else {
            return Err(EngineError::InvalidSequence(
                "sequence contains no frames".into(),
            ));
        };
        let (w, h, fmt) = (first.width, first.height, first.format);
        for (idx, frame) in frames.iter().enumerate() {
            if frame.width != w || frame.height != h {
                return Err(EngineError::InvalidSequence(format!(
                    "frame {idx} is {}x{}, expected {w}x{h}",
                    frame.width, frame.height
                )));
            }
            if frame.format != fmt {
                return Err(EngineError::FormatMismatch {
                    expected: fmt,
                    actual: frame.format,
                });
            }
        }
        Ok(Self { frames, frame_rate })
    }

    #[inline]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    #[inline]
    pub fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn width(&self) -> u32 {
        self.frames[0].width
    }

    pub fn height(&self) -> u32 {
        self.frames[0].height
    }

    pub fn format(&self) -> PixelFormat {
        self.frames[0].format
    }
}

/// Axis-aligned region of interest in pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// ROI covering an entire `width x height` frame.
    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Reject empty regions and regions that leave the frame.
    pub fn validate(&self, frame_width: u32, frame_height: u32) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(EngineError::InvalidRoi(format!(
                "region {}x{} is empty",
                self.width, self.height
            )));
        }
        let right = self.x as u64 + self.width as u64;
        let bottom = self.y as u64 + self.height as u64;
        if right > frame_width as u64 || bottom > frame_height as u64 {
            return Err(EngineError::InvalidRoi(format!(
                "region x={} y={} {}x{} exceeds frame bounds {}x{}",
                self.x, self.y, self.width, self.height, frame_width, frame_height
            )));
        }
        Ok(())
    }

    pub fn extent(&self, planes: usize) -> Extent {
        Extent::new(self.width as usize, self.height as usize, planes)
    }
}

impl std::fmt::Display for Roi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{},{},{}", self.x, self.y, self.width, self.height)
    }
}

/// Planar grid dimensions of a device buffer or kernel launch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Extent {
    pub width: usize,
    pub height: usize,
    pub planes: usize,
}

impl Extent {
    pub const fn new(width: usize, height: usize, planes: usize) -> Self {
        Self {
            width,
            height,
            planes,
        }
    }

    #[inline]
    pub const fn plane_len(&self) -> usize {
        self.width * self.height
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.plane_len() * self.planes
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next coarser pyramid extent (floor halving).
    #[inline]
    pub const fn halved(&self) -> Self {
        Self::new(self.width / 2, self.height / 2, self.planes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(width: u32, height: u32) -> Frame {
        let data = (0..width * height).map(|i| (i % 256) as u8).collect();
        Frame::from_u8(width, height, PixelFormat::Gray8, data).unwrap()
    }

    #[test]
    fn roi_outside_frame_is_rejected() {
        let err = Roi::new(60, 0, 8, 8).validate(64, 64).unwrap_err();
        assert!(matches!(err, EngineError::InvalidRoi(_)));
        assert!(Roi::new(0, 0, 0, 4).validate(64, 64).is_err());
        Roi::new(56, 56, 8, 8).validate(64, 64).unwrap();
    }

    #[test]
    fn sequence_rejects_mixed_dimensions() {
        let err = FrameSequence::new(vec![ramp(4, 4), ramp(4, 5)], 30.0).unwrap_err();
        assert!(matches!(err, EngineError::InvalidSequence(_)));
        assert!(FrameSequence::new(vec![], 30.0).is_err());
        assert!(FrameSequence::new(vec![ramp(4, 4)], 0.0).is_err());
    }

    #[test]
    fn frame_length_must_match_dimensions() {
        let err = Frame::from_u8(4, 4, PixelFormat::Rgb8, vec![0; 16]).unwrap_err();
        assert!(matches!(err, EngineError::BufferTooSmall { need: 48, have: 16 }));
    }

    #[test]
    fn roi_planes_are_planar_and_clamped() {
        let data = vec![
            -1.0, 0.2, 0.3, //
            0.4, 2.0, 0.6,
        ];
        let frame = Frame::from_f32(1, 2, PixelFormat::RgbF32, data).unwrap();
        let planes = frame.roi_planes(&Roi::full(1, 2));
        assert_eq!(planes, vec![0.0, 0.4, 0.2, 1.0, 0.3, 0.6]);
    }

    #[test]
    fn composite_keeps_pixels_outside_roi() {
        let frame = ramp(8, 8);
        let roi = Roi::new(2, 2, 2, 2);
        let out = frame.composite_roi(&roi, &[1.0, 1.0, 0.0, 0.5]).unwrap();
        let PixelData::U8(src) = frame.data() else {
            panic!("expected u8 frame");
        };
        let PixelData::U8(dst) = out.data() else {
            panic!("expected u8 frame");
        };
        for y in 0..8usize {
            for x in 0..8usize {
                let inside = (2..4).contains(&x) && (2..4).contains(&y);
                if !inside {
                    assert_eq!(src[y * 8 + x], dst[y * 8 + x]);
                }
            }
        }
        assert_eq!(dst[2 * 8 + 2], 255);
        assert_eq!(dst[3 * 8 + 2], 0);
        assert_eq!(dst[3 * 8 + 3], 128);
    }

    #[test]
    fn extent_halving_floors() {
        let e = Extent::new(33, 17, 3).halved();
        assert_eq!((e.width, e.height, e.planes), (16, 8, 3));
        assert_eq!(e.len(), 16 * 8 * 3);
    }
}
