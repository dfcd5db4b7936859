#![allow(dead_code)]

use std::sync::Arc;

use vmag_core::context::DeviceContext;
use vmag_core::host::{FaultPlan, HostDevice};
use vmag_core::types::{Frame, FrameSequence, PixelFormat};
use vmag_pipeline::{MagnificationPipeline, PipelineConfig};

/// Deterministic generator so noisy inputs are identical across runs.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn next_u32(&mut self) -> u32 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 33) as u32
    }

    /// Uniform in `[lo, hi)`.
    pub fn next_f32(&mut self, lo: f32, hi: f32) -> f32 {
        lo + (hi - lo) * (self.next_u32() as f32 / (1u64 << 31) as f32)
    }
}

pub fn context(faults: FaultPlan) -> Arc<DeviceContext> {
    DeviceContext::new(Arc::new(HostDevice::with_faults(faults).unwrap()))
}

pub fn pipeline(faults: FaultPlan) -> MagnificationPipeline {
    MagnificationPipeline::new(context(faults), PipelineConfig::default())
}

pub fn noise_gray_f32(width: u32, height: u32, frames: usize, seed: u64) -> FrameSequence {
    let mut rng = Lcg::new(seed);
    let frames = (0..frames)
        .map(|_| {
            let data = (0..width * height).map(|_| rng.next_f32(0.0, 1.0)).collect();
            Frame::gray_f32(width, height, data).unwrap()
        })
        .collect();
    FrameSequence::new(frames, 30.0).unwrap()
}

pub fn noise_u8(
    width: u32,
    height: u32,
    format: PixelFormat,
    frames: usize,
    seed: u64,
) -> FrameSequence {
    let mut rng = Lcg::new(seed);
    let len = (width * height) as usize * format.channels();
    let frames = (0..frames)
        .map(|_| {
            let data = (0..len).map(|_| 64 + (rng.next_u32() % 128) as u8).collect();
            Frame::from_u8(width, height, format, data).unwrap()
        })
        .collect();
    FrameSequence::new(frames, 30.0).unwrap()
}
