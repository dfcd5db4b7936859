//! Synthetic oscillation scenes and amplitude measurement.
//!
//! A single pixel oscillates sinusoidally over a mid-gray background.  After a
//! run, fitting `a sin + b cos + c` to the added signal (output minus input)
//! at that pixel gives the amplitude the engine produced, which should track
//! `amplitude * gain * |H(f)|` for the configured band.

use std::f64::consts::PI;

use serde::Serialize;

use vmag_core::error::{EngineError, Result};
use vmag_core::types::{Frame, FrameSequence};
use vmag_kernels::TemporalCoefficients;

use crate::job::ProcessingParameters;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct OscillationScene {
    pub width: u32,
    pub height: u32,
    pub frames: usize,
    pub frame_rate: f64,
    /// Oscillating pixel `(x, y)`.
    pub pixel: (u32, u32),
    pub background: f32,
    pub amplitude: f64,
    pub frequency_hz: f64,
}

impl Default for OscillationScene {
    fn default() -> Self {
        Self {
            width: 64,
            height: 64,
            frames: 90,
            frame_rate: 30.0,
            pixel: (32, 32),
            background: 0.5,
            amplitude: 0.1,
            frequency_hz: 0.3,
        }
    }
}

impl OscillationScene {
    fn value_at(&self, t: usize) -> f32 {
        let phase = 2.0 * PI * self.frequency_hz * t as f64 / self.frame_rate;
        (self.background as f64 + self.amplitude * phase.sin()) as f32
    }

    /// Render the scene as single-channel float frames.
    pub fn render(&self) -> Result<FrameSequence> {
        let (px, py) = self.pixel;
        if px >= self.width || py >= self.height {
            return Err(EngineError::InvalidConfig(format!(
                "oscillating pixel ({px},{py}) lies outside {}x{}",
                self.width, self.height
            )));
        }
        let plane = self.width as usize * self.height as usize;
        let index = py as usize * self.width as usize + px as usize;
        let frames = (0..self.frames)
            .map(|t| {
                let mut data = vec![self.background; plane];
                data[index] = self.value_at(t);
                Frame::gray_f32(self.width, self.height, data)
            })
            .collect::<Result<Vec<_>>>()?;
        FrameSequence::new(frames, self.frame_rate)
    }

    /// Amplitude the engine should add at the oscillating pixel.
    pub fn expected_amplitude(&self, params: &ProcessingParameters) -> Result<f64> {
        let coeffs = TemporalCoefficients::new(
            params.band.f_min_hz,
            params.band.f_max_hz,
            self.frame_rate,
        )?;
        Ok(self.amplitude * params.gain * coeffs.response(self.frequency_hz))
    }

    /// Fit the added signal at the oscillating pixel, ignoring the first
    /// `settle_frames` while the filter state warms up.
    pub fn measure(
        &self,
        input: &FrameSequence,
        output: &FrameSequence,
        settle_frames: usize,
    ) -> Result<f64> {
        if input.len() != output.len() {
            return Err(EngineError::InvalidSequence(format!(
                "input has {} frames, output has {}",
                input.len(),
                output.len()
            )));
        }
        let (px, py) = self.pixel;
        let added: Vec<f64> = input
            .frames()
            .iter()
            .zip(output.frames())
            .map(|(i, o)| o.sample(px, py, 0) as f64 - i.sample(px, py, 0) as f64)
            .collect();
        fit_amplitude(&added, self.frequency_hz, self.frame_rate, settle_frames).ok_or_else(|| {
            EngineError::InvalidSequence(format!(
                "cannot fit {} Hz over frames {settle_frames}..{}",
                self.frequency_hz,
                added.len()
            ))
        })
    }
}

/// Least-squares amplitude of a `frequency_hz` sinusoid in
/// `samples[start..]`.  `None` if the window is too short to fit.
pub fn fit_amplitude(samples: &[f64], frequency_hz: f64, frame_rate: f64, start: usize) -> Option<f64> {
    if samples.len() < start + 3 {
        return None;
    }
    // Normal equations for the basis [sin, cos, 1].
    let mut ata = [[0.0f64; 3]; 3];
    let mut atb = [0.0f64; 3];
    for (t, y) in samples.iter().enumerate().skip(start) {
        let phase = 2.0 * PI * frequency_hz * t as f64 / frame_rate;
        let row = [phase.sin(), phase.cos(), 1.0];
        for i in 0..3 {
            for j in 0..3 {
                ata[i][j] += row[i] * row[j];
            }
            atb[i] += row[i] * y;
        }
    }
    let [a, b, _] = solve3(ata, atb)?;
    Some(a.hypot(b))
}

fn det3(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Cramer's rule.
fn solve3(m: [[f64; 3]; 3], rhs: [f64; 3]) -> Option<[f64; 3]> {
    let det = det3(&m);
    if det.abs() < 1e-12 {
        return None;
    }
    let mut out = [0.0; 3];
    for (col, slot) in out.iter_mut().enumerate() {
        let mut replaced = m;
        for row in 0..3 {
            replaced[row][col] = rhs[row];
        }
        *slot = det3(&replaced) / det;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_recovers_a_known_sinusoid() {
        let samples: Vec<f64> = (0..120)
            .map(|t| {
                let phase = 2.0 * PI * 0.5 * t as f64 / 30.0;
                0.2 + 0.07 * phase.sin() - 0.03 * phase.cos()
            })
            .collect();
        let amp = fit_amplitude(&samples, 0.5, 30.0, 10).unwrap();
        assert!((amp - 0.07f64.hypot(0.03)).abs() < 1e-9);
    }

    #[test]
    fn fit_needs_enough_samples() {
        assert!(fit_amplitude(&[0.0; 4], 1.0, 30.0, 2).is_none());
    }

    #[test]
    fn default_scene_oscillates_one_pixel() {
        let scene = OscillationScene::default();
        let seq = scene.render().unwrap();
        assert_eq!(seq.len(), 90);
        let frame = &seq.frames()[10];
        assert_eq!(frame.sample(0, 0, 0), 0.5);
        assert!((frame.sample(32, 32, 0) as f64 - scene.value_at(10) as f64).abs() < 1e-7);
    }

    #[test]
    fn pixel_outside_the_frame_is_rejected() {
        let scene = OscillationScene {
            pixel: (64, 0),
            ..OscillationScene::default()
        };
        assert!(scene.render().unwrap_err().is_configuration());
    }

    #[test]
    fn expected_amplitude_scales_with_gain() {
        let scene = OscillationScene::default();
        let p5 = ProcessingParameters {
            gain: 5.0,
            pyramid_depth: 2,
            ..ProcessingParameters::default()
        };
        let p10 = ProcessingParameters { gain: 10.0, ..p5 };
        let a5 = scene.expected_amplitude(&p5).unwrap();
        let a10 = scene.expected_amplitude(&p10).unwrap();
        assert!((a10 - 2.0 * a5).abs() < 1e-12);
        assert!(a5 > 0.25 && a5 < 0.4);
    }
}
