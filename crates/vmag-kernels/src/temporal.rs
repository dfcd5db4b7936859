//! Temporal band-pass over residual bands.
//!
//! Each residual sample runs two exponential moving averages with decay
//! `alpha_low = exp(-2*pi*f_min/fs)` and `alpha_high = exp(-2*pi*f_max/fs)`:
//!
//! ```text
//! slow <- alpha_low  * slow + (1 - alpha_low)  * x
//! fast <- alpha_high * fast + (1 - alpha_high) * x
//! band  = slow - fast
//! ```
//!
//! `x` is the unbiased residual, state is `f64` and starts at zero.  The band
//! is stored biased by [`RESIDUAL_BIAS`] and clamped to `[0, 1]`.
//!
//! The recurrence makes frame `t` depend on frame `t - 1`, so
//! [`TemporalFilter::apply`] takes `&mut self` and rejects frames that do
//! not arrive in strictly increasing order.

use std::f64::consts::PI;
use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use vmag_core::backend::{Bindings, BufferDesc, BufferUsage, ComputeKernel, KernelArgs};
use vmag_core::context::{BufferHandle, DeviceContext, Stream};
use vmag_core::error::{EngineError, Result};
use vmag_core::types::Extent;

use crate::pyramid::{FramePyramid, PyramidLayout};
use crate::sampling::{ELEMENTWISE_CHUNK, RESIDUAL_BIAS, expect_len, expect_work};

pub const TEMPORAL_BANDPASS: &str = "temporal_bandpass";

/// Per-run EMA decay coefficients.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TemporalCoefficients {
    pub alpha_low: f64,
    pub alpha_high: f64,
    pub sample_rate_hz: f64,
}

impl TemporalCoefficients {
    /// Derive coefficients for the band `[f_min_hz, f_max_hz]` sampled at
    /// `sample_rate_hz`.
    pub fn new(f_min_hz: f64, f_max_hz: f64, sample_rate_hz: f64) -> Result<Self> {
        let nyquist_hz = sample_rate_hz / 2.0;
        let band_err = || EngineError::InvalidFrequencyBand {
            f_min_hz,
            f_max_hz,
            nyquist_hz,
        };
        if !(f_min_hz.is_finite() && f_max_hz.is_finite() && sample_rate_hz.is_finite()) {
            return Err(band_err());
        }
        if !(f_min_hz > 0.0 && f_min_hz < f_max_hz && f_max_hz < nyquist_hz) {
            return Err(band_err());
        }
        let alpha_low = (-2.0 * PI * f_min_hz / sample_rate_hz).exp();
        let alpha_high = (-2.0 * PI * f_max_hz / sample_rate_hz).exp();
        let open_unit = |a: f64| a > 0.0 && a < 1.0;
        if !(open_unit(alpha_low) && open_unit(alpha_high)) {
            return Err(band_err());
        }
        Ok(Self {
            alpha_low,
            alpha_high,
            sample_rate_hz,
        })
    }

    /// Magnitude of the `slow - fast` response at `freq_hz`.
    pub fn response(&self, freq_hz: f64) -> f64 {
        let w = 2.0 * PI * freq_hz / self.sample_rate_hz;
        let ema = |a: f64| {
            // (1 - a) / (1 - a e^{-jw})
            let re_d = 1.0 - a * w.cos();
            let im_d = a * w.sin();
            let mag2 = re_d * re_d + im_d * im_d;
            ((1.0 - a) * re_d / mag2, -(1.0 - a) * im_d / mag2)
        };
        let (re_l, im_l) = ema(self.alpha_low);
        let (re_h, im_h) = ema(self.alpha_high);
        (re_l - re_h).hypot(im_l - im_h)
    }
}

// ─── Kernel ─────────────────────────────────────────────────────────────────

/// One EMA step.  Reads `[L_i]`, writes `[state_i, band_i]` where `state_i`
/// holds `slow` then `fast`, each `extent.len()` long.
#[derive(Clone, Copy, Debug)]
pub struct TemporalBandpass {
    pub extent: Extent,
    pub alpha_low: f64,
    pub alpha_high: f64,
}

impl ComputeKernel for TemporalBandpass {
    fn name(&self) -> &'static str {
        TEMPORAL_BANDPASS
    }

    fn run(&self, args: &mut KernelArgs<'_>, work: Extent) -> Result<()> {
        expect_work(TEMPORAL_BANDPASS, self.extent, work)?;
        let (reads, writes) = args.split(TEMPORAL_BANDPASS, 1, 2)?;
        let input = reads[0].as_f32()?;
        let [state, band] = writes else {
            return Err(EngineError::InvariantViolation(
                "temporal band-pass needs state and band bindings".into(),
            ));
        };
        let state = state.as_f64_mut()?;
        let band = band.as_f32_mut()?;
        let n = self.extent.len();
        expect_len(TEMPORAL_BANDPASS, "residual", self.extent, input.len())?;
        expect_len(TEMPORAL_BANDPASS, "band", self.extent, band.len())?;
        if state.len() != 2 * n {
            return Err(EngineError::KernelFailed {
                kernel: TEMPORAL_BANDPASS,
                message: format!("state holds {} values, expected {}", state.len(), 2 * n),
            });
        }

        let (slow, fast) = state.split_at_mut(n);
        let (al, ah) = (self.alpha_low, self.alpha_high);
        slow.par_chunks_mut(ELEMENTWISE_CHUNK)
            .zip(fast.par_chunks_mut(ELEMENTWISE_CHUNK))
            .zip(band.par_chunks_mut(ELEMENTWISE_CHUNK))
            .zip(input.par_chunks(ELEMENTWISE_CHUNK))
            .for_each(|(((slow, fast), band), input)| {
                for i in 0..input.len() {
                    let x = f64::from(input[i] - RESIDUAL_BIAS);
                    slow[i] = al * slow[i] + (1.0 - al) * x;
                    fast[i] = ah * fast[i] + (1.0 - ah) * x;
                    let b = (slow[i] - fast[i]) as f32 + RESIDUAL_BIAS;
                    band[i] = b.clamp(0.0, 1.0);
                }
            });
        Ok(())
    }
}

// ─── Driver ─────────────────────────────────────────────────────────────────

/// Single-owner filter state for one run.
///
/// Holds one `f64` state buffer per residual band, allocated once and freed
/// by [`TemporalFilter::release`].
pub struct TemporalFilter {
    ctx: Arc<DeviceContext>,
    owner: Arc<str>,
    layout: Arc<PyramidLayout>,
    coefficients: TemporalCoefficients,
    state: Vec<BufferHandle>,
    next_frame: u64,
}

impl TemporalFilter {
    /// Bytes of state a filter over `layout` holds.
    pub fn state_bytes(layout: &PyramidLayout) -> usize {
        2 * layout.residual_samples() * std::mem::size_of::<f64>()
    }

    /// Allocate zeroed state for every residual band.
    pub fn new(
        ctx: Arc<DeviceContext>,
        owner: Arc<str>,
        layout: Arc<PyramidLayout>,
        coefficients: TemporalCoefficients,
    ) -> Result<Self> {
        let mut state = Vec::with_capacity(layout.depth());
        for extent in layout.residual_levels() {
            match ctx.allocate(&owner, BufferDesc::f64(2 * extent.len()), BufferUsage::STORAGE) {
                Ok(handle) => state.push(handle),
                Err(err) => {
                    for handle in state {
                        ctx.release(handle);
                    }
                    return Err(err);
                }
            }
        }
        debug!(
            levels = state.len(),
            bytes = Self::state_bytes(&layout),
            alpha_low = coefficients.alpha_low,
            alpha_high = coefficients.alpha_high,
            "temporal filter state allocated"
        );
        Ok(Self {
            ctx,
            owner,
            layout,
            coefficients,
            state,
            next_frame: 0,
        })
    }

    pub fn coefficients(&self) -> TemporalCoefficients {
        self.coefficients
    }

    /// Frames folded into the state so far.
    pub fn frames_applied(&self) -> u64 {
        self.next_frame
    }

    /// Advance the recurrence by one frame and return its band-pass planes,
    /// one per residual band.
    ///
    /// `pyramid.frame_index` must equal the number of frames applied so far.
    pub async fn apply(&mut self, stream: &Stream, pyramid: &FramePyramid) -> Result<Vec<BufferHandle>> {
        if pyramid.frame_index != self.next_frame {
            return Err(EngineError::InvariantViolation(format!(
                "temporal filter expected frame {}, got frame {}",
                self.next_frame, pyramid.frame_index
            )));
        }
        if pyramid.residuals.len() != self.state.len() {
            return Err(EngineError::InvariantViolation(format!(
                "pyramid has {} residual bands, filter state has {}",
                pyramid.residuals.len(),
                self.state.len()
            )));
        }

        let mut bands = Vec::with_capacity(self.state.len());
        if let Err(err) = self.enqueue(stream, pyramid, &mut bands).await {
            let _ = stream.synchronize().await;
            for handle in bands {
                self.ctx.release(handle);
            }
            return Err(err);
        }
        self.next_frame += 1;
        Ok(bands)
    }

    async fn enqueue(
        &self,
        stream: &Stream,
        pyramid: &FramePyramid,
        bands: &mut Vec<BufferHandle>,
    ) -> Result<()> {
        let mut pending = Vec::with_capacity(self.state.len());
        for (i, (residual, state)) in pyramid.residuals.iter().zip(&self.state).enumerate() {
            let extent = self.layout.level(i);
            let band = self.ctx.allocate(
                &self.owner,
                BufferDesc::f32(extent.len()),
                BufferUsage::STORAGE,
            )?;
            pending.push(stream.dispatch(
                Arc::new(TemporalBandpass {
                    extent,
                    alpha_low: self.coefficients.alpha_low,
                    alpha_high: self.coefficients.alpha_high,
                }),
                Bindings::new([residual.id()], [state.id(), band.id()]),
                extent,
            ));
            bands.push(band);
        }
        for task in pending {
            task.await?;
        }
        Ok(())
    }

    /// Free the filter state.  Returns the number of buffers released.
    pub fn release(self) -> usize {
        let mut released = 0;
        for handle in self.state {
            if self.ctx.release(handle) {
                released += 1;
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmag_core::backend::BufferData;

    fn step(kernel: &TemporalBandpass, state: &mut BufferData, input: f32) -> f32 {
        let n = kernel.extent.len();
        let residual = BufferData::F32(vec![input; n]);
        let mut band = BufferData::zeroed(BufferDesc::f32(n));
        let mut args = KernelArgs::new(vec![&residual], vec![state, &mut band]);
        kernel.run(&mut args, kernel.extent).unwrap();
        drop(args);
        band.as_f32().unwrap()[0]
    }

    #[test]
    fn coefficients_follow_band_edges() {
        let c = TemporalCoefficients::new(0.1, 0.5, 30.0).unwrap();
        assert!((c.alpha_low - (-2.0 * PI * 0.1 / 30.0).exp()).abs() < 1e-15);
        assert!((c.alpha_high - (-2.0 * PI * 0.5 / 30.0).exp()).abs() < 1e-15);
        assert!(0.0 < c.alpha_high && c.alpha_high < c.alpha_low && c.alpha_low < 1.0);
    }

    #[test]
    fn invalid_bands_are_configuration_errors() {
        for (lo, hi) in [(0.0, 0.5), (0.5, 0.5), (0.6, 0.5), (1.0, 15.0), (1.0, 20.0), (f64::NAN, 1.0)] {
            let err = TemporalCoefficients::new(lo, hi, 30.0).unwrap_err();
            assert!(err.is_configuration(), "[{lo}, {hi}] should be rejected");
        }
    }

    #[test]
    fn response_passes_band_and_rejects_extremes() {
        let c = TemporalCoefficients::new(0.02, 6.0, 30.0).unwrap();
        assert!(c.response(0.5) > 0.95);
        assert!(c.response(1e-4) < 0.01);

        let narrow = TemporalCoefficients::new(0.1, 0.5, 30.0).unwrap();
        assert!(narrow.response(10.0) < 0.1);
        assert!(narrow.response(0.3) > narrow.response(10.0));
    }

    #[test]
    fn zero_residual_keeps_band_at_bias() {
        let kernel = TemporalBandpass {
            extent: Extent::new(3, 2, 1),
            alpha_low: 0.9,
            alpha_high: 0.5,
        };
        let mut state = BufferData::zeroed(BufferDesc::f64(12));
        for _ in 0..10 {
            assert_eq!(step(&kernel, &mut state, RESIDUAL_BIAS), RESIDUAL_BIAS);
        }
    }

    #[test]
    fn step_response_is_slow_minus_fast() {
        let kernel = TemporalBandpass {
            extent: Extent::new(1, 1, 1),
            alpha_low: 0.9,
            alpha_high: 0.5,
        };
        let mut state = BufferData::zeroed(BufferDesc::f64(2));
        // x = 0.2: slow = 0.02, fast = 0.1 -> band = -0.08 + bias.
        let b = step(&kernel, &mut state, RESIDUAL_BIAS + 0.2);
        assert!((b - (RESIDUAL_BIAS - 0.08)).abs() < 1e-6);
        // The response decays back towards the bias under a held input.
        let mut last = b;
        for _ in 0..200 {
            last = step(&kernel, &mut state, RESIDUAL_BIAS + 0.2);
        }
        assert!((last - RESIDUAL_BIAS).abs() < 1e-4);
    }

    #[test]
    fn band_output_is_clamped_to_stored_range() {
        let kernel = TemporalBandpass {
            extent: Extent::new(1, 1, 1),
            alpha_low: 0.999,
            alpha_high: 0.001,
        };
        let mut state = BufferData::zeroed(BufferDesc::f64(2));
        assert_eq!(step(&kernel, &mut state, 1.0e6), 0.0);
    }
}
