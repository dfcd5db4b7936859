//! Amplification and pyramid collapse.
//!
//! Reconstruction starts from the unfiltered coarsest base and walks towards
//! level 0:
//!
//! ```text
//! R_i = up(R_{i+1}) + (L_i - bias) + gain * (B_i - bias),   R_N = G_N
//! ```
//!
//! The full-resolution result is clamped to `[0, 1]` in place.  That clamp is
//! the only output-range defence against gain-induced overshoot.

use std::sync::Arc;

use rayon::prelude::*;

use vmag_core::backend::{Bindings, BufferDesc, BufferId, BufferUsage, ComputeKernel, KernelArgs};
use vmag_core::context::{BufferHandle, DeviceContext, Stream};
use vmag_core::error::{EngineError, Result};
use vmag_core::types::Extent;

use crate::pyramid::{FramePyramid, PyramidLayout};
use crate::sampling::{
    ELEMENTWISE_CHUNK, RESIDUAL_BIAS, expect_len, expect_work, plane_row, upsample_row,
};

pub const AMPLIFY_COLLAPSE: &str = "amplify_collapse";
pub const CLAMP_OUTPUT: &str = "clamp_output";

/// One collapse step.  Reads `[R_{i+1}, L_i, B_i]`, writes `[R_i]`.
#[derive(Clone, Copy, Debug)]
pub struct AmplifyCollapse {
    pub fine: Extent,
    pub coarse: Extent,
    pub gain: f32,
}

impl ComputeKernel for AmplifyCollapse {
    fn name(&self) -> &'static str {
        AMPLIFY_COLLAPSE
    }

    fn run(&self, args: &mut KernelArgs<'_>, work: Extent) -> Result<()> {
        expect_work(AMPLIFY_COLLAPSE, self.fine, work)?;
        let (reads, writes) = args.split(AMPLIFY_COLLAPSE, 3, 1)?;
        let coarse = reads[0].as_f32()?;
        let residual = reads[1].as_f32()?;
        let band = reads[2].as_f32()?;
        let out = writes[0].as_f32_mut()?;
        expect_len(AMPLIFY_COLLAPSE, "coarse", self.coarse, coarse.len())?;
        expect_len(AMPLIFY_COLLAPSE, "residual", self.fine, residual.len())?;
        expect_len(AMPLIFY_COLLAPSE, "band", self.fine, band.len())?;
        expect_len(AMPLIFY_COLLAPSE, "output", self.fine, out.len())?;

        let fw = self.fine.width;
        let coarse_plane_len = self.coarse.plane_len();
        let gain = self.gain;
        out.par_chunks_mut(fw).enumerate().for_each(|(row, out_row)| {
            let (plane, y) = plane_row(row, self.fine.height);
            let coarse_plane = &coarse[plane * coarse_plane_len..(plane + 1) * coarse_plane_len];
            upsample_row(coarse_plane, self.coarse.width, self.coarse.height, y, out_row);
            let span = row * fw..(row + 1) * fw;
            for ((o, l), b) in out_row.iter_mut().zip(&residual[span.clone()]).zip(&band[span]) {
                *o += (l - RESIDUAL_BIAS) + gain * (b - RESIDUAL_BIAS);
            }
        });
        Ok(())
    }
}

/// Clamp a plane stack to `[0, 1]` in place and count the samples that
/// needed it.  Writes `[plane, stats]`; `stats[0]` receives the count.
#[derive(Clone, Copy, Debug)]
pub struct ClampOutput {
    pub extent: Extent,
}

impl ComputeKernel for ClampOutput {
    fn name(&self) -> &'static str {
        CLAMP_OUTPUT
    }

    fn run(&self, args: &mut KernelArgs<'_>, work: Extent) -> Result<()> {
        expect_work(CLAMP_OUTPUT, self.extent, work)?;
        let (_, writes) = args.split(CLAMP_OUTPUT, 0, 2)?;
        let [plane, stats] = writes else {
            return Err(EngineError::InvariantViolation(
                "clamp needs plane and stats bindings".into(),
            ));
        };
        let plane = plane.as_f32_mut()?;
        let stats = stats.as_f32_mut()?;
        expect_len(CLAMP_OUTPUT, "plane", self.extent, plane.len())?;
        if stats.is_empty() {
            return Err(EngineError::KernelFailed {
                kernel: CLAMP_OUTPUT,
                message: "stats binding is empty".into(),
            });
        }

        let clamped: usize = plane
            .par_chunks_mut(ELEMENTWISE_CHUNK)
            .map(|chunk| {
                let mut n = 0usize;
                for v in chunk.iter_mut() {
                    let c = if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
                    if c != *v || v.is_nan() {
                        n += 1;
                    }
                    *v = c;
                }
                n
            })
            .sum();
        stats[0] = clamped as f32;
        Ok(())
    }
}

// ─── Driver ─────────────────────────────────────────────────────────────────

/// Full-resolution output of one frame, both buffers readback-capable.
#[derive(Debug)]
pub struct ReconstructedFrame {
    pub frame_index: u64,
    /// Clamped planar ROI samples.
    pub output: BufferHandle,
    /// One element: number of samples the clamp changed.
    pub stats: BufferHandle,
}

impl ReconstructedFrame {
    pub fn release(self, ctx: &DeviceContext) {
        ctx.release(self.output);
        ctx.release(self.stats);
    }
}

/// Amplifies band-pass planes and folds a pyramid back to full resolution.
pub struct Reconstructor {
    ctx: Arc<DeviceContext>,
    owner: Arc<str>,
    layout: Arc<PyramidLayout>,
    gain: f32,
}

impl Reconstructor {
    pub fn new(ctx: Arc<DeviceContext>, owner: Arc<str>, layout: Arc<PyramidLayout>, gain: f64) -> Self {
        Self {
            ctx,
            owner,
            layout,
            gain: gain as f32,
        }
    }

    /// Collapse `pyramid` with `bands` (one per residual band).  Inputs are
    /// borrowed; the caller releases them.
    pub async fn reconstruct(
        &self,
        stream: &Stream,
        pyramid: &FramePyramid,
        bands: &[BufferHandle],
    ) -> Result<ReconstructedFrame> {
        if bands.len() != pyramid.residuals.len() || bands.len() != self.layout.depth() {
            return Err(EngineError::InvariantViolation(format!(
                "reconstruction needs {} band planes, got {}",
                self.layout.depth(),
                bands.len()
            )));
        }

        let mut scratch = Vec::with_capacity(self.layout.depth());
        let result = self.enqueue(stream, pyramid, bands, &mut scratch).await;
        if result.is_err() {
            let _ = stream.synchronize().await;
        }
        // scratch holds the intermediate levels, then output and stats last.
        let stats = scratch.pop();
        let output = scratch.pop();
        for handle in scratch {
            self.ctx.release(handle);
        }
        match (result, output, stats) {
            (Ok(()), Some(output), Some(stats)) => Ok(ReconstructedFrame {
                frame_index: pyramid.frame_index,
                output,
                stats,
            }),
            (result, output, stats) => {
                for handle in output.into_iter().chain(stats) {
                    self.ctx.release(handle);
                }
                Err(result.err().unwrap_or_else(|| {
                    EngineError::InvariantViolation("reconstruction produced no output".into())
                }))
            }
        }
    }

    async fn enqueue(
        &self,
        stream: &Stream,
        pyramid: &FramePyramid,
        bands: &[BufferHandle],
        scratch: &mut Vec<BufferHandle>,
    ) -> Result<()> {
        let mut pending = Vec::with_capacity(self.layout.depth() + 1);
        let mut coarser: BufferId = pyramid.base.id();
        for i in (0..self.layout.depth()).rev() {
            let fine = self.layout.level(i);
            let coarse = self.layout.level(i + 1);
            let usage = if i == 0 {
                BufferUsage::STORAGE | BufferUsage::READBACK
            } else {
                BufferUsage::STORAGE
            };
            let target = self
                .ctx
                .allocate(&self.owner, BufferDesc::f32(fine.len()), usage)?;
            pending.push(stream.dispatch(
                Arc::new(AmplifyCollapse {
                    fine,
                    coarse,
                    gain: self.gain,
                }),
                Bindings::new(
                    [coarser, pyramid.residuals[i].id(), bands[i].id()],
                    [target.id()],
                ),
                fine,
            ));
            coarser = target.id();
            scratch.push(target);
        }

        let stats = self.ctx.allocate(
            &self.owner,
            BufferDesc::f32(1),
            BufferUsage::STORAGE | BufferUsage::READBACK,
        )?;
        let full = self.layout.level(0);
        pending.push(stream.dispatch(
            Arc::new(ClampOutput { extent: full }),
            Bindings::new(Vec::<BufferId>::new(), [coarser, stats.id()]),
            full,
        ));
        scratch.push(stats);

        for task in pending {
            task.await?;
        }
        Ok(())
    }
}
