//! Laplacian pyramid construction.
//!
//! Level `i+1` of the Gaussian stack is the binomial blur of level `i`
//! decimated by two.  The residual band of level `i` is
//! `G_i - up(G_{i+1}) + RESIDUAL_BIAS`.  A built [`FramePyramid`] keeps the
//! residual bands `L_0..L_{N-1}` and the coarsest base `G_N`; the
//! intermediate Gaussian levels are released as soon as the residuals exist.

use std::sync::Arc;

use rayon::prelude::*;
use tracing::debug;

use vmag_core::backend::{Bindings, BufferDesc, BufferUsage, ComputeKernel, KernelArgs};
use vmag_core::context::{BufferHandle, DeviceContext, Stream};
use vmag_core::error::{EngineError, Result};
use vmag_core::types::Extent;

use crate::sampling::{
    RESIDUAL_BIAS, blur_downsample_row, expect_len, expect_work, plane_row, upsample_row,
};

pub const BLUR_DOWNSAMPLE: &str = "blur_downsample";
pub const LAPLACIAN_RESIDUAL: &str = "laplacian_residual";

// ─── Kernels ────────────────────────────────────────────────────────────────

/// `G_{i+1} = decimate(blur(G_i))`.  Reads `[G_i]`, writes `[G_{i+1}]`.
#[derive(Clone, Copy, Debug)]
pub struct BlurDownsample {
    pub src: Extent,
    pub dst: Extent,
}

impl ComputeKernel for BlurDownsample {
    fn name(&self) -> &'static str {
        BLUR_DOWNSAMPLE
    }

    fn run(&self, args: &mut KernelArgs<'_>, work: Extent) -> Result<()> {
        expect_work(BLUR_DOWNSAMPLE, self.dst, work)?;
        let (reads, writes) = args.split(BLUR_DOWNSAMPLE, 1, 1)?;
        let src = reads[0].as_f32()?;
        let dst = writes[0].as_f32_mut()?;
        expect_len(BLUR_DOWNSAMPLE, "source", self.src, src.len())?;
        expect_len(BLUR_DOWNSAMPLE, "destination", self.dst, dst.len())?;

        let (sw, sh) = (self.src.width, self.src.height);
        let src_plane_len = self.src.plane_len();
        dst.par_chunks_mut(self.dst.width)
            .enumerate()
            .for_each_init(
                || vec![0.0f32; sw],
                |tmp, (row, out)| {
                    let (plane, y) = plane_row(row, self.dst.height);
                    let src_plane = &src[plane * src_plane_len..(plane + 1) * src_plane_len];
                    blur_downsample_row(src_plane, sw, sh, y, tmp, out);
                },
            );
        Ok(())
    }
}

/// `L_i = G_i - up(G_{i+1}) + bias`.  Reads `[G_i, G_{i+1}]`, writes `[L_i]`.
#[derive(Clone, Copy, Debug)]
pub struct LaplacianResidual {
    pub fine: Extent,
    pub coarse: Extent,
}

impl ComputeKernel for LaplacianResidual {
    fn name(&self) -> &'static str {
        LAPLACIAN_RESIDUAL
    }

    fn run(&self, args: &mut KernelArgs<'_>, work: Extent) -> Result<()> {
        expect_work(LAPLACIAN_RESIDUAL, self.fine, work)?;
        let (reads, writes) = args.split(LAPLACIAN_RESIDUAL, 2, 1)?;
        let fine = reads[0].as_f32()?;
        let coarse = reads[1].as_f32()?;
        let out = writes[0].as_f32_mut()?;
        expect_len(LAPLACIAN_RESIDUAL, "fine", self.fine, fine.len())?;
        expect_len(LAPLACIAN_RESIDUAL, "coarse", self.coarse, coarse.len())?;
        expect_len(LAPLACIAN_RESIDUAL, "residual", self.fine, out.len())?;

        let fw = self.fine.width;
        let coarse_plane_len = self.coarse.plane_len();
        out.par_chunks_mut(fw).enumerate().for_each(|(row, out_row)| {
            let (plane, y) = plane_row(row, self.fine.height);
            let coarse_plane = &coarse[plane * coarse_plane_len..(plane + 1) * coarse_plane_len];
            upsample_row(coarse_plane, self.coarse.width, self.coarse.height, y, out_row);
            let fine_row = &fine[row * fw..(row + 1) * fw];
            for (o, g) in out_row.iter_mut().zip(fine_row) {
                *o = g - *o + RESIDUAL_BIAS;
            }
        });
        Ok(())
    }
}

// ─── Layout ─────────────────────────────────────────────────────────────────

/// Extents of every pyramid level for one run, `levels[0]` being the ROI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PyramidLayout {
    levels: Vec<Extent>,
}

impl PyramidLayout {
    /// Layout for `depth` decimation steps.  Rejects depths whose coarsest
    /// level would fall below 1x1.
    pub fn new(base: Extent, depth: u32) -> Result<Self> {
        if depth == 0 || depth >= usize::BITS {
            return Err(EngineError::PyramidTooDeep {
                depth,
                width: base.width as u32,
                height: base.height as u32,
            });
        }
        let coarsest_w = base.width >> depth;
        let coarsest_h = base.height >> depth;
        if coarsest_w == 0 || coarsest_h == 0 {
            return Err(EngineError::PyramidTooDeep {
                depth,
                width: base.width as u32,
                height: base.height as u32,
            });
        }
        let mut levels = Vec::with_capacity(depth as usize + 1);
        let mut e = base;
        levels.push(e);
        for _ in 0..depth {
            e = e.halved();
            levels.push(e);
        }
        Ok(Self { levels })
    }

    /// Number of residual bands (decimation steps).
    #[inline]
    pub fn depth(&self) -> usize {
        self.levels.len() - 1
    }

    #[inline]
    pub fn level(&self, i: usize) -> Extent {
        self.levels[i]
    }

    /// Extent of the coarsest Gaussian base.
    #[inline]
    pub fn coarsest(&self) -> Extent {
        self.levels[self.depth()]
    }

    /// Extents of the residual bands `L_0..L_{N-1}`.
    pub fn residual_levels(&self) -> &[Extent] {
        &self.levels[..self.depth()]
    }

    /// Samples across all residual bands.
    pub fn residual_samples(&self) -> usize {
        self.residual_levels().iter().map(Extent::len).sum()
    }
}

// ─── Driver ─────────────────────────────────────────────────────────────────

/// Residual bands and coarsest base of one frame.
#[derive(Debug)]
pub struct FramePyramid {
    pub frame_index: u64,
    pub residuals: Vec<BufferHandle>,
    pub base: BufferHandle,
}

impl FramePyramid {
    /// Release every buffer of this pyramid.
    pub fn release(self, ctx: &DeviceContext) {
        for handle in self.residuals {
            ctx.release(handle);
        }
        ctx.release(self.base);
    }
}

/// Builds one [`FramePyramid`] per frame on a stream.
pub struct PyramidBuilder {
    ctx: Arc<DeviceContext>,
    owner: Arc<str>,
    layout: Arc<PyramidLayout>,
}

impl PyramidBuilder {
    pub fn new(ctx: Arc<DeviceContext>, owner: Arc<str>, layout: Arc<PyramidLayout>) -> Self {
        Self { ctx, owner, layout }
    }

    pub fn layout(&self) -> &PyramidLayout {
        &self.layout
    }

    /// Decompose `level0` (the planar ROI, consumed) into a pyramid.
    ///
    /// On failure every buffer allocated here, `level0` included, is
    /// released before returning.
    pub async fn build(
        &self,
        stream: &Stream,
        frame_index: u64,
        level0: BufferHandle,
    ) -> Result<FramePyramid> {
        let mut gaussians = vec![level0];
        let mut residuals = Vec::with_capacity(self.layout.depth());

        if let Err(err) = self.enqueue(stream, &mut gaussians, &mut residuals).await {
            // Drain queued work before the buffers it references go away.
            let _ = stream.synchronize().await;
            for handle in gaussians.into_iter().chain(residuals) {
                self.ctx.release(handle);
            }
            return Err(err);
        }

        let base = gaussians.pop().ok_or_else(|| {
            EngineError::InvariantViolation("pyramid build produced no base level".into())
        })?;
        for intermediate in gaussians {
            self.ctx.release(intermediate);
        }
        debug!(frame_index, levels = residuals.len(), "pyramid built");
        Ok(FramePyramid {
            frame_index,
            residuals,
            base,
        })
    }

    async fn enqueue(
        &self,
        stream: &Stream,
        gaussians: &mut Vec<BufferHandle>,
        residuals: &mut Vec<BufferHandle>,
    ) -> Result<()> {
        let mut pending = Vec::with_capacity(2 * self.layout.depth());
        for i in 0..self.layout.depth() {
            let fine = self.layout.level(i);
            let coarse = self.layout.level(i + 1);

            let next = self.ctx.allocate(
                &self.owner,
                BufferDesc::f32(coarse.len()),
                BufferUsage::STORAGE,
            )?;
            pending.push(stream.dispatch(
                Arc::new(BlurDownsample {
                    src: fine,
                    dst: coarse,
                }),
                Bindings::new([gaussians[i].id()], [next.id()]),
                coarse,
            ));
            gaussians.push(next);

            let residual = self.ctx.allocate(
                &self.owner,
                BufferDesc::f32(fine.len()),
                BufferUsage::STORAGE,
            )?;
            pending.push(stream.dispatch(
                Arc::new(LaplacianResidual { fine, coarse }),
                Bindings::new([gaussians[i].id(), gaussians[i + 1].id()], [residual.id()]),
                fine,
            ));
            residuals.push(residual);
        }
        for task in pending {
            task.await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmag_core::backend::BufferData;

    /// Direct 2-D reference: 25-tap clamped blur sampled at even positions.
    fn ref_blur_downsample(src: &[f32], w: usize, h: usize) -> Vec<f32> {
        let taps = [1.0f32, 4.0, 6.0, 4.0, 1.0];
        let (dw, dh) = (w / 2, h / 2);
        let mut out = vec![0.0f32; dw * dh];
        for y in 0..dh {
            for x in 0..dw {
                let mut acc = 0.0f32;
                for (j, wy) in taps.iter().enumerate() {
                    let yy = (2 * y as isize + j as isize - 2).clamp(0, h as isize - 1) as usize;
                    for (k, wx) in taps.iter().enumerate() {
                        let xx =
                            (2 * x as isize + k as isize - 2).clamp(0, w as isize - 1) as usize;
                        acc += wy * wx * src[yy * w + xx];
                    }
                }
                out[y * dw + x] = acc / 256.0;
            }
        }
        out
    }

    fn ramp(w: usize, h: usize) -> Vec<f32> {
        (0..w * h)
            .map(|i| ((i * 37) % 101) as f32 / 100.0)
            .collect()
    }

    fn run_kernel(kernel: &dyn ComputeKernel, reads: &[&BufferData], out: BufferDesc, work: Extent) -> Vec<f32> {
        let mut dst = BufferData::zeroed(out);
        let mut args = KernelArgs::new(reads.to_vec(), vec![&mut dst]);
        kernel.run(&mut args, work).unwrap();
        drop(args);
        dst.as_f32().unwrap().to_vec()
    }

    #[test]
    fn blur_downsample_matches_direct_reference() {
        let (w, h) = (13, 10);
        let src_data = ramp(w, h);
        let src = BufferData::F32(src_data.clone());
        let kernel = BlurDownsample {
            src: Extent::new(w, h, 1),
            dst: Extent::new(w / 2, h / 2, 1),
        };
        let got = run_kernel(&kernel, &[&src], BufferDesc::f32(6 * 5), kernel.dst);
        let want = ref_blur_downsample(&src_data, w, h);
        for (g, r) in got.iter().zip(&want) {
            assert!((g - r).abs() < 1e-5, "{g} vs {r}");
        }
    }

    #[test]
    fn kernels_are_deterministic() {
        let (w, h) = (16, 12);
        let src = BufferData::F32(ramp(w, h));
        let kernel = BlurDownsample {
            src: Extent::new(w, h, 1),
            dst: Extent::new(8, 6, 1),
        };
        let a = run_kernel(&kernel, &[&src], BufferDesc::f32(48), kernel.dst);
        let b = run_kernel(&kernel, &[&src], BufferDesc::f32(48), kernel.dst);
        assert_eq!(a, b);
    }

    #[test]
    fn residual_of_constant_image_is_bias() {
        let fine = BufferData::F32(vec![0.4; 9 * 7]);
        let coarse = BufferData::F32(vec![0.4; 4 * 3]);
        let kernel = LaplacianResidual {
            fine: Extent::new(9, 7, 1),
            coarse: Extent::new(4, 3, 1),
        };
        let out = run_kernel(&kernel, &[&fine, &coarse], BufferDesc::f32(63), kernel.fine);
        assert!(out.iter().all(|v| (*v - RESIDUAL_BIAS).abs() < 1e-6));
    }

    #[test]
    fn wrong_launch_grid_is_rejected() {
        let src = BufferData::F32(vec![0.0; 16]);
        let mut dst = BufferData::zeroed(BufferDesc::f32(4));
        let kernel = BlurDownsample {
            src: Extent::new(4, 4, 1),
            dst: Extent::new(2, 2, 1),
        };
        let mut args = KernelArgs::new(vec![&src], vec![&mut dst]);
        assert!(kernel.run(&mut args, Extent::new(4, 4, 1)).is_err());
    }

    #[test]
    fn layout_rejects_sub_pixel_levels() {
        assert!(PyramidLayout::new(Extent::new(64, 64, 1), 6).is_ok());
        let err = PyramidLayout::new(Extent::new(64, 64, 1), 7).unwrap_err();
        assert!(matches!(err, EngineError::PyramidTooDeep { depth: 7, .. }));
        assert!(PyramidLayout::new(Extent::new(64, 3, 1), 2).is_err());
        assert!(PyramidLayout::new(Extent::new(64, 64, 1), 0).is_err());
    }

    #[test]
    fn layout_halves_with_floor() {
        let layout = PyramidLayout::new(Extent::new(33, 20, 3), 2).unwrap();
        assert_eq!(layout.depth(), 2);
        assert_eq!(layout.level(1), Extent::new(16, 10, 3));
        assert_eq!(layout.coarsest(), Extent::new(8, 5, 3));
        assert_eq!(layout.residual_samples(), 33 * 20 * 3 + 16 * 10 * 3);
    }
}
