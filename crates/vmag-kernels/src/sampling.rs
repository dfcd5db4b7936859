//! Resampling primitives shared by the pyramid and reconstruction kernels.

use vmag_core::error::{EngineError, Result};
use vmag_core::types::Extent;

/// Normalised 5-tap binomial kernel `[1, 4, 6, 4, 1] / 16`.
pub const BINOMIAL_TAPS: [f32; 5] = [0.0625, 0.25, 0.375, 0.25, 0.0625];

/// Offset added to signed residual and band-pass planes so both signs fit
/// the stored `[0, 1]` range.
pub const RESIDUAL_BIAS: f32 = 0.5;

/// Rows per parallel work item for element-wise kernels.
pub(crate) const ELEMENTWISE_CHUNK: usize = 4096;

#[inline]
fn clamp_index(i: isize, n: usize) -> usize {
    i.clamp(0, n as isize - 1) as usize
}

/// Blur `src_plane` with the binomial kernel and keep the even samples.
///
/// Writes destination row `y` of a `dst_w`-wide plane.  `tmp` must hold at
/// least `src_w` samples.
pub(crate) fn blur_downsample_row(
    src_plane: &[f32],
    src_w: usize,
    src_h: usize,
    y: usize,
    tmp: &mut [f32],
    out: &mut [f32],
) {
    let cy = 2 * y as isize;
    // Vertical pass over the source row pair centred on 2y.
    for x in 0..src_w {
        let mut acc = 0.0f32;
        for (k, w) in BINOMIAL_TAPS.iter().enumerate() {
            let yy = clamp_index(cy + k as isize - 2, src_h);
            acc += w * src_plane[yy * src_w + x];
        }
        tmp[x] = acc;
    }
    for (x, o) in out.iter_mut().enumerate() {
        let cx = 2 * x as isize;
        let mut acc = 0.0f32;
        for (k, w) in BINOMIAL_TAPS.iter().enumerate() {
            acc += w * tmp[clamp_index(cx + k as isize - 2, src_w)];
        }
        *o = acc;
    }
}

/// Bilinear 2x upsample of one fine row from a coarse plane.
///
/// Fine sample `x` maps to coarse coordinate `x / 2`; indices clamp at the
/// coarse edge, so a constant plane upsamples to the same constant exactly.
pub(crate) fn upsample_row(coarse: &[f32], coarse_w: usize, coarse_h: usize, y: usize, out: &mut [f32]) {
    let j0 = (y / 2).min(coarse_h - 1);
    let j1 = (j0 + 1).min(coarse_h - 1);
    let wy = if y % 2 == 1 { 0.5f32 } else { 0.0 };
    let row0 = &coarse[j0 * coarse_w..(j0 + 1) * coarse_w];
    let row1 = &coarse[j1 * coarse_w..(j1 + 1) * coarse_w];
    for (x, o) in out.iter_mut().enumerate() {
        let i0 = (x / 2).min(coarse_w - 1);
        let i1 = (i0 + 1).min(coarse_w - 1);
        let wx = if x % 2 == 1 { 0.5f32 } else { 0.0 };
        let top = (1.0 - wx) * row0[i0] + wx * row0[i1];
        let bottom = (1.0 - wx) * row1[i0] + wx * row1[i1];
        *o = (1.0 - wy) * top + wy * bottom;
    }
}

/// Split a row index over a stack of planes into `(plane, y)`.
#[inline]
pub(crate) fn plane_row(row: usize, height: usize) -> (usize, usize) {
    (row / height, row % height)
}

/// Check that a binding holds exactly `extent.len()` samples.
pub(crate) fn expect_len(kernel: &'static str, what: &str, extent: Extent, have: usize) -> Result<()> {
    if extent.len() != have {
        return Err(EngineError::KernelFailed {
            kernel,
            message: format!(
                "{what} binding holds {have} samples, expected {} ({}x{}x{})",
                extent.len(),
                extent.width,
                extent.height,
                extent.planes
            ),
        });
    }
    Ok(())
}

/// Check that the launch grid matches the extent the kernel was built for.
pub(crate) fn expect_work(kernel: &'static str, expected: Extent, work: Extent) -> Result<()> {
    if expected != work {
        return Err(EngineError::KernelFailed {
            kernel,
            message: format!("launched over {work:?}, built for {expected:?}"),
        });
    }
    Ok(())
}
