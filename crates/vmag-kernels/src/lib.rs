//! Data-parallel kernels of the magnification engine and the per-stage
//! drivers that submit them:
//!
//! - [`pyramid`]: binomial blur/decimate and Laplacian residual bands.
//! - [`temporal`]: the two-EMA band-pass recurrence over residual bands.
//! - [`reconstruct`]: amplification, pyramid collapse and output clamping.

pub mod pyramid;
pub mod reconstruct;
mod sampling;
pub mod temporal;

pub use pyramid::{FramePyramid, PyramidBuilder, PyramidLayout};
pub use reconstruct::{ReconstructedFrame, Reconstructor};
pub use sampling::{BINOMIAL_TAPS, RESIDUAL_BIAS};
pub use temporal::{TemporalCoefficients, TemporalFilter};
