//! Core types, error taxonomy and device resource management for the vmag
//! motion-magnification engine.
//!
//! - [`types`]: frames, sequences, regions of interest.
//! - [`backend`]: the device and kernel contracts.
//! - [`host`]: the CPU device.
//! - [`context`]: the resource manager and in-order streams.

pub mod backend;
pub mod context;
pub mod error;
pub mod host;
pub mod types;

pub use backend::{BufferDesc, BufferUsage, ComputeDevice, ComputeKernel, KernelArgs};
pub use context::{BufferHandle, DeviceContext, DeviceTask, Stream};
pub use error::{EngineError, ErrorKind, Result};
pub use host::{FaultPlan, HostDevice};
pub use types::{Extent, Frame, FrameSequence, PixelFormat, Roi};
