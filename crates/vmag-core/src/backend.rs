//! Compute device contract.
//!
//! A [`ComputeDevice`] owns raw buffer storage and runs [`ComputeKernel`]s
//! over it.  Everything above this trait (budgeting, ownership, ordering) is
//! handled by [`DeviceContext`](crate::context::DeviceContext); devices only
//! need to be correct for a single call at a time per buffer.

use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::types::Extent;

/// Device-unique buffer identifier, assigned by the resource manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub u64);

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElementType {
    F32,
    F64,
}

impl ElementType {
    #[inline]
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

/// Size and element type of a device allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferDesc {
    pub len: usize,
    pub elem: ElementType,
}

impl BufferDesc {
    pub const fn f32(len: usize) -> Self {
        Self {
            len,
            elem: ElementType::F32,
        }
    }

    pub const fn f64(len: usize) -> Self {
        Self {
            len,
            elem: ElementType::F64,
        }
    }

    #[inline]
    pub const fn byte_size(&self) -> usize {
        self.len * self.elem.size_bytes()
    }
}

/// Usage flags declared at allocation time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferUsage(u8);

impl BufferUsage {
    /// Host data may be uploaded into the buffer.
    pub const UPLOAD: Self = Self(0b001);
    /// Kernels may read and write the buffer.
    pub const STORAGE: Self = Self(0b010);
    /// Contents may be read back to the host.
    pub const READBACK: Self = Self(0b100);
    pub const ALL: Self = Self(0b111);

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn describe(self) -> String {
        let mut parts = Vec::new();
        if self.contains(Self::UPLOAD) {
            parts.push("upload");
        }
        if self.contains(Self::STORAGE) {
            parts.push("storage");
        }
        if self.contains(Self::READBACK) {
            parts.push("readback");
        }
        parts.join("|")
    }
}

impl std::ops::BitOr for BufferUsage {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Typed device storage.
#[derive(Debug)]
pub enum BufferData {
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl BufferData {
    /// Zero-filled storage for `desc`.
    pub fn zeroed(desc: BufferDesc) -> Self {
        match desc.elem {
            ElementType::F32 => Self::F32(vec![0.0; desc.len]),
            ElementType::F64 => Self::F64(vec![0.0; desc.len]),
        }
    }

    /// Overwrite every element with zero, keeping the allocation.
    pub fn clear(&mut self) {
        match self {
            Self::F32(v) => v.fill(0.0),
            Self::F64(v) => v.fill(0.0),
        }
    }

    pub fn desc(&self) -> BufferDesc {
        match self {
            Self::F32(v) => BufferDesc::f32(v.len()),
            Self::F64(v) => BufferDesc::f64(v.len()),
        }
    }

    pub fn as_f32(&self) -> Result<&[f32]> {
        match self {
            Self::F32(v) => Ok(v),
            Self::F64(_) => Err(element_mismatch(ElementType::F32)),
        }
    }

    pub fn as_f32_mut(&mut self) -> Result<&mut [f32]> {
        match self {
            Self::F32(v) => Ok(v),
            Self::F64(_) => Err(element_mismatch(ElementType::F32)),
        }
    }

    pub fn as_f64_mut(&mut self) -> Result<&mut [f64]> {
        match self {
            Self::F64(v) => Ok(v),
            Self::F32(_) => Err(element_mismatch(ElementType::F64)),
        }
    }
}

fn element_mismatch(expected: ElementType) -> EngineError {
    EngineError::InvariantViolation(format!("kernel expected a {expected:?} buffer binding"))
}

/// Buffers bound to one kernel launch.  A buffer may appear at most once.
#[derive(Clone, Debug, Default)]
pub struct Bindings {
    pub reads: Vec<BufferId>,
    pub writes: Vec<BufferId>,
}

impl Bindings {
    pub fn new(reads: impl Into<Vec<BufferId>>, writes: impl Into<Vec<BufferId>>) -> Self {
        Self {
            reads: reads.into(),
            writes: writes.into(),
        }
    }

    /// Reject bindings that alias the same buffer twice.
    pub fn check_unique(&self) -> Result<()> {
        let mut ids: Vec<BufferId> = self.reads.iter().chain(&self.writes).copied().collect();
        ids.sort_unstable();
        if let Some(pair) = ids.windows(2).find(|w| w[0] == w[1]) {
            return Err(EngineError::InvariantViolation(format!(
                "buffer {} bound more than once in a single launch",
                pair[0]
            )));
        }
        Ok(())
    }
}

/// Resolved buffer views handed to a kernel, in binding order.
pub struct KernelArgs<'a> {
    reads: Vec<&'a BufferData>,
    writes: Vec<&'a mut BufferData>,
}

impl<'a> KernelArgs<'a> {
    pub fn new(reads: Vec<&'a BufferData>, writes: Vec<&'a mut BufferData>) -> Self {
        Self { reads, writes }
    }

    /// Split into read-only and writable views after checking arity.
    pub fn split(
        &mut self,
        kernel: &'static str,
        reads: usize,
        writes: usize,
    ) -> Result<(&[&'a BufferData], &mut [&'a mut BufferData])> {
        if self.reads.len() != reads || self.writes.len() != writes {
            return Err(EngineError::KernelFailed {
                kernel,
                message: format!(
                    "expected {reads} read / {writes} write bindings, got {} / {}",
                    self.reads.len(),
                    self.writes.len()
                ),
            });
        }
        Ok((&self.reads, &mut self.writes))
    }
}

/// A data-parallel kernel over a planar grid.
pub trait ComputeKernel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Execute over `work`.  Must be deterministic for identical inputs.
    fn run(&self, args: &mut KernelArgs<'_>, work: Extent) -> Result<()>;
}

/// Descriptive device information for logs and reports.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub parallelism: usize,
}

/// Buffer pool counters reported by devices that recycle storage.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PoolSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub recycled: u64,
    pub overflows: u64,
}

impl PoolSnapshot {
    /// Hit rate as a percentage (0.0–100.0).
    pub fn hit_rate(&self) -> f64 {
        let total = (self.hits + self.misses) as f64;
        if total == 0.0 {
            0.0
        } else {
            self.hits as f64 / total * 100.0
        }
    }
}

/// Execution substrate for buffers and kernels.
///
/// All methods are synchronous; asynchrony is layered on top by
/// [`Stream`](crate::context::Stream).
pub trait ComputeDevice: Send + Sync {
    fn info(&self) -> DeviceInfo;

    /// Create zero-initialised storage for `id`.
    fn create_buffer(&self, id: BufferId, desc: BufferDesc) -> Result<()>;

    fn destroy_buffer(&self, id: BufferId) -> Result<()>;

    fn write_buffer(&self, id: BufferId, data: &[f32]) -> Result<()>;

    fn read_buffer(&self, id: BufferId) -> Result<Vec<f32>>;

    fn launch(&self, kernel: &dyn ComputeKernel, bindings: &Bindings, work: Extent) -> Result<()>;

    fn pool_snapshot(&self) -> Option<PoolSnapshot> {
        None
    }
}

/// Shared, type-erased kernel as submitted to a stream.
pub type SharedKernel = Arc<dyn ComputeKernel>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_flags_compose() {
        let usage = BufferUsage::UPLOAD | BufferUsage::STORAGE;
        assert!(usage.contains(BufferUsage::UPLOAD));
        assert!(usage.contains(BufferUsage::STORAGE));
        assert!(!usage.contains(BufferUsage::READBACK));
        assert_eq!(usage.describe(), "upload|storage");
    }

    #[test]
    fn aliased_bindings_are_rejected() {
        let b = Bindings::new(vec![BufferId(1), BufferId(2)], vec![BufferId(2)]);
        assert!(b.check_unique().is_err());
        Bindings::new(vec![BufferId(1)], vec![BufferId(2), BufferId(3)])
            .check_unique()
            .unwrap();
    }

    #[test]
    fn element_type_is_checked_on_access() {
        let mut data = BufferData::zeroed(BufferDesc::f64(4));
        assert!(data.as_f32().is_err());
        assert_eq!(data.as_f64_mut().unwrap().len(), 4);
        assert_eq!(data.desc().byte_size(), 32);
    }

    #[test]
    fn split_checks_arity() {
        let a = BufferData::zeroed(BufferDesc::f32(2));
        let mut b = BufferData::zeroed(BufferDesc::f32(2));
        let mut args = KernelArgs::new(vec![&a], vec![&mut b]);
        assert!(args.split("bind_check", 2, 1).is_err());
        let (reads, writes) = args.split("bind_check", 1, 1).unwrap();
        assert_eq!(reads.len(), 1);
        assert_eq!(writes.len(), 1);
    }
}
