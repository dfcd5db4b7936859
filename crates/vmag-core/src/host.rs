//! CPU compute device.
//!
//! Buffers live in host memory behind per-buffer `RwLock`s; kernels run on a
//! dedicated rayon pool.  Released storage is kept in a bounded pool keyed by
//! exact descriptor so steady-state frames allocate nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use crate::backend::{
    Bindings, BufferData, BufferDesc, BufferId, ComputeDevice, ComputeKernel, DeviceInfo,
    KernelArgs, PoolSnapshot,
};
use crate::error::{EngineError, Result};
use crate::types::Extent;

const MAX_PER_BUCKET: usize = 16;

/// Deterministic failure injection for exercising error paths.
#[derive(Clone, Debug, Default)]
pub struct FaultPlan {
    /// Fail the N-th kernel launch (1-based, counted across all kernels).
    pub fail_launch_at: Option<u64>,
    /// Fail every launch of the kernel with this name.
    pub fail_kernel: Option<&'static str>,
    /// Fail the N-th buffer write (1-based).
    pub fail_write_at: Option<u64>,
    /// Fail the N-th buffer read (1-based).
    pub fail_read_at: Option<u64>,
    /// Report an error from every `destroy_buffer` call (storage is still freed).
    pub fail_destroy: bool,
}

/// Lock-free pool access counters.
#[derive(Default)]
struct PoolStats {
    hits: AtomicU64,
    misses: AtomicU64,
    recycled: AtomicU64,
    overflows: AtomicU64,
}

struct StoragePool {
    buckets: HashMap<BufferDesc, Vec<BufferData>>,
}

impl StoragePool {
    fn new() -> Self {
        Self {
            buckets: HashMap::new(),
        }
    }

    fn take(&mut self, desc: BufferDesc) -> Option<BufferData> {
        let stack = self.buckets.get_mut(&desc)?;
        let buf = stack.pop()?;
        if stack.is_empty() {
            self.buckets.remove(&desc);
        }
        Some(buf)
    }

    /// Returns the buffer back when its bucket is full.
    fn put(&mut self, buf: BufferData) -> Option<BufferData> {
        let stack = self.buckets.entry(buf.desc()).or_default();
        if stack.len() >= MAX_PER_BUCKET {
            return Some(buf);
        }
        stack.push(buf);
        None
    }

    fn total_buffers(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }
}

enum Guard<'a> {
    Read(BufferId, RwLockReadGuard<'a, BufferData>),
    Write(BufferId, RwLockWriteGuard<'a, BufferData>),
}

/// Host-memory implementation of [`ComputeDevice`].
pub struct HostDevice {
    buffers: Mutex<HashMap<BufferId, Arc<RwLock<BufferData>>>>,
    pool: Mutex<StoragePool>,
    stats: PoolStats,
    threads: rayon::ThreadPool,
    faults: FaultPlan,
    launches: AtomicU64,
    writes: AtomicU64,
    reads: AtomicU64,
}

impl HostDevice {
    /// Device using one worker per available core.
    pub fn new() -> Result<Self> {
        Self::build(0, FaultPlan::default())
    }

    /// Device with an explicit worker count (`0` = one per core).
    pub fn with_threads(threads: usize) -> Result<Self> {
        Self::build(threads, FaultPlan::default())
    }

    /// Device that fails according to `faults`.
    pub fn with_faults(faults: FaultPlan) -> Result<Self> {
        Self::build(0, faults)
    }

    fn build(threads: usize, faults: FaultPlan) -> Result<Self> {
        let threads = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("vmag-host-{i}"))
            .build()
            .map_err(|e| EngineError::DeviceLost(format!("failed to start host workers: {e}")))?;
        info!(workers = threads.current_num_threads(), "Host compute device ready");
        Ok(Self {
            buffers: Mutex::new(HashMap::new()),
            pool: Mutex::new(StoragePool::new()),
            stats: PoolStats::default(),
            threads,
            faults,
            launches: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
        })
    }

    fn lookup(&self, id: BufferId) -> Result<Arc<RwLock<BufferData>>> {
        let buffers = self
            .buffers
            .lock()
            .map_err(|_| EngineError::DeviceLost("buffer table lock poisoned".into()))?;
        buffers
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownBuffer(id.0))
    }

    /// Number of storage blocks currently parked in the pool.
    pub fn pooled_buffers(&self) -> usize {
        self.pool.lock().map(|p| p.total_buffers()).unwrap_or(0)
    }

    fn injected(counter: &AtomicU64, at: Option<u64>) -> bool {
        let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
        at == Some(n)
    }
}

fn poisoned(id: BufferId) -> EngineError {
    EngineError::DeviceLost(format!("buffer {id} lock poisoned by a failed kernel"))
}

impl ComputeDevice for HostDevice {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: "host".into(),
            parallelism: self.threads.current_num_threads(),
        }
    }

    fn create_buffer(&self, id: BufferId, desc: BufferDesc) -> Result<()> {
        let storage = {
            let mut pool = self
                .pool
                .lock()
                .map_err(|_| EngineError::DeviceLost("storage pool lock poisoned".into()))?;
            pool.take(desc)
        };
        let storage = match storage {
            Some(mut buf) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                buf.clear();
                buf
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                BufferData::zeroed(desc)
            }
        };
        let mut buffers = self
            .buffers
            .lock()
            .map_err(|_| EngineError::DeviceLost("buffer table lock poisoned".into()))?;
        if buffers.contains_key(&id) {
            return Err(EngineError::InvariantViolation(format!(
                "buffer {id} created twice"
            )));
        }
        buffers.insert(id, Arc::new(RwLock::new(storage)));
        Ok(())
    }

    fn destroy_buffer(&self, id: BufferId) -> Result<()> {
        let entry = self
            .buffers
            .lock()
            .map_err(|_| EngineError::DeviceLost("buffer table lock poisoned".into()))?
            .remove(&id)
            .ok_or(EngineError::UnknownBuffer(id.0))?;

        // A kernel still holding the lock keeps its own Arc; storage is only
        // recycled once nobody else references it.
        if let Ok(lock) = Arc::try_unwrap(entry) {
            if let Ok(storage) = lock.into_inner() {
                let rejected = self
                    .pool
                    .lock()
                    .map(|mut pool| pool.put(storage))
                    .unwrap_or(None);
                if rejected.is_some() {
                    self.stats.overflows.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.recycled.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if self.faults.fail_destroy {
            return Err(EngineError::DeviceLost(format!(
                "injected release fault for buffer {id}"
            )));
        }
        Ok(())
    }

    fn write_buffer(&self, id: BufferId, data: &[f32]) -> Result<()> {
        if Self::injected(&self.writes, self.faults.fail_write_at) {
            return Err(EngineError::DeviceLost(format!(
                "injected write fault for buffer {id}"
            )));
        }
        let entry = self.lookup(id)?;
        let mut storage = entry.write().map_err(|_| poisoned(id))?;
        let dst = storage.as_f32_mut()?;
        if dst.len() != data.len() {
            return Err(EngineError::BufferTooSmall {
                need: dst.len(),
                have: data.len(),
            });
        }
        dst.copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, id: BufferId) -> Result<Vec<f32>> {
        if Self::injected(&self.reads, self.faults.fail_read_at) {
            return Err(EngineError::DeviceLost(format!(
                "injected read fault for buffer {id}"
            )));
        }
        let entry = self.lookup(id)?;
        let storage = entry.read().map_err(|_| poisoned(id))?;
        Ok(storage.as_f32()?.to_vec())
    }

    fn launch(&self, kernel: &dyn ComputeKernel, bindings: &Bindings, work: Extent) -> Result<()> {
        let launch_no = self.launches.fetch_add(1, Ordering::Relaxed) + 1;
        if self.faults.fail_launch_at == Some(launch_no)
            || self.faults.fail_kernel == Some(kernel.name())
        {
            return Err(EngineError::KernelFailed {
                kernel: kernel.name(),
                message: format!("injected fault on launch {launch_no}"),
            });
        }
        bindings.check_unique()?;

        let mut entries: Vec<(BufferId, bool, Arc<RwLock<BufferData>>)> = bindings
            .reads
            .iter()
            .map(|id| (*id, false))
            .chain(bindings.writes.iter().map(|id| (*id, true)))
            .map(|(id, write)| self.lookup(id).map(|entry| (id, write, entry)))
            .collect::<Result<_>>()?;

        // Global lock order by id keeps concurrent launches on different
        // streams deadlock-free.
        entries.sort_unstable_by_key(|(id, _, _)| *id);
        let mut guards = Vec::with_capacity(entries.len());
        for (id, write, entry) in &entries {
            let guard = if *write {
                Guard::Write(*id, entry.write().map_err(|_| poisoned(*id))?)
            } else {
                Guard::Read(*id, entry.read().map_err(|_| poisoned(*id))?)
            };
            guards.push(guard);
        }

        let mut reads: Vec<(usize, &BufferData)> = Vec::with_capacity(bindings.reads.len());
        let mut writes: Vec<(usize, &mut BufferData)> = Vec::with_capacity(bindings.writes.len());
        for guard in guards.iter_mut() {
            match guard {
                Guard::Read(id, g) => {
                    let pos = bindings.reads.iter().position(|r| *r == *id).unwrap_or(0);
                    reads.push((pos, &**g));
                }
                Guard::Write(id, g) => {
                    let pos = bindings.writes.iter().position(|w| *w == *id).unwrap_or(0);
                    writes.push((pos, &mut **g));
                }
            }
        }
        reads.sort_unstable_by_key(|(pos, _)| *pos);
        writes.sort_unstable_by_key(|(pos, _)| *pos);

        let mut args = KernelArgs::new(
            reads.into_iter().map(|(_, r)| r).collect(),
            writes.into_iter().map(|(_, w)| w).collect(),
        );
        debug!(kernel = kernel.name(), launch_no, ?work, "launch");
        self.threads.install(|| kernel.run(&mut args, work))
    }

    fn pool_snapshot(&self) -> Option<PoolSnapshot> {
        Some(PoolSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            recycled: self.stats.recycled.load(Ordering::Relaxed),
            overflows: self.stats.overflows.load(Ordering::Relaxed),
        })
    }
}
