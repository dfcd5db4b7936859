//! Resource manager: owned device buffers, memory budget, in-order streams.
//!
//! # Ownership
//!
//! Every allocation goes through [`DeviceContext::allocate`] and is tagged
//! with an owner string.  The returned [`BufferHandle`] is not `Clone`; it
//! is released exactly once, either explicitly via
//! [`DeviceContext::release`] or by the owner-wide sweep
//! [`DeviceContext::release_owner`] that orchestrators run on every terminal
//! path.  Releasing a handle that was already swept is a no-op.
//!
//! # Budget
//!
//! Live bytes are tracked atomically.  With a budget configured, a request
//! that would push live bytes past it fails fast with
//! [`EngineError::OutOfMemory`] before the device is touched.
//!
//! # Streams
//!
//! A [`Stream`] is an in-order command queue.  Uploads, kernel dispatches
//! and readbacks submitted to the same stream execute in submission order on
//! a blocking worker, so a readback can never overtake the write that
//! produced its data.  Each submission returns a [`DeviceTask`] future.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::backend::{
    Bindings, BufferDesc, BufferId, BufferUsage, ComputeDevice, DeviceInfo, PoolSnapshot,
    SharedKernel,
};
use crate::error::{EngineError, Result};
use crate::types::Extent;

// ─── Memory accounting ──────────────────────────────────────────────────────

/// Atomic live-byte counters.  Lock-free reads.
struct MemoryAccounting {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl MemoryAccounting {
    const fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn on_alloc(&self, bytes: usize) {
        let prev = self.current.fetch_add(bytes, Ordering::Relaxed);
        self.peak.fetch_max(prev + bytes, Ordering::Relaxed);
    }

    #[inline]
    fn on_free(&self, bytes: usize) {
        self.current.fetch_sub(bytes, Ordering::Relaxed);
    }

    #[inline]
    fn snapshot(&self) -> (usize, usize) {
        (
            self.current.load(Ordering::Relaxed),
            self.peak.load(Ordering::Relaxed),
        )
    }

    fn reset_peak(&self) {
        let current = self.current.load(Ordering::Relaxed);
        self.peak.store(current, Ordering::Relaxed);
    }
}

fn check_memory_budget(budget: Option<usize>, current: usize, requested: usize) -> Result<()> {
    let Some(budget_bytes) = budget.filter(|b| *b > 0) else {
        return Ok(());
    };
    let would_be = current.saturating_add(requested);
    if would_be <= budget_bytes {
        return Ok(());
    }
    Err(EngineError::OutOfMemory {
        budget_bytes,
        current_bytes: current,
        requested_bytes: requested,
        would_be_bytes: would_be,
    })
}

// ─── Handles ────────────────────────────────────────────────────────────────

/// Opaque reference to a live device allocation.
#[derive(Debug)]
pub struct BufferHandle {
    id: BufferId,
    desc: BufferDesc,
    usage: BufferUsage,
}

impl BufferHandle {
    #[inline]
    pub fn id(&self) -> BufferId {
        self.id
    }

    #[inline]
    pub fn desc(&self) -> BufferDesc {
        self.desc
    }

    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.desc.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.desc.len == 0
    }
}

struct LiveBuffer {
    owner: Arc<str>,
    bytes: usize,
}

/// Outcome of an owner-wide release sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReleaseSummary {
    pub released: usize,
    pub failed: usize,
}

/// Immutable snapshot of resource manager state for telemetry.
#[derive(Clone, Debug, PartialEq)]
pub struct HealthSnapshot {
    pub current_bytes: usize,
    pub peak_bytes: usize,
    pub budget_bytes: Option<usize>,
    pub outstanding_handles: usize,
    pub pool: Option<PoolSnapshot>,
}

// ─── Context ────────────────────────────────────────────────────────────────

/// Long-lived resource manager shared by every stage of a run.
pub struct DeviceContext {
    device: Arc<dyn ComputeDevice>,
    next_id: AtomicU64,
    live: Mutex<HashMap<BufferId, LiveBuffer>>,
    memory: MemoryAccounting,
    /// Budget in bytes, 0 = unlimited.
    budget: AtomicUsize,
}

impl DeviceContext {
    pub fn new(device: Arc<dyn ComputeDevice>) -> Arc<Self> {
        let info = device.info();
        info!(device = %info.name, parallelism = info.parallelism, "Device context created");
        Arc::new(Self {
            device,
            next_id: AtomicU64::new(1),
            live: Mutex::new(HashMap::new()),
            memory: MemoryAccounting::new(),
            budget: AtomicUsize::new(0),
        })
    }

    pub fn device_info(&self) -> DeviceInfo {
        self.device.info()
    }

    fn live_table(&self) -> Result<std::sync::MutexGuard<'_, HashMap<BufferId, LiveBuffer>>> {
        self.live
            .lock()
            .map_err(|_| EngineError::DeviceLost("handle registry lock poisoned".into()))
    }

    /// Set the live-memory budget in bytes.  `None` removes the limit.
    pub fn set_memory_budget(&self, budget_bytes: Option<usize>) {
        let raw = budget_bytes.unwrap_or(0);
        self.budget.store(raw, Ordering::Relaxed);
        info!(budget_bytes = raw, "Device memory budget set");
    }

    pub fn memory_budget(&self) -> Option<usize> {
        match self.budget.load(Ordering::Relaxed) {
            0 => None,
            b => Some(b),
        }
    }

    /// Fail with `OutOfMemory` if `bytes` more live memory would exceed the
    /// budget.  Nothing is reserved.
    pub fn check_headroom(&self, bytes: usize) -> Result<()> {
        let (current, _) = self.memory.snapshot();
        check_memory_budget(self.memory_budget(), current, bytes)
    }

    /// Allocate a zero-initialised buffer owned by `owner`.
    pub fn allocate(&self, owner: &str, desc: BufferDesc, usage: BufferUsage) -> Result<BufferHandle> {
        if desc.len == 0 {
            return Err(EngineError::Unsupported("zero-length device buffer".into()));
        }
        let bytes = desc.byte_size();

        // The registry lock serialises budget check and reservation.
        let mut live = self.live_table()?;
        let (current, _) = self.memory.snapshot();
        check_memory_budget(self.memory_budget(), current, bytes)?;

        let id = BufferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.device.create_buffer(id, desc)?;
        self.memory.on_alloc(bytes);
        live.insert(
            id,
            LiveBuffer {
                owner: Arc::from(owner),
                bytes,
            },
        );
        debug!(%id, owner, bytes, usage = %usage.describe(), "allocate");
        Ok(BufferHandle { id, desc, usage })
    }

    /// Release one handle.  Returns `false` if it was already swept.
    ///
    /// Device-side destroy failures are logged, never returned: the handle is
    /// considered released either way.
    pub fn release(&self, handle: BufferHandle) -> bool {
        self.release_id(handle.id)
    }

    fn release_id(&self, id: BufferId) -> bool {
        let entry = match self.live_table() {
            Ok(mut live) => live.remove(&id),
            Err(err) => {
                warn!(%id, error = %err, "release skipped");
                return false;
            }
        };
        let Some(entry) = entry else {
            debug!(%id, "release of already released buffer ignored");
            return false;
        };
        self.memory.on_free(entry.bytes);
        if let Err(err) = self.device.destroy_buffer(id) {
            warn!(%id, owner = %entry.owner, error = %err, "device buffer destroy failed");
        }
        true
    }

    /// Release every live handle tagged with `owner`, continuing past
    /// failures.
    pub fn release_owner(&self, owner: &str) -> ReleaseSummary {
        let ids: Vec<BufferId> = match self.live_table() {
            Ok(live) => live
                .iter()
                .filter(|(_, b)| &*b.owner == owner)
                .map(|(id, _)| *id)
                .collect(),
            Err(err) => {
                warn!(owner, error = %err, "owner sweep skipped");
                return ReleaseSummary {
                    released: 0,
                    failed: 1,
                };
            }
        };
        let mut summary = ReleaseSummary::default();
        for id in ids {
            if self.release_id(id) {
                summary.released += 1;
            } else {
                summary.failed += 1;
            }
        }
        if summary.released > 0 {
            debug!(owner, released = summary.released, "owner sweep");
        }
        summary
    }

    /// Number of handles allocated and not yet released.
    pub fn outstanding_handles(&self) -> usize {
        self.live.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn outstanding_for(&self, owner: &str) -> usize {
        self.live
            .lock()
            .map(|l| l.values().filter(|b| &*b.owner == owner).count())
            .unwrap_or(0)
    }

    /// Current and peak live bytes.
    #[inline]
    pub fn memory_usage(&self) -> (usize, usize) {
        self.memory.snapshot()
    }

    /// Restart peak tracking from the current live byte count.
    pub fn reset_peak(&self) {
        self.memory.reset_peak();
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        let (current_bytes, peak_bytes) = self.memory.snapshot();
        HealthSnapshot {
            current_bytes,
            peak_bytes,
            budget_bytes: self.memory_budget(),
            outstanding_handles: self.outstanding_handles(),
            pool: self.device.pool_snapshot(),
        }
    }

    /// Report pool and memory statistics.
    pub fn report_pool_stats(&self) {
        let snap = self.health_snapshot();
        let pool = snap.pool.unwrap_or_default();
        info!(
            hits = pool.hits,
            misses = pool.misses,
            recycled = pool.recycled,
            overflows = pool.overflows,
            hit_rate = pool.hit_rate(),
            current_bytes = snap.current_bytes,
            peak_bytes = snap.peak_bytes,
            outstanding = snap.outstanding_handles,
            "Buffer pool report"
        );
    }

    /// Open a named in-order command stream.  Requires a tokio runtime.
    pub fn create_stream(&self, name: &'static str) -> Result<Stream> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            EngineError::Unsupported(format!("stream `{name}` needs a running tokio runtime"))
        })?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let device = Arc::clone(&self.device);
        runtime.spawn(async move {
            while let Some(job) = rx.recv().await {
                let device = Arc::clone(&device);
                // A panicking job drops its reply sender; the waiting task
                // then resolves to DeviceLost.
                if let Err(err) = tokio::task::spawn_blocking(move || job(device.as_ref())).await {
                    warn!(stream = name, error = %err, "stream job aborted");
                }
            }
            debug!(stream = name, "stream worker drained");
        });
        Ok(Stream { name, tx })
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        let leaked = self.live.get_mut().map(|l| l.len()).unwrap_or(0);
        if leaked > 0 {
            warn!(leaked, "device context dropped with outstanding handles");
        }
    }
}

// ─── Streams ────────────────────────────────────────────────────────────────

type Job = Box<dyn FnOnce(&dyn ComputeDevice) + Send + 'static>;

/// Pending result of a stream submission.
#[must_use = "device tasks report their failure only when awaited"]
pub struct DeviceTask<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> DeviceTask<T> {
    fn ready(result: Result<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl<T> Future for DeviceTask<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| {
            res.unwrap_or_else(|_| {
                Err(EngineError::DeviceLost(
                    "stream worker dropped a pending operation".into(),
                ))
            })
        })
    }
}

/// In-order command queue bound to the context's device.
pub struct Stream {
    name: &'static str,
    tx: mpsc::UnboundedSender<Job>,
}

impl Stream {
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn submit<T, F>(&self, op: F) -> DeviceTask<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ComputeDevice) -> Result<T> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let job: Job = Box::new(move |device| {
            let _ = reply.send(op(device));
        });
        if self.tx.send(job).is_err() {
            return DeviceTask::ready(Err(EngineError::DeviceLost(format!(
                "stream `{}` worker has stopped",
                self.name
            ))));
        }
        DeviceTask { rx }
    }

    /// Copy host samples into `handle`.
    pub fn upload(&self, handle: &BufferHandle, data: Vec<f32>) -> DeviceTask<()> {
        if !handle.usage.contains(BufferUsage::UPLOAD) {
            return DeviceTask::ready(Err(EngineError::Unsupported(format!(
                "buffer {} was not allocated for upload ({})",
                handle.id,
                handle.usage.describe()
            ))));
        }
        if data.len() != handle.desc.len {
            return DeviceTask::ready(Err(EngineError::Upload(format!(
                "buffer {} holds {} elements, got {}",
                handle.id,
                handle.desc.len,
                data.len()
            ))));
        }
        let id = handle.id;
        self.submit(move |device| {
            device
                .write_buffer(id, &data)
                .map_err(|err| EngineError::Upload(format!("buffer {id}: {err}")))
        })
    }

    /// Launch `kernel` over `work` once every earlier submission completed.
    pub fn dispatch(&self, kernel: SharedKernel, bindings: Bindings, work: Extent) -> DeviceTask<()> {
        self.submit(move |device| device.launch(kernel.as_ref(), &bindings, work))
    }

    /// Copy `handle` back to the host.
    pub fn readback(&self, handle: &BufferHandle) -> DeviceTask<Vec<f32>> {
        if !handle.usage.contains(BufferUsage::READBACK) {
            return DeviceTask::ready(Err(EngineError::Unsupported(format!(
                "buffer {} was not allocated for readback ({})",
                handle.id,
                handle.usage.describe()
            ))));
        }
        let id = handle.id;
        self.submit(move |device| {
            device
                .read_buffer(id)
                .map_err(|err| EngineError::Readback(format!("buffer {id}: {err}")))
        })
    }

    /// Resolve once every earlier submission has executed.
    pub fn synchronize(&self) -> DeviceTask<()> {
        self.submit(|_| Ok(()))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
