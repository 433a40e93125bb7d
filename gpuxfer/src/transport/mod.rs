//! Transport interfaces and endpoints.
//!
//! An interface belongs to one worker and owns the signal pool and queue
//! for every copy its endpoints issue. Endpoints share the interface state
//! through `Rc`, so neither is `Send`: all issue and progress calls for an
//! interface happen on the worker's thread.

pub mod copy;
pub mod ipc;

use crate::completion::Completion;
use crate::config::SignalPoolConfig;
use crate::device::DeviceDriver;
use crate::error::{Result, Status, XferError};
use crate::signal::{SignalPool, SignalQueue, dispatch_fired};
use crate::stats::IfaceStats;
use crate::types::EpOp;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use copy::{CopyEp, CopyIface};
pub use ipc::{IpcEp, IpcIface};

/// Operations an interface supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IfaceCaps {
    pub put_short: bool,
    pub get_short: bool,
    pub put_zcopy: bool,
    pub get_zcopy: bool,
    /// Endpoints are created from the peer's interface address alone.
    pub connect_to_iface: bool,
    pub pending: bool,
}

/// Size limits of one operation family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpLimits {
    pub max_short: usize,
    pub min_zcopy: usize,
    pub max_zcopy: usize,
    pub opt_zcopy_align: usize,
    pub align_mtu: usize,
    pub max_iov: usize,
}

impl OpLimits {
    fn zcopy(max_short: usize) -> Self {
        Self {
            max_short,
            min_zcopy: 0,
            max_zcopy: usize::MAX,
            opt_zcopy_align: 1,
            align_mtu: 1,
            max_iov: 1,
        }
    }
}

/// Bandwidth in bytes per second.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bandwidth {
    pub dedicated: f64,
    pub shared: f64,
}

/// What [`Transport::query`] reports.
#[derive(Debug, Clone, PartialEq)]
pub struct IfaceAttr {
    pub caps: IfaceCaps,
    pub put: OpLimits,
    pub get: OpLimits,
    /// Seconds.
    pub latency: f64,
    pub bandwidth: Bandwidth,
    /// Seconds.
    pub overhead: f64,
    pub iface_addr_len: usize,
    pub device_addr_len: usize,
    pub ep_addr_len: usize,
}

/// What [`Transport::estimate_perf`] reports. Times are in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct PerfAttr {
    pub bandwidth: Bandwidth,
    pub send_pre_overhead: f64,
    pub send_post_overhead: f64,
    pub recv_overhead: f64,
    pub latency: f64,
    pub max_inflight_eps: usize,
}

/// Operations common to every interface.
pub trait Transport {
    fn name(&self) -> &'static str;

    fn query(&self) -> IfaceAttr;

    /// Performance figures, for `op` when given.
    fn estimate_perf(&self, op: Option<EpOp>) -> PerfAttr;

    /// Retire finished copies and run their completions. Returns the number
    /// of descriptors retired.
    fn progress(&self) -> usize;

    /// `Done` if nothing is outstanding, `InProgress` otherwise. Completion
    /// tokens are not supported.
    fn flush(&self, completion: Option<&Completion>) -> Result<Status>;

    /// Identity other processes use to reach this interface.
    fn address(&self) -> u64;

    fn is_reachable(&self, address: u64) -> bool;

    /// Copies issued and not yet retired.
    fn outstanding(&self) -> usize;

    fn stats(&self) -> IfaceStats;

    /// The concrete interface, for callers that need its endpoints.
    fn as_any(&self) -> &dyn Any;
}

impl dyn Transport {
    /// Borrow the interface as `T` if that is what it is.
    ///
    /// Interfaces opened through the registry come back as trait objects;
    /// this recovers the type that can `connect`.
    pub fn downcast_ref<T: Transport + 'static>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Call `progress` until nothing is outstanding, yielding to the runtime
/// between polls. Returns the number of descriptors retired.
///
/// Polls with tiered backoff: spin for 1000 iterations, then yield for
/// 4000 iterations, then sleep 100µs until `timeout`.
pub async fn progress_until_idle(transport: &dyn Transport, timeout: Duration) -> Result<usize> {
    let start = Instant::now();
    let mut total = 0;
    let mut iter = 0u32;
    loop {
        total += transport.progress();
        if transport.outstanding() == 0 {
            return Ok(total);
        }
        if start.elapsed() > timeout {
            return Err(XferError::io(format!(
                "{}: {} copies still outstanding after {}ms",
                transport.name(),
                transport.outstanding(),
                timeout.as_millis()
            )));
        }
        if iter < 1000 {
            std::hint::spin_loop();
        } else if iter < 5000 {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(Duration::from_micros(100)).await;
        }
        iter = iter.saturating_add(1);
    }
}

/// Signal pool, queue and counters shared by an interface and its
/// endpoints.
pub(crate) struct IfaceCore {
    pub(crate) driver: Arc<dyn DeviceDriver>,
    pub(crate) pool: RefCell<SignalPool>,
    pub(crate) queue: RefCell<SignalQueue>,
    stats: Cell<IfaceStats>,
    name: &'static str,
}

impl IfaceCore {
    pub(crate) fn new(driver: Arc<dyn DeviceDriver>, pool: SignalPoolConfig, name: &'static str) -> Self {
        Self {
            pool: RefCell::new(SignalPool::new(Arc::clone(&driver), pool, name)),
            queue: RefCell::new(SignalQueue::new()),
            driver,
            stats: Cell::new(IfaceStats::default()),
            name,
        }
    }

    pub(crate) fn progress(&self) -> usize {
        let mut fired = Vec::new();
        let count = {
            let mut queue = self.queue.borrow_mut();
            if queue.is_empty() {
                return 0;
            }
            let mut pool = self.pool.borrow_mut();
            queue.progress(&mut pool, &mut fired)
        };
        if count > 0 {
            let mut stats = self.stats.get();
            stats.retired += count as u64;
            self.stats.set(stats);
        }
        // Completions may issue new copies, so run them with no borrows held.
        dispatch_fired(fired);
        count
    }

    pub(crate) fn flush(&self, completion: Option<&Completion>) -> Result<Status> {
        if completion.is_some() {
            return Err(XferError::Unsupported(format!("{}: flush with completion", self.name)));
        }
        let mut stats = self.stats.get();
        let status = if self.queue.borrow().is_empty() {
            stats.flush += 1;
            Status::Done
        } else {
            stats.flush_wait += 1;
            Status::InProgress
        };
        self.stats.set(stats);
        Ok(status)
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.queue.borrow().len()
    }

    pub(crate) fn stats(&self) -> IfaceStats {
        self.stats.get()
    }
}

impl Drop for IfaceCore {
    fn drop(&mut self) {
        let outstanding = self.queue.get_mut().len();
        if outstanding > 0 {
            tracing::warn!(iface = self.name, outstanding, "interface dropped with copies in flight");
        }
    }
}
