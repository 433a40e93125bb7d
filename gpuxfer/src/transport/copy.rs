//! Copy transport: moves data between host and device memory inside one
//! process.

use crate::completion::Completion;
use crate::config::CopyIfaceConfig;
use crate::copy::{CopyDispatcher, CopyJob};
use crate::device::DeviceDriver;
use crate::error::{Result, Status, XferError};
use crate::memory::{Accessibility, probe};
use crate::stats::{EpStats, IfaceStats};
use crate::transport::{Bandwidth, IfaceAttr, IfaceCaps, IfaceCore, OpLimits, PerfAttr, Transport};
use crate::types::{Direction, EpOp, IoVec, RemoteKey};
use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub const COPY_TRANSPORT_NAME: &str = "copy";

/// Token distinguishing interfaces, unique within a node with high
/// probability.
fn generate_iface_id() -> u64 {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id() as u64;
    ((pid << 32) ^ nanos.rotate_left(17) ^ seq.wrapping_mul(0x9e37_79b9_7f4a_7c15)).max(1)
}

struct CopyShared {
    core: IfaceCore,
    config: CopyIfaceConfig,
    id: u64,
}

/// Per-worker copy interface.
pub struct CopyIface {
    shared: Rc<CopyShared>,
}

impl CopyIface {
    pub fn new(driver: Arc<dyn DeviceDriver>, config: CopyIfaceConfig) -> Self {
        let core = IfaceCore::new(driver, config.signal_pool, "copy signal objects");
        let id = generate_iface_id();
        tracing::debug!(iface = format_args!("dest:{id}"), "copy interface created");
        Self {
            shared: Rc::new(CopyShared { core, config, id }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn config(&self) -> &CopyIfaceConfig {
        &self.shared.config
    }

    /// Create an endpoint. The peer is always this interface.
    pub fn connect(&self) -> CopyEp {
        CopyEp {
            iface: Rc::clone(&self.shared),
            stats: Cell::new(EpStats::default()),
        }
    }
}

impl Transport for CopyIface {
    fn name(&self) -> &'static str {
        COPY_TRANSPORT_NAME
    }

    fn query(&self) -> IfaceAttr {
        let cfg = &self.shared.config;
        IfaceAttr {
            caps: IfaceCaps {
                put_short: true,
                get_short: true,
                put_zcopy: true,
                get_zcopy: true,
                connect_to_iface: true,
                pending: true,
            },
            put: OpLimits::zcopy(u32::MAX as usize),
            get: OpLimits::zcopy(u32::MAX as usize),
            latency: cfg.latency.as_secs_f64(),
            bandwidth: Bandwidth {
                dedicated: cfg.dedicated_bandwidth,
                shared: cfg.bandwidth,
            },
            overhead: 0.0,
            iface_addr_len: std::mem::size_of::<u64>(),
            device_addr_len: 0,
            ep_addr_len: 0,
        }
    }

    fn estimate_perf(&self, op: Option<EpOp>) -> PerfAttr {
        let cfg = &self.shared.config;
        let per_op = match op {
            Some(EpOp::PutShort) => cfg.put_short_bandwidth,
            Some(EpOp::GetShort) => cfg.get_short_bandwidth,
            Some(EpOp::PutZcopy) => cfg.put_zcopy_bandwidth,
            Some(EpOp::GetZcopy) => cfg.get_zcopy_bandwidth,
            None => cfg.bandwidth,
        };
        PerfAttr {
            bandwidth: Bandwidth {
                dedicated: cfg.dedicated_bandwidth,
                shared: if per_op < 1.0 { cfg.bandwidth } else { per_op },
            },
            send_pre_overhead: cfg.send_pre_overhead.as_secs_f64(),
            send_post_overhead: cfg.send_post_overhead.as_secs_f64(),
            recv_overhead: cfg.recv_overhead.as_secs_f64(),
            latency: cfg.latency.as_secs_f64(),
            max_inflight_eps: usize::MAX,
        }
    }

    fn progress(&self) -> usize {
        self.shared.core.progress()
    }

    fn flush(&self, completion: Option<&Completion>) -> Result<Status> {
        self.shared.core.flush(completion)
    }

    fn address(&self) -> u64 {
        self.shared.id
    }

    fn is_reachable(&self, address: u64) -> bool {
        address == self.shared.id
    }

    fn outstanding(&self) -> usize {
        self.shared.core.outstanding()
    }

    fn stats(&self) -> IfaceStats {
        self.shared.core.stats()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Endpoint of the copy transport.
pub struct CopyEp {
    iface: Rc<CopyShared>,
    stats: Cell<EpStats>,
}

impl CopyEp {
    pub fn stats(&self) -> EpStats {
        self.stats.get()
    }

    fn record<T>(&self, op: EpOp, bytes: usize, result: &Result<T>) {
        let mut stats = self.stats.get();
        stats.record(op, bytes);
        if result.is_err() {
            stats.errors += 1;
        }
        self.stats.set(stats);
    }

    /// Copy `buf` to `remote_addr` synchronously.
    ///
    /// # Safety
    /// `remote_addr` must be valid for `buf.len()` bytes of writes.
    pub unsafe fn put_short(&self, buf: &[u8], remote_addr: u64) -> Result<Status> {
        let driver = self.iface.core.driver.as_ref();
        let result = unsafe { driver.memcpy(remote_addr, buf.as_ptr() as u64, buf.len()) }
            .map(|()| Status::Done);
        self.record(EpOp::PutShort, buf.len(), &result);
        tracing::trace!(remote_addr = format_args!("0x{remote_addr:x}"), length = buf.len(), "PUT_SHORT");
        result
    }

    /// Copy from `remote_addr` into `buf` synchronously.
    ///
    /// # Safety
    /// `remote_addr` must be valid for `buf.len()` bytes of reads.
    pub unsafe fn get_short(&self, buf: &mut [u8], remote_addr: u64) -> Result<Status> {
        let driver = self.iface.core.driver.as_ref();
        let result = unsafe { driver.memcpy(buf.as_mut_ptr() as u64, remote_addr, buf.len()) }
            .map(|()| Status::Done);
        self.record(EpOp::GetShort, buf.len(), &result);
        tracing::trace!(remote_addr = format_args!("0x{remote_addr:x}"), length = buf.len(), "GET_SHORT");
        result
    }

    /// # Safety
    /// `iov` and `remote_addr` must be valid for the copied length until
    /// `completion` fires (or until the call returns, if it returns `Done`
    /// or an error).
    pub unsafe fn put_zcopy(
        &self,
        iov: &[IoVec],
        remote_addr: u64,
        key: &RemoteKey,
        completion: Option<&Completion>,
    ) -> Result<Status> {
        let result = unsafe { self.zcopy(remote_addr, iov, key, completion, Direction::Put) };
        self.record(EpOp::PutZcopy, IoVec::total_len(iov), &result);
        result
    }

    /// # Safety
    /// Same as [`put_zcopy`](Self::put_zcopy).
    pub unsafe fn get_zcopy(
        &self,
        iov: &[IoVec],
        remote_addr: u64,
        key: &RemoteKey,
        completion: Option<&Completion>,
    ) -> Result<Status> {
        let result = unsafe { self.zcopy(remote_addr, iov, key, completion, Direction::Get) };
        self.record(EpOp::GetZcopy, IoVec::total_len(iov), &result);
        result
    }

    unsafe fn zcopy(
        &self,
        remote_addr: u64,
        iov: &[IoVec],
        key: &RemoteKey,
        completion: Option<&Completion>,
        direction: Direction,
    ) -> Result<Status> {
        let size = IoVec::total_len(iov);
        if size == 0 {
            return Ok(Status::Done);
        }
        if iov.len() > 1 {
            return Err(XferError::InvalidParam(format!(
                "{} io vector entries, at most 1 supported",
                iov.len()
            )));
        }
        if !key.contains(remote_addr, size) {
            tracing::error!(
                remote_addr = format_args!("0x{remote_addr:x}"),
                size,
                "remote addr out of range"
            );
            return Err(XferError::out_of_range(remote_addr, size, key.address, key.length));
        }

        let local_addr = iov[0].ptr;
        let (dst, src) = match direction {
            Direction::Put => (remote_addr, local_addr),
            Direction::Get => (local_addr, remote_addr),
        };
        let cfg = &self.iface.config;
        let thresh = match direction {
            Direction::Put => cfg.h2d_thresh,
            Direction::Get => cfg.d2h_thresh,
        };
        let driver = self.iface.core.driver.as_ref();

        if cfg.enable_async_zcopy && size > thresh {
            let dst_region = probe(driver, dst, size)?;
            let src_region = probe(driver, src, size)?;
            if dst_region.access != Accessibility::Unknown && src_region.access != Accessibility::Unknown {
                let job = CopyJob {
                    dst,
                    dst_agent: dst_region.agent,
                    src,
                    src_agent: src_region.agent,
                    size,
                    mapped_base: 0,
                    completion: completion.cloned(),
                };
                let mut pool = self.iface.core.pool.borrow_mut();
                let mut queue = self.iface.core.queue.borrow_mut();
                let status = CopyDispatcher::new(driver, &mut pool, &mut queue).issue_single(job)?;
                tracing::trace!(%direction, size, "async zcopy issued");
                return Ok(status);
            }
            tracing::debug!(%direction, size, "buffer unknown to the device runtime, copying synchronously");
        }

        unsafe { driver.memcpy(dst, src, size) }?;
        tracing::trace!(%direction, size, "zcopy done synchronously");
        Ok(Status::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimDriver;

    fn setup(config: CopyIfaceConfig) -> (Arc<SimDriver>, CopyIface) {
        let drv = Arc::new(SimDriver::new(1));
        let iface = CopyIface::new(drv.clone(), config);
        (drv, iface)
    }

    #[test]
    fn test_ids_are_unique_and_reachable() {
        let (_drv, a) = setup(CopyIfaceConfig::default());
        let (_drv2, b) = setup(CopyIfaceConfig::default());
        assert_ne!(a.id(), b.id());
        assert!(a.is_reachable(a.address()));
        assert!(!a.is_reachable(b.address()));
    }

    #[test]
    fn test_estimate_perf_falls_back() {
        let cfg = CopyIfaceConfig {
            get_short_bandwidth: 0.0,
            ..CopyIfaceConfig::default()
        };
        let (_drv, iface) = setup(cfg.clone());
        assert_eq!(iface.estimate_perf(Some(EpOp::GetShort)).bandwidth.shared, cfg.bandwidth);
        assert_eq!(
            iface.estimate_perf(Some(EpOp::PutZcopy)).bandwidth.shared,
            cfg.put_zcopy_bandwidth
        );
        assert_eq!(iface.estimate_perf(None).bandwidth.shared, cfg.bandwidth);
        assert_eq!(iface.estimate_perf(None).max_inflight_eps, usize::MAX);
    }

    #[test]
    fn test_short_ops_copy() {
        let (drv, iface) = setup(CopyIfaceConfig::default());
        let ep = iface.connect();
        let mut dev = vec![0u8; 16];
        let dptr = drv.register_device(&mut dev, drv.gpu(0));

        let src = [5u8; 16];
        assert_eq!(unsafe { ep.put_short(&src, dptr) }.unwrap(), Status::Done);
        let mut back = [0u8; 16];
        assert_eq!(unsafe { ep.get_short(&mut back, dptr) }.unwrap(), Status::Done);
        assert_eq!(back, src);
        assert_eq!(ep.stats().put_short.bytes, 16);
        assert_eq!(ep.stats().get_short.ops, 1);
    }

    #[test]
    fn test_small_zcopy_is_synchronous() {
        let (drv, iface) = setup(CopyIfaceConfig::default());
        let ep = iface.connect();
        let mut dev = vec![9u8; 512];
        let dptr = drv.register_device(&mut dev, drv.gpu(0));
        let key = RemoteKey::new(dptr, 512, std::process::id());
        let mut host = vec![0u8; 512];
        let iov = [IoVec::new(host.as_mut_ptr() as u64, 512)];

        let st = unsafe { ep.get_zcopy(&iov, dptr, &key, None) }.unwrap();
        assert_eq!(st, Status::Done);
        assert_eq!(iface.outstanding(), 0);
        assert!(host.iter().all(|&b| b == 9));
    }

    #[test]
    fn test_large_zcopy_is_async() {
        let (drv, iface) = setup(CopyIfaceConfig::default());
        let ep = iface.connect();
        let len = 8192;
        let mut dev = vec![3u8; len];
        let mut host = vec![0u8; len];
        let dptr = drv.register_device(&mut dev, drv.gpu(0));
        let hptr = drv.register_host(&mut host);
        let key = RemoteKey::new(dptr, len, std::process::id());
        let comp = Completion::new();
        let iov = [IoVec::new(hptr, len)];

        let st = unsafe { ep.get_zcopy(&iov, dptr, &key, Some(&comp)) }.unwrap();
        assert_eq!(st, Status::InProgress);
        assert_eq!(iface.outstanding(), 1);
        assert_eq!(iface.flush(None).unwrap(), Status::InProgress);

        drv.complete_all();
        assert_eq!(iface.progress(), 1);
        assert!(comp.is_done());
        assert!(host.iter().all(|&b| b == 3));
        assert_eq!(iface.flush(None).unwrap(), Status::Done);
    }

    #[test]
    fn test_unknown_host_buffer_falls_back_to_sync() {
        let (drv, iface) = setup(CopyIfaceConfig::default());
        let ep = iface.connect();
        let len = 4096;
        let mut dev = vec![1u8; len];
        let dptr = drv.register_device(&mut dev, drv.gpu(0));
        let key = RemoteKey::new(dptr, len, std::process::id());
        let mut host = vec![0u8; len];
        let iov = [IoVec::new(host.as_mut_ptr() as u64, len)];

        let st = unsafe { ep.get_zcopy(&iov, dptr, &key, None) }.unwrap();
        assert_eq!(st, Status::Done);
        assert!(host.iter().all(|&b| b == 1));
    }

    #[test]
    fn test_zcopy_out_of_range() {
        let (drv, iface) = setup(CopyIfaceConfig::default());
        let ep = iface.connect();
        let mut dev = vec![0u8; 64];
        let dptr = drv.register_device(&mut dev, drv.gpu(0));
        let key = RemoteKey::new(dptr, 64, std::process::id());
        let iov = [IoVec::new(0x10, 128)];
        let err = unsafe { ep.put_zcopy(&iov, dptr, &key, None) }.unwrap_err();
        assert!(matches!(err, XferError::InvalidParam(_)));
        assert_eq!(ep.stats().errors, 1);
    }

    #[test]
    fn test_zero_length_iov_entries_are_done() {
        let (drv, iface) = setup(CopyIfaceConfig::default());
        let ep = iface.connect();
        let key = RemoteKey::new(0x1000, 16, std::process::id());
        let iov = [IoVec::new(0x10, 0), IoVec::new(0x20, 0)];
        assert_eq!(unsafe { ep.get_zcopy(&iov, 0x1000, &key, None) }.unwrap(), Status::Done);
        assert_eq!(unsafe { ep.put_zcopy(&iov, 0x1000, &key, None) }.unwrap(), Status::Done);
        assert_eq!(ep.stats().errors, 0);
        assert!(drv.issued().is_empty());

        let iov = [IoVec::new(0x10, 0), IoVec::new(0x20, 4)];
        let err = unsafe { ep.get_zcopy(&iov, 0x1000, &key, None) }.unwrap_err();
        assert!(matches!(err, XferError::InvalidParam(_)));
    }
}
