//! IPC transport: copies between this process and device memory exported
//! by other processes on the node.

use crate::completion::Completion;
use crate::config::IpcIfaceConfig;
use crate::copy::{CopyDispatcher, CopyJob, MultiEngine};
use crate::device::DeviceDriver;
use crate::error::{Result, Status, XferError};
use crate::memory::{Accessibility, RemoteHandleCache, classify, probe};
use crate::stats::{EpStats, IfaceStats};
use crate::transport::{Bandwidth, IfaceAttr, IfaceCaps, IfaceCore, OpLimits, PerfAttr, Transport};
use crate::types::{Direction, EpOp, IoVec, ProcessId, RemoteKey};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

pub const IPC_TRANSPORT_NAME: &str = "ipc";

struct IpcShared {
    core: IfaceCore,
    config: IpcIfaceConfig,
    pid: ProcessId,
    copy_on_engine: bool,
}

/// Per-worker IPC interface. Its address is the process id.
pub struct IpcIface {
    shared: Rc<IpcShared>,
}

impl IpcIface {
    pub fn new(driver: Arc<dyn DeviceDriver>, config: IpcIfaceConfig) -> Self {
        let copy_on_engine = driver.supports_copy_on_engine();
        if config.enable_multi_sdma && !copy_on_engine {
            tracing::debug!("driver cannot copy on a given engine, multi-SDMA disabled");
        }
        let core = IfaceCore::new(driver, config.signal_pool, "ipc signal objects");
        Self {
            shared: Rc::new(IpcShared {
                core,
                config,
                pid: std::process::id(),
                copy_on_engine,
            }),
        }
    }

    pub fn config(&self) -> &IpcIfaceConfig {
        &self.shared.config
    }

    /// True if large copies are split across several engines.
    pub fn multi_sdma(&self) -> bool {
        self.shared.multi_sdma()
    }

    /// Create an endpoint to the interface of process `remote_pid`.
    pub fn connect(&self, remote_pid: ProcessId) -> IpcEp {
        let name = format!("dest:{remote_pid}");
        tracing::debug!(cache = %name, "ipc endpoint created");
        IpcEp {
            cache: RefCell::new(RemoteHandleCache::new(name, Arc::clone(&self.shared.core.driver))),
            iface: Rc::clone(&self.shared),
            remote_pid,
            stats: Cell::new(EpStats::default()),
        }
    }
}

impl IpcShared {
    fn multi_sdma(&self) -> bool {
        self.config.enable_multi_sdma && self.copy_on_engine
    }
}

impl Transport for IpcIface {
    fn name(&self) -> &'static str {
        IPC_TRANSPORT_NAME
    }

    fn query(&self) -> IfaceAttr {
        let cfg = &self.shared.config;
        IfaceAttr {
            caps: IfaceCaps {
                put_zcopy: true,
                get_zcopy: true,
                connect_to_iface: true,
                pending: true,
                ..IfaceCaps::default()
            },
            put: OpLimits::zcopy(0),
            get: OpLimits::zcopy(0),
            latency: cfg.latency.as_secs_f64(),
            bandwidth: Bandwidth {
                dedicated: 0.0,
                shared: cfg.bandwidth,
            },
            overhead: 0.0,
            iface_addr_len: std::mem::size_of::<ProcessId>(),
            device_addr_len: 0,
            ep_addr_len: 0,
        }
    }

    fn estimate_perf(&self, _op: Option<EpOp>) -> PerfAttr {
        let cfg = &self.shared.config;
        PerfAttr {
            bandwidth: Bandwidth {
                dedicated: 0.0,
                shared: cfg.bandwidth,
            },
            send_pre_overhead: 0.0,
            send_post_overhead: 0.0,
            recv_overhead: 0.0,
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
        self.shared.pid as u64
    }

    /// Any other process on the node. Copies to ourselves go through the
    /// copy transport.
    fn is_reachable(&self, address: u64) -> bool {
        address != 0 && address <= ProcessId::MAX as u64 && address != self.address()
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

/// Endpoint to one peer process. Keeps the peer's memory mapped until the
/// endpoint is dropped.
pub struct IpcEp {
    iface: Rc<IpcShared>,
    remote_pid: ProcessId,
    cache: RefCell<RemoteHandleCache>,
    stats: Cell<EpStats>,
}

impl IpcEp {
    pub fn remote_pid(&self) -> ProcessId {
        self.remote_pid
    }

    /// Number of remote registrations currently mapped.
    pub fn mapped_regions(&self) -> usize {
        self.cache.borrow().len()
    }

    pub fn stats(&self) -> EpStats {
        self.stats.get()
    }

    /// Copy the local buffer `iov` to `remote_addr` inside `key`.
    ///
    /// # Safety
    /// `iov` must describe memory valid for its length until `completion`
    /// fires (or until the call returns, if it returns `Done` or an error).
    pub unsafe fn put_zcopy(
        &self,
        iov: &[IoVec],
        remote_addr: u64,
        key: &RemoteKey,
        completion: Option<&Completion>,
    ) -> Result<Status> {
        let result = unsafe { self.zcopy(remote_addr, iov, key, completion, Direction::Put) };
        self.record(EpOp::PutZcopy, iov, &result);
        tracing::trace!(
            remote_addr = format_args!("0x{remote_addr:x}"),
            length = IoVec::total_len(iov),
            "PUT_ZCOPY"
        );
        result
    }

    /// Copy from `remote_addr` inside `key` into the local buffer `iov`.
    ///
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
        self.record(EpOp::GetZcopy, iov, &result);
        tracing::trace!(
            remote_addr = format_args!("0x{remote_addr:x}"),
            length = IoVec::total_len(iov),
            "GET_ZCOPY"
        );
        result
    }

    fn record(&self, op: EpOp, iov: &[IoVec], result: &Result<Status>) {
        let mut stats = self.stats.get();
        stats.record(op, IoVec::total_len(iov));
        if result.is_err() {
            stats.errors += 1;
        }
        self.stats.set(stats);
    }

    /// One-sided copy between a local buffer and a peer's registration.
    ///
    /// # Safety
    /// Same as [`put_zcopy`](Self::put_zcopy).
    pub unsafe fn zcopy(
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
        let local_addr = iov[0].ptr;
        let driver = self.iface.core.driver.as_ref();

        if !key.contains(remote_addr, size) {
            tracing::error!(
                remote_addr = format_args!("0x{remote_addr:x}"),
                size,
                key_addr = format_args!("0x{:x}", key.address),
                key_len = key.length,
                "remote addr out of range"
            );
            return Err(XferError::out_of_range(remote_addr, size, key.address, key.length));
        }

        let local = classify(driver, local_addr, size).inspect_err(|_| {
            tracing::error!(
                local_addr = format_args!("0x{local_addr:x}"),
                size,
                "local addr is not device runtime memory"
            );
        })?;

        let remote_base = self.cache.borrow_mut().get_or_map(key)?;
        let remote_copy_addr = remote_base + (remote_addr - key.address);

        let remote = match probe(driver, remote_copy_addr, size) {
            Ok(region) if region.access != Accessibility::Unknown => region,
            other => {
                let reason = match other {
                    Err(e) => e.to_string(),
                    Ok(_) => "mapping not known to the device runtime".to_string(),
                };
                tracing::error!(
                    remote_copy_addr = format_args!("0x{remote_copy_addr:x}"),
                    size,
                    %reason,
                    "remote addr is not device runtime memory"
                );
                return Err(XferError::invalid_address(remote_copy_addr, size, reason));
            }
        };

        let remote_agent = if remote.agent.is_null() {
            // The owning GPU is not visible to this process; let the local
            // agent drive the copy.
            local.agent
        } else {
            let gpus = driver.gpu_agents();
            if let Err(e) = driver.allow_access(&gpus, local.base) {
                tracing::error!(
                    remote_addr = format_args!("0x{remote_addr:x}"),
                    agent = %remote.agent,
                    error = %e,
                    "failed to enable direct access"
                );
                return Err(XferError::invalid_address(
                    local.base,
                    local.len,
                    format!("allow access failed: {e}"),
                ));
            }
            remote.agent
        };

        let job = match direction {
            Direction::Put => CopyJob {
                dst: remote_copy_addr,
                dst_agent: remote_agent,
                src: local_addr,
                src_agent: local.agent,
                size,
                mapped_base: remote_base,
                completion: completion.cloned(),
            },
            Direction::Get => CopyJob {
                dst: local_addr,
                dst_agent: local.agent,
                src: remote_copy_addr,
                src_agent: remote_agent,
                size,
                mapped_base: remote_base,
                completion: completion.cloned(),
            },
        };

        let cfg = &self.iface.config;
        let multi = MultiEngine {
            max_engines: cfg.max_sdma_engines,
            thresh: cfg.multi_sdma_thresh,
            policy: cfg.chunk_completion,
            fallback: &cfg.engine_fallback,
        };
        let status = {
            let mut pool = self.iface.core.pool.borrow_mut();
            let mut queue = self.iface.core.queue.borrow_mut();
            let mut dispatcher = CopyDispatcher::new(driver, &mut pool, &mut queue);
            if self.iface.multi_sdma() {
                dispatcher.issue_multi(job, &multi)?
            } else {
                dispatcher.issue_single(job)?
            }
        };

        tracing::trace!(
            %direction,
            remote = format_args!("0x{remote_addr:x}"),
            local = format_args!("0x{local_addr:x}"),
            len = size,
            "async copy issued"
        );
        Ok(status)
    }
}
