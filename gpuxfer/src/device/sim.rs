//! In-process device driver backed by host memory.
//!
//! `SimDriver` keeps the same bookkeeping a GPU runtime keeps (allocations,
//! agents, engine masks, signals, IPC exports) but moves bytes with plain
//! memory copies. Copies stay queued until the caller retires them with
//! [`SimDriver::complete_next`] and friends, which makes signal ordering and
//! partial completion observable in tests. With
//! [`set_auto_complete`](SimDriver::set_auto_complete) copies retire as soon
//! as they are issued.

use crate::device::driver::{
    CopyRequest, DeviceDriver, EngineStatus, PointerInfo, PointerKind, SignalId,
};
use crate::error::{Result, XferError};
use crate::types::{AgentId, ProcessId, RemoteKey};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// Agent handle reported for host allocations.
pub const SIM_HOST_AGENT: AgentId = AgentId(1);

const DEFAULT_ENGINE_MASK: u32 = 0xff;

#[derive(Debug, Clone, Copy)]
struct SimAlloc {
    size: usize,
    kind: PointerKind,
    agent: AgentId,
}

#[derive(Debug, Clone, Copy)]
struct SimExport {
    backing: u64,
    length: usize,
    agent: AgentId,
}

#[derive(Debug)]
struct SimState {
    gpus: Vec<AgentId>,
    allocs: BTreeMap<u64, SimAlloc>,
    owned: HashMap<u64, usize>,
    default_mask: EngineStatus,
    masks: HashMap<(AgentId, AgentId), EngineStatus>,
    signals: Vec<Option<i64>>,
    free_signals: Vec<usize>,
    pending: VecDeque<CopyRequest>,
    issued: Vec<CopyRequest>,
    exports: HashMap<(ProcessId, u64), SimExport>,
    mappings: HashMap<u64, usize>,
    attach_calls: usize,
    detach_calls: usize,
    access_grants: Vec<(Vec<AgentId>, u64)>,
    fail_copies_after: Option<usize>,
    fail_attach: bool,
    fail_allow_access: bool,
    auto_complete: bool,
    move_data: bool,
    copy_on_engine: bool,
    page_size: usize,
}

/// Software stand-in for a GPU runtime. See the module docs.
#[derive(Debug)]
pub struct SimDriver {
    state: Mutex<SimState>,
}

impl SimDriver {
    /// Create a driver with `num_gpus` GPU agents. GPU `i` has handle
    /// `0x100 * (i + 1)`.
    pub fn new(num_gpus: usize) -> Self {
        let gpus = (0..num_gpus as u64).map(|i| AgentId(0x100 * (i + 1))).collect();
        Self {
            state: Mutex::new(SimState {
                gpus,
                allocs: BTreeMap::new(),
                owned: HashMap::new(),
                default_mask: EngineStatus {
                    mask: DEFAULT_ENGINE_MASK,
                    exhausted: false,
                },
                masks: HashMap::new(),
                signals: Vec::new(),
                free_signals: Vec::new(),
                pending: VecDeque::new(),
                issued: Vec::new(),
                exports: HashMap::new(),
                mappings: HashMap::new(),
                attach_calls: 0,
                detach_calls: 0,
                access_grants: Vec::new(),
                fail_copies_after: None,
                fail_attach: false,
                fail_allow_access: false,
                auto_complete: false,
                move_data: true,
                copy_on_engine: true,
                page_size: 4096,
            }),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, SimState>> {
        self.state
            .lock()
            .map_err(|_| XferError::LockPoisoned("sim driver state"))
    }

    // Signal operations cannot fail on real hardware, so they recover the
    // guard instead of reporting poisoning.
    fn state_infallible(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Handle of GPU `index`.
    pub fn gpu(&self, index: usize) -> AgentId {
        self.state_infallible().gpus[index]
    }

    /// Record an allocation so `pointer_info` can classify it.
    pub fn register(&self, ptr: u64, size: usize, kind: PointerKind, agent: AgentId) {
        self.state_infallible()
            .allocs
            .insert(ptr, SimAlloc { size, kind, agent });
    }

    /// Record `buf` as device memory owned by `agent`.
    pub fn register_device(&self, buf: &mut [u8], agent: AgentId) -> u64 {
        let ptr = buf.as_mut_ptr() as u64;
        self.register(ptr, buf.len(), PointerKind::Device, agent);
        ptr
    }

    /// Record `buf` as driver-allocated host memory.
    pub fn register_host(&self, buf: &mut [u8]) -> u64 {
        let ptr = buf.as_mut_ptr() as u64;
        self.register(ptr, buf.len(), PointerKind::Host, SIM_HOST_AGENT);
        ptr
    }

    pub fn unregister(&self, ptr: u64) {
        self.state_infallible().allocs.remove(&ptr);
    }

    /// Pretend process `owner` exported `length` bytes at `remote_address`,
    /// backed locally by `backing`. `agent` is what `pointer_info` reports for
    /// the mapping; pass [`AgentId::NULL`] to model a GPU this process cannot
    /// see.
    pub fn export(
        &self,
        owner: ProcessId,
        remote_address: u64,
        backing: u64,
        length: usize,
        agent: AgentId,
    ) -> RemoteKey {
        self.state_infallible().exports.insert(
            (owner, remote_address),
            SimExport {
                backing,
                length,
                agent,
            },
        );
        RemoteKey::new(remote_address, length, owner)
    }

    pub fn set_default_engine_mask(&self, mask: u32) {
        self.state_infallible().default_mask = EngineStatus {
            mask,
            exhausted: false,
        };
    }

    pub fn set_engine_status(&self, dst: AgentId, src: AgentId, status: EngineStatus) {
        self.state_infallible().masks.insert((dst, src), status);
    }

    pub fn set_auto_complete(&self, on: bool) {
        self.state_infallible().auto_complete = on;
    }

    /// Disable byte movement, for tests that use synthetic addresses.
    pub fn set_data_movement(&self, on: bool) {
        self.state_infallible().move_data = on;
    }

    pub fn set_copy_on_engine(&self, on: bool) {
        self.state_infallible().copy_on_engine = on;
    }

    pub fn set_page_size(&self, page_size: usize) {
        self.state_infallible().page_size = page_size;
    }

    /// Accept `n` more copies, then reject every further one.
    pub fn fail_copies_after(&self, n: Option<usize>) {
        let mut st = self.state_infallible();
        st.fail_copies_after = n.map(|n| st.issued.len() + n);
    }

    pub fn fail_attach(&self, on: bool) {
        self.state_infallible().fail_attach = on;
    }

    pub fn fail_allow_access(&self, on: bool) {
        self.state_infallible().fail_allow_access = on;
    }

    /// Every copy accepted so far, in issue order.
    pub fn issued(&self) -> Vec<CopyRequest> {
        self.state_infallible().issued.clone()
    }

    pub fn pending_copies(&self) -> usize {
        self.state_infallible().pending.len()
    }

    pub fn attach_calls(&self) -> usize {
        self.state_infallible().attach_calls
    }

    pub fn detach_calls(&self) -> usize {
        self.state_infallible().detach_calls
    }

    pub fn access_grants(&self) -> Vec<(Vec<AgentId>, u64)> {
        self.state_infallible().access_grants.clone()
    }

    /// Signals created and not yet destroyed.
    pub fn live_signals(&self) -> usize {
        let st = self.state_infallible();
        st.signals.iter().filter(|s| s.is_some()).count()
    }

    /// Retire the oldest queued copy. Returns false if nothing is queued.
    pub fn complete_next(&self) -> bool {
        let mut st = self.state_infallible();
        match st.pending.pop_front() {
            Some(req) => {
                Self::retire(&mut st, &req);
                true
            }
            None => false,
        }
    }

    /// Retire the most recently queued copy, ahead of older ones.
    pub fn complete_last(&self) -> bool {
        let mut st = self.state_infallible();
        match st.pending.pop_back() {
            Some(req) => {
                Self::retire(&mut st, &req);
                true
            }
            None => false,
        }
    }

    /// Retire every queued copy in issue order.
    pub fn complete_all(&self) -> usize {
        let mut st = self.state_infallible();
        let mut n = 0;
        while let Some(req) = st.pending.pop_front() {
            Self::retire(&mut st, &req);
            n += 1;
        }
        n
    }

    fn retire(st: &mut SimState, req: &CopyRequest) {
        if st.move_data {
            // SAFETY: `async_copy` callers guarantee both ranges stay valid
            // until the request's signal reaches zero, which happens below.
            unsafe {
                std::ptr::copy(req.src as *const u8, req.dst as *mut u8, req.size);
            }
        }
        if let Some(Some(value)) = st.signals.get_mut(req.signal.0 as usize) {
            *value -= 1;
        }
    }

    fn lookup(st: &SimState, ptr: u64, len: usize) -> Option<(u64, SimAlloc)> {
        let (&base, alloc) = st.allocs.range(..=ptr).next_back()?;
        let end = ptr.checked_add(len as u64)?;
        if end <= base + alloc.size as u64 {
            Some((base, *alloc))
        } else {
            None
        }
    }
}

impl DeviceDriver for SimDriver {
    fn gpu_agents(&self) -> Vec<AgentId> {
        self.state_infallible().gpus.clone()
    }

    fn pointer_info(&self, ptr: u64, len: usize) -> Result<PointerInfo> {
        let st = self.state()?;
        Ok(match Self::lookup(&st, ptr, len) {
            Some((base, alloc)) => PointerInfo {
                base,
                size: alloc.size,
                kind: alloc.kind,
                agent: alloc.agent,
            },
            None => PointerInfo::unknown(),
        })
    }

    fn copy_engine_status(&self, dst: AgentId, src: AgentId) -> Result<EngineStatus> {
        let st = self.state()?;
        Ok(st.masks.get(&(dst, src)).copied().unwrap_or(st.default_mask))
    }

    fn allow_access(&self, agents: &[AgentId], base: u64) -> Result<()> {
        let mut st = self.state()?;
        if st.fail_allow_access {
            return Err(XferError::device(format!(
                "allow_access denied for 0x{base:x}"
            )));
        }
        st.access_grants.push((agents.to_vec(), base));
        Ok(())
    }

    fn signal_create(&self, initial: i64) -> Result<SignalId> {
        let mut st = self.state()?;
        let idx = match st.free_signals.pop() {
            Some(idx) => {
                st.signals[idx] = Some(initial);
                idx
            }
            None => {
                st.signals.push(Some(initial));
                st.signals.len() - 1
            }
        };
        Ok(SignalId(idx as u64))
    }

    fn signal_store(&self, signal: SignalId, value: i64) {
        let mut st = self.state_infallible();
        if let Some(Some(v)) = st.signals.get_mut(signal.0 as usize) {
            *v = value;
        }
    }

    fn signal_load(&self, signal: SignalId) -> i64 {
        let st = self.state_infallible();
        st.signals
            .get(signal.0 as usize)
            .copied()
            .flatten()
            .unwrap_or(0)
    }

    fn signal_destroy(&self, signal: SignalId) {
        let mut st = self.state_infallible();
        let idx = signal.0 as usize;
        if let Some(slot) = st.signals.get_mut(idx) {
            if slot.take().is_some() {
                st.free_signals.push(idx);
            }
        }
    }

    unsafe fn async_copy(&self, req: &CopyRequest) -> Result<()> {
        let mut st = self.state()?;
        if let Some(limit) = st.fail_copies_after {
            if st.issued.len() >= limit {
                return Err(XferError::device("copy queue rejected request"));
            }
        }
        if req.engine.is_some() && !st.copy_on_engine {
            return Err(XferError::Unsupported("copy on engine".into()));
        }
        if !matches!(st.signals.get(req.signal.0 as usize), Some(Some(_))) {
            return Err(XferError::device(format!(
                "unknown signal {}",
                req.signal.0
            )));
        }
        st.issued.push(*req);
        if st.auto_complete {
            Self::retire(&mut st, req);
        } else {
            st.pending.push_back(*req);
        }
        Ok(())
    }

    fn supports_copy_on_engine(&self) -> bool {
        self.state_infallible().copy_on_engine
    }

    unsafe fn memcpy(&self, dst: u64, src: u64, len: usize) -> Result<()> {
        let st = self.state()?;
        if st.move_data {
            unsafe {
                std::ptr::copy(src as *const u8, dst as *mut u8, len);
            }
        }
        Ok(())
    }

    fn ipc_attach(&self, key: &RemoteKey) -> Result<u64> {
        let mut st = self.state()?;
        st.attach_calls += 1;
        if st.fail_attach {
            return Err(XferError::device("ipc attach denied"));
        }
        let export = match st.exports.get(&(key.owner, key.address)) {
            Some(e) if e.length >= key.length => *e,
            _ => {
                return Err(XferError::device(format!(
                    "pid {} exported nothing at 0x{:x}",
                    key.owner, key.address
                )));
            }
        };
        *st.mappings.entry(export.backing).or_insert(0) += 1;
        st.allocs.insert(
            export.backing,
            SimAlloc {
                size: export.length,
                kind: PointerKind::Ipc,
                agent: export.agent,
            },
        );
        Ok(export.backing)
    }

    fn ipc_detach(&self, mapped: u64) -> Result<()> {
        let mut st = self.state()?;
        st.detach_calls += 1;
        let remaining = match st.mappings.get_mut(&mapped) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => {
                return Err(XferError::device(format!(
                    "0x{mapped:x} is not an ipc mapping"
                )));
            }
        };
        if remaining == 0 {
            st.mappings.remove(&mapped);
            st.allocs.remove(&mapped);
        }
        Ok(())
    }

    fn device_alloc(&self, len: usize) -> Result<u64> {
        if len == 0 {
            return Err(XferError::InvalidParam("zero-length allocation".into()));
        }
        let mut st = self.state()?;
        let agent = match st.gpus.last() {
            Some(agent) => *agent,
            None => return Err(XferError::device("no device memory pool")),
        };
        let buf = vec![0u8; len].into_boxed_slice();
        let ptr = Box::into_raw(buf) as *mut u8 as u64;
        st.owned.insert(ptr, len);
        st.allocs.insert(
            ptr,
            SimAlloc {
                size: len,
                kind: PointerKind::Device,
                agent,
            },
        );
        Ok(ptr)
    }

    fn device_free(&self, ptr: u64) -> Result<()> {
        let mut st = self.state()?;
        let len = st
            .owned
            .remove(&ptr)
            .ok_or_else(|| XferError::device(format!("0x{ptr:x} was not allocated here")))?;
        st.allocs.remove(&ptr);
        // SAFETY: `ptr`/`len` came from `Box::into_raw` in `device_alloc`.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                ptr as *mut u8,
                len,
            )));
        }
        Ok(())
    }

    fn page_size(&self) -> usize {
        self.state_infallible().page_size
    }
}

impl Drop for SimDriver {
    fn drop(&mut self) {
        let st = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        for (ptr, len) in st.owned.drain() {
            // SAFETY: see `device_free`.
            unsafe {
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                    ptr as *mut u8,
                    len,
                )));
            }
        }
    }
}
