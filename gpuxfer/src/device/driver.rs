use crate::error::Result;
use crate::types::{AgentId, EngineId, RemoteKey};

/// Handle of a hardware completion signal owned by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalId(pub u64);

/// How the driver's allocator sees a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerKind {
    /// Not allocated through any allocator the driver knows about.
    Unknown,
    /// Host memory allocated by the driver (fine-grained system memory).
    Host,
    /// Host memory registered (page-locked) with the driver.
    Locked,
    /// Device framebuffer memory.
    Device,
    /// Another process's device memory mapped through IPC.
    Ipc,
}

/// Driver bookkeeping for the allocation containing a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerInfo {
    /// Base address of the containing allocation.
    pub base: u64,
    /// Size of the containing allocation in bytes.
    pub size: usize,
    pub kind: PointerKind,
    /// Owning agent; null when the owner is not visible to this process.
    pub agent: AgentId,
}

impl PointerInfo {
    pub fn unknown() -> Self {
        Self {
            base: 0,
            size: 0,
            kind: PointerKind::Unknown,
            agent: AgentId::NULL,
        }
    }
}

/// Engines able to copy between two agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatus {
    /// Bit `n` set means engine `n` can perform the copy.
    pub mask: u32,
    /// The driver reported that all engines are currently busy. The mask is
    /// still valid in that case.
    pub exhausted: bool,
}

impl EngineStatus {
    pub fn count(&self) -> usize {
        self.mask.count_ones() as usize
    }

    /// Engines in ascending index order.
    pub fn engines(&self) -> Vec<EngineId> {
        (0..u32::BITS)
            .filter(|i| self.mask & (1 << i) != 0)
            .map(EngineId)
            .collect()
    }
}

/// One asynchronous copy handed to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRequest {
    pub dst: u64,
    pub dst_agent: AgentId,
    pub src: u64,
    pub src_agent: AgentId,
    pub size: usize,
    /// Signal decremented by the hardware when the copy retires.
    pub signal: SignalId,
    /// Engine to run on; `None` lets the driver choose.
    pub engine: Option<EngineId>,
}

/// The device runtime underneath the transports.
///
/// gpuxfer works on raw `u64` addresses. Every call into the device runtime
/// goes through this trait, so transports can run on real hardware or on the
/// in-process [`SimDriver`](super::SimDriver).
///
/// Signals follow the runtime's convention: the issuer stores `1`, the copy
/// engine decrements to `0` when the copy has landed.
pub trait DeviceDriver: Send + Sync {
    /// All GPU agents, in the driver's enumeration order. The order is the
    /// same for every process on a node.
    fn gpu_agents(&self) -> Vec<AgentId>;

    /// Look up the allocation containing `[ptr, ptr + len)`.
    ///
    /// Unknown pointers are not an error at this level: they come back with
    /// [`PointerKind::Unknown`].
    fn pointer_info(&self, ptr: u64, len: usize) -> Result<PointerInfo>;

    /// Engines able to copy from `src` to `dst`.
    fn copy_engine_status(&self, dst: AgentId, src: AgentId) -> Result<EngineStatus>;

    /// Let `agents` access the allocation starting at `base` directly.
    fn allow_access(&self, agents: &[AgentId], base: u64) -> Result<()>;

    fn signal_create(&self, initial: i64) -> Result<SignalId>;

    /// Store with release semantics.
    fn signal_store(&self, signal: SignalId, value: i64);

    /// Load with acquire semantics.
    fn signal_load(&self, signal: SignalId) -> i64;

    fn signal_destroy(&self, signal: SignalId);

    /// Queue an asynchronous copy. Returns once the request is accepted by
    /// the hardware queue, not when the data has moved.
    ///
    /// # Safety
    /// `src` and `dst` must be valid for `size` bytes until the request's
    /// signal reaches zero.
    unsafe fn async_copy(&self, req: &CopyRequest) -> Result<()>;

    /// True if [`async_copy`](Self::async_copy) honours `CopyRequest::engine`.
    fn supports_copy_on_engine(&self) -> bool {
        false
    }

    /// Blocking copy, used for short operations.
    ///
    /// # Safety
    /// `src` and `dst` must be valid for `len` bytes.
    unsafe fn memcpy(&self, dst: u64, src: u64, len: usize) -> Result<()>;

    /// Map another process's exported device memory into this process.
    /// Returns the local address of `key.address`.
    fn ipc_attach(&self, key: &RemoteKey) -> Result<u64>;

    /// Undo an [`ipc_attach`](Self::ipc_attach).
    fn ipc_detach(&self, mapped: u64) -> Result<()>;

    /// Allocate device memory from the last device pool.
    fn device_alloc(&self, len: usize) -> Result<u64>;

    fn device_free(&self, ptr: u64) -> Result<()>;

    /// Page size; multi-engine chunk boundaries are aligned to it.
    fn page_size(&self) -> usize {
        4096
    }
}
