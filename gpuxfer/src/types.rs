/// Driver handle of a compute or DMA-capable agent (one GPU, or the host).
///
/// Handle `0` is the null agent: the driver reports it for memory whose owner
/// is not visible to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct AgentId(pub u64);

impl AgentId {
    pub const NULL: AgentId = AgentId(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "agent:{}", self.0)
    }
}

/// Index of a hardware copy engine (SDMA engine `n` is bit `n` of the mask
/// reported by the driver).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineId(pub u32);

impl EngineId {
    /// Driver engine mask selecting only this engine.
    pub const fn mask(self) -> u32 {
        1 << self.0
    }
}

/// Operating-system process identity of a peer.
pub type ProcessId = u32;

/// One contiguous region of a scatter/gather list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoVec {
    pub ptr: u64,
    pub len: usize,
}

impl IoVec {
    pub fn new(ptr: u64, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Build an IO vector over a byte slice.
    pub fn from_slice(buf: &[u8]) -> Self {
        Self {
            ptr: buf.as_ptr() as u64,
            len: buf.len(),
        }
    }

    /// Sum of the lengths of all entries.
    pub fn total_len(iov: &[IoVec]) -> usize {
        iov.iter().map(|v| v.len).sum()
    }
}

/// Exported descriptor of a remote memory registration.
///
/// Keys are exchanged out of band between processes on the same node; they
/// never go over a wire in this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteKey {
    /// Base address of the registration in the owner's address space.
    pub address: u64,
    /// Length of the registration in bytes.
    pub length: usize,
    /// Process that exported the registration.
    pub owner: ProcessId,
}

impl RemoteKey {
    pub fn new(address: u64, length: usize, owner: ProcessId) -> Self {
        Self {
            address,
            length,
            owner,
        }
    }

    /// True if `[addr, addr + len)` lies inside the registration.
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        let end = match addr.checked_add(len as u64) {
            Some(end) => end,
            None => return false,
        };
        addr >= self.address && end <= self.address.saturating_add(self.length as u64)
    }
}

/// Direction of a one-sided operation, seen from the local buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Local buffer is the source, remote memory the destination.
    Put,
    /// Remote memory is the source, local buffer the destination.
    Get,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Put => f.write_str("put"),
            Direction::Get => f.write_str("get"),
        }
    }
}

/// Memory types understood by the memory domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemoryType {
    Host = 0,
    Device = 1,
}

impl MemoryType {
    /// Bit used in memory-type masks reported by `query`.
    pub const fn bit(self) -> u32 {
        1 << (self as u8)
    }

    pub const fn is_host_accessible(self) -> bool {
        matches!(self, MemoryType::Host)
    }
}

/// Endpoint operations with their own performance figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EpOp {
    PutShort,
    GetShort,
    PutZcopy,
    GetZcopy,
}
