use crate::device::{DeviceDriver, PointerKind};
use crate::error::{Result, XferError};
use crate::types::{AgentId, MemoryType};

/// Who can touch a region directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Accessibility {
    /// The CPU can load and store it.
    HostAccessible,
    /// Only GPU agents (or copy engines) can reach it.
    DeviceOnly,
    Unknown,
}

impl From<PointerKind> for Accessibility {
    fn from(kind: PointerKind) -> Self {
        match kind {
            PointerKind::Host | PointerKind::Locked => Accessibility::HostAccessible,
            PointerKind::Device | PointerKind::Ipc => Accessibility::DeviceOnly,
            PointerKind::Unknown => Accessibility::Unknown,
        }
    }
}

/// The driver allocation a pointer falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub len: usize,
    pub access: Accessibility,
    /// Owning agent; null when the owner is not visible to this process.
    pub agent: AgentId,
}

/// Look up `[ptr, ptr + len)` without failing on unknown memory.
pub fn probe(driver: &dyn DeviceDriver, ptr: u64, len: usize) -> Result<MemoryRegion> {
    let info = driver.pointer_info(ptr, len)?;
    Ok(MemoryRegion {
        base: info.base,
        len: info.size,
        access: info.kind.into(),
        agent: info.agent,
    })
}

/// Classify `[ptr, ptr + len)`. Memory the driver does not know about is
/// `InvalidAddress`.
pub fn classify(driver: &dyn DeviceDriver, ptr: u64, len: usize) -> Result<MemoryRegion> {
    let region = probe(driver, ptr, len)
        .map_err(|e| XferError::invalid_address(ptr, len, format!("pointer lookup failed: {e}")))?;
    if region.access == Accessibility::Unknown {
        return Err(XferError::invalid_address(ptr, len, "not allocated by the device runtime"));
    }
    Ok(region)
}

/// Memory type of `[ptr, ptr + len)` as the memory domain reports it.
/// Anything that is not device memory is host memory.
pub fn detect_memory_type(driver: &dyn DeviceDriver, ptr: u64, len: usize) -> MemoryType {
    match probe(driver, ptr, len) {
        Ok(region) if region.access == Accessibility::DeviceOnly => MemoryType::Device,
        Ok(_) => MemoryType::Host,
        Err(e) => {
            tracing::debug!(ptr = format_args!("0x{ptr:x}"), error = %e, "memory type lookup failed");
            MemoryType::Host
        }
    }
}
