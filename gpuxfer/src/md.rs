//! Memory domain of the copy transport.
//!
//! Registration and key packing are no-ops: the copy transport only moves
//! data inside one process, where every address is already usable.

use crate::device::DeviceDriver;
use crate::error::{Result, XferError};
use crate::memory::detect_memory_type;
use crate::types::{MemoryType, RemoteKey};
use std::sync::Arc;

/// Opaque memory handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemHandle(pub u64);

impl MemHandle {
    /// Handle returned by [`CopyMd::mem_reg`].
    pub const REGISTERED: MemHandle = MemHandle(0xdead_beef);
}

/// Capability flags of a memory domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MdFlags {
    pub reg: bool,
    pub alloc: bool,
}

/// What [`CopyMd::query`] reports. Memory-type sets are masks of
/// [`MemoryType::bit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdAttr {
    pub flags: MdFlags,
    pub reg_mem_types: u32,
    pub alloc_mem_types: u32,
    pub access_mem_types: u32,
    pub detect_mem_types: u32,
    pub cache_mem_types: u32,
    pub max_alloc: usize,
    pub max_reg: usize,
    pub rkey_packed_size: usize,
}

/// Memory allocated through the domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub address: u64,
    pub length: usize,
    pub memh: MemHandle,
}

pub struct CopyMd {
    driver: Arc<dyn DeviceDriver>,
}

impl CopyMd {
    pub fn new(driver: Arc<dyn DeviceDriver>) -> Self {
        Self { driver }
    }

    pub fn query(&self) -> MdAttr {
        let device = MemoryType::Device.bit();
        MdAttr {
            flags: MdFlags {
                reg: true,
                alloc: true,
            },
            reg_mem_types: MemoryType::Host.bit() | device,
            alloc_mem_types: device,
            access_mem_types: device,
            detect_mem_types: device,
            cache_mem_types: device,
            max_alloc: usize::MAX,
            max_reg: usize::MAX,
            rkey_packed_size: 0,
        }
    }

    /// Allocate `length` bytes of device memory from the last device pool.
    pub fn mem_alloc(&self, length: usize, mem_type: MemoryType) -> Result<Allocation> {
        if mem_type != MemoryType::Device {
            return Err(XferError::Unsupported(format!(
                "copy memory domain cannot allocate {mem_type:?} memory"
            )));
        }
        let address = self.driver.device_alloc(length).map_err(|e| {
            tracing::debug!(length, error = %e, "could not allocate device memory");
            XferError::Unsupported(format!("device allocation of {length} bytes: {e}"))
        })?;
        Ok(Allocation {
            address,
            length,
            memh: MemHandle(address),
        })
    }

    pub fn mem_free(&self, alloc: &Allocation) -> Result<()> {
        self.driver.device_free(alloc.memh.0).map_err(|e| {
            tracing::debug!(error = %e, "could not free device memory");
            XferError::Unsupported(format!("device free of 0x{:x}: {e}", alloc.address))
        })
    }

    pub fn mem_reg(&self, _address: u64, _length: usize) -> Result<MemHandle> {
        Ok(MemHandle::REGISTERED)
    }

    pub fn mem_dereg(&self, _memh: MemHandle) -> Result<()> {
        Ok(())
    }

    /// Packed keys are empty.
    pub fn mkey_pack(&self, _memh: MemHandle, _buf: &mut [u8]) -> Result<()> {
        Ok(())
    }

    /// Every packed key unpacks to a key covering the whole address space of
    /// this process.
    pub fn rkey_unpack(&self, _buf: &[u8]) -> RemoteKey {
        RemoteKey::new(0, usize::MAX, std::process::id())
    }

    pub fn rkey_release(&self, _key: RemoteKey) {}

    pub fn detect_memory_type(&self, address: u64, length: usize) -> MemoryType {
        detect_memory_type(self.driver.as_ref(), address, length)
    }
}
