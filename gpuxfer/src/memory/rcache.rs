use crate::device::DeviceDriver;
use crate::error::{Result, XferError};
use crate::types::RemoteKey;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct Mapping {
    mapped: u64,
    refcount: usize,
}

/// Reference-counted mappings of remote keys into this process.
///
/// One cache exists per peer. Mapping the same key twice returns the same
/// local address and does not call the driver again. The last release
/// detaches the mapping.
pub struct RemoteHandleCache {
    name: String,
    driver: Arc<dyn DeviceDriver>,
    entries: HashMap<RemoteKey, Mapping>,
}

impl RemoteHandleCache {
    /// `name` identifies the peer in log records, e.g. `dest:4242`.
    pub fn new(name: impl Into<String>, driver: Arc<dyn DeviceDriver>) -> Self {
        Self {
            name: name.into(),
            driver,
            entries: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take a reference on the mapping of `key`, attaching it if needed.
    pub fn map_remote(&mut self, key: &RemoteKey) -> Result<u64> {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.refcount += 1;
            return Ok(entry.mapped);
        }
        let mapped = self.attach(key)?;
        self.entries.insert(*key, Mapping { mapped, refcount: 1 });
        Ok(mapped)
    }

    /// Local address of `key`, attaching it on first use.
    ///
    /// Unlike [`map_remote`](Self::map_remote) this takes no extra
    /// reference: the mapping stays until released or until the cache is
    /// cleared.
    pub fn get_or_map(&mut self, key: &RemoteKey) -> Result<u64> {
        if let Some(entry) = self.entries.get(key) {
            return Ok(entry.mapped);
        }
        self.map_remote(key)
    }

    fn attach(&self, key: &RemoteKey) -> Result<u64> {
        match self.driver.ipc_attach(key) {
            Ok(mapped) => {
                tracing::debug!(
                    cache = %self.name,
                    address = format_args!("0x{:x}", key.address),
                    length = key.length,
                    mapped = format_args!("0x{mapped:x}"),
                    "attached remote memory"
                );
                Ok(mapped)
            }
            Err(e) => {
                tracing::error!(
                    cache = %self.name,
                    address = format_args!("0x{:x}", key.address),
                    pid = key.owner,
                    error = %e,
                    "failed to attach ipc memory"
                );
                Err(XferError::MappingFailed {
                    addr: key.address,
                    pid: key.owner,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Drop one reference on `key`. The last one detaches the mapping.
    pub fn release(&mut self, key: &RemoteKey) -> Result<()> {
        let entry = self.entries.get_mut(key).ok_or_else(|| {
            XferError::InvalidParam(format!(
                "{}: no mapping for 0x{:x}+{} of pid {}",
                self.name, key.address, key.length, key.owner
            ))
        })?;
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return Ok(());
        }
        let mapped = entry.mapped;
        self.entries.remove(key);
        self.driver.ipc_detach(mapped)
    }

    /// Detach every mapping regardless of reference counts.
    pub fn clear(&mut self) {
        for (key, entry) in self.entries.drain() {
            if let Err(e) = self.driver.ipc_detach(entry.mapped) {
                tracing::warn!(
                    cache = %self.name,
                    address = format_args!("0x{:x}", key.address),
                    error = %e,
                    "failed to detach ipc memory"
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// References held on `key`; 0 if it is not mapped.
    pub fn refcount(&self, key: &RemoteKey) -> usize {
        self.entries.get(key).map_or(0, |e| e.refcount)
    }
}

impl Drop for RemoteHandleCache {
    fn drop(&mut self) {
        self.clear();
    }
}
