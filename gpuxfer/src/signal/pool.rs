use crate::completion::Completion;
use crate::config::SignalPoolConfig;
use crate::device::{DeviceDriver, SignalId};
use crate::error::{Result, XferError};
use crossbeam_queue::ArrayQueue;
use std::sync::Arc;

/// Slot index of a descriptor inside its [`SignalPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescId(pub(crate) usize);

/// One in-flight copy: a hardware signal plus what to do when it fires.
#[derive(Debug)]
pub struct SignalDesc {
    pub signal: SignalId,
    pub completion: Option<Completion>,
    /// Local base address of the remote mapping the copy targets, or 0.
    pub mapped_addr: u64,
    pub length: usize,
}

/// Fixed-capacity arena of signal descriptors.
///
/// Descriptors are created in batches of `per_chunk` as demand grows, up to
/// `max`, and are never destroyed before the pool itself. Free slots sit in
/// a lock-free queue so get and put are O(1).
pub struct SignalPool {
    driver: Arc<dyn DeviceDriver>,
    slots: Vec<SignalDesc>,
    free: ArrayQueue<usize>,
    per_chunk: usize,
    name: &'static str,
}

impl SignalPool {
    pub fn new(driver: Arc<dyn DeviceDriver>, config: SignalPoolConfig, name: &'static str) -> Self {
        let max = config.max.max(1);
        Self {
            driver,
            slots: Vec::new(),
            free: ArrayQueue::new(max),
            per_chunk: config.per_chunk.clamp(1, max),
            name,
        }
    }

    /// Descriptors that may exist at once.
    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }

    /// Descriptors created so far.
    pub fn allocated(&self) -> usize {
        self.slots.len()
    }

    /// Descriptors handed out and not yet returned.
    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Take a descriptor. Its signal value is unspecified; the issuer arms it.
    pub fn get(&mut self) -> Result<DescId> {
        if let Some(idx) = self.free.pop() {
            return Ok(DescId(idx));
        }
        self.grow()?;
        self.free.pop().map(DescId).ok_or(XferError::NoMemory {
            resource: self.name,
            in_use: self.in_use(),
            max: self.capacity(),
        })
    }

    fn grow(&mut self) -> Result<()> {
        let room = self.capacity() - self.slots.len();
        if room == 0 {
            tracing::warn!(pool = self.name, max = self.capacity(), "signal pool exhausted");
            return Ok(());
        }
        let batch = self.per_chunk.min(room);
        for _ in 0..batch {
            let signal = self.driver.signal_create(1)?;
            let idx = self.slots.len();
            self.slots.push(SignalDesc {
                signal,
                completion: None,
                mapped_addr: 0,
                length: 0,
            });
            // Capacity equals the slot limit, so a push cannot fail.
            let _ = self.free.push(idx);
        }
        tracing::debug!(pool = self.name, allocated = self.slots.len(), "signal pool grew");
        Ok(())
    }

    /// Return a descriptor. Any completion still attached is dropped
    /// without firing.
    pub fn put(&mut self, id: DescId) {
        let desc = &mut self.slots[id.0];
        desc.completion = None;
        desc.mapped_addr = 0;
        desc.length = 0;
        let _ = self.free.push(id.0);
    }

    pub fn desc(&self, id: DescId) -> &SignalDesc {
        &self.slots[id.0]
    }

    pub fn desc_mut(&mut self, id: DescId) -> &mut SignalDesc {
        &mut self.slots[id.0]
    }

    pub(crate) fn driver(&self) -> &dyn DeviceDriver {
        self.driver.as_ref()
    }
}

impl Drop for SignalPool {
    fn drop(&mut self) {
        let leaked = self.in_use();
        if leaked > 0 {
            tracing::warn!(pool = self.name, leaked, "signal pool dropped with descriptors in use");
        }
        for desc in &self.slots {
            self.driver.signal_destroy(desc.signal);
        }
    }
}
