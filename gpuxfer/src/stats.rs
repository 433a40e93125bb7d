use crate::types::EpOp;

/// Operation count and payload volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounter {
    pub ops: u64,
    pub bytes: u64,
}

impl OpCounter {
    fn add(&mut self, bytes: usize) {
        self.ops += 1;
        self.bytes += bytes as u64;
    }
}

/// Per-endpoint counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpStats {
    pub put_short: OpCounter,
    pub get_short: OpCounter,
    pub put_zcopy: OpCounter,
    pub get_zcopy: OpCounter,
    /// Operations that returned an error.
    pub errors: u64,
}

impl EpStats {
    /// Count one operation. Operations are counted whether or not they
    /// succeed.
    pub fn record(&mut self, op: EpOp, bytes: usize) {
        match op {
            EpOp::PutShort => self.put_short.add(bytes),
            EpOp::GetShort => self.get_short.add(bytes),
            EpOp::PutZcopy => self.put_zcopy.add(bytes),
            EpOp::GetZcopy => self.get_zcopy.add(bytes),
        }
    }
}

/// Per-interface counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IfaceStats {
    /// Flushes that found nothing outstanding.
    pub flush: u64,
    /// Flushes that had to report work in progress.
    pub flush_wait: u64,
    /// Descriptors retired by progress.
    pub retired: u64,
}
