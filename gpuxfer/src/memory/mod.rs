mod classify;
mod rcache;

pub use classify::{Accessibility, MemoryRegion, classify, detect_memory_type, probe};
pub use rcache::RemoteHandleCache;
