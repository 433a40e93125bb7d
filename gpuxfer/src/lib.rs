pub mod completion;
pub mod config;
pub mod contig;
pub mod copy;
pub mod device;
pub mod engine;
pub mod error;
pub mod md;
pub mod memory;
pub mod registry;
pub mod signal;
pub mod stats;
pub mod transport;
pub mod types;

pub use completion::Completion;
pub use config::{
    ChunkCompletion, CopyIfaceConfig, EngineFallback, IpcIfaceConfig, SignalPoolConfig,
    TransportConfig,
};
pub use device::{DeviceDriver, SimDriver};
pub use engine::EngineSelector;
pub use error::{Result, Status, XferError};
pub use md::CopyMd;
pub use memory::{Accessibility, MemoryRegion, RemoteHandleCache};
pub use registry::TransportRegistry;
pub use transport::{
    CopyEp, CopyIface, IfaceAttr, IpcEp, IpcIface, PerfAttr, Transport, progress_until_idle,
};
pub use types::{AgentId, Direction, EngineId, EpOp, IoVec, MemoryType, ProcessId, RemoteKey};
