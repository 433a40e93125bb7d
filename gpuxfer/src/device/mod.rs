mod driver;
mod sim;

pub use driver::{CopyRequest, DeviceDriver, EngineStatus, PointerInfo, PointerKind, SignalId};
pub use sim::{SIM_HOST_AGENT, SimDriver};
