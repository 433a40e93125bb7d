use crate::config::TransportConfig;
use crate::device::DeviceDriver;
use crate::error::{Result, XferError};
use crate::transport::copy::COPY_TRANSPORT_NAME;
use crate::transport::ipc::IPC_TRANSPORT_NAME;
use crate::transport::{CopyIface, IpcIface, Transport};
use std::sync::Arc;

/// Constructor of one transport's interface.
pub type OpenFn = fn(Arc<dyn DeviceDriver>, &TransportConfig) -> Box<dyn Transport>;

/// A transport that can be opened by name.
#[derive(Clone)]
pub struct Component {
    pub name: &'static str,
    pub description: &'static str,
    open: OpenFn,
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

/// The transports available to a worker.
#[derive(Debug, Clone, Default)]
pub struct TransportRegistry {
    components: Vec<Component>,
}

impl TransportRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the `copy` and `ipc` transports.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.components.push(Component {
            name: COPY_TRANSPORT_NAME,
            description: "host/device copies within a process",
            open: |driver, config| Box::new(CopyIface::new(driver, config.copy.clone())),
        });
        registry.components.push(Component {
            name: IPC_TRANSPORT_NAME,
            description: "device memory of other processes on the node",
            open: |driver, config| Box::new(IpcIface::new(driver, config.ipc.clone())),
        });
        registry
    }

    /// Add a transport. Names must be unique.
    pub fn register(&mut self, name: &'static str, description: &'static str, open: OpenFn) -> Result<()> {
        if self.components.iter().any(|c| c.name == name) {
            return Err(XferError::InvalidParam(format!(
                "transport '{name}' already registered"
            )));
        }
        self.components.push(Component {
            name,
            description,
            open,
        });
        Ok(())
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> Vec<&'static str> {
        self.components.iter().map(|c| c.name).collect()
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// Open an interface of the transport called `name`.
    pub fn open(
        &self,
        name: &str,
        driver: Arc<dyn DeviceDriver>,
        config: &TransportConfig,
    ) -> Result<Box<dyn Transport>> {
        let component = self
            .components
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| XferError::Unsupported(format!("no transport named '{name}'")))?;
        tracing::debug!(transport = component.name, "opening interface");
        Ok((component.open)(driver, config))
    }
}
