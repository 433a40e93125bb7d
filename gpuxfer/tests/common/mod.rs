#![allow(dead_code)]

use gpuxfer::{DeviceDriver, RemoteKey, SimDriver};
use std::sync::{Arc, Once};

pub const PEER_PID: u32 = 4242;
pub const REMOTE_BASE: u64 = 0x1000;

/// Install a subscriber once per test binary. Set `RUST_LOG` for output.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A local device buffer on GPU 0 and a peer's buffer on GPU 1, exported
/// by `PEER_PID` at `REMOTE_BASE`.
pub struct Fixture {
    pub drv: Arc<SimDriver>,
    pub local: Vec<u8>,
    pub remote: Vec<u8>,
    pub local_ptr: u64,
    pub key: RemoteKey,
}

impl Fixture {
    pub fn new(len: usize) -> Self {
        init_tracing();
        let drv = Arc::new(SimDriver::new(2));
        let mut local = vec![0u8; len];
        let mut remote: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let local_ptr = drv.register_device(&mut local, drv.gpu(0));
        let key = drv.export(PEER_PID, REMOTE_BASE, remote.as_mut_ptr() as u64, len, drv.gpu(1));
        Self {
            drv,
            local,
            remote,
            local_ptr,
            key,
        }
    }

    pub fn driver(&self) -> Arc<dyn DeviceDriver> {
        self.drv.clone()
    }
}
