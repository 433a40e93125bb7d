use crate::config::EngineFallback;
use crate::device::DeviceDriver;
use crate::error::{Result, XferError};
use crate::types::{AgentId, EngineId};

/// Picks the SDMA engines for a copy between two agents.
///
/// Every process on a node enumerates GPU agents in the same order, so
/// rotating the engine list by the destination's position spreads copies
/// to different GPUs over different engines without any coordination.
pub struct EngineSelector<'a> {
    driver: &'a dyn DeviceDriver,
    fallback: &'a EngineFallback,
}

impl<'a> EngineSelector<'a> {
    pub fn new(driver: &'a dyn DeviceDriver, fallback: &'a EngineFallback) -> Self {
        Self { driver, fallback }
    }

    /// Engines able to copy from `src` to `dst`, ascending. When the driver
    /// reports fewer than `desired`, the fallback table is used instead.
    pub fn candidates(&self, dst: AgentId, src: AgentId, desired: usize) -> Result<Vec<EngineId>> {
        let status = self.driver.copy_engine_status(dst, src).map_err(|e| {
            tracing::trace!(error = %e, "copy engine status query failed");
            XferError::io_with_source("copy engine status", e)
        })?;
        if status.exhausted {
            tracing::trace!(mask = status.mask, "all copy engines busy, using mask anyway");
        }
        let engines = if status.count() >= desired {
            status.engines()
        } else {
            self.fallback.0.clone()
        };
        if engines.is_empty() {
            return Err(XferError::io("no engines available for copy"));
        }
        Ok(engines)
    }

    /// Index of `agent` in the driver's GPU list, or 0 if it is not a GPU.
    pub fn agent_pos(&self, agent: AgentId) -> usize {
        self.driver
            .gpu_agents()
            .iter()
            .position(|&a| a == agent)
            .unwrap_or(0)
    }

    /// Rotate `engines` left by `agent_pos(dst) * used`.
    pub fn rotate(&self, engines: &mut [EngineId], dst: AgentId, used: usize) {
        if engines.is_empty() {
            return;
        }
        let shift = self.agent_pos(dst).wrapping_mul(used) % engines.len();
        engines.rotate_left(shift);
    }

    /// Candidates for a copy that will use `min(desired, available)`
    /// engines, rotated for `dst`.
    pub fn select_engines(&self, dst: AgentId, src: AgentId, desired: usize) -> Result<Vec<EngineId>> {
        let mut engines = self.candidates(dst, src, desired)?;
        let used = desired.clamp(1, engines.len());
        self.rotate(&mut engines, dst, used);
        Ok(engines)
    }
}
