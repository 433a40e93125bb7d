//! Runtime-configurable tuning parameters for the copy and IPC transports.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `GPUXFER_COPY_` and `GPUXFER_IPC_`) or by constructing the
//! structs directly. Configuration is read once, when an interface is
//! created.

pub mod units;

use crate::types::EngineId;
use std::str::FromStr;
use std::time::Duration;
use units::{parse_bandwidth, parse_bool, parse_mem_units, parse_time};

const MB: f64 = 1024.0 * 1024.0;

/// Which chunk descriptors of a multi-engine copy carry the caller's
/// completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkCompletion {
    /// Only the last chunk. The completion may fire while earlier chunks are
    /// still in flight on other engines.
    #[default]
    LastChunk,
    /// Every chunk. The completion fires once, after all chunks retired.
    AllChunks,
}

impl FromStr for ChunkCompletion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "last" | "last_chunk" => Ok(Self::LastChunk),
            "all" | "all_chunks" => Ok(Self::AllChunks),
            other => Err(format!("unknown chunk completion policy '{other}'")),
        }
    }
}

/// Engines used when the driver reports fewer engines than a transfer
/// wants.
///
/// The default `[2, 3, 4]` matches MI200-series parts, whose engine masks
/// under-report the engines usable for peer copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFallback(pub Vec<EngineId>);

impl Default for EngineFallback {
    fn default() -> Self {
        Self(vec![EngineId(2), EngineId(3), EngineId(4)])
    }
}

impl FromStr for EngineFallback {
    type Err = String;

    /// Parse a comma-separated list of engine indices, e.g. `2,3,4`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let engines = s
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<u32>()
                    .ok()
                    .filter(|&n| n < u32::BITS)
                    .map(EngineId)
                    .ok_or_else(|| format!("bad engine index '{}'", part.trim()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if engines.is_empty() {
            return Err("empty engine list".into());
        }
        Ok(Self(engines))
    }
}

/// Sizing of the signal descriptor pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalPoolConfig {
    /// Signals created each time the pool grows.
    pub per_chunk: usize,
    /// Hard limit on descriptors in existence.
    pub max: usize,
}

impl Default for SignalPoolConfig {
    fn default() -> Self {
        Self {
            per_chunk: 128,
            max: 1024,
        }
    }
}

impl SignalPoolConfig {
    /// Override from `SIGNAL_POOL_PER_CHUNK` and `SIGNAL_POOL_MAX`. Zero is
    /// ignored.
    fn read(&mut self, var: &impl Fn(&str) -> Option<String>) {
        let fields: [(&str, &mut usize); 2] = [
            ("SIGNAL_POOL_PER_CHUNK", &mut self.per_chunk),
            ("SIGNAL_POOL_MAX", &mut self.max),
        ];
        for (suffix, field) in fields {
            if let Some(v) = var(suffix) {
                if let Ok(n) = v.trim().parse::<usize>() {
                    if n > 0 {
                        *field = n;
                    }
                }
            }
        }
    }
}

/// Tuning for the copy transport (same-process host/device copies).
#[derive(Debug, Clone, PartialEq)]
pub struct CopyIfaceConfig {
    /// Device-to-host zcopy at or below this size is done synchronously.
    pub d2h_thresh: usize,

    /// Host-to-device zcopy at or below this size is done synchronously.
    pub h2d_thresh: usize,

    /// Issue zcopy operations above the thresholds as asynchronous copies.
    pub enable_async_zcopy: bool,

    /// Shared bandwidth, bytes per second.
    pub bandwidth: f64,

    /// Dedicated bandwidth, bytes per second.
    pub dedicated_bandwidth: f64,

    /// Per-operation shared bandwidths. Values below 1 fall back to
    /// `bandwidth`.
    pub put_short_bandwidth: f64,
    pub get_short_bandwidth: f64,
    pub put_zcopy_bandwidth: f64,
    pub get_zcopy_bandwidth: f64,

    pub latency: Duration,
    pub send_pre_overhead: Duration,
    pub send_post_overhead: Duration,
    pub recv_overhead: Duration,

    pub signal_pool: SignalPoolConfig,
}

impl Default for CopyIfaceConfig {
    fn default() -> Self {
        Self {
            d2h_thresh: 1024,
            h2d_thresh: 1024 * 1024,
            enable_async_zcopy: true,
            bandwidth: 6911.0 * MB,
            dedicated_bandwidth: 6911.0 * MB,
            put_short_bandwidth: 10500.0 * MB,
            get_short_bandwidth: 2000.0 * MB,
            put_zcopy_bandwidth: 9500.0 * MB,
            get_zcopy_bandwidth: 8000.0 * MB,
            latency: Duration::from_micros(10),
            send_pre_overhead: Duration::ZERO,
            send_post_overhead: Duration::ZERO,
            recv_overhead: Duration::ZERO,
            signal_pool: SignalPoolConfig::default(),
        }
    }
}

impl CopyIfaceConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `GPUXFER_COPY_D2H_THRESH`, `GPUXFER_COPY_H2D_THRESH` (`1k`, `1m`, ...)
    /// - `GPUXFER_COPY_ENABLE_ASYNC_ZCOPY` (`y`/`n`)
    /// - `GPUXFER_COPY_BW`, `GPUXFER_COPY_DBW` (`6911.0MB/s`)
    /// - `GPUXFER_COPY_PUT_SHORT_BW`, `GPUXFER_COPY_GET_SHORT_BW`
    /// - `GPUXFER_COPY_PUT_ZCOPY_BW`, `GPUXFER_COPY_GET_ZCOPY_BW`
    /// - `GPUXFER_COPY_LAT` (`10e-6`, `10us`)
    /// - `GPUXFER_COPY_SEND_PRE_OVERHEAD`, `GPUXFER_COPY_SEND_POST_OVERHEAD`,
    ///   `GPUXFER_COPY_RECV_OVERHEAD`
    /// - `GPUXFER_COPY_SIGNAL_POOL_PER_CHUNK`, `GPUXFER_COPY_SIGNAL_POOL_MAX`
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        let var = |suffix: &str| lookup(&format!("GPUXFER_COPY_{suffix}"));

        if let Some(v) = var("D2H_THRESH") {
            if let Some(n) = parse_mem_units(&v) {
                cfg.d2h_thresh = n;
            }
        }
        if let Some(v) = var("H2D_THRESH") {
            if let Some(n) = parse_mem_units(&v) {
                cfg.h2d_thresh = n;
            }
        }
        if let Some(v) = var("ENABLE_ASYNC_ZCOPY") {
            if let Some(b) = parse_bool(&v) {
                cfg.enable_async_zcopy = b;
            }
        }
        let bandwidths: [(&str, &mut f64); 6] = [
            ("BW", &mut cfg.bandwidth),
            ("DBW", &mut cfg.dedicated_bandwidth),
            ("PUT_SHORT_BW", &mut cfg.put_short_bandwidth),
            ("GET_SHORT_BW", &mut cfg.get_short_bandwidth),
            ("PUT_ZCOPY_BW", &mut cfg.put_zcopy_bandwidth),
            ("GET_ZCOPY_BW", &mut cfg.get_zcopy_bandwidth),
        ];
        for (suffix, field) in bandwidths {
            if let Some(v) = var(suffix) {
                if let Some(bw) = parse_bandwidth(&v) {
                    *field = bw;
                }
            }
        }
        let times: [(&str, &mut Duration); 4] = [
            ("LAT", &mut cfg.latency),
            ("SEND_PRE_OVERHEAD", &mut cfg.send_pre_overhead),
            ("SEND_POST_OVERHEAD", &mut cfg.send_post_overhead),
            ("RECV_OVERHEAD", &mut cfg.recv_overhead),
        ];
        for (suffix, field) in times {
            if let Some(v) = var(suffix) {
                if let Some(t) = parse_time(&v) {
                    *field = t;
                }
            }
        }
        cfg.signal_pool.read(&var);

        cfg
    }
}

/// Tuning for the IPC transport (copies into other processes' device
/// memory).
#[derive(Debug, Clone, PartialEq)]
pub struct IpcIfaceConfig {
    /// Split large copies across several SDMA engines when the driver can
    /// target specific engines.
    pub enable_multi_sdma: bool,

    /// Each engine gets at least this many bytes of a split copy.
    pub multi_sdma_thresh: usize,

    /// Upper bound on engines used for one copy.
    pub max_sdma_engines: usize,

    pub chunk_completion: ChunkCompletion,

    pub engine_fallback: EngineFallback,

    /// Shared bandwidth, bytes per second.
    pub bandwidth: f64,

    pub latency: Duration,

    pub signal_pool: SignalPoolConfig,
}

impl Default for IpcIfaceConfig {
    fn default() -> Self {
        Self {
            enable_multi_sdma: true,
            multi_sdma_thresh: 1024 * 1024, // 1 MiB
            max_sdma_engines: 4,
            chunk_completion: ChunkCompletion::default(),
            engine_fallback: EngineFallback::default(),
            bandwidth: 10240.0 * MB,
            latency: Duration::from_micros(1),
            signal_pool: SignalPoolConfig::default(),
        }
    }
}

impl IpcIfaceConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `GPUXFER_IPC_ENABLE_MULTI_SDMA` (`y`/`n`/`try`)
    /// - `GPUXFER_IPC_MULTI_SDMA_THRESH` (`1m`, ...)
    /// - `GPUXFER_IPC_MAX_SDMA_ENGINES`
    /// - `GPUXFER_IPC_CHUNK_COMPLETION` (`last`/`all`)
    /// - `GPUXFER_IPC_ENGINE_FALLBACK` (`2,3,4`)
    /// - `GPUXFER_IPC_BW`, `GPUXFER_IPC_LAT`
    /// - `GPUXFER_IPC_SIGNAL_POOL_PER_CHUNK`, `GPUXFER_IPC_SIGNAL_POOL_MAX`
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        let var = |suffix: &str| lookup(&format!("GPUXFER_IPC_{suffix}"));

        if let Some(v) = var("ENABLE_MULTI_SDMA") {
            if let Some(b) = parse_bool(&v) {
                cfg.enable_multi_sdma = b;
            }
        }
        if let Some(v) = var("MULTI_SDMA_THRESH") {
            if let Some(n) = parse_mem_units(&v).filter(|&n| n > 0) {
                cfg.multi_sdma_thresh = n;
            }
        }
        if let Some(v) = var("MAX_SDMA_ENGINES") {
            if let Ok(n) = v.trim().parse::<usize>() {
                if n > 0 {
                    cfg.max_sdma_engines = n;
                }
            }
        }
        if let Some(v) = var("CHUNK_COMPLETION") {
            match v.parse() {
                Ok(policy) => cfg.chunk_completion = policy,
                Err(e) => tracing::warn!(error = %e, "ignoring GPUXFER_IPC_CHUNK_COMPLETION"),
            }
        }
        if let Some(v) = var("ENGINE_FALLBACK") {
            match v.parse() {
                Ok(fallback) => cfg.engine_fallback = fallback,
                Err(e) => tracing::warn!(error = %e, "ignoring GPUXFER_IPC_ENGINE_FALLBACK"),
            }
        }
        if let Some(v) = var("BW") {
            if let Some(bw) = parse_bandwidth(&v) {
                cfg.bandwidth = bw;
            }
        }
        if let Some(v) = var("LAT") {
            if let Some(t) = parse_time(&v) {
                cfg.latency = t;
            }
        }
        cfg.signal_pool.read(&var);

        cfg
    }
}

/// Configuration for every transport the registry can open.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportConfig {
    pub copy: CopyIfaceConfig,
    pub ipc: IpcIfaceConfig,
}

impl TransportConfig {
    pub fn from_env() -> Self {
        Self {
            copy: CopyIfaceConfig::from_env(),
            ipc: IpcIfaceConfig::from_env(),
        }
    }
}
