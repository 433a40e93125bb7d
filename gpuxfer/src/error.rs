pub type Result<T> = std::result::Result<T, XferError>;

/// Successful outcome of a transport operation.
///
/// Errors travel in [`XferError`]; an `Ok` result is either finished already
/// or still owned by the hardware and reported later through a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The operation finished synchronously.
    Done,
    /// The operation was handed to a copy engine; progress reports completion.
    InProgress,
}

impl Status {
    pub fn is_in_progress(self) -> bool {
        matches!(self, Status::InProgress)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum XferError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("address 0x{addr:x} (len {len}) is not device memory: {reason}")]
    InvalidAddress {
        addr: u64,
        len: usize,
        reason: String,
    },

    #[error("failed to map remote memory 0x{addr:x} of pid {pid}: {reason}")]
    MappingFailed { addr: u64, pid: u32, reason: String },

    #[error("copy issue failed: {message}")]
    IoError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("out of {resource}: {in_use} in use (max {max})")]
    NoMemory {
        resource: &'static str,
        in_use: usize,
        max: usize,
    },

    #[error("device driver error: {message}")]
    Device {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl XferError {
    /// Create an `IoError` with just a message.
    pub fn io(msg: impl Into<String>) -> Self {
        Self::IoError {
            message: msg.into(),
            source: None,
        }
    }

    /// Create an `IoError` wrapping the error that caused it.
    pub fn io_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::IoError {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a `Device` error with just a message.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device {
            message: msg.into(),
            source: None,
        }
    }

    /// Create an `InvalidAddress` error.
    pub fn invalid_address(addr: u64, len: usize, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            addr,
            len,
            reason: reason.into(),
        }
    }

    /// `InvalidParam` for a remote range that does not fit its key.
    pub fn out_of_range(addr: u64, len: usize, key_addr: u64, key_len: usize) -> Self {
        Self::InvalidParam(format!(
            "remote range 0x{addr:x}+{len} outside key 0x{key_addr:x}+{key_len}"
        ))
    }
}
