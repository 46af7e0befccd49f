use crate::device::DeviceId;

/// Result alias that carries the custom [`FacadeError`] type.
pub type Result<T> = std::result::Result<T, FacadeError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum FacadeError {
    /// Free-form failure that does not fit one of the structured variants.
    #[error("{0}")]
    Message(String),
    /// The device set already holds the maximum number of devices.
    #[error("device limit of {limit} reached")]
    CapacityReached { limit: usize },
    /// Sink operation issued while no client is bound.
    #[error("no client is bound to the sink")]
    SinkNotBound,
    /// Sink operation issued by a client that is not the bound one.
    #[error("client is not the one bound to the sink")]
    ClientMismatch,
    #[error("format {width}x{height}@{frame_rate} is out of bounds")]
    InvalidFormat {
        width: u32,
        height: u32,
        frame_rate: u32,
    },
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),
    /// The desired-state document failed a top-level check; nothing was applied.
    #[error("invalid desired-state document: {0}")]
    Schema(String),
    #[error("malformed JSON: {0}")]
    Document(#[from] serde_json::Error),
    /// The initial frame buffers for a device could not be allocated.
    #[error("failed to allocate {bytes} bytes of frame buffers")]
    Allocation { bytes: usize },
    /// The host refused to register a device.
    #[error("host rejected the device: {0}")]
    Host(String),
    #[error("{0} has been poisoned")]
    Poisoned(&'static str),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl FacadeError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn schema<T: Into<String>>(reason: T) -> Self {
        Self::Schema(reason.into())
    }
}

impl From<&str> for FacadeError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for FacadeError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
