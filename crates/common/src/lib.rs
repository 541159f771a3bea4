use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_RETRIES: u32 = 1;
pub const DEFAULT_PAYLOAD_BYTES: usize = 0;
pub const DEFAULT_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_TTL: u8 = 64;
pub const DEFAULT_POLL_MS: u64 = 100;
pub const DEFAULT_STOP_ON_FIRST_SUCCESS: bool = true;

/// Main error type for ping operations.
#[derive(Error, Debug)]
pub enum PingError {
    // Socket/IO errors
    #[error("Failed to create socket: {0}")]
    SocketCreation(#[source] std::io::Error),

    #[error("Failed to open capture on {device}: {source}")]
    CaptureOpen {
        device: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to set socket option {option}: {source}")]
    SocketOption {
        option: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Read timeout exceeded")]
    ReadTimeout,

    #[error("Send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    // Packet errors
    #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Packet did not match the probe")]
    PacketMismatch,

    // Configuration errors
    #[error("Invalid IPv4 target: {0}")]
    InvalidTarget(String),

    #[error("No capture device available")]
    NoCaptureDevice,

    #[error("Not supported on this platform: {0}")]
    Unsupported(&'static str),

    // Engine errors
    #[error("Engine is not running")]
    EngineNotRunning,

    #[error("Engine shut down while the probe was pending")]
    EngineShutDown,

    #[error("Correlation key ({id}, {seq}) already in flight")]
    KeyCollision { id: u16, seq: u16 },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl PingError {
    /// Returns true if this error means "keep reading packets" rather than
    /// giving up. Shared sockets and captures see plenty of traffic that
    /// belongs to other probes or other processes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ReadTimeout
                | Self::PacketMismatch
                | Self::MalformedPacket(_)
                | Self::PacketTooShort { .. }
        )
    }
}

impl From<std::io::Error> for PingError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => PingError::ReadTimeout,
            std::io::ErrorKind::WouldBlock => PingError::ReadTimeout,
            _ => PingError::Internal(err.to_string()),
        }
    }
}

/// Whole-millisecond RTT as reported to callers.
pub fn duration_to_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
