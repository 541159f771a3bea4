//! ICMP Echo transport seam and wire codecs.
//!
//! One pair of traits, two realizations behind [`open_transport`]: a
//! datagram ICMP socket, where the kernel matches replies to the socket
//! and reports TTL through ancillary data, and a raw send socket paired
//! with a passive link-layer capture that reads the true TTL straight
//! from the replied IPv4 header. Correlation logic upstream never learns
//! which one it is driving.

pub mod resolve;
mod wire;

pub use wire::{
    build_echo_request, checksum16, parse_echo_reply, parse_ipv4_header, parse_reply_frame,
    parse_reply_packet, CapturedReply, EchoReply, Ipv4Header, ETH_HEADER_LEN, ICMP_ECHO_REPLY,
    ICMP_ECHO_REQUEST, ICMP_HEADER_LEN, IPV4_MIN_HEADER_LEN, PROTOCOL_ICMP, TIMESTAMP_LEN,
};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(windows)]
pub mod windows;

use pingmux_common::{PingError, DEFAULT_POLL_MS, DEFAULT_TTL};
use std::net::Ipv4Addr;
use std::time::Instant;

/// A reply observed on a transport's reply stream.
#[derive(Debug, Clone, Copy)]
pub struct ReplyEvent {
    pub id: u16,
    pub seq: u16,
    /// Hop count the reply arrived with, already compensated where the
    /// realization reports it off by one. Negative when unknown.
    pub ttl: i32,
    pub received_at: Instant,
}

/// Send side of a transport. `packet` is a complete ICMP message; the
/// kernel supplies the IP header.
pub trait EchoSink: Send {
    /// A `ttl` of `None` keeps the socket's default hop limit.
    fn send(&mut self, target: Ipv4Addr, packet: &[u8], ttl: Option<u8>) -> Result<(), PingError>;
}

/// Reply side of a transport.
pub trait ReplySource: Send {
    /// Blocks until a reply arrives, `deadline` passes, or the stream
    /// dies. With no deadline the call still returns
    /// [`PingError::ReadTimeout`] after one poll interval so callers can
    /// check a stop flag between reads.
    fn recv(&mut self, deadline: Option<Instant>) -> Result<ReplyEvent, PingError>;
}

/// Unblocks a pending [`ReplySource::recv`] from another thread.
/// Best-effort; the reader wakes on its own poll interval regardless.
pub trait ReadInterrupt: Send + Sync {
    fn interrupt(&self);
}

/// Which realization [`open_transport`] should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Datagram when the kernel allows it, capture otherwise.
    #[default]
    Auto,
    Datagram,
    Capture,
}

/// Everything a correlation loop needs from an opened transport.
pub struct TransportHandle {
    pub sink: Box<dyn EchoSink>,
    pub source: Box<dyn ReplySource>,
    pub interrupt: Box<dyn ReadInterrupt>,
    /// Echo identifier requests must carry. The kernel may have replaced
    /// the one that was requested.
    pub echo_id: u16,
    /// Device the reply stream listens on, when the realization has one.
    pub device: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub kind: TransportKind,
    /// Interface name substring; binds the datagram socket or narrows
    /// the capture device choice.
    pub interface: Option<String>,
    pub requested_id: u16,
    pub default_ttl: u8,
    /// Narrows the capture filter to one peer. One-shot probes set this;
    /// a shared engine leaves it open.
    pub peer: Option<Ipv4Addr>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Auto,
            interface: None,
            requested_id: std::process::id() as u16,
            default_ttl: DEFAULT_TTL,
            peer: None,
        }
    }
}

#[cfg(target_os = "linux")]
pub fn open_transport(config: &TransportConfig) -> Result<TransportHandle, PingError> {
    match config.kind {
        TransportKind::Datagram => linux::open_datagram(config),
        TransportKind::Capture => linux::open_capture(config),
        TransportKind::Auto => linux::open_datagram(config).or_else(|err| {
            tracing::debug!("datagram transport unavailable ({err}); trying capture");
            linux::open_capture(config)
        }),
    }
}

#[cfg(windows)]
pub fn open_transport(config: &TransportConfig) -> Result<TransportHandle, PingError> {
    match config.kind {
        TransportKind::Datagram => Err(PingError::Unsupported(
            "datagram ICMP sockets are a Linux facility",
        )),
        TransportKind::Auto | TransportKind::Capture => windows::open_capture(config),
    }
}

#[cfg(not(any(target_os = "linux", windows)))]
pub fn open_transport(_config: &TransportConfig) -> Result<TransportHandle, PingError> {
    Err(PingError::Unsupported("no ICMP transport for this platform"))
}

/// Deadline for a read that was given none: one poll interval out.
#[cfg(any(target_os = "linux", windows))]
pub(crate) fn default_read_deadline() -> Instant {
    Instant::now() + std::time::Duration::from_millis(DEFAULT_POLL_MS)
}

/// Poll budget remaining before `deadline`, clamped so a nearly expired
/// read still gets one short poll.
#[cfg(any(target_os = "linux", windows))]
pub(crate) fn get_read_timeout(deadline: Instant) -> std::time::Duration {
    const MIN_TIMEOUT_MS: u64 = 100;
    let now = Instant::now();
    if deadline <= now {
        return std::time::Duration::from_millis(MIN_TIMEOUT_MS);
    }
    let timeout = deadline.saturating_duration_since(now);
    if timeout < std::time::Duration::from_millis(MIN_TIMEOUT_MS) {
        return std::time::Duration::from_millis(MIN_TIMEOUT_MS);
    }
    timeout
}
