//! Host-level ping orchestration.
//!
//! [`ping_host_opts`] resolves a target, runs the retry loop, and picks
//! the probe path: local targets answer through the platform's local
//! echo, a running shared engine carries everything else, and when no
//! engine is up each probe opens a one-shot transport of its own.

use pingmux_common::{
    duration_to_ms, PingError, DEFAULT_PAYLOAD_BYTES, DEFAULT_RETRIES,
    DEFAULT_STOP_ON_FIRST_SUCCESS, DEFAULT_TIMEOUT_MS,
};
use pingmux_engine::{EngineConfig, PingEngine, ProbeOptions};
use pingmux_packets::{build_echo_request, open_transport, resolve, TransportConfig, TransportKind};
use pingmux_result::{PingResult, ProbeOutcome};
use std::net::{Ipv4Addr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::{OnceLock, RwLock};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Options for a ping run against one host.
#[derive(Debug, Clone)]
pub struct PingOptions {
    /// Per-probe reply timeout.
    pub timeout: Duration,
    /// Number of probes to send, subject to `stop_on_first_success`.
    pub retries: u32,
    /// Interface name substring for transport selection.
    pub interface: Option<String>,
    pub stop_on_first_success: bool,
    /// Extra payload bytes after the embedded timestamp.
    pub payload_size: usize,
    /// Per-probe TTL override.
    pub ttl: Option<u8>,
}

impl Default for PingOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            retries: DEFAULT_RETRIES,
            interface: None,
            stop_on_first_success: DEFAULT_STOP_ON_FIRST_SUCCESS,
            payload_size: DEFAULT_PAYLOAD_BYTES,
            ttl: None,
        }
    }
}

/// Resolves a dotted quad or hostname to an IPv4 address.
pub fn resolve_target(target: &str) -> Result<Ipv4Addr, PingError> {
    if let Ok(addr) = Ipv4Addr::from_str(target) {
        return Ok(addr);
    }
    let addrs = (target, 0u16)
        .to_socket_addrs()
        .map_err(|_| PingError::InvalidTarget(target.to_string()))?;
    for addr in addrs {
        if let std::net::SocketAddr::V4(v4) = addr {
            return Ok(*v4.ip());
        }
    }
    Err(PingError::InvalidTarget(format!(
        "{target} has no IPv4 address"
    )))
}

/// Milliseconds since first use, for the timestamp echoed in payloads.
fn monotonic_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    duration_to_ms(EPOCH.get_or_init(Instant::now).elapsed()) as u64
}

/// Pings `target` with defaults apart from the timeout.
pub fn ping_host(target: &str, timeout: Duration) -> PingResult {
    let opts = PingOptions {
        timeout,
        ..Default::default()
    };
    ping_host_opts(target, &opts)
}

/// Pings `target` up to `opts.retries` times and reports the best RTT
/// seen along with every individual probe.
pub fn ping_host_opts(target: &str, opts: &PingOptions) -> PingResult {
    let addr = match resolve_target(target) {
        Ok(addr) => addr,
        Err(err) => {
            warn!("cannot resolve {target}: {err}");
            return PingResult {
                reachable: false,
                rtt_ms: -1,
                ttl: -1,
                probes: vec![ProbeOutcome::failure(err.to_string())],
            };
        }
    };

    let attempts = opts.retries.max(1);
    let mut result = PingResult {
        reachable: false,
        rtt_ms: -1,
        ttl: -1,
        probes: Vec::with_capacity(attempts as usize),
    };
    for attempt in 0..attempts {
        let outcome = probe_once(addr, opts, u64::from(attempt));
        if outcome.success && (!result.reachable || outcome.rtt_ms < result.rtt_ms) {
            result.reachable = true;
            result.rtt_ms = outcome.rtt_ms;
            result.ttl = outcome.ttl;
        }
        let stop = outcome.success && opts.stop_on_first_success;
        result.probes.push(outcome);
        if stop {
            break;
        }
    }
    result
}

/// Sends a single probe over whichever path fits the target.
fn probe_once(addr: Ipv4Addr, opts: &PingOptions, attempt: u64) -> ProbeOutcome {
    if resolve::is_local(addr) {
        return local_probe(addr, opts);
    }
    if let Some(outcome) = engine_probe_if_running(addr, opts) {
        return outcome;
    }
    one_shot_probe(addr, opts, attempt, TransportKind::Auto)
}

#[cfg(windows)]
fn local_probe(addr: Ipv4Addr, opts: &PingOptions) -> ProbeOutcome {
    match pingmux_packets::windows::local_echo(addr, opts.timeout, opts.payload_size) {
        Ok((rtt_ms, ttl)) => ProbeOutcome::success(rtt_ms, ttl),
        Err(err) => ProbeOutcome::failure(err.to_string()),
    }
}

#[cfg(not(windows))]
fn local_probe(addr: Ipv4Addr, opts: &PingOptions) -> ProbeOutcome {
    // The kernel answers loopback echoes itself; a plain datagram socket
    // sees the reply without any capture.
    one_shot_probe(addr, opts, 0, TransportKind::Datagram)
}

/// Opens a transport for this probe alone, sends, and waits out the
/// timeout. Used when no engine is running and for local datagram pings.
fn one_shot_probe(
    addr: Ipv4Addr,
    opts: &PingOptions,
    attempt: u64,
    kind: TransportKind,
) -> ProbeOutcome {
    let config = TransportConfig {
        kind,
        interface: opts.interface.clone(),
        peer: Some(addr),
        ..Default::default()
    };
    let mut handle = match open_transport(&config) {
        Ok(handle) => handle,
        Err(err) => return ProbeOutcome::failure(err.to_string()),
    };
    let interface = handle.device.clone().unwrap_or_default();
    // Sequence 0 is reserved; retries rotate so a straggler from the
    // previous attempt cannot satisfy this one.
    let seq = (attempt % 65535 + 1) as u16;
    let packet = build_echo_request(handle.echo_id, seq, monotonic_ms(), opts.payload_size);
    let sent_at = Instant::now();
    if let Err(err) = handle.sink.send(addr, &packet, opts.ttl) {
        let mut outcome = ProbeOutcome::failure(err.to_string());
        outcome.interface = interface;
        return outcome;
    }
    let deadline = sent_at + opts.timeout;
    loop {
        match handle.source.recv(Some(deadline)) {
            Ok(event) if event.id == handle.echo_id && event.seq == seq => {
                let rtt = event.received_at.saturating_duration_since(sent_at);
                let mut outcome = ProbeOutcome::success(duration_to_ms(rtt), event.ttl);
                outcome.interface = interface;
                return outcome;
            }
            Ok(event) => {
                trace!("ignoring reply {}#{}", event.id, event.seq);
            }
            Err(err) => {
                let mut outcome = ProbeOutcome::failure(err.to_string());
                outcome.interface = interface;
                return outcome;
            }
        }
    }
}

/// Process-wide engine shared by every caller that wants one.
static ENGINE: RwLock<Option<PingEngine>> = RwLock::new(None);

/// Starts the shared engine if none is running. Idempotent; a second
/// call while a healthy engine exists is a no-op.
pub fn init_engine(interface: Option<&str>) -> Result<(), PingError> {
    if let Ok(guard) = ENGINE.read() {
        if guard.as_ref().is_some_and(PingEngine::is_running) {
            return Ok(());
        }
    }
    let config = EngineConfig {
        interface: interface.map(str::to_owned),
        ..Default::default()
    };
    let engine = PingEngine::start(config)?;
    let mut guard = ENGINE
        .write()
        .map_err(|_| PingError::Internal("engine slot poisoned".into()))?;
    if guard.as_ref().is_some_and(PingEngine::is_running) {
        // Someone else won the init race; keep theirs.
        return Ok(());
    }
    *guard = Some(engine);
    Ok(())
}

/// True while the shared engine is up and taking probes.
pub fn engine_available() -> bool {
    ENGINE
        .read()
        .map(|guard| guard.as_ref().is_some_and(PingEngine::is_running))
        .unwrap_or(false)
}

/// Single probe through the shared engine. Local targets keep using the
/// local echo path; for anything else a missing or stopped engine is an
/// error rather than a silent one-shot fallback.
pub fn engine_ping(
    target: &str,
    timeout: Duration,
    payload_size: usize,
    ttl: Option<u8>,
) -> ProbeOutcome {
    let addr = match resolve_target(target) {
        Ok(addr) => addr,
        Err(err) => return ProbeOutcome::failure(err.to_string()),
    };
    let opts = PingOptions {
        timeout,
        payload_size,
        ttl,
        ..Default::default()
    };
    if resolve::is_local(addr) {
        return local_probe(addr, &opts);
    }
    match engine_probe_if_running(addr, &opts) {
        Some(outcome) => outcome,
        None => ProbeOutcome::failure(PingError::EngineNotRunning.to_string()),
    }
}

/// Stops and discards the shared engine, failing its pending probes.
pub fn shutdown_engine() {
    // Stop under the read lock first: probes blocked inside the engine
    // hold read locks too, and they must return before the write lock
    // can be taken.
    if let Ok(guard) = ENGINE.read() {
        if let Some(engine) = guard.as_ref() {
            engine.shutdown();
        }
    }
    if let Ok(mut guard) = ENGINE.write() {
        *guard = None;
    }
}

fn engine_probe_if_running(addr: Ipv4Addr, opts: &PingOptions) -> Option<ProbeOutcome> {
    let guard = ENGINE.read().ok()?;
    let engine = guard.as_ref()?;
    if !engine.is_running() {
        return None;
    }
    let probe = ProbeOptions {
        timeout: opts.timeout,
        payload_size: opts.payload_size,
        ttl: opts.ttl,
    };
    Some(engine.probe(addr, &probe))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_accepts_dotted_quads() {
        assert_eq!(
            resolve_target("127.0.0.1").unwrap(),
            Ipv4Addr::new(127, 0, 0, 1)
        );
        assert_eq!(
            resolve_target("192.0.2.200").unwrap(),
            Ipv4Addr::new(192, 0, 2, 200)
        );
    }

    #[test]
    fn resolve_accepts_localhost() {
        let addr = resolve_target("localhost").unwrap();
        assert!(addr.is_loopback());
    }

    #[test]
    fn resolve_rejects_garbage() {
        let err = resolve_target("not a hostname!").unwrap_err();
        assert!(matches!(err, PingError::InvalidTarget(_)));
    }

    #[test]
    fn unresolvable_target_yields_one_failed_probe() {
        let result = ping_host("not a hostname!", Duration::from_millis(10));
        assert!(!result.reachable);
        assert_eq!(result.rtt_ms, -1);
        assert_eq!(result.ttl, -1);
        assert_eq!(result.probes.len(), 1);
        assert!(!result.probes[0].success);
        assert!(result.probes[0].error.contains("Invalid IPv4 target"));
    }

    #[test]
    fn monotonic_ms_does_not_go_backwards() {
        let first = monotonic_ms();
        std::thread::sleep(Duration::from_millis(2));
        assert!(monotonic_ms() >= first);
    }
}
