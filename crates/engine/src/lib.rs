//! Correlating ping engine: one shared transport, many concurrent
//! probes.
//!
//! A single consumer thread reads every reply off the transport and
//! hands it to whichever caller registered the reply's `(id, seq)` key.
//! Callers block on a private one-shot slot for at most their own
//! timeout; a slow peer cannot wedge anyone else. Timeout and reply can
//! race on the same key, and exactly one side wins: whoever removes the
//! table entry owns the probe's outcome.

use pingmux_common::{
    duration_to_ms, PingError, DEFAULT_PAYLOAD_BYTES, DEFAULT_TIMEOUT_MS, DEFAULT_TTL,
};
use pingmux_packets::{
    build_echo_request, open_transport, EchoSink, ReadInterrupt, ReplyEvent, ReplySource,
    TransportConfig, TransportHandle, TransportKind,
};
use pingmux_result::ProbeOutcome;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const STATE_RUNNING: u8 = 0;
const STATE_SHUTTING_DOWN: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Sequence numbers are process-wide so two engines sharing an ident
/// never hand out colliding correlation keys.
static NEXT_SEQ: AtomicU16 = AtomicU16::new(1);

fn next_seq() -> u16 {
    NEXT_SEQ.fetch_add(1, Ordering::SeqCst)
}

type WaiterTable = Arc<Mutex<HashMap<(u16, u16), SyncSender<ReplyEvent>>>>;

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub kind: TransportKind,
    /// Interface hint passed through to the transport.
    pub interface: Option<String>,
    /// Socket default TTL; per-probe overrides ride on top.
    pub default_ttl: Option<u8>,
}

/// Per-probe options.
#[derive(Debug, Clone, Copy)]
pub struct ProbeOptions {
    pub timeout: Duration,
    /// Extra payload bytes after the embedded timestamp.
    pub payload_size: usize,
    pub ttl: Option<u8>,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            payload_size: DEFAULT_PAYLOAD_BYTES,
            ttl: None,
        }
    }
}

pub struct PingEngine {
    sink: Mutex<Box<dyn EchoSink>>,
    waiters: WaiterTable,
    state: Arc<AtomicU8>,
    interrupt: Box<dyn ReadInterrupt>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    echo_id: u16,
    device: Option<String>,
    started_at: Instant,
}

impl PingEngine {
    /// Opens a transport and starts the reply consumer.
    pub fn start(config: EngineConfig) -> Result<Self, PingError> {
        let transport = TransportConfig {
            kind: config.kind,
            interface: config.interface,
            default_ttl: config.default_ttl.unwrap_or(DEFAULT_TTL),
            ..Default::default()
        };
        let handle = open_transport(&transport)?;
        debug!(
            "engine transport open, echo id {}, device {:?}",
            handle.echo_id, handle.device
        );
        Self::with_transport(handle)
    }

    /// Runs the engine over an already-open transport.
    pub fn with_transport(handle: TransportHandle) -> Result<Self, PingError> {
        let TransportHandle {
            sink,
            source,
            interrupt,
            echo_id,
            device,
        } = handle;
        let waiters: WaiterTable = Arc::new(Mutex::new(HashMap::new()));
        let state = Arc::new(AtomicU8::new(STATE_RUNNING));
        let consumer = spawn_consumer(source, waiters.clone(), state.clone())
            .map_err(|err| PingError::Internal(format!("failed to spawn reply consumer: {err}")))?;
        Ok(Self {
            sink: Mutex::new(sink),
            waiters,
            state,
            interrupt,
            consumer: Mutex::new(Some(consumer)),
            echo_id,
            device,
            started_at: Instant::now(),
        })
    }

    /// True while the consumer is alive and accepting probes.
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_RUNNING
    }

    pub fn echo_id(&self) -> u16 {
        self.echo_id
    }

    /// Device the reply stream listens on, when the transport has one.
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    /// Sends one probe and blocks until its reply, its timeout, or
    /// engine shutdown, whichever comes first. Failures come back as
    /// unsuccessful outcomes, never panics or hangs.
    pub fn probe(&self, target: Ipv4Addr, opts: &ProbeOptions) -> ProbeOutcome {
        if !self.is_running() {
            return self.outcome_failure(PingError::EngineNotRunning);
        }
        let seq = next_seq();
        let key = (self.echo_id, seq);
        let (slot, waiter) = sync_channel::<ReplyEvent>(1);
        if let Err(err) = self.register_waiter(key, slot) {
            return self.outcome_failure(err);
        }

        let timestamp_ms = duration_to_ms(self.started_at.elapsed()) as u64;
        let packet = build_echo_request(self.echo_id, seq, timestamp_ms, opts.payload_size);
        let sent_at = Instant::now();
        let send_result = match self.sink.lock() {
            Ok(mut sink) => sink.send(target, &packet, opts.ttl),
            Err(_) => Err(PingError::Internal("send mutex poisoned".into())),
        };
        if let Err(err) = send_result {
            self.remove_waiter(key);
            return self.outcome_failure(err);
        }
        trace!("sent echo request {}#{} to {}", key.0, key.1, target);

        match waiter.recv_timeout(opts.timeout) {
            Ok(event) => self.outcome_success(sent_at, event),
            Err(RecvTimeoutError::Timeout) => match self.resolve_timeout(key, &waiter) {
                Some(event) => self.outcome_success(sent_at, event),
                None => self.outcome_failure(PingError::ReadTimeout),
            },
            Err(RecvTimeoutError::Disconnected) => self.outcome_failure(PingError::EngineShutDown),
        }
    }

    /// Stops the consumer and fails every pending probe. Callers blocked
    /// in [`PingEngine::probe`] return promptly; the transport closes
    /// once its last handle drops.
    pub fn shutdown(&self) {
        let consumer = match self.consumer.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(consumer) = consumer else {
            return;
        };
        let _ = self.state.compare_exchange(
            STATE_RUNNING,
            STATE_SHUTTING_DOWN,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.interrupt.interrupt();
        if consumer.join().is_err() {
            warn!("reply consumer panicked during shutdown");
        }
        debug!("ping engine stopped");
    }

    fn register_waiter(&self, key: (u16, u16), slot: SyncSender<ReplyEvent>) -> Result<(), PingError> {
        let mut table = self
            .waiters
            .lock()
            .map_err(|_| PingError::Internal("waiter table poisoned".into()))?;
        if table.contains_key(&key) {
            // A full lap of the sequence counter with this probe still
            // pending; fail the new probe, not the table.
            return Err(PingError::KeyCollision { id: key.0, seq: key.1 });
        }
        table.insert(key, slot);
        Ok(())
    }

    fn remove_waiter(&self, key: (u16, u16)) -> bool {
        match self.waiters.lock() {
            Ok(mut table) => table.remove(&key).is_some(),
            Err(_) => false,
        }
    }

    /// Settles a timeout race. If the entry is still ours the timeout
    /// wins and the key is retired; if the consumer got there first the
    /// reply is already buffered in the slot.
    fn resolve_timeout(&self, key: (u16, u16), waiter: &Receiver<ReplyEvent>) -> Option<ReplyEvent> {
        if self.remove_waiter(key) {
            None
        } else {
            waiter.try_recv().ok()
        }
    }

    fn outcome_success(&self, sent_at: Instant, event: ReplyEvent) -> ProbeOutcome {
        let rtt = event.received_at.saturating_duration_since(sent_at);
        let mut outcome = ProbeOutcome::success(duration_to_ms(rtt), event.ttl);
        outcome.interface = self.device.clone().unwrap_or_default();
        outcome
    }

    fn outcome_failure(&self, err: PingError) -> ProbeOutcome {
        let mut outcome = ProbeOutcome::failure(err.to_string());
        outcome.interface = self.device.clone().unwrap_or_default();
        outcome
    }
}

impl Drop for PingEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_consumer(
    mut source: Box<dyn ReplySource>,
    waiters: WaiterTable,
    state: Arc<AtomicU8>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("ping-reply-consumer".into())
        .spawn(move || {
            consumer_loop(source.as_mut(), &waiters, &state);
            drain_waiters(&waiters);
            state.store(STATE_STOPPED, Ordering::SeqCst);
        })
}

fn consumer_loop(source: &mut dyn ReplySource, waiters: &WaiterTable, state: &AtomicU8) {
    loop {
        if state.load(Ordering::SeqCst) != STATE_RUNNING {
            return;
        }
        match source.recv(None) {
            Ok(event) => {
                let Ok(mut table) = waiters.lock() else {
                    warn!("waiter table poisoned; stopping consumer");
                    return;
                };
                match table.remove(&(event.id, event.seq)) {
                    Some(slot) => {
                        // Still under the table lock: a caller that loses
                        // the timeout race finds the reply buffered once
                        // it sees its entry gone.
                        let _ = slot.try_send(event);
                    }
                    None => {
                        trace!("reply {}#{} has no waiter", event.id, event.seq);
                    }
                }
            }
            Err(err) if err.is_retryable() => continue,
            Err(err) => {
                warn!("reply stream failed: {err}");
                return;
            }
        }
    }
}

fn drain_waiters(waiters: &WaiterTable) {
    if let Ok(mut table) = waiters.lock() {
        if !table.is_empty() {
            debug!("failing {} pending probes on shutdown", table.len());
        }
        // Dropping the slots disconnects every pending caller.
        table.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pingmux_packets::{ICMP_HEADER_LEN, TIMESTAMP_LEN};
    use std::sync::mpsc::{channel, Sender};

    /// Sink that answers every request through the paired source, with
    /// the reply TTL derived from the extra payload length so tests can
    /// tell probes apart end to end.
    struct EchoBackSink {
        replies: Sender<ReplyEvent>,
        respond: bool,
    }

    impl EchoSink for EchoBackSink {
        fn send(
            &mut self,
            _target: Ipv4Addr,
            packet: &[u8],
            _ttl: Option<u8>,
        ) -> Result<(), PingError> {
            if !self.respond {
                return Ok(());
            }
            let id = u16::from_be_bytes([packet[4], packet[5]]);
            let seq = u16::from_be_bytes([packet[6], packet[7]]);
            let extra = packet.len() - ICMP_HEADER_LEN - TIMESTAMP_LEN;
            let _ = self.replies.send(ReplyEvent {
                id,
                seq,
                ttl: 100 + extra as i32,
                received_at: Instant::now(),
            });
            Ok(())
        }
    }

    /// Sink that only records what was asked of it.
    struct RecordingSink {
        sent: Arc<Mutex<Vec<(u16, u16, Option<u8>)>>>,
    }

    impl EchoSink for RecordingSink {
        fn send(
            &mut self,
            _target: Ipv4Addr,
            packet: &[u8],
            ttl: Option<u8>,
        ) -> Result<(), PingError> {
            let id = u16::from_be_bytes([packet[4], packet[5]]);
            let seq = u16::from_be_bytes([packet[6], packet[7]]);
            self.sent.lock().unwrap().push((id, seq, ttl));
            Ok(())
        }
    }

    struct BrokenSink;

    impl EchoSink for BrokenSink {
        fn send(
            &mut self,
            _target: Ipv4Addr,
            _packet: &[u8],
            _ttl: Option<u8>,
        ) -> Result<(), PingError> {
            Err(PingError::SendFailed(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "no",
            )))
        }
    }

    struct ChannelSource {
        replies: std::sync::mpsc::Receiver<ReplyEvent>,
    }

    impl ReplySource for ChannelSource {
        fn recv(&mut self, deadline: Option<Instant>) -> Result<ReplyEvent, PingError> {
            let timeout = deadline
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_millis(20));
            match self.replies.recv_timeout(timeout) {
                Ok(event) => Ok(event),
                Err(RecvTimeoutError::Timeout) => Err(PingError::ReadTimeout),
                Err(RecvTimeoutError::Disconnected) => {
                    Err(PingError::Internal("mock stream closed".into()))
                }
            }
        }
    }

    struct FailingSource;

    impl ReplySource for FailingSource {
        fn recv(&mut self, _deadline: Option<Instant>) -> Result<ReplyEvent, PingError> {
            Err(PingError::Internal("reply stream closed".into()))
        }
    }

    struct NoopInterrupt;

    impl ReadInterrupt for NoopInterrupt {
        fn interrupt(&self) {}
    }

    fn engine_with(sink: Box<dyn EchoSink>, source: Box<dyn ReplySource>) -> PingEngine {
        PingEngine::with_transport(TransportHandle {
            sink,
            source,
            interrupt: Box::new(NoopInterrupt),
            echo_id: 0x42,
            device: Some("mock0".into()),
        })
        .expect("engine")
    }

    fn echo_engine(respond: bool) -> PingEngine {
        let (tx, rx) = channel();
        engine_with(
            Box::new(EchoBackSink {
                replies: tx,
                respond,
            }),
            Box::new(ChannelSource { replies: rx }),
        )
    }

    fn quick(timeout_ms: u64) -> ProbeOptions {
        ProbeOptions {
            timeout: Duration::from_millis(timeout_ms),
            ..Default::default()
        }
    }

    #[test]
    fn probe_resolves_with_reply() {
        let engine = echo_engine(true);
        let outcome = engine.probe(Ipv4Addr::new(192, 0, 2, 1), &quick(2000));
        assert!(outcome.success, "unexpected failure: {}", outcome.error);
        assert_eq!(outcome.ttl, 100);
        assert!(outcome.rtt_ms >= 0);
        assert_eq!(outcome.interface, "mock0");
    }

    #[test]
    fn concurrent_probes_route_by_key() {
        let engine = Arc::new(echo_engine(true));
        let mut handles = Vec::new();
        for payload in 0..16usize {
            let engine = engine.clone();
            handles.push(std::thread::spawn(move || {
                let opts = ProbeOptions {
                    timeout: Duration::from_secs(5),
                    payload_size: payload,
                    ttl: None,
                };
                let outcome = engine.probe(Ipv4Addr::new(192, 0, 2, 1), &opts);
                (payload, outcome)
            }));
        }
        for handle in handles {
            let (payload, outcome) = handle.join().unwrap();
            assert!(outcome.success, "probe {payload} failed: {}", outcome.error);
            // The mock encodes the payload size in the TTL, so any
            // cross-wired reply shows up immediately.
            assert_eq!(outcome.ttl, 100 + payload as i32);
        }
    }

    #[test]
    fn timeout_retires_the_waiter_key() {
        let engine = echo_engine(false);
        let started = Instant::now();
        let outcome = engine.probe(Ipv4Addr::new(192, 0, 2, 1), &quick(50));
        assert!(!outcome.success);
        assert_eq!(outcome.rtt_ms, -1);
        assert!(!outcome.error.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(engine.waiters.lock().unwrap().is_empty());
        assert!(engine.is_running());
    }

    #[test]
    fn send_failure_retires_the_waiter_key() {
        let (_tx, rx) = channel();
        let engine = engine_with(Box::new(BrokenSink), Box::new(ChannelSource { replies: rx }));
        let outcome = engine.probe(Ipv4Addr::new(192, 0, 2, 1), &quick(1000));
        assert!(!outcome.success);
        assert!(outcome.error.contains("send"));
        assert!(engine.waiters.lock().unwrap().is_empty());
    }

    #[test]
    fn probe_passes_per_probe_ttl_to_the_sink() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let (_tx, rx) = channel();
        let engine = engine_with(
            Box::new(RecordingSink { sent: sent.clone() }),
            Box::new(ChannelSource { replies: rx }),
        );
        let opts = ProbeOptions {
            timeout: Duration::from_millis(10),
            payload_size: 0,
            ttl: Some(5),
        };
        let _ = engine.probe(Ipv4Addr::new(192, 0, 2, 1), &opts);
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 0x42);
        assert_eq!(sent[0].2, Some(5));
    }

    #[test]
    fn shutdown_unblocks_pending_probes() {
        let engine = Arc::new(echo_engine(false));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let engine = engine.clone();
            handles.push(std::thread::spawn(move || {
                engine.probe(Ipv4Addr::new(192, 0, 2, 1), &quick(5000))
            }));
        }
        std::thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        engine.shutdown();
        for handle in handles {
            let outcome = handle.join().unwrap();
            assert!(!outcome.success);
            assert!(
                outcome.error.contains("shut down") || outcome.error.contains("timed out"),
                "unexpected error: {}",
                outcome.error
            );
        }
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!engine.is_running());
    }

    #[test]
    fn probe_after_shutdown_reports_not_running() {
        let engine = echo_engine(true);
        engine.shutdown();
        let outcome = engine.probe(Ipv4Addr::new(192, 0, 2, 1), &quick(100));
        assert!(!outcome.success);
        assert!(outcome.error.contains("not running"));
    }

    #[test]
    fn consumer_death_marks_engine_stopped() {
        let (tx, _rx) = channel();
        let engine = engine_with(
            Box::new(EchoBackSink {
                replies: tx,
                respond: false,
            }),
            Box::new(FailingSource),
        );
        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!engine.is_running());
        let outcome = engine.probe(Ipv4Addr::new(192, 0, 2, 1), &quick(100));
        assert!(outcome.error.contains("not running"));
    }

    #[test]
    fn late_reply_is_dropped_and_engine_survives() {
        let (tx, rx) = channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_with(
            Box::new(RecordingSink { sent: sent.clone() }),
            Box::new(ChannelSource { replies: rx }),
        );
        let outcome = engine.probe(Ipv4Addr::new(192, 0, 2, 1), &quick(50));
        assert!(!outcome.success);

        // Reply to a probe whose caller already gave up.
        let (id, seq, _) = sent.lock().unwrap()[0];
        tx.send(ReplyEvent {
            id,
            seq,
            ttl: 64,
            received_at: Instant::now(),
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(engine.is_running());
        assert!(engine.waiters.lock().unwrap().is_empty());
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let engine = echo_engine(true);
        let key = (0x42, 9999);
        let (slot_a, _waiter_a) = sync_channel(1);
        let (slot_b, _waiter_b) = sync_channel(1);
        engine.register_waiter(key, slot_a).unwrap();
        let err = engine.register_waiter(key, slot_b).unwrap_err();
        assert!(matches!(err, PingError::KeyCollision { id: 0x42, seq: 9999 }));
        engine.remove_waiter(key);
    }

    #[test]
    fn timeout_race_has_exactly_one_winner() {
        let engine = echo_engine(false);
        let key = (0x42, 7777);

        // Caller wins: the entry is still present, so the timeout
        // retires it and no reply exists.
        let (slot, waiter) = sync_channel(1);
        engine.register_waiter(key, slot).unwrap();
        assert!(engine.resolve_timeout(key, &waiter).is_none());
        assert!(engine.waiters.lock().unwrap().is_empty());

        // Consumer wins: entry already removed and the reply buffered,
        // exactly what the consumer does under the table lock.
        let (slot, waiter) = sync_channel(1);
        engine.register_waiter(key, slot).unwrap();
        {
            let mut table = engine.waiters.lock().unwrap();
            let slot = table.remove(&key).unwrap();
            slot.try_send(ReplyEvent {
                id: key.0,
                seq: key.1,
                ttl: 61,
                received_at: Instant::now(),
            })
            .unwrap();
        }
        let event = engine.resolve_timeout(key, &waiter).expect("buffered reply");
        assert_eq!(event.ttl, 61);
    }
}
