use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, watch};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::correlation::{CallOutcome, CorrelationTable, PendingRequest};
use crate::error::{OcppgError, Result};
use crate::forwarding::{Direction, ForwardRecord, ForwardingPipeline};
use crate::protocol::{self, Message};
use crate::queue::{CommandQueue, CommandTicket, QueuedCommand};

const PROBE_PAYLOAD: &[u8] = b"ocppg";

/// Lifecycle of a charge-point session.
///
/// `Connecting -> AwaitingBoot -> Ready -> Closing -> Closed`, with
/// `Faulted` reachable from anywhere. `Closed` and `Faulted` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Connecting,
    AwaitingBoot,
    Ready,
    Closing,
    Closed,
    Faulted,
}

impl SessionState {
    pub fn is_open(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::AwaitingBoot | SessionState::Ready)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Faulted)
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (*self, next) {
            (Closed, _) | (Faulted, _) => false,
            (_, Faulted) => true,
            (Connecting, AwaitingBoot) | (AwaitingBoot, Ready) => true,
            (Closing, Closed) => true,
            (Closing, _) => false,
            (_, Closing) => true,
            _ => false,
        }
    }
}

/// Reasons why a charge-point session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DisconnectReason {
    /// The charge point closed the connection
    PeerClosed,
    /// Too many undecodable frames
    ProtocolError,
    /// No traffic within twice the watchdog interval
    LivenessTimeout,
    /// A newer connection for the same identity replaced this one
    Superseded,
    /// Reading from or writing to the socket failed
    TransportError,
    /// The gateway is shutting down
    Shutdown,
}

/// Frames queued for the connection's writer.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Ping(Vec<u8>),
}

/// Per-session limits derived from the gateway configuration.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub call_timeout: Duration,
    pub max_outstanding_calls: usize,
    pub max_decode_errors: u32,
    pub outbound_capacity: usize,
}

impl From<&GatewayConfig> for SessionOptions {
    fn from(cfg: &GatewayConfig) -> Self {
        Self {
            call_timeout: cfg.call_timeout(),
            max_outstanding_calls: cfg.max_outstanding_calls,
            max_decode_errors: cfg.max_decode_errors,
            outbound_capacity: cfg.outbound_capacity,
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&GatewayConfig::default())
    }
}

/// Read-only view of a session for the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub identity: String,
    pub session_id: u64,
    pub state: SessionState,
    pub subprotocol: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub pending_calls: usize,
    pub queued_commands: usize,
}

#[derive(Debug)]
struct Liveness {
    last_seen: Instant,
    last_seen_at: DateTime<Utc>,
    probe_sent_at: Option<Instant>,
}

// Correlation table and queue share one lock so dispatch is atomic.
#[derive(Debug, Default)]
struct Outbox {
    calls: CorrelationTable,
    queue: CommandQueue,
}

struct SessionInner {
    id: u64,
    identity: String,
    subprotocol: Option<String>,
    connected_at: DateTime<Utc>,
    options: SessionOptions,
    state: watch::Sender<SessionState>,
    reason: Mutex<Option<DisconnectReason>>,
    liveness: Mutex<Liveness>,
    outbox: Mutex<Outbox>,
    frames: mpsc::Sender<OutboundFrame>,
    decode_errors: AtomicU32,
    forwarder: ForwardingPipeline,
}

/// One live charge-point connection.
///
/// Cheap to clone; every clone refers to the same session. The socket is
/// owned by the connection task, which drains the frame receiver returned
/// from [`Session::new`].
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("identity", &self.inner.identity)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub fn new(
        id: u64,
        identity: impl Into<String>,
        subprotocol: Option<String>,
        options: SessionOptions,
        forwarder: ForwardingPipeline,
    ) -> (Session, mpsc::Receiver<OutboundFrame>) {
        let (frames, rx) = mpsc::channel(options.outbound_capacity.max(1));
        let (state, _) = watch::channel(SessionState::Connecting);
        let now = Utc::now();
        let inner = SessionInner {
            id,
            identity: identity.into(),
            subprotocol,
            connected_at: now,
            options,
            state,
            reason: Mutex::new(None),
            liveness: Mutex::new(Liveness {
                last_seen: Instant::now(),
                last_seen_at: now,
                probe_sent_at: None,
            }),
            outbox: Mutex::new(Outbox::default()),
            frames,
            decode_errors: AtomicU32::new(0),
            forwarder,
        };
        (Session { inner: Arc::new(inner) }, rx)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    pub fn subprotocol(&self) -> Option<&str> {
        self.inner.subprotocol.as_deref()
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        *self.inner.reason.lock()
    }

    pub fn is_same(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn transition(&self, next: SessionState) -> bool {
        let from = self.state();
        let changed = self.inner.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(identity = %self.inner.identity, session_id = self.inner.id, ?from, to = ?next, "session state changed");
        }
        changed
    }

    /// Waits until the session reaches `Closed` or `Faulted`.
    pub async fn closed(&self) {
        let mut rx = self.subscribe_state();
        let _ = rx.wait_for(|s| s.is_terminal()).await;
    }

    pub(crate) fn mark_registered(&self) -> bool {
        self.transition(SessionState::AwaitingBoot)
    }

    /// Completes the boot handshake and flushes held commands.
    pub fn mark_ready(&self) -> bool {
        if !self.transition(SessionState::Ready) {
            return false;
        }
        if let Err(e) = self.flush() {
            warn!(identity = %self.inner.identity, error = %e, "flush after boot aborted");
        }
        true
    }

    /// Starts closing: fails pending calls and drops queued commands.
    pub fn close(&self, reason: DisconnectReason) -> bool {
        if !self.transition(SessionState::Closing) {
            return false;
        }
        self.inner.reason.lock().get_or_insert(reason);
        self.teardown();
        true
    }

    /// Marks a closing session as fully closed once its socket is gone.
    pub(crate) fn finish(&self) -> bool {
        self.transition(SessionState::Closed)
    }

    /// Moves to the absorbing `Faulted` state; nothing is sent afterwards.
    pub fn fault(&self, reason: DisconnectReason) -> bool {
        if !self.transition(SessionState::Faulted) {
            return false;
        }
        self.inner.reason.lock().get_or_insert(reason);
        self.teardown();
        true
    }

    fn teardown(&self) {
        let mut outbox = self.inner.outbox.lock();
        let failed = outbox.calls.fail_all();
        let discarded = outbox.queue.discard_all();
        drop(outbox);
        if failed > 0 || !discarded.is_empty() {
            info!(
                identity = %self.inner.identity,
                failed_calls = failed,
                discarded_commands = discarded.len(),
                "session teardown released outbound work"
            );
        }
    }

    /// Records proof of life from the charge point.
    pub fn touch(&self) {
        let mut live = self.inner.liveness.lock();
        live.last_seen = Instant::now();
        live.last_seen_at = Utc::now();
        live.probe_sent_at = None;
    }

    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.inner.liveness.lock().last_seen)
    }

    pub fn probe_outstanding(&self) -> bool {
        self.inner.liveness.lock().probe_sent_at.is_some()
    }

    /// Queues a WebSocket ping unless one is already unanswered.
    pub fn probe(&self) -> bool {
        if !self.state().is_open() {
            return false;
        }
        let mut live = self.inner.liveness.lock();
        if live.probe_sent_at.is_some() {
            return false;
        }
        match self.inner.frames.try_send(OutboundFrame::Ping(PROBE_PAYLOAD.to_vec())) {
            Ok(()) => {
                live.probe_sent_at = Some(Instant::now());
                true
            }
            Err(_) => false,
        }
    }

    /// Counts a malformed frame and returns the running total.
    pub fn record_decode_error(&self) -> u32 {
        self.inner.decode_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn decode_error_limit_exceeded(&self, errors: u32) -> bool {
        errors > self.inner.options.max_decode_errors
    }

    /// Accepts a command for delivery to the charge point.
    ///
    /// The message id is reserved immediately. The Call is sent right away
    /// when the session is `Ready` and below its outstanding-call limit;
    /// otherwise it is held until boot completes or an earlier Call finishes.
    pub fn enqueue(&self, action: &str, payload: Value) -> Result<CommandTicket> {
        let (tx, rx) = oneshot::channel();
        let message_id = {
            let mut outbox = self.inner.outbox.lock();
            // Checked under the outbox lock so teardown cannot miss this command.
            if !self.state().is_open() {
                return Err(OcppgError::SessionClosed);
            }
            let message_id = outbox.calls.allocate_id();
            outbox.queue.push_back(QueuedCommand {
                message_id: message_id.clone(),
                action: action.to_string(),
                payload,
                enqueued_at: Instant::now(),
                result_sink: tx,
            });
            message_id
        };
        debug!(identity = %self.inner.identity, %message_id, action, state = ?self.state(), "command enqueued");

        if self.state() == SessionState::Ready {
            self.pump()?;
        }
        Ok(CommandTicket {
            identity: self.inner.identity.clone(),
            message_id,
            outcome: rx,
        })
    }

    /// Dispatches held commands in FIFO order.
    pub fn flush(&self) -> Result<usize> {
        self.pump()
    }

    /// Sends queued commands while the session is `Ready` and under its
    /// outstanding-call limit. A closed writer aborts the flush and drops
    /// what is left.
    pub(crate) fn pump(&self) -> Result<usize> {
        let mut sent = 0;
        loop {
            let mut outbox = self.inner.outbox.lock();
            if self.state() != SessionState::Ready
                || outbox.calls.len() >= self.inner.options.max_outstanding_calls
                || outbox.queue.is_empty()
            {
                return Ok(sent);
            }
            let permit = match self.inner.frames.try_reserve() {
                Ok(permit) => permit,
                // Writer is backed up; retry on the next reply or watchdog tick.
                Err(TrySendError::Full(())) => return Ok(sent),
                Err(TrySendError::Closed(())) => {
                    let discarded = outbox.queue.discard_all();
                    for id in &discarded {
                        outbox.calls.release(id);
                    }
                    drop(outbox);
                    warn!(
                        identity = %self.inner.identity,
                        discarded = discarded.len(),
                        "connection writer gone, discarding queued commands"
                    );
                    return Err(OcppgError::SessionClosed);
                }
            };
            let Some(cmd) = outbox.queue.pop_front() else {
                return Ok(sent);
            };
            let call = Message::call(cmd.message_id.clone(), cmd.action.clone(), cmd.payload);
            let text = protocol::encode(&call);
            outbox.calls.track_reserved(
                cmd.message_id.clone(),
                &cmd.action,
                self.inner.options.call_timeout,
                cmd.result_sink,
            );
            permit.send(OutboundFrame::Text(text.clone()));
            drop(outbox);

            debug!(
                identity = %self.inner.identity,
                message_id = %cmd.message_id,
                action = %cmd.action,
                queued_for_ms = cmd.enqueued_at.elapsed().as_millis() as u64,
                "call dispatched"
            );
            self.forward(Direction::Outbound, &call, None, &text);
            sent += 1;
        }
    }

    /// Matches a CallResult/CallError against the pending Calls.
    pub fn resolve(&self, reply: Message) -> Result<PendingRequest> {
        let (message_id, outcome) = CallOutcome::from_reply(reply)
            .ok_or_else(|| OcppgError::CorrelationMiss("not a reply".to_string()))?;
        let resolved = self.inner.outbox.lock().calls.resolve(&message_id, outcome)?;
        debug!(
            identity = %self.inner.identity,
            %message_id,
            action = %resolved.action,
            latency_ms = resolved.created_at.elapsed().as_millis() as u64,
            "call resolved"
        );
        if let Err(e) = self.pump() {
            debug!(identity = %self.inner.identity, error = %e, "dispatch after reply stopped");
        }
        Ok(resolved)
    }

    /// Times out overdue Calls, then lets the next queued command through.
    pub fn expire_due(&self, now: Instant) -> Vec<PendingRequest> {
        let expired = self.inner.outbox.lock().calls.expire_due(now);
        for req in &expired {
            warn!(identity = %self.inner.identity, message_id = %req.message_id, action = %req.action, "call timed out");
        }
        if let Err(e) = self.pump() {
            debug!(identity = %self.inner.identity, error = %e, "dispatch after expiry stopped");
        }
        expired
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.outbox.lock().calls.len()
    }

    pub fn has_pending(&self, message_id: &str) -> bool {
        self.inner.outbox.lock().calls.contains(message_id)
    }

    pub fn queued_commands(&self) -> usize {
        self.inner.outbox.lock().queue.len()
    }

    /// Hands an envelope to the forwarding pipeline without waiting.
    pub fn forward(&self, direction: Direction, msg: &Message, action: Option<&str>, raw: &str) {
        let record = ForwardRecord::new(&self.inner.identity, direction, msg, action, raw);
        self.inner.forwarder.submit(record);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let (pending_calls, queued_commands) = {
            let outbox = self.inner.outbox.lock();
            (outbox.calls.len(), outbox.queue.len())
        };
        SessionSnapshot {
            identity: self.inner.identity.clone(),
            session_id: self.inner.id,
            state: self.state(),
            subprotocol: self.inner.subprotocol.clone(),
            connected_at: self.inner.connected_at,
            last_seen_at: self.inner.liveness.lock().last_seen_at,
            pending_calls,
            queued_commands,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::NullSystemOfRecord;
    use crate::forwarding::ForwardingConfig;
    use serde_json::json;

    pub(crate) fn test_session(
        identity: &str,
        options: SessionOptions,
    ) -> (Session, mpsc::Receiver<OutboundFrame>) {
        let forwarder =
            ForwardingPipeline::spawn(ForwardingConfig::default(), Arc::new(NullSystemOfRecord));
        Session::new(1, identity, Some("ocpp1.6".into()), options, forwarder)
    }

    fn sent_call(frame: OutboundFrame) -> Message {
        match frame {
            OutboundFrame::Text(text) => protocol::decode(&text).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn state_machine_allows_only_forward_moves() {
        use SessionState::*;
        assert!(Connecting.can_transition_to(AwaitingBoot));
        assert!(AwaitingBoot.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));
        assert!(Ready.can_transition_to(Faulted));
        assert!(Closing.can_transition_to(Faulted));
        assert!(!Connecting.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(AwaitingBoot));
        assert!(!Closing.can_transition_to(Ready));
        assert!(!Closed.can_transition_to(Faulted));
        assert!(!Faulted.can_transition_to(Closing));
        assert!(!Ready.can_transition_to(Closed));
    }

    #[tokio::test]
    async fn commands_are_held_until_boot() {
        let (session, mut frames) = test_session("CP-001", SessionOptions::default());
        session.mark_registered();

        let ticket = session.enqueue("Reset", json!({"type": "Soft"})).unwrap();
        assert_eq!(session.queued_commands(), 1);
        assert!(frames.try_recv().is_err());

        assert!(session.mark_ready());
        let call = sent_call(frames.try_recv().unwrap());
        assert_eq!(call.message_id(), ticket.message_id);
        assert_eq!(call.action(), Some("Reset"));
        assert!(frames.try_recv().is_err());
        assert!(session.has_pending(&ticket.message_id));
        assert_eq!(session.queued_commands(), 0);
    }

    #[tokio::test]
    async fn single_outstanding_call_is_enforced() {
        let (session, mut frames) = test_session("CP-002", SessionOptions::default());
        session.mark_registered();
        session.mark_ready();

        let first = session.enqueue("Reset", json!({"type": "Hard"})).unwrap();
        let second = session.enqueue("ClearCache", json!({})).unwrap();
        let call = sent_call(frames.try_recv().unwrap());
        assert_eq!(call.message_id(), first.message_id);
        assert!(frames.try_recv().is_err());
        assert_eq!(session.queued_commands(), 1);

        let resolved = session
            .resolve(Message::call_result(first.message_id.clone(), json!({"status": "Accepted"})))
            .unwrap();
        assert_eq!(resolved.action, "Reset");
        assert_eq!(first.wait().await, CallOutcome::Result(json!({"status": "Accepted"})));

        let call = sent_call(frames.try_recv().unwrap());
        assert_eq!(call.message_id(), second.message_id);
    }

    #[tokio::test]
    async fn stray_replies_do_not_disturb_the_session() {
        let (session, _frames) = test_session("CP-003", SessionOptions::default());
        session.mark_registered();
        let err = session.resolve(Message::call_result("nope", json!({}))).unwrap_err();
        assert!(matches!(err, OcppgError::CorrelationMiss(_)));
        assert_eq!(session.state(), SessionState::AwaitingBoot);
    }

    #[tokio::test]
    async fn close_fails_pending_and_queued_work() {
        let (session, _frames) = test_session("CP-004", SessionOptions::default());
        session.mark_registered();
        session.mark_ready();
        let sent = session.enqueue("Reset", json!({"type": "Soft"})).unwrap();
        let held = session.enqueue("ClearCache", json!({})).unwrap();

        assert!(session.close(DisconnectReason::PeerClosed));
        assert_eq!(sent.wait().await, CallOutcome::SessionClosed);
        assert_eq!(held.wait().await, CallOutcome::SessionClosed);
        assert_eq!(session.pending_calls(), 0);
        assert!(matches!(
            session.enqueue("Reset", json!({})),
            Err(OcppgError::SessionClosed)
        ));
        assert!(session.finish());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.disconnect_reason(), Some(DisconnectReason::PeerClosed));
    }

    #[tokio::test]
    async fn faulted_is_absorbing() {
        let (session, _frames) = test_session("CP-005", SessionOptions::default());
        session.mark_registered();
        assert!(session.fault(DisconnectReason::ProtocolError));
        assert!(!session.close(DisconnectReason::PeerClosed));
        assert!(!session.mark_ready());
        assert!(!session.probe());
        assert_eq!(session.state(), SessionState::Faulted);
        assert_eq!(session.disconnect_reason(), Some(DisconnectReason::ProtocolError));
    }

    #[tokio::test]
    async fn closed_writer_aborts_flush() {
        let (session, frames) = test_session("CP-006", SessionOptions::default());
        session.mark_registered();
        let first = session.enqueue("Reset", json!({})).unwrap();
        let second = session.enqueue("ClearCache", json!({})).unwrap();
        drop(frames);

        session.transition(SessionState::Ready);
        assert!(matches!(session.flush(), Err(OcppgError::SessionClosed)));
        assert_eq!(session.queued_commands(), 0);
        assert_eq!(session.pending_calls(), 0);
        assert_eq!(first.wait().await, CallOutcome::SessionClosed);
        assert_eq!(second.wait().await, CallOutcome::SessionClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_call_lets_next_command_through() {
        let options = SessionOptions { call_timeout: Duration::from_secs(5), ..SessionOptions::default() };
        let (session, mut frames) = test_session("CP-007", options);
        session.mark_registered();
        session.mark_ready();
        let first = session.enqueue("Reset", json!({})).unwrap();
        let _second = session.enqueue("ClearCache", json!({})).unwrap();
        let _ = frames.try_recv().unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        let expired = session.expire_due(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(first.wait().await, CallOutcome::Timeout);
        let call = sent_call(frames.try_recv().unwrap());
        assert_eq!(call.action(), Some("ClearCache"));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_is_sent_once_until_traffic() {
        let (session, mut frames) = test_session("CP-008", SessionOptions::default());
        session.mark_registered();
        assert!(session.probe());
        assert!(!session.probe());
        assert_eq!(frames.try_recv().unwrap(), OutboundFrame::Ping(PROBE_PAYLOAD.to_vec()));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(session.idle(Instant::now()) >= Duration::from_secs(3));
        session.touch();
        assert!(!session.probe_outstanding());
        assert_eq!(session.idle(Instant::now()), Duration::ZERO);
    }
}
