use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::backend::{make_backend, SystemOfRecord};
use crate::config::GatewayConfig;
use crate::correlation::CallOutcome;
use crate::error::{OcppgError, Result};
use crate::forwarding::{Direction, ForwardingPipeline, ForwardingStats};
use crate::messages::{Action, PROTOCOL_VERSION};
use crate::protocol::{self, Message};
use crate::queue::CommandTicket;
use crate::registry::{Admission, SessionRegistry};
use crate::responder::{Reply, Responder};
use crate::session::{DisconnectReason, OutboundFrame, Session, SessionOptions, SessionSnapshot, SessionState};
use crate::watchdog::Watchdog;

const EVENT_CAPACITY: usize = 1024;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Notifications about charge-point sessions.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    SessionRegistered { identity: String, session_id: u64 },
    SessionReady { identity: String, session_id: u64 },
    InboundMessage { identity: String, session_id: u64, message: Message },
    Disconnected { identity: String, session_id: u64, reason: DisconnectReason },
}

enum GatewayCommand {
    Shutdown { respond_to: oneshot::Sender<()> },
}

struct Shared {
    config: GatewayConfig,
    registry: Arc<SessionRegistry>,
    forwarder: ForwardingPipeline,
    responder: Responder,
    events: broadcast::Sender<GatewayEvent>,
    next_session_id: AtomicU64,
}

impl Shared {
    fn emit(&self, event: GatewayEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Control-plane handle to a running gateway.
#[derive(Clone)]
pub struct GatewayHandle {
    shared: Arc<Shared>,
    cmd_tx: mpsc::Sender<GatewayCommand>,
    local_addr: SocketAddr,
}

impl GatewayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queues a gateway-originated Call for a connected charge point.
    ///
    /// The returned ticket carries the reserved message id and resolves once
    /// the charge point answers, the Call times out, or the session ends.
    pub fn send_command(&self, identity: &str, action: &str, payload: Value) -> Result<CommandTicket> {
        let action = Action::from_name(action)
            .filter(Action::sent_by_central_system)
            .ok_or_else(|| OcppgError::UnknownAction(action.to_string()))?;
        if !payload.is_object() {
            return Err(OcppgError::InvalidPayload(format!("{} payload must be a JSON object", action)));
        }
        let session = self
            .shared
            .registry
            .lookup(identity)
            .ok_or_else(|| OcppgError::ChargerOffline(identity.to_string()))?;
        session.enqueue(action.as_str(), payload)
    }

    /// Sends a command and waits for its outcome.
    pub async fn call(&self, identity: &str, action: &str, payload: Value) -> Result<CallOutcome> {
        Ok(self.send_command(identity, action, payload)?.wait().await)
    }

    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.shared.registry.snapshot()
    }

    pub fn identities(&self) -> Vec<String> {
        self.shared.registry.identities()
    }

    pub fn session(&self, identity: &str) -> Option<SessionSnapshot> {
        self.shared.registry.lookup(identity).map(|s| s.snapshot())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.shared.events.subscribe()
    }

    pub fn forwarding_stats(&self) -> ForwardingStats {
        self.shared.forwarder.stats()
    }

    /// Closes every session with [`DisconnectReason::Shutdown`] and stops
    /// accepting connections.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(GatewayCommand::Shutdown { respond_to: tx })
            .await
            .map_err(|_| OcppgError::ChannelClosed)?;
        rx.await.map_err(|_| OcppgError::ChannelClosed)
    }
}

pub struct Gateway;

impl Gateway {
    /// Binds the listener and starts the gateway with the configured backend.
    pub async fn spawn(config: GatewayConfig) -> Result<GatewayHandle> {
        config.validate()?;
        let backend = make_backend(&config.backend, config.forwarding.delivery_timeout())?;
        Self::spawn_with_backend(config, backend).await
    }

    pub async fn spawn_with_backend(config: GatewayConfig, backend: Arc<dyn SystemOfRecord>) -> Result<GatewayHandle> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_address).await?;
        let local_addr = listener.local_addr()?;

        let registry = Arc::new(SessionRegistry::new(config.supersede_timeout()));
        let forwarder = ForwardingPipeline::spawn(config.forwarding.clone(), Arc::clone(&backend));
        let responder = Responder::new(backend, &config);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let watchdog = Watchdog::new(Arc::clone(&registry), &config.watchdog).spawn();

        let shared = Arc::new(Shared {
            config,
            registry,
            forwarder,
            responder,
            events,
            next_session_id: AtomicU64::new(0),
        });

        let (cmd_tx, cmd_rx) = mpsc::channel::<GatewayCommand>(16);
        tokio::spawn(accept_loop(Arc::clone(&shared), listener, cmd_rx, watchdog));
        info!(%local_addr, protocol = PROTOCOL_VERSION, "OCPP gateway listening");

        Ok(GatewayHandle { shared, cmd_tx, local_addr })
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    mut cmd_rx: mpsc::Receiver<GatewayCommand>,
    watchdog: JoinHandle<()>,
) {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let respond_to = match cmd {
                    Some(GatewayCommand::Shutdown { respond_to }) => Some(respond_to),
                    None => None,
                };
                watchdog.abort();
                let closed = shared.registry.close_all(DisconnectReason::Shutdown).await;
                info!(sessions = closed, "gateway shutting down");
                if let Some(tx) = respond_to {
                    let _ = tx.send(());
                }
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(shared, stream, peer).await {
                            debug!(%peer, error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => error!(error = %e, "accept failed"),
            }
        }
    }
}

/// Outcome of the WebSocket upgrade negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub identity: String,
    pub subprotocol: Option<String>,
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason.to_string()));
    *resp.status_mut() = status;
    resp
}

/// Takes the charge-point identity from the last path segment and picks the
/// most preferred subprotocol the client offered. An empty last segment
/// (`/ocpp/`) is rejected.
pub(crate) fn negotiate(cfg: &GatewayConfig, req: &Request) -> std::result::Result<Handshake, ErrorResponse> {
    let identity = req
        .uri()
        .path()
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    if identity.is_empty() {
        return Err(reject(StatusCode::NOT_FOUND, "missing charge point identity in path"));
    }

    let offered: Vec<&str> = req
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

    let subprotocol = cfg
        .subprotocols
        .iter()
        .find(|p| offered.contains(&p.as_str()))
        .cloned();
    if subprotocol.is_none() && !cfg.lenient_subprotocol {
        return Err(reject(StatusCode::BAD_REQUEST, "no supported OCPP subprotocol offered"));
    }
    Ok(Handshake { identity, subprotocol })
}

async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let mut handshake: Option<Handshake> = None;
    let callback = |req: &Request, mut resp: Response| -> std::result::Result<Response, ErrorResponse> {
        let agreed = negotiate(&shared.config, req).map_err(|e| {
            debug!(%peer, path = %req.uri().path(), reason = ?e.body(), "rejecting upgrade");
            e
        })?;
        if let Some(p) = &agreed.subprotocol {
            let value = HeaderValue::from_str(p)
                .map_err(|_| reject(StatusCode::INTERNAL_SERVER_ERROR, "bad subprotocol token"))?;
            resp.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }
        handshake = Some(agreed);
        Ok(resp)
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    match handshake {
        Some(handshake) => run_session(shared, ws, handshake, peer).await,
        None => Ok(()),
    }
}

async fn run_session(
    shared: Arc<Shared>,
    ws: WebSocketStream<TcpStream>,
    handshake: Handshake,
    peer: SocketAddr,
) -> Result<()> {
    let session_id = shared.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
    let Handshake { identity, subprotocol } = handshake;
    let (session, mut frames) = Session::new(
        session_id,
        identity.clone(),
        subprotocol,
        SessionOptions::from(&shared.config),
        shared.forwarder.clone(),
    );
    info!(%identity, session_id, %peer, subprotocol = ?session.subprotocol(), "charge point connected");
    // Subscribed before registration so a supersede during admission is seen.
    let mut state = session.subscribe_state();

    let admission = shared.registry.register(session.clone()).await;
    match admission {
        Admission::Fresh => {}
        Admission::Superseded { previous_session_id } => {
            info!(%identity, session_id, previous_session_id, "replaced previous session");
        }
        Admission::Rejected => info!(%identity, session_id, "gateway shutting down, session not admitted"),
    }
    let admitted = admission != Admission::Rejected;
    if admitted {
        shared.emit(GatewayEvent::SessionRegistered { identity: identity.clone(), session_id });
    }

    let (mut sink, mut stream) = ws.split();

    let outcome: Result<()> = if !admitted {
        Ok(())
    } else {
        loop {
            tokio::select! {
                biased;
                changed = state.changed() => {
                    if changed.is_err() || !state.borrow_and_update().is_open() {
                        break Ok(());
                    }
                }
                frame = frames.recv() => {
                    let msg = match frame {
                        Some(OutboundFrame::Text(text)) => WsMessage::Text(text),
                        Some(OutboundFrame::Ping(data)) => WsMessage::Ping(data),
                        None => {
                            session.close(DisconnectReason::Shutdown);
                            break Ok(());
                        }
                    };
                    if let Err(e) = sink.send(msg).await {
                        session.close(DisconnectReason::TransportError);
                        break Err(e.into());
                    }
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        session.touch();
                        let Some(reply) = handle_text(&shared, &session, &text).await else {
                            continue;
                        };
                        let encoded = protocol::encode(&reply.message);
                        if let Err(e) = sink.send(WsMessage::Text(encoded.clone())).await {
                            session.close(DisconnectReason::TransportError);
                            break Err(e.into());
                        }
                        session.forward(Direction::Outbound, &reply.message, Some(reply.action.as_str()), &encoded);
                        if reply.boot_accepted == Some(true) && session.mark_ready() {
                            info!(%identity, session_id, "boot accepted, session ready");
                            shared.emit(GatewayEvent::SessionReady { identity: identity.clone(), session_id });
                        }
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        session.touch();
                        note_decode_error(&session, &"binary frame");
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        session.close(DisconnectReason::PeerClosed);
                        break Ok(());
                    }
                    Some(Ok(_)) => session.touch(),
                    Some(Err(e)) => {
                        session.close(DisconnectReason::TransportError);
                        break Err(e.into());
                    }
                }
            }
        }
    };

    let reason = session.disconnect_reason().unwrap_or(DisconnectReason::TransportError);
    if session.state() == SessionState::Closing {
        if let Some(code) = close_code(reason) {
            let frame = CloseFrame { code, reason: Cow::Borrowed(reason_text(reason)) };
            let _ = time::timeout(CLOSE_GRACE, sink.send(WsMessage::Close(Some(frame)))).await;
        }
    }
    session.finish();
    shared.registry.unregister(&identity, &session);
    info!(%identity, session_id, ?reason, state = ?session.state(), "charge point disconnected");
    shared.emit(GatewayEvent::Disconnected { identity, session_id, reason });
    outcome
}

// The peer already sent its Close, or the socket is unusable.
fn close_code(reason: DisconnectReason) -> Option<CloseCode> {
    match reason {
        DisconnectReason::PeerClosed | DisconnectReason::TransportError => None,
        DisconnectReason::ProtocolError => Some(CloseCode::Protocol),
        DisconnectReason::LivenessTimeout | DisconnectReason::Superseded => Some(CloseCode::Policy),
        DisconnectReason::Shutdown => Some(CloseCode::Away),
    }
}

fn reason_text(reason: DisconnectReason) -> &'static str {
    match reason {
        DisconnectReason::PeerClosed => "peer closed",
        DisconnectReason::ProtocolError => "protocol error",
        DisconnectReason::LivenessTimeout => "liveness timeout",
        DisconnectReason::Superseded => "superseded by a newer connection",
        DisconnectReason::TransportError => "transport error",
        DisconnectReason::Shutdown => "gateway shutting down",
    }
}

fn note_decode_error(session: &Session, error: &dyn std::fmt::Display) {
    let errors = session.record_decode_error();
    warn!(identity = %session.identity(), %error, errors, "dropping undecodable frame");
    if session.decode_error_limit_exceeded(errors) && session.fault(DisconnectReason::ProtocolError) {
        warn!(identity = %session.identity(), errors, "too many undecodable frames, faulting session");
    }
}

/// Decodes one inbound text frame. Returns the reply to write for a Call.
async fn handle_text(shared: &Shared, session: &Session, text: &str) -> Option<Reply> {
    let msg = match protocol::decode(text) {
        Ok(msg) => msg,
        Err(e) => {
            note_decode_error(session, &e);
            return None;
        }
    };
    debug!(
        identity = %session.identity(),
        message_type = msg.type_id().as_str(),
        message_id = %msg.message_id(),
        action = ?msg.action(),
        "frame received"
    );
    shared.emit(GatewayEvent::InboundMessage {
        identity: session.identity().to_string(),
        session_id: session.id(),
        message: msg.clone(),
    });

    match &msg {
        Message::Call { message_id, action, payload } => {
            session.forward(Direction::Inbound, &msg, None, text);
            Some(shared.responder.respond(session.identity(), message_id, action, payload).await)
        }
        Message::CallResult { .. } | Message::CallError { .. } => {
            let resolved_action = match session.resolve(msg.clone()) {
                Ok(req) => Some(req.action),
                Err(e) => {
                    warn!(identity = %session.identity(), message_id = %msg.message_id(), error = %e, "reply matches no pending call");
                    None
                }
            };
            session.forward(Direction::Inbound, &msg, resolved_action.as_deref(), text);
            None
        }
    }
}
