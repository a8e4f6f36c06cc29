//! WebSocket relay.
//!
//! # Responsibilities
//! - Dial the upstream WebSocket on behalf of an accepted client upgrade
//! - Echo the subprotocol the upstream selected back to the client
//! - Relay frames both ways with bounded buffering and write deadlines
//! - Propagate close intent and pick close codes when a side fails
//!
//! # Data Flow
//! ```text
//! Client ──frames──▶ [reader]─bounded queue─▶[writer] ──frames──▶ Upstream
//! Client ◀──frames── [writer]◀─bounded queue─[reader] ◀──frames── Upstream
//! ```
//!
//! # Design Decisions
//! - Each direction is a reader and a writer joined by a bounded queue;
//!   a full queue or a stalled write is a slow consumer, never unbounded growth
//! - Payloads are relayed untouched; pings are also answered locally by the
//!   WebSocket layers
//! - One abort token per session stops all four halves together

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame as ClientCloseFrame, Message as ClientMessage, WebSocket, WebSocketUpgrade};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use bytes::Bytes;
use futures_util::future::{self, Either};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    protocol::{frame::coding::CloseCode, CloseFrame as UpstreamCloseFrame},
    Message as UpstreamMessage,
};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::config::{TimeoutConfig, WebSocketConfig};
use crate::error::{ProxyError, TimeoutPhase};
use crate::health::passive;
use crate::load_balancer::{RequestContext, UpstreamTarget};
use crate::net::session::{SessionEntry, SessionState};
use crate::net::SessionGuard;
use crate::observability::MetricEvent;
use crate::security::headers;

use super::server::AppState;

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_TOO_BIG: u16 = 1009;
pub const CLOSE_BAD_GATEWAY: u16 = 1014;

/// A frame in transit, independent of which WebSocket library produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<(u16, String)>),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(t) => t.len(),
            Frame::Binary(b) | Frame::Ping(b) | Frame::Pong(b) => b.len(),
            Frame::Close(Some((_, reason))) => 2 + reason.len(),
            Frame::Close(None) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Frame::Close(_))
    }

    fn from_upstream(message: UpstreamMessage) -> Option<Self> {
        Some(match message {
            UpstreamMessage::Text(t) => Frame::Text(t.as_str().to_owned()),
            UpstreamMessage::Binary(b) => Frame::Binary(b),
            UpstreamMessage::Ping(b) => Frame::Ping(b),
            UpstreamMessage::Pong(b) => Frame::Pong(b),
            UpstreamMessage::Close(c) => Frame::Close(c.map(|f| (u16::from(f.code), f.reason.as_str().to_owned()))),
            UpstreamMessage::Frame(_) => return None,
        })
    }

    fn into_upstream(self) -> UpstreamMessage {
        match self {
            Frame::Text(t) => UpstreamMessage::Text(t.into()),
            Frame::Binary(b) => UpstreamMessage::Binary(b),
            Frame::Ping(b) => UpstreamMessage::Ping(b),
            Frame::Pong(b) => UpstreamMessage::Pong(b),
            Frame::Close(c) => UpstreamMessage::Close(c.map(|(code, reason)| UpstreamCloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            })),
        }
    }
}

impl From<ClientMessage> for Frame {
    fn from(message: ClientMessage) -> Self {
        match message {
            ClientMessage::Text(t) => Frame::Text(t.as_str().to_owned()),
            ClientMessage::Binary(b) => Frame::Binary(b),
            ClientMessage::Ping(b) => Frame::Ping(b),
            ClientMessage::Pong(b) => Frame::Pong(b),
            ClientMessage::Close(c) => Frame::Close(c.map(|f| (f.code, f.reason.as_str().to_owned()))),
        }
    }
}

impl From<Frame> for ClientMessage {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(t) => ClientMessage::Text(t.into()),
            Frame::Binary(b) => ClientMessage::Binary(b),
            Frame::Ping(b) => ClientMessage::Ping(b),
            Frame::Pong(b) => ClientMessage::Pong(b),
            Frame::Close(c) => ClientMessage::Close(c.map(|(code, reason)| ClientCloseFrame {
                code,
                reason: reason.into(),
            })),
        }
    }
}

/// A read failure. `close_code` is set when the peer broke the protocol.
#[derive(Debug)]
pub struct ReadFault {
    pub close_code: Option<u16>,
    pub message: String,
}

impl ReadFault {
    fn from_tungstenite(err: &tungstenite::Error) -> Self {
        let close_code = match err {
            tungstenite::Error::Protocol(_) | tungstenite::Error::Utf8 => Some(CLOSE_PROTOCOL_ERROR),
            tungstenite::Error::Capacity(_) => Some(CLOSE_TOO_BIG),
            _ => None,
        };
        Self {
            close_code,
            message: err.to_string(),
        }
    }

    fn from_client(err: axum::Error) -> Self {
        let inner = err.into_inner();
        match inner.downcast_ref::<tungstenite::Error>() {
            Some(e) => Self::from_tungstenite(e),
            None => Self {
                close_code: None,
                message: inner.to_string(),
            },
        }
    }
}

/// Per-direction buffering and timing limits.
#[derive(Debug, Clone, Copy)]
pub struct RelayLimits {
    pub max_frames: usize,
    pub max_bytes: usize,
    pub write_timeout: Duration,
    pub close_grace: Duration,
}

impl RelayLimits {
    pub fn from_config(ws: &WebSocketConfig, timeouts: &TimeoutConfig) -> Self {
        Self {
            max_frames: ws.max_buffered_frames.max(1),
            max_bytes: ws.max_buffered_bytes,
            write_timeout: timeouts.write(),
            close_grace: timeouts.close_grace(),
        }
    }
}

/// How one direction ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpEnd {
    /// A close frame was read and forwarded.
    Closed,
    /// The source stream ended or errored without a close frame.
    SourceGone,
    /// The source sent an invalid frame; carries the close code to answer with.
    SourceProtocol(u16),
    /// The destination could not keep up.
    SlowConsumer,
    /// Writing to the destination failed.
    SinkFailed,
    Cancelled,
}

enum ReadEnd {
    Closed,
    Gone,
    Fault(ReadFault),
    SlowConsumer,
    SinkGone,
    Cancelled,
}

enum WriteEnd {
    Drained,
    Failed,
    TimedOut,
    Cancelled,
}

fn combine(read: ReadEnd, write: WriteEnd) -> PumpEnd {
    match (read, write) {
        (_, WriteEnd::TimedOut) | (ReadEnd::SlowConsumer, _) => PumpEnd::SlowConsumer,
        (_, WriteEnd::Failed) | (ReadEnd::SinkGone, _) => PumpEnd::SinkFailed,
        (ReadEnd::Closed, _) => PumpEnd::Closed,
        (ReadEnd::Fault(fault), _) => match fault.close_code {
            Some(code) => PumpEnd::SourceProtocol(code),
            None => {
                tracing::debug!(error = %fault.message, "WebSocket read failed");
                PumpEnd::SourceGone
            }
        },
        (ReadEnd::Gone, _) => PumpEnd::SourceGone,
        (ReadEnd::Cancelled, _) => PumpEnd::Cancelled,
    }
}

/// Move frames from `source` to `sink` until a close frame, the end of the
/// source, a fault, or `abort`. Returns the sink so a final close can be sent.
async fn pump<R, W, F>(
    mut source: R,
    mut sink: W,
    limits: &RelayLimits,
    on_frame: F,
    abort: &CancellationToken,
) -> (PumpEnd, W)
where
    R: Stream<Item = Result<Frame, ReadFault>> + Unpin,
    W: Sink<Frame> + Unpin,
    W::Error: fmt::Display,
    F: Fn(usize),
{
    let (tx, mut rx) = mpsc::channel::<Frame>(limits.max_frames.max(1));
    let in_flight = AtomicUsize::new(0);
    let in_flight = &in_flight;

    let reader = async move {
        let tx = tx;
        loop {
            let next = tokio::select! {
                biased;
                _ = abort.cancelled() => return ReadEnd::Cancelled,
                next = source.next() => next,
            };
            let frame = match next {
                None => return ReadEnd::Gone,
                Some(Err(fault)) => return ReadEnd::Fault(fault),
                Some(Ok(frame)) => frame,
            };

            let size = frame.len();
            let is_close = frame.is_close();
            on_frame(size);

            let buffered = in_flight.fetch_add(size, Ordering::AcqRel);
            if buffered > 0 && buffered + size > limits.max_bytes {
                abort.cancel();
                return ReadEnd::SlowConsumer;
            }
            match tx.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    abort.cancel();
                    return ReadEnd::SlowConsumer;
                }
                Err(TrySendError::Closed(_)) => return ReadEnd::SinkGone,
            }
            if is_close {
                return ReadEnd::Closed;
            }
        }
    };

    let writer = async move {
        loop {
            let next = tokio::select! {
                biased;
                _ = abort.cancelled() => None,
                frame = rx.recv() => Some(frame),
            };
            let frame = match next {
                None => return (WriteEnd::Cancelled, sink),
                Some(None) => return (WriteEnd::Drained, sink),
                Some(Some(frame)) => frame,
            };

            let size = frame.len();
            let is_close = frame.is_close();
            let sent = tokio::select! {
                biased;
                _ = abort.cancelled() => None,
                sent = tokio::time::timeout(limits.write_timeout, sink.send(frame)) => Some(sent),
            };
            in_flight.fetch_sub(size, Ordering::AcqRel);

            match sent {
                None => return (WriteEnd::Cancelled, sink),
                Some(Ok(Ok(()))) => {}
                // The peer already started closing; its close reply went out.
                Some(Ok(Err(_))) if is_close => {}
                Some(Ok(Err(e))) => {
                    tracing::debug!(error = %e, "WebSocket write failed");
                    abort.cancel();
                    return (WriteEnd::Failed, sink);
                }
                Some(Err(_)) => {
                    abort.cancel();
                    return (WriteEnd::TimedOut, sink);
                }
            }
        }
    };

    let (read_end, (write_end, sink)) = tokio::join!(reader, writer);
    (combine(read_end, write_end), sink)
}

/// Close codes and fault for a finished relay.
#[derive(Debug, PartialEq, Eq)]
struct Settlement {
    to_client: Option<(u16, &'static str)>,
    to_upstream: Option<(u16, &'static str)>,
    fault: Option<ErrorLabel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorLabel {
    SlowClient,
    SlowUpstream,
    ClientProtocol,
    UpstreamLost,
}

impl ErrorLabel {
    fn into_error(self) -> ProxyError {
        match self {
            ErrorLabel::SlowClient => ProxyError::SlowConsumer("client"),
            ErrorLabel::SlowUpstream => ProxyError::SlowConsumer("upstream"),
            ErrorLabel::ClientProtocol => ProxyError::ProtocolViolation("invalid frame from client".to_string()),
            ErrorLabel::UpstreamLost => ProxyError::UpstreamError {
                reason: "upstream connection lost".to_string(),
                connect: false,
            },
        }
    }
}

/// `up` moves client → upstream, `down` moves upstream → client.
fn settle(up: &PumpEnd, down: &PumpEnd) -> Settlement {
    use PumpEnd::*;

    const SLOW: (u16, &str) = (CLOSE_POLICY_VIOLATION, "slow consumer");
    const AWAY: (u16, &str) = (CLOSE_GOING_AWAY, "client went away");
    const SHUTDOWN: (u16, &str) = (CLOSE_GOING_AWAY, "proxy shutting down");
    const LOST: (u16, &str) = (CLOSE_BAD_GATEWAY, "upstream unavailable");

    if *up == SlowConsumer || *down == SlowConsumer {
        let label = if *up == SlowConsumer {
            ErrorLabel::SlowUpstream
        } else {
            ErrorLabel::SlowClient
        };
        return Settlement {
            to_client: Some(SLOW),
            to_upstream: Some(SLOW),
            fault: Some(label),
        };
    }

    if let SourceProtocol(code) = up {
        return Settlement {
            to_client: Some((*code, "protocol violation")),
            to_upstream: Some(AWAY),
            fault: Some(ErrorLabel::ClientProtocol),
        };
    }

    if *up == Closed || *down == Closed {
        return Settlement {
            to_client: None,
            to_upstream: None,
            fault: None,
        };
    }

    if matches!(down, SourceGone | SourceProtocol(_)) || *up == SinkFailed {
        return Settlement {
            to_client: Some(LOST),
            to_upstream: None,
            fault: Some(ErrorLabel::UpstreamLost),
        };
    }

    if *up == SourceGone || *down == SinkFailed {
        return Settlement {
            to_client: None,
            to_upstream: Some(AWAY),
            fault: None,
        };
    }

    Settlement {
        to_client: Some(SHUTDOWN),
        to_upstream: Some(SHUTDOWN),
        fault: None,
    }
}

#[derive(Debug)]
pub struct RelayOutcome {
    pub up: PumpEnd,
    pub down: PumpEnd,
    pub state: SessionState,
    pub fault: Option<ProxyError>,
}

async fn finish<F>(mut other: F, first: &PumpEnd, grace: Duration, abort: &CancellationToken) -> F::Output
where
    F: std::future::Future + Unpin,
{
    if *first == PumpEnd::Closed {
        match tokio::time::timeout(grace, &mut other).await {
            Ok(out) => return out,
            Err(_) => tracing::debug!("Close grace expired, aborting relay"),
        }
    }
    abort.cancel();
    other.await
}

async fn send_close<W>(sink: &mut W, close: Option<(u16, &'static str)>, limit: Duration)
where
    W: Sink<Frame> + Unpin,
{
    if let Some((code, reason)) = close {
        let frame = Frame::Close(Some((code, reason.to_string())));
        let _ = tokio::time::timeout(limit, sink.send(frame)).await;
    }
}

/// Relay frames between two connected sockets until the session ends.
pub(crate) async fn relay<CR, CW, UR, UW>(
    client: (CR, CW),
    upstream: (UR, UW),
    limits: RelayLimits,
    session: &SessionEntry,
    cancel: &CancellationToken,
) -> RelayOutcome
where
    CR: Stream<Item = Result<Frame, ReadFault>> + Unpin,
    CW: Sink<Frame> + Unpin,
    CW::Error: fmt::Display,
    UR: Stream<Item = Result<Frame, ReadFault>> + Unpin,
    UW: Sink<Frame> + Unpin,
    UW::Error: fmt::Display,
{
    let (client_rx, client_tx) = client;
    let (upstream_rx, upstream_tx) = upstream;
    let abort = cancel.child_token();

    let up = pump(client_rx, upstream_tx, &limits, |n| session.counters.add_up(n), &abort);
    let down = pump(upstream_rx, client_tx, &limits, |n| session.counters.add_down(n), &abort);
    tokio::pin!(up, down);

    let first = tokio::select! {
        out = &mut up => Either::Left(out),
        out = &mut down => Either::Right(out),
    };

    let ((up_end, mut upstream_tx), (down_end, mut client_tx)) = match first {
        Either::Left(up_out) => {
            if matches!(up_out.0, PumpEnd::Closed | PumpEnd::Cancelled) {
                session.state.advance(SessionState::Closing);
            }
            let down_out = finish(down.as_mut(), &up_out.0, limits.close_grace, &abort).await;
            (up_out, down_out)
        }
        Either::Right(down_out) => {
            if matches!(down_out.0, PumpEnd::Closed | PumpEnd::Cancelled) {
                session.state.advance(SessionState::Closing);
            }
            let up_out = finish(up.as_mut(), &down_out.0, limits.close_grace, &abort).await;
            (up_out, down_out)
        }
    };

    let settlement = settle(&up_end, &down_end);
    send_close(&mut client_tx, settlement.to_client, limits.write_timeout).await;
    send_close(&mut upstream_tx, settlement.to_upstream, limits.write_timeout).await;

    let fault = settlement.fault.map(ErrorLabel::into_error);
    let state = if fault.is_some() {
        SessionState::Failed
    } else {
        SessionState::Closed
    };
    session.state.advance(state);

    RelayOutcome {
        up: up_end,
        down: down_end,
        state,
        fault,
    }
}

/// Open the upstream socket, carrying the client's subprotocols.
/// Returns the socket and the subprotocol the upstream selected.
async fn dial(
    target: &UpstreamTarget,
    client_headers: &HeaderMap,
    client_addr: Option<SocketAddr>,
    path_and_query: &str,
    limit: Duration,
) -> Result<(UpstreamSocket, Option<String>), ProxyError> {
    let mut request = target
        .ws_url(path_and_query)
        .into_client_request()
        .map_err(|e| ProxyError::BadRequest(format!("invalid upstream websocket url: {e}")))?;

    let mut forwarded = client_headers.clone();
    headers::set_forwarded_headers(&mut forwarded, client_addr, "http");
    request.headers_mut().extend(headers::websocket_passthrough(&forwarded));
    if let Some(protocols) = client_headers.get(header::SEC_WEBSOCKET_PROTOCOL) {
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, protocols.clone());
    }

    let (socket, response) = tokio::time::timeout(limit, connect_async(request))
        .await
        .map_err(|_| ProxyError::UpstreamTimeout {
            phase: TimeoutPhase::Connect,
        })?
        .map_err(|e| ProxyError::UpstreamError {
            reason: e.to_string(),
            connect: true,
        })?;

    let selected = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    Ok((socket, selected))
}

/// Everything the upgrade handler needs beyond the app state.
pub struct UpgradeRequest {
    pub headers: HeaderMap,
    pub path_and_query: String,
    pub client_addr: Option<SocketAddr>,
    pub key_id: String,
    pub request_id: String,
}

/// Answer a client upgrade: dial upstream first, then accept and relay.
/// A failed dial still upgrades so the client sees close code 1014.
pub async fn handle_upgrade(
    state: AppState,
    ws: WebSocketUpgrade,
    request: UpgradeRequest,
    session: SessionGuard,
) -> Response {
    let limits = RelayLimits::from_config(&state.config.websocket, &state.config.timeouts);
    let ws = ws.max_message_size(state.config.websocket.max_message_size);

    let dialed = match state.selector.select(&RequestContext::default(), Instant::now()) {
        Ok(target) => {
            let connected = dial(
                &target,
                &request.headers,
                request.client_addr,
                &request.path_and_query,
                state.config.timeouts.connect(),
            )
            .await;
            match connected {
                Ok((socket, selected)) => Ok((target, socket, selected)),
                Err(e) => {
                    passive::observe_error(&state.selector, &target, &e);
                    Err(e)
                }
            }
        }
        Err(e) => Err(e),
    };

    match dialed {
        Ok((target, socket, selected)) => {
            session.bind_upstream(&target.name);
            tracing::info!(
                request_id = %request.request_id,
                session_id = %session.id,
                key_id = %request.key_id,
                upstream = %target.name,
                subprotocol = ?selected,
                "WebSocket upstream connected"
            );
            let ws = match selected {
                Some(protocol) => ws.protocols([protocol]),
                None => ws,
            };
            ws.on_upgrade(move |client| run_session(state, client, socket, session, limits, request.key_id))
        }
        Err(e) => {
            tracing::warn!(
                request_id = %request.request_id,
                session_id = %session.id,
                error = %e,
                "WebSocket upstream dial failed"
            );
            session.state.advance(SessionState::Failed);
            state.metrics.record(MetricEvent::Error {
                kind: e.kind(),
                key_id: Some(request.key_id),
            });
            // Clients that offered subprotocols reject a handshake that selects none.
            let ws = match first_offered_protocol(&request.headers) {
                Some(protocol) => ws.protocols([protocol]),
                None => ws,
            };
            ws.on_upgrade(move |client| refuse(client, session, limits.write_timeout))
        }
    }
}

/// The client's first `Sec-WebSocket-Protocol` offer.
fn first_offered_protocol(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .find(|p| !p.is_empty())
        .map(str::to_string)
}

async fn refuse(mut client: WebSocket, session: SessionGuard, limit: Duration) {
    let frame = ClientMessage::Close(Some(ClientCloseFrame {
        code: CLOSE_BAD_GATEWAY,
        reason: "upstream unavailable".into(),
    }));
    let _ = tokio::time::timeout(limit, client.send(frame)).await;
    drop(session);
}

async fn run_session(
    state: AppState,
    client: WebSocket,
    upstream: UpstreamSocket,
    session: SessionGuard,
    limits: RelayLimits,
    key_id: String,
) {
    session.state.advance(SessionState::Relaying);

    let (client_tx, client_rx) = client.split();
    let client_rx = client_rx.map(|r| r.map(Frame::from).map_err(ReadFault::from_client));
    let client_tx = client_tx.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(ClientMessage::from(frame))));

    let (upstream_tx, upstream_rx) = upstream.split();
    let upstream_rx = upstream_rx.filter_map(|r| {
        future::ready(match r {
            Ok(message) => Frame::from_upstream(message).map(Ok),
            Err(e) => Some(Err(ReadFault::from_tungstenite(&e))),
        })
    });
    let upstream_tx =
        upstream_tx.with(|frame: Frame| future::ready(Ok::<_, tungstenite::Error>(frame.into_upstream())));

    let outcome = relay(
        (client_rx, client_tx),
        (upstream_rx, upstream_tx),
        limits,
        &session,
        session.cancel_token(),
    )
    .await;

    if let Some(fault) = &outcome.fault {
        state.metrics.record(MetricEvent::Error {
            kind: fault.kind(),
            key_id: Some(key_id),
        });
        if matches!(fault, ProxyError::UpstreamError { .. }) {
            if let Some(target) = session
                .upstream()
                .and_then(|name| state.selector.targets().iter().find(|t| t.name == name))
            {
                passive::observe_error(&state.selector, target, fault);
            }
        }
    }

    let snapshot = session.snapshot();
    tracing::info!(
        session_id = %session.id,
        state = ?outcome.state,
        up = ?outcome.up,
        down = ?outcome.down,
        frames_up = snapshot.frames_up,
        frames_down = snapshot.frames_down,
        "WebSocket session ended"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use futures_util::stream;
    use tokio_util::sync::PollSender;

    use crate::net::session::{Protocol, SessionInfo};

    fn limits() -> RelayLimits {
        RelayLimits {
            max_frames: 16,
            max_bytes: 1 << 20,
            write_timeout: Duration::from_secs(5),
            close_grace: Duration::from_secs(1),
        }
    }

    fn text(s: &str) -> Frame {
        Frame::Text(s.to_string())
    }

    fn close(code: u16) -> Frame {
        Frame::Close(Some((code, String::new())))
    }

    fn entry() -> SessionEntry {
        SessionEntry::new(SessionInfo {
            protocol: Protocol::WebSocket,
            key_id: "abc".into(),
            client_addr: None,
            path: "/ws".into(),
        })
    }

    /// A sink that never accepts anything.
    struct Stalled;

    impl Sink<Frame> for Stalled {
        type Error = std::convert::Infallible;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }
        fn start_send(self: Pin<&mut Self>, _: Frame) -> Result<(), Self::Error> {
            Ok(())
        }
        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }
        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    fn frames(items: Vec<Frame>) -> impl Stream<Item = Result<Frame, ReadFault>> + Unpin {
        stream::iter(items.into_iter().map(Ok))
    }

    /// An in-memory socket: a stream fed by the returned sender.
    fn socket() -> (
        Pin<Box<dyn Stream<Item = Result<Frame, ReadFault>> + Send>>,
        mpsc::Sender<Frame>,
    ) {
        let (tx, rx) = mpsc::channel(64);
        let stream = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|f| (Ok(f), rx)) });
        (Box::pin(stream), tx)
    }

    #[tokio::test]
    async fn pump_preserves_order_and_stops_at_close() {
        let input = vec![
            text("a"),
            Frame::Binary(Bytes::from_static(b"\x00\x01")),
            Frame::Ping(Bytes::from_static(b"p")),
            text("c"),
            close(1000),
            text("after close"),
        ];
        let seen = AtomicUsize::new(0);
        let abort = CancellationToken::new();

        let (end, sink) = pump(
            frames(input.clone()),
            Vec::<Frame>::new(),
            &limits(),
            |_| {
                seen.fetch_add(1, Ordering::Relaxed);
            },
            &abort,
        )
        .await;

        assert_eq!(end, PumpEnd::Closed);
        assert_eq!(sink, input[..5].to_vec());
        assert_eq!(seen.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn pump_reports_source_gone_without_close() {
        let (end, sink) = pump(
            frames(vec![text("a")]),
            Vec::<Frame>::new(),
            &limits(),
            |_| {},
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(end, PumpEnd::SourceGone);
        assert_eq!(sink, vec![text("a")]);
    }

    #[tokio::test]
    async fn full_frame_queue_is_slow_consumer() {
        let input: Vec<_> = (0..100).map(|i| text(&i.to_string())).collect();
        let abort = CancellationToken::new();
        let limits = RelayLimits {
            max_frames: 4,
            ..limits()
        };

        let (end, _) = pump(frames(input), Stalled, &limits, |_| {}, &abort).await;
        assert_eq!(end, PumpEnd::SlowConsumer);
        assert!(abort.is_cancelled());
    }

    #[tokio::test]
    async fn byte_cap_is_slow_consumer() {
        let input: Vec<_> = (0..10).map(|_| Frame::Binary(Bytes::from(vec![0u8; 8]))).collect();
        let limits = RelayLimits {
            max_bytes: 10,
            ..limits()
        };
        let (end, _) = pump(frames(input), Stalled, &limits, |_| {}, &CancellationToken::new()).await;
        assert_eq!(end, PumpEnd::SlowConsumer);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_times_out() {
        let input = frames(vec![text("a")]).chain(stream::pending());
        let limits = RelayLimits {
            write_timeout: Duration::from_secs(2),
            ..limits()
        };
        let (end, _) = pump(input, Stalled, &limits, |_| {}, &CancellationToken::new()).await;
        assert_eq!(end, PumpEnd::SlowConsumer);
    }

    #[tokio::test]
    async fn relay_round_trip_and_close_handshake() {
        let (client_rx, client_in) = socket();
        let (client_out_tx, mut client_out) = mpsc::channel(64);
        let (upstream_rx, upstream_in) = socket();
        let (upstream_out_tx, mut upstream_out) = mpsc::channel::<Frame>(64);

        // Echo upstream: returns every frame, including the close.
        tokio::spawn(async move {
            while let Some(frame) = upstream_out.recv().await {
                let is_close = frame.is_close();
                if upstream_in.send(frame).await.is_err() || is_close {
                    break;
                }
            }
        });

        for f in [text("1"), text("2"), Frame::Binary(Bytes::from_static(b"3")), close(1000)] {
            client_in.send(f).await.unwrap();
        }

        let session = entry();
        let outcome = relay(
            (client_rx, PollSender::new(client_out_tx)),
            (upstream_rx, PollSender::new(upstream_out_tx)),
            limits(),
            &session,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome.state, SessionState::Closed);
        assert!(outcome.fault.is_none());
        assert_eq!(outcome.up, PumpEnd::Closed);
        assert_eq!(outcome.down, PumpEnd::Closed);

        let mut received = Vec::new();
        while let Ok(f) = client_out.try_recv() {
            received.push(f);
        }
        assert_eq!(
            received,
            vec![text("1"), text("2"), Frame::Binary(Bytes::from_static(b"3")), close(1000)]
        );

        let snap = session.snapshot();
        assert_eq!(snap.frames_up, 4);
        assert_eq!(snap.frames_down, 4);
        assert_eq!(session.state.get(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_upstream_after_close_is_bounded_by_grace() {
        let (client_rx, client_in) = socket();
        let (client_out_tx, _client_out) = mpsc::channel(64);
        let (upstream_rx, _upstream_in) = socket();
        let (upstream_out_tx, _upstream_out) = mpsc::channel::<Frame>(64);

        client_in.send(close(1000)).await.unwrap();

        let session = entry();
        let started = tokio::time::Instant::now();
        let outcome = relay(
            (client_rx, PollSender::new(client_out_tx)),
            (upstream_rx, PollSender::new(upstream_out_tx)),
            limits(),
            &session,
            &CancellationToken::new(),
        )
        .await;

        assert!(started.elapsed() <= limits().close_grace + Duration::from_millis(50));
        assert_eq!(outcome.up, PumpEnd::Closed);
        assert_eq!(outcome.down, PumpEnd::Cancelled);
        assert_eq!(outcome.state, SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_upstream_fails_session_with_policy_close() {
        let input: Vec<_> = (0..10).map(|i| text(&i.to_string())).collect();
        let client_rx = frames(input).chain(stream::pending());
        let (client_out_tx, mut client_out) = mpsc::channel(64);
        let (upstream_rx, _upstream_in) = socket();

        let limits = RelayLimits {
            max_frames: 4,
            ..limits()
        };
        let session = entry();
        let outcome = relay(
            (client_rx, PollSender::new(client_out_tx)),
            (upstream_rx, Stalled),
            limits,
            &session,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome.state, SessionState::Failed);
        assert_eq!(session.state.get(), SessionState::Failed);
        assert_eq!(outcome.up, PumpEnd::SlowConsumer);
        assert!(matches!(outcome.fault, Some(ProxyError::SlowConsumer("upstream"))));
        assert_eq!(
            client_out.try_recv().unwrap(),
            Frame::Close(Some((CLOSE_POLICY_VIOLATION, "slow consumer".to_string())))
        );
    }

    #[test]
    fn read_faults_map_to_close_codes() {
        assert_eq!(
            ReadFault::from_tungstenite(&tungstenite::Error::Utf8).close_code,
            Some(CLOSE_PROTOCOL_ERROR)
        );
        assert_eq!(
            ReadFault::from_tungstenite(&tungstenite::Error::ConnectionClosed).close_code,
            None
        );
    }

    #[test]
    fn first_offered_protocol_is_echoed_on_refusal() {
        let mut headers = HeaderMap::new();
        assert_eq!(first_offered_protocol(&headers), None);

        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            axum::http::HeaderValue::from_static(" openwebui.v1 , chat"),
        );
        assert_eq!(first_offered_protocol(&headers).as_deref(), Some("openwebui.v1"));
    }

    #[tokio::test]
    async fn cancellation_closes_both_sides_going_away() {
        let (client_rx, _client_in) = socket();
        let (client_out_tx, mut client_out) = mpsc::channel(64);
        let (upstream_rx, _upstream_in) = socket();
        let (upstream_out_tx, mut upstream_out) = mpsc::channel::<Frame>(64);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let session = entry();
        let outcome = relay(
            (client_rx, PollSender::new(client_out_tx)),
            (upstream_rx, PollSender::new(upstream_out_tx)),
            limits(),
            &session,
            &cancel,
        )
        .await;

        assert_eq!(outcome.state, SessionState::Closed);
        let expected = Frame::Close(Some((CLOSE_GOING_AWAY, "proxy shutting down".to_string())));
        assert_eq!(client_out.try_recv().unwrap(), expected);
        assert_eq!(upstream_out.try_recv().unwrap(), expected);
    }

    #[test]
    fn settlement_codes() {
        use PumpEnd::*;

        let s = settle(&Cancelled, &SlowConsumer);
        assert_eq!(s.to_client, Some((CLOSE_POLICY_VIOLATION, "slow consumer")));
        assert_eq!(s.fault, Some(ErrorLabel::SlowClient));

        let s = settle(&Cancelled, &SourceGone);
        assert_eq!(s.to_client, Some((CLOSE_BAD_GATEWAY, "upstream unavailable")));
        assert_eq!(s.fault, Some(ErrorLabel::UpstreamLost));

        let s = settle(&SourceGone, &Cancelled);
        assert_eq!(s.to_upstream, Some((CLOSE_GOING_AWAY, "client went away")));
        assert_eq!(s.fault, None);

        let s = settle(&SourceProtocol(CLOSE_TOO_BIG), &Cancelled);
        assert_eq!(s.to_client, Some((CLOSE_TOO_BIG, "protocol violation")));
        assert_eq!(s.fault, Some(ErrorLabel::ClientProtocol));

        let s = settle(&Closed, &Cancelled);
        assert_eq!(s.to_client, None);
        assert_eq!(s.to_upstream, None);
    }

    #[test]
    fn frame_conversions_keep_payload() {
        let f = Frame::from(ClientMessage::Text("hi".into()));
        assert_eq!(f, text("hi"));
        assert!(matches!(ClientMessage::from(close(1000)), ClientMessage::Close(Some(ref c)) if c.code == 1000));

        let up = text("x").into_upstream();
        assert_eq!(Frame::from_upstream(up), Some(text("x")));
        let up = close(4000).into_upstream();
        assert_eq!(Frame::from_upstream(up), Some(close(4000)));
    }
}
