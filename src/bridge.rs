//! Bidirectional relay between a client websocket and an upstream websocket.
//!
//! The client side is already open when a session starts; the upstream side is
//! still connecting. Anything the client sends before upstream opens is queued
//! and flushed, in order, the moment it does. After that, messages flow both
//! ways as they arrive, and a close on either side is propagated to the other
//! with the same code and reason.
//!
//! The relay itself only sees [`Frame`]s on boxed sinks and streams, so the
//! same loop runs over axum sockets, tungstenite sockets, or plain channels in
//! tests.

use std::{collections::VecDeque, future::Future, pin::Pin, time::Duration};

use axum::extract::ws::{self, WebSocket};
use futures_util::{future, Sink, SinkExt as _, Stream, StreamExt as _};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{
    self,
    protocol::{frame::coding::CloseCode, CloseFrame},
};
use tracing::{debug, error, info, warn};

/// Close code sent to the client when the upstream connection cannot be made.
pub const UPSTREAM_UNAVAILABLE: u16 = 1011;

/// How long a side gets to answer a close before it is dropped.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

/// A relayed websocket message. Ping and pong are handled by each side's
/// library and never reach the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(bytes::Bytes),
    Close(Option<CloseInfo>),
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = anyhow::Error> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = anyhow::Result<Frame>> + Send>>;

/// One side of a relay.
pub struct Endpoint {
    pub tx: FrameSink,
    pub rx: FrameStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug)]
struct BridgeSession {
    pending_outbound: VecDeque<Frame>,
    local: Side,
    upstream: Side,
}

impl BridgeSession {
    fn upstream_open(&self) -> bool {
        self.upstream == Side::Open
    }
}

/// Relay between `local` and the endpoint produced by `connect`.
///
/// Returns once either side has closed (or ended), the close has been
/// forwarded to the other, and both closing handshakes have finished or timed
/// out.
pub async fn relay<F>(local: Endpoint, connect: F)
where
    F: Future<Output = anyhow::Result<Endpoint>> + Send + 'static,
{
    let Endpoint {
        tx: mut local_tx,
        rx: mut local_rx,
    } = local;
    let mut session = BridgeSession {
        pending_outbound: VecDeque::new(),
        local: Side::Open,
        upstream: Side::Connecting,
    };
    let mut connecting: Option<JoinHandle<anyhow::Result<Endpoint>>> = Some(tokio::spawn(connect));
    let mut upstream_tx: Option<FrameSink> = None;
    let mut upstream_rx: Option<FrameStream> = None;

    loop {
        tokio::select! {
            joined = join(&mut connecting), if connecting.is_some() => {
                connecting = None;
                let upstream = match joined {
                    Ok(Ok(endpoint)) => endpoint,
                    Ok(Err(e)) => {
                        error!(error = %format!("{e:#}"), "upstream socket connect failed");
                        close_local(&mut local_tx, &mut local_rx, &mut session).await;
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "upstream connect task failed");
                        close_local(&mut local_tx, &mut local_rx, &mut session).await;
                        break;
                    }
                };
                let Endpoint { mut tx, rx } = upstream;
                info!(pending = session.pending_outbound.len(), "upstream socket open");
                while let Some(frame) = session.pending_outbound.pop_front() {
                    if let Err(e) = tx.send(frame).await {
                        error!(error = %e, "failed to flush queued message upstream");
                    }
                }
                session.upstream = Side::Open;
                upstream_tx = Some(tx);
                upstream_rx = Some(rx);
            }

            incoming = local_rx.next() => match incoming {
                Some(Ok(Frame::Close(info))) => {
                    info!(code = info.as_ref().map(|c| c.code), "client closed socket");
                    session.local = Side::Closing;
                    forward_close(&mut upstream_tx, &mut connecting, &mut session, info).await;
                    complete_close(&mut local_tx, &mut session.local).await;
                    if let (Some(tx), Some(rx)) = (upstream_tx.as_mut(), upstream_rx.as_mut()) {
                        await_close_reply(tx, rx, &mut session.upstream).await;
                    }
                    break;
                }
                Some(Ok(frame)) => {
                    match upstream_tx.as_mut().filter(|_| session.upstream_open()) {
                        Some(tx) => {
                            if let Err(e) = tx.send(frame).await {
                                error!(error = %e, "failed to relay message upstream");
                            }
                        }
                        None => {
                            debug!(queued = session.pending_outbound.len() + 1, "upstream not open; queueing");
                            session.pending_outbound.push_back(frame);
                        }
                    }
                }
                Some(Err(e)) => warn!(error = %e, "client socket error"),
                None => {
                    debug!("client socket ended");
                    session.local = Side::Closed;
                    forward_close(&mut upstream_tx, &mut connecting, &mut session, None).await;
                    if let (Some(tx), Some(rx)) = (upstream_tx.as_mut(), upstream_rx.as_mut()) {
                        await_close_reply(tx, rx, &mut session.upstream).await;
                    }
                    break;
                }
            },

            incoming = next(&mut upstream_rx), if upstream_rx.is_some() => match incoming {
                Some(Ok(Frame::Close(info))) => {
                    info!(code = info.as_ref().map(|c| c.code), "upstream closed socket");
                    session.upstream = Side::Closing;
                    if let Some(tx) = upstream_tx.as_mut() {
                        complete_close(tx, &mut session.upstream).await;
                    }
                    send_local(&mut local_tx, &session, Frame::Close(info)).await;
                    session.local = Side::Closing;
                    await_close_reply(&mut local_tx, &mut local_rx, &mut session.local).await;
                    break;
                }
                Some(Ok(frame)) => send_local(&mut local_tx, &session, frame).await,
                Some(Err(e)) => warn!(error = %e, "upstream socket error"),
                None => {
                    debug!("upstream socket ended");
                    session.upstream = Side::Closed;
                    send_local(&mut local_tx, &session, Frame::Close(None)).await;
                    session.local = Side::Closing;
                    await_close_reply(&mut local_tx, &mut local_rx, &mut session.local).await;
                    break;
                }
            },
        }
    }

    if !session.pending_outbound.is_empty() {
        warn!(dropped = session.pending_outbound.len(), "session ended with undelivered messages");
    }
}

async fn join<T>(handle: &mut Option<JoinHandle<T>>) -> Result<T, tokio::task::JoinError> {
    match handle {
        Some(h) => h.await,
        None => future::pending().await,
    }
}

async fn next(rx: &mut Option<FrameStream>) -> Option<anyhow::Result<Frame>> {
    match rx {
        Some(rx) => rx.next().await,
        None => future::pending().await,
    }
}

async fn send_local(local_tx: &mut FrameSink, session: &BridgeSession, frame: Frame) {
    if session.local != Side::Open {
        error!("client socket not open; dropping upstream message");
        return;
    }
    if let Err(e) = local_tx.send(frame).await {
        error!(error = %e, "failed to relay message to client");
    }
}

async fn close_local(local_tx: &mut FrameSink, local_rx: &mut FrameStream, session: &mut BridgeSession) {
    session.upstream = Side::Closed;
    let close = Frame::Close(Some(CloseInfo {
        code: UPSTREAM_UNAVAILABLE,
        reason: "upstream unavailable".into(),
    }));
    send_local(local_tx, session, close).await;
    session.local = Side::Closing;
    await_close_reply(local_tx, local_rx, &mut session.local).await;
}

/// Flush the reply to a close the peer started, then release the sink.
async fn complete_close(tx: &mut FrameSink, side: &mut Side) {
    if let Err(e) = tx.close().await {
        debug!(error = %e, "close handshake flush failed");
    }
    *side = Side::Closed;
}

/// Wait for the peer to answer a close we sent, then release the sink.
async fn await_close_reply(tx: &mut FrameSink, rx: &mut FrameStream, side: &mut Side) {
    if *side == Side::Closed {
        return;
    }
    let answered = tokio::time::timeout(CLOSE_GRACE, async {
        while let Some(frame) = rx.next().await {
            match frame {
                Ok(Frame::Close(_)) => return,
                Ok(_) => debug!("dropping message received while closing"),
                Err(e) => {
                    debug!(error = %e, "socket error while closing");
                    return;
                }
            }
        }
    })
    .await;
    if answered.is_err() {
        warn!("peer did not answer close in time");
    }
    complete_close(tx, side).await;
}

/// Propagate a client close upstream. A still-pending connect is abandoned.
async fn forward_close(
    upstream_tx: &mut Option<FrameSink>,
    connecting: &mut Option<JoinHandle<anyhow::Result<Endpoint>>>,
    session: &mut BridgeSession,
    info: Option<CloseInfo>,
) {
    if let Some(handle) = connecting.take() {
        debug!("abandoning upstream connect");
        handle.abort();
    }
    if session.upstream_open() {
        if let Some(tx) = upstream_tx.as_mut() {
            match tx.send(Frame::Close(info)).await {
                Ok(()) => {
                    session.upstream = Side::Closing;
                    return;
                }
                Err(e) => error!(error = %e, "failed to forward close upstream"),
            }
        }
    }
    session.upstream = Side::Closed;
}

// ---------------------------------------------------------------------------
// Socket adapters
// ---------------------------------------------------------------------------

impl Frame {
    fn from_axum(message: ws::Message) -> Option<Self> {
        match message {
            ws::Message::Text(t) => Some(Self::Text(t.as_str().to_owned())),
            ws::Message::Binary(b) => Some(Self::Binary(b)),
            ws::Message::Close(c) => Some(Self::Close(c.map(|c| CloseInfo {
                code: c.code,
                reason: c.reason.as_str().to_owned(),
            }))),
            ws::Message::Ping(_) | ws::Message::Pong(_) => None,
        }
    }

    fn into_axum(self) -> ws::Message {
        match self {
            Self::Text(t) => ws::Message::Text(t.into()),
            Self::Binary(b) => ws::Message::Binary(b),
            Self::Close(c) => ws::Message::Close(c.map(|c| ws::CloseFrame {
                code: c.code,
                reason: c.reason.into(),
            })),
        }
    }

    fn from_tungstenite(message: tungstenite::Message) -> Option<Self> {
        match message {
            tungstenite::Message::Text(t) => Some(Self::Text(t.as_str().to_owned())),
            tungstenite::Message::Binary(b) => Some(Self::Binary(b)),
            tungstenite::Message::Close(c) => Some(Self::Close(c.map(|c| CloseInfo {
                code: c.code.into(),
                reason: c.reason.as_str().to_owned(),
            }))),
            _ => None,
        }
    }

    fn into_tungstenite(self) -> tungstenite::Message {
        match self {
            Self::Text(t) => tungstenite::Message::Text(t.into()),
            Self::Binary(b) => tungstenite::Message::Binary(b),
            Self::Close(c) => tungstenite::Message::Close(c.map(|c| CloseFrame {
                code: CloseCode::from(c.code),
                reason: c.reason.into(),
            })),
        }
    }
}

/// Wrap an accepted client socket.
pub fn local_endpoint(socket: WebSocket) -> Endpoint {
    let (tx, rx) = socket.split();
    Endpoint {
        tx: Box::pin(
            tx.sink_map_err(anyhow::Error::from)
                .with(|f: Frame| future::ready(Ok::<_, anyhow::Error>(f.into_axum()))),
        ),
        rx: Box::pin(rx.filter_map(|m| {
            future::ready(match m {
                Ok(m) => Frame::from_axum(m).map(Ok),
                Err(e) => Some(Err(e.into())),
            })
        })),
    }
}

/// Open the upstream socket at `target`.
pub async fn connect_upstream(target: String) -> anyhow::Result<Endpoint> {
    let (socket, response) = tokio_tungstenite::connect_async(target.as_str()).await?;
    debug!(status = %response.status(), "upstream socket handshake complete");
    let (tx, rx) = socket.split();
    Ok(Endpoint {
        tx: Box::pin(
            tx.sink_map_err(anyhow::Error::from)
                .with(|f: Frame| future::ready(Ok::<_, anyhow::Error>(f.into_tungstenite()))),
        ),
        rx: Box::pin(rx.filter_map(|m| {
            future::ready(match m {
                Ok(m) => Frame::from_tungstenite(m).map(Ok),
                Err(e) => Some(Err(e.into())),
            })
        })),
    })
}

/// Relay an accepted client socket to `target` until either side closes.
pub async fn serve(socket: WebSocket, target: String) {
    relay(local_endpoint(socket), connect_upstream(target)).await;
    debug!("socket session finished");
}
