//! One spawned I/O task per live channel.
//!
//! The task owns the socket (a raw `Framed` stream or a WebSocket
//! stream), drains the outbound queue, and reports everything that
//! happens on the wire as [`ChannelEvent`]s over a single mpsc. The
//! owner consumes those events from one task, so connection state has
//! exactly one writer even though I/O completes on arbitrary workers.

use std::net::SocketAddr;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::codec::{self, CommandCodec};
use crate::command::Command;
use crate::error::TetherError;

/// Largest payload a WebSocket control frame may carry (RFC 6455).
pub const MAX_PING_CONTENT: usize = 125;

/// One queued outbound command.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub cmd: Command,
    /// Send as a WebSocket Ping frame instead of a data frame. Raw
    /// mode has no control frames; the command goes out as data.
    pub ping: bool,
}

/// What the I/O task observed on the wire.
#[derive(Debug)]
pub(crate) enum ChannelEvent {
    /// A complete inbound command.
    Received(Command),

    /// The channel ended. `clean` marks a completed WebSocket close
    /// handshake; a bare EOF or a locally requested close is not clean.
    Inactive { clean: bool },

    /// The channel died mid-flight. Terminal; no `Inactive` follows.
    Fault(TetherError),
}

/// The live socket, just after connect/accept.
pub(crate) enum WireStream {
    Raw(Framed<TcpStream, CommandCodec>),
    Ws(Box<WebSocketStream<TcpStream>>),
}

// ── ChannelHandle ────────────────────────────────────────────────

/// Cheap handle for enqueueing writes and requesting close.
#[derive(Debug, Clone)]
pub(crate) struct ChannelHandle {
    out_tx: mpsc::Sender<Outbound>,
    closer: CancellationToken,
    peer: SocketAddr,
}

impl ChannelHandle {
    pub fn try_enqueue(
        &self,
        out: Outbound,
    ) -> Result<(), mpsc::error::TrySendError<Outbound>> {
        self.out_tx.try_send(out)
    }

    /// Asks the I/O task to close the socket. Idempotent.
    pub fn close(&self) {
        self.closer.cancel();
    }

    pub fn is_open(&self) -> bool {
        !self.closer.is_cancelled()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

// ── I/O task ─────────────────────────────────────────────────────

/// Spawns the I/O task for a freshly established channel.
///
/// Events arrive on `event_tx` until the task emits its terminal
/// `Inactive`/`Fault` and exits.
pub(crate) fn spawn_channel(
    stream: WireStream,
    peer: SocketAddr,
    queue: usize,
    event_tx: mpsc::Sender<ChannelEvent>,
) -> (ChannelHandle, JoinHandle<()>) {
    let (out_tx, out_rx) = mpsc::channel(queue);
    let closer = CancellationToken::new();
    let handle = ChannelHandle {
        out_tx,
        closer: closer.clone(),
        peer,
    };

    let task = tokio::spawn(async move {
        let terminal = match stream {
            WireStream::Raw(framed) => run_raw_io(framed, out_rx, &event_tx, closer).await,
            WireStream::Ws(ws) => run_ws_io(*ws, out_rx, &event_tx, closer).await,
        };
        trace!(%peer, ?terminal, "channel io task exiting");
        let _ = event_tx.send(terminal).await;
    });

    (handle, task)
}

async fn run_raw_io(
    framed: Framed<TcpStream, CommandCodec>,
    mut out_rx: mpsc::Receiver<Outbound>,
    event_tx: &mpsc::Sender<ChannelEvent>,
    closer: CancellationToken,
) -> ChannelEvent {
    let (mut sink, mut stream) = framed.split();

    loop {
        tokio::select! {
            _ = closer.cancelled() => {
                let _ = sink.close().await;
                return ChannelEvent::Inactive { clean: false };
            }
            out = out_rx.recv() => match out {
                Some(out) => {
                    if let Err(e) = sink.send(out.cmd).await {
                        return ChannelEvent::Fault(e);
                    }
                }
                // Handle dropped without an explicit close.
                None => {
                    let _ = sink.close().await;
                    return ChannelEvent::Inactive { clean: false };
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(cmd)) => {
                    if forward(event_tx, cmd).await.is_err() {
                        // Event consumer is gone; nothing left to report to.
                        let _ = sink.close().await;
                        return ChannelEvent::Inactive { clean: false };
                    }
                }
                Some(Err(e)) => return ChannelEvent::Fault(e),
                None => return ChannelEvent::Inactive { clean: false },
            },
        }
    }
}

async fn run_ws_io(
    ws: WebSocketStream<TcpStream>,
    mut out_rx: mpsc::Receiver<Outbound>,
    event_tx: &mpsc::Sender<ChannelEvent>,
    closer: CancellationToken,
) -> ChannelEvent {
    let (mut sink, mut stream) = ws.split();
    // Set when the peer opened the close handshake; the stream then
    // runs on until the transport confirms it.
    let mut saw_close = false;

    loop {
        tokio::select! {
            _ = closer.cancelled() => {
                let _ = sink.close().await;
                return ChannelEvent::Inactive { clean: false };
            }
            out = out_rx.recv() => match out {
                Some(out) => {
                    if let Err(e) = sink.send(ws_message(&out)).await {
                        return ws_terminal(e, saw_close);
                    }
                }
                None => {
                    let _ = sink.close().await;
                    return ChannelEvent::Inactive { clean: false };
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Binary(content))) => {
                    match codec::decode_content(content) {
                        Ok(cmd) => {
                            if forward(event_tx, cmd).await.is_err() {
                                let _ = sink.close().await;
                                return ChannelEvent::Inactive { clean: false };
                            }
                        }
                        Err(e) => return ChannelEvent::Fault(e),
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    match codec::decode_content(Bytes::from(text)) {
                        Ok(cmd) => {
                            if forward(event_tx, cmd).await.is_err() {
                                let _ = sink.close().await;
                                return ChannelEvent::Inactive { clean: false };
                            }
                        }
                        Err(e) => return ChannelEvent::Fault(e),
                    }
                }
                Some(Ok(Message::Ping(content))) => {
                    // The transport answers with a Pong on its own.
                    trace!(len = content.len(), "ping received");
                }
                Some(Ok(Message::Pong(content))) => {
                    trace!(len = content.len(), "pong received");
                }
                Some(Ok(Message::Close(frame))) => {
                    trace!(?frame, "close frame received");
                    saw_close = true;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => return ws_terminal(e, saw_close),
                None => return ChannelEvent::Inactive { clean: saw_close },
            },
        }
    }
}

/// Picks the outbound WebSocket message for a queued command.
fn ws_message(out: &Outbound) -> Message {
    let content = codec::encode_content(&out.cmd);
    if out.ping {
        return Message::Ping(content);
    }
    if out.cmd.is_text() {
        // Text frames must be valid UTF-8 end to end, length prefix
        // included; fall back to binary when they are not.
        if let Ok(text) = std::str::from_utf8(&content) {
            return Message::text(text);
        }
    }
    Message::binary(content)
}

/// Maps a tungstenite error to the channel's terminal event.
fn ws_terminal(e: WsError, saw_close: bool) -> ChannelEvent {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            ChannelEvent::Inactive { clean: true }
        }
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            ChannelEvent::Inactive { clean: saw_close }
        }
        other => ChannelEvent::Fault(other.into()),
    }
}

async fn forward(event_tx: &mpsc::Sender<ChannelEvent>, cmd: Command) -> Result<(), ()> {
    event_tx
        .send(ChannelEvent::Received(cmd))
        .await
        .map_err(|_| ())
}
