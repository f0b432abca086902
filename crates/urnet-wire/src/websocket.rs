//! Web socket transport.
//!
//! One text message carries one JSON-encoded [`Frame`]. Binary messages are
//! accepted too and decoded the same way. Only plain `ws://` is supported.

use crate::directory::Directory;
use crate::socket::{Outbox, SocketAdapter, SocketEvent, TransportKind};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use urnet_types::frame::MAX_FRAME_SIZE;
use urnet_types::{Address, BusError, BusResult, Frame};

const WELCOME_TIMEOUT: Duration = Duration::from_secs(5);

pub struct WsSocket {
    outbox: Outbox,
    label: String,
}

impl WsSocket {
    fn new(label: String) -> (Arc<Self>, mpsc::UnboundedReceiver<Frame>) {
        let (outbox, rx) = Outbox::channel();
        (Arc::new(Self { outbox, label }), rx)
    }
}

impl SocketAdapter for WsSocket {
    fn transport(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn address(&self) -> Option<Address> {
        self.outbox.address()
    }

    fn bind_address(&self, address: Address) -> bool {
        self.outbox.bind_address(address)
    }

    fn send(&self, frame: Frame) -> BusResult<()> {
        self.outbox.send(frame)
    }

    fn close(&self) {
        self.outbox.close()
    }
}

/// Decode one web socket message. `Ok(None)` for control messages.
fn decode(msg: Message) -> BusResult<Option<Frame>> {
    let bytes = match msg {
        Message::Text(text) => text.into_bytes(),
        Message::Binary(bytes) => bytes,
        Message::Close(_) => {
            return Err(BusError::TransportSendFailure("web socket closed".to_string()))
        }
        _ => return Ok(None),
    };
    if bytes.len() > MAX_FRAME_SIZE as usize {
        return Err(BusError::MessageTooLarge {
            size: bytes.len() as u32,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(Some(serde_json::from_slice(&bytes)?))
}

fn ws_error(e: tokio_tungstenite::tungstenite::Error) -> BusError {
    BusError::TransportSendFailure(e.to_string())
}

/// Drive an attached web socket until either side goes away.
fn spawn_socket<S>(
    dir: Directory,
    addr: Address,
    ws: WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();

    let writer_dir = dir.clone();
    let writer_addr = addr.clone();
    tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(address = %writer_addr, error = %e, "Could not encode frame");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                writer_dir.on_socket_event(&writer_addr, SocketEvent::Error(e.to_string()));
                writer_dir.on_socket_event(&writer_addr, SocketEvent::Disconnected);
                return;
            }
        }
        let _ = sink.close().await;
        debug!(address = %writer_addr, "Web socket writer finished");
    });

    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg.map_err(ws_error).and_then(decode) {
                Ok(Some(frame)) => dir.receive(&addr, frame),
                Ok(None) => {}
                Err(BusError::TransportSendFailure(reason)) => {
                    debug!(address = %addr, reason = %reason, "Web socket ended");
                    break;
                }
                Err(e) => {
                    warn!(address = %addr, error = %e, "Web socket read failed");
                    dir.on_socket_event(&addr, SocketEvent::Error(e.to_string()));
                    break;
                }
            }
        }
        dir.on_socket_event(&addr, SocketEvent::Disconnected);
    });
}

/// Listen for web socket connections on `listen` (e.g. `127.0.0.1:0`).
/// Returns the bound address and the accept loop, which ends when the
/// directory starts shutting down.
pub async fn serve_ws(dir: &Directory, listen: &str) -> BusResult<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(listen).await?;
    let local = listener.local_addr()?;
    info!(listen = %local, "Web socket listening");

    let dir = dir.clone();
    let mut stop = dir.shutdown_signal();
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let dir = dir.clone();
                        tokio::spawn(async move {
                            if let Err(e) = accept(&dir, stream, peer).await {
                                warn!(peer = %peer, error = %e, "Web socket connection refused");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Web socket accept error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
                _ = stop.changed() => break,
            }
        }
        debug!(listen = %local, "Web socket listener stopped");
    });
    Ok((local, handle))
}

async fn accept(dir: &Directory, stream: TcpStream, peer: SocketAddr) -> BusResult<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| BusError::Handshake(e.to_string()))?;
    let (socket, outbound) = WsSocket::new(format!("ws:{peer}"));
    let addr = dir.attach(socket)?;
    spawn_socket(dir.clone(), addr.clone(), ws, outbound);
    dir.greet(&addr)
}

/// Connect to a hub at `url` (e.g. `ws://127.0.0.1:7700`). Returns the link
/// address.
pub async fn connect_ws(dir: &Directory, url: &str) -> BusResult<Address> {
    let (mut ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| BusError::Handshake(format!("{url}: {e}")))?;

    let welcome = tokio::time::timeout(WELCOME_TIMEOUT, async {
        while let Some(msg) = ws.next().await {
            if let Some(frame) = msg.map_err(ws_error).and_then(decode)? {
                return Ok(frame);
            }
        }
        Err(BusError::Handshake("hub closed the web socket".to_string()))
    })
    .await
    .map_err(|_| BusError::Handshake("no welcome from hub".to_string()))??;

    if !matches!(welcome, Frame::Welcome { .. }) {
        return Err(BusError::Handshake(format!(
            "expected welcome, got {}",
            welcome.kind()
        )));
    }

    let (socket, outbound) = WsSocket::new(format!("ws:{url}"));
    let addr = dir.attach(socket)?;
    spawn_socket(dir.clone(), addr.clone(), ws, outbound);
    dir.receive(&addr, welcome);
    info!(url, link = %addr, address = %dir.address(), "Connected over web socket");
    Ok(addr)
}
