//! Local pipe transport (Unix domain sockets).
//!
//! Frames travel as a 4-byte big-endian length followed by the JSON body.
//! The accepting side greets every new connection with a welcome; the
//! connecting side reads that welcome before it attaches.

use crate::directory::Directory;
use crate::socket::{Outbox, SocketAdapter, SocketEvent, TransportKind};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use urnet_types::frame::{decode_frame, decode_length, encode_frame, MAX_FRAME_SIZE};
use urnet_types::{Address, BusError, BusResult, Frame};

#[cfg(unix)]
pub use unix::{connect_pipe, serve_pipe};

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> BusResult<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(frame)?;
    let size = (bytes.len() - 4) as u32;
    if size > MAX_FRAME_SIZE {
        return Err(BusError::MessageTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. `Ok(None)` means the peer closed the
/// stream cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> BusResult<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(BusError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_FRAME_SIZE {
        return Err(BusError::MessageTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(decode_frame(&body)?))
}

pub struct PipeSocket {
    outbox: Outbox,
    label: String,
}

impl PipeSocket {
    pub(crate) fn new(label: String) -> (Arc<Self>, mpsc::UnboundedReceiver<Frame>) {
        let (outbox, rx) = Outbox::channel();
        (Arc::new(Self { outbox, label }), rx)
    }
}

impl SocketAdapter for PipeSocket {
    fn transport(&self) -> TransportKind {
        TransportKind::Pipe
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

/// Run the writer and reader halves of an attached stream.
pub(crate) fn spawn_stream<R, W>(
    dir: Directory,
    addr: Address,
    mut reader: R,
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer_dir = dir.clone();
    let writer_addr = addr.clone();
    tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                writer_dir.on_socket_event(&writer_addr, SocketEvent::Error(e.to_string()));
                writer_dir.on_socket_event(&writer_addr, SocketEvent::Disconnected);
                return;
            }
        }
        let _ = writer.shutdown().await;
        debug!(address = %writer_addr, "Pipe writer finished");
    });

    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(frame)) => dir.receive(&addr, frame),
                Ok(None) => break,
                Err(e) => {
                    warn!(address = %addr, error = %e, "Pipe read failed");
                    dir.on_socket_event(&addr, SocketEvent::Error(e.to_string()));
                    break;
                }
            }
        }
        dir.on_socket_event(&addr, SocketEvent::Disconnected);
    });
}

#[cfg(unix)]
mod unix {
    use super::*;
    use std::path::Path;
    use std::time::Duration;
    use tokio::net::{UnixListener, UnixStream};
    use tokio::task::JoinHandle;
    use tracing::{error, info};

    const WELCOME_TIMEOUT: Duration = Duration::from_secs(5);

    /// Listen on a pipe path and attach every accepted connection. The
    /// accept loop ends when the directory starts shutting down.
    pub async fn serve_pipe(dir: &Directory, path: &Path) -> BusResult<JoinHandle<()>> {
        if path.exists() {
            debug!(path = %path.display(), "Removing stale pipe");
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        info!(path = %path.display(), "Pipe listening");

        let dir = dir.clone();
        let mut stop = dir.shutdown_signal();
        let shown = path.display().to_string();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            if let Err(e) = accept(&dir, stream, &shown) {
                                warn!(path = %shown, error = %e, "Pipe connection refused");
                            }
                        }
                        Err(e) => {
                            error!(path = %shown, error = %e, "Pipe accept error");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    },
                    _ = stop.changed() => break,
                }
            }
            debug!(path = %shown, "Pipe listener stopped");
        }))
    }

    fn accept(dir: &Directory, stream: UnixStream, path: &str) -> BusResult<()> {
        let (socket, outbound) = PipeSocket::new(format!("pipe:{path}"));
        let addr = dir.attach(socket)?;
        let (reader, writer) = stream.into_split();
        spawn_stream(dir.clone(), addr.clone(), reader, writer, outbound);
        dir.greet(&addr)
    }

    /// Connect to a hub listening on `path`. Returns the link address.
    pub async fn connect_pipe(dir: &Directory, path: &Path) -> BusResult<Address> {
        let stream = UnixStream::connect(path).await?;
        let (mut reader, writer) = stream.into_split();

        let welcome = match tokio::time::timeout(WELCOME_TIMEOUT, read_frame(&mut reader)).await {
            Ok(Ok(Some(frame @ Frame::Welcome { .. }))) => frame,
            Ok(Ok(Some(other))) => {
                return Err(BusError::Handshake(format!(
                    "expected welcome, got {}",
                    other.kind()
                )))
            }
            Ok(Ok(None)) => return Err(BusError::Handshake("hub closed the pipe".to_string())),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(BusError::Handshake("no welcome from hub".to_string())),
        };

        let (socket, outbound) = PipeSocket::new(format!("pipe:{}", path.display()));
        let addr = dir.attach(socket)?;
        spawn_stream(dir.clone(), addr.clone(), reader, writer, outbound);
        dir.receive(&addr, welcome);
        info!(path = %path.display(), link = %addr, address = %dir.address(), "Connected over pipe");
        Ok(addr)
    }
}
