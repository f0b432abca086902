//! Socket adapter abstraction.
//!
//! A [`SocketAdapter`] wraps one bidirectional transport connection behind
//! a non-blocking `send`. Every adapter in this crate is built on an
//! [`Outbox`]: frames are queued on an unbounded channel and a per-connection
//! writer task drains them to the transport, which keeps submission order
//! per adapter and never stalls the directory.

use std::fmt;
use std::sync::{Mutex, OnceLock};
use tokio::sync::mpsc;
use urnet_types::{Address, BusError, BusResult, Frame};

/// The transport behind an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// In-process link between two directories.
    Loopback,
    /// Local pipe (Unix domain socket).
    Pipe,
    /// Web socket.
    WebSocket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loopback => write!(f, "loopback"),
            Self::Pipe => write!(f, "pipe"),
            Self::WebSocket => write!(f, "websocket"),
        }
    }
}

/// Connection-lifecycle events reported by transport tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Connected,
    Disconnected,
    Error(String),
}

/// Uniform transport capability used by the directory.
pub trait SocketAdapter: Send + Sync + 'static {
    fn transport(&self) -> TransportKind;

    /// Human-readable description of the remote end.
    fn label(&self) -> String;

    /// The address this adapter was attached under, if any.
    fn address(&self) -> Option<Address>;

    /// Record the attachment address. Returns `false` if one is already set.
    fn bind_address(&self, address: Address) -> bool;

    /// Queue a frame for the transport. Fails only if the link is closed;
    /// write errors surface later as a [`SocketEvent::Error`].
    fn send(&self, frame: Frame) -> BusResult<()>;

    /// Stop accepting frames. Already queued frames are still flushed.
    fn close(&self);
}

/// Outbound queue and attachment slot shared by the concrete adapters.
pub struct Outbox {
    address: OnceLock<Address>,
    tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
}

impl Outbox {
    /// Create an outbox and the receiver its writer task drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                address: OnceLock::new(),
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    pub fn address(&self) -> Option<Address> {
        self.address.get().cloned()
    }

    pub fn bind_address(&self, address: Address) -> bool {
        self.address.set(address).is_ok()
    }

    pub fn send(&self, frame: Frame) -> BusResult<()> {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let label = self
            .address()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unattached socket".to_string());
        match tx.as_ref() {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| BusError::TransportSendFailure(format!("{label}: writer gone"))),
            None => Err(BusError::TransportSendFailure(format!("{label}: closed"))),
        }
    }

    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(true, |tx| tx.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_outbox_preserves_order() {
        let (outbox, mut rx) = Outbox::channel();
        outbox.send(Frame::Heartbeat).unwrap();
        outbox
            .send(Frame::Goodbye {
                reason: "bye".into(),
            })
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), Frame::Heartbeat);
        assert_eq!(rx.recv().await.unwrap().kind(), "goodbye");
    }

    #[test]
    fn test_outbox_rejects_after_close() {
        let (outbox, _rx) = Outbox::channel();
        outbox.close();
        assert!(outbox.is_closed());
        assert!(matches!(
            outbox.send(Frame::Heartbeat),
            Err(BusError::TransportSendFailure(_))
        ));
    }

    #[test]
    fn test_outbox_fails_when_writer_dropped() {
        let (outbox, rx) = Outbox::channel();
        drop(rx);
        assert!(outbox.send(Frame::Heartbeat).is_err());
    }

    #[test]
    fn test_bind_address_once() {
        let (outbox, _rx) = Outbox::channel();
        assert!(outbox.bind_address(Address::parse("UADDR_01").unwrap()));
        assert!(!outbox.bind_address(Address::parse("UADDR_02").unwrap()));
        assert_eq!(outbox.address().unwrap().as_str(), "UADDR_01");
    }
}
