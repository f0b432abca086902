//! In-process transport between two directories.
//!
//! Each side gets a [`LoopbackSocket`]; a pump task moves frames from one
//! side's outbox into the other directory's `receive`. Useful for tests and
//! for composing several directories inside one process.

use crate::directory::Directory;
use crate::socket::{Outbox, SocketAdapter, SocketEvent, TransportKind};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use urnet_types::{Address, BusError, BusResult, Frame};

pub struct LoopbackSocket {
    outbox: Outbox,
    label: String,
}

impl LoopbackSocket {
    fn pair_end(label: String) -> (Arc<Self>, mpsc::UnboundedReceiver<Frame>) {
        let (outbox, rx) = Outbox::channel();
        (Arc::new(Self { outbox, label }), rx)
    }
}

impl SocketAdapter for LoopbackSocket {
    fn transport(&self) -> TransportKind {
        TransportKind::Loopback
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

/// Connect `client` to `hub` in-process.
///
/// The hub's welcome is delivered before this returns, so the client has
/// adopted its address and learned the hub's services. The client's own
/// announcement reaches the hub asynchronously.
///
/// Returns `(link on hub, link on client)`.
pub fn link(hub: &Directory, client: &Directory) -> BusResult<(Address, Address)> {
    let (hub_end, mut to_client) = LoopbackSocket::pair_end(format!("loopback:{}", client.address()));
    let (client_end, to_hub) = LoopbackSocket::pair_end(format!("loopback:{}", hub.address()));

    let on_hub = hub.attach(hub_end)?;
    let on_client = match client.attach(client_end) {
        Ok(addr) => addr,
        Err(e) => {
            let _ = hub.detach(&on_hub);
            return Err(e);
        }
    };

    hub.greet(&on_hub)?;
    match to_client.try_recv() {
        Ok(welcome @ Frame::Welcome { .. }) => client.receive(&on_client, welcome),
        _ => {
            let _ = hub.detach(&on_hub);
            let _ = client.detach(&on_client);
            return Err(BusError::Handshake("hub sent no welcome".to_string()));
        }
    }

    spawn_pump(to_client, client.clone(), on_client.clone());
    spawn_pump(to_hub, hub.clone(), on_hub.clone());
    debug!(hub = %on_hub, client = %on_client, "Loopback link established");
    Ok((on_hub, on_client))
}

/// Deliver frames to `dir` until the sending side closes, then report the
/// disconnect.
fn spawn_pump(mut rx: mpsc::UnboundedReceiver<Frame>, dir: Directory, addr: Address) {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            dir.receive(&addr, frame);
        }
        dir.on_socket_event(&addr, SocketEvent::Disconnected);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use urnet_types::config::DirectoryConfig;

    fn hub() -> Directory {
        Directory::new(DirectoryConfig {
            address: Some("SVR_01".into()),
            ..DirectoryConfig::default()
        })
        .unwrap()
    }

    fn client() -> Directory {
        Directory::new(DirectoryConfig {
            address_prefix: "NODE".into(),
            ..DirectoryConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_link_adopts_assigned_address() {
        let hub = hub();
        let client = client();
        let (on_hub, _) = link(&hub, &client).unwrap();
        assert_eq!(client.address(), on_hub);
        assert_eq!(on_hub.as_str(), "UADDR_01");
    }

    #[tokio::test]
    async fn test_detach_on_one_side_disconnects_the_other() {
        let hub = hub();
        let client = client();
        let (on_hub, on_client) = link(&hub, &client).unwrap();

        hub.detach(&on_hub).unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while client.is_attached(&on_client) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("client side should see the disconnect");
    }

    #[tokio::test]
    async fn test_idle_client_answers_heartbeats() {
        let hub = Directory::new(DirectoryConfig {
            address: Some("SVR_01".into()),
            max_socket_age: 1,
            ..DirectoryConfig::default()
        })
        .unwrap();
        let client = client();
        let (on_hub, on_client) = link(&hub, &client).unwrap();

        for _ in 0..4 {
            assert!(hub.tick().is_empty());
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(hub.is_attached(&on_hub));
        assert!(client.is_attached(&on_client));
    }
}
