//! Messager — the application-facing verbs.
//!
//! ```ignore
//! let bus = Messager::new(directory);
//! bus.handle_fn("FOO", |p| async move { Ok(json!({"echo": p["x"]})) })?;
//! let reply = bus.call("FOO", json!({"x": 5})).await?;
//! ```

use crate::directory::{Delivery, Directory};
use crate::handler::{handler_fn, HandlerId, HandlerResult, MessageHandler};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use urnet_types::{BusResult, InvocationKind, Packet};

/// Client façade over one directory.
#[derive(Clone)]
pub struct Messager {
    directory: Directory,
}

impl Messager {
    pub fn new(directory: Directory) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Register a handler for `message` on this directory.
    pub fn handle(&self, message: &str, handler: Arc<dyn MessageHandler>) -> BusResult<HandlerId> {
        self.directory.register_handler(message, handler)
    }

    /// Register an async closure as a handler.
    pub fn handle_fn<F, Fut>(&self, message: &str, f: F) -> BusResult<HandlerId>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handle(message, handler_fn(f))
    }

    pub fn unhandle(&self, message: &str, id: HandlerId) -> BusResult<bool> {
        self.directory.unregister_handler(message, id)
    }

    fn packet(&self, message: &str, payload: Value, kind: InvocationKind) -> BusResult<Packet> {
        let mut packet = Packet::create(message, payload)?;
        self.directory.stamp(&mut packet, kind)?;
        Ok(packet)
    }

    /// Fire and forget. Routing failures are logged, never returned; only
    /// an invalid message name is reported.
    pub fn signal(&self, message: &str, payload: Value) -> BusResult<()> {
        let packet = self.packet(message, payload, InvocationKind::Signal)?;
        if let Err(e) = self.directory.dispatch(packet) {
            debug!(message, error = %e, "Signal not delivered");
        }
        Ok(())
    }

    /// Like [`Messager::signal`], but reports where the packet went.
    pub fn send(&self, message: &str, payload: Value) -> BusResult<Delivery> {
        let packet = self.packet(message, payload, InvocationKind::Send)?;
        self.directory.dispatch(packet)
    }

    /// Request/response. Resolves with the first successful handler result,
    /// or rejects with the error that settled the transaction.
    pub async fn call(&self, message: &str, payload: Value) -> BusResult<Value> {
        let packet = self.packet(message, payload, InvocationKind::Call)?;
        let pending = self.directory.begin_call(&packet)?;
        // A failed dispatch has already answered the transaction.
        let _ = self.directory.dispatch(packet);
        pending.await
    }

    /// Like [`Messager::call`], but yields the response packet with its hop
    /// sequence and hop log.
    pub async fn call_response(&self, message: &str, payload: Value) -> BusResult<Packet> {
        let packet = self.packet(message, payload, InvocationKind::Call)?;
        let pending = self.directory.begin_call(&packet)?;
        let _ = self.directory.dispatch(packet);
        pending.response().await
    }

    /// Reachability check: a call with an empty payload that no handler
    /// runs for. Resolves with the round-trip time.
    pub async fn ping(&self, message: &str) -> BusResult<Duration> {
        let started = Instant::now();
        let packet = self.packet(message, json!({}), InvocationKind::Ping)?;
        let pending = self.directory.begin_call(&packet)?;
        let _ = self.directory.dispatch(packet);
        match pending.await {
            Ok(_) => Ok(started.elapsed()),
            Err(e) => {
                warn!(message, error = %e, "Ping failed");
                Err(e)
            }
        }
    }
}
