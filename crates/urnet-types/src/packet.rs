//! Packet — one message occurrence in flight.
//!
//! A packet carries the message name, an open JSON payload, how it was
//! invoked, who originated it, and the ordered hop sequence of directory
//! addresses it has passed through. The hop sequence doubles as loop
//! protection on the way out and as the return path for responses.

use crate::address::Address;
use crate::error::{BusError, BusResult};
use crate::name::MessageName;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide packet counter. Ids are scoped by source address, so the
/// counter only has to be unique per process.
static PACKET_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_packet_id() -> String {
    format!("PKT{:05}", PACKET_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// How the packet was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationKind {
    /// Fire-and-forget, no reply path.
    Signal,
    /// Best-effort delivery, the sender learns only the routing outcome.
    Send,
    /// Request/response.
    Call,
    /// Reachability check, answered without running handlers.
    Ping,
}

impl InvocationKind {
    pub fn expects_response(&self) -> bool {
        matches!(self, Self::Call | Self::Ping)
    }
}

/// Whether the packet travels toward a handler or back to a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Request,
    Response,
}

/// Key correlating a request with its response: source address plus id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionKey(String);

impl TransactionKey {
    pub fn new(source: &Address, id: &str) -> Self {
        Self(format!("{source}:{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One message occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    id: String,
    message: MessageName,
    payload: Value,
    kind: InvocationKind,
    source: Option<Address>,
    #[serde(default)]
    hops: Vec<Address>,
    #[serde(default)]
    hop_log: Vec<String>,
    direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Packet {
    /// Create an unstamped request packet.
    pub fn create(message: &str, payload: Value) -> BusResult<Self> {
        Ok(Self {
            id: String::new(),
            message: MessageName::parse(message)?,
            payload,
            kind: InvocationKind::Signal,
            source: None,
            hops: Vec::new(),
            hop_log: Vec::new(),
            direction: Direction::Request,
            error: None,
        })
    }

    /// Stamp id, invocation kind and source address.
    pub fn assign_identity(&mut self, kind: InvocationKind, source: &str) -> BusResult<()> {
        let source = Address::parse(source)?;
        self.id = next_packet_id();
        self.kind = kind;
        self.log(format!("{source} created {kind:?} {}", self.id));
        self.source = Some(source);
        Ok(())
    }

    /// Append an address to the hop sequence, rejecting re-entry.
    pub fn append_hop(&mut self, addr: &Address) -> BusResult<()> {
        if self.hops.contains(addr) {
            return Err(BusError::LoopDetected(format!(
                "{} {} already passed through {addr} (hops: {})",
                self.message,
                self.id,
                self.trail()
            )));
        }
        self.hops.push(addr.clone());
        Ok(())
    }

    /// Copy payload and metadata under a freshly minted id.
    ///
    /// Each fan-out target gets its own copy so that its response can be
    /// tracked independently.
    pub fn duplicate(&self) -> Self {
        let mut copy = self.clone();
        copy.id = next_packet_id();
        copy.log(format!("{} duplicated as {}", self.id, copy.id));
        copy
    }

    /// Build the response to this request.
    ///
    /// The response keeps the request's id and source so the originating
    /// transaction can be found, and inherits the hop sequence so it can
    /// walk back along it.
    pub fn make_response(&self, outcome: Result<Value, String>) -> Self {
        let (payload, error) = match outcome {
            Ok(v) => (v, None),
            Err(e) => (Value::Null, Some(e)),
        };
        Self {
            id: self.id.clone(),
            message: self.message.clone(),
            payload,
            kind: self.kind,
            source: self.source.clone(),
            hops: self.hops.clone(),
            hop_log: self.hop_log.clone(),
            direction: Direction::Response,
            error,
        }
    }

    /// Take over the hop sequence and log of a downstream response.
    pub fn inherit_trail(&mut self, downstream: &Packet) {
        self.hops = downstream.hops.clone();
        self.hop_log = downstream.hop_log.clone();
    }

    /// Record the answering directory on a response. Responses retrace
    /// hops, so no loop check applies.
    pub fn mark_responder(&mut self, addr: &Address) {
        if !self.hops.contains(addr) {
            self.hops.push(addr.clone());
        }
    }

    /// The address preceding `addr` in the hop sequence.
    pub fn previous_hop(&self, addr: &Address) -> Option<&Address> {
        let pos = self.hops.iter().position(|a| a == addr)?;
        pos.checked_sub(1).map(|p| &self.hops[p])
    }

    pub fn log(&mut self, entry: impl Into<String>) {
        self.hop_log.push(entry.into());
    }

    pub fn serialize(&self) -> BusResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> BusResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Transaction key, once the packet has an identity.
    pub fn transaction_key(&self) -> Option<TransactionKey> {
        self.source
            .as_ref()
            .filter(|_| !self.id.is_empty())
            .map(|src| TransactionKey::new(src, &self.id))
    }

    fn trail(&self) -> String {
        self.hops
            .iter()
            .map(Address::as_str)
            .collect::<Vec<_>>()
            .join(" > ")
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn message(&self) -> &MessageName {
        &self.message
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn kind(&self) -> InvocationKind {
        self.kind
    }

    pub fn source(&self) -> Option<&Address> {
        self.source.as_ref()
    }

    pub fn hops(&self) -> &[Address] {
        &self.hops
    }

    pub fn hop_log(&self) -> &[String] {
        &self.hop_log
    }

    pub fn is_response(&self) -> bool {
        self.direction == Direction::Response
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// The outcome carried by a response: payload or decoded error.
    pub fn outcome(&self) -> BusResult<Value> {
        match &self.error {
            Some(e) => Err(BusError::from_wire(e)),
            None => Ok(self.payload.clone()),
        }
    }
}
