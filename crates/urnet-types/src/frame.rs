//! Wire envelope exchanged between socket adapters.
//!
//! Local-pipe transports prefix each JSON-encoded frame with a 4-byte
//! big-endian length header. Web-socket transports send one JSON text
//! message per frame.

use crate::address::Address;
use crate::packet::Packet;
use serde::{Deserialize, Serialize};

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size accepted by length-prefixed transports (16 MiB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// One unit of transport traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Hub to newly attached peer: "your address is X".
    Welcome {
        /// Address the hub allocated for this link.
        assigned: Address,
        /// The hub directory's own address.
        hub: Address,
        /// Message names the hub can service for this peer.
        services: Vec<String>,
        /// Nonce the peer must sign in its announcement.
        #[serde(default)]
        nonce: String,
        protocol_version: u32,
    },
    /// A directory declares its own address and serviceable names.
    Announce {
        address: Address,
        services: Vec<String>,
        /// HMAC-SHA256(shared_secret, nonce + address), hex-encoded.
        #[serde(default)]
        auth_hmac: String,
    },
    /// A routed message.
    Packet(Packet),
    /// Keep-alive sent on every aging tick.
    Heartbeat,
    /// The sender is about to close the link.
    Goodbye { reason: String },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::Announce { .. } => "announce",
            Self::Packet(_) => "packet",
            Self::Heartbeat => "heartbeat",
            Self::Goodbye { .. } => "goodbye",
        }
    }
}

/// Encode a frame to bytes (4-byte big-endian length + JSON).
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(frame)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a Frame.
pub fn decode_frame(body: &[u8]) -> Result<Frame, serde_json::Error> {
    serde_json::from_slice(body)
}
