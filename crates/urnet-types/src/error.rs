//! Shared error types for the URNET message bus.

use thiserror::Error;

/// Top-level error type for bus operations.
#[derive(Error, Debug)]
pub enum BusError {
    /// A message name did not match the `<channel>:<name>` grammar.
    #[error("Invalid message name: {0}")]
    InvalidMessageName(String),

    /// An address did not match the allocator's `<PREFIX>_<n>` format.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The socket adapter is already attached to a directory.
    #[error("Adapter already attached as {0}")]
    DuplicateAttachment(String),

    /// No socket adapter is attached under this address.
    #[error("Unknown address: {0}")]
    UnknownAddress(String),

    /// The packet would re-enter an address it already passed through.
    #[error("Loop detected: {0}")]
    LoopDetected(String),

    /// Neither a local handler nor a forwarding target exists for the message.
    #[error("No route: {0}")]
    NoRoute(String),

    /// A response arrived for a transaction that is not pending.
    #[error("Unknown transaction: {0}")]
    UnknownTransaction(String),

    /// The transaction was not settled within the configured duration.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A socket adapter could not deliver a frame to its transport.
    #[error("Transport send failure: {0}")]
    TransportSendFailure(String),

    /// An application handler on some hop returned an error.
    #[error("Remote error: {0}")]
    Remote(String),

    /// The directory is shutting down.
    #[error("Shutdown in progress")]
    ShuttingDown,

    /// The transport handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// A frame exceeded the transport's size limit.
    #[error("Frame too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Announced size of the frame.
        size: u32,
        /// Configured maximum.
        max: u32,
    },

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A serialization error occurred.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Alias for Result with BusError.
pub type BusResult<T> = Result<T, BusError>;

/// Wire prefixes for errors that keep their type across hops.
const WIRE_PREFIXES: &[&str] = &[
    "NoRoute",
    "Timeout",
    "LoopDetected",
    "TransportSendFailure",
    "ShuttingDown",
    "Remote",
];

impl BusError {
    /// Encode the error for a response packet's `error` field.
    ///
    /// Every error keeps a `Kind: detail` prefix so that
    /// [`BusError::from_wire`] can restore the variant on the caller's side.
    /// Application errors travel as `Remote: `, so handler text can never
    /// pass for a routing failure.
    pub fn to_wire(&self) -> String {
        match self {
            Self::NoRoute(d) => format!("NoRoute: {d}"),
            Self::Timeout(d) => format!("Timeout: {d}"),
            Self::LoopDetected(d) => format!("LoopDetected: {d}"),
            Self::TransportSendFailure(d) => format!("TransportSendFailure: {d}"),
            Self::ShuttingDown => "ShuttingDown: peer is shutting down".to_string(),
            Self::Remote(d) => format!("Remote: {d}"),
            other => format!("Remote: {other}"),
        }
    }

    /// Decode a response packet's `error` field.
    pub fn from_wire(error: &str) -> Self {
        let Some((kind, detail)) = error.split_once(": ") else {
            return Self::Remote(error.to_string());
        };
        if !WIRE_PREFIXES.contains(&kind) {
            return Self::Remote(error.to_string());
        }
        let detail = detail.to_string();
        match kind {
            "NoRoute" => Self::NoRoute(detail),
            "Timeout" => Self::Timeout(detail),
            "LoopDetected" => Self::LoopDetected(detail),
            "TransportSendFailure" => Self::TransportSendFailure(detail),
            "ShuttingDown" => Self::ShuttingDown,
            _ => Self::Remote(detail),
        }
    }

    /// Duplicate the error for fan-out bookkeeping.
    ///
    /// `Io` and `Json` are not `Clone`, so they degrade to their message.
    pub fn duplicate(&self) -> Self {
        match self {
            Self::InvalidMessageName(d) => Self::InvalidMessageName(d.clone()),
            Self::InvalidAddress(d) => Self::InvalidAddress(d.clone()),
            Self::DuplicateAttachment(d) => Self::DuplicateAttachment(d.clone()),
            Self::UnknownAddress(d) => Self::UnknownAddress(d.clone()),
            Self::LoopDetected(d) => Self::LoopDetected(d.clone()),
            Self::NoRoute(d) => Self::NoRoute(d.clone()),
            Self::UnknownTransaction(d) => Self::UnknownTransaction(d.clone()),
            Self::Timeout(d) => Self::Timeout(d.clone()),
            Self::TransportSendFailure(d) => Self::TransportSendFailure(d.clone()),
            Self::Remote(d) => Self::Remote(d.clone()),
            Self::ShuttingDown => Self::ShuttingDown,
            Self::Handshake(d) => Self::Handshake(d.clone()),
            Self::MessageTooLarge { size, max } => Self::MessageTooLarge {
                size: *size,
                max: *max,
            },
            Self::Io(e) => Self::TransportSendFailure(e.to_string()),
            Self::Json(e) => Self::Remote(e.to_string()),
        }
    }
}
