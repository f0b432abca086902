//! Core types for the URNET message bus.
//!
//! This crate defines the data shared by every directory, transport and
//! client: addresses, message names, packets, the wire frame and the error
//! taxonomy. It contains no routing logic.

pub mod address;
pub mod config;
pub mod error;
pub mod frame;
pub mod name;
pub mod packet;

pub use address::{Address, AddressAllocator};
pub use error::{BusError, BusResult};
pub use frame::Frame;
pub use name::{Channel, MessageName};
pub use packet::{Direction, InvocationKind, Packet, TransactionKey};
