//! URNET bus runtime.
//!
//! A [`Directory`] routes named messages between local handlers and
//! attached socket adapters, tracks every pending call until it settles,
//! and ages out idle links. A [`Messager`] puts the four verbs (`signal`,
//! `send`, `call`, `ping`) on top of it. Directories in different processes
//! talk over local pipes or web sockets; directories in one process can be
//! joined with [`loopback::link`].

pub mod auth;
pub mod config;
pub mod directory;
pub mod handler;
pub mod loopback;
pub mod messager;
pub mod node;
pub mod pipe;
pub mod routes;
pub mod services;
pub mod shutdown;
pub mod socket;
pub mod transaction;
pub mod websocket;

pub use directory::{Delivery, Directory, WeakDirectory};
pub use handler::{handler_fn, HandlerId, HandlerResult, MessageHandler};
pub use messager::Messager;
pub use node::Node;
#[cfg(unix)]
pub use pipe::{connect_pipe, serve_pipe};
pub use routes::{LinkInfo, SlotState};
pub use socket::{SocketAdapter, SocketEvent, TransportKind};
pub use transaction::PendingCall;
pub use websocket::{connect_ws, serve_ws};
