//! Message handler contract.
//!
//! Application code registers handlers under a message name and receives
//! the packet payload. A handler returns a result value, or an error string
//! that travels back to the caller in the response packet.

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Result of one handler invocation.
pub type HandlerResult = Result<Value, String>;

/// A handler for one or more message names.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, payload: Value) -> HandlerResult;
}

/// Identity of a registration, used to unregister it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

static HANDLER_COUNTER: AtomicU64 = AtomicU64::new(1);

impl HandlerId {
    pub(crate) fn next() -> Self {
        Self(HANDLER_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, payload: Value) -> HandlerResult {
        (self.0)(payload).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
