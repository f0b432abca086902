//! Transaction tracker — correlates calls with their responses.
//!
//! Every pending `call`/`ping` is keyed by `source address + packet id`.
//! A key is settled exactly once: by its response, its timeout, a transport
//! failure on the link it went out on, or shutdown. Whichever comes first
//! removes the record, so every later attempt finds nothing and is reported
//! as [`BusError::UnknownTransaction`] instead of resolving a second time.
//!
//! Two kinds of waiter exist. A *caller* waiter belongs to application code
//! awaiting a [`PendingCall`]. A *relay* waiter belongs to a packet this
//! directory forwarded on someone else's behalf (or fanned out for its own
//! caller); its [`RelayGroup`] collects the outcomes of all copies of one
//! request and decides when the original request is answered.

use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use urnet_types::{Address, BusError, BusResult, Packet, TransactionKey};

/// What a caller's channel carries once its transaction settles.
#[derive(Debug)]
struct CallerSettlement {
    outcome: BusResult<Value>,
    /// The response packet, when the transaction settled by response.
    response: Option<Packet>,
}

/// Handle returned to a caller; resolves when the transaction settles.
#[derive(Debug)]
pub struct PendingCall {
    key: TransactionKey,
    rx: oneshot::Receiver<CallerSettlement>,
}

impl PendingCall {
    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    /// Wait for the raw response packet instead of its decoded outcome.
    /// Fails when the transaction settled without a response (timeout,
    /// transport failure, shutdown).
    pub async fn response(self) -> BusResult<Packet> {
        let key = self.key;
        let settled = self.rx.await.map_err(|_| abandoned(&key))?;
        match (settled.response, settled.outcome) {
            (Some(packet), _) => Ok(packet),
            (None, Err(e)) => Err(e),
            (None, Ok(_)) => Err(BusError::UnknownTransaction(format!(
                "{key} settled without a response"
            ))),
        }
    }
}

fn abandoned(key: &TransactionKey) -> BusError {
    BusError::Timeout(format!("{key} abandoned"))
}

impl Future for PendingCall {
    type Output = BusResult<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let key = self.key.clone();
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.map_err(|_| abandoned(&key)).and_then(|s| s.outcome))
    }
}

/// Outcomes of every forwarded copy of one request.
pub(crate) struct RelayGroup {
    parent: Packet,
    state: Mutex<GroupState>,
}

struct GroupState {
    outstanding: usize,
    settled: bool,
    last_error: Option<BusError>,
}

impl RelayGroup {
    pub fn new(parent: Packet, outstanding: usize) -> Arc<Self> {
        Arc::new(Self {
            parent,
            state: Mutex::new(GroupState {
                outstanding,
                settled: false,
                last_error: None,
            }),
        })
    }

    pub fn parent(&self) -> &Packet {
        &self.parent
    }

    /// Feed one copy's outcome. Returns the final outcome when this call
    /// settles the group: on the first success, or on the last failure.
    pub fn offer(&self, outcome: BusResult<Value>) -> Option<BusResult<Value>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.settled {
            return None;
        }
        state.outstanding = state.outstanding.saturating_sub(1);
        match outcome {
            Ok(value) => {
                state.settled = true;
                Some(Ok(value))
            }
            Err(e) if state.outstanding == 0 => {
                state.settled = true;
                // A handler's answer says more than a dead link or a timer.
                let transport_level =
                    matches!(e, BusError::Timeout(_) | BusError::TransportSendFailure(_));
                match state.last_error.take() {
                    Some(earlier) if transport_level => Some(Err(earlier)),
                    _ => Some(Err(e)),
                }
            }
            Err(e) => {
                let keep_earlier = state.last_error.as_ref().is_some_and(|earlier| {
                    !matches!(earlier, BusError::Timeout(_) | BusError::TransportSendFailure(_))
                });
                if !keep_earlier {
                    state.last_error = Some(e);
                }
                None
            }
        }
    }
}

enum Waiter {
    Caller {
        tx: oneshot::Sender<CallerSettlement>,
        started: Instant,
    },
    Relay {
        group: Arc<RelayGroup>,
        via: Address,
    },
}

/// What settling a key produced.
pub(crate) enum Settled {
    /// A caller's future was resolved (or its caller had already left).
    Caller,
    /// A relay copy settled; the directory feeds it to the group.
    Relay {
        group: Arc<RelayGroup>,
        outcome: BusResult<Value>,
        /// The downstream response, when one arrived.
        response: Option<Packet>,
    },
}

/// Pending transactions of one directory.
#[derive(Default)]
pub struct TransactionTracker {
    pending: Mutex<HashMap<TransactionKey, Waiter>>,
}

impl TransactionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a caller waiting for the response to `packet`.
    pub fn begin(&self, packet: &Packet) -> BusResult<PendingCall> {
        let key = packet.transaction_key().ok_or_else(|| {
            BusError::InvalidAddress(format!("{} has no source/id", packet.message()))
        })?;
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.contains_key(&key) {
            return Err(BusError::UnknownTransaction(format!("{key} already pending")));
        }
        pending.insert(
            key.clone(),
            Waiter::Caller {
                tx,
                started: Instant::now(),
            },
        );
        debug!(key = %key, "Transaction begun");
        Ok(PendingCall { key, rx })
    }

    /// Record a forwarded copy whose response feeds `group`.
    pub(crate) fn relay(&self, key: TransactionKey, group: Arc<RelayGroup>, via: Address) {
        self.lock().insert(key, Waiter::Relay { group, via });
    }

    /// Settle the transaction a response packet belongs to.
    pub(crate) fn complete(&self, response: &Packet) -> BusResult<Settled> {
        let key = response.transaction_key().ok_or_else(|| {
            BusError::UnknownTransaction(format!("{} response without identity", response.message()))
        })?;
        let waiter = self
            .lock()
            .remove(&key)
            .ok_or_else(|| BusError::UnknownTransaction(key.to_string()))?;
        Ok(Self::resolve(&key, waiter, response.outcome(), Some(response.clone())))
    }

    /// Reject a transaction that is still pending after its deadline.
    pub(crate) fn timeout(&self, key: &TransactionKey) -> Option<Settled> {
        self.fail(key, BusError::Timeout(key.to_string()))
    }

    /// Reject one pending transaction with `error`.
    pub(crate) fn fail(&self, key: &TransactionKey, error: BusError) -> Option<Settled> {
        let waiter = self.lock().remove(key)?;
        Some(Self::resolve(key, waiter, Err(error), None))
    }

    /// Reject every relay that went out through `via`.
    pub(crate) fn fail_via(&self, via: &Address, error: &BusError) -> Vec<Settled> {
        let drained: Vec<(TransactionKey, Waiter)> = {
            let mut pending = self.lock();
            let keys: Vec<TransactionKey> = pending
                .iter()
                .filter(|(_, w)| matches!(w, Waiter::Relay { via: v, .. } if v == via))
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| pending.remove(&k).map(|w| (k, w)))
                .collect()
        };
        drained
            .into_iter()
            .map(|(key, waiter)| Self::resolve(&key, waiter, Err(error.duplicate()), None))
            .collect()
    }

    /// Reject everything. Used on shutdown.
    pub(crate) fn reject_all(&self, error: &BusError) -> Vec<Settled> {
        let drained: Vec<(TransactionKey, Waiter)> = self.lock().drain().collect();
        drained
            .into_iter()
            .map(|(key, waiter)| Self::resolve(&key, waiter, Err(error.duplicate()), None))
            .collect()
    }

    /// Cancel a caller's transaction. Returns `false` if it already settled.
    pub fn cancel(&self, key: &TransactionKey) -> bool {
        self.fail(key, BusError::Timeout(format!("{key} cancelled")))
            .is_some()
    }

    pub fn contains(&self, key: &TransactionKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TransactionKey, Waiter>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn resolve(
        key: &TransactionKey,
        waiter: Waiter,
        outcome: BusResult<Value>,
        response: Option<Packet>,
    ) -> Settled {
        match waiter {
            Waiter::Caller { tx, started } => {
                debug!(
                    key = %key,
                    ok = outcome.is_ok(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Transaction settled"
                );
                if tx.send(CallerSettlement { outcome, response }).is_err() {
                    warn!(key = %key, "Caller went away before its transaction settled");
                }
                Settled::Caller
            }
            Waiter::Relay { group, .. } => Settled::Relay {
                group,
                outcome,
                response,
            },
        }
    }
}
