//! Graceful shutdown — ordered teardown of a directory and its listeners.
//!
//! Shutdown sequence (order matters):
//! 1. Stop accepting new transport connections
//! 2. Reject every pending transaction
//! 3. Tell every peer goodbye
//! 4. Detach every socket adapter

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{info, warn};

/// Shutdown phase identifiers (in execution order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[repr(u8)]
pub enum ShutdownPhase {
    Running = 0,
    Draining = 1,
    RejectingTransactions = 2,
    NotifyingPeers = 3,
    DetachingSockets = 4,
    Complete = 5,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::RejectingTransactions => write!(f, "rejecting_transactions"),
            Self::NotifyingPeers => write!(f, "notifying_peers"),
            Self::DetachingSockets => write!(f, "detaching_sockets"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

impl ShutdownPhase {
    fn from_u8(val: u8) -> Self {
        match val {
            0 => Self::Running,
            1 => Self::Draining,
            2 => Self::RejectingTransactions,
            3 => Self::NotifyingPeers,
            4 => Self::DetachingSockets,
            _ => Self::Complete,
        }
    }
}

/// Log entry for a completed shutdown phase.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseLog {
    pub phase: ShutdownPhase,
    pub duration_ms: u64,
    pub detail: Option<String>,
}

/// Tracks the state of a shutdown in progress and signals listeners.
pub struct ShutdownCoordinator {
    is_shutting_down: AtomicBool,
    current_phase: AtomicU8,
    started_at: Mutex<Option<Instant>>,
    phase_log: Mutex<Vec<PhaseLog>>,
    signal: watch::Sender<bool>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            is_shutting_down: AtomicBool::new(false),
            current_phase: AtomicU8::new(ShutdownPhase::Running as u8),
            started_at: Mutex::new(None),
            phase_log: Mutex::new(Vec::new()),
            signal,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::Relaxed)
    }

    /// Receiver that flips to `true` once shutdown is initiated.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Initiate shutdown. Returns `false` if already shutting down.
    pub fn initiate(&self, reason: &str) -> bool {
        if self.is_shutting_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        self.current_phase
            .store(ShutdownPhase::Draining as u8, Ordering::SeqCst);
        self.signal.send_replace(true);
        info!(reason, "Graceful shutdown initiated");
        true
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        ShutdownPhase::from_u8(self.current_phase.load(Ordering::Relaxed))
    }

    /// Advance to the next phase, recording the one just finished.
    pub fn advance_phase(&self, next: ShutdownPhase, detail: Option<String>) {
        let current = self.current_phase();
        let elapsed = self
            .started_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|s| s.elapsed().as_millis() as u64)
            .unwrap_or(0);

        if next <= current {
            warn!(phase = %current, next = %next, "Ignoring backwards shutdown phase change");
            return;
        }
        self.phase_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PhaseLog {
                phase: current,
                duration_ms: elapsed,
                detail: detail.clone(),
            });
        self.current_phase.store(next as u8, Ordering::SeqCst);
        info!(phase = %current, next = %next, elapsed_ms = elapsed, detail = ?detail, "Shutdown phase complete");
    }

    pub fn phases_completed(&self) -> Vec<PhaseLog> {
        self.phase_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
