//! Instructions flowing from the orchestrator to the peer fan-out.
//!
//! ```text
//! Orchestrator ──(lock held)──► DispatchQueue ──mpsc──► dispatcher task ──► peers
//!                 enqueue only                           blocking sends
//! ```
//!
//! The orchestrator never touches a peer's channel. It enqueues a
//! [`Dispatch`] through the [`PeerMessenger`] seam and moves on, so a slow
//! or dead peer cannot stall edits on any document.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use xie_core::ChangeSet;

use crate::protocol::Selection;

/// What the orchestrator wants delivered after accepting a `CHANGE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeBroadcast {
    pub source_session_key: String,
    /// Revision the source client based its change on
    pub base_revision: usize,
    /// Document revision after the change; unchanged for selection-only updates
    pub new_revision: usize,
    /// Started sessions on the document, source included
    pub receivers: HashSet<String>,
    /// Every known selection on the document, already forwarded
    pub selections: Vec<Selection>,
    /// The folded change set; `None` for selection-only updates
    pub change: Option<ChangeSet>,
}

/// Why the server is ending a set of sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    IdleTimeout,
    DocumentDeleted,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::IdleTimeout => {
                f.write_str("Terminating because session has been idle for too long")
            }
            TerminationReason::DocumentDeleted => {
                f.write_str("Terminating because the document has been deleted")
            }
        }
    }
}

/// Delivery side of the orchestrator. Implementations must not block.
pub trait PeerMessenger: Send + Sync {
    /// Send an update to the receivers and an acknowledgement to the source.
    fn broadcast(&self, change: ChangeBroadcast);

    /// Ask the connections of these sessions to close.
    fn terminate_sessions(&self, session_keys: HashSet<String>, reason: TerminationReason);
}

/// One queued instruction for the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Broadcast(ChangeBroadcast),
    Terminate {
        session_keys: HashSet<String>,
        reason: TerminationReason,
    },
}

/// FIFO of instructions; the sending half of the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    tx: mpsc::UnboundedSender<Dispatch>,
}

impl DispatchQueue {
    /// Create a queue and the receiver the dispatcher drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Dispatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn enqueue(&self, dispatch: Dispatch) {
        if self.tx.send(dispatch).is_err() {
            log::warn!("Dispatcher is gone; dropping instruction");
        }
    }
}

impl PeerMessenger for DispatchQueue {
    fn broadcast(&self, change: ChangeBroadcast) {
        self.enqueue(Dispatch::Broadcast(change));
    }

    fn terminate_sessions(&self, session_keys: HashSet<String>, reason: TerminationReason) {
        self.enqueue(Dispatch::Terminate {
            session_keys,
            reason,
        });
    }
}

// ─── Statistics ───────────────────────────────────────────────────────

/// Snapshot of fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub messages_sent: u64,
    /// Messages whose peer was gone before delivery
    pub messages_dropped: u64,
    pub close_requests: u64,
    pub active_peers: usize,
}

/// Lock-free counters behind [`FanoutStats`].
#[derive(Debug, Default)]
pub(crate) struct AtomicFanoutStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    close_requests: AtomicU64,
}

impl AtomicFanoutStats {
    pub(crate) fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_close(&self) {
        self.close_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, active_peers: usize) -> FanoutStats {
        FanoutStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            close_requests: self.close_requests.load(Ordering::Relaxed),
            active_peers,
        }
    }
}
