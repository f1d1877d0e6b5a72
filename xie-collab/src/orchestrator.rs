//! Session registry and document owner.
//!
//! ```text
//!             ┌──────────────── Orchestrator ────────────────┐
//!  requests ─►│ Mutex<Registry>                               │
//!             │   docs:     doc id      → Document            │──► PeerMessenger
//!             │   sessions: session key → EditSession         │    (enqueue only)
//!             │ Mutex<()> io   (snapshot reads and writes)    │──► SnapshotStore
//!             └───────────────────────────────────────────────┘
//! ```
//!
//! Every logical operation holds the registry lock from start to finish, so
//! edits against one document are totally ordered. Lock order is always
//! registry, then io. Housekeeping takes a snapshot under the registry lock,
//! grabs the io lock, and releases the registry before writing, so disk
//! latency never blocks edits. A load of the same document waits on the io
//! lock and therefore never reads a file that is mid-save.
//!
//! Session lifecycle: `requested → started → gone` (idle timeout, transport
//! closed, or document deleted). An unclaimed request expires quietly.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use xie_core::{ChangeSet, ChangeSetError, CharUnit, Document, DocumentError};

use crate::broadcast::{ChangeBroadcast, PeerMessenger, TerminationReason};
use crate::config::HousekeepingConfig;
use crate::ids;
use crate::peers::EditSessionHandler;
use crate::protocol::{SessionStart, Selection};
use crate::storage::{SnapshotStore, StoreError};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("document {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Session-fatal reasons for refusing a `CHANGE`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChangeRejected {
    #[error("We don't like this change: your session is not open")]
    UnknownSession,
    #[error("We don't like this change: the document is gone")]
    DocumentGone,
    #[error("We don't like this change: {0}")]
    InvalidChange(ChangeSetError),
    #[error("We don't like this change: {0}")]
    Rejected(DocumentError),
}

/// A document's name and head text, for exporters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentText {
    pub name: String,
    pub text: Vec<CharUnit>,
}

/// What one document housekeeping pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocHousekeeping {
    pub saved: usize,
    pub unloaded: usize,
    pub failed: usize,
}

#[derive(Debug)]
struct EditSession {
    doc_id: String,
    last_active: Instant,
    /// `Some` until the peer announces the key
    requested_at: Option<Instant>,
    /// Selection in the document's head text; set once started
    selection: Option<Selection>,
}

impl EditSession {
    fn is_started(&self) -> bool {
        self.requested_at.is_none()
    }
}

#[derive(Debug, Default)]
struct Registry {
    docs: HashMap<String, Document>,
    sessions: HashMap<String, EditSession>,
}

impl Registry {
    /// Current selections of every session on `doc_id`, ordered by key.
    fn doc_selections(&self, doc_id: &str) -> Vec<Selection> {
        let mut selections: Vec<Selection> = self
            .sessions
            .values()
            .filter(|s| s.doc_id == doc_id)
            .filter_map(|s| s.selection.clone())
            .collect();
        selections.sort_by(|a, b| a.session_key.cmp(&b.session_key));
        selections
    }
}

pub struct Orchestrator {
    config: HousekeepingConfig,
    store: SnapshotStore,
    messenger: Arc<dyn PeerMessenger>,
    registry: Mutex<Registry>,
    io: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        config: HousekeepingConfig,
        store: SnapshotStore,
        messenger: Arc<dyn PeerMessenger>,
    ) -> Self {
        Self {
            config,
            store,
            messenger,
            registry: Mutex::new(Registry::default()),
            io: Mutex::new(()),
        }
    }

    /// Load `doc_id` from disk unless it is already in memory.
    /// Returns false if the document does not exist or cannot be read.
    async fn ensure_loaded(&self, reg: &mut Registry, doc_id: &str) -> bool {
        if reg.docs.contains_key(doc_id) {
            return true;
        }
        let _io = self.io.lock().await;
        match self.store.load(doc_id).await {
            Ok(snapshot) => {
                log::info!("Loaded document {doc_id}");
                reg.docs
                    .insert(doc_id.to_string(), Document::from_snapshot(snapshot));
                true
            }
            Err(StoreError::NotFound(_)) => {
                log::debug!("Document {doc_id} does not exist");
                false
            }
            Err(e) => {
                log::warn!("Failed to load document {doc_id}: {e}");
                false
            }
        }
    }

    // ─── Documents ────────────────────────────────────────────────────

    /// Create an empty document and its snapshot file.
    pub async fn create_document(&self, name: &str) -> Result<String, OrchestratorError> {
        let mut reg = self.registry.lock().await;
        let _io = self.io.lock().await;
        let doc_id = loop {
            let candidate = ids::short_id();
            if reg.docs.contains_key(&candidate) || self.store.exists(&candidate).await? {
                continue;
            }
            break candidate;
        };
        let doc = Document::new(doc_id.clone(), name, Vec::new());
        self.store.save(&doc.snapshot()).await?;
        reg.docs.insert(doc_id.clone(), doc);
        log::info!("Created document {doc_id} ({name:?})");
        Ok(doc_id)
    }

    /// Unload a document, delete its snapshot and end all its sessions.
    /// A missing document or a failed delete is logged, not reported.
    pub async fn delete_document(&self, doc_id: &str) {
        let mut reg = self.registry.lock().await;
        reg.docs.remove(doc_id);
        let doomed: HashSet<String> = reg
            .sessions
            .iter()
            .filter(|(_, s)| s.doc_id == doc_id)
            .map(|(key, _)| key.clone())
            .collect();
        reg.sessions.retain(|key, _| !doomed.contains(key));
        if !doomed.is_empty() {
            log::info!("Ending {} session(s) on deleted document {doc_id}", doomed.len());
            self.messenger
                .terminate_sessions(doomed, TerminationReason::DocumentDeleted);
        }

        let _io = self.io.lock().await;
        match self.store.delete(doc_id).await {
            Ok(()) => log::info!("Deleted document {doc_id}"),
            Err(StoreError::NotFound(_)) => {
                log::info!("Document {doc_id} was not on disk; nothing to delete")
            }
            Err(e) => log::warn!("Failed to delete document {doc_id} from disk: {e}"),
        }
    }

    /// Display name of a document, loading it if needed.
    pub async fn document_name(&self, doc_id: &str) -> Option<String> {
        let mut reg = self.registry.lock().await;
        if !self.ensure_loaded(&mut reg, doc_id).await {
            return None;
        }
        reg.docs.get(doc_id).map(|doc| doc.name().to_string())
    }

    pub async fn rename_document(&self, doc_id: &str, name: &str) -> Result<(), OrchestratorError> {
        let mut reg = self.registry.lock().await;
        if !self.ensure_loaded(&mut reg, doc_id).await {
            return Err(OrchestratorError::NotFound(doc_id.to_string()));
        }
        let doc = reg
            .docs
            .get_mut(doc_id)
            .ok_or_else(|| OrchestratorError::NotFound(doc_id.to_string()))?;
        doc.rename(name);
        log::info!("Renamed document {doc_id} to {name:?}");
        Ok(())
    }

    /// Name and head text of a document. A dirty document is saved first,
    /// best effort, so the disk copy matches what the caller exports.
    pub async fn document_text(&self, doc_id: &str) -> Option<DocumentText> {
        let mut reg = self.registry.lock().await;
        if !self.ensure_loaded(&mut reg, doc_id).await {
            return None;
        }
        let doc = reg.docs.get_mut(doc_id)?;
        let result = DocumentText {
            name: doc.name().to_string(),
            text: doc.head_text().to_vec(),
        };
        if !doc.is_dirty() {
            return Some(result);
        }

        let snapshot = doc.snapshot();
        doc.mark_saved();
        let io = self.io.lock().await;
        drop(reg);
        let saved = self.store.save(&snapshot).await;
        drop(io);
        if let Err(e) = saved {
            log::error!("Failed to save document {doc_id} before export: {e}");
            if let Some(doc) = self.registry.lock().await.docs.get_mut(doc_id) {
                doc.mark_unsaved();
            }
        }
        Some(result)
    }

    // ─── Sessions ─────────────────────────────────────────────────────

    /// Reserve a session key for `doc_id`. `None` if the document does not exist.
    pub async fn request_session(&self, doc_id: &str) -> Option<String> {
        let mut reg = self.registry.lock().await;
        if !self.ensure_loaded(&mut reg, doc_id).await {
            return None;
        }
        let key = loop {
            let candidate = ids::session_key();
            if !reg.sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        let now = Instant::now();
        reg.sessions.insert(
            key.clone(),
            EditSession {
                doc_id: doc_id.to_string(),
                last_active: now,
                requested_at: Some(now),
                selection: None,
            },
        );
        log::info!("Session {key} requested for document {doc_id}");
        Some(key)
    }

    /// Start a requested session. `None` if the key is unknown or already
    /// started, or the document is gone.
    pub async fn start_session(&self, session_key: &str) -> Option<SessionStart> {
        let mut guard = self.registry.lock().await;
        let doc_id = match guard.sessions.get(session_key) {
            Some(sess) if !sess.is_started() => sess.doc_id.clone(),
            _ => return None,
        };
        if !self.ensure_loaded(&mut guard, &doc_id).await {
            return None;
        }
        let reg = &mut *guard;
        let peer_selections = reg.doc_selections(&doc_id);
        let doc = reg.docs.get_mut(&doc_id)?;
        doc.touch(false);
        let start = SessionStart {
            name: doc.name().to_string(),
            revision_id: doc.revision_id(),
            text: doc.head_text().to_vec(),
            peer_selections,
        };

        let sess = reg.sessions.get_mut(session_key)?;
        sess.requested_at = None;
        sess.last_active = Instant::now();
        sess.selection = Some(Selection {
            session_key: session_key.to_string(),
            ..Selection::default()
        });
        log::info!(
            "Session {session_key} started on document {doc_id} at revision {}",
            start.revision_id
        );
        Some(start)
    }

    /// True if the session exists and has started. Counts as activity.
    pub async fn is_session_open(&self, session_key: &str) -> bool {
        let mut reg = self.registry.lock().await;
        match reg.sessions.get_mut(session_key) {
            Some(sess) if sess.is_started() => {
                sess.last_active = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Forget a session whose transport has closed.
    pub async fn session_closed(&self, session_key: &str) {
        let mut reg = self.registry.lock().await;
        if reg.sessions.remove(session_key).is_some() {
            log::info!("Session {session_key} closed");
        }
    }

    /// Handle a client's `CHANGE`: fold the change (if any) into the
    /// document, forward the sender's selection, and queue the broadcast.
    pub async fn change_received(
        &self,
        session_key: &str,
        base_revision: usize,
        selection: Selection,
        change: Option<ChangeSet>,
    ) -> Result<(), ChangeRejected> {
        let mut guard = self.registry.lock().await;
        let doc_id = match guard.sessions.get_mut(session_key) {
            Some(sess) if sess.is_started() => {
                sess.last_active = Instant::now();
                sess.doc_id.clone()
            }
            _ => return Err(ChangeRejected::UnknownSession),
        };
        if !self.ensure_loaded(&mut guard, &doc_id).await {
            return Err(ChangeRejected::DocumentGone);
        }
        let reg = &mut *guard;
        let doc = reg
            .docs
            .get_mut(&doc_id)
            .ok_or(ChangeRejected::DocumentGone)?;

        let (start, end, new_revision, folded) = match change {
            Some(cs) => {
                cs.validate().map_err(ChangeRejected::InvalidChange)?;
                let applied = doc
                    .apply_change(&cs, selection.start, selection.end, base_revision)
                    .map_err(ChangeRejected::Rejected)?;
                log::debug!(
                    "Session {session_key}: change at base {base_revision} became revision {} of {doc_id}",
                    applied.revision_id
                );
                let (start, end) = applied.selection;
                (start, end, applied.revision_id, Some(applied.change))
            }
            None => {
                let (start, end) = doc
                    .forward_selection(selection.start, selection.end, base_revision)
                    .map_err(ChangeRejected::Rejected)?;
                log::trace!("Session {session_key}: selection update on {doc_id}");
                (start, end, doc.revision_id(), None)
            }
        };

        if let Some(sess) = reg.sessions.get_mut(session_key) {
            sess.selection = Some(Selection {
                session_key: session_key.to_string(),
                start,
                end,
                caret_at_start: selection.caret_at_start,
            });
        }
        let receivers = reg
            .sessions
            .iter()
            .filter(|(_, s)| s.is_started() && s.doc_id == doc_id)
            .map(|(key, _)| key.clone())
            .collect();
        self.messenger.broadcast(ChangeBroadcast {
            source_session_key: session_key.to_string(),
            base_revision,
            new_revision,
            receivers,
            selections: reg.doc_selections(&doc_id),
            change: folded,
        });
        Ok(())
    }

    // ─── Housekeeping ─────────────────────────────────────────────────

    /// Drop unclaimed session requests and terminate idle sessions.
    /// Returns the number of sessions terminated.
    pub async fn cleanup_sessions(&self, now: Instant) -> usize {
        let idle_end = self.config.session_idle_end();
        let expiry = self.config.session_request_expiry();
        let mut to_terminate = HashSet::new();

        let mut reg = self.registry.lock().await;
        reg.sessions.retain(|key, sess| {
            if now.saturating_duration_since(sess.last_active) > idle_end {
                log::info!("Session {key} idle for too long; terminating");
                to_terminate.insert(key.clone());
                return false;
            }
            match sess.requested_at {
                Some(requested) if now.saturating_duration_since(requested) > expiry => {
                    log::debug!("Session {key} was never claimed; dropping");
                    false
                }
                _ => true,
            }
        });

        let terminated = to_terminate.len();
        if terminated > 0 {
            self.messenger
                .terminate_sessions(to_terminate, TerminationReason::IdleTimeout);
        }
        terminated
    }

    /// Save dirty documents and unload documents idle past the threshold.
    ///
    /// A document with any session on it stays loaded: reloading restarts
    /// its revision log, which would strand those sessions' base revisions.
    ///
    /// Each iteration unloads the expired clean documents, then saves one
    /// dirty document with the registry unlocked, and repeats until nothing
    /// is left to save. An expired dirty document is only unloaded on the
    /// iteration after its save. Each document is saved at most once per
    /// pass; a failed save leaves it dirty and loaded.
    pub async fn housekeep_documents(&self, now: Instant) -> DocHousekeeping {
        let unload_after = self.config.unload_after();
        let mut report = DocHousekeeping::default();
        let mut attempted: HashSet<String> = HashSet::new();

        loop {
            let mut reg = self.registry.lock().await;
            let before = reg.docs.len();
            let in_use: HashSet<String> =
                reg.sessions.values().map(|s| s.doc_id.clone()).collect();
            reg.docs.retain(|doc_id, doc| {
                let expired = now.saturating_duration_since(doc.last_accessed()) > unload_after;
                if expired && !doc.is_dirty() && !in_use.contains(doc_id) {
                    log::info!("Unloading idle document {doc_id}");
                    return false;
                }
                true
            });
            report.unloaded += before - reg.docs.len();

            let Some(doc) = reg
                .docs
                .values_mut()
                .find(|doc| doc.is_dirty() && !attempted.contains(doc.id()))
            else {
                break;
            };
            let snapshot = doc.snapshot();
            doc.mark_saved();
            attempted.insert(snapshot.doc_id.clone());

            let io = self.io.lock().await;
            drop(reg);
            let saved = self.store.save(&snapshot).await;
            drop(io);

            match saved {
                Ok(()) => report.saved += 1,
                Err(e) => {
                    log::error!("Error saving dirty document {}: {e}", snapshot.doc_id);
                    report.failed += 1;
                    if let Some(doc) = self.registry.lock().await.docs.get_mut(&snapshot.doc_id) {
                        doc.mark_unsaved();
                    }
                }
            }
        }
        report
    }

    /// Run housekeeping every period until `shutdown` flips to true, then
    /// save every dirty document one last time.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.period());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let report = self.housekeep_documents(now).await;
                    if report != DocHousekeeping::default() {
                        log::debug!("Housekeeping: {report:?}");
                    }
                    self.cleanup_sessions(now).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        log::info!("Housekeeping exiting");
        let report = self.housekeep_documents(Instant::now()).await;
        log::info!(
            "Housekeeping finished: saved {}, failed {}",
            report.saved,
            report.failed
        );
    }

    // ─── Introspection ────────────────────────────────────────────────

    pub async fn loaded_documents(&self) -> usize {
        self.registry.lock().await.docs.len()
    }

    pub async fn session_count(&self) -> usize {
        self.registry.lock().await.sessions.len()
    }
}

#[async_trait]
impl EditSessionHandler for Orchestrator {
    async fn start_session(&self, session_key: &str) -> Option<SessionStart> {
        Orchestrator::start_session(self, session_key).await
    }

    async fn is_session_open(&self, session_key: &str) -> bool {
        Orchestrator::is_session_open(self, session_key).await
    }

    async fn change_received(
        &self,
        session_key: &str,
        base_revision: usize,
        selection: Selection,
        change: Option<ChangeSet>,
    ) -> Result<(), ChangeRejected> {
        Orchestrator::change_received(self, session_key, base_revision, selection, change).await
    }

    async fn session_closed(&self, session_key: &str) {
        Orchestrator::session_closed(self, session_key).await
    }
}
