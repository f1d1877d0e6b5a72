//! A document's revision log and materialized head text.
//!
//! ```text
//! start_text ──rev[0]=identity──► ──rev[1]──► ──rev[2]──► … ──► head_text
//! ```
//!
//! Clients edit against the last revision they have seen. An incoming change
//! is transformed with [`ChangeSet::follow`] through every revision appended
//! since, then appended itself. None of the methods are thread-safe; the
//! owner serializes access.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;

use crate::changeset::{ChangeSet, ChangeSetError};
use crate::unit::CharUnit;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("unknown base revision {base}; head is {head}")]
    UnknownRevision { base: usize, head: usize },
    #[error("change expects length {actual} but base revision {base} has length {expected}")]
    BaseLengthMismatch {
        base: usize,
        expected: usize,
        actual: usize,
    },
    #[error(transparent)]
    ChangeSet(#[from] ChangeSetError),
}

/// The flat on-disk form of a document: the head text becomes the next
/// load's start text; the revision log is not kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    pub doc_id: String,
    pub name: String,
    pub start_text: Vec<CharUnit>,
}

/// Outcome of [`Document::apply_change`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedChange {
    /// The change as appended to the log, valid against the previous head.
    pub change: ChangeSet,
    /// The caller's selection forwarded into the new head text.
    pub selection: (usize, usize),
    /// Id of the newly appended revision.
    pub revision_id: usize,
}

#[derive(Debug, Clone)]
pub struct Document {
    id: String,
    name: String,
    start_text: Vec<CharUnit>,
    revisions: Vec<ChangeSet>,
    head_text: Vec<CharUnit>,
    dirty: bool,
    last_accessed: Instant,
}

impl Document {
    pub fn new(id: impl Into<String>, name: impl Into<String>, start_text: Vec<CharUnit>) -> Self {
        let revisions = vec![ChangeSet::identity(start_text.len())];
        Self {
            id: id.into(),
            name: name.into(),
            head_text: start_text.clone(),
            start_text,
            revisions,
            dirty: false,
            last_accessed: Instant::now(),
        }
    }

    /// Rebuild from a saved snapshot with a fresh identity revision.
    pub fn from_snapshot(snapshot: DocumentSnapshot) -> Self {
        Self::new(snapshot.doc_id, snapshot.name, snapshot.start_text)
    }

    /// Snapshot of the current head, for saving.
    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            doc_id: self.id.clone(),
            name: self.name.clone(),
            start_text: self.head_text.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start_text(&self) -> &[CharUnit] {
        &self.start_text
    }

    pub fn head_text(&self) -> &[CharUnit] {
        &self.head_text
    }

    pub fn revisions(&self) -> &[ChangeSet] {
        &self.revisions
    }

    /// Id of the latest revision; 0 is the initial identity.
    pub fn revision_id(&self) -> usize {
        self.revisions.len() - 1
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn last_accessed(&self) -> Instant {
        self.last_accessed
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.touch(true);
    }

    /// Record an access; `make_dirty` also flags unsaved changes.
    pub fn touch(&mut self, make_dirty: bool) {
        self.last_accessed = Instant::now();
        self.dirty |= make_dirty;
    }

    /// Clear the dirty flag after the snapshot was handed to storage.
    pub fn mark_saved(&mut self) {
        self.dirty = false;
    }

    /// Restore the dirty flag when a save failed.
    pub fn mark_unsaved(&mut self) {
        self.dirty = true;
    }

    fn check_base(&self, base: usize) -> Result<(), DocumentError> {
        if base >= self.revisions.len() {
            return Err(DocumentError::UnknownRevision {
                base,
                head: self.revision_id(),
            });
        }
        Ok(())
    }

    /// Forward a selection made at revision `base` into the head text.
    pub fn forward_selection(
        &mut self,
        start: usize,
        end: usize,
        base: usize,
    ) -> Result<(usize, usize), DocumentError> {
        self.check_base(base)?;
        self.touch(false);
        let mut positions = [start, end];
        for rev in &self.revisions[base + 1..] {
            rev.forward_positions(&mut positions);
        }
        Ok((positions[0], positions[1]))
    }

    /// Fold a client's change made at revision `base` into the log.
    ///
    /// The change must already have passed [`ChangeSet::validate`]. It is
    /// followed through every later revision, appended, and applied to the
    /// head; the selection is forwarded through the same revisions.
    pub fn apply_change(
        &mut self,
        change: &ChangeSet,
        sel_start: usize,
        sel_end: usize,
        base: usize,
    ) -> Result<AppliedChange, DocumentError> {
        self.check_base(base)?;
        let base_len = self.revisions[base].length_after();
        if change.length_before() != base_len {
            return Err(DocumentError::BaseLengthMismatch {
                base,
                expected: base_len,
                actual: change.length_before(),
            });
        }

        let mut folded = change.clone();
        let mut positions = [sel_start, sel_end];
        for rev in &self.revisions[base + 1..] {
            folded = rev.follow(&folded)?;
            rev.forward_positions(&mut positions);
        }
        self.head_text = folded.apply(&self.head_text)?;
        self.revisions.push(folded.clone());
        self.touch(true);
        log::trace!(
            "doc {}: base {} -> revision {} as {}",
            self.id,
            base,
            self.revision_id(),
            folded
        );

        Ok(AppliedChange {
            change: folded,
            selection: (positions[0], positions[1]),
            revision_id: self.revision_id(),
        })
    }
}
