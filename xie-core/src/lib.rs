//! # xie-core
//!
//! The pure half of the Xie collaborative editor: the bi-scriptal character
//! unit, the change-set algebra used for operational transformation, and the
//! per-document revision log built on it.
//!
//! ```text
//! ┌──────────┐   items    ┌───────────┐  revisions  ┌──────────┐
//! │ CharUnit │ ─────────► │ ChangeSet │ ──────────► │ Document │
//! └──────────┘            └───────────┘             └──────────┘
//! ```
//!
//! Nothing here performs I/O or locking; `xie-collab` owns the documents and
//! serializes access to them.

pub mod changeset;
pub mod document;
pub mod unit;

pub use changeset::{ChangeSet, ChangeSetBuilder, ChangeSetError, Item};
pub use document::{AppliedChange, Document, DocumentError, DocumentSnapshot};
pub use unit::{text_from_str, text_to_string, CharUnit, CharUnitError};
