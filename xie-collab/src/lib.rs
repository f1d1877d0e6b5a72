//! # xie-collab: shared editing server for Xie documents
//!
//! Clients edit a document concurrently over WebSocket. The server keeps
//! the authoritative revision log, folds each incoming change over the
//! revisions its client had not yet seen, and fans the result out.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  SESSIONKEY/PING/CHANGE  ┌───────────────────┐
//! │ Editor A │ ───────────────────────► │ CollabServer      │
//! └──────────┘ ◄─────────────────────── │  (per-socket I/O) │
//!               HELLO/UPDATE/ACKCHANGE  └─────────┬─────────┘
//!                                                 ▼
//!                                       ┌───────────────────┐
//!                                       │ ConnectionManager │◄── dispatcher
//!                                       └─────────┬─────────┘        ▲
//!                                                 ▼                  │
//!                                       ┌───────────────────┐  DispatchQueue
//!                                       │ Orchestrator      │────────┘
//!                                       │  docs + sessions  │──► SnapshotStore
//!                                       └───────────────────┘     (JSON files)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: text wire messages and close reasons
//! - [`orchestrator`]: document ownership, session lifecycle, housekeeping
//! - [`broadcast`]: orchestrator → peer instructions and fan-out stats
//! - [`peers`]: connection ↔ session mapping and the dispatcher
//! - [`server`]: WebSocket listener
//! - [`storage`]: one JSON snapshot file per document
//! - [`config`]: server settings
//! - [`ids`]: document ids and session keys
//! - [`app`]: starts and stops the whole thing

pub mod app;
pub mod broadcast;
pub mod config;
pub mod ids;
pub mod orchestrator;
pub mod peers;
pub mod protocol;
pub mod server;
pub mod storage;

pub use app::{AppError, CollabContext};
pub use broadcast::{ChangeBroadcast, DispatchQueue, FanoutStats, PeerMessenger, TerminationReason};
pub use config::{ConfigError, HousekeepingConfig, ServerConfig};
pub use orchestrator::{ChangeRejected, DocHousekeeping, DocumentText, Orchestrator, OrchestratorError};
pub use peers::{ConnectionManager, EditSessionHandler};
pub use protocol::{ClientMessage, ProtocolError, Selection, ServerMessage, SessionStart};
pub use server::CollabServer;
pub use storage::{SnapshotStore, StoreError};
