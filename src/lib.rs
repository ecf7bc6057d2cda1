//! Perpetua - event-sourced perpetual-futures trading core
//!
//! An append-only event log with strict deduplication feeds two
//! checkpointed consumers: the projector (live balance / position /
//! open-order views) and the ledger pump (double-entry journal in
//! USDT-equivalent). A hybrid WebSocket+REST reconciler closes the gaps
//! a lossy connection leaves behind.
//!
//! # Modules
//!
//! - [`types`] - `Scope` and the shared trading enums
//! - [`events`] - `Event`, the closed `EventType` set, dedup-key grammar
//! - [`state_machine`] - order / engine / websocket lifecycles
//! - [`db`] - SQLite pool and the core schema
//! - [`store`] - event log, checkpoints, projection tables
//! - [`projector`] - checkpointed projection pump and handlers
//! - [`reconciler`] - adaptive REST polling and drift detection
//! - [`ledger`] - journal entry builder, store, reporting, pump
//! - [`exchange`] - REST/WebSocket adapters, mock exchange
//! - [`engine`] - wiring, lifecycle, order gating
//! - [`config`] - YAML + environment configuration
//! - [`logging`] - tracing initialization

pub mod config;
pub mod db;
pub mod engine;
pub mod events;
pub mod exchange;
pub mod ledger;
pub mod logging;
pub mod projector;
pub mod reconciler;
pub mod state_machine;
pub mod store;
pub mod types;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use db::Database;
pub use engine::{Engine, EngineError};
pub use events::{Event, EventType};
pub use ledger::{JournalEntry, JournalEntryBuilder, JournalLine, LedgerStore};
pub use projector::Projector;
pub use reconciler::{DriftDetector, HybridReconciler};
pub use store::{CheckpointStore, EventStore, ProjectionStore};
pub use types::{Scope, TradingMode};
