//! Storage layer
//!
//! The append-only event log, per-consumer checkpoints and the projection
//! tables. All writes serialize through the SQLite pool; every monetary
//! value crosses the boundary as a decimal string.

pub mod checkpoint;
pub mod event_store;
pub mod projections;

pub use checkpoint::CheckpointStore;
pub use event_store::EventStore;
pub use projections::{BalanceRow, OrderRow, PositionRow, ProjectionStore};

use thiserror::Error;

/// Storage errors: the database itself, or a row that no longer decodes
/// into the domain types (corrupt enum tag, malformed decimal).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error("row decode failed: {0}")]
    Decode(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
