//! Append-only event log
//!
//! The single source of truth. Events are inserted once and never mutated;
//! `seq` is the AUTOINCREMENT rowid, so successful appends get strictly
//! increasing, gap-free sequence numbers (rejected duplicates do not
//! consume one).
//!
//! Deduplication is keyed solely on `dedup_key`: a duplicate append is
//! reported (`Ok(false)`), never an error. That property is what makes
//! every retry in the system safe.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use super::{StoreError, StoreResult};
use crate::events::{Event, EventType};
use crate::types::{EntityKind, EventSource, Scope};

/// Event log over the shared pool.
#[derive(Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

#[derive(Debug, FromRow)]
struct EventRow {
    seq: i64,
    event_id: String,
    dedup_key: String,
    ts: String,
    event_type: String,
    source: String,
    entity_kind: String,
    entity_id: String,
    scope_exchange: String,
    scope_venue: String,
    scope_account_id: String,
    scope_symbol: Option<String>,
    scope_mode: String,
    correlation_id: String,
    causation_id: Option<String>,
    command_id: Option<String>,
    payload_json: String,
}

impl EventRow {
    fn into_event(self) -> StoreResult<Event> {
        let event_type = EventType::from_str(&self.event_type)
            .ok_or_else(|| StoreError::Decode(format!("unknown event_type {}", self.event_type)))?;
        let source = EventSource::from_str(&self.source)
            .ok_or_else(|| StoreError::Decode(format!("unknown source {}", self.source)))?;
        let entity_kind = EntityKind::from_str(&self.entity_kind)
            .ok_or_else(|| StoreError::Decode(format!("unknown entity_kind {}", self.entity_kind)))?;
        let ts: DateTime<Utc> = self
            .ts
            .parse()
            .map_err(|e| StoreError::Decode(format!("bad ts {}: {e}", self.ts)))?;
        let payload = serde_json::from_str(&self.payload_json)
            .map_err(|e| StoreError::Decode(format!("bad payload for {}: {e}", self.event_id)))?;

        Ok(Event {
            event_id: self.event_id,
            seq: Some(self.seq),
            ts,
            event_type,
            source,
            entity_kind,
            entity_id: self.entity_id,
            scope: Scope {
                exchange: self.scope_exchange,
                venue: self.scope_venue,
                account_id: self.scope_account_id,
                symbol: self.scope_symbol,
                mode: self.scope_mode,
            },
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            command_id: self.command_id,
            dedup_key: self.dedup_key,
            payload,
        })
    }
}

const SELECT_COLS: &str = "seq, event_id, dedup_key, ts, event_type, source, entity_kind, \
     entity_id, scope_exchange, scope_venue, scope_account_id, scope_symbol, scope_mode, \
     correlation_id, causation_id, command_id, payload_json";

impl EventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append an event. Returns `true` when stored, `false` when an event
    /// with the same `dedup_key` already exists. A duplicate is not a
    /// failure; it is the dedup mechanism working.
    pub async fn append(&self, event: &Event) -> StoreResult<bool> {
        let payload_json = event.payload.to_string();

        let result = sqlx::query(
            r#"
            INSERT INTO event_log (
                event_id, dedup_key, ts, event_type, source, entity_kind, entity_id,
                scope_exchange, scope_venue, scope_account_id, scope_symbol, scope_mode,
                correlation_id, causation_id, command_id, payload_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            ON CONFLICT(dedup_key) DO NOTHING
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.dedup_key)
        .bind(event.ts.to_rfc3339())
        .bind(event.event_type.as_str())
        .bind(event.source.as_str())
        .bind(event.entity_kind.as_str())
        .bind(&event.entity_id)
        .bind(&event.scope.exchange)
        .bind(&event.scope.venue)
        .bind(&event.scope.account_id)
        .bind(&event.scope.symbol)
        .bind(&event.scope.mode)
        .bind(&event.correlation_id)
        .bind(&event.causation_id)
        .bind(&event.command_id)
        .bind(payload_json)
        .execute(&self.pool)
        .await?;

        let stored = result.rows_affected() == 1;
        if !stored {
            tracing::debug!(
                dedup_key = %event.dedup_key,
                event_type = %event.event_type,
                "duplicate event rejected"
            );
        }
        Ok(stored)
    }

    /// Events with `seq > since_seq` in ascending seq order, at most `limit`.
    pub async fn get_since(&self, since_seq: i64, limit: i64) -> StoreResult<Vec<Event>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLS} FROM event_log WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2"
        ))
        .bind(since_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    /// Most recent events of one type, newest first.
    pub async fn get_by_type(&self, event_type: EventType, limit: i64) -> StoreResult<Vec<Event>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLS} FROM event_log WHERE event_type = ?1 ORDER BY seq DESC LIMIT ?2"
        ))
        .bind(event_type.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    /// Total number of stored events.
    pub async fn count(&self) -> StoreResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM event_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Highest assigned seq (0 when the log is empty).
    pub async fn last_seq(&self) -> StoreResult<i64> {
        let (seq,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(seq), 0) FROM event_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(seq)
    }
}
