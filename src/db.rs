//! Database connection management
//!
//! One SQLite pool shared by the event log, the projections and the ledger.
//! The schema is created idempotently at startup; monetary columns are TEXT
//! holding decimal strings and timestamps are RFC-3339 TEXT, so values
//! round-trip losslessly through `rust_decimal` and `chrono`.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

/// SQLite database connection pool.
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the database at `database_url`,
    /// e.g. `sqlite://perpetua.db`.
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?;

        tracing::info!(url = database_url, "SQLite connection pool established");
        Ok(Self { pool })
    }

    /// Private in-memory database. A single connection keeps every query
    /// on the same memory instance; used by the test suite and sandbox runs.
    pub async fn connect_in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Check database health.
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Create the event log, projection and checkpoint tables.
    ///
    /// The ledger tables live in `ledger::schema` and are created by the
    /// same startup path.
    pub async fn init_core_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS event_log (
                seq              INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id         TEXT NOT NULL UNIQUE,
                dedup_key        TEXT NOT NULL UNIQUE,
                ts               TEXT NOT NULL,
                event_type       TEXT NOT NULL,
                source           TEXT NOT NULL,
                entity_kind      TEXT NOT NULL,
                entity_id        TEXT NOT NULL,
                scope_exchange   TEXT NOT NULL,
                scope_venue      TEXT NOT NULL,
                scope_account_id TEXT NOT NULL,
                scope_symbol     TEXT,
                scope_mode       TEXT NOT NULL,
                correlation_id   TEXT NOT NULL,
                causation_id     TEXT,
                command_id       TEXT,
                payload_json     TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_event_log_type ON event_log(event_type)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_event_log_ts ON event_log(ts)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_event_log_entity ON event_log(entity_kind, entity_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoint_store (
                name       TEXT PRIMARY KEY,
                last_seq   INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projection_balance (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                scope_exchange   TEXT NOT NULL,
                scope_venue      TEXT NOT NULL,
                scope_account_id TEXT NOT NULL,
                scope_mode       TEXT NOT NULL,
                asset            TEXT NOT NULL,
                free             TEXT NOT NULL DEFAULT '0',
                locked           TEXT NOT NULL DEFAULT '0',
                last_event_seq   INTEGER NOT NULL,
                updated_at       TEXT NOT NULL,
                UNIQUE(scope_exchange, scope_venue, scope_account_id, asset, scope_mode)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projection_position (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                scope_exchange   TEXT NOT NULL,
                scope_venue      TEXT NOT NULL,
                scope_account_id TEXT NOT NULL,
                scope_symbol     TEXT NOT NULL,
                scope_mode       TEXT NOT NULL,
                side             TEXT,
                qty              TEXT NOT NULL DEFAULT '0',
                entry_price      TEXT NOT NULL DEFAULT '0',
                unrealized_pnl   TEXT NOT NULL DEFAULT '0',
                leverage         INTEGER NOT NULL DEFAULT 1,
                margin_type      TEXT NOT NULL DEFAULT 'CROSS',
                last_event_seq   INTEGER NOT NULL,
                updated_at       TEXT NOT NULL,
                UNIQUE(scope_exchange, scope_venue, scope_account_id, scope_symbol, scope_mode)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projection_order (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                scope_exchange    TEXT NOT NULL,
                scope_venue       TEXT NOT NULL,
                scope_account_id  TEXT NOT NULL,
                scope_symbol      TEXT NOT NULL,
                scope_mode        TEXT NOT NULL,
                exchange_order_id TEXT NOT NULL,
                client_order_id   TEXT,
                order_state       TEXT NOT NULL,
                side              TEXT NOT NULL,
                order_type        TEXT NOT NULL,
                original_qty      TEXT NOT NULL,
                executed_qty      TEXT NOT NULL DEFAULT '0',
                price             TEXT,
                stop_price        TEXT,
                last_event_seq    INTEGER NOT NULL,
                created_at        TEXT NOT NULL,
                updated_at        TEXT NOT NULL,
                UNIQUE(scope_exchange, scope_venue, scope_account_id, exchange_order_id, scope_mode)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        tracing::debug!("core schema ready");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_schema_init() {
        let db = Database::connect_in_memory().await.unwrap();
        db.init_core_schema().await.unwrap();
        db.health_check().await.unwrap();

        // idempotent
        db.init_core_schema().await.unwrap();
    }

    #[tokio::test]
    async fn test_event_log_dedup_constraint() {
        let db = Database::connect_in_memory().await.unwrap();
        db.init_core_schema().await.unwrap();

        let insert = r#"
            INSERT INTO event_log (
                event_id, dedup_key, ts, event_type, source, entity_kind, entity_id,
                scope_exchange, scope_venue, scope_account_id, scope_symbol, scope_mode,
                correlation_id, payload_json
            ) VALUES (?1, ?2, '2026-01-01T00:00:00Z', 'TradeExecuted', 'REST', 'TRADE', 't1',
                      'BINANCE', 'FUTURES', 'main', 'XRPUSDT', 'testnet', 'c1', '{}')
        "#;

        sqlx::query(insert)
            .bind("e1")
            .bind("k1")
            .execute(db.pool())
            .await
            .unwrap();

        let dup = sqlx::query(insert)
            .bind("e2")
            .bind("k1")
            .execute(db.pool())
            .await;
        assert!(dup.is_err(), "duplicate dedup_key must violate UNIQUE");
    }
}
