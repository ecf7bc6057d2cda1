//! Ledger schema
//!
//! Journal tables, the per-account balance projection, the reporting views
//! and the seeded chart of accounts. Tables use `CREATE IF NOT EXISTS`;
//! views are dropped and recreated so definition changes apply on restart.

use sqlx::SqlitePool;

use super::types::INITIAL_ACCOUNTS;
use crate::store::StoreResult;

/// Create (or refresh) everything the ledger needs.
pub async fn init_ledger_schema(pool: &SqlitePool) -> StoreResult<()> {
    create_tables(pool).await?;
    create_views(pool).await?;
    seed_accounts(pool).await?;
    tracing::info!("ledger schema ready");
    Ok(())
}

async fn create_tables(pool: &SqlitePool) -> StoreResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS account (
            account_id   TEXT PRIMARY KEY,
            account_type TEXT NOT NULL,
            venue        TEXT NOT NULL,
            asset        TEXT,
            name         TEXT NOT NULL,
            description  TEXT,
            is_active    INTEGER NOT NULL DEFAULT 1,
            created_at   TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS journal_entry (
            entry_id            TEXT PRIMARY KEY,
            ts                  TEXT NOT NULL,
            transaction_type    TEXT NOT NULL,
            scope_mode          TEXT NOT NULL,
            related_trade_id    TEXT,
            related_order_id    TEXT,
            related_position_id TEXT,
            symbol              TEXT,
            source_event_id     TEXT,
            source              TEXT NOT NULL,
            description         TEXT,
            memo                TEXT,
            raw_data            TEXT,
            created_at          TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS journal_line (
            line_id    INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_id   TEXT NOT NULL,
            account_id TEXT NOT NULL,
            side       TEXT NOT NULL,
            amount     TEXT NOT NULL,
            asset      TEXT NOT NULL,
            usdt_value TEXT NOT NULL,
            usdt_rate  TEXT NOT NULL,
            memo       TEXT,
            line_order INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (entry_id) REFERENCES journal_entry(entry_id),
            FOREIGN KEY (account_id) REFERENCES account(account_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS account_balance (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id    TEXT NOT NULL,
            scope_mode    TEXT NOT NULL,
            balance       TEXT NOT NULL DEFAULT '0',
            last_entry_id TEXT,
            last_entry_ts TEXT,
            updated_at    TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(account_id, scope_mode),
            FOREIGN KEY (account_id) REFERENCES account(account_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_account_type ON account(account_type)",
        "CREATE INDEX IF NOT EXISTS idx_journal_entry_ts ON journal_entry(ts)",
        "CREATE INDEX IF NOT EXISTS idx_journal_entry_type ON journal_entry(transaction_type)",
        "CREATE INDEX IF NOT EXISTS idx_journal_entry_source_event ON journal_entry(source_event_id)",
        "CREATE INDEX IF NOT EXISTS idx_journal_entry_mode ON journal_entry(scope_mode)",
        "CREATE INDEX IF NOT EXISTS idx_journal_line_entry ON journal_line(entry_id)",
        "CREATE INDEX IF NOT EXISTS idx_journal_line_account ON journal_line(account_id)",
        "CREATE INDEX IF NOT EXISTS idx_account_balance_account ON account_balance(account_id)",
    ] {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}

async fn create_views(pool: &SqlitePool) -> StoreResult<()> {
    sqlx::query("DROP VIEW IF EXISTS v_daily_pnl").execute(pool).await?;
    sqlx::query(
        r#"
        CREATE VIEW v_daily_pnl AS
        SELECT
            DATE(je.ts) AS trade_date,
            je.scope_mode,
            COUNT(DISTINCT je.entry_id) AS trade_count,
            SUM(CASE
                WHEN jl.account_id = 'INCOME:TRADING:REALIZED_PNL' AND jl.side = 'CREDIT'
                THEN CAST(jl.amount AS REAL)
                WHEN jl.account_id = 'INCOME:TRADING:REALIZED_PNL' AND jl.side = 'DEBIT'
                THEN -CAST(jl.amount AS REAL)
                ELSE 0
            END) AS daily_pnl,
            SUM(CASE
                WHEN jl.account_id LIKE 'EXPENSE:FEE:TRADING%'
                THEN CAST(jl.usdt_value AS REAL)
                ELSE 0
            END) AS trading_fees,
            SUM(CASE
                WHEN jl.account_id LIKE 'EXPENSE:FEE:FUNDING%'
                THEN CAST(jl.usdt_value AS REAL)
                ELSE 0
            END) AS funding_fees,
            SUM(CASE
                WHEN jl.account_id LIKE 'EXPENSE:FEE:%'
                THEN CAST(jl.usdt_value AS REAL)
                ELSE 0
            END) AS total_fees,
            COUNT(DISTINCT CASE
                WHEN jl.account_id = 'INCOME:TRADING:REALIZED_PNL'
                    AND jl.side = 'CREDIT'
                    AND CAST(jl.amount AS REAL) > 0
                THEN je.entry_id
            END) AS winning_count,
            COUNT(DISTINCT CASE
                WHEN jl.account_id = 'INCOME:TRADING:REALIZED_PNL'
                    AND jl.side = 'DEBIT'
                THEN je.entry_id
            END) AS losing_count
        FROM journal_entry je
        JOIN journal_line jl ON je.entry_id = jl.entry_id
        GROUP BY DATE(je.ts), je.scope_mode
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("DROP VIEW IF EXISTS v_fee_summary").execute(pool).await?;
    sqlx::query(
        r#"
        CREATE VIEW v_fee_summary AS
        SELECT
            DATE(je.ts) AS fee_date,
            je.scope_mode,
            jl.account_id AS fee_type,
            jl.asset AS fee_asset,
            SUM(CAST(jl.amount AS REAL)) AS total_amount,
            SUM(CAST(jl.usdt_value AS REAL)) AS total_usdt_value,
            COUNT(*) AS fee_count
        FROM journal_entry je
        JOIN journal_line jl ON je.entry_id = jl.entry_id
        WHERE jl.account_id LIKE 'EXPENSE:FEE:%' AND jl.side = 'DEBIT'
        GROUP BY DATE(je.ts), je.scope_mode, jl.account_id, jl.asset
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("DROP VIEW IF EXISTS v_account_ledger").execute(pool).await?;
    sqlx::query(
        r#"
        CREATE VIEW v_account_ledger AS
        SELECT
            je.ts,
            je.entry_id,
            je.scope_mode,
            jl.account_id,
            jl.asset,
            jl.side,
            CAST(jl.amount AS REAL) AS amount,
            CAST(jl.usdt_value AS REAL) AS usdt_value,
            CASE jl.side
                WHEN 'DEBIT' THEN CAST(jl.amount AS REAL)
                ELSE -CAST(jl.amount AS REAL)
            END AS signed_amount,
            je.transaction_type,
            je.description,
            je.symbol,
            jl.line_order
        FROM journal_entry je
        JOIN journal_line jl ON je.entry_id = jl.entry_id
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("DROP VIEW IF EXISTS v_portfolio").execute(pool).await?;
    sqlx::query(
        r#"
        CREATE VIEW v_portfolio AS
        SELECT
            a.venue,
            a.asset,
            a.account_id,
            a.name,
            ab.scope_mode,
            CAST(COALESCE(ab.balance, '0') AS REAL) AS balance,
            ab.last_entry_ts AS last_updated
        FROM account a
        LEFT JOIN account_balance ab ON a.account_id = ab.account_id
        WHERE a.account_type = 'ASSET'
            AND a.is_active = 1
            AND a.venue IN ('BINANCE_SPOT', 'BINANCE_FUTURES')
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("DROP VIEW IF EXISTS v_recent_trades").execute(pool).await?;
    sqlx::query(
        r#"
        CREATE VIEW v_recent_trades AS
        SELECT
            je.entry_id,
            je.ts,
            je.scope_mode,
            je.symbol,
            je.description,
            je.related_trade_id,
            CASE
                WHEN je.description LIKE 'BUY%' THEN 'BUY'
                WHEN je.description LIKE 'SELL%' THEN 'SELL'
                ELSE 'UNKNOWN'
            END AS side,
            (SELECT SUM(CAST(jl2.amount AS REAL))
             FROM journal_line jl2
             WHERE jl2.entry_id = je.entry_id
                AND jl2.asset != 'USDT'
                AND jl2.account_id LIKE 'ASSET:%'
            ) AS qty,
            (SELECT SUM(CASE
                    WHEN jl2.side = 'CREDIT' THEN CAST(jl2.amount AS REAL)
                    ELSE -CAST(jl2.amount AS REAL)
                END)
             FROM journal_line jl2
             WHERE jl2.entry_id = je.entry_id
                AND jl2.account_id = 'INCOME:TRADING:REALIZED_PNL'
            ) AS realized_pnl,
            (SELECT SUM(CAST(jl2.usdt_value AS REAL))
             FROM journal_line jl2
             WHERE jl2.entry_id = je.entry_id
                AND jl2.account_id LIKE 'EXPENSE:FEE:%'
            ) AS fee_usdt
        FROM journal_entry je
        WHERE je.transaction_type = 'TRADE'
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("DROP VIEW IF EXISTS v_symbol_pnl").execute(pool).await?;
    sqlx::query(
        r#"
        CREATE VIEW v_symbol_pnl AS
        SELECT
            je.symbol,
            je.scope_mode,
            COUNT(DISTINCT je.entry_id) AS total_trades,
            SUM(CASE
                WHEN jl.account_id = 'INCOME:TRADING:REALIZED_PNL' AND jl.side = 'CREDIT'
                THEN CAST(jl.amount AS REAL)
                WHEN jl.account_id = 'INCOME:TRADING:REALIZED_PNL' AND jl.side = 'DEBIT'
                THEN -CAST(jl.amount AS REAL)
                ELSE 0
            END) AS total_pnl,
            SUM(CASE
                WHEN jl.account_id LIKE 'EXPENSE:FEE:%'
                THEN CAST(jl.usdt_value AS REAL)
                ELSE 0
            END) AS total_fees,
            COUNT(DISTINCT CASE
                WHEN jl.account_id = 'INCOME:TRADING:REALIZED_PNL' AND jl.side = 'CREDIT'
                THEN je.entry_id
            END) AS winning_trades,
            COUNT(DISTINCT CASE
                WHEN jl.account_id = 'INCOME:TRADING:REALIZED_PNL' AND jl.side = 'DEBIT'
                THEN je.entry_id
            END) AS losing_trades
        FROM journal_entry je
        JOIN journal_line jl ON je.entry_id = jl.entry_id
        WHERE je.transaction_type = 'TRADE' AND je.symbol IS NOT NULL
        GROUP BY je.symbol, je.scope_mode
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("DROP VIEW IF EXISTS v_funding_history").execute(pool).await?;
    sqlx::query(
        r#"
        CREATE VIEW v_funding_history AS
        SELECT
            je.ts,
            je.entry_id,
            je.scope_mode,
            je.symbol,
            je.transaction_type,
            CASE
                WHEN je.transaction_type = 'FEE_FUNDING' THEN
                    (SELECT CAST(jl2.amount AS REAL)
                     FROM journal_line jl2
                     WHERE jl2.entry_id = je.entry_id
                        AND jl2.account_id LIKE 'EXPENSE:FEE:FUNDING%')
                ELSE 0
            END AS funding_paid,
            CASE
                WHEN je.transaction_type = 'FUNDING_RECEIVED' THEN
                    (SELECT CAST(jl2.amount AS REAL)
                     FROM journal_line jl2
                     WHERE jl2.entry_id = je.entry_id
                        AND jl2.account_id = 'INCOME:FUNDING:RECEIVED')
                ELSE 0
            END AS funding_received
        FROM journal_entry je
        WHERE je.transaction_type IN ('FEE_FUNDING', 'FUNDING_RECEIVED')
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn seed_accounts(pool: &SqlitePool) -> StoreResult<()> {
    for (account_id, account_type, venue, asset, name) in INITIAL_ACCOUNTS {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO account (account_id, account_type, venue, asset, name)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(account_id)
        .bind(account_type)
        .bind(venue)
        .bind(asset)
        .bind(name)
        .execute(pool)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn test_schema_init_is_idempotent() {
        let db = Database::connect_in_memory().await.unwrap();
        init_ledger_schema(db.pool()).await.unwrap();
        init_ledger_schema(db.pool()).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM account")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count as usize, INITIAL_ACCOUNTS.len());
    }

    #[tokio::test]
    async fn test_views_queryable() {
        let db = Database::connect_in_memory().await.unwrap();
        init_ledger_schema(db.pool()).await.unwrap();

        for view in [
            "v_daily_pnl",
            "v_fee_summary",
            "v_account_ledger",
            "v_portfolio",
            "v_recent_trades",
            "v_symbol_pnl",
            "v_funding_history",
        ] {
            sqlx::query(&format!("SELECT * FROM {view} LIMIT 1"))
                .fetch_optional(db.pool())
                .await
                .unwrap();
        }
    }
}
