//! Ledger persistence
//!
//! `save_entry` is the only write path: it verifies the balance invariant,
//! then inserts the entry header, its lines in declared order, and the
//! per-account balance updates inside one transaction. A failure anywhere
//! rolls the whole entry back.
//!
//! Balances are uniform DEBIT-positive; presentation layers re-interpret
//! per account type (income/equity accounts read credit-normal).

use rust_decimal::Decimal;
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;

use super::entry_builder::{JournalEntry, JournalLine, BALANCE_TOLERANCE};
use super::types::{accounts, JournalSide};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// The defining invariant of double entry. Never auto-repaired: the
    /// builder that produced the entry is presumed buggy.
    #[error("unbalanced entry {entry_id}: debit {debit} != credit {credit}")]
    Unbalanced {
        entry_id: String,
        debit: Decimal,
        credit: Decimal,
    },

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error("row decode failed: {0}")]
    Decode(String),
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Sqlx(e) => LedgerError::Sqlx(e),
            StoreError::Decode(msg) => LedgerError::Decode(msg),
        }
    }
}

/// One account in the trial balance.
#[derive(Debug, Clone, FromRow)]
pub struct TrialBalanceRow {
    pub account_id: String,
    pub account_type: String,
    pub venue: String,
    pub asset: Option<String>,
    pub name: String,
    pub balance: String,
}

impl TrialBalanceRow {
    pub fn balance_decimal(&self) -> Decimal {
        self.balance.parse().unwrap_or(Decimal::ZERO)
    }
}

/// Account metadata.
#[derive(Debug, Clone, FromRow)]
pub struct AccountRecord {
    pub account_id: String,
    pub account_type: String,
    pub venue: String,
    pub asset: Option<String>,
    pub name: String,
    pub is_active: i64,
}

/// Stored journal line (as persisted, decimals still in string form).
#[derive(Debug, Clone, FromRow)]
pub struct JournalLineRecord {
    pub line_id: i64,
    pub entry_id: String,
    pub account_id: String,
    pub side: String,
    pub amount: String,
    pub asset: String,
    pub usdt_value: String,
    pub usdt_rate: String,
    pub memo: Option<String>,
    pub line_order: i64,
}

/// Stored journal entry header.
#[derive(Debug, Clone, FromRow)]
pub struct JournalEntryRecord {
    pub entry_id: String,
    pub ts: String,
    pub transaction_type: String,
    pub scope_mode: String,
    pub related_trade_id: Option<String>,
    pub related_order_id: Option<String>,
    pub symbol: Option<String>,
    pub source_event_id: Option<String>,
    pub source: String,
    pub description: Option<String>,
    pub memo: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct DailyPnlRow {
    pub trade_date: String,
    pub scope_mode: String,
    pub trade_count: i64,
    pub daily_pnl: f64,
    pub trading_fees: f64,
    pub funding_fees: f64,
    pub total_fees: f64,
    pub winning_count: i64,
    pub losing_count: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct FeeSummaryRow {
    pub fee_date: String,
    pub scope_mode: String,
    pub fee_type: String,
    pub fee_asset: String,
    pub total_amount: f64,
    pub total_usdt_value: f64,
    pub fee_count: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct SymbolPnlRow {
    pub symbol: String,
    pub scope_mode: String,
    pub total_trades: i64,
    pub total_pnl: f64,
    pub total_fees: f64,
    pub winning_trades: i64,
    pub losing_trades: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct PortfolioRow {
    pub venue: String,
    pub asset: Option<String>,
    pub account_id: String,
    pub name: String,
    pub scope_mode: Option<String>,
    pub balance: f64,
    pub last_updated: Option<String>,
}

#[derive(Clone)]
pub struct LedgerStore {
    pool: SqlitePool,
}

impl LedgerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist one balanced entry atomically. Returns the entry id.
    pub async fn save_entry(&self, entry: &JournalEntry) -> Result<String, LedgerError> {
        let debit = entry.debit_total();
        let credit = entry.credit_total();
        if (debit - credit).abs() > BALANCE_TOLERANCE {
            return Err(LedgerError::Unbalanced {
                entry_id: entry.entry_id.clone(),
                debit,
                credit,
            });
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO journal_entry (
                entry_id, ts, transaction_type, scope_mode,
                related_trade_id, related_order_id, related_position_id, symbol,
                source_event_id, source, description, memo, raw_data
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(&entry.entry_id)
        .bind(entry.ts.to_rfc3339())
        .bind(entry.transaction_type.as_str())
        .bind(&entry.scope_mode)
        .bind(&entry.related_trade_id)
        .bind(&entry.related_order_id)
        .bind(&entry.related_position_id)
        .bind(&entry.symbol)
        .bind(&entry.source_event_id)
        .bind(&entry.source)
        .bind(&entry.description)
        .bind(&entry.memo)
        .bind(entry.raw_data.as_ref().map(|raw| raw.to_string()))
        .execute(&mut *tx)
        .await?;

        for (order, line) in entry.lines.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO journal_line (
                    entry_id, account_id, side, amount, asset,
                    usdt_value, usdt_rate, memo, line_order
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )
            .bind(&entry.entry_id)
            .bind(&line.account_id)
            .bind(line.side.as_str())
            .bind(line.amount.to_string())
            .bind(&line.asset)
            .bind(line.usdt_value.to_string())
            .bind(line.usdt_rate.to_string())
            .bind(&line.memo)
            .bind(order as i64)
            .execute(&mut *tx)
            .await?;

            Self::apply_balance(&mut tx, entry, line).await?;
        }

        tx.commit().await?;
        tracing::debug!(entry_id = %entry.entry_id, "journal entry saved");
        Ok(entry.entry_id.clone())
    }

    /// DEBIT adds, CREDIT subtracts; all account types alike.
    async fn apply_balance(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        entry: &JournalEntry,
        line: &JournalLine,
    ) -> Result<(), LedgerError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT balance FROM account_balance WHERE account_id = ?1 AND scope_mode = ?2",
        )
        .bind(&line.account_id)
        .bind(&entry.scope_mode)
        .fetch_optional(&mut **tx)
        .await?;

        let current: Decimal = match &row {
            Some((balance,)) => balance
                .parse()
                .map_err(|e| LedgerError::Decode(format!("bad balance {balance}: {e}")))?,
            None => Decimal::ZERO,
        };

        let updated = match line.side {
            JournalSide::Debit => current + line.amount,
            JournalSide::Credit => current - line.amount,
        };

        sqlx::query(
            r#"
            INSERT INTO account_balance (account_id, scope_mode, balance, last_entry_id, last_entry_ts, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'))
            ON CONFLICT(account_id, scope_mode) DO UPDATE SET
                balance = excluded.balance,
                last_entry_id = excluded.last_entry_id,
                last_entry_ts = excluded.last_entry_ts,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&line.account_id)
        .bind(&entry.scope_mode)
        .bind(updated.to_string())
        .bind(&entry.entry_id)
        .bind(entry.ts.to_rfc3339())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Create the `ASSET:<venue>:<asset>` account if missing. Idempotent
    /// and safe under concurrent invocation.
    pub async fn ensure_asset_account(
        &self,
        venue: &str,
        asset: &str,
    ) -> Result<String, LedgerError> {
        let account_id = accounts::asset_account(venue, asset);
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO account (account_id, account_type, venue, asset, name)
            VALUES (?1, 'ASSET', ?2, ?3, ?4)
            "#,
        )
        .bind(&account_id)
        .bind(venue)
        .bind(asset)
        .bind(format!("{venue} {asset}"))
        .execute(&self.pool)
        .await?;
        Ok(account_id)
    }

    /// Current balance for one account in one mode (0 when never posted).
    pub async fn get_account_balance(
        &self,
        account_id: &str,
        scope_mode: &str,
    ) -> Result<Decimal, LedgerError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT balance FROM account_balance WHERE account_id = ?1 AND scope_mode = ?2",
        )
        .bind(account_id)
        .bind(scope_mode)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((balance,)) => balance
                .parse()
                .map_err(|e| LedgerError::Decode(format!("bad balance {balance}: {e}"))),
            None => Ok(Decimal::ZERO),
        }
    }

    /// All active accounts with their current balances.
    pub async fn get_trial_balance(
        &self,
        scope_mode: &str,
    ) -> Result<Vec<TrialBalanceRow>, LedgerError> {
        let rows: Vec<TrialBalanceRow> = sqlx::query_as(
            r#"
            SELECT
                a.account_id, a.account_type, a.venue, a.asset, a.name,
                COALESCE(ab.balance, '0') AS balance
            FROM account a
            LEFT JOIN account_balance ab
                ON a.account_id = ab.account_id AND ab.scope_mode = ?1
            WHERE a.is_active = 1
            ORDER BY a.account_type, a.venue, a.asset
            "#,
        )
        .bind(scope_mode)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Trial-balance closure in the common unit: the signed sum of every
    /// posted USDT value (debits positive, credits negative). Balanced
    /// entries make this zero regardless of how many assets are involved;
    /// income and equity simply carry the negative (credit-normal) side.
    pub async fn trial_balance_total(&self, scope_mode: &str) -> Result<Decimal, LedgerError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT jl.side, jl.usdt_value
            FROM journal_line jl
            JOIN journal_entry je ON je.entry_id = jl.entry_id
            WHERE je.scope_mode = ?1
            "#,
        )
        .bind(scope_mode)
        .fetch_all(&self.pool)
        .await?;

        let mut total = Decimal::ZERO;
        for (side, usdt_value) in rows {
            let value: Decimal = usdt_value
                .parse()
                .map_err(|e| LedgerError::Decode(format!("bad usdt_value {usdt_value}: {e}")))?;
            match JournalSide::from_str(&side) {
                Some(JournalSide::Debit) => total += value,
                Some(JournalSide::Credit) => total -= value,
                None => return Err(LedgerError::Decode(format!("bad side {side}"))),
            }
        }
        Ok(total)
    }

    pub async fn get_account(
        &self,
        account_id: &str,
    ) -> Result<Option<AccountRecord>, LedgerError> {
        let row: Option<AccountRecord> = sqlx::query_as(
            r#"
            SELECT account_id, account_type, venue, asset, name, is_active
            FROM account WHERE account_id = ?1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_accounts(
        &self,
        account_type: Option<&str>,
        venue: Option<&str>,
    ) -> Result<Vec<AccountRecord>, LedgerError> {
        let mut sql = String::from(
            "SELECT account_id, account_type, venue, asset, name, is_active \
             FROM account WHERE is_active = 1",
        );
        if account_type.is_some() {
            sql.push_str(" AND account_type = ?1");
        }
        if venue.is_some() {
            sql.push_str(if account_type.is_some() {
                " AND venue = ?2"
            } else {
                " AND venue = ?1"
            });
        }
        sql.push_str(" ORDER BY account_type, venue, asset");

        let mut query = sqlx::query_as::<_, AccountRecord>(&sql);
        if let Some(account_type) = account_type {
            query = query.bind(account_type.to_owned());
        }
        if let Some(venue) = venue {
            query = query.bind(venue.to_owned());
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    /// Header plus lines (in declared order) for one entry.
    pub async fn get_entry(
        &self,
        entry_id: &str,
    ) -> Result<Option<(JournalEntryRecord, Vec<JournalLineRecord>)>, LedgerError> {
        let header: Option<JournalEntryRecord> = sqlx::query_as(
            r#"
            SELECT entry_id, ts, transaction_type, scope_mode,
                   related_trade_id, related_order_id, symbol,
                   source_event_id, source, description, memo
            FROM journal_entry WHERE entry_id = ?1
            "#,
        )
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(header) = header else {
            return Ok(None);
        };

        let lines: Vec<JournalLineRecord> = sqlx::query_as(
            r#"
            SELECT line_id, entry_id, account_id, side, amount, asset,
                   usdt_value, usdt_rate, memo, line_order
            FROM journal_line WHERE entry_id = ?1 ORDER BY line_order
            "#,
        )
        .bind(entry_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some((header, lines)))
    }

    pub async fn get_entries_by_account(
        &self,
        account_id: &str,
        scope_mode: &str,
        limit: i64,
    ) -> Result<Vec<JournalLineRecord>, LedgerError> {
        let rows: Vec<JournalLineRecord> = sqlx::query_as(
            r#"
            SELECT jl.line_id, jl.entry_id, jl.account_id, jl.side, jl.amount,
                   jl.asset, jl.usdt_value, jl.usdt_rate, jl.memo, jl.line_order
            FROM journal_line jl
            JOIN journal_entry je ON je.entry_id = jl.entry_id
            WHERE jl.account_id = ?1 AND je.scope_mode = ?2
            ORDER BY je.ts DESC, jl.line_order
            LIMIT ?3
            "#,
        )
        .bind(account_id)
        .bind(scope_mode)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_entries_by_type(
        &self,
        transaction_type: &str,
        scope_mode: &str,
        limit: i64,
    ) -> Result<Vec<JournalEntryRecord>, LedgerError> {
        let rows: Vec<JournalEntryRecord> = sqlx::query_as(
            r#"
            SELECT entry_id, ts, transaction_type, scope_mode,
                   related_trade_id, related_order_id, symbol,
                   source_event_id, source, description, memo
            FROM journal_entry
            WHERE transaction_type = ?1 AND scope_mode = ?2
            ORDER BY ts DESC
            LIMIT ?3
            "#,
        )
        .bind(transaction_type)
        .bind(scope_mode)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Suspense postings awaiting classification.
    pub async fn get_suspense_entries(
        &self,
        scope_mode: &str,
        limit: i64,
    ) -> Result<Vec<JournalLineRecord>, LedgerError> {
        self.get_entries_by_account(accounts::SUSPENSE, scope_mode, limit)
            .await
    }

    // ------------------------------------------------------------------
    // Reporting (view-backed)
    // ------------------------------------------------------------------

    pub async fn get_daily_pnl(
        &self,
        scope_mode: &str,
        limit: i64,
    ) -> Result<Vec<DailyPnlRow>, LedgerError> {
        let rows: Vec<DailyPnlRow> = sqlx::query_as(
            r#"
            SELECT trade_date, scope_mode, trade_count, daily_pnl,
                   trading_fees, funding_fees, total_fees, winning_count, losing_count
            FROM v_daily_pnl
            WHERE scope_mode = ?1
            ORDER BY trade_date DESC
            LIMIT ?2
            "#,
        )
        .bind(scope_mode)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_fee_summary(
        &self,
        scope_mode: &str,
    ) -> Result<Vec<FeeSummaryRow>, LedgerError> {
        let rows: Vec<FeeSummaryRow> = sqlx::query_as(
            r#"
            SELECT fee_date, scope_mode, fee_type, fee_asset,
                   total_amount, total_usdt_value, fee_count
            FROM v_fee_summary
            WHERE scope_mode = ?1
            ORDER BY fee_date DESC
            "#,
        )
        .bind(scope_mode)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_symbol_pnl(
        &self,
        scope_mode: &str,
    ) -> Result<Vec<SymbolPnlRow>, LedgerError> {
        let rows: Vec<SymbolPnlRow> = sqlx::query_as(
            r#"
            SELECT symbol, scope_mode, total_trades, total_pnl, total_fees,
                   winning_trades, losing_trades
            FROM v_symbol_pnl
            WHERE scope_mode = ?1
            ORDER BY total_pnl DESC
            "#,
        )
        .bind(scope_mode)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_recent_trades(
        &self,
        scope_mode: &str,
        limit: i64,
    ) -> Result<Vec<JournalEntryRecord>, LedgerError> {
        let rows: Vec<JournalEntryRecord> = sqlx::query_as(
            r#"
            SELECT je.entry_id, je.ts, je.transaction_type, je.scope_mode,
                   je.related_trade_id, je.related_order_id, je.symbol,
                   je.source_event_id, je.source, je.description, je.memo
            FROM journal_entry je
            WHERE je.transaction_type = 'TRADE' AND je.scope_mode = ?1
            ORDER BY je.ts DESC
            LIMIT ?2
            "#,
        )
        .bind(scope_mode)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_portfolio(
        &self,
        scope_mode: &str,
    ) -> Result<Vec<PortfolioRow>, LedgerError> {
        let rows: Vec<PortfolioRow> = sqlx::query_as(
            r#"
            SELECT venue, asset, account_id, name, scope_mode, balance, last_updated
            FROM v_portfolio
            WHERE scope_mode = ?1 OR scope_mode IS NULL
            ORDER BY venue, asset
            "#,
        )
        .bind(scope_mode)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::ledger::schema::init_ledger_schema;
    use crate::ledger::types::TransactionType;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    async fn store() -> LedgerStore {
        let db = Database::connect_in_memory().await.unwrap();
        init_ledger_schema(db.pool()).await.unwrap();
        LedgerStore::new(db.pool().clone())
    }

    fn transfer_entry(mode: &str) -> JournalEntry {
        let mut entry = JournalEntry::new(TransactionType::Deposit, Utc::now(), mode);
        entry.description = Some("Deposit 1000 USDT".into());
        entry.lines.push(JournalLine::debit(
            "ASSET:BINANCE_FUTURES:USDT",
            dec!(1000),
            "USDT",
            dec!(1000),
            Decimal::ONE,
        ));
        entry.lines.push(JournalLine::credit(
            "ASSET:EXTERNAL:USDT",
            dec!(1000),
            "USDT",
            dec!(1000),
            Decimal::ONE,
        ));
        entry
    }

    #[tokio::test]
    async fn test_save_entry_updates_balances() {
        let store = store().await;
        store.save_entry(&transfer_entry("testnet")).await.unwrap();

        assert_eq!(
            store
                .get_account_balance("ASSET:BINANCE_FUTURES:USDT", "testnet")
                .await
                .unwrap(),
            dec!(1000)
        );
        assert_eq!(
            store
                .get_account_balance("ASSET:EXTERNAL:USDT", "testnet")
                .await
                .unwrap(),
            dec!(-1000)
        );
        // other mode untouched
        assert_eq!(
            store
                .get_account_balance("ASSET:BINANCE_FUTURES:USDT", "production")
                .await
                .unwrap(),
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn test_unbalanced_entry_rejected() {
        let store = store().await;
        let mut entry = transfer_entry("testnet");
        entry.lines[1].usdt_value = dec!(900);

        let err = store.save_entry(&entry).await.unwrap_err();
        assert!(matches!(err, LedgerError::Unbalanced { .. }));

        // nothing persisted
        assert!(store.get_entry(&entry.entry_id).await.unwrap().is_none());
        assert_eq!(
            store
                .get_account_balance("ASSET:BINANCE_FUTURES:USDT", "testnet")
                .await
                .unwrap(),
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn test_tolerance_accepts_rounding_noise() {
        let store = store().await;
        let mut entry = transfer_entry("testnet");
        entry.lines[1].usdt_value = dec!(999.995);
        store.save_entry(&entry).await.unwrap();
    }

    #[tokio::test]
    async fn test_entry_roundtrip_preserves_line_order() {
        let store = store().await;
        let entry = transfer_entry("testnet");
        store.save_entry(&entry).await.unwrap();

        let (header, lines) = store.get_entry(&entry.entry_id).await.unwrap().unwrap();
        assert_eq!(header.transaction_type, "DEPOSIT");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line_order, 0);
        assert_eq!(lines[0].side, "DEBIT");
        assert_eq!(lines[1].line_order, 1);
        assert_eq!(lines[1].side, "CREDIT");
    }

    #[tokio::test]
    async fn test_trial_balance_closure() {
        let store = store().await;
        store.save_entry(&transfer_entry("testnet")).await.unwrap();
        store.save_entry(&transfer_entry("testnet")).await.unwrap();

        assert_eq!(
            store.trial_balance_total("testnet").await.unwrap(),
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn test_ensure_asset_account_idempotent() {
        let store = store().await;
        let first = store.ensure_asset_account("BINANCE_FUTURES", "XRP").await.unwrap();
        let second = store.ensure_asset_account("BINANCE_FUTURES", "XRP").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, "ASSET:BINANCE_FUTURES:XRP");

        let account = store.get_account(&first).await.unwrap().unwrap();
        assert_eq!(account.account_type, "ASSET");
        assert_eq!(account.asset.as_deref(), Some("XRP"));
    }

    #[tokio::test]
    async fn test_entries_by_type_and_account() {
        let store = store().await;
        store.save_entry(&transfer_entry("testnet")).await.unwrap();

        let deposits = store
            .get_entries_by_type("DEPOSIT", "testnet", 10)
            .await
            .unwrap();
        assert_eq!(deposits.len(), 1);

        let lines = store
            .get_entries_by_account("ASSET:EXTERNAL:USDT", "testnet", 10)
            .await
            .unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].side, "CREDIT");
    }
}
