//! Projection tables
//!
//! Read-side views derived from the event log: one row per balance asset,
//! per position symbol, and per *open* order. Every upsert carries the seq
//! of the event that produced it and is guarded so a stale seq can never
//! overwrite newer state (`last_event_seq` is non-decreasing).

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{FromRow, SqlitePool};

use super::{StoreError, StoreResult};
use crate::types::Scope;

fn parse_decimal(s: &str, what: &str) -> StoreResult<Decimal> {
    s.parse()
        .map_err(|e| StoreError::Decode(format!("bad {what} decimal {s}: {e}")))
}

/// Balance projection row (one per scope+asset).
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceRow {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
    pub last_event_seq: i64,
}

/// Position projection row (one per scope+symbol). `side` is `None` when
/// the position is flat.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionRow {
    pub symbol: String,
    pub side: Option<String>,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: i64,
    pub margin_type: String,
    pub last_event_seq: i64,
}

/// Open-order projection row (one per scope+exchange_order_id).
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRow {
    pub symbol: String,
    pub exchange_order_id: String,
    pub client_order_id: Option<String>,
    pub order_state: String,
    pub side: String,
    pub order_type: String,
    pub original_qty: Decimal,
    pub executed_qty: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub last_event_seq: i64,
}

#[derive(FromRow)]
struct BalanceDbRow {
    asset: String,
    free: String,
    locked: String,
    last_event_seq: i64,
}

#[derive(FromRow)]
struct PositionDbRow {
    scope_symbol: String,
    side: Option<String>,
    qty: String,
    entry_price: String,
    unrealized_pnl: String,
    leverage: i64,
    margin_type: String,
    last_event_seq: i64,
}

#[derive(FromRow)]
struct OrderDbRow {
    scope_symbol: String,
    exchange_order_id: String,
    client_order_id: Option<String>,
    order_state: String,
    side: String,
    order_type: String,
    original_qty: String,
    executed_qty: String,
    price: Option<String>,
    stop_price: Option<String>,
    last_event_seq: i64,
}

impl BalanceDbRow {
    fn into_row(self) -> StoreResult<BalanceRow> {
        Ok(BalanceRow {
            free: parse_decimal(&self.free, "free")?,
            locked: parse_decimal(&self.locked, "locked")?,
            asset: self.asset,
            last_event_seq: self.last_event_seq,
        })
    }
}

impl PositionDbRow {
    fn into_row(self) -> StoreResult<PositionRow> {
        Ok(PositionRow {
            qty: parse_decimal(&self.qty, "qty")?,
            entry_price: parse_decimal(&self.entry_price, "entry_price")?,
            unrealized_pnl: parse_decimal(&self.unrealized_pnl, "unrealized_pnl")?,
            symbol: self.scope_symbol,
            side: self.side,
            leverage: self.leverage,
            margin_type: self.margin_type,
            last_event_seq: self.last_event_seq,
        })
    }
}

impl OrderDbRow {
    fn into_row(self) -> StoreResult<OrderRow> {
        Ok(OrderRow {
            original_qty: parse_decimal(&self.original_qty, "original_qty")?,
            executed_qty: parse_decimal(&self.executed_qty, "executed_qty")?,
            price: self
                .price
                .as_deref()
                .map(|p| parse_decimal(p, "price"))
                .transpose()?,
            stop_price: self
                .stop_price
                .as_deref()
                .map(|p| parse_decimal(p, "stop_price"))
                .transpose()?,
            symbol: self.scope_symbol,
            exchange_order_id: self.exchange_order_id,
            client_order_id: self.client_order_id,
            order_state: self.order_state,
            side: self.side,
            order_type: self.order_type,
            last_event_seq: self.last_event_seq,
        })
    }
}

/// Queries and upserts over the three projection tables.
#[derive(Clone)]
pub struct ProjectionStore {
    pool: SqlitePool,
}

impl ProjectionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ------------------------------------------------------------------
    // Balance
    // ------------------------------------------------------------------

    /// Upsert a balance row. The `WHERE` clause on the conflict arm keeps
    /// the row untouched when `seq` is not newer than what is stored.
    pub async fn upsert_balance(
        &self,
        scope: &Scope,
        asset: &str,
        free: Decimal,
        locked: Decimal,
        seq: i64,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO projection_balance (
                scope_exchange, scope_venue, scope_account_id, scope_mode,
                asset, free, locked, last_event_seq, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(scope_exchange, scope_venue, scope_account_id, asset, scope_mode)
            DO UPDATE SET
                free = excluded.free,
                locked = excluded.locked,
                last_event_seq = excluded.last_event_seq,
                updated_at = excluded.updated_at
            WHERE excluded.last_event_seq > projection_balance.last_event_seq
            "#,
        )
        .bind(&scope.exchange)
        .bind(&scope.venue)
        .bind(&scope.account_id)
        .bind(&scope.mode)
        .bind(asset)
        .bind(free.to_string())
        .bind(locked.to_string())
        .bind(seq)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_balance(&self, scope: &Scope, asset: &str) -> StoreResult<Option<BalanceRow>> {
        let row: Option<BalanceDbRow> = sqlx::query_as(
            r#"
            SELECT asset, free, locked, last_event_seq
            FROM projection_balance
            WHERE scope_exchange = ?1 AND scope_venue = ?2 AND scope_account_id = ?3
              AND scope_mode = ?4 AND asset = ?5
            "#,
        )
        .bind(&scope.exchange)
        .bind(&scope.venue)
        .bind(&scope.account_id)
        .bind(&scope.mode)
        .bind(asset)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BalanceDbRow::into_row).transpose()
    }

    pub async fn get_all_balances(&self, scope: &Scope) -> StoreResult<Vec<BalanceRow>> {
        let rows: Vec<BalanceDbRow> = sqlx::query_as(
            r#"
            SELECT asset, free, locked, last_event_seq
            FROM projection_balance
            WHERE scope_exchange = ?1 AND scope_venue = ?2 AND scope_account_id = ?3
              AND scope_mode = ?4
            ORDER BY asset
            "#,
        )
        .bind(&scope.exchange)
        .bind(&scope.venue)
        .bind(&scope.account_id)
        .bind(&scope.mode)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BalanceDbRow::into_row).collect()
    }

    // ------------------------------------------------------------------
    // Position
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_position(
        &self,
        scope: &Scope,
        symbol: &str,
        side: Option<&str>,
        qty: Decimal,
        entry_price: Decimal,
        unrealized_pnl: Decimal,
        leverage: i64,
        margin_type: &str,
        seq: i64,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO projection_position (
                scope_exchange, scope_venue, scope_account_id, scope_symbol, scope_mode,
                side, qty, entry_price, unrealized_pnl, leverage, margin_type,
                last_event_seq, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(scope_exchange, scope_venue, scope_account_id, scope_symbol, scope_mode)
            DO UPDATE SET
                side = excluded.side,
                qty = excluded.qty,
                entry_price = excluded.entry_price,
                unrealized_pnl = excluded.unrealized_pnl,
                leverage = excluded.leverage,
                margin_type = excluded.margin_type,
                last_event_seq = excluded.last_event_seq,
                updated_at = excluded.updated_at
            WHERE excluded.last_event_seq > projection_position.last_event_seq
            "#,
        )
        .bind(&scope.exchange)
        .bind(&scope.venue)
        .bind(&scope.account_id)
        .bind(symbol)
        .bind(&scope.mode)
        .bind(side)
        .bind(qty.to_string())
        .bind(entry_price.to_string())
        .bind(unrealized_pnl.to_string())
        .bind(leverage)
        .bind(margin_type)
        .bind(seq)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_position(
        &self,
        scope: &Scope,
        symbol: &str,
    ) -> StoreResult<Option<PositionRow>> {
        let row: Option<PositionDbRow> = sqlx::query_as(
            r#"
            SELECT scope_symbol, side, qty, entry_price, unrealized_pnl,
                   leverage, margin_type, last_event_seq
            FROM projection_position
            WHERE scope_exchange = ?1 AND scope_venue = ?2 AND scope_account_id = ?3
              AND scope_mode = ?4 AND scope_symbol = ?5
            "#,
        )
        .bind(&scope.exchange)
        .bind(&scope.venue)
        .bind(&scope.account_id)
        .bind(&scope.mode)
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PositionDbRow::into_row).transpose()
    }

    /// Positions with a non-zero quantity.
    pub async fn get_open_positions(&self, scope: &Scope) -> StoreResult<Vec<PositionRow>> {
        let rows: Vec<PositionDbRow> = sqlx::query_as(
            r#"
            SELECT scope_symbol, side, qty, entry_price, unrealized_pnl,
                   leverage, margin_type, last_event_seq
            FROM projection_position
            WHERE scope_exchange = ?1 AND scope_venue = ?2 AND scope_account_id = ?3
              AND scope_mode = ?4 AND CAST(qty AS REAL) > 0
            ORDER BY scope_symbol
            "#,
        )
        .bind(&scope.exchange)
        .bind(&scope.venue)
        .bind(&scope.account_id)
        .bind(&scope.mode)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PositionDbRow::into_row).collect()
    }

    // ------------------------------------------------------------------
    // Order
    // ------------------------------------------------------------------

    pub async fn upsert_order(&self, scope: &Scope, row: &OrderRow) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO projection_order (
                scope_exchange, scope_venue, scope_account_id, scope_symbol, scope_mode,
                exchange_order_id, client_order_id, order_state, side, order_type,
                original_qty, executed_qty, price, stop_price,
                last_event_seq, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)
            ON CONFLICT(scope_exchange, scope_venue, scope_account_id, exchange_order_id, scope_mode)
            DO UPDATE SET
                order_state = excluded.order_state,
                executed_qty = excluded.executed_qty,
                last_event_seq = excluded.last_event_seq,
                updated_at = excluded.updated_at
            WHERE excluded.last_event_seq > projection_order.last_event_seq
            "#,
        )
        .bind(&scope.exchange)
        .bind(&scope.venue)
        .bind(&scope.account_id)
        .bind(&row.symbol)
        .bind(&scope.mode)
        .bind(&row.exchange_order_id)
        .bind(&row.client_order_id)
        .bind(&row.order_state)
        .bind(&row.side)
        .bind(&row.order_type)
        .bind(row.original_qty.to_string())
        .bind(row.executed_qty.to_string())
        .bind(row.price.map(|p| p.to_string()))
        .bind(row.stop_price.map(|p| p.to_string()))
        .bind(row.last_event_seq)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Update state and executed quantity of an existing open order.
    pub async fn update_order_state(
        &self,
        scope: &Scope,
        exchange_order_id: &str,
        order_state: &str,
        executed_qty: Decimal,
        seq: i64,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE projection_order
            SET order_state = ?1, executed_qty = ?2, last_event_seq = ?3, updated_at = ?4
            WHERE scope_exchange = ?5 AND scope_venue = ?6 AND scope_account_id = ?7
              AND exchange_order_id = ?8 AND scope_mode = ?9
              AND last_event_seq < ?3
            "#,
        )
        .bind(order_state)
        .bind(executed_qty.to_string())
        .bind(seq)
        .bind(Utc::now().to_rfc3339())
        .bind(&scope.exchange)
        .bind(&scope.venue)
        .bind(&scope.account_id)
        .bind(exchange_order_id)
        .bind(&scope.mode)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove an order from the open-order projection (terminal state).
    pub async fn delete_order(&self, scope: &Scope, exchange_order_id: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            DELETE FROM projection_order
            WHERE scope_exchange = ?1 AND scope_venue = ?2 AND scope_account_id = ?3
              AND exchange_order_id = ?4 AND scope_mode = ?5
            "#,
        )
        .bind(&scope.exchange)
        .bind(&scope.venue)
        .bind(&scope.account_id)
        .bind(exchange_order_id)
        .bind(&scope.mode)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_open_orders(
        &self,
        scope: &Scope,
        symbol: Option<&str>,
    ) -> StoreResult<Vec<OrderRow>> {
        let base = r#"
            SELECT scope_symbol, exchange_order_id, client_order_id, order_state,
                   side, order_type, original_qty, executed_qty, price, stop_price,
                   last_event_seq
            FROM projection_order
            WHERE scope_exchange = ?1 AND scope_venue = ?2 AND scope_account_id = ?3
              AND scope_mode = ?4
        "#;

        let rows: Vec<OrderDbRow> = match symbol {
            Some(sym) => {
                sqlx::query_as(&format!("{base} AND scope_symbol = ?5 ORDER BY created_at"))
                    .bind(&scope.exchange)
                    .bind(&scope.venue)
                    .bind(&scope.account_id)
                    .bind(&scope.mode)
                    .bind(sym)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_as(&format!("{base} ORDER BY created_at"))
                    .bind(&scope.exchange)
                    .bind(&scope.venue)
                    .bind(&scope.account_id)
                    .bind(&scope.mode)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(OrderDbRow::into_row).collect()
    }

    // ------------------------------------------------------------------
    // Rebuild support
    // ------------------------------------------------------------------

    /// Truncate all projection tables (rebuild path).
    pub async fn clear_all(&self) -> StoreResult<()> {
        for table in ["projection_balance", "projection_position", "projection_order"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&self.pool)
                .await?;
        }
        tracing::info!("projection tables cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::types::TradingMode;
    use rust_decimal_macros::dec;

    async fn store() -> ProjectionStore {
        let db = Database::connect_in_memory().await.unwrap();
        db.init_core_schema().await.unwrap();
        ProjectionStore::new(db.pool().clone())
    }

    fn scope() -> Scope {
        Scope::binance_futures("main", TradingMode::Testnet)
    }

    #[tokio::test]
    async fn test_balance_upsert_and_get() {
        let store = store().await;
        let scope = scope();

        store
            .upsert_balance(&scope, "USDT", dec!(100.5), dec!(2), 1)
            .await
            .unwrap();

        let row = store.get_balance(&scope, "USDT").await.unwrap().unwrap();
        assert_eq!(row.free, dec!(100.5));
        assert_eq!(row.locked, dec!(2));
        assert_eq!(row.last_event_seq, 1);
    }

    #[tokio::test]
    async fn test_stale_seq_does_not_overwrite() {
        let store = store().await;
        let scope = scope();

        store
            .upsert_balance(&scope, "USDT", dec!(200), dec!(0), 5)
            .await
            .unwrap();
        // late-arriving older snapshot
        store
            .upsert_balance(&scope, "USDT", dec!(50), dec!(0), 3)
            .await
            .unwrap();

        let row = store.get_balance(&scope, "USDT").await.unwrap().unwrap();
        assert_eq!(row.free, dec!(200));
        assert_eq!(row.last_event_seq, 5);
    }

    #[tokio::test]
    async fn test_modes_do_not_mix() {
        let store = store().await;
        let testnet = scope();
        let production = Scope::binance_futures("main", TradingMode::Production);

        store
            .upsert_balance(&testnet, "USDT", dec!(10), dec!(0), 1)
            .await
            .unwrap();

        assert!(store.get_balance(&production, "USDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_position_flat_side_none() {
        let store = store().await;
        let scope = scope();

        store
            .upsert_position(&scope, "XRPUSDT", None, dec!(0), dec!(0), dec!(0), 20, "CROSS", 4)
            .await
            .unwrap();

        let row = store.get_position(&scope, "XRPUSDT").await.unwrap().unwrap();
        assert_eq!(row.side, None);
        assert!(store.get_open_positions(&scope).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_order_lifecycle() {
        let store = store().await;
        let scope = scope();

        let row = OrderRow {
            symbol: "XRPUSDT".into(),
            exchange_order_id: "8886774".into(),
            client_order_id: Some("pp-1".into()),
            order_state: "NEW".into(),
            side: "BUY".into(),
            order_type: "LIMIT".into(),
            original_qty: dec!(100),
            executed_qty: dec!(0),
            price: Some(dec!(0.5)),
            stop_price: None,
            last_event_seq: 1,
        };
        store.upsert_order(&scope, &row).await.unwrap();

        store
            .update_order_state(&scope, "8886774", "PARTIALLY_FILLED", dec!(40), 2)
            .await
            .unwrap();
        let open = store.get_open_orders(&scope, Some("XRPUSDT")).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].order_state, "PARTIALLY_FILLED");
        assert_eq!(open[0].executed_qty, dec!(40));

        store.delete_order(&scope, "8886774").await.unwrap();
        assert!(store.get_open_orders(&scope, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_all() {
        let store = store().await;
        let scope = scope();

        store
            .upsert_balance(&scope, "USDT", dec!(1), dec!(0), 1)
            .await
            .unwrap();
        store.clear_all().await.unwrap();
        assert!(store.get_balance(&scope, "USDT").await.unwrap().is_none());
    }
}
