//! User-data stream message handling
//!
//! Decodes the exchange's push messages into domain events and appends
//! them to the log:
//! - `ORDER_TRADE_UPDATE` -> `OrderUpdated` (+ `TradeExecuted` on a fill)
//! - `ACCOUNT_UPDATE`     -> `BalanceChanged` + `PositionChanged`
//! - `MARGIN_CALL`        -> alert log only (not a ledger-affecting fact)
//!
//! Trades are keyed by the exchange trade id, so a fill later re-observed
//! by the REST reconciler deduplicates to a single event.

use serde_json::{json, Value};

use crate::events::{dedup, Event, EventType};
use crate::state_machine::WebSocketState;
use crate::store::{EventStore, StoreResult};
use crate::types::{EntityKind, EventSource, Scope};

pub struct WsMessageHandler {
    event_store: EventStore,
    scope: Scope,
    /// When set, messages for other symbols are ignored.
    target_symbol: Option<String>,
}

impl WsMessageHandler {
    pub fn new(event_store: EventStore, scope: Scope, target_symbol: Option<String>) -> Self {
        Self {
            event_store,
            scope,
            target_symbol,
        }
    }

    /// Handle one decoded stream message. Returns the number of events
    /// appended (duplicates excluded).
    pub async fn handle(&self, message: &Value) -> StoreResult<usize> {
        match message.get("e").and_then(Value::as_str) {
            Some("ORDER_TRADE_UPDATE") => self.handle_order_trade_update(message).await,
            Some("ACCOUNT_UPDATE") => self.handle_account_update(message).await,
            Some("MARGIN_CALL") => {
                tracing::warn!(payload = %message, "margin call received");
                Ok(0)
            }
            Some("listenKeyExpired") => {
                tracing::warn!("listen key expired notification");
                Ok(0)
            }
            other => {
                tracing::debug!(event = ?other, "unhandled stream message");
                Ok(0)
            }
        }
    }

    fn symbol_matches(&self, symbol: &str) -> bool {
        match &self.target_symbol {
            Some(target) => target == symbol,
            None => true,
        }
    }

    async fn handle_order_trade_update(&self, message: &Value) -> StoreResult<usize> {
        let Some(order) = message.get("o") else {
            tracing::warn!("ORDER_TRADE_UPDATE without order payload");
            return Ok(0);
        };

        let symbol = order.get("s").and_then(Value::as_str).unwrap_or_default();
        if symbol.is_empty() || !self.symbol_matches(symbol) {
            return Ok(0);
        }

        let event_time = message.get("E").and_then(Value::as_i64).unwrap_or(0);
        let order_id = match order.get("i") {
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(s)) => s.clone(),
            _ => return Ok(0),
        };
        let status = order.get("X").and_then(Value::as_str).unwrap_or("NEW");
        let exec_type = order.get("x").and_then(Value::as_str).unwrap_or_default();
        let scope = self.scope.with_symbol(symbol);
        let mut appended = 0;

        // order state: each push is a definitive transition; the exchange
        // event time makes redelivery of the same transition collapse
        let order_event = Event::create(
            EventType::OrderUpdated,
            EventSource::Websocket,
            EntityKind::Order,
            &order_id,
            scope.clone(),
            dedup::order_snapshot_key(
                &self.scope.exchange,
                &self.scope.venue,
                symbol,
                &order_id,
                status,
                event_time,
            ),
            json!({
                "exchange_order_id": order_id,
                "client_order_id": order.get("c").and_then(Value::as_str),
                "symbol": symbol,
                "side": order.get("S").and_then(Value::as_str),
                "order_type": order.get("o").and_then(Value::as_str),
                "order_status": status,
                "execution_type": exec_type,
                "original_qty": order.get("q").and_then(Value::as_str),
                "executed_qty": order.get("z").and_then(Value::as_str),
                "price": order.get("p").and_then(Value::as_str),
                "avg_price": order.get("ap").and_then(Value::as_str),
                "stop_price": order.get("sp").and_then(Value::as_str),
            }),
        );
        if self.event_store.append(&order_event).await? {
            appended += 1;
        }

        // a TRADE execution carries the fill
        let trade_id = order.get("t").and_then(Value::as_i64).unwrap_or(0);
        if exec_type == "TRADE" && trade_id > 0 {
            let trade_id = trade_id.to_string();
            let trade_event = Event::create(
                EventType::TradeExecuted,
                EventSource::Websocket,
                EntityKind::Trade,
                &trade_id,
                scope,
                dedup::trade_key(&self.scope.exchange, &self.scope.venue, symbol, &trade_id),
                json!({
                    "exchange_trade_id": trade_id,
                    "exchange_order_id": order.get("i").map(|v| match v {
                        Value::Number(n) => n.to_string(),
                        Value::String(s) => s.clone(),
                        _ => String::new(),
                    }),
                    "symbol": symbol,
                    "side": order.get("S").and_then(Value::as_str),
                    "qty": order.get("l").and_then(Value::as_str),
                    "price": order.get("L").and_then(Value::as_str),
                    "commission": order.get("n").and_then(Value::as_str),
                    "commission_asset": order.get("N").and_then(Value::as_str),
                    "realized_pnl": order.get("rp").and_then(Value::as_str),
                    "trade_time": order.get("T").and_then(Value::as_i64),
                    "is_maker": order.get("m").and_then(Value::as_bool),
                }),
            )
            .with_causation(order_event.event_id.clone());

            if self.event_store.append(&trade_event).await? {
                appended += 1;
            }
        }

        Ok(appended)
    }

    async fn handle_account_update(&self, message: &Value) -> StoreResult<usize> {
        let Some(account) = message.get("a") else {
            tracing::warn!("ACCOUNT_UPDATE without account payload");
            return Ok(0);
        };

        let event_time = message.get("E").and_then(Value::as_i64).unwrap_or(0);
        let mut appended = 0;

        if let Some(balances) = account.get("B").and_then(Value::as_array) {
            for balance in balances {
                let Some(asset) = balance.get("a").and_then(Value::as_str) else {
                    continue;
                };
                let event = Event::create(
                    EventType::BalanceChanged,
                    EventSource::Websocket,
                    EntityKind::Balance,
                    asset,
                    self.scope.clone(),
                    dedup::balance_key(
                        &self.scope.exchange,
                        &self.scope.venue,
                        &self.scope.account_id,
                        asset,
                        event_time,
                    ),
                    json!({
                        "asset": asset,
                        "wallet_balance": balance.get("wb").and_then(Value::as_str),
                        "cross_wallet_balance": balance.get("cw").and_then(Value::as_str),
                        "balance_change": balance.get("bc").and_then(Value::as_str),
                        "update_time": event_time,
                    }),
                );
                if self.event_store.append(&event).await? {
                    appended += 1;
                }
            }
        }

        if let Some(positions) = account.get("P").and_then(Value::as_array) {
            for position in positions {
                let Some(symbol) = position.get("s").and_then(Value::as_str) else {
                    continue;
                };
                if !self.symbol_matches(symbol) {
                    continue;
                }
                let event = Event::create(
                    EventType::PositionChanged,
                    EventSource::Websocket,
                    EntityKind::Position,
                    symbol,
                    self.scope.with_symbol(symbol),
                    dedup::position_key(&self.scope.exchange, &self.scope.venue, symbol, event_time),
                    json!({
                        "symbol": symbol,
                        "position_amount": position.get("pa").and_then(Value::as_str),
                        "entry_price": position.get("ep").and_then(Value::as_str),
                        "unrealized_pnl": position.get("up").and_then(Value::as_str),
                        "margin_type": position.get("mt").and_then(Value::as_str).map(str::to_uppercase),
                        "position_side": position.get("ps").and_then(Value::as_str),
                        "update_time": event_time,
                    }),
                );
                if self.event_store.append(&event).await? {
                    appended += 1;
                }
            }
        }

        Ok(appended)
    }

    /// Record a connection state transition as an event.
    pub async fn on_state_change(&self, state: WebSocketState) -> StoreResult<()> {
        let event_type = match state {
            WebSocketState::Connected => EventType::WebSocketConnected,
            WebSocketState::Disconnected => EventType::WebSocketDisconnected,
            WebSocketState::Reconnecting => EventType::WebSocketReconnected,
            WebSocketState::Connecting => return Ok(()),
        };

        let now_ms = chrono::Utc::now().timestamp_millis();
        let event = Event::create(
            event_type,
            EventSource::Websocket,
            EntityKind::Engine,
            "websocket",
            self.scope.clone(),
            format!(
                "{}:{}:{}:ws:{}:{}",
                self.scope.exchange,
                self.scope.venue,
                self.scope.account_id,
                state.as_str(),
                now_ms
            ),
            json!({ "state": state.as_str() }),
        );
        self.event_store.append(&event).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::types::TradingMode;

    async fn handler() -> (WsMessageHandler, EventStore) {
        let db = Database::connect_in_memory().await.unwrap();
        db.init_core_schema().await.unwrap();
        let store = EventStore::new(db.pool().clone());
        let scope = Scope::binance_futures("main", TradingMode::Testnet);
        (
            WsMessageHandler::new(store.clone(), scope, Some("XRPUSDT".into())),
            store,
        )
    }

    fn fill_message(trade_id: i64, event_time: i64) -> Value {
        json!({
            "e": "ORDER_TRADE_UPDATE",
            "E": event_time,
            "o": {
                "s": "XRPUSDT",
                "c": "pp-1",
                "S": "BUY",
                "o": "MARKET",
                "x": "TRADE",
                "X": "FILLED",
                "i": 8886774,
                "q": "100",
                "z": "100",
                "L": "0.5123",
                "l": "100",
                "n": "0.02049",
                "N": "USDT",
                "T": event_time,
                "t": trade_id,
                "rp": "0",
                "m": false,
                "p": "0",
                "ap": "0.5123",
                "sp": "0",
            }
        })
    }

    #[tokio::test]
    async fn test_fill_emits_order_and_trade() {
        let (handler, store) = handler().await;

        let appended = handler.handle(&fill_message(42, 1700000000000)).await.unwrap();
        assert_eq!(appended, 2);

        let trades = store.get_by_type(EventType::TradeExecuted, 10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(
            trades[0].dedup_key,
            "BINANCE:FUTURES:XRPUSDT:trade:42"
        );
        // trade is caused by the order update
        assert!(trades[0].causation_id.is_some());
    }

    #[tokio::test]
    async fn test_redelivery_dedups() {
        let (handler, store) = handler().await;

        handler.handle(&fill_message(42, 1700000000000)).await.unwrap();
        let appended = handler.handle(&fill_message(42, 1700000000000)).await.unwrap();
        assert_eq!(appended, 0);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_other_symbol_ignored() {
        let (handler, store) = handler().await;

        let mut message = fill_message(42, 1700000000000);
        message["o"]["s"] = json!("BTCUSDT");
        let appended = handler.handle(&message).await.unwrap();
        assert_eq!(appended, 0);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_account_update_emits_balance_and_position() {
        let (handler, store) = handler().await;

        let message = json!({
            "e": "ACCOUNT_UPDATE",
            "E": 1700000000123i64,
            "a": {
                "B": [
                    {"a": "USDT", "wb": "673.51", "cw": "673.51", "bc": "0"},
                ],
                "P": [
                    {"s": "XRPUSDT", "pa": "-100", "ep": "0.51", "up": "-0.2", "mt": "cross", "ps": "BOTH"},
                ],
            }
        });

        let appended = handler.handle(&message).await.unwrap();
        assert_eq!(appended, 2);

        let balances = store.get_by_type(EventType::BalanceChanged, 10).await.unwrap();
        assert_eq!(
            balances[0].dedup_key,
            "BINANCE:FUTURES:main:USDT:balance:1700000000123"
        );
    }

    #[tokio::test]
    async fn test_margin_call_is_not_stored() {
        let (handler, store) = handler().await;
        let appended = handler
            .handle(&json!({"e": "MARGIN_CALL", "p": []}))
            .await
            .unwrap();
        assert_eq!(appended, 0);
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
