//! In-memory exchange
//!
//! Programmable [`ExchangeApi`] implementation used by the test suite and
//! by sandbox runs without exchange credentials. State is what the tests
//! inject; behaviour mirrors the live client's contracts (start_time
//! filtering, zero-row suppression, kline close prices).

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::error::ExchangeError;
use super::models::{
    Balance, IncomeRecord, Kline, Order, OrderRequest, Position, SpotBalance, Trade,
};
use super::ExchangeApi;

#[derive(Default)]
struct MockState {
    trades: Vec<Trade>,
    balances: Vec<Balance>,
    spot_balances: Vec<SpotBalance>,
    positions: HashMap<String, Position>,
    open_orders: Vec<Order>,
    income: Vec<IncomeRecord>,
    /// symbol -> last close price served by the klines endpoint
    prices: HashMap<String, Decimal>,
    next_order_id: u64,
    listen_key_counter: u64,
    server_time_ms: i64,
    placed_orders: Vec<OrderRequest>,
    cancelled_orders: Vec<String>,
}

pub struct MockExchangeClient {
    state: Mutex<MockState>,
}

impl Default for MockExchangeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExchangeClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_order_id: 1000,
                server_time_ms: 1_700_000_000_000,
                ..MockState::default()
            }),
        }
    }

    pub async fn push_trade(&self, trade: Trade) {
        self.state.lock().await.trades.push(trade);
    }

    pub async fn set_balance(&self, balance: Balance) {
        let mut state = self.state.lock().await;
        state.balances.retain(|b| b.asset != balance.asset);
        state.balances.push(balance);
    }

    pub async fn set_spot_balance(&self, balance: SpotBalance) {
        let mut state = self.state.lock().await;
        state.spot_balances.retain(|b| b.asset != balance.asset);
        state.spot_balances.push(balance);
    }

    pub async fn set_position(&self, position: Position) {
        self.state
            .lock()
            .await
            .positions
            .insert(position.symbol.clone(), position);
    }

    pub async fn clear_position(&self, symbol: &str) {
        self.state.lock().await.positions.remove(symbol);
    }

    pub async fn add_open_order(&self, order: Order) {
        self.state.lock().await.open_orders.push(order);
    }

    pub async fn push_income(&self, record: IncomeRecord) {
        self.state.lock().await.income.push(record);
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.state.lock().await.prices.insert(symbol.to_owned(), price);
    }

    pub async fn set_server_time(&self, ms: i64) {
        self.state.lock().await.server_time_ms = ms;
    }

    /// Orders placed through the mock, in call order.
    pub async fn placed_orders(&self) -> Vec<OrderRequest> {
        self.state.lock().await.placed_orders.clone()
    }

    pub async fn cancelled_orders(&self) -> Vec<String> {
        self.state.lock().await.cancelled_orders.clone()
    }
}

#[async_trait]
impl ExchangeApi for MockExchangeClient {
    async fn get_server_time(&self) -> Result<i64, ExchangeError> {
        Ok(self.state.lock().await.server_time_ms)
    }

    async fn get_exchange_info(&self, symbol: Option<&str>) -> Result<Value, ExchangeError> {
        let symbols = match symbol {
            Some(symbol) => json!([{ "symbol": symbol, "status": "TRADING" }]),
            None => json!([]),
        };
        Ok(json!({ "symbols": symbols }))
    }

    async fn get_balances(&self) -> Result<Vec<Balance>, ExchangeError> {
        Ok(self
            .state
            .lock()
            .await
            .balances
            .iter()
            .filter(|b| !b.wallet_balance.is_zero())
            .cloned()
            .collect())
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, ExchangeError> {
        Ok(self
            .state
            .lock()
            .await
            .positions
            .get(symbol)
            .filter(|p| !p.quantity.is_zero())
            .cloned())
    }

    async fn get_all_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        Ok(self
            .state
            .lock()
            .await
            .positions
            .values()
            .filter(|p| !p.quantity.is_zero())
            .cloned()
            .collect())
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>, ExchangeError> {
        Ok(self
            .state
            .lock()
            .await
            .open_orders
            .iter()
            .filter(|o| symbol.is_none_or(|s| o.symbol == s))
            .cloned()
            .collect())
    }

    async fn get_order(
        &self,
        symbol: &str,
        order_id: Option<&str>,
        client_order_id: Option<&str>,
    ) -> Result<Order, ExchangeError> {
        self.state
            .lock()
            .await
            .open_orders
            .iter()
            .find(|o| {
                o.symbol == symbol
                    && (order_id.is_some_and(|id| o.order_id == id)
                        || client_order_id.is_some_and(|id| o.client_order_id == id))
            })
            .cloned()
            .ok_or(ExchangeError::Api {
                code: super::error::CODE_UNKNOWN_ORDER,
                message: "Unknown order sent.".into(),
            })
    }

    async fn get_trades(
        &self,
        symbol: &str,
        limit: u32,
        start_time: Option<i64>,
    ) -> Result<Vec<Trade>, ExchangeError> {
        Ok(self
            .state
            .lock()
            .await
            .trades
            .iter()
            .filter(|t| t.symbol == symbol)
            .filter(|t| start_time.is_none_or(|since| t.trade_time >= since))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<Order, ExchangeError> {
        request.validate()?;
        let mut state = self.state.lock().await;
        state.next_order_id += 1;
        let order = Order {
            order_id: state.next_order_id.to_string(),
            client_order_id: request.client_order_id.clone().unwrap_or_default(),
            symbol: request.symbol.clone(),
            side: request.side.as_str().to_owned(),
            order_type: request.order_type.as_str().to_owned(),
            status: "NEW".to_owned(),
            original_qty: request.quantity,
            executed_qty: Decimal::ZERO,
            price: request.price,
            avg_price: None,
            stop_price: request.stop_price,
            time_in_force: request.time_in_force.as_str().to_owned(),
            reduce_only: request.reduce_only,
            updated_at: None,
        };
        state.placed_orders.push(request.clone());
        state.open_orders.push(order.clone());
        Ok(order)
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: Option<&str>,
        client_order_id: Option<&str>,
    ) -> Result<Order, ExchangeError> {
        let mut state = self.state.lock().await;
        let index = state.open_orders.iter().position(|o| {
            o.symbol == symbol
                && (order_id.is_some_and(|id| o.order_id == id)
                    || client_order_id.is_some_and(|id| o.client_order_id == id))
        });
        match index {
            Some(index) => {
                let mut order = state.open_orders.remove(index);
                order.status = "CANCELED".to_owned();
                state.cancelled_orders.push(order.order_id.clone());
                Ok(order)
            }
            None => Err(ExchangeError::Api {
                code: super::error::CODE_UNKNOWN_ORDER,
                message: "Unknown order sent.".into(),
            }),
        }
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ExchangeError> {
        let mut state = self.state.lock().await;
        let removed: Vec<String> = state
            .open_orders
            .iter()
            .filter(|o| o.symbol == symbol)
            .map(|o| o.order_id.clone())
            .collect();
        state.open_orders.retain(|o| o.symbol != symbol);
        state.cancelled_orders.extend(removed);
        Ok(())
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn create_listen_key(&self) -> Result<String, ExchangeError> {
        let mut state = self.state.lock().await;
        state.listen_key_counter += 1;
        Ok(format!("mock-listen-key-{}", state.listen_key_counter))
    }

    async fn extend_listen_key(&self) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn delete_listen_key(&self) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn get_klines(
        &self,
        symbol: &str,
        _interval: &str,
        limit: u32,
        end_time: Option<i64>,
    ) -> Result<Vec<Kline>, ExchangeError> {
        let state = self.state.lock().await;
        match state.prices.get(symbol) {
            Some(close) => {
                let open_time = end_time.unwrap_or(state.server_time_ms) - 60_000;
                Ok(vec![
                    Kline {
                        open_time,
                        close: *close,
                    };
                    limit.min(1) as usize
                ])
            }
            None => Ok(Vec::new()),
        }
    }

    async fn get_income_history(
        &self,
        symbol: Option<&str>,
        income_type: Option<&str>,
        start_time: Option<i64>,
        limit: u32,
    ) -> Result<Vec<IncomeRecord>, ExchangeError> {
        Ok(self
            .state
            .lock()
            .await
            .income
            .iter()
            .filter(|r| symbol.is_none_or(|s| r.symbol == s))
            .filter(|r| income_type.is_none_or(|t| r.income_type == t))
            .filter(|r| start_time.is_none_or(|since| r.time >= since))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn get_account_snapshot(&self) -> Result<Value, ExchangeError> {
        let state = self.state.lock().await;
        let assets: Vec<Value> = state
            .balances
            .iter()
            .map(|b| {
                json!({
                    "asset": b.asset,
                    "walletBalance": b.wallet_balance.to_string(),
                    "marginBalance": b.total().to_string(),
                })
            })
            .collect();
        Ok(json!({
            "code": 200,
            "snapshotVos": [{
                "type": "futures",
                "updateTime": state.server_time_ms,
                "data": { "assets": assets },
            }],
        }))
    }

    async fn get_spot_balances(&self) -> Result<Vec<SpotBalance>, ExchangeError> {
        Ok(self.state.lock().await.spot_balances.clone())
    }

    async fn internal_transfer(
        &self,
        _asset: &str,
        _amount: Decimal,
        _transfer_type: &str,
    ) -> Result<String, ExchangeError> {
        Ok("mock-tran-1".to_owned())
    }

    async fn get_transfer_history(
        &self,
        _transfer_type: &str,
        _start_time: Option<i64>,
    ) -> Result<Value, ExchangeError> {
        Ok(json!({ "total": 0, "rows": [] }))
    }

    async fn get_convert_history(
        &self,
        _start_time: i64,
        _end_time: i64,
    ) -> Result<Value, ExchangeError> {
        Ok(json!({ "list": [] }))
    }

    async fn spot_market_order(
        &self,
        symbol: &str,
        side: crate::types::OrderSide,
        quantity: Decimal,
    ) -> Result<Value, ExchangeError> {
        Ok(json!({
            "symbol": symbol,
            "side": side.as_str(),
            "type": "MARKET",
            "executedQty": quantity.to_string(),
            "status": "FILLED",
        }))
    }

    async fn get_dust_log(&self) -> Result<Value, ExchangeError> {
        Ok(json!({ "total": 0, "userAssetDribblets": [] }))
    }
}

/// A trade fixture with sane defaults for tests.
pub fn mock_trade(trade_id: &str, symbol: &str, side: &str, qty: Decimal, price: Decimal) -> Trade {
    Trade {
        trade_id: trade_id.to_owned(),
        order_id: format!("o-{trade_id}"),
        client_order_id: String::new(),
        symbol: symbol.to_owned(),
        side: side.to_owned(),
        quantity: qty,
        price,
        quote_qty: qty * price,
        commission: Decimal::ZERO,
        commission_asset: "USDT".to_owned(),
        realized_pnl: Decimal::ZERO,
        is_maker: false,
        trade_time: 1_700_000_000_000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderSide;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_trades_filtered_by_start_time() {
        let mock = MockExchangeClient::new();
        let mut early = mock_trade("1", "XRPUSDT", "BUY", dec!(10), dec!(0.5));
        early.trade_time = 100;
        let mut late = mock_trade("2", "XRPUSDT", "BUY", dec!(10), dec!(0.5));
        late.trade_time = 200;
        mock.push_trade(early).await;
        mock.push_trade(late).await;

        let trades = mock.get_trades("XRPUSDT", 100, Some(150)).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].trade_id, "2");
    }

    #[tokio::test]
    async fn test_place_and_cancel_order() {
        let mock = MockExchangeClient::new();
        let order = mock
            .place_order(&OrderRequest::limit("XRPUSDT", OrderSide::Buy, dec!(100), dec!(0.5)))
            .await
            .unwrap();

        assert_eq!(mock.get_open_orders(Some("XRPUSDT")).await.unwrap().len(), 1);

        let cancelled = mock
            .cancel_order("XRPUSDT", Some(&order.order_id), None)
            .await
            .unwrap();
        assert_eq!(cancelled.status, "CANCELED");
        assert!(mock.get_open_orders(None).await.unwrap().is_empty());

        // cancelling again is the unknown-order business error
        let err = mock
            .cancel_order("XRPUSDT", Some(&order.order_id), None)
            .await
            .unwrap_err();
        assert!(err.is_unknown_order());
    }

    #[tokio::test]
    async fn test_klines_serve_programmed_price() {
        let mock = MockExchangeClient::new();
        mock.set_price("BNBUSDT", dec!(580)).await;

        let klines = mock
            .get_klines("BNBUSDT", "1m", 1, Some(1_700_000_000_000))
            .await
            .unwrap();
        assert_eq!(klines.len(), 1);
        assert_eq!(klines[0].close, dec!(580));

        assert!(mock
            .get_klines("DOGEUSDT", "1m", 1, None)
            .await
            .unwrap()
            .is_empty());
    }
}
