//! Exchange adapters
//!
//! The [`ExchangeApi`] trait is the REST surface the core consumes; the
//! live Binance futures client and the in-memory mock both implement it,
//! so every component upstream is written against the trait.

pub mod error;
pub mod mock;
pub mod models;
pub mod rate_limit;
pub mod rest;
pub mod stream;
pub mod ws;

pub use error::{ExchangeError, OrderError};
pub use mock::MockExchangeClient;
pub use models::{
    Balance, IncomeRecord, Kline, Order, OrderRequest, Position, SpotBalance, Trade,
};
pub use rate_limit::{RateLimitThresholds, RateLimitTracker};
pub use rest::BinanceRestClient;
pub use stream::WsMessageHandler;
pub use ws::BinanceWsClient;

use async_trait::async_trait;
use serde_json::Value;

/// REST operations the core depends on. The transport behind them (HTTP
/// client, signing, retries) is an adapter concern.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Server-time probe, epoch milliseconds.
    async fn get_server_time(&self) -> Result<i64, ExchangeError>;

    /// Symbol metadata (filters, precisions).
    async fn get_exchange_info(&self, symbol: Option<&str>) -> Result<Value, ExchangeError>;

    /// Non-zero account balances.
    async fn get_balances(&self) -> Result<Vec<Balance>, ExchangeError>;

    /// Active position on one symbol (`None` when flat).
    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, ExchangeError>;

    /// All non-zero positions.
    async fn get_all_positions(&self) -> Result<Vec<Position>, ExchangeError>;

    /// Open orders, optionally narrowed to one symbol.
    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>, ExchangeError>;

    /// Single order by exchange id or client id.
    async fn get_order(
        &self,
        symbol: &str,
        order_id: Option<&str>,
        client_order_id: Option<&str>,
    ) -> Result<Order, ExchangeError>;

    /// Recent user trades, paginated by `start_time` (epoch ms).
    async fn get_trades(
        &self,
        symbol: &str,
        limit: u32,
        start_time: Option<i64>,
    ) -> Result<Vec<Trade>, ExchangeError>;

    async fn place_order(&self, request: &OrderRequest) -> Result<Order, ExchangeError>;

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: Option<&str>,
        client_order_id: Option<&str>,
    ) -> Result<Order, ExchangeError>;

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ExchangeError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;

    /// Private-data listen-key lifecycle.
    async fn create_listen_key(&self) -> Result<String, ExchangeError>;
    async fn extend_listen_key(&self) -> Result<(), ExchangeError>;
    async fn delete_listen_key(&self) -> Result<(), ExchangeError>;

    /// 1-minute OHLC candles for historical valuation.
    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
        end_time: Option<i64>,
    ) -> Result<Vec<Kline>, ExchangeError>;

    /// Income history (funding fees, commissions, transfers).
    async fn get_income_history(
        &self,
        symbol: Option<&str>,
        income_type: Option<&str>,
        start_time: Option<i64>,
        limit: u32,
    ) -> Result<Vec<IncomeRecord>, ExchangeError>;

    /// Daily account snapshot (raw, venue-specific shape).
    async fn get_account_snapshot(&self) -> Result<Value, ExchangeError>;

    /// Spot-wallet balances (initial-capital bootstrap, fiat-rail hooks).
    async fn get_spot_balances(&self) -> Result<Vec<SpotBalance>, ExchangeError>;

    /// Spot <-> futures internal transfer; returns the transaction id.
    async fn internal_transfer(
        &self,
        asset: &str,
        amount: rust_decimal::Decimal,
        transfer_type: &str,
    ) -> Result<String, ExchangeError>;

    /// Universal-transfer history (raw).
    async fn get_transfer_history(
        &self,
        transfer_type: &str,
        start_time: Option<i64>,
    ) -> Result<Value, ExchangeError>;

    /// Convert trade-flow history (raw).
    async fn get_convert_history(
        &self,
        start_time: i64,
        end_time: i64,
    ) -> Result<Value, ExchangeError>;

    /// Spot-wallet market order (fiat-rail hops); returns the raw fill.
    async fn spot_market_order(
        &self,
        symbol: &str,
        side: crate::types::OrderSide,
        quantity: rust_decimal::Decimal,
    ) -> Result<Value, ExchangeError>;

    /// Dust-conversion log (raw).
    async fn get_dust_log(&self) -> Result<Value, ExchangeError>;
}
