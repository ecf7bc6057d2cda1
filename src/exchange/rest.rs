//! Binance futures REST client
//!
//! HMAC-SHA256 signed requests with server-time offset sync, rate-limit
//! tracking and a retry policy:
//! - transient transport failures retry with linear back-off (1x, 2x, 3x s)
//! - 429 sleeps the server-supplied Retry-After before retrying
//! - timestamp errors (-1021/-1022) resync the clock and retry once more
//!
//! Signed retries rebuild the query from scratch so the timestamp and
//! signature are regenerated each attempt.

use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::error::ExchangeError;
use super::models::{
    self, Balance, IncomeRecord, Kline, Order, OrderRequest, Position, SpotBalance, Trade,
};
use super::rate_limit::{RateLimitThresholds, RateLimitTracker};
use super::ExchangeApi;

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: u64 = 5000;

/// Client configuration. Secrets come from the environment via
/// `config::AppConfig`; nothing here is global.
#[derive(Debug, Clone)]
pub struct RestClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub rate_limits: RateLimitThresholds,
}

impl RestClientConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            rate_limits: RateLimitThresholds::default(),
        }
    }
}

pub struct BinanceRestClient {
    config: RestClientConfig,
    http: reqwest::Client,
    rate_tracker: Mutex<RateLimitTracker>,
    /// server_time - local_time in milliseconds.
    time_offset_ms: AtomicI64,
    time_synced: AtomicBool,
}

impl BinanceRestClient {
    pub fn new(config: RestClientConfig) -> Result<Self, ExchangeError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        Ok(Self {
            rate_tracker: Mutex::new(RateLimitTracker::new(config.rate_limits)),
            http,
            config,
            time_offset_ms: AtomicI64::new(0),
            time_synced: AtomicBool::new(false),
        })
    }

    /// Snapshot of the rate tracker (diagnostics).
    pub fn rate_tracker(&self) -> RateLimitTracker {
        self.rate_tracker.lock().expect("rate tracker poisoned").clone()
    }

    fn local_now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn timestamp(&self) -> i64 {
        Self::local_now_ms() + self.time_offset_ms.load(Ordering::Relaxed)
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.config.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Sync the local clock offset against the server time.
    pub async fn sync_time(&self) -> Result<i64, ExchangeError> {
        let local = Self::local_now_ms();
        let server = self.get_server_time().await?;
        let offset = server - local;
        self.time_offset_ms.store(offset, Ordering::Relaxed);
        self.time_synced.store(true, Ordering::Relaxed);
        tracing::info!(offset_ms = offset, "server time synchronized");
        Ok(offset)
    }

    async fn ensure_time_synced(&self) -> Result<(), ExchangeError> {
        if !self.time_synced.load(Ordering::Relaxed) {
            self.sync_time().await?;
        }
        Ok(())
    }

    fn encode_query(params: &[(String, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Execute one request with the retry policy. `params` is rebuilt into
    /// a fresh query (new timestamp, new signature) every attempt.
    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &[(String, String)],
        signed: bool,
    ) -> Result<Value, ExchangeError> {
        {
            let tracker = self.rate_tracker.lock().expect("rate tracker poisoned");
            if tracker.should_stop() && !tracker.is_stale() {
                tracing::warn!(
                    used_weight = tracker.used_weight_1m(),
                    "request-weight stop threshold reached, refusing request"
                );
                return Err(ExchangeError::RateLimited { retry_after_secs: 60 });
            }
            if tracker.should_slow_down() {
                tracing::warn!(
                    used_weight = tracker.used_weight_1m(),
                    "request-weight slow threshold reached"
                );
            }
        }

        if signed {
            self.ensure_time_synced().await?;
        }

        let max_attempts = self.config.max_retries.max(1);
        let mut last_error = ExchangeError::Transport("no attempt made".into());

        for attempt in 0..max_attempts {
            let mut query = Self::encode_query(params);
            if signed {
                let suffix = format!(
                    "{}timestamp={}&recvWindow={}",
                    if query.is_empty() { String::new() } else { format!("{query}&") },
                    self.timestamp(),
                    RECV_WINDOW_MS,
                );
                let signature = self.sign(&suffix);
                query = format!("{suffix}&signature={signature}");
            }

            let url = if query.is_empty() {
                format!("{}{}", self.config.base_url, path)
            } else {
                format!("{}{}?{}", self.config.base_url, path, query)
            };

            let response = self
                .http
                .request(method.clone(), url.as_str())
                .header("X-MBX-APIKEY", &self.config.api_key)
                .send()
                .await;

            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!(path, attempt = attempt + 1, error = %err, "request failed");
                    last_error = ExchangeError::Transport(err.to_string());
                    if attempt + 1 < max_attempts {
                        tokio::time::sleep(Duration::from_secs((attempt + 1) as u64)).await;
                        continue;
                    }
                    break;
                }
            };

            {
                let headers = response
                    .headers()
                    .iter()
                    .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
                    .collect::<Vec<_>>();
                let mut tracker = self.rate_tracker.lock().expect("rate tracker poisoned");
                tracker.update_from_headers(headers);
                if tracker.should_warn() && !tracker.should_slow_down() {
                    tracing::warn!(
                        used_weight = tracker.used_weight_1m(),
                        "request-weight warn threshold reached"
                    );
                }
            }

            let status = response.status();

            if status.as_u16() == 429 {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30u64);
                tracing::warn!(retry_after, attempt = attempt + 1, "rate limited by exchange");
                if attempt + 1 < max_attempts {
                    tokio::time::sleep(Duration::from_secs(retry_after)).await;
                    continue;
                }
                return Err(ExchangeError::RateLimited { retry_after_secs: retry_after });
            }

            let body: Value = match response.json().await {
                Ok(body) => body,
                Err(err) => {
                    last_error = ExchangeError::Decode(err.to_string());
                    break;
                }
            };

            if !status.is_success() {
                let code = body.get("code").and_then(Value::as_i64).unwrap_or(status.as_u16() as i64);
                let message = body
                    .get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_owned();
                let err = ExchangeError::Api { code, message };

                if err.is_timestamp_error() && attempt + 1 < max_attempts {
                    tracing::warn!(code, attempt = attempt + 1, "timestamp error, resyncing clock");
                    self.sync_time().await?;
                    continue;
                }
                return Err(err);
            }

            return Ok(body);
        }

        Err(last_error)
    }

    fn params(pairs: &[(&str, Option<String>)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| (k.to_string(), v.clone())))
            .collect()
    }
}

#[async_trait]
impl ExchangeApi for BinanceRestClient {
    async fn get_server_time(&self) -> Result<i64, ExchangeError> {
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/time", &[], false)
            .await?;
        body.get("serverTime")
            .and_then(Value::as_i64)
            .ok_or_else(|| ExchangeError::Decode("serverTime missing".into()))
    }

    async fn get_exchange_info(&self, symbol: Option<&str>) -> Result<Value, ExchangeError> {
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/exchangeInfo", &[], false)
            .await?;
        match symbol {
            None => Ok(body),
            Some(symbol) => {
                let symbols: Vec<Value> = body
                    .get("symbols")
                    .and_then(Value::as_array)
                    .map(|rows| {
                        rows.iter()
                            .filter(|row| row.get("symbol").and_then(Value::as_str) == Some(symbol))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(serde_json::json!({ "symbols": symbols }))
            }
        }
    }

    async fn get_balances(&self) -> Result<Vec<Balance>, ExchangeError> {
        let body = self
            .request(reqwest::Method::GET, "/fapi/v2/balance", &[], true)
            .await?;
        let rows = body
            .as_array()
            .ok_or_else(|| ExchangeError::Decode("balance response is not an array".into()))?;
        rows.iter()
            .filter(|row| !models::is_zero_balance(row))
            .map(models::parse_balance)
            .collect()
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, ExchangeError> {
        let params = vec![("symbol".to_string(), symbol.to_string())];
        let body = self
            .request(reqwest::Method::GET, "/fapi/v2/positionRisk", &params, true)
            .await?;
        let rows = body
            .as_array()
            .ok_or_else(|| ExchangeError::Decode("positionRisk response is not an array".into()))?;
        for row in rows {
            if row.get("symbol").and_then(Value::as_str) == Some(symbol)
                && !models::is_zero_position(row)
            {
                return Ok(Some(models::parse_position(row)?));
            }
        }
        Ok(None)
    }

    async fn get_all_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        let body = self
            .request(reqwest::Method::GET, "/fapi/v2/positionRisk", &[], true)
            .await?;
        let rows = body
            .as_array()
            .ok_or_else(|| ExchangeError::Decode("positionRisk response is not an array".into()))?;
        rows.iter()
            .filter(|row| !models::is_zero_position(row))
            .map(models::parse_position)
            .collect()
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>, ExchangeError> {
        let params = Self::params(&[("symbol", symbol.map(str::to_owned))]);
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/openOrders", &params, true)
            .await?;
        let rows = body
            .as_array()
            .ok_or_else(|| ExchangeError::Decode("openOrders response is not an array".into()))?;
        rows.iter().map(models::parse_order).collect()
    }

    async fn get_order(
        &self,
        symbol: &str,
        order_id: Option<&str>,
        client_order_id: Option<&str>,
    ) -> Result<Order, ExchangeError> {
        if order_id.is_none() && client_order_id.is_none() {
            return Err(ExchangeError::InvalidRequest(
                "order_id or client_order_id required".into(),
            ));
        }
        let params = Self::params(&[
            ("symbol", Some(symbol.to_owned())),
            ("orderId", order_id.map(str::to_owned)),
            ("origClientOrderId", client_order_id.map(str::to_owned)),
        ]);
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/order", &params, true)
            .await?;
        models::parse_order(&body)
    }

    async fn get_trades(
        &self,
        symbol: &str,
        limit: u32,
        start_time: Option<i64>,
    ) -> Result<Vec<Trade>, ExchangeError> {
        let params = Self::params(&[
            ("symbol", Some(symbol.to_owned())),
            ("limit", Some(limit.min(1000).to_string())),
            ("startTime", start_time.map(|t| t.to_string())),
        ]);
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/userTrades", &params, true)
            .await?;
        let rows = body
            .as_array()
            .ok_or_else(|| ExchangeError::Decode("userTrades response is not an array".into()))?;
        rows.iter().map(models::parse_trade).collect()
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<Order, ExchangeError> {
        request.validate()?;
        let params = request.to_params();
        let body = self
            .request(reqwest::Method::POST, "/fapi/v1/order", &params, true)
            .await
            .map_err(|err| {
                tracing::error!(symbol = %request.symbol, error = %err, "order placement failed");
                err
            })?;
        let order = models::parse_order(&body)?;
        tracing::info!(
            order_id = %order.order_id,
            client_order_id = %order.client_order_id,
            symbol = %order.symbol,
            side = %order.side,
            qty = %order.original_qty,
            "order placed"
        );
        Ok(order)
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: Option<&str>,
        client_order_id: Option<&str>,
    ) -> Result<Order, ExchangeError> {
        if order_id.is_none() && client_order_id.is_none() {
            return Err(ExchangeError::InvalidRequest(
                "order_id or client_order_id required".into(),
            ));
        }
        let params = Self::params(&[
            ("symbol", Some(symbol.to_owned())),
            ("orderId", order_id.map(str::to_owned)),
            ("origClientOrderId", client_order_id.map(str::to_owned)),
        ]);
        let body = self
            .request(reqwest::Method::DELETE, "/fapi/v1/order", &params, true)
            .await?;
        let order = models::parse_order(&body)?;
        tracing::info!(order_id = %order.order_id, "order cancelled");
        Ok(order)
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ExchangeError> {
        let params = vec![("symbol".to_string(), symbol.to_string())];
        self.request(reqwest::Method::DELETE, "/fapi/v1/allOpenOrders", &params, true)
            .await?;
        tracing::info!(symbol, "all open orders cancelled");
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("leverage".to_string(), leverage.to_string()),
        ];
        self.request(reqwest::Method::POST, "/fapi/v1/leverage", &params, true)
            .await?;
        tracing::info!(symbol, leverage, "leverage set");
        Ok(())
    }

    async fn create_listen_key(&self) -> Result<String, ExchangeError> {
        let body = self
            .request(reqwest::Method::POST, "/fapi/v1/listenKey", &[], false)
            .await?;
        let key = body
            .get("listenKey")
            .and_then(Value::as_str)
            .ok_or_else(|| ExchangeError::Decode("listenKey missing".into()))?;
        tracing::info!("listen key created");
        Ok(key.to_owned())
    }

    async fn extend_listen_key(&self) -> Result<(), ExchangeError> {
        self.request(reqwest::Method::PUT, "/fapi/v1/listenKey", &[], false)
            .await?;
        tracing::debug!("listen key extended");
        Ok(())
    }

    async fn delete_listen_key(&self) -> Result<(), ExchangeError> {
        self.request(reqwest::Method::DELETE, "/fapi/v1/listenKey", &[], false)
            .await?;
        tracing::info!("listen key deleted");
        Ok(())
    }

    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
        end_time: Option<i64>,
    ) -> Result<Vec<Kline>, ExchangeError> {
        let params = Self::params(&[
            ("symbol", Some(symbol.to_owned())),
            ("interval", Some(interval.to_owned())),
            ("limit", Some(limit.to_string())),
            ("endTime", end_time.map(|t| t.to_string())),
        ]);
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/klines", &params, false)
            .await?;
        let rows = body
            .as_array()
            .ok_or_else(|| ExchangeError::Decode("klines response is not an array".into()))?;
        rows.iter().map(models::parse_kline).collect()
    }

    async fn get_income_history(
        &self,
        symbol: Option<&str>,
        income_type: Option<&str>,
        start_time: Option<i64>,
        limit: u32,
    ) -> Result<Vec<IncomeRecord>, ExchangeError> {
        let params = Self::params(&[
            ("symbol", symbol.map(str::to_owned)),
            ("incomeType", income_type.map(str::to_owned)),
            ("startTime", start_time.map(|t| t.to_string())),
            ("limit", Some(limit.min(1000).to_string())),
        ]);
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/income", &params, true)
            .await?;
        let rows = body
            .as_array()
            .ok_or_else(|| ExchangeError::Decode("income response is not an array".into()))?;
        rows.iter().map(models::parse_income).collect()
    }

    async fn get_account_snapshot(&self) -> Result<Value, ExchangeError> {
        let params = vec![("type".to_string(), "FUTURES".to_string())];
        self.request(reqwest::Method::GET, "/sapi/v1/accountSnapshot", &params, true)
            .await
    }

    async fn get_spot_balances(&self) -> Result<Vec<SpotBalance>, ExchangeError> {
        let body = self
            .request(reqwest::Method::GET, "/api/v3/account", &[], true)
            .await?;
        let rows = body
            .get("balances")
            .and_then(Value::as_array)
            .ok_or_else(|| ExchangeError::Decode("spot balances missing".into()))?;

        let mut balances = Vec::new();
        for row in rows {
            let asset = row
                .get("asset")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            let free: Decimal = row
                .get("free")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or(Decimal::ZERO);
            let locked: Decimal = row
                .get("locked")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or(Decimal::ZERO);
            if !free.is_zero() || !locked.is_zero() {
                balances.push(SpotBalance { asset, free, locked });
            }
        }
        Ok(balances)
    }

    async fn internal_transfer(
        &self,
        asset: &str,
        amount: Decimal,
        transfer_type: &str,
    ) -> Result<String, ExchangeError> {
        let params = vec![
            ("asset".to_string(), asset.to_string()),
            ("amount".to_string(), amount.to_string()),
            ("type".to_string(), transfer_type.to_string()),
        ];
        let body = self
            .request(reqwest::Method::POST, "/sapi/v1/asset/transfer", &params, true)
            .await?;
        body.get("tranId")
            .map(|id| match id {
                Value::Number(n) => n.to_string(),
                Value::String(s) => s.clone(),
                _ => id.to_string(),
            })
            .ok_or_else(|| ExchangeError::Decode("tranId missing".into()))
    }

    async fn get_transfer_history(
        &self,
        transfer_type: &str,
        start_time: Option<i64>,
    ) -> Result<Value, ExchangeError> {
        let params = Self::params(&[
            ("type", Some(transfer_type.to_owned())),
            ("startTime", start_time.map(|t| t.to_string())),
        ]);
        self.request(reqwest::Method::GET, "/sapi/v1/asset/transfer", &params, true)
            .await
    }

    async fn get_convert_history(
        &self,
        start_time: i64,
        end_time: i64,
    ) -> Result<Value, ExchangeError> {
        let params = vec![
            ("startTime".to_string(), start_time.to_string()),
            ("endTime".to_string(), end_time.to_string()),
        ];
        self.request(reqwest::Method::GET, "/sapi/v1/convert/tradeFlow", &params, true)
            .await
    }

    async fn spot_market_order(
        &self,
        symbol: &str,
        side: crate::types::OrderSide,
        quantity: Decimal,
    ) -> Result<Value, ExchangeError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("side".to_string(), side.as_str().to_string()),
            ("type".to_string(), "MARKET".to_string()),
            ("quantity".to_string(), quantity.to_string()),
        ];
        self.request(reqwest::Method::POST, "/api/v3/order", &params, true)
            .await
    }

    async fn get_dust_log(&self) -> Result<Value, ExchangeError> {
        self.request(reqwest::Method::GET, "/sapi/v1/asset/dribblet", &[], true)
            .await
    }
}
