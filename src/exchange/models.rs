//! Exchange domain models and response decoding
//!
//! Normalized models for balances, positions, orders, trades and klines,
//! plus the decoders from raw Binance futures JSON. Every monetary field
//! arrives as a decimal string and is parsed into `Decimal` -- a binary
//! float never touches money.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

use super::error::ExchangeError;
use crate::types::{OrderSide, OrderType, PositionSide, TimeInForce};

/// Account balance for one asset.
#[derive(Debug, Clone, PartialEq)]
pub struct Balance {
    pub asset: String,
    pub wallet_balance: Decimal,
    pub available_balance: Decimal,
    pub cross_wallet_balance: Decimal,
    pub unrealized_pnl: Decimal,
}

impl Balance {
    /// Wallet plus unrealized P&L.
    pub fn total(&self) -> Decimal {
        self.wallet_balance + self.unrealized_pnl
    }

    /// Free funds (the most specific field the exchange gave us).
    pub fn free(&self) -> Decimal {
        self.available_balance
    }

    /// Funds tied up in orders/margin; never negative.
    pub fn locked(&self) -> Decimal {
        let locked = self.wallet_balance - self.available_balance;
        if locked > Decimal::ZERO {
            locked
        } else {
            Decimal::ZERO
        }
    }
}

/// Spot-wallet balance for one asset.
#[derive(Debug, Clone, PartialEq)]
pub struct SpotBalance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

impl SpotBalance {
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

/// Open position on one symbol. Quantity is the absolute value; direction
/// lives in `side`.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: i64,
    pub margin_type: String,
    /// `None` when the exchange reports "0" (unknown), which is not a price.
    pub liquidation_price: Option<Decimal>,
    pub mark_price: Option<Decimal>,
}

impl Position {
    pub fn notional(&self) -> Decimal {
        self.quantity * self.entry_price
    }
}

/// Exchange order snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub status: String,
    pub original_qty: Decimal,
    pub executed_qty: Decimal,
    pub price: Option<Decimal>,
    pub avg_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: String,
    pub reduce_only: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn remaining_qty(&self) -> Decimal {
        self.original_qty - self.executed_qty
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status.as_str(), "NEW" | "PARTIALLY_FILLED")
    }
}

/// A single fill.
#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    pub trade_id: String,
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub quote_qty: Decimal,
    pub commission: Decimal,
    pub commission_asset: String,
    pub realized_pnl: Decimal,
    pub is_maker: bool,
    /// Exchange fill time in epoch milliseconds.
    pub trade_time: i64,
}

/// One 1-minute OHLC candle (only what valuation needs).
#[derive(Debug, Clone, PartialEq)]
pub struct Kline {
    pub open_time: i64,
    pub close: Decimal,
}

/// An income-history record (funding fees, commissions, transfers...).
#[derive(Debug, Clone, PartialEq)]
pub struct IncomeRecord {
    pub symbol: String,
    pub income_type: String,
    pub income: Decimal,
    pub asset: String,
    pub time: i64,
}

/// Order placement request.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub client_order_id: Option<String>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub position_side: Option<PositionSide>,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_price: None,
            client_order_id: None,
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
            position_side: None,
        }
    }

    pub fn limit(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            price: Some(price),
            order_type: OrderType::Limit,
            ..Self::market(symbol, side, quantity)
        }
    }

    pub fn stop_market(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> Self {
        Self {
            stop_price: Some(stop_price),
            order_type: OrderType::StopMarket,
            reduce_only: true,
            ..Self::market(symbol, side, quantity)
        }
    }

    pub fn with_client_order_id(mut self, id: impl Into<String>) -> Self {
        self.client_order_id = Some(id.into());
        self
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    /// Basic shape validation, mirroring what the exchange would reject.
    pub fn validate(&self) -> Result<(), ExchangeError> {
        if self.quantity <= Decimal::ZERO {
            return Err(ExchangeError::InvalidRequest(
                "quantity must be positive".into(),
            ));
        }
        if self.order_type == OrderType::Limit && self.price.is_none() {
            return Err(ExchangeError::InvalidRequest(
                "price is required for LIMIT orders".into(),
            ));
        }
        if self.order_type.requires_stop_price() && self.stop_price.is_none() {
            return Err(ExchangeError::InvalidRequest(
                "stop_price is required for stop orders".into(),
            ));
        }
        Ok(())
    }

    /// Query parameters for the place-order endpoint.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("symbol".to_string(), self.symbol.clone()),
            ("side".to_string(), self.side.as_str().to_string()),
            ("type".to_string(), self.order_type.as_str().to_string()),
            ("quantity".to_string(), self.quantity.to_string()),
        ];
        if let Some(price) = self.price {
            params.push(("price".to_string(), price.to_string()));
        }
        if let Some(stop_price) = self.stop_price {
            params.push(("stopPrice".to_string(), stop_price.to_string()));
        }
        if let Some(id) = &self.client_order_id {
            params.push(("newClientOrderId".to_string(), id.clone()));
        }
        if self.order_type == OrderType::Limit {
            params.push((
                "timeInForce".to_string(),
                self.time_in_force.as_str().to_string(),
            ));
        }
        if self.reduce_only {
            params.push(("reduceOnly".to_string(), "true".to_string()));
        }
        if let Some(side) = self.position_side {
            params.push(("positionSide".to_string(), side.as_str().to_string()));
        }
        params
    }
}

// ----------------------------------------------------------------------
// JSON decoding helpers
// ----------------------------------------------------------------------

fn field<'a>(data: &'a Value, key: &str) -> Result<&'a Value, ExchangeError> {
    data.get(key)
        .ok_or_else(|| ExchangeError::Decode(format!("missing field {key}")))
}

fn str_field<'a>(data: &'a Value, key: &str) -> Result<&'a str, ExchangeError> {
    field(data, key)?
        .as_str()
        .ok_or_else(|| ExchangeError::Decode(format!("field {key} is not a string")))
}

/// Decimal from a string field. The exchange always quotes money.
fn decimal_field(data: &Value, key: &str) -> Result<Decimal, ExchangeError> {
    let raw = str_field(data, key)?;
    raw.parse()
        .map_err(|e| ExchangeError::Decode(format!("field {key}={raw} is not a decimal: {e}")))
}

fn decimal_field_or(data: &Value, key: &str, default: Decimal) -> Decimal {
    data.get(key)
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// `"0"` means "no value" for prices (e.g. an unknown liquidation price).
fn optional_price(data: &Value, key: &str) -> Option<Decimal> {
    let raw = data.get(key)?.as_str()?;
    if raw == "0" || raw == "0.0" {
        return None;
    }
    let value: Decimal = raw.parse().ok()?;
    if value.is_zero() {
        None
    } else {
        Some(value)
    }
}

fn ms_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// `GET /fapi/v2/balance` item -> [`Balance`].
pub fn parse_balance(data: &Value) -> Result<Balance, ExchangeError> {
    Ok(Balance {
        asset: str_field(data, "asset")?.to_owned(),
        wallet_balance: decimal_field(data, "balance")?,
        available_balance: decimal_field(data, "availableBalance")?,
        cross_wallet_balance: decimal_field_or(data, "crossWalletBalance", Decimal::ZERO),
        unrealized_pnl: decimal_field_or(data, "crossUnPnl", Decimal::ZERO),
    })
}

/// `GET /fapi/v2/positionRisk` item -> [`Position`].
///
/// `positionSide: BOTH` resolves to LONG/SHORT by the sign of
/// `positionAmt`; a flat BOTH row stays BOTH (callers filter those out).
pub fn parse_position(data: &Value) -> Result<Position, ExchangeError> {
    let amount = decimal_field(data, "positionAmt")?;
    let reported = data
        .get("positionSide")
        .and_then(Value::as_str)
        .and_then(PositionSide::from_str)
        .unwrap_or(PositionSide::Both);

    let side = match reported {
        PositionSide::Both if amount > Decimal::ZERO => PositionSide::Long,
        PositionSide::Both if amount < Decimal::ZERO => PositionSide::Short,
        other => other,
    };

    Ok(Position {
        symbol: str_field(data, "symbol")?.to_owned(),
        side,
        quantity: amount.abs(),
        entry_price: decimal_field(data, "entryPrice")?,
        unrealized_pnl: decimal_field_or(data, "unRealizedProfit", Decimal::ZERO),
        leverage: data
            .get("leverage")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(1),
        margin_type: data
            .get("marginType")
            .and_then(Value::as_str)
            .unwrap_or("cross")
            .to_uppercase(),
        liquidation_price: optional_price(data, "liquidationPrice"),
        mark_price: optional_price(data, "markPrice"),
    })
}

/// Order endpoints item -> [`Order`].
pub fn parse_order(data: &Value) -> Result<Order, ExchangeError> {
    let order_id = field(data, "orderId")?;
    let order_id = match order_id {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return Err(ExchangeError::Decode("orderId has unexpected type".into())),
    };

    Ok(Order {
        order_id,
        client_order_id: data
            .get("clientOrderId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        symbol: str_field(data, "symbol")?.to_owned(),
        side: str_field(data, "side")?.to_owned(),
        order_type: data
            .get("type")
            .or_else(|| data.get("origType"))
            .and_then(Value::as_str)
            .unwrap_or("UNKNOWN")
            .to_owned(),
        status: str_field(data, "status")?.to_owned(),
        original_qty: decimal_field(data, "origQty")?,
        executed_qty: decimal_field_or(data, "executedQty", Decimal::ZERO),
        price: optional_price(data, "price"),
        avg_price: optional_price(data, "avgPrice"),
        stop_price: optional_price(data, "stopPrice"),
        time_in_force: data
            .get("timeInForce")
            .and_then(Value::as_str)
            .unwrap_or("GTC")
            .to_owned(),
        reduce_only: data
            .get("reduceOnly")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        updated_at: data
            .get("updateTime")
            .and_then(Value::as_i64)
            .and_then(ms_to_datetime),
    })
}

/// `GET /fapi/v1/userTrades` item -> [`Trade`].
pub fn parse_trade(data: &Value) -> Result<Trade, ExchangeError> {
    let trade_id = match field(data, "id")? {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return Err(ExchangeError::Decode("trade id has unexpected type".into())),
    };
    let order_id = match field(data, "orderId")? {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return Err(ExchangeError::Decode("orderId has unexpected type".into())),
    };

    let price = decimal_field(data, "price")?;
    let quantity = decimal_field(data, "qty")?;
    let quote_qty = decimal_field_or(data, "quoteQty", price * quantity);

    Ok(Trade {
        trade_id,
        order_id,
        client_order_id: data
            .get("clientOrderId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        symbol: str_field(data, "symbol")?.to_owned(),
        side: str_field(data, "side")?.to_owned(),
        quantity,
        price,
        quote_qty,
        commission: decimal_field_or(data, "commission", Decimal::ZERO),
        commission_asset: data
            .get("commissionAsset")
            .and_then(Value::as_str)
            .unwrap_or("USDT")
            .to_owned(),
        realized_pnl: decimal_field_or(data, "realizedPnl", Decimal::ZERO),
        is_maker: data
            .get("maker")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        trade_time: data.get("time").and_then(Value::as_i64).unwrap_or(0),
    })
}

/// Kline array row `[open_time, open, high, low, close, ...]` -> [`Kline`].
pub fn parse_kline(data: &Value) -> Result<Kline, ExchangeError> {
    let row = data
        .as_array()
        .ok_or_else(|| ExchangeError::Decode("kline row is not an array".into()))?;
    let open_time = row
        .first()
        .and_then(Value::as_i64)
        .ok_or_else(|| ExchangeError::Decode("kline open_time missing".into()))?;
    let close = row
        .get(4)
        .and_then(Value::as_str)
        .ok_or_else(|| ExchangeError::Decode("kline close missing".into()))?;
    Ok(Kline {
        open_time,
        close: close
            .parse()
            .map_err(|e| ExchangeError::Decode(format!("kline close {close}: {e}")))?,
    })
}

/// `GET /fapi/v1/income` item -> [`IncomeRecord`].
pub fn parse_income(data: &Value) -> Result<IncomeRecord, ExchangeError> {
    Ok(IncomeRecord {
        symbol: data
            .get("symbol")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        income_type: str_field(data, "incomeType")?.to_owned(),
        income: decimal_field(data, "income")?,
        asset: data
            .get("asset")
            .and_then(Value::as_str)
            .unwrap_or("USDT")
            .to_owned(),
        time: data.get("time").and_then(Value::as_i64).unwrap_or(0),
    })
}

/// Zero-quantity positionRisk rows are noise; callers filter with this.
pub fn is_zero_position(data: &Value) -> bool {
    data.get("positionAmt")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<Decimal>().ok())
        .map(|amount| amount.is_zero())
        .unwrap_or(true)
}

/// Zero-balance rows are likewise filtered before event emission.
pub fn is_zero_balance(data: &Value) -> bool {
    data.get("balance")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<Decimal>().ok())
        .map(|balance| balance.is_zero())
        .unwrap_or(true)
}
