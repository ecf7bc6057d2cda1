//! Core domain types
//!
//! `Scope` plus the string-backed enums shared across the whole core.
//! Everything here serializes to the exact strings the exchange and the
//! database use, so `as_str`/`from_str` pairs are the canonical mapping.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Trading mode. Events from different modes never mix in projections
/// or ledger balances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Production,
    Testnet,
}

impl TradingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingMode::Production => "production",
            TradingMode::Testnet => "testnet",
        }
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(OrderSide::Buy),
            "SELL" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Position direction as the exchange reports it. `Both` appears in one-way
/// position mode and resolves to LONG/SHORT by the sign of the quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
    Both,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
            PositionSide::Both => "BOTH",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "LONG" => Some(PositionSide::Long),
            "SHORT" => Some(PositionSide::Short),
            "BOTH" => Some(PositionSide::Both),
            _ => None,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Exchange order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "LIMIT")]
    Limit,
    #[serde(rename = "STOP_MARKET")]
    StopMarket,
    #[serde(rename = "TAKE_PROFIT_MARKET")]
    TakeProfitMarket,
    #[serde(rename = "STOP")]
    Stop,
    #[serde(rename = "TAKE_PROFIT")]
    TakeProfit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
            OrderType::Stop => "STOP",
            OrderType::TakeProfit => "TAKE_PROFIT",
        }
    }

    /// Trigger-price order types (stop_price required).
    pub fn requires_stop_price(&self) -> bool {
        matches!(
            self,
            OrderType::StopMarket
                | OrderType::TakeProfitMarket
                | OrderType::Stop
                | OrderType::TakeProfit
        )
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Exchange order status. `CANCELED` keeps the exchange's US spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Expired => "EXPIRED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(OrderStatus::New),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELED" => Some(OrderStatus::Canceled),
            "REJECTED" => Some(OrderStatus::Rejected),
            "EXPIRED" => Some(OrderStatus::Expired),
            _ => None,
        }
    }

    /// Terminal statuses drop the order from the open-order projection.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Expired
                | OrderStatus::Rejected
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Time-in-force for limit orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
            TimeInForce::Fok => "FOK",
        }
    }
}

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventSource {
    Websocket,
    Rest,
    Bot,
    Web,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Websocket => "WEBSOCKET",
            EventSource::Rest => "REST",
            EventSource::Bot => "BOT",
            EventSource::Web => "WEB",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "WEBSOCKET" => Some(EventSource::Websocket),
            "REST" => Some(EventSource::Rest),
            "BOT" => Some(EventSource::Bot),
            "WEB" => Some(EventSource::Web),
            _ => None,
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The kind of entity an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntityKind {
    Order,
    Trade,
    Position,
    Balance,
    Transfer,
    Engine,
    Config,
    Reconciler,
    Capital,
    Strategy,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Order => "ORDER",
            EntityKind::Trade => "TRADE",
            EntityKind::Position => "POSITION",
            EntityKind::Balance => "BALANCE",
            EntityKind::Transfer => "TRANSFER",
            EntityKind::Engine => "ENGINE",
            EntityKind::Config => "CONFIG",
            EntityKind::Reconciler => "RECONCILER",
            EntityKind::Capital => "CAPITAL",
            EntityKind::Strategy => "STRATEGY",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ORDER" => Some(EntityKind::Order),
            "TRADE" => Some(EntityKind::Trade),
            "POSITION" => Some(EntityKind::Position),
            "BALANCE" => Some(EntityKind::Balance),
            "TRANSFER" => Some(EntityKind::Transfer),
            "ENGINE" => Some(EntityKind::Engine),
            "CONFIG" => Some(EntityKind::Config),
            "RECONCILER" => Some(EntityKind::Reconciler),
            "CAPITAL" => Some(EntityKind::Capital),
            "STRATEGY" => Some(EntityKind::Strategy),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable five-tuple tagging every event and command.
///
/// `symbol` is optional: account-level events (balances, engine lifecycle)
/// carry no symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub exchange: String,
    pub venue: String,
    pub account_id: String,
    pub symbol: Option<String>,
    pub mode: String,
}

impl Scope {
    pub fn new(
        exchange: impl Into<String>,
        venue: impl Into<String>,
        account_id: impl Into<String>,
        symbol: Option<String>,
        mode: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            venue: venue.into(),
            account_id: account_id.into(),
            symbol,
            mode: mode.into(),
        }
    }

    /// Default Binance futures scope for the given mode.
    pub fn binance_futures(account_id: impl Into<String>, mode: TradingMode) -> Self {
        Self::new("BINANCE", "FUTURES", account_id, None, mode.as_str())
    }

    /// Same scope narrowed to one symbol.
    pub fn with_symbol(&self, symbol: impl Into<String>) -> Self {
        Self {
            symbol: Some(symbol.into()),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_status_terminal() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());

        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn test_order_status_roundtrip() {
        for status in [
            OrderStatus::New,
            OrderStatus::PartiallyFilled,
            OrderStatus::Filled,
            OrderStatus::Canceled,
            OrderStatus::Rejected,
            OrderStatus::Expired,
        ] {
            assert_eq!(OrderStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(OrderStatus::from_str("CANCELLED"), None);
    }

    #[test]
    fn test_scope_with_symbol() {
        let scope = Scope::binance_futures("main", TradingMode::Testnet);
        assert_eq!(scope.symbol, None);

        let narrowed = scope.with_symbol("XRPUSDT");
        assert_eq!(narrowed.symbol.as_deref(), Some("XRPUSDT"));
        assert_eq!(narrowed.exchange, "BINANCE");
        assert_eq!(narrowed.mode, "testnet");
    }

    #[test]
    fn test_stop_price_requirement() {
        assert!(OrderType::StopMarket.requires_stop_price());
        assert!(OrderType::TakeProfit.requires_stop_price());
        assert!(!OrderType::Market.requires_stop_price());
        assert!(!OrderType::Limit.requires_stop_price());
    }
}
