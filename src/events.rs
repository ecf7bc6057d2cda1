//! Domain events
//!
//! Every state change in the system is recorded as an immutable [`Event`]
//! in the append-only log. The event type set is closed: anything the
//! exchange or the bot can report maps to exactly one [`EventType`].
//!
//! Deduplication is keyed solely on `dedup_key`. The key grammars are
//! bit-exact contracts shared between the WebSocket handler and the REST
//! reconciler -- a trade seen on both paths must produce the same key.
//! All keys are built through the constructors in [`dedup`]; nothing else
//! formats them by hand.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::types::{EntityKind, EventSource, Scope};

/// Closed set of event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    // Engine lifecycle
    EngineStarted,
    EngineStopped,
    EnginePaused,
    EngineResumed,
    EngineModeChanged,
    ManualOverrideExecuted,
    RiskGuardRejected,
    ConfigChanged,

    // Connection
    WebSocketConnected,
    WebSocketDisconnected,
    WebSocketReconnected,

    // Orders / trades
    OrderPlaced,
    OrderRejected,
    OrderCancelled,
    OrderUpdated,
    TradeExecuted,

    // Balance / position / fee
    PositionChanged,
    BalanceChanged,
    FeeCharged,
    FundingApplied,

    // Movement
    InternalTransferRequested,
    InternalTransferCompleted,
    InternalTransferFailed,
    DepositInitiated,
    DepositCompleted,
    WithdrawInitiated,
    WithdrawCompleted,
    WithdrawFailed,
    DustConverted,
    ConvertExecuted,

    // Integrity
    DriftDetected,
    ReconciliationPerformed,
    QuarantineStarted,
    QuarantineCompleted,

    // Capital
    InitialCapitalEstablished,
    OpeningBalanceAdjusted,

    // Strategy
    StrategyLoaded,
    StrategyStarted,
    StrategyStopped,
    StrategyError,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::EngineStarted => "EngineStarted",
            EventType::EngineStopped => "EngineStopped",
            EventType::EnginePaused => "EnginePaused",
            EventType::EngineResumed => "EngineResumed",
            EventType::EngineModeChanged => "EngineModeChanged",
            EventType::ManualOverrideExecuted => "ManualOverrideExecuted",
            EventType::RiskGuardRejected => "RiskGuardRejected",
            EventType::ConfigChanged => "ConfigChanged",
            EventType::WebSocketConnected => "WebSocketConnected",
            EventType::WebSocketDisconnected => "WebSocketDisconnected",
            EventType::WebSocketReconnected => "WebSocketReconnected",
            EventType::OrderPlaced => "OrderPlaced",
            EventType::OrderRejected => "OrderRejected",
            EventType::OrderCancelled => "OrderCancelled",
            EventType::OrderUpdated => "OrderUpdated",
            EventType::TradeExecuted => "TradeExecuted",
            EventType::PositionChanged => "PositionChanged",
            EventType::BalanceChanged => "BalanceChanged",
            EventType::FeeCharged => "FeeCharged",
            EventType::FundingApplied => "FundingApplied",
            EventType::InternalTransferRequested => "InternalTransferRequested",
            EventType::InternalTransferCompleted => "InternalTransferCompleted",
            EventType::InternalTransferFailed => "InternalTransferFailed",
            EventType::DepositInitiated => "DepositInitiated",
            EventType::DepositCompleted => "DepositCompleted",
            EventType::WithdrawInitiated => "WithdrawInitiated",
            EventType::WithdrawCompleted => "WithdrawCompleted",
            EventType::WithdrawFailed => "WithdrawFailed",
            EventType::DustConverted => "DustConverted",
            EventType::ConvertExecuted => "ConvertExecuted",
            EventType::DriftDetected => "DriftDetected",
            EventType::ReconciliationPerformed => "ReconciliationPerformed",
            EventType::QuarantineStarted => "QuarantineStarted",
            EventType::QuarantineCompleted => "QuarantineCompleted",
            EventType::InitialCapitalEstablished => "InitialCapitalEstablished",
            EventType::OpeningBalanceAdjusted => "OpeningBalanceAdjusted",
            EventType::StrategyLoaded => "StrategyLoaded",
            EventType::StrategyStarted => "StrategyStarted",
            EventType::StrategyStopped => "StrategyStopped",
            EventType::StrategyError => "StrategyError",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        let ty = match s {
            "EngineStarted" => EventType::EngineStarted,
            "EngineStopped" => EventType::EngineStopped,
            "EnginePaused" => EventType::EnginePaused,
            "EngineResumed" => EventType::EngineResumed,
            "EngineModeChanged" => EventType::EngineModeChanged,
            "ManualOverrideExecuted" => EventType::ManualOverrideExecuted,
            "RiskGuardRejected" => EventType::RiskGuardRejected,
            "ConfigChanged" => EventType::ConfigChanged,
            "WebSocketConnected" => EventType::WebSocketConnected,
            "WebSocketDisconnected" => EventType::WebSocketDisconnected,
            "WebSocketReconnected" => EventType::WebSocketReconnected,
            "OrderPlaced" => EventType::OrderPlaced,
            "OrderRejected" => EventType::OrderRejected,
            "OrderCancelled" => EventType::OrderCancelled,
            "OrderUpdated" => EventType::OrderUpdated,
            "TradeExecuted" => EventType::TradeExecuted,
            "PositionChanged" => EventType::PositionChanged,
            "BalanceChanged" => EventType::BalanceChanged,
            "FeeCharged" => EventType::FeeCharged,
            "FundingApplied" => EventType::FundingApplied,
            "InternalTransferRequested" => EventType::InternalTransferRequested,
            "InternalTransferCompleted" => EventType::InternalTransferCompleted,
            "InternalTransferFailed" => EventType::InternalTransferFailed,
            "DepositInitiated" => EventType::DepositInitiated,
            "DepositCompleted" => EventType::DepositCompleted,
            "WithdrawInitiated" => EventType::WithdrawInitiated,
            "WithdrawCompleted" => EventType::WithdrawCompleted,
            "WithdrawFailed" => EventType::WithdrawFailed,
            "DustConverted" => EventType::DustConverted,
            "ConvertExecuted" => EventType::ConvertExecuted,
            "DriftDetected" => EventType::DriftDetected,
            "ReconciliationPerformed" => EventType::ReconciliationPerformed,
            "QuarantineStarted" => EventType::QuarantineStarted,
            "QuarantineCompleted" => EventType::QuarantineCompleted,
            "InitialCapitalEstablished" => EventType::InitialCapitalEstablished,
            "OpeningBalanceAdjusted" => EventType::OpeningBalanceAdjusted,
            "StrategyLoaded" => EventType::StrategyLoaded,
            "StrategyStarted" => EventType::StrategyStarted,
            "StrategyStopped" => EventType::StrategyStopped,
            "StrategyError" => EventType::StrategyError,
            _ => return None,
        };
        Some(ty)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable event record.
///
/// `seq` is absent before persistence; the log assigns it on first insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub seq: Option<i64>,
    pub ts: DateTime<Utc>,
    pub event_type: EventType,
    pub source: EventSource,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub scope: Scope,
    pub correlation_id: String,
    pub causation_id: Option<String>,
    pub command_id: Option<String>,
    pub dedup_key: String,
    pub payload: Value,
}

impl Event {
    /// Create a new event with a fresh id and the current UTC instant.
    ///
    /// `correlation_id` defaults to a fresh uuid when not supplied.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        event_type: EventType,
        source: EventSource,
        entity_kind: EntityKind,
        entity_id: impl Into<String>,
        scope: Scope,
        dedup_key: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            seq: None,
            ts: Utc::now(),
            event_type,
            source,
            entity_kind,
            entity_id: entity_id.into(),
            scope,
            correlation_id: Uuid::new_v4().to_string(),
            causation_id: None,
            command_id: None,
            dedup_key: dedup_key.into(),
            payload,
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_causation(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    pub fn with_command(mut self, command_id: impl Into<String>) -> Self {
        self.command_id = Some(command_id.into());
        self
    }

    /// String payload field, if present and a string.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Decimal payload field. Monetary values travel as decimal strings;
    /// a bare JSON number is also accepted (parsed from its text form).
    pub fn payload_decimal(&self, key: &str) -> Option<Decimal> {
        match self.payload.get(key)? {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.to_string().parse().ok(),
            _ => None,
        }
    }

    /// Integer payload field (accepts a number or its string form).
    pub fn payload_i64(&self, key: &str) -> Option<i64> {
        match self.payload.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn payload_bool(&self, key: &str) -> Option<bool> {
        self.payload.get(key).and_then(Value::as_bool)
    }
}

/// Dedup-key constructors.
///
/// The grammars encode the identity of the real-world fact:
/// facts with an exchange-assigned id (trades, definitive order state
/// changes) key on that id; periodic snapshots embed a monotonic time
/// bucket; drift uses a minute bucket so flapping collapses.
pub mod dedup {
    use chrono::{DateTime, Utc};

    /// `exch:venue:sym:trade:<trade_id>` -- same key from WS and REST.
    pub fn trade_key(exchange: &str, venue: &str, symbol: &str, trade_id: &str) -> String {
        format!("{exchange}:{venue}:{symbol}:trade:{trade_id}")
    }

    /// `exch:venue:sym:order:<order_id>` -- definitive state transitions
    /// (placed / cancelled / rejected / WS updates).
    pub fn order_key(exchange: &str, venue: &str, symbol: &str, order_id: &str) -> String {
        format!("{exchange}:{venue}:{symbol}:order:{order_id}")
    }

    /// `exch:venue:sym:order:<order_id>:<status>:<snapshot_ms>` -- a REST
    /// poll is a point-in-time snapshot, not a state transition.
    pub fn order_snapshot_key(
        exchange: &str,
        venue: &str,
        symbol: &str,
        order_id: &str,
        status: &str,
        snapshot_ms: i64,
    ) -> String {
        format!("{exchange}:{venue}:{symbol}:order:{order_id}:{status}:{snapshot_ms}")
    }

    /// `exch:venue:acct:<asset>:balance:<ms>` -- `ms` is the exchange
    /// update time for WS events and the poll time for REST snapshots.
    pub fn balance_key(
        exchange: &str,
        venue: &str,
        account_id: &str,
        asset: &str,
        update_ms: i64,
    ) -> String {
        format!("{exchange}:{venue}:{account_id}:{asset}:balance:{update_ms}")
    }

    /// `exch:venue:sym:position:<ms>` -- position snapshots.
    pub fn position_key(exchange: &str, venue: &str, symbol: &str, update_ms: i64) -> String {
        format!("{exchange}:{venue}:{symbol}:position:{update_ms}")
    }

    /// `exch:venue:sym:funding:<income_time_ms>` -- funding settlements
    /// from the income history.
    pub fn funding_key(exchange: &str, venue: &str, symbol: &str, income_ms: i64) -> String {
        format!("{exchange}:{venue}:{symbol}:funding:{income_ms}")
    }

    /// `exch:venue:sym:<drift_kind>:<YYYY-MM-DDTHH:MM>` -- one persisted
    /// drift per kind per minute, however often the poll fires.
    pub fn drift_key(
        exchange: &str,
        venue: &str,
        symbol: &str,
        drift_kind: &str,
        at: DateTime<Utc>,
    ) -> String {
        let bucket = at.format("%Y-%m-%dT%H:%M");
        format!("{exchange}:{venue}:{symbol}:{drift_kind}:{bucket}")
    }
}
