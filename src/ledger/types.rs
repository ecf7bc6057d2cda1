//! Double-entry ledger types
//!
//! Transaction classification, the four account types in use, debit/credit
//! sides, the seeded chart of accounts and the denylist of event types the
//! ledger ignores.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::events::EventType;

/// Transaction classification for journal entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Trade,
    Deposit,
    Withdrawal,
    InternalTransfer,
    FeeTrading,
    FeeFunding,
    FeeWithdrawal,
    FundingReceived,
    Rebate,
    Adjustment,
    Unknown,
    Other,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Trade => "TRADE",
            TransactionType::Deposit => "DEPOSIT",
            TransactionType::Withdrawal => "WITHDRAWAL",
            TransactionType::InternalTransfer => "INTERNAL_TRANSFER",
            TransactionType::FeeTrading => "FEE_TRADING",
            TransactionType::FeeFunding => "FEE_FUNDING",
            TransactionType::FeeWithdrawal => "FEE_WITHDRAWAL",
            TransactionType::FundingReceived => "FUNDING_RECEIVED",
            TransactionType::Rebate => "REBATE",
            TransactionType::Adjustment => "ADJUSTMENT",
            TransactionType::Unknown => "UNKNOWN",
            TransactionType::Other => "OTHER",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The four account types in use (liabilities are not modelled).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountType {
    Asset,
    Expense,
    Income,
    Equity,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Asset => "ASSET",
            AccountType::Expense => "EXPENSE",
            AccountType::Income => "INCOME",
            AccountType::Equity => "EQUITY",
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Debit or credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JournalSide {
    Debit,
    Credit,
}

impl JournalSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalSide::Debit => "DEBIT",
            JournalSide::Credit => "CREDIT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "DEBIT" => Some(JournalSide::Debit),
            "CREDIT" => Some(JournalSide::Credit),
            _ => None,
        }
    }
}

impl fmt::Display for JournalSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Venue segment of asset account ids.
pub mod venues {
    pub const BINANCE_SPOT: &str = "BINANCE_SPOT";
    pub const BINANCE_FUTURES: &str = "BINANCE_FUTURES";
    /// The outside world (deposit/withdrawal counterparty).
    pub const EXTERNAL: &str = "EXTERNAL";
    /// System accounts (fees, P&L, equity).
    pub const SYSTEM: &str = "SYSTEM";
}

/// Well-known system account ids.
pub mod accounts {
    pub const FEE_TRADING_TAKER: &str = "EXPENSE:FEE:TRADING:TAKER";
    pub const FEE_TRADING_MAKER: &str = "EXPENSE:FEE:TRADING:MAKER";
    pub const FEE_FUNDING_PAID: &str = "EXPENSE:FEE:FUNDING:PAID";
    pub const FEE_WITHDRAWAL: &str = "EXPENSE:FEE:WITHDRAWAL";
    pub const FEE_DUST_CONVERSION: &str = "EXPENSE:FEE:DUST_CONVERSION";
    pub const CONVERSION_LOSS: &str = "EXPENSE:CONVERSION_LOSS";
    pub const REALIZED_PNL: &str = "INCOME:TRADING:REALIZED_PNL";
    pub const FUNDING_RECEIVED: &str = "INCOME:FUNDING:RECEIVED";
    pub const REBATE: &str = "INCOME:REBATE";
    pub const CONVERSION_GAIN: &str = "INCOME:CONVERSION_GAIN";
    pub const INITIAL_CAPITAL: &str = "EQUITY:INITIAL_CAPITAL";
    pub const RETAINED_EARNINGS: &str = "EQUITY:RETAINED_EARNINGS";
    pub const SUSPENSE: &str = "EQUITY:SUSPENSE";
    pub const ADJUSTMENT: &str = "EQUITY:ADJUSTMENT";
    pub const OPENING_ADJUSTMENT: &str = "EQUITY:OPENING_ADJUSTMENT";

    /// `ASSET:<venue>:<asset>` convention for asset accounts.
    pub fn asset_account(venue: &str, asset: &str) -> String {
        format!("ASSET:{venue}:{asset}")
    }
}

/// Chart of accounts seeded at schema init.
/// `(account_id, account_type, venue, asset, name)`
pub const INITIAL_ACCOUNTS: &[(&str, &str, &str, Option<&str>, &str)] = &[
    // ASSET -- BINANCE_SPOT
    ("ASSET:BINANCE_SPOT:USDT", "ASSET", "BINANCE_SPOT", Some("USDT"), "Binance Spot USDT"),
    ("ASSET:BINANCE_SPOT:BTC", "ASSET", "BINANCE_SPOT", Some("BTC"), "Binance Spot BTC"),
    ("ASSET:BINANCE_SPOT:BNB", "ASSET", "BINANCE_SPOT", Some("BNB"), "Binance Spot BNB"),
    // ASSET -- BINANCE_FUTURES
    ("ASSET:BINANCE_FUTURES:USDT", "ASSET", "BINANCE_FUTURES", Some("USDT"), "Binance Futures USDT"),
    ("ASSET:BINANCE_FUTURES:BNB", "ASSET", "BINANCE_FUTURES", Some("BNB"), "Binance Futures BNB"),
    // ASSET -- EXTERNAL
    ("ASSET:EXTERNAL:USDT", "ASSET", "EXTERNAL", Some("USDT"), "External USDT"),
    // EXPENSE
    ("EXPENSE:FEE:TRADING:TAKER", "EXPENSE", "SYSTEM", None, "Taker Fee"),
    ("EXPENSE:FEE:TRADING:MAKER", "EXPENSE", "SYSTEM", None, "Maker Fee"),
    ("EXPENSE:FEE:FUNDING:PAID", "EXPENSE", "SYSTEM", None, "Funding Fee Paid"),
    ("EXPENSE:FEE:WITHDRAWAL", "EXPENSE", "SYSTEM", None, "Withdrawal Fee"),
    ("EXPENSE:FEE:DUST_CONVERSION", "EXPENSE", "SYSTEM", None, "Dust Conversion Fee"),
    ("EXPENSE:CONVERSION_LOSS", "EXPENSE", "SYSTEM", None, "Conversion Loss"),
    // INCOME
    ("INCOME:TRADING:REALIZED_PNL", "INCOME", "SYSTEM", None, "Realized PnL"),
    ("INCOME:FUNDING:RECEIVED", "INCOME", "SYSTEM", None, "Funding Fee Received"),
    ("INCOME:REBATE", "INCOME", "SYSTEM", None, "Trading Rebate"),
    ("INCOME:CONVERSION_GAIN", "INCOME", "SYSTEM", None, "Conversion Gain"),
    // EQUITY
    ("EQUITY:INITIAL_CAPITAL", "EQUITY", "SYSTEM", None, "Initial Capital"),
    ("EQUITY:RETAINED_EARNINGS", "EQUITY", "SYSTEM", None, "Retained Earnings"),
    ("EQUITY:SUSPENSE", "EQUITY", "SYSTEM", None, "Suspense Account"),
    ("EQUITY:ADJUSTMENT", "EQUITY", "SYSTEM", None, "Adjustment Account"),
    ("EQUITY:OPENING_ADJUSTMENT", "EQUITY", "SYSTEM", None, "Opening Balance Adjustment"),
];

/// Event types the ledger skips silently: state plumbing, never money.
pub fn is_non_financial(event_type: EventType) -> bool {
    matches!(
        event_type,
        EventType::EngineStarted
            | EventType::EngineStopped
            | EventType::EnginePaused
            | EventType::EngineResumed
            | EventType::EngineModeChanged
            | EventType::ManualOverrideExecuted
            | EventType::RiskGuardRejected
            | EventType::ConfigChanged
            | EventType::WebSocketConnected
            | EventType::WebSocketDisconnected
            | EventType::WebSocketReconnected
            | EventType::OrderPlaced
            | EventType::OrderRejected
            | EventType::OrderCancelled
            | EventType::OrderUpdated
            | EventType::PositionChanged
            | EventType::DriftDetected
            | EventType::ReconciliationPerformed
            | EventType::QuarantineStarted
            | EventType::QuarantineCompleted
            | EventType::StrategyLoaded
            | EventType::StrategyStarted
            | EventType::StrategyStopped
            | EventType::StrategyError
            | EventType::InternalTransferRequested
            | EventType::InternalTransferFailed
            | EventType::DepositInitiated
            | EventType::WithdrawInitiated
            | EventType::WithdrawFailed
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_account_convention() {
        assert_eq!(
            accounts::asset_account(venues::BINANCE_FUTURES, "USDT"),
            "ASSET:BINANCE_FUTURES:USDT"
        );
    }

    #[test]
    fn test_non_financial_classification() {
        assert!(is_non_financial(EventType::OrderPlaced));
        assert!(is_non_financial(EventType::DriftDetected));
        assert!(is_non_financial(EventType::EngineStarted));

        assert!(!is_non_financial(EventType::TradeExecuted));
        assert!(!is_non_financial(EventType::FundingApplied));
        assert!(!is_non_financial(EventType::BalanceChanged));
        assert!(!is_non_financial(EventType::DustConverted));
        assert!(!is_non_financial(EventType::InitialCapitalEstablished));
    }

    #[test]
    fn test_initial_accounts_ids_follow_convention() {
        for (account_id, account_type, _, _, _) in INITIAL_ACCOUNTS {
            assert!(
                account_id.starts_with(account_type),
                "{account_id} must start with {account_type}"
            );
        }
    }

    #[test]
    fn test_journal_side_roundtrip() {
        assert_eq!(JournalSide::from_str("DEBIT"), Some(JournalSide::Debit));
        assert_eq!(JournalSide::from_str("CREDIT"), Some(JournalSide::Credit));
        assert_eq!(JournalSide::from_str("debit"), None);
    }
}
