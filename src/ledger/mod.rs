//! Double-entry ledger
//!
//! Every finance-affecting event becomes one balanced journal entry in a
//! common unit of account (USDT-equivalent). The store enforces the
//! balance invariant and maintains per-account running balances inside
//! the same transaction that persists the entry.

pub mod entry_builder;
pub mod pump;
pub mod schema;
pub mod store;
pub mod types;

pub use entry_builder::{JournalEntry, JournalEntryBuilder, JournalLine, UsdtRateSource};
pub use pump::LedgerPump;
pub use schema::init_ledger_schema;
pub use store::{LedgerError, LedgerStore, TrialBalanceRow};
pub use types::{AccountType, JournalSide, TransactionType};
