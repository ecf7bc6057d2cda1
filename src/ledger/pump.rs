//! Ledger pump
//!
//! Checkpointed consumer that feeds the entry builder from the event log
//! and persists what it produces. Runs independently of the projector
//! under its own checkpoint, applying events in seq order at most once.
//!
//! A build or save failure stops the batch without advancing past the
//! offending event: an unbalanced entry means the builder is buggy and
//! must be investigated, not skipped.

use std::time::Duration;
use tokio::sync::watch;

use super::entry_builder::JournalEntryBuilder;
use super::store::{LedgerError, LedgerStore};
use crate::store::{CheckpointStore, EventStore};

/// Checkpoint name used by the ledger pump.
pub const CHECKPOINT_NAME: &str = "ledger";

const DEFAULT_BATCH_SIZE: i64 = 100;

pub struct LedgerPump {
    event_store: EventStore,
    checkpoints: CheckpointStore,
    builder: JournalEntryBuilder,
    ledger_store: LedgerStore,
    poll_interval: Duration,
}

impl LedgerPump {
    pub fn new(
        event_store: EventStore,
        checkpoints: CheckpointStore,
        builder: JournalEntryBuilder,
        ledger_store: LedgerStore,
        poll_interval: Duration,
    ) -> Self {
        Self {
            event_store,
            checkpoints,
            builder,
            ledger_store,
            poll_interval,
        }
    }

    pub fn builder(&self) -> &JournalEntryBuilder {
        &self.builder
    }

    /// Apply one batch of pending events. Returns the number of journal
    /// entries persisted.
    pub async fn apply_pending_events(&self) -> Result<usize, LedgerError> {
        let last_seq = self.checkpoints.get(CHECKPOINT_NAME).await?;
        let events = self
            .event_store
            .get_since(last_seq, DEFAULT_BATCH_SIZE)
            .await?;
        if events.is_empty() {
            return Ok(0);
        }

        let mut saved = 0;
        let mut checkpoint = last_seq;

        for event in &events {
            let seq = event.seq.unwrap_or(checkpoint);

            let entry = match self.builder.from_event(event).await {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::error!(
                        event_id = %event.event_id,
                        event_type = %event.event_type,
                        seq,
                        error = %err,
                        "entry build failed; checkpoint held"
                    );
                    break;
                }
            };

            if let Some(entry) = entry {
                if let Err(err) = self.ledger_store.save_entry(&entry).await {
                    tracing::error!(
                        event_id = %event.event_id,
                        entry_id = %entry.entry_id,
                        seq,
                        error = %err,
                        "entry save failed; checkpoint held"
                    );
                    break;
                }
                saved += 1;
            }

            checkpoint = seq;
        }

        if checkpoint > last_seq {
            self.checkpoints.set(CHECKPOINT_NAME, checkpoint).await?;
        }

        if saved > 0 {
            tracing::debug!(saved, checkpoint, "ledger batch applied");
        }
        Ok(saved)
    }

    /// Drain everything currently pending.
    pub async fn apply_all_pending(&self) -> Result<usize, LedgerError> {
        let mut total = 0;
        loop {
            let before = self.checkpoints.get(CHECKPOINT_NAME).await?;
            total += self.apply_pending_events().await?;
            let after = self.checkpoints.get(CHECKPOINT_NAME).await?;
            if after == before {
                break;
            }
        }
        Ok(total)
    }

    /// Pump loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("ledger pump started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {
                    if let Err(err) = self.apply_pending_events().await {
                        tracing::error!(error = %err, "ledger pump iteration failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("ledger pump stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::events::{dedup, Event, EventType};
    use crate::ledger::entry_builder::UsdtRateSource;
    use crate::ledger::schema::init_ledger_schema;
    use crate::types::{EntityKind, EventSource, Scope, TradingMode};
    use rust_decimal_macros::dec;
    use serde_json::json;

    async fn setup() -> (EventStore, LedgerPump) {
        let db = Database::connect_in_memory().await.unwrap();
        db.init_core_schema().await.unwrap();
        init_ledger_schema(db.pool()).await.unwrap();

        let event_store = EventStore::new(db.pool().clone());
        let ledger_store = LedgerStore::new(db.pool().clone());
        let builder =
            JournalEntryBuilder::new(ledger_store.clone(), UsdtRateSource::new(None));
        let pump = LedgerPump::new(
            event_store.clone(),
            CheckpointStore::new(db.pool().clone()),
            builder,
            ledger_store,
            Duration::from_millis(100),
        );
        (event_store, pump)
    }

    fn trade(trade_id: &str, realized_pnl: &str) -> Event {
        let scope =
            Scope::binance_futures("main", TradingMode::Testnet).with_symbol("XRPUSDT");
        Event::create(
            EventType::TradeExecuted,
            EventSource::Websocket,
            EntityKind::Trade,
            trade_id,
            scope,
            dedup::trade_key("BINANCE", "FUTURES", "XRPUSDT", trade_id),
            json!({
                "exchange_trade_id": trade_id,
                "symbol": "XRPUSDT",
                "side": "BUY",
                "qty": "100",
                "price": "0.5",
                "commission": "0.02",
                "commission_asset": "USDT",
                "realized_pnl": realized_pnl,
            }),
        )
    }

    #[tokio::test]
    async fn test_pump_builds_entries_at_most_once() {
        let (event_store, pump) = setup().await;

        event_store.append(&trade("T1", "0")).await.unwrap();
        event_store.append(&trade("T2", "1.5")).await.unwrap();

        let saved = pump.apply_all_pending().await.unwrap();
        assert_eq!(saved, 2);

        // replaying with the same checkpoint produces nothing new
        let saved = pump.apply_all_pending().await.unwrap();
        assert_eq!(saved, 0);

        let trades = pump
            .ledger_store
            .get_entries_by_type("TRADE", "testnet", 10)
            .await
            .unwrap();
        assert_eq!(trades.len(), 2);
    }

    #[tokio::test]
    async fn test_pump_skips_non_financial_but_advances() {
        let (event_store, pump) = setup().await;

        let scope = Scope::binance_futures("main", TradingMode::Testnet);
        let lifecycle = Event::create(
            EventType::EngineStarted,
            EventSource::Bot,
            EntityKind::Engine,
            "engine",
            scope,
            "BINANCE:FUTURES:engine:1",
            json!({}),
        );
        event_store.append(&lifecycle).await.unwrap();
        event_store.append(&trade("T1", "0")).await.unwrap();

        let saved = pump.apply_all_pending().await.unwrap();
        assert_eq!(saved, 1);
        assert_eq!(pump.checkpoints.get(CHECKPOINT_NAME).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_pump_conserves_trial_balance() {
        let (event_store, pump) = setup().await;

        event_store.append(&trade("T1", "0")).await.unwrap();
        event_store.append(&trade("T2", "-2.5")).await.unwrap();
        pump.apply_all_pending().await.unwrap();

        let total = pump
            .ledger_store
            .trial_balance_total("testnet")
            .await
            .unwrap();
        assert_eq!(total, dec!(0));
    }
}
