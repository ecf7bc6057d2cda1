//! Event projector
//!
//! Pulls batches of events from the log starting at its checkpoint and
//! routes each to the projection handler registered for its type. The
//! checkpoint advances past successfully handled events and past events
//! with no handler; it never advances past a failed one, so a broken
//! handler halts that projection instead of silently skipping state.

mod balance;
mod order;
mod position;

pub use balance::BalanceProjectionHandler;
pub use order::OrderProjectionHandler;
pub use position::PositionProjectionHandler;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::events::{Event, EventType};
use crate::store::{CheckpointStore, EventStore, ProjectionStore, StoreResult};

/// Checkpoint name used by the projector.
pub const CHECKPOINT_NAME: &str = "projector";

const DEFAULT_BATCH_SIZE: i64 = 100;

/// A projection handler consumes one family of event types.
#[async_trait]
pub trait ProjectionHandler: Send + Sync {
    /// Event types this handler is registered for.
    fn handled_event_types(&self) -> &'static [EventType];

    /// Apply one event. An error leaves the checkpoint before the event.
    async fn handle(&self, event: &Event) -> StoreResult<()>;
}

pub struct Projector {
    event_store: EventStore,
    checkpoints: CheckpointStore,
    projections: ProjectionStore,
    handlers: HashMap<EventType, Arc<dyn ProjectionHandler>>,
    checkpoint_name: String,
}

impl Projector {
    /// Projector with the default balance / position / order handlers.
    pub fn new(
        event_store: EventStore,
        checkpoints: CheckpointStore,
        projections: ProjectionStore,
    ) -> Self {
        let mut projector = Self {
            event_store,
            checkpoints,
            projections: projections.clone(),
            handlers: HashMap::new(),
            checkpoint_name: CHECKPOINT_NAME.to_string(),
        };

        projector.register(Arc::new(BalanceProjectionHandler::new(projections.clone())));
        projector.register(Arc::new(PositionProjectionHandler::new(projections.clone())));
        projector.register(Arc::new(OrderProjectionHandler::new(projections)));
        projector
    }

    /// Register a handler for every type it declares. One handler per type;
    /// a second registration for the same type replaces the first.
    pub fn register(&mut self, handler: Arc<dyn ProjectionHandler>) {
        for event_type in handler.handled_event_types() {
            self.handlers.insert(*event_type, handler.clone());
        }
    }

    /// Apply up to `DEFAULT_BATCH_SIZE` pending events.
    ///
    /// Returns the number of events applied by a handler. Stops early (and
    /// leaves the checkpoint *before* the event) on the first handler
    /// failure.
    pub async fn apply_pending_events(&self) -> StoreResult<usize> {
        self.apply_batch(DEFAULT_BATCH_SIZE).await
    }

    pub async fn apply_batch(&self, batch_size: i64) -> StoreResult<usize> {
        let last_seq = self.checkpoints.get(&self.checkpoint_name).await?;
        let events = self.event_store.get_since(last_seq, batch_size).await?;

        if events.is_empty() {
            return Ok(0);
        }

        let mut applied = 0;
        let mut checkpoint = last_seq;

        for event in &events {
            let seq = event.seq.unwrap_or(checkpoint);

            if let Some(handler) = self.handlers.get(&event.event_type) {
                if let Err(err) = handler.handle(event).await {
                    tracing::error!(
                        event_id = %event.event_id,
                        event_type = %event.event_type,
                        seq,
                        error = %err,
                        "projection handler failed; checkpoint held"
                    );
                    break;
                }
                applied += 1;
            }
            // handler-miss still advances: the event is simply not projected
            checkpoint = seq;
        }

        if checkpoint > last_seq {
            self.checkpoints.set(&self.checkpoint_name, checkpoint).await?;
        }

        if applied > 0 {
            tracing::debug!(applied, checkpoint, "projection batch applied");
        }
        Ok(applied)
    }

    /// Drain every pending event.
    pub async fn apply_all_pending(&self) -> StoreResult<usize> {
        let mut total = 0;
        loop {
            let before = self.checkpoints.get(&self.checkpoint_name).await?;
            let applied = self.apply_pending_events().await?;
            let after = self.checkpoints.get(&self.checkpoint_name).await?;
            total += applied;
            // no checkpoint progress means drained (or stuck on a failure)
            if after == before {
                break;
            }
        }
        Ok(total)
    }

    /// Reset the checkpoint, truncate the projection tables and replay the
    /// whole log. Incremental application and a rebuild produce identical
    /// projection state.
    pub async fn rebuild(&self) -> StoreResult<usize> {
        tracing::info!("projection rebuild starting");
        self.checkpoints.set(&self.checkpoint_name, 0).await?;
        self.projections.clear_all().await?;
        let total = self.apply_all_pending().await?;
        tracing::info!(events = total, "projection rebuild completed");
        Ok(total)
    }

    pub fn projections(&self) -> &ProjectionStore {
        &self.projections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::events::dedup;
    use crate::types::{EntityKind, EventSource, Scope, TradingMode};
    use rust_decimal_macros::dec;
    use serde_json::json;

    async fn setup() -> (EventStore, Projector, Scope) {
        let db = Database::connect_in_memory().await.unwrap();
        db.init_core_schema().await.unwrap();
        let events = EventStore::new(db.pool().clone());
        let projector = Projector::new(
            events.clone(),
            CheckpointStore::new(db.pool().clone()),
            ProjectionStore::new(db.pool().clone()),
        );
        let scope = Scope::binance_futures("main", TradingMode::Testnet);
        (events, projector, scope)
    }

    fn balance_event(scope: &Scope, asset: &str, wallet: &str, avail: &str, ms: i64) -> Event {
        Event::create(
            EventType::BalanceChanged,
            EventSource::Websocket,
            EntityKind::Balance,
            asset,
            scope.clone(),
            dedup::balance_key(&scope.exchange, &scope.venue, &scope.account_id, asset, ms),
            json!({
                "asset": asset,
                "wallet_balance": wallet,
                "available_balance": avail,
            }),
        )
    }

    fn position_event(scope: &Scope, symbol: &str, amount: &str, ms: i64) -> Event {
        Event::create(
            EventType::PositionChanged,
            EventSource::Rest,
            EntityKind::Position,
            symbol,
            scope.with_symbol(symbol),
            dedup::position_key(&scope.exchange, &scope.venue, symbol, ms),
            json!({
                "symbol": symbol,
                "position_amount": amount,
                "entry_price": "0.5",
                "unrealized_pnl": "0",
                "leverage": 20,
                "margin_type": "CROSS",
            }),
        )
    }

    #[tokio::test]
    async fn test_balance_projection_applied() {
        let (events, projector, scope) = setup().await;

        events
            .append(&balance_event(&scope, "USDT", "1000", "990", 1))
            .await
            .unwrap();
        let applied = projector.apply_pending_events().await.unwrap();
        assert_eq!(applied, 1);

        let row = projector
            .projections()
            .get_balance(&scope, "USDT")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.free, dec!(990));
        assert_eq!(row.locked, dec!(10));
    }

    #[tokio::test]
    async fn test_handler_miss_advances_checkpoint() {
        let (events, projector, scope) = setup().await;

        // no handler is registered for engine lifecycle events
        let event = Event::create(
            EventType::EngineStarted,
            EventSource::Bot,
            EntityKind::Engine,
            "engine",
            scope.clone(),
            "BINANCE:FUTURES:engine:started:1",
            json!({}),
        );
        events.append(&event).await.unwrap();

        let applied = projector.apply_pending_events().await.unwrap();
        assert_eq!(applied, 0);

        // checkpoint moved past the unhandled event
        let next = projector.apply_pending_events().await.unwrap();
        assert_eq!(next, 0);
    }

    #[tokio::test]
    async fn test_rebuild_equivalence() {
        let (events, projector, scope) = setup().await;

        events
            .append(&balance_event(&scope, "USDT", "1000", "990", 1))
            .await
            .unwrap();
        events
            .append(&position_event(&scope, "XRPUSDT", "100", 2))
            .await
            .unwrap();
        events
            .append(&balance_event(&scope, "USDT", "800", "800", 3))
            .await
            .unwrap();
        events
            .append(&position_event(&scope, "XRPUSDT", "-40", 4))
            .await
            .unwrap();

        projector.apply_all_pending().await.unwrap();

        let incremental_balance = projector
            .projections()
            .get_balance(&scope, "USDT")
            .await
            .unwrap()
            .unwrap();
        let incremental_position = projector
            .projections()
            .get_position(&scope, "XRPUSDT")
            .await
            .unwrap()
            .unwrap();

        projector.rebuild().await.unwrap();

        let rebuilt_balance = projector
            .projections()
            .get_balance(&scope, "USDT")
            .await
            .unwrap()
            .unwrap();
        let rebuilt_position = projector
            .projections()
            .get_position(&scope, "XRPUSDT")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(incremental_balance, rebuilt_balance);
        assert_eq!(incremental_position, rebuilt_position);
        assert_eq!(rebuilt_position.side.as_deref(), Some("SHORT"));
        assert_eq!(rebuilt_position.qty, dec!(40));
    }

    #[tokio::test]
    async fn test_projection_seq_non_decreasing() {
        let (events, projector, scope) = setup().await;

        events
            .append(&balance_event(&scope, "USDT", "100", "100", 1))
            .await
            .unwrap();
        projector.apply_all_pending().await.unwrap();
        let first = projector
            .projections()
            .get_balance(&scope, "USDT")
            .await
            .unwrap()
            .unwrap();

        events
            .append(&balance_event(&scope, "USDT", "150", "150", 2))
            .await
            .unwrap();
        projector.apply_all_pending().await.unwrap();
        let second = projector
            .projections()
            .get_balance(&scope, "USDT")
            .await
            .unwrap()
            .unwrap();

        assert!(second.last_event_seq > first.last_event_seq);
    }
}
