//! Engine orchestration
//!
//! Wires the adapters, stores and pumps together, owns the engine state
//! machine and the shutdown signal, and gates order execution: RUNNING
//! trades freely, SAFE permits only position-reducing orders, PAUSED
//! refuses. Rejected commands are themselves recorded as events.
//!
//! Startup order matters: restore the ledger epoch, establish initial
//! capital if this is the first run, full-reconcile the exchange state,
//! catch the projections and the ledger up, then go RUNNING and spawn
//! the long-lived tasks.

use serde_json::json;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::db::Database;
use crate::events::{dedup, Event, EventType};
use crate::exchange::{
    BinanceWsClient, ExchangeApi, Order, OrderError, OrderRequest, WsMessageHandler,
};
use crate::ledger::{
    init_ledger_schema, JournalEntryBuilder, LedgerError, LedgerPump, LedgerStore, UsdtRateSource,
};
use crate::projector::Projector;
use crate::reconciler::HybridReconciler;
use crate::state_machine::{engine_machine, EngineState, StateMachine, StateMachineError};
use crate::store::{CheckpointStore, EventStore, ProjectionStore, StoreError};
use crate::types::{EntityKind, EventSource, Scope};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is {state}: {reason}")]
    NotTradable { state: String, reason: String },

    #[error(transparent)]
    State(#[from] StateMachineError),

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub struct Engine {
    config: AppConfig,
    scope: Scope,
    exchange: Arc<dyn ExchangeApi>,
    event_store: EventStore,
    projections: ProjectionStore,
    projector: Arc<Projector>,
    reconciler: Arc<HybridReconciler>,
    ledger_pump: Arc<LedgerPump>,
    ledger_store: LedgerStore,
    ws_client: Arc<BinanceWsClient>,
    state: Mutex<StateMachine<EngineState>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Engine {
    /// Build the whole component graph over one database.
    pub async fn new(
        database: &Database,
        exchange: Arc<dyn ExchangeApi>,
        config: AppConfig,
    ) -> Result<Self, EngineError> {
        database.init_core_schema().await.map_err(StoreError::from)?;
        init_ledger_schema(database.pool()).await?;

        let pool = database.pool().clone();
        let scope = config.scope();
        let event_store = EventStore::new(pool.clone());
        let checkpoints = CheckpointStore::new(pool.clone());
        let projections = ProjectionStore::new(pool.clone());
        let ledger_store = LedgerStore::new(pool);

        let projector = Arc::new(Projector::new(
            event_store.clone(),
            checkpoints.clone(),
            projections.clone(),
        ));

        let handler = Arc::new(WsMessageHandler::new(
            event_store.clone(),
            scope.clone(),
            Some(config.symbol.clone()),
        ));
        let (ws_client, ws_state_rx) =
            BinanceWsClient::new(config.ws_base_url.clone(), exchange.clone(), handler);

        let reconciler = Arc::new(
            HybridReconciler::new(
                exchange.clone(),
                event_store.clone(),
                scope.clone(),
                config.symbol.clone(),
                config.reconciler_config(),
                ws_state_rx,
            )
            .with_projections(projections.clone()),
        );

        let builder = JournalEntryBuilder::new(
            ledger_store.clone(),
            UsdtRateSource::new(Some(exchange.clone())),
        );
        let ledger_pump = Arc::new(LedgerPump::new(
            event_store.clone(),
            checkpoints,
            builder,
            ledger_store.clone(),
            Duration::from_secs(config.ledger_poll_secs),
        ));

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            scope,
            exchange,
            event_store,
            projections,
            projector,
            reconciler,
            ledger_pump,
            ledger_store,
            ws_client: Arc::new(ws_client),
            state: Mutex::new(engine_machine()),
            shutdown_tx,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state.lock().expect("engine state lock poisoned").state()
    }

    pub fn event_store(&self) -> &EventStore {
        &self.event_store
    }

    pub fn projections(&self) -> &ProjectionStore {
        &self.projections
    }

    pub fn projector(&self) -> &Projector {
        &self.projector
    }

    pub fn ledger_store(&self) -> &LedgerStore {
        &self.ledger_store
    }

    pub fn reconciler(&self) -> &HybridReconciler {
        &self.reconciler
    }

    pub fn ledger_pump(&self) -> &LedgerPump {
        &self.ledger_pump
    }

    /// Boot sequence, then spawn the long-lived tasks. The returned
    /// handles complete after [`Engine::shutdown`].
    pub async fn start(&self) -> Result<Vec<JoinHandle<()>>, EngineError> {
        self.restore_epoch().await?;
        self.establish_initial_capital().await?;

        self.reconciler.full_reconcile().await;
        self.projector.apply_all_pending().await?;
        self.ledger_pump.apply_all_pending().await?;

        self.transition(EngineState::Running, EventType::EngineStarted)?;

        let mut handles = Vec::new();

        let ws = self.ws_client.clone();
        let shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move { ws.run(shutdown).await }));

        let reconciler = self.reconciler.clone();
        let shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move { reconciler.run(shutdown).await }));

        let projector = self.projector.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let poll = Duration::from_millis(self.config.projector_poll_millis);
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(poll) => {
                        if let Err(err) = projector.apply_pending_events().await {
                            tracing::error!(error = %err, "projector iteration failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("projector stopped");
        }));

        let pump = self.ledger_pump.clone();
        let shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move { pump.run(shutdown).await }));

        tracing::info!(symbol = %self.config.symbol, mode = %self.scope.mode, "engine running");
        Ok(handles)
    }

    /// Cooperative shutdown: every task stops at its next suspension
    /// point; in-flight journal entries roll back with their transaction.
    pub async fn shutdown(&self) {
        self.append_lifecycle_event(EventType::EngineStopped).await;
        let _ = self.shutdown_tx.send(true);
        tracing::info!("engine shutdown requested");
    }

    pub async fn pause(&self) -> Result<(), EngineError> {
        self.transition(EngineState::Paused, EventType::EnginePaused)
    }

    pub async fn resume(&self) -> Result<(), EngineError> {
        self.transition(EngineState::Running, EventType::EngineResumed)
    }

    /// SAFE mode: only position-reducing actions until resumed.
    pub async fn enter_safe_mode(&self) -> Result<(), EngineError> {
        self.transition(EngineState::Safe, EventType::EngineModeChanged)
    }

    fn transition(&self, to: EngineState, event_type: EventType) -> Result<(), EngineError> {
        self.state
            .lock()
            .expect("engine state lock poisoned")
            .transition(to)?;
        // record the transition; a dedup collision here is impossible
        // (millisecond key), a store failure only loses the audit row
        let event = self.lifecycle_event(event_type);
        let store = self.event_store.clone();
        tokio::spawn(async move {
            if let Err(err) = store.append(&event).await {
                tracing::error!(error = %err, "failed to record lifecycle event");
            }
        });
        Ok(())
    }

    fn lifecycle_event(&self, event_type: EventType) -> Event {
        let now_ms = chrono::Utc::now().timestamp_millis();
        Event::create(
            event_type,
            EventSource::Bot,
            EntityKind::Engine,
            "engine",
            self.scope.clone(),
            format!(
                "{}:{}:{}:engine:{}:{}",
                self.scope.exchange,
                self.scope.venue,
                self.scope.account_id,
                event_type.as_str(),
                now_ms
            ),
            json!({ "state": self.state().as_str() }),
        )
    }

    async fn append_lifecycle_event(&self, event_type: EventType) {
        let event = self.lifecycle_event(event_type);
        if let Err(err) = self.event_store.append(&event).await {
            tracing::error!(error = %err, "failed to record lifecycle event");
        }
    }

    /// Place an order through the engine's risk gate.
    pub async fn execute_order(&self, request: OrderRequest) -> Result<Order, EngineError> {
        let state = self.state();
        let allowed = match state {
            EngineState::Running => true,
            EngineState::Safe => request.reduce_only,
            _ => false,
        };

        if !allowed {
            let reason = if state == EngineState::Safe {
                "SAFE mode permits only position-reducing orders"
            } else {
                "engine is not accepting orders"
            };
            let now_ms = chrono::Utc::now().timestamp_millis();
            let event = Event::create(
                EventType::RiskGuardRejected,
                EventSource::Bot,
                EntityKind::Order,
                request.client_order_id.as_deref().unwrap_or("unassigned"),
                self.scope.with_symbol(request.symbol.clone()),
                format!(
                    "{}:{}:{}:risk-rejected:{}",
                    self.scope.exchange, self.scope.venue, request.symbol, now_ms
                ),
                json!({
                    "symbol": request.symbol,
                    "side": request.side.as_str(),
                    "qty": request.quantity.to_string(),
                    "reduce_only": request.reduce_only,
                    "engine_state": state.as_str(),
                    "reason": reason,
                }),
            );
            if let Err(err) = self.event_store.append(&event).await {
                tracing::error!(error = %err, "failed to record risk rejection");
            }
            return Err(EngineError::NotTradable {
                state: state.as_str().to_string(),
                reason: reason.to_string(),
            });
        }

        match self.exchange.place_order(&request).await {
            Ok(order) => {
                let event = Event::create(
                    EventType::OrderPlaced,
                    EventSource::Bot,
                    EntityKind::Order,
                    &order.order_id,
                    self.scope.with_symbol(order.symbol.clone()),
                    dedup::order_key(
                        &self.scope.exchange,
                        &self.scope.venue,
                        &order.symbol,
                        &order.order_id,
                    ),
                    json!({
                        "exchange_order_id": order.order_id,
                        "client_order_id": order.client_order_id,
                        "symbol": order.symbol,
                        "side": order.side,
                        "order_type": order.order_type,
                        "order_status": order.status,
                        "original_qty": order.original_qty.to_string(),
                        "executed_qty": order.executed_qty.to_string(),
                        "price": order.price.map(|p| p.to_string()),
                        "stop_price": order.stop_price.map(|p| p.to_string()),
                        "reduce_only": order.reduce_only,
                    }),
                );
                self.event_store.append(&event).await?;
                Ok(order)
            }
            Err(err) => {
                let order_error: OrderError = err.into();
                let now_ms = chrono::Utc::now().timestamp_millis();
                let event = Event::create(
                    EventType::OrderRejected,
                    EventSource::Bot,
                    EntityKind::Order,
                    request.client_order_id.as_deref().unwrap_or("unassigned"),
                    self.scope.with_symbol(request.symbol.clone()),
                    format!(
                        "{}:{}:{}:order:rejected:{}",
                        self.scope.exchange, self.scope.venue, request.symbol, now_ms
                    ),
                    json!({
                        "symbol": request.symbol,
                        "side": request.side.as_str(),
                        "qty": request.quantity.to_string(),
                        "client_order_id": request.client_order_id,
                        "error_code": order_error.code,
                        "error_message": order_error.message,
                    }),
                );
                if let Err(store_err) = self.event_store.append(&event).await {
                    tracing::error!(error = %store_err, "failed to record order rejection");
                }
                Err(order_error.into())
            }
        }
    }

    /// Restore the ledger epoch from a previously recorded
    /// `InitialCapitalEstablished` event.
    async fn restore_epoch(&self) -> Result<(), EngineError> {
        let events = self
            .event_store
            .get_by_type(EventType::InitialCapitalEstablished, 1)
            .await?;
        if let Some(event) = events.first() {
            self.ledger_pump.builder().set_epoch_date(event.ts);
        }
        Ok(())
    }

    /// First-run bootstrap: snapshot the account and record the capital
    /// the ledger starts from. Idempotent across restarts (the event
    /// already exists afterwards).
    async fn establish_initial_capital(&self) -> Result<(), EngineError> {
        let existing = self
            .event_store
            .get_by_type(EventType::InitialCapitalEstablished, 1)
            .await?;
        if !existing.is_empty() {
            return Ok(());
        }

        let futures_balances = match self.exchange.get_balances().await {
            Ok(balances) => balances,
            Err(err) => {
                tracing::error!(error = %err, "initial capital: balance fetch failed");
                return Ok(());
            }
        };
        let spot_balances = match self.exchange.get_spot_balances().await {
            Ok(balances) => balances,
            Err(err) => {
                tracing::warn!(error = %err, "initial capital: spot balances unavailable");
                Vec::new()
            }
        };

        let snapshot_date = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let futures_assets: Vec<_> = futures_balances
            .iter()
            .map(|balance| {
                json!({
                    "asset": balance.asset,
                    "walletBalance": balance.wallet_balance.to_string(),
                    "marginBalance": balance.total().to_string(),
                })
            })
            .collect();
        let spot: Vec<_> = spot_balances
            .iter()
            .map(|balance| {
                json!({
                    "asset": balance.asset,
                    "free": balance.free.to_string(),
                    "locked": balance.locked.to_string(),
                })
            })
            .collect();

        let event = Event::create(
            EventType::InitialCapitalEstablished,
            EventSource::Bot,
            EntityKind::Capital,
            "initial-capital",
            self.scope.clone(),
            format!(
                "{}:{}:{}:initial-capital:{}",
                self.scope.exchange, self.scope.venue, self.scope.account_id, snapshot_date
            ),
            json!({
                "snapshot_date": snapshot_date,
                "spot_balances": spot,
                "futures_assets": futures_assets,
            }),
        );

        if self.event_store.append(&event).await? {
            tracing::info!(snapshot_date, "initial capital established");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Balance, MockExchangeClient};
    use crate::ledger::types::accounts;
    use crate::types::OrderSide;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    async fn engine() -> (Engine, Arc<MockExchangeClient>) {
        let database = Database::connect_in_memory().await.unwrap();
        let mock = Arc::new(MockExchangeClient::new());
        let engine = Engine::new(&database, mock.clone(), AppConfig::default())
            .await
            .unwrap();
        (engine, mock)
    }

    #[tokio::test]
    async fn test_boot_establishes_initial_capital() {
        let (engine, mock) = engine().await;
        mock.set_balance(Balance {
            asset: "USDT".into(),
            wallet_balance: dec!(673.5),
            available_balance: dec!(673.5),
            cross_wallet_balance: dec!(673.5),
            unrealized_pnl: Decimal::ZERO,
        })
        .await;

        let handles = engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Running);

        let capital = engine
            .ledger_store()
            .get_account_balance(accounts::INITIAL_CAPITAL, "testnet")
            .await
            .unwrap();
        assert_eq!(capital, dec!(-673.5)); // credit-normal equity
        assert!(engine.ledger_pump().builder().epoch_date().is_some());

        engine.shutdown().await;
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_boot_is_idempotent_across_restarts() {
        let database = Database::connect_in_memory().await.unwrap();
        let mock = Arc::new(MockExchangeClient::new());
        mock.set_balance(Balance {
            asset: "USDT".into(),
            wallet_balance: dec!(100),
            available_balance: dec!(100),
            cross_wallet_balance: dec!(100),
            unrealized_pnl: Decimal::ZERO,
        })
        .await;

        let engine = Engine::new(&database, mock.clone(), AppConfig::default())
            .await
            .unwrap();
        let handles = engine.start().await.unwrap();
        engine.shutdown().await;
        for handle in handles {
            handle.await.unwrap();
        }

        // second boot over the same database: no duplicate capital
        let engine = Engine::new(&database, mock.clone(), AppConfig::default())
            .await
            .unwrap();
        let handles = engine.start().await.unwrap();

        let events = engine
            .event_store()
            .get_by_type(EventType::InitialCapitalEstablished, 10)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        let capital = engine
            .ledger_store()
            .get_account_balance(accounts::INITIAL_CAPITAL, "testnet")
            .await
            .unwrap();
        assert_eq!(capital, dec!(-100));

        engine.shutdown().await;
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_safe_mode_gates_orders() {
        let (engine, _mock) = engine().await;
        let handles = engine.start().await.unwrap();

        engine.enter_safe_mode().await.unwrap();

        // opening order refused
        let open = OrderRequest::market("XRPUSDT", OrderSide::Buy, dec!(10));
        let err = engine.execute_order(open).await.unwrap_err();
        assert!(matches!(err, EngineError::NotTradable { .. }));

        // reducing order allowed
        let reduce = OrderRequest::market("XRPUSDT", OrderSide::Sell, dec!(10)).reduce_only();
        engine.execute_order(reduce).await.unwrap();

        let rejections = engine
            .event_store()
            .get_by_type(EventType::RiskGuardRejected, 10)
            .await
            .unwrap();
        assert_eq!(rejections.len(), 1);

        engine.shutdown().await;
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_paused_engine_rejects_and_resumes() {
        let (engine, _mock) = engine().await;
        let handles = engine.start().await.unwrap();

        engine.pause().await.unwrap();
        let request = OrderRequest::market("XRPUSDT", OrderSide::Buy, dec!(1));
        assert!(engine.execute_order(request.clone()).await.is_err());

        engine.resume().await.unwrap();
        engine.execute_order(request).await.unwrap();

        let placed = engine
            .event_store()
            .get_by_type(EventType::OrderPlaced, 10)
            .await
            .unwrap();
        assert_eq!(placed.len(), 1);

        engine.shutdown().await;
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
