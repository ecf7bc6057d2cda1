//! Hybrid reconciler
//!
//! REST polling alongside the WebSocket stream. While the socket is
//! healthy the reconciler verifies at a relaxed cadence; when it degrades
//! the reconciler becomes the primary ingest path at a fast cadence.
//! Everything it observes is appended as events -- deduplication makes
//! the overlap with the WebSocket harmless.
//!
//! A tick that fails is logged and swallowed; the next tick retries.

pub mod drift;

pub use drift::{DriftDetector, DriftInfo};

use serde_json::json;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::events::{dedup, Event, EventType};
use crate::exchange::{Balance, ExchangeApi, Order, Position, Trade};
use crate::state_machine::WebSocketState;
use crate::store::{EventStore, ProjectionStore, StoreError};
use crate::types::{EntityKind, EventSource, Scope};

/// Poll cadence per WebSocket health.
#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    /// Cadence while the WebSocket is CONNECTED.
    pub normal_interval: Duration,
    /// Cadence while it is degraded.
    pub fallback_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            normal_interval: Duration::from_secs(30),
            fallback_interval: Duration::from_secs(5),
        }
    }
}

pub struct HybridReconciler {
    exchange: Arc<dyn ExchangeApi>,
    event_store: EventStore,
    scope: Scope,
    symbol: String,
    config: ReconcilerConfig,
    drift_detector: DriftDetector,
    /// Wired by the engine; without it drift checks are skipped.
    projections: Option<ProjectionStore>,
    ws_state: watch::Receiver<WebSocketState>,
    /// Highest observed trade time (epoch ms); ticks fetch past it.
    last_trade_time: AtomicI64,
    reconcile_count: AtomicU64,
    drift_count: AtomicU64,
    event_count: AtomicU64,
}

impl HybridReconciler {
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        event_store: EventStore,
        scope: Scope,
        symbol: impl Into<String>,
        config: ReconcilerConfig,
        ws_state: watch::Receiver<WebSocketState>,
    ) -> Self {
        Self {
            drift_detector: DriftDetector::new(scope.clone()),
            exchange,
            event_store,
            scope,
            symbol: symbol.into(),
            config,
            projections: None,
            ws_state,
            last_trade_time: AtomicI64::new(0),
            reconcile_count: AtomicU64::new(0),
            drift_count: AtomicU64::new(0),
            event_count: AtomicU64::new(0),
        }
    }

    /// Wire the projection reader used for drift detection.
    pub fn with_projections(mut self, projections: ProjectionStore) -> Self {
        self.projections = Some(projections);
        self
    }

    /// Current poll interval, derived from the observed WebSocket state.
    pub fn poll_interval(&self) -> Duration {
        if self.ws_state.borrow().is_connected() {
            self.config.normal_interval
        } else {
            self.config.fallback_interval
        }
    }

    pub fn reconcile_count(&self) -> u64 {
        self.reconcile_count.load(Ordering::Relaxed)
    }

    pub fn drift_count(&self) -> u64 {
        self.drift_count.load(Ordering::Relaxed)
    }

    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }

    /// Poll loop. The cadence is re-evaluated every cycle, so a WebSocket
    /// state change takes effect within one tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(symbol = %self.symbol, "reconciler started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval()) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("reconciler stopped");
    }

    /// One reconcile pass. Never propagates errors.
    pub async fn tick(&self) -> usize {
        let count = self.reconcile_count.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(tick = count, "reconcile tick");

        let mut appended = 0;

        match self.reconcile_trades().await {
            Ok(events) => appended += events,
            Err(err) => tracing::error!(error = %err, "trade reconcile failed"),
        }

        if self.projections.is_some() {
            match self.check_position_drift().await {
                Ok(events) => appended += events,
                Err(err) => tracing::error!(error = %err, "position drift check failed"),
            }
            match self.check_balance_drift().await {
                Ok(events) => appended += events,
                Err(err) => tracing::error!(error = %err, "balance drift check failed"),
            }
            match self.check_order_drift().await {
                Ok(events) => appended += events,
                Err(err) => tracing::error!(error = %err, "order drift check failed"),
            }
        }

        appended
    }

    /// Full reconcile: historical trades, open orders, the active
    /// position, all balances, and funding income. Executed at startup and
    /// whenever a rebuild-grade recovery is needed.
    pub async fn full_reconcile(&self) -> usize {
        tracing::info!("full reconcile starting");
        let mut appended = 0;

        match self.sync_trades().await {
            Ok(events) => appended += events,
            Err(err) => tracing::error!(error = %err, "trade sync failed"),
        }
        match self.sync_open_orders().await {
            Ok(events) => appended += events,
            Err(err) => tracing::error!(error = %err, "order sync failed"),
        }
        match self.sync_position().await {
            Ok(events) => appended += events,
            Err(err) => tracing::error!(error = %err, "position sync failed"),
        }
        match self.sync_balances().await {
            Ok(events) => appended += events,
            Err(err) => tracing::error!(error = %err, "balance sync failed"),
        }
        match self.sync_funding().await {
            Ok(events) => appended += events,
            Err(err) => tracing::error!(error = %err, "funding sync failed"),
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let marker = Event::create(
            EventType::ReconciliationPerformed,
            EventSource::Bot,
            EntityKind::Reconciler,
            &self.symbol,
            self.scope.with_symbol(&*self.symbol),
            format!(
                "{}:{}:{}:reconcile:{}",
                self.scope.exchange, self.scope.venue, self.symbol, now_ms
            ),
            json!({ "events_appended": appended }),
        );
        if let Err(err) = self.event_store.append(&marker).await {
            tracing::error!(error = %err, "failed to record reconciliation marker");
        }

        tracing::info!(events = appended, "full reconcile completed");
        appended
    }

    async fn append_counted(&self, event: &Event) -> Result<bool, StoreError> {
        let stored = self.event_store.append(event).await?;
        if stored {
            self.event_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(stored)
    }

    // ------------------------------------------------------------------
    // Trades
    // ------------------------------------------------------------------

    async fn reconcile_trades(&self) -> anyhow::Result<usize> {
        let last = self.last_trade_time.load(Ordering::Relaxed);
        let start_time = if last > 0 { Some(last + 1) } else { None };
        let trades = self.exchange.get_trades(&self.symbol, 100, start_time).await?;
        self.append_trades(&trades).await
    }

    async fn sync_trades(&self) -> anyhow::Result<usize> {
        let trades = self.exchange.get_trades(&self.symbol, 500, None).await?;
        let appended = self.append_trades(&trades).await?;
        tracing::info!(appended, total = trades.len(), "trade history synced");
        Ok(appended)
    }

    async fn append_trades(&self, trades: &[Trade]) -> anyhow::Result<usize> {
        let mut appended = 0;
        for trade in trades {
            if self.append_counted(&self.trade_event(trade)).await? {
                appended += 1;
                tracing::debug!(trade_id = %trade.trade_id, "trade reconciled from REST");
            }
            self.last_trade_time.fetch_max(trade.trade_time, Ordering::Relaxed);
        }
        Ok(appended)
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    async fn sync_open_orders(&self) -> anyhow::Result<usize> {
        let orders = self.exchange.get_open_orders(Some(&self.symbol)).await?;
        let mut appended = 0;
        for order in &orders {
            if self.append_counted(&self.order_snapshot_event(order)).await? {
                appended += 1;
            }
        }
        tracing::info!(open_orders = orders.len(), appended, "open orders synced");
        Ok(appended)
    }

    async fn sync_position(&self) -> anyhow::Result<usize> {
        let Some(position) = self.exchange.get_position(&self.symbol).await? else {
            return Ok(0);
        };
        let stored = self.append_counted(&self.position_event(&position)).await?;
        if stored {
            tracing::info!(
                symbol = %self.symbol,
                side = %position.side,
                qty = %position.quantity,
                "position synced"
            );
        }
        Ok(usize::from(stored))
    }

    async fn sync_balances(&self) -> anyhow::Result<usize> {
        let balances = self.exchange.get_balances().await?;
        let mut appended = 0;
        for balance in &balances {
            if self.append_counted(&self.balance_event(balance)).await? {
                appended += 1;
            }
        }
        tracing::info!(balances = balances.len(), appended, "balances synced");
        Ok(appended)
    }

    async fn sync_funding(&self) -> anyhow::Result<usize> {
        let records = self
            .exchange
            .get_income_history(Some(&self.symbol), Some("FUNDING_FEE"), None, 500)
            .await?;
        let mut appended = 0;
        for record in &records {
            let event = Event::create(
                EventType::FundingApplied,
                EventSource::Rest,
                EntityKind::Balance,
                &record.symbol,
                self.scope.with_symbol(&*record.symbol),
                dedup::funding_key(
                    &self.scope.exchange,
                    &self.scope.venue,
                    &record.symbol,
                    record.time,
                ),
                json!({
                    "symbol": record.symbol,
                    // income is signed from our point of view: positive
                    // income means funding received, so the fee is -income
                    "funding_fee": (-record.income).to_string(),
                    "asset": record.asset,
                    "income_time": record.time,
                }),
            );
            if self.append_counted(&event).await? {
                appended += 1;
            }
        }
        tracing::info!(records = records.len(), appended, "funding history synced");
        Ok(appended)
    }

    // ------------------------------------------------------------------
    // Drift checks
    // ------------------------------------------------------------------

    async fn check_position_drift(&self) -> anyhow::Result<usize> {
        let Some(projections) = &self.projections else {
            return Ok(0);
        };

        let exchange_position = self.exchange.get_position(&self.symbol).await?;
        let projection_position = projections
            .get_position(&self.scope, &self.symbol)
            .await?
            // a flat row is equivalent to no position
            .filter(|row| !row.qty.is_zero());

        let drift = self.drift_detector.detect_position_drift(
            exchange_position.as_ref(),
            projection_position.as_ref(),
            &self.symbol,
        );

        self.record_drift(drift.as_slice()).await
    }

    async fn check_balance_drift(&self) -> anyhow::Result<usize> {
        let Some(projections) = &self.projections else {
            return Ok(0);
        };

        let balances = self.exchange.get_balances().await?;
        let Some(usdt) = balances.iter().find(|b| b.asset == "USDT") else {
            return Ok(0);
        };

        let projection = projections.get_balance(&self.scope, "USDT").await?;
        let drift = self
            .drift_detector
            .detect_balance_drift(usdt, projection.as_ref());

        self.record_drift(drift.as_slice()).await
    }

    async fn check_order_drift(&self) -> anyhow::Result<usize> {
        let Some(projections) = &self.projections else {
            return Ok(0);
        };

        let exchange_orders = self.exchange.get_open_orders(Some(&self.symbol)).await?;
        let projection_orders = projections
            .get_open_orders(&self.scope, Some(&self.symbol))
            .await?;

        let drifts = self.drift_detector.detect_order_drift(
            &exchange_orders,
            &projection_orders,
            &self.symbol,
        );
        self.record_drift(&drifts).await
    }

    async fn record_drift(&self, drifts: &[DriftInfo]) -> anyhow::Result<usize> {
        let mut appended = 0;
        for drift in drifts {
            self.drift_count.fetch_add(1, Ordering::Relaxed);
            let event = self.drift_detector.create_drift_event(drift);
            if self.append_counted(&event).await? {
                appended += 1;
                tracing::warn!(
                    kind = drift.drift_kind,
                    description = %drift.description,
                    "drift detected"
                );
            }
        }
        Ok(appended)
    }

    // ------------------------------------------------------------------
    // Event constructors
    // ------------------------------------------------------------------

    fn trade_event(&self, trade: &Trade) -> Event {
        Event::create(
            EventType::TradeExecuted,
            EventSource::Rest,
            EntityKind::Trade,
            &trade.trade_id,
            self.scope.with_symbol(&*trade.symbol),
            dedup::trade_key(
                &self.scope.exchange,
                &self.scope.venue,
                &trade.symbol,
                &trade.trade_id,
            ),
            json!({
                "exchange_trade_id": trade.trade_id,
                "exchange_order_id": trade.order_id,
                "symbol": trade.symbol,
                "side": trade.side,
                "qty": trade.quantity.to_string(),
                "price": trade.price.to_string(),
                "commission": trade.commission.to_string(),
                "commission_asset": trade.commission_asset,
                "realized_pnl": trade.realized_pnl.to_string(),
                "trade_time": trade.trade_time,
                "is_maker": trade.is_maker,
            }),
        )
    }

    fn order_snapshot_event(&self, order: &Order) -> Event {
        let now_ms = chrono::Utc::now().timestamp_millis();
        Event::create(
            EventType::OrderUpdated,
            EventSource::Rest,
            EntityKind::Order,
            &order.order_id,
            self.scope.with_symbol(&*order.symbol),
            dedup::order_snapshot_key(
                &self.scope.exchange,
                &self.scope.venue,
                &order.symbol,
                &order.order_id,
                &order.status,
                now_ms,
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
                "avg_price": order.avg_price.map(|p| p.to_string()),
                "stop_price": order.stop_price.map(|p| p.to_string()),
            }),
        )
    }

    fn position_event(&self, position: &Position) -> Event {
        let now_ms = chrono::Utc::now().timestamp_millis();
        Event::create(
            EventType::PositionChanged,
            EventSource::Rest,
            EntityKind::Position,
            &position.symbol,
            self.scope.with_symbol(&*position.symbol),
            dedup::position_key(
                &self.scope.exchange,
                &self.scope.venue,
                &position.symbol,
                now_ms,
            ),
            json!({
                "symbol": position.symbol,
                "side": position.side.as_str(),
                "position_amount": match position.side {
                    crate::types::PositionSide::Short => (-position.quantity).to_string(),
                    _ => position.quantity.to_string(),
                },
                "entry_price": position.entry_price.to_string(),
                "unrealized_pnl": position.unrealized_pnl.to_string(),
                "leverage": position.leverage,
                "margin_type": position.margin_type,
            }),
        )
    }

    fn balance_event(&self, balance: &Balance) -> Event {
        let now_ms = chrono::Utc::now().timestamp_millis();
        Event::create(
            EventType::BalanceChanged,
            EventSource::Rest,
            EntityKind::Balance,
            &balance.asset,
            self.scope.clone(),
            dedup::balance_key(
                &self.scope.exchange,
                &self.scope.venue,
                &self.scope.account_id,
                &balance.asset,
                now_ms,
            ),
            json!({
                "asset": balance.asset,
                "wallet_balance": balance.wallet_balance.to_string(),
                "available_balance": balance.available_balance.to_string(),
                "cross_wallet_balance": balance.cross_wallet_balance.to_string(),
            }),
        )
    }
}
