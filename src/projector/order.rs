//! Order projection handler
//!
//! Applies `OrderPlaced` / `OrderUpdated` / `OrderCancelled` /
//! `OrderRejected` events to `projection_order`. The table holds *open*
//! orders only: a terminal status (FILLED / CANCELED / EXPIRED / REJECTED)
//! or a cancel/reject event deletes the row.

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::ProjectionHandler;
use crate::events::{Event, EventType};
use crate::store::{OrderRow, ProjectionStore, StoreResult};
use crate::types::OrderStatus;

pub struct OrderProjectionHandler {
    projections: ProjectionStore,
}

impl OrderProjectionHandler {
    pub fn new(projections: ProjectionStore) -> Self {
        Self { projections }
    }

    async fn handle_placed(&self, event: &Event, order_id: &str) -> StoreResult<()> {
        let symbol = event
            .scope
            .symbol
            .clone()
            .or_else(|| event.payload_str("symbol").map(str::to_owned))
            .unwrap_or_default();

        let row = OrderRow {
            symbol,
            exchange_order_id: order_id.to_owned(),
            client_order_id: event.payload_str("client_order_id").map(str::to_owned),
            order_state: event
                .payload_str("order_status")
                .unwrap_or("NEW")
                .to_owned(),
            side: event.payload_str("side").unwrap_or_default().to_owned(),
            order_type: event
                .payload_str("order_type")
                .unwrap_or_default()
                .to_owned(),
            original_qty: event
                .payload_decimal("original_qty")
                .unwrap_or(Decimal::ZERO),
            executed_qty: event
                .payload_decimal("executed_qty")
                .unwrap_or(Decimal::ZERO),
            price: event.payload_decimal("price"),
            stop_price: event.payload_decimal("stop_price"),
            last_event_seq: event.seq.unwrap_or(0),
        };

        self.projections.upsert_order(&event.scope, &row).await?;
        tracing::debug!(order_id, seq = row.last_event_seq, "order projection created");
        Ok(())
    }

    async fn handle_updated(&self, event: &Event, order_id: &str) -> StoreResult<()> {
        let status = event.payload_str("order_status").unwrap_or("NEW");

        // terminal status drops the order from the open set
        if OrderStatus::from_str(status).is_some_and(|s| s.is_terminal()) {
            return self.delete(event, order_id).await;
        }

        let executed_qty = event
            .payload_decimal("executed_qty")
            .unwrap_or(Decimal::ZERO);
        self.projections
            .update_order_state(
                &event.scope,
                order_id,
                status,
                executed_qty,
                event.seq.unwrap_or(0),
            )
            .await?;
        tracing::debug!(order_id, status, "order projection updated");
        Ok(())
    }

    async fn delete(&self, event: &Event, order_id: &str) -> StoreResult<()> {
        self.projections.delete_order(&event.scope, order_id).await?;
        tracing::debug!(order_id, "order projection deleted");
        Ok(())
    }
}

#[async_trait]
impl ProjectionHandler for OrderProjectionHandler {
    fn handled_event_types(&self) -> &'static [EventType] {
        &[
            EventType::OrderPlaced,
            EventType::OrderUpdated,
            EventType::OrderCancelled,
            EventType::OrderRejected,
        ]
    }

    async fn handle(&self, event: &Event) -> StoreResult<()> {
        let Some(order_id) = event.payload_str("exchange_order_id").map(str::to_owned) else {
            // a reject can arrive before the exchange assigned an id; the
            // event itself stays in the log as the audit record
            tracing::warn!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                "order event without exchange_order_id, skipped"
            );
            return Ok(());
        };

        match event.event_type {
            EventType::OrderPlaced => self.handle_placed(event, &order_id).await,
            EventType::OrderUpdated => self.handle_updated(event, &order_id).await,
            EventType::OrderCancelled | EventType::OrderRejected => {
                self.delete(event, &order_id).await
            }
            _ => Ok(()),
        }
    }
}
