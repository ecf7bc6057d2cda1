//! Position projection handler
//!
//! Applies `PositionChanged` events to `projection_position`. Side is
//! derived from the signed `position_amount`: positive is LONG, negative
//! is SHORT, zero clears the side. Quantity is stored as the absolute
//! value.

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::ProjectionHandler;
use crate::events::{Event, EventType};
use crate::store::{ProjectionStore, StoreResult};

pub struct PositionProjectionHandler {
    projections: ProjectionStore,
}

impl PositionProjectionHandler {
    pub fn new(projections: ProjectionStore) -> Self {
        Self { projections }
    }
}

#[async_trait]
impl ProjectionHandler for PositionProjectionHandler {
    fn handled_event_types(&self) -> &'static [EventType] {
        &[EventType::PositionChanged]
    }

    async fn handle(&self, event: &Event) -> StoreResult<()> {
        let symbol = event
            .scope
            .symbol
            .clone()
            .or_else(|| event.payload_str("symbol").map(str::to_owned));
        let Some(symbol) = symbol else {
            tracing::warn!(event_id = %event.event_id, "PositionChanged without symbol, skipped");
            return Ok(());
        };

        let amount = event
            .payload_decimal("position_amount")
            .unwrap_or(Decimal::ZERO);
        let entry_price = event.payload_decimal("entry_price").unwrap_or(Decimal::ZERO);
        let unrealized_pnl = event
            .payload_decimal("unrealized_pnl")
            .unwrap_or(Decimal::ZERO);
        let leverage = event.payload_i64("leverage").unwrap_or(1);
        let margin_type = event
            .payload_str("margin_type")
            .unwrap_or("CROSS")
            .to_owned();

        let (side, qty) = if amount > Decimal::ZERO {
            // hedge-mode payloads carry an explicit side; trust it if sane
            let side = match event.payload_str("position_side") {
                Some(s @ ("LONG" | "SHORT")) => s,
                _ => "LONG",
            };
            (Some(side.to_owned()), amount)
        } else if amount < Decimal::ZERO {
            (Some("SHORT".to_owned()), amount.abs())
        } else {
            (None, Decimal::ZERO)
        };

        let seq = event.seq.unwrap_or(0);
        self.projections
            .upsert_position(
                &event.scope,
                &symbol,
                side.as_deref(),
                qty,
                entry_price,
                unrealized_pnl,
                leverage,
                &margin_type,
                seq,
            )
            .await?;

        tracing::debug!(%symbol, ?side, %qty, seq, "position projection updated");
        Ok(())
    }
}
