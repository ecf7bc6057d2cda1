//! Balance projection handler
//!
//! Applies `BalanceChanged` events to `projection_balance`. WebSocket and
//! REST payloads disagree on field names, so `free` is computed from the
//! most specific field available:
//! `available_balance > cross_wallet_balance > wallet_balance`.

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::ProjectionHandler;
use crate::events::{Event, EventType};
use crate::store::{ProjectionStore, StoreResult};

pub struct BalanceProjectionHandler {
    projections: ProjectionStore,
}

impl BalanceProjectionHandler {
    pub fn new(projections: ProjectionStore) -> Self {
        Self { projections }
    }
}

#[async_trait]
impl ProjectionHandler for BalanceProjectionHandler {
    fn handled_event_types(&self) -> &'static [EventType] {
        &[EventType::BalanceChanged]
    }

    async fn handle(&self, event: &Event) -> StoreResult<()> {
        let Some(asset) = event.payload_str("asset").map(str::to_owned) else {
            tracing::warn!(event_id = %event.event_id, "BalanceChanged without asset, skipped");
            return Ok(());
        };

        let wallet_balance = event.payload_decimal("wallet_balance");
        let free = event
            .payload_decimal("available_balance")
            .or_else(|| event.payload_decimal("cross_wallet_balance"))
            .or(wallet_balance)
            .unwrap_or(Decimal::ZERO);

        // locked is whatever of the wallet is not free; never negative
        let locked = match wallet_balance {
            Some(total) if total > free => total - free,
            _ => Decimal::ZERO,
        };

        let seq = event.seq.unwrap_or(0);
        self.projections
            .upsert_balance(&event.scope, &asset, free, locked, seq)
            .await?;

        tracing::debug!(%asset, %free, %locked, seq, "balance projection updated");
        Ok(())
    }
}
