//! Drift detection
//!
//! Compares exchange observations against projection rows. A detection
//! yields a [`DriftInfo`]; the corresponding `DriftDetected` event carries
//! a minute-bucketed dedup key, so a persistent drift records once per
//! minute instead of once per poll.

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;

use crate::events::{dedup, Event, EventType};
use crate::exchange::{Balance, Order, Position};
use crate::store::{BalanceRow, OrderRow, PositionRow};
use crate::types::{EntityKind, EventSource, Scope};

/// Quantity tolerance: differences below this are representation noise,
/// not drift.
pub const QTY_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 8); // 1e-8

/// One detected inconsistency.
#[derive(Debug, Clone)]
pub struct DriftInfo {
    pub drift_kind: &'static str,
    pub symbol: Option<String>,
    pub asset: Option<String>,
    pub expected: serde_json::Value,
    pub actual: serde_json::Value,
    pub description: String,
}

pub struct DriftDetector {
    scope: Scope,
}

impl DriftDetector {
    pub fn new(scope: Scope) -> Self {
        Self { scope }
    }

    /// Position drift: one side has a position the other does not, or the
    /// quantities differ beyond tolerance.
    pub fn detect_position_drift(
        &self,
        exchange_position: Option<&Position>,
        projection_position: Option<&PositionRow>,
        symbol: &str,
    ) -> Option<DriftInfo> {
        match (exchange_position, projection_position) {
            (Some(exchange), None) => Some(DriftInfo {
                drift_kind: "position",
                symbol: Some(symbol.to_owned()),
                asset: None,
                expected: json!({ "qty": "0" }),
                actual: json!({
                    "side": exchange.side.as_str(),
                    "qty": exchange.quantity.to_string(),
                    "entry_price": exchange.entry_price.to_string(),
                }),
                description: format!(
                    "Exchange has position, projection is empty: {}",
                    exchange.quantity
                ),
            }),
            (None, Some(projection)) => {
                if projection.qty.is_zero() {
                    return None;
                }
                Some(DriftInfo {
                    drift_kind: "position",
                    symbol: Some(symbol.to_owned()),
                    asset: None,
                    expected: json!({
                        "side": projection.side,
                        "qty": projection.qty.to_string(),
                    }),
                    actual: json!({ "qty": "0" }),
                    description: format!(
                        "Projection has position, exchange is empty: {}",
                        projection.qty
                    ),
                })
            }
            (Some(exchange), Some(projection)) => {
                let diff = (exchange.quantity - projection.qty).abs();
                if diff <= QTY_TOLERANCE {
                    return None;
                }
                Some(DriftInfo {
                    drift_kind: "position",
                    symbol: Some(symbol.to_owned()),
                    asset: None,
                    expected: json!({
                        "side": projection.side,
                        "qty": projection.qty.to_string(),
                    }),
                    actual: json!({
                        "side": exchange.side.as_str(),
                        "qty": exchange.quantity.to_string(),
                    }),
                    description: format!(
                        "Position qty mismatch: expected {}, actual {}",
                        projection.qty, exchange.quantity
                    ),
                })
            }
            (None, None) => None,
        }
    }

    /// Balance drift on one asset: free or locked differ beyond tolerance.
    /// A missing projection row with non-zero exchange funds is drift.
    pub fn detect_balance_drift(
        &self,
        exchange_balance: &Balance,
        projection_balance: Option<&BalanceRow>,
    ) -> Option<DriftInfo> {
        let exchange_free = exchange_balance.free();
        let exchange_locked = exchange_balance.locked();

        let Some(projection) = projection_balance else {
            if exchange_free > Decimal::ZERO || exchange_locked > Decimal::ZERO {
                return Some(DriftInfo {
                    drift_kind: "balance",
                    symbol: None,
                    asset: Some(exchange_balance.asset.clone()),
                    expected: json!({ "free": "0", "locked": "0" }),
                    actual: json!({
                        "free": exchange_free.to_string(),
                        "locked": exchange_locked.to_string(),
                    }),
                    description: format!("Balance not in projection: {}", exchange_balance.asset),
                });
            }
            return None;
        };

        let free_diff = (exchange_free - projection.free).abs();
        let locked_diff = (exchange_locked - projection.locked).abs();
        if free_diff <= QTY_TOLERANCE && locked_diff <= QTY_TOLERANCE {
            return None;
        }

        Some(DriftInfo {
            drift_kind: "balance",
            symbol: None,
            asset: Some(exchange_balance.asset.clone()),
            expected: json!({
                "free": projection.free.to_string(),
                "locked": projection.locked.to_string(),
            }),
            actual: json!({
                "free": exchange_free.to_string(),
                "locked": exchange_locked.to_string(),
            }),
            description: format!(
                "Balance mismatch for {}: free diff={free_diff}, locked diff={locked_diff}",
                exchange_balance.asset
            ),
        })
    }

    /// Order drift: set-difference on open-order ids. Present-in-projection
    /// but absent-on-exchange is reported too, though it usually just means
    /// a fill/cancel has not been projected yet.
    pub fn detect_order_drift(
        &self,
        exchange_orders: &[Order],
        projection_orders: &[OrderRow],
        symbol: &str,
    ) -> Vec<DriftInfo> {
        let mut drifts = Vec::new();

        for order in exchange_orders {
            let known = projection_orders
                .iter()
                .any(|row| row.exchange_order_id == order.order_id);
            if !known {
                drifts.push(DriftInfo {
                    drift_kind: "order",
                    symbol: Some(symbol.to_owned()),
                    asset: None,
                    expected: json!({ "order_id": null }),
                    actual: json!({
                        "order_id": order.order_id,
                        "side": order.side,
                        "type": order.order_type,
                        "qty": order.original_qty.to_string(),
                    }),
                    description: format!(
                        "Order {} exists on exchange but not in projection",
                        order.order_id
                    ),
                });
            }
        }

        for row in projection_orders {
            let known = exchange_orders
                .iter()
                .any(|order| order.order_id == row.exchange_order_id);
            if !known {
                drifts.push(DriftInfo {
                    drift_kind: "order",
                    symbol: Some(symbol.to_owned()),
                    asset: None,
                    expected: json!({
                        "order_id": row.exchange_order_id,
                        "status": row.order_state,
                    }),
                    actual: json!({ "order_id": null }),
                    description: format!(
                        "Order {} in projection but not on exchange (may be filled/cancelled)",
                        row.exchange_order_id
                    ),
                });
            }
        }

        drifts
    }

    /// Build the `DriftDetected` event for one detection.
    pub fn create_drift_event(&self, drift: &DriftInfo) -> Event {
        let now = Utc::now();
        let symbol_for_key = drift.symbol.as_deref().unwrap_or("GLOBAL");
        let scope = match &drift.symbol {
            Some(symbol) => self.scope.with_symbol(symbol.clone()),
            None => self.scope.clone(),
        };

        Event::create(
            EventType::DriftDetected,
            EventSource::Bot,
            EntityKind::Reconciler,
            format!("{}:{}", drift.drift_kind, symbol_for_key),
            scope,
            dedup::drift_key(
                &self.scope.exchange,
                &self.scope.venue,
                symbol_for_key,
                drift.drift_kind,
                now,
            ),
            json!({
                "drift_kind": drift.drift_kind,
                "symbol": drift.symbol,
                "asset": drift.asset,
                "expected": drift.expected,
                "actual": drift.actual,
                "description": drift.description,
                "detected_at": now.to_rfc3339(),
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PositionSide, TradingMode};
    use rust_decimal_macros::dec;

    fn detector() -> DriftDetector {
        DriftDetector::new(Scope::binance_futures("main", TradingMode::Testnet))
    }

    fn exchange_position(qty: Decimal) -> Position {
        Position {
            symbol: "XRPUSDT".into(),
            side: PositionSide::Long,
            quantity: qty,
            entry_price: dec!(0.5),
            unrealized_pnl: Decimal::ZERO,
            leverage: 20,
            margin_type: "CROSS".into(),
            liquidation_price: None,
            mark_price: None,
        }
    }

    fn projection_position(qty: Decimal) -> PositionRow {
        PositionRow {
            symbol: "XRPUSDT".into(),
            side: Some("LONG".into()),
            qty,
            entry_price: dec!(0.5),
            unrealized_pnl: Decimal::ZERO,
            leverage: 20,
            margin_type: "CROSS".into(),
            last_event_seq: 1,
        }
    }

    #[test]
    fn test_exchange_position_missing_from_projection() {
        let drift = detector()
            .detect_position_drift(Some(&exchange_position(dec!(100))), None, "XRPUSDT")
            .unwrap();

        assert_eq!(drift.drift_kind, "position");
        assert!(drift.description.contains("projection is empty"));
    }

    #[test]
    fn test_projection_position_missing_from_exchange() {
        let drift = detector()
            .detect_position_drift(None, Some(&projection_position(dec!(50))), "XRPUSDT")
            .unwrap();
        assert!(drift.description.contains("exchange is empty"));

        // flat projection row is not drift
        assert!(detector()
            .detect_position_drift(None, Some(&projection_position(Decimal::ZERO)), "XRPUSDT")
            .is_none());
    }

    #[test]
    fn test_qty_within_tolerance_is_not_drift() {
        let exchange = exchange_position(dec!(100.000000001));
        let projection = projection_position(dec!(100));
        assert!(detector()
            .detect_position_drift(Some(&exchange), Some(&projection), "XRPUSDT")
            .is_none());

        let exchange = exchange_position(dec!(100.5));
        assert!(detector()
            .detect_position_drift(Some(&exchange), Some(&projection), "XRPUSDT")
            .is_some());
    }

    #[test]
    fn test_balance_drift_on_missing_projection() {
        let balance = Balance {
            asset: "USDT".into(),
            wallet_balance: dec!(100),
            available_balance: dec!(100),
            cross_wallet_balance: dec!(100),
            unrealized_pnl: Decimal::ZERO,
        };
        let drift = detector().detect_balance_drift(&balance, None).unwrap();
        assert_eq!(drift.asset.as_deref(), Some("USDT"));

        let zero = Balance {
            wallet_balance: Decimal::ZERO,
            available_balance: Decimal::ZERO,
            ..balance
        };
        assert!(detector().detect_balance_drift(&zero, None).is_none());
    }

    #[test]
    fn test_order_drift_both_directions() {
        let exchange_orders = vec![Order {
            order_id: "1".into(),
            client_order_id: String::new(),
            symbol: "XRPUSDT".into(),
            side: "BUY".into(),
            order_type: "LIMIT".into(),
            status: "NEW".into(),
            original_qty: dec!(10),
            executed_qty: Decimal::ZERO,
            price: Some(dec!(0.5)),
            avg_price: None,
            stop_price: None,
            time_in_force: "GTC".into(),
            reduce_only: false,
            updated_at: None,
        }];
        let projection_orders = vec![OrderRow {
            symbol: "XRPUSDT".into(),
            exchange_order_id: "2".into(),
            client_order_id: None,
            order_state: "NEW".into(),
            side: "SELL".into(),
            order_type: "LIMIT".into(),
            original_qty: dec!(5),
            executed_qty: Decimal::ZERO,
            price: Some(dec!(0.6)),
            stop_price: None,
            last_event_seq: 1,
        }];

        let drifts =
            detector().detect_order_drift(&exchange_orders, &projection_orders, "XRPUSDT");
        assert_eq!(drifts.len(), 2);
        assert!(drifts[0].description.contains("not in projection"));
        assert!(drifts[1].description.contains("not on exchange"));
    }

    #[test]
    fn test_drift_event_minute_bucket() {
        let detector = detector();
        let drift = detector
            .detect_position_drift(Some(&exchange_position(dec!(100))), None, "XRPUSDT")
            .unwrap();

        let a = detector.create_drift_event(&drift);
        let b = detector.create_drift_event(&drift);
        // same minute -> same dedup key -> second append collapses
        assert_eq!(a.dedup_key, b.dedup_key);
        assert_eq!(a.event_type, EventType::DriftDetected);
    }
}
