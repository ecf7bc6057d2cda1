//! End-to-end pipeline tests over an in-memory database: WebSocket and
//! REST ingest racing into the event log, projections, drift detection
//! and the double-entry ledger.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use tokio::sync::watch;

use perpetua::db::Database;
use perpetua::events::{dedup, Event, EventType};
use perpetua::exchange::{Balance, MockExchangeClient, Position, Trade, WsMessageHandler};
use perpetua::ledger::{
    init_ledger_schema, JournalEntryBuilder, LedgerPump, LedgerStore, UsdtRateSource,
};
use perpetua::projector::Projector;
use perpetua::reconciler::{HybridReconciler, ReconcilerConfig};
use perpetua::state_machine::WebSocketState;
use perpetua::store::{CheckpointStore, EventStore, ProjectionStore};
use perpetua::types::{EntityKind, EventSource, PositionSide, Scope, TradingMode};

struct Harness {
    event_store: EventStore,
    projections: ProjectionStore,
    projector: Projector,
    ledger_store: LedgerStore,
    ledger_pump: LedgerPump,
    mock: Arc<MockExchangeClient>,
    reconciler: HybridReconciler,
    ws_handler: WsMessageHandler,
    scope: Scope,
    _ws_state_tx: watch::Sender<WebSocketState>,
}

async fn harness() -> Harness {
    let db = Database::connect_in_memory().await.unwrap();
    db.init_core_schema().await.unwrap();
    init_ledger_schema(db.pool()).await.unwrap();

    let scope = Scope::binance_futures("main", TradingMode::Testnet);
    let event_store = EventStore::new(db.pool().clone());
    let checkpoints = CheckpointStore::new(db.pool().clone());
    let projections = ProjectionStore::new(db.pool().clone());
    let ledger_store = LedgerStore::new(db.pool().clone());

    let projector = Projector::new(
        event_store.clone(),
        checkpoints.clone(),
        projections.clone(),
    );

    let mock = Arc::new(MockExchangeClient::new());
    let builder = JournalEntryBuilder::new(
        ledger_store.clone(),
        UsdtRateSource::new(Some(mock.clone())),
    );
    let ledger_pump = LedgerPump::new(
        event_store.clone(),
        checkpoints,
        builder,
        ledger_store.clone(),
        Duration::from_millis(50),
    );

    let (ws_state_tx, ws_state_rx) = watch::channel(WebSocketState::Disconnected);
    let reconciler = HybridReconciler::new(
        mock.clone(),
        event_store.clone(),
        scope.clone(),
        "XRPUSDT",
        ReconcilerConfig::default(),
        ws_state_rx,
    )
    .with_projections(projections.clone());

    let ws_handler = WsMessageHandler::new(
        event_store.clone(),
        scope.clone(),
        Some("XRPUSDT".to_string()),
    );

    Harness {
        event_store,
        projections,
        projector,
        ledger_store,
        ledger_pump,
        mock,
        reconciler,
        ws_handler,
        scope,
        _ws_state_tx: ws_state_tx,
    }
}

fn rest_trade(trade_id: &str, side: &str, qty: Decimal, price: Decimal, time: i64) -> Trade {
    Trade {
        trade_id: trade_id.to_string(),
        order_id: format!("o-{trade_id}"),
        client_order_id: String::new(),
        symbol: "XRPUSDT".to_string(),
        side: side.to_string(),
        quantity: qty,
        price,
        quote_qty: qty * price,
        commission: dec!(0.02),
        commission_asset: "USDT".to_string(),
        realized_pnl: Decimal::ZERO,
        is_maker: false,
        trade_time: time,
    }
}

fn ws_fill(trade_id: i64, qty: &str, price: &str, event_time: i64) -> serde_json::Value {
    json!({
        "e": "ORDER_TRADE_UPDATE",
        "E": event_time,
        "o": {
            "s": "XRPUSDT", "c": "pp-1", "S": "BUY", "o": "MARKET",
            "x": "TRADE", "X": "FILLED", "i": 900 + trade_id,
            "q": qty, "z": qty, "L": price, "l": qty,
            "n": "0.02", "N": "USDT", "T": event_time, "t": trade_id,
            "rp": "0", "m": false, "p": "0", "ap": price, "sp": "0",
        }
    })
}

// Scenario 1: identical dedup keys store exactly one event.
#[tokio::test]
async fn append_is_idempotent_for_identical_dedup_keys() {
    let h = harness().await;

    let event = Event::create(
        EventType::TradeExecuted,
        EventSource::Websocket,
        EntityKind::Trade,
        "12345",
        h.scope.with_symbol("XRPUSDT"),
        "BINANCE:FUTURES:XRPUSDT:trade:12345",
        json!({"exchange_trade_id": "12345"}),
    );
    assert!(h.event_store.append(&event).await.unwrap());

    let rival = Event::create(
        EventType::TradeExecuted,
        EventSource::Rest,
        EntityKind::Trade,
        "12345",
        h.scope.with_symbol("XRPUSDT"),
        "BINANCE:FUTURES:XRPUSDT:trade:12345",
        json!({"exchange_trade_id": "12345", "seen_again": true}),
    );
    assert!(!h.event_store.append(&rival).await.unwrap());

    assert_eq!(h.event_store.count().await.unwrap(), 1);
}

// A trade observed on the WebSocket and then re-observed over REST is one
// event; the REST re-observation deduplicates away.
#[tokio::test]
async fn websocket_then_rest_trade_is_stored_once() {
    let h = harness().await;

    h.ws_handler
        .handle(&ws_fill(42, "100", "0.5", 1_700_000_000_000))
        .await
        .unwrap();

    let mut trade = rest_trade("42", "BUY", dec!(100), dec!(0.5), 1_700_000_000_000);
    trade.order_id = "942".to_string();
    h.mock.push_trade(trade).await;
    h.reconciler.tick().await;

    let trades = h
        .event_store
        .get_by_type(EventType::TradeExecuted, 100)
        .await
        .unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].source.as_str(), "WEBSOCKET");
}

// Scenario 6: full reconcile with T1 already present appends only T2.
#[tokio::test]
async fn full_reconcile_appends_only_missing_trades() {
    let h = harness().await;

    let existing = Event::create(
        EventType::TradeExecuted,
        EventSource::Websocket,
        EntityKind::Trade,
        "T1",
        h.scope.with_symbol("XRPUSDT"),
        dedup::trade_key("BINANCE", "FUTURES", "XRPUSDT", "T1"),
        json!({"exchange_trade_id": "T1"}),
    );
    h.event_store.append(&existing).await.unwrap();

    h.mock
        .push_trade(rest_trade("T1", "BUY", dec!(10), dec!(0.5), 1))
        .await;
    h.mock
        .push_trade(rest_trade("T2", "SELL", dec!(10), dec!(0.6), 2))
        .await;

    let before = h.event_store.count().await.unwrap();
    h.reconciler.full_reconcile().await;

    let trades = h
        .event_store
        .get_by_type(EventType::TradeExecuted, 100)
        .await
        .unwrap();
    assert_eq!(trades.len(), 2);
    // exactly one new trade event plus the reconciliation marker
    assert_eq!(h.event_store.count().await.unwrap(), before + 2);
}

// Rebuild equivalence: replaying the full log reproduces the projection
// state byte for byte.
#[tokio::test]
async fn projection_rebuild_matches_incremental_state() {
    let h = harness().await;

    for (time, qty) in [(1_700_000_000_000i64, "100"), (1_700_000_060_000, "250")] {
        h.ws_handler
            .handle(&json!({
                "e": "ACCOUNT_UPDATE",
                "E": time,
                "a": {
                    "B": [{"a": "USDT", "wb": qty, "cw": qty}],
                    "P": [{"s": "XRPUSDT", "pa": qty, "ep": "0.5", "up": "0", "mt": "cross", "ps": "BOTH"}],
                }
            }))
            .await
            .unwrap();
    }
    h.ws_handler
        .handle(&ws_fill(7, "50", "0.55", 1_700_000_120_000))
        .await
        .unwrap();

    h.projector.apply_all_pending().await.unwrap();

    let balance_before = h
        .projections
        .get_balance(&h.scope, "USDT")
        .await
        .unwrap()
        .unwrap();
    let position_before = h
        .projections
        .get_position(&h.scope, "XRPUSDT")
        .await
        .unwrap()
        .unwrap();

    h.projector.rebuild().await.unwrap();

    let balance_after = h
        .projections
        .get_balance(&h.scope, "USDT")
        .await
        .unwrap()
        .unwrap();
    let position_after = h
        .projections
        .get_position(&h.scope, "XRPUSDT")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(balance_before, balance_after);
    assert_eq!(position_before, position_after);
    assert_eq!(balance_after.free, dec!(250));
    assert_eq!(position_after.side.as_deref(), Some("LONG"));
}

// Drift minute-bucketing: repeated polls inside one minute persist at
// most one DriftDetected per (scope, kind).
#[tokio::test]
async fn drift_polls_collapse_within_a_minute() {
    let h = harness().await;

    h.mock
        .set_position(Position {
            symbol: "XRPUSDT".to_string(),
            side: PositionSide::Long,
            quantity: dec!(100),
            entry_price: dec!(0.5),
            unrealized_pnl: Decimal::ZERO,
            leverage: 20,
            margin_type: "CROSS".to_string(),
            liquidation_price: None,
            mark_price: None,
        })
        .await;

    for _ in 0..5 {
        h.reconciler.tick().await;
    }

    let drifts = h
        .event_store
        .get_by_type(EventType::DriftDetected, 100)
        .await
        .unwrap();
    assert_eq!(drifts.len(), 1);
    assert_eq!(drifts[0].payload_str("drift_kind"), Some("position"));
    assert!(h.reconciler.drift_count() >= 5);
}

// Scenario 2: a deposit-style entry moves both balances by 1000.
#[tokio::test]
async fn saved_entry_updates_account_balances() {
    let h = harness().await;

    use perpetua::ledger::{JournalLine, TransactionType};
    let mut entry = perpetua::ledger::JournalEntry::new(
        TransactionType::Deposit,
        chrono::Utc::now(),
        "testnet",
    );
    entry.lines.push(JournalLine::debit(
        "ASSET:BINANCE_FUTURES:USDT",
        dec!(1000),
        "USDT",
        dec!(1000),
        Decimal::ONE,
    ));
    entry.lines.push(JournalLine::credit(
        "ASSET:EXTERNAL:USDT",
        dec!(1000),
        "USDT",
        dec!(1000),
        Decimal::ONE,
    ));
    h.ledger_store.save_entry(&entry).await.unwrap();

    assert_eq!(
        h.ledger_store
            .get_account_balance("ASSET:BINANCE_FUTURES:USDT", "testnet")
            .await
            .unwrap(),
        dec!(1000)
    );
    assert_eq!(
        h.ledger_store
            .get_account_balance("ASSET:EXTERNAL:USDT", "testnet")
            .await
            .unwrap(),
        dec!(-1000)
    );
}

// Scenario 3 + ledger balance + conservation, through the whole pipeline:
// WS fill -> event log -> ledger pump -> balanced journal entry.
#[tokio::test]
async fn trade_flows_into_a_balanced_journal_entry() {
    let h = harness().await;

    let fill = json!({
        "e": "ORDER_TRADE_UPDATE",
        "E": 1_700_000_000_000i64,
        "o": {
            "s": "XRPUSDT", "c": "pp-9", "S": "BUY", "o": "MARKET",
            "x": "TRADE", "X": "FILLED", "i": 1001,
            "q": "0.001", "z": "0.001", "L": "45000", "l": "0.001",
            "n": "0.045", "N": "USDT", "T": 1_700_000_000_000i64, "t": 555,
            "rp": "0", "m": false, "p": "0", "ap": "45000", "sp": "0",
        }
    });
    h.ws_handler.handle(&fill).await.unwrap();
    h.ledger_pump.apply_all_pending().await.unwrap();

    let entries = h
        .ledger_store
        .get_entries_by_type("TRADE", "testnet", 10)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);

    let (_, lines) = h
        .ledger_store
        .get_entry(&entries[0].entry_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lines.len(), 4);

    let debit: Decimal = lines
        .iter()
        .filter(|l| l.side == "DEBIT")
        .map(|l| l.usdt_value.parse::<Decimal>().unwrap())
        .sum();
    let credit: Decimal = lines
        .iter()
        .filter(|l| l.side == "CREDIT")
        .map(|l| l.usdt_value.parse::<Decimal>().unwrap())
        .sum();
    assert_eq!(debit, dec!(45.045));
    assert_eq!(credit, dec!(45.045));

    // trial balance closes in USDT terms
    assert_eq!(
        h.ledger_store.trial_balance_total("testnet").await.unwrap(),
        Decimal::ZERO
    );
}

// Scenario 4: BalanceChanged without a delta produces no entry.
#[tokio::test]
async fn balance_changed_without_delta_is_not_ledgered() {
    let h = harness().await;

    h.mock
        .set_balance(Balance {
            asset: "USDT".to_string(),
            wallet_balance: dec!(500),
            available_balance: dec!(500),
            cross_wallet_balance: dec!(500),
            unrealized_pnl: Decimal::ZERO,
        })
        .await;
    h.reconciler.full_reconcile().await;
    h.ledger_pump.apply_all_pending().await.unwrap();

    let adjustments = h
        .ledger_store
        .get_entries_by_type("ADJUSTMENT", "testnet", 10)
        .await
        .unwrap();
    assert!(adjustments.is_empty());
}

// Epoch filtering: only InitialCapitalEstablished survives from before
// the epoch.
#[tokio::test]
async fn epoch_excludes_older_events_from_the_ledger() {
    let h = harness().await;
    use chrono::TimeZone;

    let epoch = chrono::Utc.with_ymd_and_hms(2026, 2, 18, 0, 0, 0).unwrap();

    let mut old_trade = Event::create(
        EventType::TradeExecuted,
        EventSource::Rest,
        EntityKind::Trade,
        "OLD",
        h.scope.with_symbol("XRPUSDT"),
        dedup::trade_key("BINANCE", "FUTURES", "XRPUSDT", "OLD"),
        json!({"symbol": "XRPUSDT", "side": "BUY", "qty": "10", "price": "0.5"}),
    );
    old_trade.ts = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    h.event_store.append(&old_trade).await.unwrap();

    let mut capital = Event::create(
        EventType::InitialCapitalEstablished,
        EventSource::Bot,
        EntityKind::Capital,
        "initial-capital",
        h.scope.clone(),
        "BINANCE:FUTURES:main:initial-capital:2026-02-18",
        json!({
            "snapshot_date": "2026-02-18",
            "futures_assets": [{"asset": "USDT", "walletBalance": "100"}],
        }),
    );
    capital.ts = epoch;

    h.ledger_pump.builder().set_epoch_date(epoch);
    h.event_store.append(&capital).await.unwrap();
    h.ledger_pump.apply_all_pending().await.unwrap();

    // no TRADE entry for the pre-epoch trade
    let trades = h
        .ledger_store
        .get_entries_by_type("TRADE", "testnet", 10)
        .await
        .unwrap();
    assert!(trades.is_empty());

    // the capital entry itself went through
    assert_eq!(
        h.ledger_store
            .get_account_balance("EQUITY:INITIAL_CAPITAL", "testnet")
            .await
            .unwrap(),
        dec!(-100)
    );
}

// Ledger and projector run on independent checkpoints: one consumer
// falling behind does not hold the other back.
#[tokio::test]
async fn projector_and_ledger_checkpoints_are_independent() {
    let h = harness().await;

    h.ws_handler
        .handle(&ws_fill(1, "10", "0.5", 1_700_000_000_000))
        .await
        .unwrap();

    h.projector.apply_all_pending().await.unwrap();
    // ledger has not run yet; projection state exists regardless
    let orders = h.projections.get_open_orders(&h.scope, None).await.unwrap();
    assert!(orders.is_empty()); // the fill was terminal (FILLED)

    h.ledger_pump.apply_all_pending().await.unwrap();
    let entries = h
        .ledger_store
        .get_entries_by_type("TRADE", "testnet", 10)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
}
