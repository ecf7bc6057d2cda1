//! Journal entry construction
//!
//! Translates finance-affecting events into balanced double-entry journal
//! entries. Each line carries both the native-asset amount and its
//! USDT-equivalent; balance is verified over the USDT values so entries
//! spanning different assets still close.
//!
//! Rate sourcing priority: USDT is 1; then the in-process cache fed by the
//! live ticker; then the 1-minute candle closing at the event time; on
//! total failure the line is emitted with rate 1 and a warning -- a
//! traceable hole instead of silently corrupted totals.
//!
//! With an epoch date set, events before it produce no entries. The
//! exception is `InitialCapitalEstablished`, the event that *sets* the
//! epoch.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde_json::Value;
use std::sync::Arc;
use std::sync::RwLock;
use uuid::Uuid;

use super::store::{LedgerError, LedgerStore};
use super::types::{accounts, is_non_financial, venues, JournalSide, TransactionType};
use crate::events::{Event, EventType};
use crate::exchange::ExchangeApi;

/// Maximum |sum(debit) - sum(credit)| in USDT for an entry to count as
/// balanced.
pub const BALANCE_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2); // 0.01

/// Residues below this are rounding noise, not conversion loss/gain.
const CONVERSION_RESIDUE_FLOOR: Decimal = Decimal::from_parts(1, 0, 0, false, 3); // 0.001

/// One posting within an entry.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalLine {
    pub account_id: String,
    pub side: JournalSide,
    /// Native-asset quantity.
    pub amount: Decimal,
    pub asset: String,
    /// `amount * usdt_rate`.
    pub usdt_value: Decimal,
    /// 1 ASSET = `usdt_rate` USDT.
    pub usdt_rate: Decimal,
    pub memo: Option<String>,
}

impl JournalLine {
    pub fn debit(
        account_id: impl Into<String>,
        amount: Decimal,
        asset: impl Into<String>,
        usdt_value: Decimal,
        usdt_rate: Decimal,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            side: JournalSide::Debit,
            amount,
            asset: asset.into(),
            usdt_value,
            usdt_rate,
            memo: None,
        }
    }

    pub fn credit(
        account_id: impl Into<String>,
        amount: Decimal,
        asset: impl Into<String>,
        usdt_value: Decimal,
        usdt_rate: Decimal,
    ) -> Self {
        Self {
            side: JournalSide::Credit,
            ..Self::debit(account_id, amount, asset, usdt_value, usdt_rate)
        }
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }
}

/// One balanced double-entry transaction.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub entry_id: String,
    pub ts: DateTime<Utc>,
    pub transaction_type: TransactionType,
    pub scope_mode: String,
    pub lines: Vec<JournalLine>,
    pub related_trade_id: Option<String>,
    pub related_order_id: Option<String>,
    pub related_position_id: Option<String>,
    pub symbol: Option<String>,
    pub source_event_id: Option<String>,
    pub source: String,
    pub description: Option<String>,
    pub memo: Option<String>,
    pub raw_data: Option<Value>,
}

impl JournalEntry {
    pub fn new(
        transaction_type: TransactionType,
        ts: DateTime<Utc>,
        scope_mode: impl Into<String>,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4().to_string(),
            ts,
            transaction_type,
            scope_mode: scope_mode.into(),
            lines: Vec::new(),
            related_trade_id: None,
            related_order_id: None,
            related_position_id: None,
            symbol: None,
            source_event_id: None,
            source: "BOT".to_string(),
            description: None,
            memo: None,
            raw_data: None,
        }
    }

    fn for_event(transaction_type: TransactionType, event: &Event) -> Self {
        Self {
            source_event_id: Some(event.event_id.clone()),
            source: event.source.as_str().to_string(),
            ..Self::new(transaction_type, event.ts, event.scope.mode.clone())
        }
    }

    pub fn debit_total(&self) -> Decimal {
        self.lines
            .iter()
            .filter(|line| line.side == JournalSide::Debit)
            .map(|line| line.usdt_value)
            .sum()
    }

    pub fn credit_total(&self) -> Decimal {
        self.lines
            .iter()
            .filter(|line| line.side == JournalSide::Credit)
            .map(|line| line.usdt_value)
            .sum()
    }

    /// Balance over USDT values within [`BALANCE_TOLERANCE`].
    pub fn is_balanced(&self) -> bool {
        (self.debit_total() - self.credit_total()).abs() <= BALANCE_TOLERANCE
    }
}

/// USDT-rate resolution: cache (live ticker) first, then the historical
/// 1-minute candle via the exchange, then the logged fallback of 1.
pub struct UsdtRateSource {
    /// `<ASSET>USDT` -> last known rate.
    cache: DashMap<String, Decimal>,
    pricing: Option<Arc<dyn ExchangeApi>>,
}

impl UsdtRateSource {
    pub fn new(pricing: Option<Arc<dyn ExchangeApi>>) -> Self {
        Self {
            cache: DashMap::new(),
            pricing,
        }
    }

    /// Feed from the live ticker stream. `symbol` is `<ASSET>USDT`.
    pub fn set_price(&self, symbol: impl Into<String>, price: Decimal) {
        self.cache.insert(symbol.into(), price);
    }

    /// 1 `asset` = ? USDT at (approximately) `ts`.
    pub async fn rate(&self, asset: &str, ts: DateTime<Utc>) -> Decimal {
        if asset == "USDT" {
            return Decimal::ONE;
        }

        let symbol = format!("{asset}USDT");
        if let Some(rate) = self.cache.get(&symbol) {
            return *rate;
        }

        if let Some(pricing) = &self.pricing {
            match pricing
                .get_klines(&symbol, "1m", 1, Some(ts.timestamp_millis()))
                .await
            {
                Ok(klines) => {
                    if let Some(kline) = klines.first() {
                        self.cache.insert(symbol, kline.close);
                        return kline.close;
                    }
                }
                Err(err) => {
                    tracing::warn!(asset, error = %err, "historical rate lookup failed");
                }
            }
        }

        tracing::warn!(asset, "USDT rate unavailable, falling back to 1");
        Decimal::ONE
    }
}

pub struct JournalEntryBuilder {
    ledger_store: LedgerStore,
    rates: UsdtRateSource,
    epoch_date: RwLock<Option<DateTime<Utc>>>,
}

impl JournalEntryBuilder {
    pub fn new(ledger_store: LedgerStore, rates: UsdtRateSource) -> Self {
        Self {
            ledger_store,
            rates,
            epoch_date: RwLock::new(None),
        }
    }

    pub fn rates(&self) -> &UsdtRateSource {
        &self.rates
    }

    pub fn epoch_date(&self) -> Option<DateTime<Utc>> {
        *self.epoch_date.read().expect("epoch lock poisoned")
    }

    pub fn set_epoch_date(&self, epoch: DateTime<Utc>) {
        *self.epoch_date.write().expect("epoch lock poisoned") = Some(epoch);
        tracing::info!(epoch = %epoch, "ledger epoch date set");
    }

    /// Venue segment of asset accounts for this event's scope.
    fn venue(event: &Event) -> String {
        let venue = &event.scope.venue;
        if venue.starts_with("BINANCE_") || venue == venues::EXTERNAL {
            venue.clone()
        } else {
            format!("BINANCE_{venue}")
        }
    }

    /// Build at most one entry for `event`. `None` means the event is not
    /// ledger-relevant (non-financial, pre-epoch, or unrepresentable).
    pub async fn from_event(&self, event: &Event) -> Result<Option<JournalEntry>, LedgerError> {
        if let Some(epoch) = self.epoch_date() {
            if event.event_type != EventType::InitialCapitalEstablished && event.ts < epoch {
                tracing::debug!(
                    event_type = %event.event_type,
                    ts = %event.ts,
                    %epoch,
                    "pre-epoch event skipped"
                );
                return Ok(None);
            }
        }

        match event.event_type {
            EventType::TradeExecuted => self.from_trade_executed(event).await.map(Some),
            EventType::FundingApplied => self.from_funding_applied(event).map(Some),
            EventType::FeeCharged => self.from_fee_charged(event).await.map(Some),
            EventType::InternalTransferCompleted => {
                self.from_internal_transfer(event).await.map(Some)
            }
            EventType::DepositCompleted => self.from_deposit(event).await.map(Some),
            EventType::WithdrawCompleted => self.from_withdraw(event).await.map(Some),
            EventType::BalanceChanged => self.from_balance_changed(event).await,
            EventType::DustConverted => self.from_dust_converted(event).await,
            EventType::InitialCapitalEstablished => {
                self.from_initial_capital(event).await.map(Some)
            }
            EventType::OpeningBalanceAdjusted => self.from_opening_adjustment(event).await,
            _ => self.from_generic(event),
        }
    }

    // ------------------------------------------------------------------
    // Trade
    // ------------------------------------------------------------------

    /// BUY: base asset debit, quote credit. SELL mirrors. Commission goes
    /// to the maker/taker expense account; non-zero realized P&L settles
    /// in USDT against the income account.
    async fn from_trade_executed(&self, event: &Event) -> Result<JournalEntry, LedgerError> {
        let venue = Self::venue(event);
        let payload = &event.payload;
        let symbol = event
            .payload_str("symbol")
            .map(str::to_owned)
            .or_else(|| event.scope.symbol.clone())
            .unwrap_or_default();
        let side = event.payload_str("side").unwrap_or("BUY").to_owned();
        let qty = event.payload_decimal("qty").unwrap_or(Decimal::ZERO);
        let price = event.payload_decimal("price").unwrap_or(Decimal::ZERO);
        let commission = event.payload_decimal("commission").unwrap_or(Decimal::ZERO);
        let commission_asset = event
            .payload_str("commission_asset")
            .unwrap_or("USDT")
            .to_owned();
        let realized_pnl = event
            .payload_decimal("realized_pnl")
            .unwrap_or(Decimal::ZERO);
        let is_maker = event.payload_bool("is_maker").unwrap_or(false);

        let quote_asset = "USDT";
        let base_asset = symbol
            .strip_suffix(quote_asset)
            .filter(|base| !base.is_empty())
            .unwrap_or("UNKNOWN")
            .to_owned();
        let quote_amount = qty * price;

        self.ledger_store.ensure_asset_account(&venue, &base_asset).await?;
        self.ledger_store.ensure_asset_account(&venue, quote_asset).await?;
        if commission_asset != base_asset && commission_asset != quote_asset {
            self.ledger_store
                .ensure_asset_account(&venue, &commission_asset)
                .await?;
        }

        let commission_rate = self.rates.rate(&commission_asset, event.ts).await;
        let commission_usdt = commission * commission_rate;

        let mut entry = JournalEntry::for_event(TransactionType::Trade, event);
        entry.related_trade_id = event.payload_str("exchange_trade_id").map(str::to_owned);
        entry.related_order_id = event.payload_str("exchange_order_id").map(str::to_owned);
        entry.symbol = Some(symbol.clone());
        entry.description = Some(format!("{side} {qty} {base_asset} @ {price}"));
        entry.raw_data = Some(payload.clone());

        let base_account = accounts::asset_account(&venue, &base_asset);
        let quote_account = accounts::asset_account(&venue, quote_asset);

        if side == "BUY" {
            entry.lines.push(JournalLine::debit(
                &base_account,
                qty,
                &base_asset,
                quote_amount,
                price,
            ));
            entry.lines.push(JournalLine::credit(
                &quote_account,
                quote_amount,
                quote_asset,
                quote_amount,
                Decimal::ONE,
            ));
        } else {
            entry.lines.push(JournalLine::debit(
                &quote_account,
                quote_amount,
                quote_asset,
                quote_amount,
                Decimal::ONE,
            ));
            entry.lines.push(JournalLine::credit(
                &base_account,
                qty,
                &base_asset,
                quote_amount,
                price,
            ));
        }

        if commission > Decimal::ZERO {
            let fee_account = if is_maker {
                accounts::FEE_TRADING_MAKER
            } else {
                accounts::FEE_TRADING_TAKER
            };
            entry.lines.push(JournalLine::debit(
                fee_account,
                commission,
                &commission_asset,
                commission_usdt,
                commission_rate,
            ));
            entry.lines.push(JournalLine::credit(
                accounts::asset_account(&venue, &commission_asset),
                commission,
                &commission_asset,
                commission_usdt,
                commission_rate,
            ));
        }

        if !realized_pnl.is_zero() {
            let pnl = realized_pnl.abs();
            let usdt_account = accounts::asset_account(&venue, "USDT");
            if realized_pnl > Decimal::ZERO {
                entry.lines.push(JournalLine::debit(
                    &usdt_account,
                    pnl,
                    "USDT",
                    pnl,
                    Decimal::ONE,
                ));
                entry.lines.push(JournalLine::credit(
                    accounts::REALIZED_PNL,
                    pnl,
                    "USDT",
                    pnl,
                    Decimal::ONE,
                ));
            } else {
                entry.lines.push(JournalLine::debit(
                    accounts::REALIZED_PNL,
                    pnl,
                    "USDT",
                    pnl,
                    Decimal::ONE,
                ));
                entry.lines.push(JournalLine::credit(
                    &usdt_account,
                    pnl,
                    "USDT",
                    pnl,
                    Decimal::ONE,
                ));
            }
        }

        Ok(entry)
    }

    // ------------------------------------------------------------------
    // Funding
    // ------------------------------------------------------------------

    /// Funding settles in USDT: a positive fee is paid, negative received.
    fn from_funding_applied(&self, event: &Event) -> Result<JournalEntry, LedgerError> {
        let venue = Self::venue(event);
        let fee = event
            .payload_decimal("funding_fee")
            .unwrap_or(Decimal::ZERO);
        let amount = fee.abs();
        let usdt_account = accounts::asset_account(&venue, "USDT");
        let paid = fee > Decimal::ZERO;

        let transaction_type = if paid {
            TransactionType::FeeFunding
        } else {
            TransactionType::FundingReceived
        };

        let mut entry = JournalEntry::for_event(transaction_type, event);
        entry.symbol = event
            .payload_str("symbol")
            .map(str::to_owned)
            .or_else(|| event.scope.symbol.clone());
        entry.description = Some(format!(
            "Funding {} {amount} USDT",
            if paid { "paid" } else { "received" }
        ));

        if paid {
            entry.lines.push(JournalLine::debit(
                accounts::FEE_FUNDING_PAID,
                amount,
                "USDT",
                amount,
                Decimal::ONE,
            ));
            entry.lines.push(JournalLine::credit(
                &usdt_account,
                amount,
                "USDT",
                amount,
                Decimal::ONE,
            ));
        } else {
            entry.lines.push(JournalLine::debit(
                &usdt_account,
                amount,
                "USDT",
                amount,
                Decimal::ONE,
            ));
            entry.lines.push(JournalLine::credit(
                accounts::FUNDING_RECEIVED,
                amount,
                "USDT",
                amount,
                Decimal::ONE,
            ));
        }

        Ok(entry)
    }

    // ------------------------------------------------------------------
    // Fees
    // ------------------------------------------------------------------

    async fn from_fee_charged(&self, event: &Event) -> Result<JournalEntry, LedgerError> {
        let venue = Self::venue(event);
        let amount = event.payload_decimal("fee").unwrap_or(Decimal::ZERO);
        let fee_type = event.payload_str("fee_type").unwrap_or("TRADING").to_owned();
        let asset = event.payload_str("asset").unwrap_or("USDT").to_owned();

        self.ledger_store.ensure_asset_account(&venue, &asset).await?;

        let rate = self.rates.rate(&asset, event.ts).await;
        let usdt_value = amount * rate;

        let mut entry = JournalEntry::for_event(TransactionType::FeeTrading, event);
        entry.description = Some(format!("Fee {amount} {asset} ({fee_type})"));
        entry.lines.push(JournalLine::debit(
            format!("EXPENSE:FEE:{fee_type}"),
            amount,
            &asset,
            usdt_value,
            rate,
        ));
        entry.lines.push(JournalLine::credit(
            accounts::asset_account(&venue, &asset),
            amount,
            &asset,
            usdt_value,
            rate,
        ));

        Ok(entry)
    }

    // ------------------------------------------------------------------
    // Movement
    // ------------------------------------------------------------------

    async fn from_deposit(&self, event: &Event) -> Result<JournalEntry, LedgerError> {
        let venue = Self::venue(event);
        let amount = event.payload_decimal("amount").unwrap_or(Decimal::ZERO);
        let asset = event.payload_str("asset").unwrap_or("USDT").to_owned();

        self.ledger_store.ensure_asset_account(&venue, &asset).await?;
        self.ledger_store
            .ensure_asset_account(venues::EXTERNAL, &asset)
            .await?;

        let rate = self.rates.rate(&asset, event.ts).await;
        let usdt_value = amount * rate;

        let mut entry = JournalEntry::for_event(TransactionType::Deposit, event);
        entry.description = Some(format!("Deposit {amount} {asset}"));
        entry.memo = event.payload_str("source").map(str::to_owned);
        entry.lines.push(JournalLine::debit(
            accounts::asset_account(&venue, &asset),
            amount,
            &asset,
            usdt_value,
            rate,
        ));
        entry.lines.push(JournalLine::credit(
            accounts::asset_account(venues::EXTERNAL, &asset),
            amount,
            &asset,
            usdt_value,
            rate,
        ));

        Ok(entry)
    }

    /// Withdrawal: the external side receives the net amount, our asset
    /// account credits the gross, and the fee difference lands on the
    /// withdrawal expense account.
    async fn from_withdraw(&self, event: &Event) -> Result<JournalEntry, LedgerError> {
        let venue = Self::venue(event);
        let amount = event.payload_decimal("amount").unwrap_or(Decimal::ZERO);
        let fee = event.payload_decimal("fee").unwrap_or(Decimal::ZERO);
        let asset = event.payload_str("asset").unwrap_or("USDT").to_owned();

        self.ledger_store.ensure_asset_account(&venue, &asset).await?;
        self.ledger_store
            .ensure_asset_account(venues::EXTERNAL, &asset)
            .await?;

        let rate = self.rates.rate(&asset, event.ts).await;
        let net_amount = amount - fee;

        let mut entry = JournalEntry::for_event(TransactionType::Withdrawal, event);
        entry.description = Some(format!("Withdraw {amount} {asset} (fee: {fee})"));
        entry.memo = event.payload_str("destination").map(str::to_owned);
        entry.lines.push(JournalLine::debit(
            accounts::asset_account(venues::EXTERNAL, &asset),
            net_amount,
            &asset,
            net_amount * rate,
            rate,
        ));
        entry.lines.push(JournalLine::credit(
            accounts::asset_account(&venue, &asset),
            amount,
            &asset,
            amount * rate,
            rate,
        ));
        if fee > Decimal::ZERO {
            entry.lines.push(JournalLine::debit(
                accounts::FEE_WITHDRAWAL,
                fee,
                &asset,
                fee * rate,
                rate,
            ));
        }

        Ok(entry)
    }

    async fn from_internal_transfer(&self, event: &Event) -> Result<JournalEntry, LedgerError> {
        let from_venue = event
            .payload_str("from_venue")
            .unwrap_or(venues::BINANCE_SPOT)
            .to_owned();
        let to_venue = event
            .payload_str("to_venue")
            .unwrap_or(venues::BINANCE_FUTURES)
            .to_owned();
        let amount = event.payload_decimal("amount").unwrap_or(Decimal::ZERO);
        let asset = event.payload_str("asset").unwrap_or("USDT").to_owned();

        self.ledger_store.ensure_asset_account(&from_venue, &asset).await?;
        self.ledger_store.ensure_asset_account(&to_venue, &asset).await?;

        let rate = self.rates.rate(&asset, event.ts).await;
        let usdt_value = amount * rate;

        let mut entry = JournalEntry::for_event(TransactionType::InternalTransfer, event);
        entry.description = Some(format!(
            "Transfer {amount} {asset} from {from_venue} to {to_venue}"
        ));
        entry.lines.push(JournalLine::debit(
            accounts::asset_account(&to_venue, &asset),
            amount,
            &asset,
            usdt_value,
            rate,
        ));
        entry.lines.push(JournalLine::credit(
            accounts::asset_account(&from_venue, &asset),
            amount,
            &asset,
            usdt_value,
            rate,
        ));

        Ok(entry)
    }

    // ------------------------------------------------------------------
    // Residual balance changes
    // ------------------------------------------------------------------

    /// A balance change nothing else explains. With a signed `delta` the
    /// movement posts against suspense; without one it cannot be
    /// represented and is skipped.
    async fn from_balance_changed(
        &self,
        event: &Event,
    ) -> Result<Option<JournalEntry>, LedgerError> {
        let Some(delta) = event.payload_decimal("delta") else {
            tracing::debug!(event_id = %event.event_id, "BalanceChanged without delta, skipped");
            return Ok(None);
        };
        if delta.is_zero() {
            return Ok(None);
        }

        let venue = Self::venue(event);
        let asset = event.payload_str("asset").unwrap_or("USDT").to_owned();
        self.ledger_store.ensure_asset_account(&venue, &asset).await?;

        let rate = self.rates.rate(&asset, event.ts).await;
        let amount = delta.abs();
        let usdt_value = amount * rate;
        let asset_account = accounts::asset_account(&venue, &asset);

        let mut entry = JournalEntry::for_event(TransactionType::Adjustment, event);
        entry.description = Some(format!(
            "Balance {}: {asset} {delta}",
            if delta > Decimal::ZERO { "increased" } else { "decreased" }
        ));

        if delta > Decimal::ZERO {
            entry.lines.push(JournalLine::debit(
                &asset_account,
                amount,
                &asset,
                usdt_value,
                rate,
            ));
            entry.lines.push(JournalLine::credit(
                accounts::SUSPENSE,
                amount,
                &asset,
                usdt_value,
                rate,
            ));
        } else {
            entry.lines.push(JournalLine::debit(
                accounts::SUSPENSE,
                amount,
                &asset,
                usdt_value,
                rate,
            ));
            entry.lines.push(JournalLine::credit(
                &asset_account,
                amount,
                &asset,
                usdt_value,
                rate,
            ));
        }

        Ok(Some(entry))
    }

    // ------------------------------------------------------------------
    // Dust conversion
    // ------------------------------------------------------------------

    /// Small balances converted to BNB at an unfavourable rate. The
    /// residue between the value given up and the value received (net BNB
    /// plus the service charge) closes the entry as conversion loss --
    /// or, rarely, gain.
    async fn from_dust_converted(
        &self,
        event: &Event,
    ) -> Result<Option<JournalEntry>, LedgerError> {
        // dust conversion happens on the spot wallet
        let venue = venues::BINANCE_SPOT;
        let Some(details) = event.payload.get("details").and_then(Value::as_array) else {
            tracing::warn!(event_id = %event.event_id, "DustConverted without details");
            return Ok(None);
        };

        self.ledger_store.ensure_asset_account(venue, "BNB").await?;

        let mut entry = JournalEntry::for_event(TransactionType::Other, event);
        entry.raw_data = Some(event.payload.clone());

        let mut converted = Vec::new();
        let mut total_from_usdt = Decimal::ZERO;

        for detail in details {
            let from_asset = detail
                .get("fromAsset")
                .and_then(Value::as_str)
                .unwrap_or("UNKNOWN")
                .to_owned();
            let from_amount: Decimal = detail
                .get("amount")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or(Decimal::ZERO);
            if from_amount.is_zero() {
                continue;
            }

            self.ledger_store.ensure_asset_account(venue, &from_asset).await?;

            let rate = self.rates.rate(&from_asset, event.ts).await;
            let usdt_value = from_amount * rate;
            total_from_usdt += usdt_value;

            entry.lines.push(
                JournalLine::credit(
                    accounts::asset_account(venue, &from_asset),
                    from_amount,
                    &from_asset,
                    usdt_value,
                    rate,
                )
                .with_memo(format!("Dust conversion from {from_asset}")),
            );
            converted.push(format!("{from_amount} {from_asset}"));
        }

        let net_bnb = event
            .payload_decimal("total_transferred_amount")
            .unwrap_or(Decimal::ZERO);
        let fee_bnb = event
            .payload_decimal("total_service_charge")
            .unwrap_or(Decimal::ZERO);
        let bnb_rate = self.rates.rate("BNB", event.ts).await;

        let net_bnb_usdt = net_bnb * bnb_rate;
        entry.lines.push(
            JournalLine::debit(
                accounts::asset_account(venue, "BNB"),
                net_bnb,
                "BNB",
                net_bnb_usdt,
                bnb_rate,
            )
            .with_memo("BNB received from dust conversion"),
        );

        let fee_usdt = fee_bnb * bnb_rate;
        if fee_bnb > Decimal::ZERO {
            entry.lines.push(
                JournalLine::debit(
                    accounts::FEE_DUST_CONVERSION,
                    fee_bnb,
                    "BNB",
                    fee_usdt,
                    bnb_rate,
                )
                .with_memo("Dust conversion fee"),
            );
        }

        // residue = value given up - value received; debit loss / credit gain
        let residue = total_from_usdt - (net_bnb_usdt + fee_usdt);
        if residue > CONVERSION_RESIDUE_FLOOR {
            entry.lines.push(
                JournalLine::debit(
                    accounts::CONVERSION_LOSS,
                    residue,
                    "USDT",
                    residue,
                    Decimal::ONE,
                )
                .with_memo("Dust conversion loss (unfavorable rate)"),
            );
        } else if residue < -CONVERSION_RESIDUE_FLOOR {
            let gain = residue.abs();
            entry.lines.push(
                JournalLine::credit(
                    accounts::CONVERSION_GAIN,
                    gain,
                    "USDT",
                    gain,
                    Decimal::ONE,
                )
                .with_memo("Dust conversion gain"),
            );
        }

        entry.description = Some(format!(
            "Dust converted: {} -> {net_bnb} BNB",
            converted.join(", ")
        ));
        Ok(Some(entry))
    }

    // ------------------------------------------------------------------
    // Capital
    // ------------------------------------------------------------------

    /// The snapshot of everything held at go-live, debited per asset and
    /// credited to initial capital. Also establishes the epoch date.
    async fn from_initial_capital(&self, event: &Event) -> Result<JournalEntry, LedgerError> {
        let mut entry = JournalEntry::for_event(TransactionType::Other, event);
        entry.raw_data = Some(event.payload.clone());

        let mut total_usdt = Decimal::ZERO;
        let mut parts = Vec::new();

        if let Some(balances) = event.payload.get("spot_balances").and_then(Value::as_array) {
            for balance in balances {
                let asset = balance
                    .get("asset")
                    .and_then(Value::as_str)
                    .unwrap_or("UNKNOWN")
                    .to_owned();
                let free: Decimal = balance
                    .get("free")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(Decimal::ZERO);
                let locked: Decimal = balance
                    .get("locked")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(Decimal::ZERO);
                let amount = free + locked;
                if amount <= Decimal::ZERO {
                    continue;
                }

                self.ledger_store
                    .ensure_asset_account(venues::BINANCE_SPOT, &asset)
                    .await?;
                let rate = self.rates.rate(&asset, event.ts).await;
                let usdt_value = amount * rate;
                total_usdt += usdt_value;

                entry.lines.push(
                    JournalLine::debit(
                        accounts::asset_account(venues::BINANCE_SPOT, &asset),
                        amount,
                        &asset,
                        usdt_value,
                        rate,
                    )
                    .with_memo(format!("Initial SPOT {asset}")),
                );
                parts.push(format!("SPOT {amount} {asset}"));
            }
        }

        if let Some(assets) = event.payload.get("futures_assets").and_then(Value::as_array) {
            for info in assets {
                let asset = info
                    .get("asset")
                    .and_then(Value::as_str)
                    .unwrap_or("UNKNOWN")
                    .to_owned();
                let amount: Decimal = info
                    .get("walletBalance")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(Decimal::ZERO);
                if amount <= Decimal::ZERO {
                    continue;
                }

                self.ledger_store
                    .ensure_asset_account(venues::BINANCE_FUTURES, &asset)
                    .await?;
                let rate = self.rates.rate(&asset, event.ts).await;
                let usdt_value = amount * rate;
                total_usdt += usdt_value;

                entry.lines.push(
                    JournalLine::debit(
                        accounts::asset_account(venues::BINANCE_FUTURES, &asset),
                        amount,
                        &asset,
                        usdt_value,
                        rate,
                    )
                    .with_memo(format!("Initial FUTURES {asset}")),
                );
                parts.push(format!("FUTURES {amount} {asset}"));
            }
        }

        if total_usdt > Decimal::ZERO {
            entry.lines.push(
                JournalLine::credit(
                    accounts::INITIAL_CAPITAL,
                    total_usdt,
                    "USDT",
                    total_usdt,
                    Decimal::ONE,
                )
                .with_memo("Initial capital established"),
            );
        }

        let snapshot_date = event.payload_str("snapshot_date").unwrap_or("unknown");
        entry.description = Some(format!("Initial capital: {total_usdt} USDT ({snapshot_date})"));
        entry.memo = Some(format!("Snapshot date: {snapshot_date}"));

        // this event defines the ledger's epoch
        self.set_epoch_date(event.ts);

        Ok(entry)
    }

    /// Closes the gap between the ledger balance and the exchange balance
    /// after a backfill, in whichever direction closes the delta.
    async fn from_opening_adjustment(
        &self,
        event: &Event,
    ) -> Result<Option<JournalEntry>, LedgerError> {
        let venue_raw = event.payload_str("venue").unwrap_or("FUTURES");
        let venue = if venue_raw.starts_with("BINANCE_") {
            venue_raw.to_owned()
        } else {
            format!("BINANCE_{venue_raw}")
        };
        let asset = event.payload_str("asset").unwrap_or("USDT").to_owned();
        let amount = event
            .payload_decimal("adjustment_amount")
            .unwrap_or(Decimal::ZERO)
            .abs();
        let increase = event.payload_str("adjustment_type").unwrap_or("INCREASE") == "INCREASE";

        if amount.is_zero() {
            tracing::debug!(venue = %venue, asset = %asset, "zero adjustment, skipped");
            return Ok(None);
        }

        self.ledger_store.ensure_asset_account(&venue, &asset).await?;

        let rate = self.rates.rate(&asset, event.ts).await;
        let usdt_value = amount * rate;
        let asset_account = accounts::asset_account(&venue, &asset);

        let mut entry = JournalEntry::for_event(TransactionType::Adjustment, event);
        entry.raw_data = Some(event.payload.clone());
        entry.memo = event
            .payload_str("reason")
            .map(str::to_owned)
            .or(Some("opening_balance_reconciliation".to_owned()));

        if increase {
            entry.lines.push(
                JournalLine::debit(&asset_account, amount, &asset, usdt_value, rate)
                    .with_memo(format!("Opening adjustment: +{amount} {asset}")),
            );
            entry.lines.push(
                JournalLine::credit(
                    accounts::OPENING_ADJUSTMENT,
                    usdt_value,
                    "USDT",
                    usdt_value,
                    Decimal::ONE,
                )
                .with_memo("Opening balance reconciliation"),
            );
        } else {
            entry.lines.push(
                JournalLine::debit(
                    accounts::OPENING_ADJUSTMENT,
                    usdt_value,
                    "USDT",
                    usdt_value,
                    Decimal::ONE,
                )
                .with_memo("Opening balance reconciliation"),
            );
            entry.lines.push(
                JournalLine::credit(&asset_account, amount, &asset, usdt_value, rate)
                    .with_memo(format!("Opening adjustment: -{amount} {asset}")),
            );
        }

        let ledger_balance = event.payload_str("ledger_balance").unwrap_or("0");
        let exchange_balance = event.payload_str("exchange_balance").unwrap_or("0");
        let sign = if increase { "+" } else { "-" };
        entry.description = Some(format!(
            "Opening adjustment: {venue} {asset} {sign}{amount} (ledger:{ledger_balance} -> exchange:{exchange_balance})"
        ));

        Ok(Some(entry))
    }

    // ------------------------------------------------------------------
    // Fallback
    // ------------------------------------------------------------------

    /// Unknown event types: non-financial ones are dropped; anything that
    /// might be money is parked on suspense with zero-amount lines,
    /// preserving the raw payload for the investigation.
    fn from_generic(&self, event: &Event) -> Result<Option<JournalEntry>, LedgerError> {
        if is_non_financial(event.event_type) {
            tracing::debug!(event_type = %event.event_type, "non-financial event ignored");
            return Ok(None);
        }

        tracing::warn!(
            event_type = %event.event_type,
            event_id = %event.event_id,
            "unknown financial event, parked on suspense"
        );

        let mut entry = JournalEntry::for_event(TransactionType::Unknown, event);
        entry.source = "FALLBACK".to_owned();
        entry.description = Some(format!("Unhandled event: {}", event.event_type));
        entry.memo = Some(format!("event_type={}", event.event_type));
        entry.raw_data = Some(event.payload.clone());
        entry.lines.push(
            JournalLine::debit(
                accounts::SUSPENSE,
                Decimal::ZERO,
                "UNKNOWN",
                Decimal::ZERO,
                Decimal::ZERO,
            )
            .with_memo(format!("Unhandled: {}", event.event_type)),
        );
        entry.lines.push(
            JournalLine::credit(
                accounts::SUSPENSE,
                Decimal::ZERO,
                "UNKNOWN",
                Decimal::ZERO,
                Decimal::ZERO,
            )
            .with_memo(format!("Unhandled: {}", event.event_type)),
        );

        Ok(Some(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::events::dedup;
    use crate::exchange::MockExchangeClient;
    use crate::ledger::schema::init_ledger_schema;
    use crate::types::{EntityKind, EventSource, Scope, TradingMode};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use serde_json::json;

    async fn builder() -> JournalEntryBuilder {
        let db = Database::connect_in_memory().await.unwrap();
        init_ledger_schema(db.pool()).await.unwrap();
        let store = LedgerStore::new(db.pool().clone());
        JournalEntryBuilder::new(store, UsdtRateSource::new(None))
    }

    fn scope() -> Scope {
        Scope::binance_futures("main", TradingMode::Testnet).with_symbol("BTCUSDT")
    }

    fn trade_event(payload: Value) -> Event {
        Event::create(
            EventType::TradeExecuted,
            EventSource::Websocket,
            EntityKind::Trade,
            "12345",
            scope(),
            dedup::trade_key("BINANCE", "FUTURES", "BTCUSDT", "12345"),
            payload,
        )
    }

    #[tokio::test]
    async fn test_buy_trade_entry_balances() {
        let builder = builder().await;
        let event = trade_event(json!({
            "exchange_trade_id": "12345",
            "symbol": "BTCUSDT",
            "side": "BUY",
            "qty": "0.001",
            "price": "45000",
            "commission": "0.045",
            "commission_asset": "USDT",
            "realized_pnl": "0",
        }));

        let entry = builder.from_event(&event).await.unwrap().unwrap();
        assert_eq!(entry.transaction_type, TransactionType::Trade);
        assert_eq!(entry.lines.len(), 4);
        assert_eq!(entry.debit_total(), dec!(45.045));
        assert_eq!(entry.credit_total(), dec!(45.045));
        assert!(entry.is_balanced());

        // base debit, quote credit
        assert_eq!(entry.lines[0].account_id, "ASSET:BINANCE_FUTURES:BTC");
        assert_eq!(entry.lines[0].side, JournalSide::Debit);
        assert_eq!(entry.lines[0].amount, dec!(0.001));
        assert_eq!(entry.lines[1].account_id, "ASSET:BINANCE_FUTURES:USDT");
        assert_eq!(entry.lines[1].side, JournalSide::Credit);
        // taker fee by default
        assert_eq!(entry.lines[2].account_id, "EXPENSE:FEE:TRADING:TAKER");
    }

    #[tokio::test]
    async fn test_sell_trade_with_pnl() {
        let builder = builder().await;
        let event = trade_event(json!({
            "symbol": "BTCUSDT",
            "side": "SELL",
            "qty": "0.001",
            "price": "46000",
            "commission": "0",
            "commission_asset": "USDT",
            "realized_pnl": "1.5",
            "is_maker": true,
        }));

        let entry = builder.from_event(&event).await.unwrap().unwrap();
        assert!(entry.is_balanced());
        // no commission lines, but two P&L lines
        assert_eq!(entry.lines.len(), 4);
        let pnl_line = entry
            .lines
            .iter()
            .find(|l| l.account_id == accounts::REALIZED_PNL)
            .unwrap();
        assert_eq!(pnl_line.side, JournalSide::Credit);
        assert_eq!(pnl_line.amount, dec!(1.5));
    }

    #[tokio::test]
    async fn test_zero_pnl_emits_no_pnl_lines() {
        let builder = builder().await;
        let event = trade_event(json!({
            "symbol": "BTCUSDT",
            "side": "BUY",
            "qty": "1",
            "price": "10",
            "commission": "0",
            "realized_pnl": "0",
        }));

        let entry = builder.from_event(&event).await.unwrap().unwrap();
        assert!(entry
            .lines
            .iter()
            .all(|l| l.account_id != accounts::REALIZED_PNL));
    }

    #[tokio::test]
    async fn test_funding_paid_and_received() {
        let builder = builder().await;
        let paid = Event::create(
            EventType::FundingApplied,
            EventSource::Rest,
            EntityKind::Balance,
            "BTCUSDT",
            scope(),
            "BINANCE:FUTURES:BTCUSDT:funding:1",
            json!({"symbol": "BTCUSDT", "funding_fee": "0.25"}),
        );
        let entry = builder.from_event(&paid).await.unwrap().unwrap();
        assert_eq!(entry.transaction_type, TransactionType::FeeFunding);
        assert_eq!(entry.lines[0].account_id, accounts::FEE_FUNDING_PAID);
        assert!(entry.is_balanced());

        let received = Event::create(
            EventType::FundingApplied,
            EventSource::Rest,
            EntityKind::Balance,
            "BTCUSDT",
            scope(),
            "BINANCE:FUTURES:BTCUSDT:funding:2",
            json!({"symbol": "BTCUSDT", "funding_fee": "-0.10"}),
        );
        let entry = builder.from_event(&received).await.unwrap().unwrap();
        assert_eq!(entry.transaction_type, TransactionType::FundingReceived);
        assert_eq!(entry.lines[1].account_id, accounts::FUNDING_RECEIVED);
        assert!(entry.is_balanced());
    }

    #[tokio::test]
    async fn test_balance_changed_without_delta_is_skipped() {
        let builder = builder().await;
        let event = Event::create(
            EventType::BalanceChanged,
            EventSource::Websocket,
            EntityKind::Balance,
            "USDT",
            scope(),
            "BINANCE:FUTURES:main:USDT:balance:1",
            json!({"asset": "USDT", "wallet_balance": "100"}),
        );
        assert!(builder.from_event(&event).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_balance_changed_with_delta_posts_suspense() {
        let builder = builder().await;
        let event = Event::create(
            EventType::BalanceChanged,
            EventSource::Websocket,
            EntityKind::Balance,
            "USDT",
            scope(),
            "BINANCE:FUTURES:main:USDT:balance:2",
            json!({"asset": "USDT", "delta": "-5"}),
        );
        let entry = builder.from_event(&event).await.unwrap().unwrap();
        assert_eq!(entry.transaction_type, TransactionType::Adjustment);
        assert_eq!(entry.lines[0].account_id, accounts::SUSPENSE);
        assert_eq!(entry.lines[0].side, JournalSide::Debit);
        assert!(entry.is_balanced());
    }

    #[tokio::test]
    async fn test_withdraw_with_fee() {
        let builder = builder().await;
        let event = Event::create(
            EventType::WithdrawCompleted,
            EventSource::Bot,
            EntityKind::Transfer,
            "w1",
            scope(),
            "BINANCE:FUTURES:withdraw:w1",
            json!({"amount": "100", "fee": "1", "asset": "USDT"}),
        );

        let entry = builder.from_event(&event).await.unwrap().unwrap();
        assert_eq!(entry.transaction_type, TransactionType::Withdrawal);
        assert_eq!(entry.lines.len(), 3);
        // 99 external + 1 fee = 100 internal
        assert!(entry.is_balanced());
        let fee_line = entry
            .lines
            .iter()
            .find(|l| l.account_id == accounts::FEE_WITHDRAWAL)
            .unwrap();
        assert_eq!(fee_line.amount, dec!(1));
    }

    #[tokio::test]
    async fn test_dust_conversion_closes_with_loss() {
        let builder = builder().await;
        builder.rates().set_price("BNBUSDT", dec!(500));

        let event = Event::create(
            EventType::DustConverted,
            EventSource::Rest,
            EntityKind::Balance,
            "dust-1",
            scope(),
            "BINANCE:SPOT:dust:1",
            json!({
                "trans_id": "308145879259",
                "total_transferred_amount": "0.0018",  // 0.9 USDT
                "total_service_charge": "0.0001",      // 0.05 USDT
                "details": [
                    {"fromAsset": "USDT", "amount": "1.0", "transferedAmount": "0.0018"},
                ],
            }),
        );

        let entry = builder.from_event(&event).await.unwrap().unwrap();
        // 1.0 USDT given up = 0.9 BNB value + 0.05 fee + 0.05 loss
        let loss_line = entry
            .lines
            .iter()
            .find(|l| l.account_id == accounts::CONVERSION_LOSS)
            .unwrap();
        assert_eq!(loss_line.usdt_value, dec!(0.05));
        assert!(entry.is_balanced());
    }

    #[tokio::test]
    async fn test_initial_capital_sets_epoch_and_balances() {
        let builder = builder().await;
        let event = Event::create(
            EventType::InitialCapitalEstablished,
            EventSource::Bot,
            EntityKind::Capital,
            "initial",
            scope(),
            "BINANCE:FUTURES:initial-capital:2026-02-18",
            json!({
                "snapshot_date": "2026-02-18",
                "spot_balances": [
                    {"asset": "USDT", "free": "0.5", "locked": "0"},
                ],
                "futures_assets": [
                    {"asset": "USDT", "walletBalance": "673.5"},
                ],
            }),
        );

        assert!(builder.epoch_date().is_none());
        let entry = builder.from_event(&event).await.unwrap().unwrap();

        assert!(entry.is_balanced());
        assert_eq!(entry.debit_total(), dec!(674.0));
        let capital = entry
            .lines
            .iter()
            .find(|l| l.account_id == accounts::INITIAL_CAPITAL)
            .unwrap();
        assert_eq!(capital.side, JournalSide::Credit);
        assert_eq!(capital.amount, dec!(674.0));
        assert_eq!(builder.epoch_date(), Some(event.ts));
    }

    #[tokio::test]
    async fn test_epoch_filters_prior_events() {
        let builder = builder().await;
        let epoch = Utc.with_ymd_and_hms(2026, 2, 18, 0, 0, 0).unwrap();
        builder.set_epoch_date(epoch);

        let mut event = trade_event(json!({
            "symbol": "BTCUSDT", "side": "BUY", "qty": "1", "price": "10",
        }));
        event.ts = Utc.with_ymd_and_hms(2026, 2, 17, 23, 0, 0).unwrap();

        assert!(builder.from_event(&event).await.unwrap().is_none());

        event.ts = Utc.with_ymd_and_hms(2026, 2, 18, 1, 0, 0).unwrap();
        assert!(builder.from_event(&event).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_non_financial_event_skipped() {
        let builder = builder().await;
        let event = Event::create(
            EventType::EngineStarted,
            EventSource::Bot,
            EntityKind::Engine,
            "engine",
            scope(),
            "BINANCE:FUTURES:engine:1",
            json!({}),
        );
        assert!(builder.from_event(&event).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_financial_event_parks_on_suspense() {
        let builder = builder().await;
        let event = Event::create(
            EventType::ConvertExecuted,
            EventSource::Rest,
            EntityKind::Balance,
            "c1",
            scope(),
            "BINANCE:FUTURES:convert:c1",
            json!({"from": "USDT", "to": "BTC"}),
        );

        let entry = builder.from_event(&event).await.unwrap().unwrap();
        assert_eq!(entry.transaction_type, TransactionType::Unknown);
        assert_eq!(entry.lines.len(), 2);
        assert!(entry.lines.iter().all(|l| l.account_id == accounts::SUSPENSE));
        assert!(entry.lines.iter().all(|l| l.amount.is_zero()));
        assert!(entry.is_balanced());
    }

    #[tokio::test]
    async fn test_rate_source_uses_klines_then_cache() {
        let mock = Arc::new(MockExchangeClient::new());
        mock.set_price("BNBUSDT", dec!(580)).await;
        let rates = UsdtRateSource::new(Some(mock.clone()));

        let ts = Utc::now();
        assert_eq!(rates.rate("USDT", ts).await, Decimal::ONE);
        assert_eq!(rates.rate("BNB", ts).await, dec!(580));

        // cached now; a price override on the feed wins next time only if set
        rates.set_price("BNBUSDT", dec!(600));
        assert_eq!(rates.rate("BNB", ts).await, dec!(600));

        // unknown asset falls back to 1 with a warning
        assert_eq!(rates.rate("NOCOIN", ts).await, Decimal::ONE);
    }
}
