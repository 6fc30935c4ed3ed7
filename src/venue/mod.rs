// SPDX-License-Identifier: MIT
//
// Copyright (c) 2025 Vantage Systems
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

//! Venue adapter contract and the shared error taxonomy.
//!
//! Every venue-specific payload is normalized at this boundary: callers
//! above the adapter never branch on venue error text, and expected venue
//! failures (rate limit, invalid symbol) travel as [`VenueError`] values,
//! never panics.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::candle::{CandleSeries, Timeframe};
use crate::config::{Credentials, VenueId};

pub mod alpaca;
pub mod binance;
pub mod bybit;

pub use alpaca::AlpacaAdapter;
pub use binance::BinanceAdapter;
pub use bybit::BybitAdapter;

/// Shared error-kind taxonomy every adapter maps venue payloads into.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum VenueError {
    #[error("credentials rejected: {0}")]
    CredentialsInvalid(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("insufficient margin: {0}")]
    InsufficientMargin(String),

    #[error("below minimum notional: {0}")]
    MinNotionalViolation(String),

    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("trigger would fill immediately: {0}")]
    TriggerAlreadyMet(String),

    #[error("unknown order: {0}")]
    UnknownOrder(String),

    #[error("network timeout: {0}")]
    NetworkTimeout(String),

    #[error("venue unavailable: {0}")]
    VenueUnavailable(String),

    #[error("no data: {0}")]
    NoData(String),
}

impl VenueError {
    /// Non-fatal signals that mean "skip this cycle", not "abort".
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VenueError::RateLimited(_) | VenueError::NoData(_) | VenueError::NetworkTimeout(_)
        )
    }

    /// Failures that should put the symbol on a cool-down instead of a retry:
    /// re-attempting the same trade cannot succeed until conditions change.
    pub fn wants_cooldown(&self) -> bool {
        matches!(
            self,
            VenueError::InsufficientMargin(_) | VenueError::MinNotionalViolation(_)
        )
    }
}

/// Result type for all adapter operations.
pub type VenueResult<T> = Result<T, VenueError>;

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn flipped(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Side of the order that closes this position.
    pub fn closing_side(&self) -> Side {
        match self {
            PositionSide::Long => Side::Sell,
            PositionSide::Short => Side::Buy,
        }
    }
}

/// Abstract order kinds the gateway understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
    StopLoss,
    TakeProfit,
    TrailingStop,
}

impl OrderKind {
    pub fn is_conditional(&self) -> bool {
        matches!(
            self,
            OrderKind::StopLoss | OrderKind::TakeProfit | OrderKind::TrailingStop
        )
    }
}

/// Venue-neutral trigger direction for conditional orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerDirection {
    /// Fires when price rises through the trigger
    RisesThrough,
    /// Fires when price falls through the trigger
    FallsThrough,
}

/// The venue-neutral trigger table. A stop-loss protecting a long fires on
/// the way down; its take-profit fires on the way up; both invert for a
/// short. Adapters translate the result into their wire representation.
pub fn trigger_direction(kind: OrderKind, closing: PositionSide) -> Option<TriggerDirection> {
    match (kind, closing) {
        (OrderKind::StopLoss, PositionSide::Long) => Some(TriggerDirection::FallsThrough),
        (OrderKind::TakeProfit, PositionSide::Long) => Some(TriggerDirection::RisesThrough),
        (OrderKind::StopLoss, PositionSide::Short) => Some(TriggerDirection::RisesThrough),
        (OrderKind::TakeProfit, PositionSide::Short) => Some(TriggerDirection::FallsThrough),
        (OrderKind::TrailingStop, PositionSide::Long) => Some(TriggerDirection::FallsThrough),
        (OrderKind::TrailingStop, PositionSide::Short) => Some(TriggerDirection::RisesThrough),
        _ => None,
    }
}

/// Intent to trade, venue-neutral.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Canonical symbol (adapters apply venue spelling)
    pub symbol: String,
    /// Buy or sell
    pub side: Side,
    /// Abstract order kind
    pub kind: OrderKind,
    /// Base quantity, must be positive
    pub quantity: f64,
    /// Limit price for limit orders
    pub price: Option<f64>,
    /// Trigger price for conditional orders
    pub trigger_price: Option<f64>,
    /// Only allowed to shrink an existing position
    pub reduce_only: bool,
    /// Position this conditional order protects, used for trigger mapping
    pub closes: Option<PositionSide>,
    /// Client-assigned id for idempotent submission
    pub client_id: Option<String>,
}

impl OrderRequest {
    /// Plain market order.
    pub fn market(symbol: &str, side: Side, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            kind: OrderKind::Market,
            quantity,
            price: None,
            trigger_price: None,
            reduce_only: false,
            closes: None,
            client_id: None,
        }
    }

    /// Conditional order protecting an open position.
    pub fn conditional(
        symbol: &str,
        kind: OrderKind,
        closes: PositionSide,
        quantity: f64,
        trigger_price: f64,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: closes.closing_side(),
            kind,
            quantity,
            price: None,
            trigger_price: Some(trigger_price),
            reduce_only: true,
            closes: Some(closes),
            client_id: None,
        }
    }

    /// Basic sanity checks before any venue round trip.
    pub fn validate(&self) -> VenueResult<()> {
        if self.quantity <= 0.0 {
            return Err(VenueError::MinNotionalViolation(format!(
                "quantity {} must be positive",
                self.quantity
            )));
        }
        if self.kind.is_conditional() && self.trigger_price.is_none() {
            return Err(VenueError::TriggerAlreadyMet(
                "conditional order without trigger price".to_string(),
            ));
        }
        Ok(())
    }
}

/// Order submission status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Accepted,
    Filled,
    Rejected,
}

/// Outcome of an order request. `error` is mutually exclusive with a
/// successful id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    /// Venue-assigned order id on success
    pub order_id: Option<String>,
    /// Submission status
    pub status: OrderStatus,
    /// Fill price when the venue reported one
    pub filled_price: Option<f64>,
    /// Normalized error on rejection
    pub error: Option<VenueError>,
}

impl OrderResult {
    pub fn accepted(order_id: String, filled_price: Option<f64>) -> Self {
        Self {
            order_id: Some(order_id),
            status: OrderStatus::Accepted,
            filled_price,
            error: None,
        }
    }

    pub fn filled(order_id: String, price: f64) -> Self {
        Self {
            order_id: Some(order_id),
            status: OrderStatus::Filled,
            filled_price: Some(price),
            error: None,
        }
    }

    pub fn rejected(error: VenueError) -> Self {
        Self {
            order_id: None,
            status: OrderStatus::Rejected,
            filled_price: None,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Account balance on one venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceState {
    /// Total balance including margin in use
    pub total: f64,
    /// Balance available for new orders, never above `total`
    pub available: f64,
    /// Settlement currency
    pub currency: String,
}

impl BalanceState {
    pub fn new(total: f64, available: f64, currency: &str) -> Self {
        Self {
            total,
            available: available.min(total),
            currency: currency.to_string(),
        }
    }
}

/// Open position on one venue. A zero-quantity position is never stored;
/// adapters filter those out before returning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: f64,
}

/// Exchange filters for a symbol, where the venue exposes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolMetadata {
    pub min_qty: f64,
    pub qty_step: f64,
    pub min_notional: f64,
}

/// Capability contract every venue implementation satisfies.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    /// Which venue this adapter speaks to.
    fn venue(&self) -> VenueId;

    /// Authenticate and probe account settings. Must be called before any
    /// trading operation; detection results (e.g. position mode) are cached
    /// for the adapter's lifetime.
    async fn initialize(&self) -> VenueResult<()>;

    /// Fetch recent candles. An empty venue response is not an error: the
    /// adapter logs it and returns an empty series.
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> VenueResult<CandleSeries>;

    /// Current account balance.
    async fn balance(&self) -> VenueResult<BalanceState>;

    /// Submit an order. Expected rejections come back as an `OrderResult`
    /// carrying the normalized error, not as an `Err`.
    async fn place_order(&self, request: &OrderRequest) -> VenueResult<OrderResult>;

    /// Cancel all open orders for a symbol. A cancel target that no longer
    /// exists is normalized to success.
    async fn cancel_orders(&self, symbol: &str) -> VenueResult<()>;

    /// All open positions, zero-quantity entries filtered out.
    async fn positions(&self) -> VenueResult<Vec<PositionState>>;

    /// Close any open position on the symbol with a reduce-only market
    /// order. An already-flat symbol is normalized to success.
    async fn close_position(&self, symbol: &str) -> VenueResult<OrderResult>;

    /// Last traded price from the single most-recent candle.
    async fn last_price(&self, symbol: &str, timeframe: Timeframe) -> VenueResult<f64> {
        let series = self.fetch_candles(symbol, timeframe, 1).await?;
        series
            .last_price()
            .ok_or_else(|| VenueError::NoData(format!("no recent candle for {}", symbol)))
    }

    /// Exchange filters for a symbol, when the venue exposes them.
    async fn symbol_metadata(&self, _symbol: &str) -> VenueResult<Option<SymbolMetadata>> {
        Ok(None)
    }

    /// Whether the venue can cancel all orders in a single call.
    fn supports_cancel_all(&self) -> bool {
        false
    }

    /// Whether the venue supports native trailing stops.
    fn supports_trailing_stop(&self) -> bool {
        false
    }

    /// Release underlying connections. Idempotent.
    async fn close(&self) -> VenueResult<()>;
}

/// Default REST timeout across adapters.
pub const REST_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the shared HTTP client for an adapter, honoring the configured
/// proxy for REST. Streaming connections are opened separately and bypass
/// the proxy.
pub(crate) fn build_http_client(credentials: &Credentials) -> VenueResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(REST_TIMEOUT);
    if let Some(proxy_url) = &credentials.proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| VenueError::VenueUnavailable(format!("bad proxy url: {}", e)))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| VenueError::VenueUnavailable(format!("http client: {}", e)))
}

/// Normalize transport-level failures.
pub(crate) fn transport_error(err: reqwest::Error) -> VenueError {
    if err.is_timeout() {
        VenueError::NetworkTimeout(err.to_string())
    } else if err.is_connect() {
        VenueError::VenueUnavailable(err.to_string())
    } else {
        VenueError::NetworkTimeout(err.to_string())
    }
}

/// Construct an adapter by venue name and credentials.
pub fn create_adapter(venue: VenueId, credentials: Credentials) -> Arc<dyn VenueAdapter> {
    match venue {
        VenueId::Binance => Arc::new(BinanceAdapter::new(credentials)),
        VenueId::Bybit => Arc::new(BybitAdapter::new(credentials)),
        VenueId::Alpaca => Arc::new(AlpacaAdapter::new(credentials)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_trigger_table_is_exhaustive() {
        // (kind, closing side) -> direction, all four core combinations.
        assert_eq!(
            trigger_direction(OrderKind::StopLoss, PositionSide::Long),
            Some(TriggerDirection::FallsThrough)
        );
        assert_eq!(
            trigger_direction(OrderKind::TakeProfit, PositionSide::Long),
            Some(TriggerDirection::RisesThrough)
        );
        assert_eq!(
            trigger_direction(OrderKind::StopLoss, PositionSide::Short),
            Some(TriggerDirection::RisesThrough)
        );
        assert_eq!(
            trigger_direction(OrderKind::TakeProfit, PositionSide::Short),
            Some(TriggerDirection::FallsThrough)
        );
        // Market/limit orders have no trigger semantics.
        assert_eq!(trigger_direction(OrderKind::Market, PositionSide::Long), None);
        assert_eq!(trigger_direction(OrderKind::Limit, PositionSide::Short), None);
    }

    #[test]
    fn order_request_validation() {
        let mut req = OrderRequest::market("BTCUSDT", Side::Buy, 0.5);
        assert!(req.validate().is_ok());

        req.quantity = 0.0;
        assert!(req.validate().is_err());

        let cond = OrderRequest {
            trigger_price: None,
            ..OrderRequest::conditional("BTCUSDT", OrderKind::StopLoss, PositionSide::Long, 1.0, 100.0)
        };
        assert!(cond.validate().is_err());
    }

    #[test]
    fn conditional_request_sides() {
        let sl = OrderRequest::conditional("ETHUSDT", OrderKind::StopLoss, PositionSide::Long, 1.0, 90.0);
        assert_eq!(sl.side, Side::Sell);
        assert!(sl.reduce_only);

        let tp = OrderRequest::conditional("ETHUSDT", OrderKind::TakeProfit, PositionSide::Short, 1.0, 80.0);
        assert_eq!(tp.side, Side::Buy);
    }

    #[test]
    fn balance_available_clamped_to_total() {
        let balance = BalanceState::new(100.0, 150.0, "USDT");
        assert_eq!(balance.available, 100.0);
    }

    #[test]
    fn error_classification() {
        assert!(VenueError::RateLimited("slow down".into()).is_transient());
        assert!(VenueError::NoData("empty".into()).is_transient());
        assert!(!VenueError::CredentialsInvalid("bad key".into()).is_transient());
        assert!(VenueError::InsufficientMargin("margin".into()).wants_cooldown());
        assert!(VenueError::MinNotionalViolation("small".into()).wants_cooldown());
        assert!(!VenueError::RateLimited("slow".into()).wants_cooldown());
    }
}
