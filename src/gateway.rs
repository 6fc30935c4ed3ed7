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

//! Trading gateway: the single entry point for order flow.
//!
//! Holds the adapter registry and routes each symbol to a connected venue.
//! Routing is a pure function of the symbol's group membership and the set
//! of connected venues, so the same inputs always pick the same venue. The
//! gateway never retries; callers decide what a failure means.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ConfigSource, SymbolGroups, Toggles, VenueId};
use crate::venue::{
    OrderRequest, OrderResult, PositionSide, PositionState, Side, VenueAdapter, VenueError,
};
use crate::wallet::WalletStore;

/// Fraction of available balance committed per entry order.
const ENTRY_BALANCE_FRACTION: f64 = 0.1;

/// Gateway error types.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no connected venue can trade {0}")]
    NoVenueAvailable(String),

    #[error("symbol {0} is blacklisted on {1}")]
    Blacklisted(String, VenueId),

    #[error("no price available for {0}")]
    NoPrice(String),

    #[error(transparent)]
    Venue(#[from] VenueError),
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Pick the venue for a symbol given the connected set.
///
/// Broker-only symbols go to the broker or nowhere. Crypto symbols prefer
/// the primary venue, then the secondary when the symbol is dual-listed,
/// then any connected crypto venue as a last resort. A disconnected venue
/// is never returned.
pub fn route_symbol(
    groups: &SymbolGroups,
    symbol: &str,
    connected: &HashSet<VenueId>,
) -> Option<VenueId> {
    if groups.is_broker_only(symbol) {
        return connected
            .contains(&VenueId::Alpaca)
            .then_some(VenueId::Alpaca);
    }
    if connected.contains(&VenueId::Binance) {
        return Some(VenueId::Binance);
    }
    if groups.has_crypto_fallback(symbol) && connected.contains(&VenueId::Bybit) {
        return Some(VenueId::Bybit);
    }
    // Last resort: any crypto venue still up. The adapter reports
    // InvalidSymbol if the listing does not exist there.
    [VenueId::Binance, VenueId::Bybit]
        .into_iter()
        .find(|v| connected.contains(v))
}

/// Multi-venue order router.
pub struct TradingGateway {
    adapters: DashMap<VenueId, Arc<dyn VenueAdapter>>,
    connected: RwLock<HashSet<VenueId>>,
    groups: SymbolGroups,
    config: Arc<dyn ConfigSource>,
    wallet: Arc<WalletStore>,
    tenant_id: String,
}

impl TradingGateway {
    pub fn new(
        groups: SymbolGroups,
        config: Arc<dyn ConfigSource>,
        wallet: Arc<WalletStore>,
        tenant_id: &str,
    ) -> Self {
        Self {
            adapters: DashMap::new(),
            connected: RwLock::new(HashSet::new()),
            groups,
            config,
            wallet,
            tenant_id: tenant_id.to_string(),
        }
    }

    /// Register an adapter without connecting it.
    pub fn register(&self, adapter: Arc<dyn VenueAdapter>) {
        self.adapters.insert(adapter.venue(), adapter);
    }

    /// Initialize one registered adapter and mark its venue connected.
    /// A failed initialize leaves the venue out of the routing set.
    pub async fn connect(&self, venue: VenueId) -> GatewayResult<()> {
        let adapter = self
            .adapters
            .get(&venue)
            .map(|a| a.clone())
            .ok_or_else(|| GatewayError::NoVenueAvailable(venue.to_string()))?;
        match adapter.initialize().await {
            Ok(()) => {
                self.connected.write().insert(venue);
                match adapter.balance().await {
                    Ok(balance) => self.wallet.update_balance(&self.tenant_id, venue, balance),
                    Err(e) => warn!(venue = %venue, error = %e, "balance seed failed"),
                }
                info!(venue = %venue, "venue connected");
                Ok(())
            }
            Err(e) => {
                warn!(venue = %venue, error = %e, "venue connect failed");
                Err(e.into())
            }
        }
    }

    /// Remove a venue from the routing set.
    pub fn disconnect(&self, venue: VenueId) {
        self.connected.write().remove(&venue);
    }

    /// Snapshot of currently connected venues.
    pub fn connected_set(&self) -> HashSet<VenueId> {
        self.connected.read().clone()
    }

    /// Resolve the adapter for a symbol via routing, honoring the per-venue
    /// blacklist toggle.
    fn adapter_for(&self, symbol: &str) -> GatewayResult<(VenueId, Arc<dyn VenueAdapter>)> {
        let connected = self.connected_set();
        let venue = route_symbol(&self.groups, symbol, &connected)
            .ok_or_else(|| GatewayError::NoVenueAvailable(symbol.to_string()))?;
        if Toggles::venue_blacklisted(self.config.as_ref(), venue, symbol) {
            return Err(GatewayError::Blacklisted(symbol.to_string(), venue));
        }
        let adapter = self
            .adapters
            .get(&venue)
            .map(|a| a.clone())
            .ok_or_else(|| GatewayError::NoVenueAvailable(symbol.to_string()))?;
        Ok((venue, adapter))
    }

    /// Adapter for an explicit venue override, bypassing routing.
    pub fn adapter_on(&self, venue: VenueId) -> Option<Arc<dyn VenueAdapter>> {
        if !self.connected.read().contains(&venue) {
            return None;
        }
        self.adapters.get(&venue).map(|a| a.clone())
    }

    /// Submit an order on the routed venue. On success the wallet position
    /// is touched optimistically; venue reconciliation may overwrite it.
    pub async fn place_order(&self, request: &OrderRequest) -> GatewayResult<OrderResult> {
        request.validate()?;
        let (venue, adapter) = self.adapter_for(&request.symbol)?;
        let result = adapter.place_order(request).await?;
        if result.is_ok() && request.kind == crate::venue::OrderKind::Market {
            self.touch_wallet_position(request, &result);
        }
        info!(
            symbol = %request.symbol,
            venue = %venue,
            status = ?result.status,
            "order submitted"
        );
        Ok(result)
    }

    fn touch_wallet_position(&self, request: &OrderRequest, result: &OrderResult) {
        let side = match request.side {
            Side::Buy => PositionSide::Long,
            Side::Sell => PositionSide::Short,
        };
        let entry = result.filled_price.unwrap_or_default();
        let quantity = if request.reduce_only { 0.0 } else { request.quantity };
        self.wallet.update_position(
            &self.tenant_id,
            &request.symbol,
            PositionState {
                symbol: request.symbol.clone(),
                side,
                quantity,
                entry_price: entry,
                unrealized_pnl: 0.0,
                leverage: 1.0,
            },
        );
    }

    /// Cancel all open orders for a symbol on its routed venue.
    pub async fn cancel_orders(&self, symbol: &str) -> GatewayResult<()> {
        let (_, adapter) = self.adapter_for(symbol)?;
        adapter.cancel_orders(symbol).await?;
        Ok(())
    }

    /// Close any open position on the symbol's routed venue. The wallet
    /// entry is dropped on success.
    pub async fn close_position(&self, symbol: &str) -> GatewayResult<OrderResult> {
        let (_, adapter) = self.adapter_for(symbol)?;
        let result = adapter.close_position(symbol).await?;
        if result.is_ok() {
            self.wallet.update_position(
                &self.tenant_id,
                symbol,
                PositionState {
                    symbol: symbol.to_string(),
                    side: PositionSide::Long,
                    quantity: 0.0,
                    entry_price: 0.0,
                    unrealized_pnl: 0.0,
                    leverage: 1.0,
                },
            );
        }
        Ok(result)
    }

    /// Open positions aggregated across every connected venue.
    pub async fn positions(&self) -> GatewayResult<Vec<PositionState>> {
        let mut out = Vec::new();
        for venue in self.connected_set() {
            if let Some(adapter) = self.adapters.get(&venue).map(|a| a.clone()) {
                match adapter.positions().await {
                    Ok(mut positions) => out.append(&mut positions),
                    Err(e) if e.is_transient() => {
                        warn!(venue = %venue, error = %e, "skipping positions this cycle")
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(out)
    }

    /// Last traded price via a single-candle fetch on the routed venue.
    pub async fn last_price(&self, symbol: &str) -> GatewayResult<f64> {
        let (_, adapter) = self.adapter_for(symbol)?;
        match adapter
            .last_price(symbol, self.groups.timeframe_for(symbol))
            .await
        {
            Ok(price) => Ok(price),
            Err(VenueError::NoData(_)) => Err(GatewayError::NoPrice(symbol.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    /// Entry point for a long: clears working orders, sizes off available
    /// balance, submits a market buy.
    pub async fn execute_long(&self, symbol: &str, strategy_tag: &str) -> GatewayResult<OrderResult> {
        self.execute_entry(symbol, Side::Buy, strategy_tag).await
    }

    /// Entry point for a short.
    pub async fn execute_short(&self, symbol: &str, strategy_tag: &str) -> GatewayResult<OrderResult> {
        self.execute_entry(symbol, Side::Sell, strategy_tag).await
    }

    async fn execute_entry(
        &self,
        symbol: &str,
        side: Side,
        strategy_tag: &str,
    ) -> GatewayResult<OrderResult> {
        let (venue, adapter) = self.adapter_for(symbol)?;
        adapter.cancel_orders(symbol).await?;

        let balance = adapter.balance().await?;
        self.wallet.update_balance(&self.tenant_id, venue, balance.clone());
        let price = self.last_price(symbol).await?;
        let quantity = (balance.available * ENTRY_BALANCE_FRACTION) / price;
        if quantity <= 0.0 {
            return Ok(OrderResult::rejected(VenueError::InsufficientMargin(
                format!("available {} too small for {}", balance.available, symbol),
            )));
        }

        let mut request = OrderRequest::market(symbol, side, quantity);
        request.client_id = Some(format!("{}-{}", strategy_tag, uuid::Uuid::new_v4()));
        info!(symbol, venue = %venue, strategy = strategy_tag, side = side.as_str(), "entry order");
        self.place_order(&request).await
    }
}

/// Create the gateway shared across the engine and front end.
pub fn create_gateway(
    groups: SymbolGroups,
    config: Arc<dyn ConfigSource>,
    wallet: Arc<WalletStore>,
    tenant_id: &str,
) -> Arc<TradingGateway> {
    Arc::new(TradingGateway::new(groups, config, wallet, tenant_id))
}
