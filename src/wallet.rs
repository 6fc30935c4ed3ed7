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

//! Per-tenant in-memory mirror of balances and positions.
//!
//! One process serves many tenants; every accessor takes a tenant id and
//! `update_balance` / `update_position` are the only mutation paths, so no
//! component can reach another tenant's wallet. Storage is a concurrent map
//! with per-shard locking: one tenant's update never blocks another
//! tenant's read.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::config::VenueId;
use crate::venue::{BalanceState, PositionState};

/// Tenant identifier.
pub type TenantId = String;

/// Wallet store error types.
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("no current tenant set; legacy accessors require set_current_tenant")]
    NoCurrentTenant,

    #[error("unknown tenant: {0}")]
    UnknownTenant(String),
}

/// Result type for wallet operations.
pub type WalletResult<T> = Result<T, WalletError>;

/// Per-tenant aggregate of venue balances and open positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantWallet {
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Balance per venue
    pub balances: HashMap<VenueId, BalanceState>,
    /// Open positions by symbol; zero-quantity entries are never stored
    pub positions: HashMap<String, PositionState>,
    /// Last mutation time
    pub last_update: DateTime<Utc>,
}

impl TenantWallet {
    fn new(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            balances: HashMap::new(),
            positions: HashMap::new(),
            last_update: Utc::now(),
        }
    }
}

/// Wallet change notification for the UI layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalletEvent {
    BalanceUpdated {
        tenant_id: TenantId,
        venue: VenueId,
        balance: BalanceState,
    },
    PositionUpdated {
        tenant_id: TenantId,
        symbol: String,
        position: Option<PositionState>,
    },
}

/// Process-wide tenant wallet store.
pub struct WalletStore {
    wallets: DashMap<TenantId, TenantWallet>,
    events: broadcast::Sender<WalletEvent>,
    /// Tenant the legacy single-tenant accessors operate on. New code must
    /// pass an explicit tenant id instead.
    current_tenant: RwLock<Option<TenantId>>,
}

impl Default for WalletStore {
    fn default() -> Self {
        Self::new()
    }
}

impl WalletStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            wallets: DashMap::new(),
            events,
            current_tenant: RwLock::new(None),
        }
    }

    /// Record a venue balance for a tenant, creating the wallet lazily.
    pub fn update_balance(&self, tenant_id: &str, venue: VenueId, balance: BalanceState) {
        {
            let mut wallet = self
                .wallets
                .entry(tenant_id.to_string())
                .or_insert_with(|| TenantWallet::new(tenant_id));
            wallet.balances.insert(venue, balance.clone());
            wallet.last_update = Utc::now();
        }
        debug!(tenant = tenant_id, venue = %venue, total = balance.total, "balance updated");
        let _ = self.events.send(WalletEvent::BalanceUpdated {
            tenant_id: tenant_id.to_string(),
            venue,
            balance,
        });
    }

    /// Record a position update. A zero-quantity position removes the
    /// entry; zero is never stored.
    pub fn update_position(&self, tenant_id: &str, symbol: &str, position: PositionState) {
        let removed = position.quantity == 0.0;
        {
            let mut wallet = self
                .wallets
                .entry(tenant_id.to_string())
                .or_insert_with(|| TenantWallet::new(tenant_id));
            if removed {
                wallet.positions.remove(symbol);
            } else {
                wallet.positions.insert(symbol.to_string(), position.clone());
            }
            wallet.last_update = Utc::now();
        }
        let _ = self.events.send(WalletEvent::PositionUpdated {
            tenant_id: tenant_id.to_string(),
            symbol: symbol.to_string(),
            position: if removed { None } else { Some(position) },
        });
    }

    /// Cloned snapshot of one tenant's wallet.
    pub fn snapshot(&self, tenant_id: &str) -> Option<TenantWallet> {
        self.wallets.get(tenant_id).map(|w| w.clone())
    }

    /// Sum of total balances across venues for one tenant.
    pub fn unified_equity(&self, tenant_id: &str) -> f64 {
        self.wallets
            .get(tenant_id)
            .map(|w| w.balances.values().map(|b| b.total).sum())
            .unwrap_or(0.0)
    }

    /// Available balance on a single venue.
    pub fn available(&self, tenant_id: &str, venue: VenueId) -> Option<f64> {
        self.wallets
            .get(tenant_id)
            .and_then(|w| w.balances.get(&venue).map(|b| b.available))
    }

    /// Open position for one symbol.
    pub fn position(&self, tenant_id: &str, symbol: &str) -> Option<PositionState> {
        self.wallets
            .get(tenant_id)
            .and_then(|w| w.positions.get(symbol).cloned())
    }

    /// Subscribe to wallet change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }

    /// Set the tenant the legacy accessors operate on. Migration aid only.
    pub fn set_current_tenant(&self, tenant_id: &str) {
        *self.current_tenant.write() = Some(tenant_id.to_string());
    }

    /// Legacy single-tenant equity accessor. Fails loudly when no current
    /// tenant was ever set; do not use in new code.
    pub fn current_unified_equity(&self) -> WalletResult<f64> {
        let guard = self.current_tenant.read();
        let Some(tenant_id) = guard.as_ref() else {
            error!("legacy wallet accessor called with no current tenant");
            return Err(WalletError::NoCurrentTenant);
        };
        Ok(self.unified_equity(tenant_id))
    }

    /// Legacy single-tenant snapshot accessor. Migration aid only.
    pub fn current_snapshot(&self) -> WalletResult<TenantWallet> {
        let guard = self.current_tenant.read();
        let Some(tenant_id) = guard.as_ref() else {
            error!("legacy wallet accessor called with no current tenant");
            return Err(WalletError::NoCurrentTenant);
        };
        self.snapshot(tenant_id)
            .ok_or_else(|| WalletError::UnknownTenant(tenant_id.clone()))
    }
}

/// Create the process-wide wallet store.
pub fn create_wallet_store() -> Arc<WalletStore> {
    Arc::new(WalletStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::PositionSide;
    use rand::Rng;

    fn position(symbol: &str, qty: f64) -> PositionState {
        PositionState {
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            quantity: qty,
            entry_price: 100.0,
            unrealized_pnl: 0.0,
            leverage: 3.0,
        }
    }

    #[test]
    fn wallet_created_lazily() {
        let store = WalletStore::new();
        assert!(store.snapshot("t1").is_none());
        store.update_balance("t1", VenueId::Binance, BalanceState::new(100.0, 80.0, "USDT"));
        assert!(store.snapshot("t1").is_some());
    }

    #[test]
    fn tenant_isolation_under_random_updates() {
        let store = WalletStore::new();
        store.update_balance("t2", VenueId::Bybit, BalanceState::new(500.0, 400.0, "USDT"));
        store.update_position("t2", "ETHUSDT", position("ETHUSDT", 2.0));
        let before = serde_json::to_vec(&store.snapshot("t2").unwrap()).unwrap();

        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let total: f64 = rng.gen_range(0.0..10_000.0);
            store.update_balance("t1", VenueId::Binance, BalanceState::new(total, total / 2.0, "USDT"));
            store.update_position("t1", "BTCUSDT", position("BTCUSDT", rng.gen_range(0.1..5.0)));
        }

        // t2's snapshot must be byte-for-byte unchanged except last_update,
        // which only t2 mutations touch.
        let after = serde_json::to_vec(&store.snapshot("t2").unwrap()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn zero_quantity_position_removed() {
        let store = WalletStore::new();
        store.update_position("t1", "BTCUSDT", position("BTCUSDT", 1.5));
        assert!(store.position("t1", "BTCUSDT").is_some());

        store.update_position("t1", "BTCUSDT", position("BTCUSDT", 0.0));
        assert!(store.position("t1", "BTCUSDT").is_none());
    }

    #[test]
    fn unified_equity_sums_across_venues() {
        let store = WalletStore::new();
        store.update_balance("t1", VenueId::Binance, BalanceState::new(100.0, 90.0, "USDT"));
        store.update_balance("t1", VenueId::Bybit, BalanceState::new(50.0, 50.0, "USDT"));
        store.update_balance("t1", VenueId::Alpaca, BalanceState::new(1000.0, 400.0, "USD"));
        assert_eq!(store.unified_equity("t1"), 1150.0);
        assert_eq!(store.available("t1", VenueId::Alpaca), Some(400.0));
    }

    #[test]
    fn legacy_accessor_fails_without_current_tenant() {
        let store = WalletStore::new();
        assert!(matches!(
            store.current_unified_equity(),
            Err(WalletError::NoCurrentTenant)
        ));

        store.update_balance("t1", VenueId::Binance, BalanceState::new(10.0, 10.0, "USDT"));
        store.set_current_tenant("t1");
        assert_eq!(store.current_unified_equity().unwrap(), 10.0);
    }

    #[tokio::test]
    async fn listener_receives_updates() {
        let store = WalletStore::new();
        let mut rx = store.subscribe();
        store.update_balance("t1", VenueId::Binance, BalanceState::new(42.0, 42.0, "USDT"));
        match rx.recv().await.unwrap() {
            WalletEvent::BalanceUpdated { tenant_id, venue, balance } => {
                assert_eq!(tenant_id, "t1");
                assert_eq!(venue, VenueId::Binance);
                assert_eq!(balance.total, 42.0);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
