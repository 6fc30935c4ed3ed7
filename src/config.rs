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

//! Runtime configuration seam.
//!
//! Toggles are resolved fresh on every call through [`ConfigSource`] so a
//! flipped flag takes effect on the next decision cycle without a restart.
//! Call sites must not cache values across cycles.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::candle::Timeframe;

/// Venue identifiers known to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VenueId {
    /// Primary crypto futures venue
    Binance,
    /// Secondary crypto venue, fallback for dual-listed symbols
    Bybit,
    /// Stock broker
    Alpaca,
}

impl VenueId {
    pub fn as_str(&self) -> &'static str {
        match self {
            VenueId::Binance => "binance",
            VenueId::Bybit => "bybit",
            VenueId::Alpaca => "alpaca",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "binance" => Some(VenueId::Binance),
            "bybit" => Some(VenueId::Bybit),
            "alpaca" => Some(VenueId::Alpaca),
            _ => None,
        }
    }
}

impl std::fmt::Display for VenueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// API credentials for one venue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    /// API key
    pub api_key: String,
    /// API secret
    pub api_secret: String,
    /// Broker paper-trading flag (ignored by the crypto venues)
    pub paper: bool,
    /// Optional HTTP proxy for REST calls. WebSocket connections always
    /// bypass the proxy; the streaming transport does not support it.
    pub proxy_url: Option<String>,
}

/// Static symbol-group membership used for routing and timeframe selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolGroups {
    /// Symbols listed on the primary crypto venue
    pub crypto_primary: HashSet<String>,
    /// Crypto symbols also listed on the secondary venue (fallback-eligible)
    pub crypto_fallback: HashSet<String>,
    /// Broker-only equity symbols
    pub broker_only: HashSet<String>,
    /// Majors that run the fast timeframe
    pub majors: HashSet<String>,
    /// Designated high-volatility symbols that run the fastest timeframe
    pub high_volatility: HashSet<String>,
}

impl Default for SymbolGroups {
    fn default() -> Self {
        let set = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            crypto_primary: set(&[
                "BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT", "XRPUSDT", "DOGEUSDT", "PEPEUSDT",
            ]),
            crypto_fallback: set(&["BTCUSDT", "ETHUSDT", "SOLUSDT", "PEPEUSDT"]),
            broker_only: set(&["AAPL", "TSLA", "NVDA", "SPY"]),
            majors: set(&["BTCUSDT", "ETHUSDT", "SOLUSDT"]),
            high_volatility: set(&["PEPEUSDT", "DOGEUSDT"]),
        }
    }
}

impl SymbolGroups {
    /// Whether the symbol is only tradeable at the broker.
    pub fn is_broker_only(&self, symbol: &str) -> bool {
        self.broker_only.contains(symbol)
    }

    /// Whether the symbol has a secondary crypto venue listing.
    pub fn has_crypto_fallback(&self, symbol: &str) -> bool {
        self.crypto_fallback.contains(symbol)
    }

    /// Strategy timeframe for a symbol: fastest for designated
    /// high-volatility names, fast for majors, slow default otherwise.
    pub fn timeframe_for(&self, symbol: &str) -> Timeframe {
        if self.high_volatility.contains(symbol) {
            Timeframe::M1
        } else if self.majors.contains(symbol) {
            Timeframe::M5
        } else {
            Timeframe::M15
        }
    }

    /// Fixed macro timeframe used by the multiframe fetch.
    pub fn macro_timeframe(&self) -> Timeframe {
        Timeframe::H1
    }

    /// Symbols that get a 1-minute micro series for fine entries.
    pub fn needs_micro_frame(&self, symbol: &str) -> bool {
        self.majors.contains(symbol)
    }

    /// All configured symbols, crypto and broker.
    pub fn all_symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .crypto_primary
            .iter()
            .chain(self.broker_only.iter())
            .cloned()
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

/// Read-only snapshot provider for process-wide mutable toggles.
///
/// Implementations must resolve each call freshly; callers never cache the
/// returned values beyond the current cycle.
pub trait ConfigSource: Send + Sync {
    /// Raw string lookup.
    fn get(&self, key: &str) -> Option<String>;

    /// Boolean convenience lookup with a default for unset keys.
    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .map(|v| matches!(v.as_str(), "1" | "true" | "on" | "yes"))
            .unwrap_or(default)
    }
}

/// Well-known toggle keys.
pub mod keys {
    /// Prefix for per-strategy enable flags: `strategy.<tag>.enabled`
    pub const STRATEGY_ENABLED_PREFIX: &str = "strategy.";
    /// Prefix for per-venue symbol blacklists: `venue.<venue>.blacklist`
    pub const VENUE_BLACKLIST_PREFIX: &str = "venue.";
    /// Comma-separated globally disabled symbols
    pub const DISABLED_SYMBOLS: &str = "symbols.disabled";
    /// Learned-classifier on/off flag
    pub const ML_CLASSIFIER_ENABLED: &str = "classifier.ml.enabled";
}

/// Process-wide mutable toggle store behind the [`ConfigSource`] seam.
#[derive(Default)]
pub struct RuntimeConfig {
    values: DashMap<String, String>,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or overwrite a toggle. Takes effect on the next cycle.
    pub fn set(&self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    /// Remove a toggle, reverting callers to their defaults.
    pub fn unset(&self, key: &str) {
        self.values.remove(key);
    }
}

impl ConfigSource for RuntimeConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.value().clone())
    }
}

/// Toggle helpers shared by the engine and strategy factory.
pub struct Toggles;

impl Toggles {
    /// Per-strategy enable flag, default enabled.
    pub fn strategy_enabled(config: &dyn ConfigSource, tag: &str) -> bool {
        config.get_bool(&format!("{}{}.enabled", keys::STRATEGY_ENABLED_PREFIX, tag), true)
    }

    /// Global disabled-symbol set membership.
    pub fn symbol_disabled(config: &dyn ConfigSource, symbol: &str) -> bool {
        config
            .get(keys::DISABLED_SYMBOLS)
            .map(|list| list.split(',').any(|s| s.trim().eq_ignore_ascii_case(symbol)))
            .unwrap_or(false)
    }

    /// Per-venue symbol blacklist membership.
    pub fn venue_blacklisted(config: &dyn ConfigSource, venue: VenueId, symbol: &str) -> bool {
        config
            .get(&format!("{}{}.blacklist", keys::VENUE_BLACKLIST_PREFIX, venue))
            .map(|list| list.split(',').any(|s| s.trim().eq_ignore_ascii_case(symbol)))
            .unwrap_or(false)
    }

    /// Learned-classifier flag, default on (degrades to rules when no model).
    pub fn ml_enabled(config: &dyn ConfigSource) -> bool {
        config.get_bool(keys::ML_CLASSIFIER_ENABLED, true)
    }
}

/// Create the default runtime config store.
pub fn create_runtime_config() -> Arc<RuntimeConfig> {
    Arc::new(RuntimeConfig::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_changes_visible_without_restart() {
        let config = RuntimeConfig::new();
        assert!(Toggles::strategy_enabled(&config, "trend"));

        config.set("strategy.trend.enabled", "false");
        assert!(!Toggles::strategy_enabled(&config, "trend"));

        config.unset("strategy.trend.enabled");
        assert!(Toggles::strategy_enabled(&config, "trend"));
    }

    #[test]
    fn disabled_symbols_parsed_from_list() {
        let config = RuntimeConfig::new();
        config.set(keys::DISABLED_SYMBOLS, "DOGEUSDT, pepeusdt");
        assert!(Toggles::symbol_disabled(&config, "DOGEUSDT"));
        assert!(Toggles::symbol_disabled(&config, "PEPEUSDT"));
        assert!(!Toggles::symbol_disabled(&config, "BTCUSDT"));
    }

    #[test]
    fn timeframe_resolution_by_group() {
        let groups = SymbolGroups::default();
        assert_eq!(groups.timeframe_for("PEPEUSDT"), Timeframe::M1);
        assert_eq!(groups.timeframe_for("BTCUSDT"), Timeframe::M5);
        assert_eq!(groups.timeframe_for("AAPL"), Timeframe::M15);
    }

    #[test]
    fn venue_blacklist() {
        let config = RuntimeConfig::new();
        config.set("venue.bybit.blacklist", "SOLUSDT");
        assert!(Toggles::venue_blacklisted(&config, VenueId::Bybit, "SOLUSDT"));
        assert!(!Toggles::venue_blacklisted(&config, VenueId::Binance, "SOLUSDT"));
    }
}
