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

//! Multi-venue trading connectivity and decision core.
//!
//! Venue adapters normalize two crypto exchanges and a stock broker behind
//! one trait; the gateway routes symbols to connected venues; the market
//! data service serves candles from stream, cache, or REST under a budget;
//! and the engine runs the classify-then-evaluate decision loop, emitting
//! signals over a channel the front end consumes.

pub mod candle;
pub mod candle_cache;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod indicators;
pub mod market_service;
pub mod rate_limiter;
pub mod regime;
pub mod strategy;
pub mod stream;
pub mod telemetry;
pub mod venue;
pub mod wallet;

// Re-export common types
pub use candle::{Candle, CandleSeries, Timeframe};
pub use candle_cache::{create_candle_cache, CandleCache};
pub use classifier::{create_classifier, LearnedClassifier, TwoStageClassifier};
pub use config::{
    create_runtime_config, ConfigSource, Credentials, RuntimeConfig, SymbolGroups, VenueId,
};
pub use engine::{CycleStats, EngineConfig, TradingEngine};
pub use gateway::{create_gateway, route_symbol, GatewayError, TradingGateway};
pub use indicators::{enrich, MarketSnapshot, TrendDirection};
pub use market_service::{create_market_service, DataSource, MarketData, MarketDataService};
pub use rate_limiter::{create_rate_limiter, DenyReason, RestRateLimiter};
pub use regime::{classify, Regime, RegimeDecision, RegimeThresholds};
pub use strategy::{strategy_for, Signal, SignalAction, Strategy, StrategyTag};
pub use stream::{BrokerStreamManager, CryptoStreamManager, StopSignal};
pub use telemetry::init_tracing;
pub use venue::{
    create_adapter, OrderRequest, OrderResult, PositionState, VenueAdapter, VenueError,
};
pub use wallet::{create_wallet_store, TenantWallet, WalletEvent, WalletStore};
