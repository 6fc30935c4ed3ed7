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

//! Market data service: candles with a provenance tag.
//!
//! Resolution order for every request: market-calendar short circuit for
//! broker-only symbols, then the live stream cache, then the REST budget,
//! then a routed REST fetch with one fallback-venue retry for dual-listed
//! crypto symbols. Whatever path served the data, the snapshot is enriched
//! with indicators before it leaves this module.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::candle::{CandleSeries, Timeframe};
use crate::candle_cache::CandleCache;
use crate::config::{SymbolGroups, VenueId};
use crate::gateway::{route_symbol, TradingGateway};
use crate::indicators::{enrich, MarketSnapshot, WARMUP_BARS};
use crate::rate_limiter::RestRateLimiter;
use crate::venue::{AlpacaAdapter, VenueError};

/// Bars requested per REST backfill.
const REST_FETCH_LIMIT: usize = 100;

/// Market data error types.
#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("no connected venue serves {0}")]
    NoVenueAvailable(String),

    #[error(transparent)]
    Venue(#[from] VenueError),
}

/// Result type for market data operations.
pub type MarketDataResult<T> = Result<T, MarketDataError>;

/// Where a snapshot's candles came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    /// Served from the live stream cache
    Stream,
    /// Fetched over REST this call
    Rest,
    /// REST budget denied; empty result, no blocking
    RateLimited,
    /// Broker session closed; empty result, zero REST
    MarketClosed,
}

/// Enriched snapshot plus provenance.
#[derive(Debug, Clone)]
pub struct MarketData {
    pub snapshot: MarketSnapshot,
    pub source: DataSource,
}

/// Main and macro frames for one symbol, micro where configured.
#[derive(Debug, Clone)]
pub struct MultiframeData {
    pub main: MarketData,
    pub macro_frame: MarketData,
    pub micro: Option<MarketData>,
}

/// Candle provider sitting between the engine and the venues.
pub struct MarketDataService {
    gateway: Arc<TradingGateway>,
    cache: Arc<CandleCache>,
    limiter: Arc<RestRateLimiter>,
    groups: SymbolGroups,
}

impl MarketDataService {
    pub fn new(
        gateway: Arc<TradingGateway>,
        cache: Arc<CandleCache>,
        limiter: Arc<RestRateLimiter>,
        groups: SymbolGroups,
    ) -> Self {
        Self {
            gateway,
            cache,
            limiter,
            groups,
        }
    }

    /// Candles at the symbol's configured strategy timeframe.
    pub async fn get_candles(&self, symbol: &str) -> MarketDataResult<MarketData> {
        let timeframe = self.groups.timeframe_for(symbol);
        self.get_candles_at(symbol, timeframe).await
    }

    /// Candles at an explicit timeframe.
    pub async fn get_candles_at(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> MarketDataResult<MarketData> {
        self.resolve(symbol, timeframe, Utc::now()).await
    }

    async fn resolve(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        now: DateTime<Utc>,
    ) -> MarketDataResult<MarketData> {
        // Closed broker session: an expected empty result, never spend REST.
        // The engine's warm-up gate holds on the empty snapshot, so stale
        // bars from the previous session can never drive an order.
        if self.groups.is_broker_only(symbol) && !AlpacaAdapter::is_market_open(now) {
            let series = CandleSeries::default();
            return Ok(MarketData {
                snapshot: enrich(symbol, timeframe, &series),
                source: DataSource::MarketClosed,
            });
        }

        // Fresh and warm stream data wins.
        if let Some(candles) = self.cache.fresh_series(symbol, timeframe, WARMUP_BARS) {
            let series = CandleSeries::from_candles(candles.len(), candles);
            return Ok(MarketData {
                snapshot: enrich(symbol, timeframe, &series),
                source: DataSource::Stream,
            });
        }

        // Budget denial is a signal, not an error: empty result, no
        // blocking, and no >90s-stale bars leaking to the caller.
        if let Err(reason) = self.limiter.try_acquire(symbol) {
            debug!(symbol, ?reason, "rest budget denied");
            let series = CandleSeries::default();
            return Ok(MarketData {
                snapshot: enrich(symbol, timeframe, &series),
                source: DataSource::RateLimited,
            });
        }

        let series = self.rest_fetch(symbol, timeframe).await?;
        self.cache.backfill(symbol, timeframe, series.as_vec());
        Ok(MarketData {
            snapshot: enrich(symbol, timeframe, &series),
            source: DataSource::Rest,
        })
    }

    /// Routed REST fetch with one fallback-venue retry for dual-listed
    /// crypto symbols.
    async fn rest_fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> MarketDataResult<CandleSeries> {
        let connected = self.gateway.connected_set();
        let primary = route_symbol(&self.groups, symbol, &connected)
            .ok_or_else(|| MarketDataError::NoVenueAvailable(symbol.to_string()))?;
        let adapter = self
            .gateway
            .adapter_on(primary)
            .ok_or_else(|| MarketDataError::NoVenueAvailable(symbol.to_string()))?;

        let first = adapter.fetch_candles(symbol, timeframe, REST_FETCH_LIMIT).await;
        match first {
            Ok(series) if !series.is_empty() => return Ok(series),
            Ok(series) => {
                if self.fallback_venue(symbol, primary, &connected).is_none() {
                    return Ok(series);
                }
                warn!(symbol, venue = %primary, "empty candle response, trying fallback venue");
            }
            Err(e) => {
                if self.fallback_venue(symbol, primary, &connected).is_none() {
                    return Err(e.into());
                }
                warn!(symbol, venue = %primary, error = %e, "fetch failed, trying fallback venue");
            }
        }

        let fallback = self
            .fallback_venue(symbol, primary, &connected)
            .expect("checked above");
        let adapter = self
            .gateway
            .adapter_on(fallback)
            .ok_or_else(|| MarketDataError::NoVenueAvailable(symbol.to_string()))?;
        Ok(adapter.fetch_candles(symbol, timeframe, REST_FETCH_LIMIT).await?)
    }

    /// The one retry target: the other crypto venue, only for dual-listed
    /// symbols and only when connected.
    fn fallback_venue(
        &self,
        symbol: &str,
        primary: VenueId,
        connected: &std::collections::HashSet<VenueId>,
    ) -> Option<VenueId> {
        if !self.groups.has_crypto_fallback(symbol) {
            return None;
        }
        let other = match primary {
            VenueId::Binance => VenueId::Bybit,
            VenueId::Bybit => VenueId::Binance,
            VenueId::Alpaca => return None,
        };
        connected.contains(&other).then_some(other)
    }

    /// Main and macro frames fetched concurrently, plus a 1-minute micro
    /// frame for fine-entry symbols. A shared main/macro timeframe is
    /// fetched once.
    pub async fn get_multiframe_candles(&self, symbol: &str) -> MarketDataResult<MultiframeData> {
        let main_tf = self.groups.timeframe_for(symbol);
        let macro_tf = self.groups.macro_timeframe();
        let wants_micro = self.groups.needs_micro_frame(symbol) && main_tf != Timeframe::M1;

        if main_tf == macro_tf {
            let main = self.get_candles_at(symbol, main_tf).await?;
            let micro = if wants_micro {
                Some(self.get_candles_at(symbol, Timeframe::M1).await?)
            } else {
                None
            };
            return Ok(MultiframeData {
                macro_frame: main.clone(),
                main,
                micro,
            });
        }

        if wants_micro {
            let (main, macro_frame, micro) = tokio::join!(
                self.get_candles_at(symbol, main_tf),
                self.get_candles_at(symbol, macro_tf),
                self.get_candles_at(symbol, Timeframe::M1),
            );
            Ok(MultiframeData {
                main: main?,
                macro_frame: macro_frame?,
                micro: Some(micro?),
            })
        } else {
            let (main, macro_frame) = tokio::join!(
                self.get_candles_at(symbol, main_tf),
                self.get_candles_at(symbol, macro_tf),
            );
            Ok(MultiframeData {
                main: main?,
                macro_frame: macro_frame?,
                micro: None,
            })
        }
    }
}

/// Create the shared market data service.
pub fn create_market_service(
    gateway: Arc<TradingGateway>,
    cache: Arc<CandleCache>,
    limiter: Arc<RestRateLimiter>,
    groups: SymbolGroups,
) -> Arc<MarketDataService> {
    Arc::new(MarketDataService::new(gateway, cache, limiter, groups))
}
