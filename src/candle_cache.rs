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

//! Bounded live candle cache shared between stream managers and the market
//! data service.
//!
//! Stream managers are the only writers; the market data service reads and
//! treats anything older than the freshness window as stale. Eviction happens
//! inside the write path, so the cache never grows past its per-series
//! capacity no matter how long a stream runs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::trace;

use crate::candle::{Candle, CandleSeries, Timeframe, DEFAULT_SERIES_CAPACITY};

/// Age beyond which a cached series no longer counts as live.
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(90);

struct SeriesEntry {
    series: CandleSeries,
    last_update: Instant,
}

/// Concurrent cache of per-symbol, per-timeframe candle series.
pub struct CandleCache {
    entries: DashMap<(String, Timeframe), SeriesEntry>,
    capacity: usize,
}

impl Default for CandleCache {
    fn default() -> Self {
        Self::new(DEFAULT_SERIES_CAPACITY)
    }
}

impl CandleCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
        }
    }

    /// Insert or replace one bar and refresh the entry's update time.
    pub fn update(&self, symbol: &str, timeframe: Timeframe, candle: Candle) {
        let mut entry = self
            .entries
            .entry((symbol.to_string(), timeframe))
            .or_insert_with(|| SeriesEntry {
                series: CandleSeries::new(self.capacity),
                last_update: Instant::now(),
            });
        entry.series.update(candle);
        entry.last_update = Instant::now();
        trace!(symbol, timeframe = %timeframe, bars = entry.series.len(), "cache updated");
    }

    /// Replace a whole series with REST backfill data.
    pub fn backfill(&self, symbol: &str, timeframe: Timeframe, candles: Vec<Candle>) {
        let mut entry = self
            .entries
            .entry((symbol.to_string(), timeframe))
            .or_insert_with(|| SeriesEntry {
                series: CandleSeries::new(self.capacity),
                last_update: Instant::now(),
            });
        entry.series.replace_with(candles);
        entry.last_update = Instant::now();
    }

    /// Cached bars regardless of age, oldest to newest.
    pub fn series(&self, symbol: &str, timeframe: Timeframe) -> Option<Vec<Candle>> {
        self.entries
            .get(&(symbol.to_string(), timeframe))
            .map(|e| e.series.as_vec())
    }

    /// Cached bars only when the entry was written within the freshness
    /// window and holds at least `min_bars` of history.
    pub fn fresh_series(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        min_bars: usize,
    ) -> Option<Vec<Candle>> {
        let entry = self.entries.get(&(symbol.to_string(), timeframe))?;
        if entry.last_update.elapsed() > FRESHNESS_WINDOW || entry.series.len() < min_bars {
            return None;
        }
        Some(entry.series.as_vec())
    }

    /// Last close for a symbol on any cached timeframe, preferring the freshest entry.
    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.entries
            .iter()
            .filter(|e| e.key().0 == symbol)
            .min_by_key(|e| e.last_update.elapsed())
            .and_then(|e| e.series.last_price())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop one series, used when a symbol is disabled at runtime.
    pub fn remove(&self, symbol: &str, timeframe: Timeframe) {
        self.entries.remove(&(symbol.to_string(), timeframe));
    }

    #[cfg(test)]
    fn age_entry(&self, symbol: &str, timeframe: Timeframe, age: Duration) {
        if let Some(mut entry) = self.entries.get_mut(&(symbol.to_string(), timeframe)) {
            entry.last_update = Instant::now() - age;
        }
    }
}

/// Create the shared candle cache with default capacity.
pub fn create_candle_cache() -> Arc<CandleCache> {
    Arc::new(CandleCache::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn bar(minute: u32, close: f64) -> Candle {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 12, minute, 0).unwrap();
        Candle::new(ts, close, close + 1.0, close - 1.0, close, 10.0, true)
    }

    #[test]
    fn eviction_bounded_by_capacity() {
        let cache = CandleCache::new(5);
        for i in 0..6 {
            cache.update("BTCUSDT", Timeframe::M1, bar(i, 100.0 + i as f64));
        }
        let series = cache.series("BTCUSDT", Timeframe::M1).unwrap();
        assert_eq!(series.len(), 5);
        // Oldest dropped, remainder strictly increasing.
        assert_eq!(series[0].close, 101.0);
        for w in series.windows(2) {
            assert!(w[0].open_time < w[1].open_time);
        }
    }

    #[test]
    fn fresh_series_requires_warm_history() {
        let cache = CandleCache::new(250);
        for i in 0..10 {
            cache.update("ETHUSDT", Timeframe::M5, bar(i, 2000.0));
        }
        assert!(cache.fresh_series("ETHUSDT", Timeframe::M5, 50).is_none());
        assert!(cache.fresh_series("ETHUSDT", Timeframe::M5, 10).is_some());
    }

    #[test]
    fn stale_entry_not_returned_as_fresh() {
        let cache = CandleCache::new(250);
        cache.update("BTCUSDT", Timeframe::M1, bar(0, 100.0));
        assert!(cache.fresh_series("BTCUSDT", Timeframe::M1, 1).is_some());

        cache.age_entry("BTCUSDT", Timeframe::M1, Duration::from_secs(120));
        assert!(cache.fresh_series("BTCUSDT", Timeframe::M1, 1).is_none());
        // Still readable through the age-agnostic accessor.
        assert!(cache.series("BTCUSDT", Timeframe::M1).is_some());
    }

    #[test]
    fn timeframes_are_independent_entries() {
        let cache = CandleCache::new(250);
        cache.update("BTCUSDT", Timeframe::M1, bar(0, 100.0));
        cache.update("BTCUSDT", Timeframe::H1, bar(0, 101.0));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.series("BTCUSDT", Timeframe::M1).unwrap()[0].close, 100.0);
        assert_eq!(cache.series("BTCUSDT", Timeframe::H1).unwrap()[0].close, 101.0);
    }
}
