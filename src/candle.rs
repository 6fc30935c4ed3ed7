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

//! OHLCV candle types and the bounded per-symbol series that every other
//! market-data component is built on.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default retained history per symbol.
pub const DEFAULT_SERIES_CAPACITY: usize = 250;

/// Candle timeframes supported across venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    /// One minute
    M1,
    /// Five minutes
    M5,
    /// Fifteen minutes
    M15,
    /// One hour
    H1,
    /// Four hours
    H4,
    /// One day
    D1,
}

impl Timeframe {
    /// Wall-clock duration of one bar.
    pub fn duration(&self) -> Duration {
        match self {
            Timeframe::M1 => Duration::from_secs(60),
            Timeframe::M5 => Duration::from_secs(300),
            Timeframe::M15 => Duration::from_secs(900),
            Timeframe::H1 => Duration::from_secs(3600),
            Timeframe::H4 => Duration::from_secs(14400),
            Timeframe::D1 => Duration::from_secs(86400),
        }
    }

    /// Bar length in whole seconds.
    pub fn seconds(&self) -> i64 {
        self.duration().as_secs() as i64
    }

    /// Interval string used by the crypto venues ("1m", "5m", ...).
    pub fn as_venue_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    /// Parse the venue interval string form.
    pub fn from_venue_str(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Timeframe::M1),
            "5m" => Some(Timeframe::M5),
            "15m" => Some(Timeframe::M15),
            "1h" | "60m" => Some(Timeframe::H1),
            "4h" => Some(Timeframe::H4),
            "1d" => Some(Timeframe::D1),
        _ => None,
        }
    }

    /// Align a timestamp down to the start of its bar period.
    pub fn period_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.seconds();
        let aligned = (ts.timestamp() / secs) * secs;
        DateTime::from_timestamp(aligned, 0).unwrap_or(ts)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_venue_str())
    }
}

/// One OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Period start timestamp
    pub open_time: DateTime<Utc>,
    /// Open price
    pub open: f64,
    /// High price
    pub high: f64,
    /// Low price
    pub low: f64,
    /// Close price (last trade for an in-progress bar)
    pub close: f64,
    /// Base-asset volume
    pub volume: f64,
    /// Whether the bar period has ended
    pub closed: bool,
}

impl Candle {
    /// Build a candle, repairing a high/low that a venue reported inconsistently.
    pub fn new(
        open_time: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        closed: bool,
    ) -> Self {
        let high = high.max(open).max(close).max(low);
        let low = low.min(open).min(close);
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
            closed,
        }
    }

    /// Midpoint of the bar range.
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }

    /// True range against a previous close.
    pub fn true_range(&self, prev_close: f64) -> f64 {
        (self.high - self.low)
            .max((self.high - prev_close).abs())
            .max((self.low - prev_close).abs())
    }
}

/// Bounded, insertion-ordered per-symbol candle history.
///
/// An in-progress (unclosed) candle with the same period start replaces the
/// prior entry in place; a closed candle is appended and the oldest entry is
/// evicted once capacity is reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleSeries {
    candles: VecDeque<Candle>,
    capacity: usize,
}

impl Default for CandleSeries {
    fn default() -> Self {
        Self::new(DEFAULT_SERIES_CAPACITY)
    }
}

impl CandleSeries {
    /// Create an empty series with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            candles: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Build a series from already-ordered historical bars (REST backfill).
    pub fn from_candles(capacity: usize, candles: Vec<Candle>) -> Self {
        let mut series = Self::new(capacity);
        for candle in candles {
            series.update(candle);
        }
        series
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recent bar (possibly still open).
    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }

    /// Most recent close price.
    pub fn last_price(&self) -> Option<f64> {
        self.candles.back().map(|c| c.close)
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Candle> {
        self.candles.iter()
    }

    /// Contiguous slice view, oldest to newest.
    pub fn as_vec(&self) -> Vec<Candle> {
        self.candles.iter().cloned().collect()
    }

    /// Insert or replace a bar.
    ///
    /// Same-period updates overwrite the existing entry so an in-progress
    /// candle never appends duplicates; out-of-order bars older than the
    /// newest retained entry are dropped.
    pub fn update(&mut self, candle: Candle) {
        match self.candles.back() {
            Some(last) if last.open_time == candle.open_time => {
                *self.candles.back_mut().expect("non-empty checked above") = candle;
            }
            Some(last) if candle.open_time < last.open_time => {
                // Late delivery after the series moved on. Ignore.
            }
            _ => {
                self.candles.push_back(candle);
                while self.candles.len() > self.capacity {
                    self.candles.pop_front();
                }
            }
        }
    }

    /// Drop everything, used when a REST backfill replaces stale stream data.
    pub fn replace_with(&mut self, candles: Vec<Candle>) {
        self.candles.clear();
        for candle in candles {
            self.update(candle);
        }
    }

    /// Closing prices, oldest to newest.
    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    /// Volumes, oldest to newest.
    pub fn volumes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.volume).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(minute: u32, close: f64, closed: bool) -> Candle {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 12, minute, 0).unwrap();
        Candle::new(ts, close, close + 1.0, close - 1.0, close, 10.0, closed)
    }

    #[test]
    fn high_low_repaired_on_construction() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let c = Candle::new(ts, 100.0, 99.0, 101.0, 102.0, 1.0, true);
        assert!(c.high >= c.open && c.high >= c.close && c.high >= c.low);
        assert!(c.low <= c.open && c.low <= c.close);
    }

    #[test]
    fn eviction_keeps_newest() {
        let mut series = CandleSeries::new(5);
        for i in 0..6 {
            series.update(bar(i, 100.0 + i as f64, true));
        }
        assert_eq!(series.len(), 5);
        // Oldest (minute 0) evicted, retained entries strictly increasing.
        let times: Vec<_> = series.iter().map(|c| c.open_time).collect();
        assert_eq!(times[0].timestamp() % 3600, 60);
        for w in times.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn in_progress_candle_replaced_in_place() {
        let mut series = CandleSeries::new(10);
        series.update(bar(0, 100.0, true));
        series.update(bar(1, 101.0, false));
        assert_eq!(series.len(), 2);

        // Same period start again: replaces, does not append.
        series.update(bar(1, 103.0, false));
        assert_eq!(series.len(), 2);
        assert_eq!(series.last().unwrap().close, 103.0);

        // The closing update for the same period still replaces in place.
        series.update(bar(1, 104.0, true));
        assert_eq!(series.len(), 2);
        assert!(series.last().unwrap().closed);
    }

    #[test]
    fn late_candle_dropped() {
        let mut series = CandleSeries::new(10);
        series.update(bar(5, 100.0, true));
        series.update(bar(3, 90.0, true));
        assert_eq!(series.len(), 1);
        assert_eq!(series.last().unwrap().close, 100.0);
    }

    #[test]
    fn period_start_alignment() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 12, 7, 31).unwrap();
        let aligned = Timeframe::M5.period_start(ts);
        assert_eq!(aligned, Utc.with_ymd_and_hms(2025, 3, 1, 12, 5, 0).unwrap());
    }
}
