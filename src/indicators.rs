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

//! Indicator enrichment over a candle series.
//!
//! All calculations are pure functions that tolerate short series by
//! returning neutral values instead of raising; classifier warm-up gating
//! happens downstream.

use serde::{Deserialize, Serialize};

use crate::candle::{Candle, CandleSeries, Timeframe};

/// Minimum bars before indicator output is considered warmed up.
pub const WARMUP_BARS: usize = 50;

/// Tagged indicator snapshot shared by classifiers and strategies.
///
/// Replaces the loosely-typed per-symbol dictionary the strategy layer used
/// to pass around: every field is named, optional data is `Option<T>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    /// Symbol this snapshot describes
    pub symbol: String,
    /// Timeframe the series was fetched at
    pub timeframe: Timeframe,
    /// Underlying candle history, oldest to newest
    pub candles: Vec<Candle>,
    /// Last close price
    pub last_price: f64,
    /// Short simple moving average (20)
    pub sma_short: f64,
    /// Long simple moving average (50)
    pub sma_long: f64,
    /// Short exponential moving average (12)
    pub ema_short: f64,
    /// Long exponential moving average (26)
    pub ema_long: f64,
    /// Relative strength index (14)
    pub rsi: f64,
    /// Average true range (14)
    pub atr: f64,
    /// ATR as a percentage of the last price
    pub atr_pct: f64,
    /// Bollinger middle band (20-period SMA)
    pub bb_middle: f64,
    /// Bollinger upper band
    pub bb_upper: f64,
    /// Bollinger lower band
    pub bb_lower: f64,
    /// Band width relative to the middle band
    pub bb_width: f64,
    /// ADX-style trend strength measure (0-100)
    pub trend_strength: f64,
    /// Latest volume over the 20-period average
    pub volume_ratio: f64,
    /// Macro-timeframe trend direction, when a macro series was available
    pub macro_trend: Option<TrendDirection>,
    /// Number of bars backing this snapshot
    pub bars: usize,
}

/// Coarse directional read of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendDirection {
    Up,
    Down,
    Flat,
}

impl MarketSnapshot {
    /// Whether enough history backs the indicator values.
    pub fn is_warmed_up(&self) -> bool {
        self.bars >= WARMUP_BARS
    }

    /// Short MA above long MA.
    pub fn mas_aligned_up(&self) -> bool {
        self.sma_short > self.sma_long
    }

    /// Short MA below long MA.
    pub fn mas_aligned_down(&self) -> bool {
        self.sma_short < self.sma_long
    }
}

/// Build a snapshot from a series. Never fails; a short or empty series
/// yields neutral indicator values and `bars` reflecting what was there.
pub fn enrich(symbol: &str, timeframe: Timeframe, series: &CandleSeries) -> MarketSnapshot {
    let candles = series.as_vec();
    let closes = series.closes();
    let volumes = series.volumes();
    let last_price = closes.last().copied().unwrap_or(0.0);

    let sma_short = sma(&closes, 20);
    let sma_long = sma(&closes, 50);
    let (bb_middle, bb_upper, bb_lower, bb_width) = bollinger(&closes, 20, 2.0);
    let atr = atr(&candles, 14);

    MarketSnapshot {
        symbol: symbol.to_string(),
        timeframe,
        last_price,
        sma_short,
        sma_long,
        ema_short: ema(&closes, 12),
        ema_long: ema(&closes, 26),
        rsi: rsi(&closes, 14),
        atr,
        atr_pct: if last_price > 0.0 { atr / last_price * 100.0 } else { 0.0 },
        bb_middle,
        bb_upper,
        bb_lower,
        bb_width,
        trend_strength: trend_strength(&candles, 14),
        volume_ratio: volume_ratio(&volumes, 20),
        macro_trend: None,
        bars: candles.len(),
        candles,
    }
}

/// Directional read of a (macro) series for trend confirmation.
pub fn trend_direction(series: &CandleSeries) -> TrendDirection {
    let closes = series.closes();
    if closes.len() < 20 {
        return TrendDirection::Flat;
    }
    let short = sma(&closes, 10);
    let long = sma(&closes, 20);
    let spread = (short - long) / long.max(f64::EPSILON);
    if spread > 0.001 {
        TrendDirection::Up
    } else if spread < -0.001 {
        TrendDirection::Down
    } else {
        TrendDirection::Flat
    }
}

/// Simple moving average of the trailing window. Falls back to the full
/// series mean when fewer than `period` points exist.
pub fn sma(values: &[f64], period: usize) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let window = period.min(values.len());
    let start = values.len() - window;
    values[start..].iter().sum::<f64>() / window as f64
}

/// Exponential moving average seeded from an SMA of the first window.
pub fn ema(values: &[f64], period: usize) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    if values.len() <= period {
        return sma(values, period);
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut ema = sma(&values[..period], period);
    for value in &values[period..] {
        ema = value * alpha + ema * (1.0 - alpha);
    }
    ema
}

/// Relative strength index. Neutral 50 until enough history exists.
pub fn rsi(closes: &[f64], period: usize) -> f64 {
    if closes.len() < period + 1 {
        return 50.0;
    }
    let mut gains = 0.0;
    let mut losses = 0.0;
    let start = closes.len() - period - 1;
    for w in closes[start..].windows(2) {
        let change = w[1] - w[0];
        if change > 0.0 {
            gains += change;
        } else {
            losses -= change;
        }
    }
    if losses == 0.0 {
        return 100.0;
    }
    let rs = gains / losses;
    100.0 - (100.0 / (1.0 + rs))
}

/// Average true range over the trailing window.
pub fn atr(candles: &[Candle], period: usize) -> f64 {
    if candles.len() < 2 {
        return 0.0;
    }
    let window = period.min(candles.len() - 1);
    let start = candles.len() - window - 1;
    let mut sum = 0.0;
    for i in (start + 1)..candles.len() {
        sum += candles[i].true_range(candles[i - 1].close);
    }
    sum / window as f64
}

/// Bollinger bands: (middle, upper, lower, relative width).
pub fn bollinger(closes: &[f64], period: usize, std_mult: f64) -> (f64, f64, f64, f64) {
    if closes.is_empty() {
        return (0.0, 0.0, 0.0, 0.0);
    }
    let window = period.min(closes.len());
    let start = closes.len() - window;
    let slice = &closes[start..];
    let middle = slice.iter().sum::<f64>() / window as f64;
    let variance = slice.iter().map(|v| (v - middle).powi(2)).sum::<f64>() / window as f64;
    let std_dev = variance.sqrt();
    let upper = middle + std_mult * std_dev;
    let lower = middle - std_mult * std_dev;
    let width = if middle.abs() > f64::EPSILON {
        (upper - lower) / middle
    } else {
        0.0
    };
    (middle, upper, lower, width)
}

/// Wilder-style directional strength on a 0-100 scale.
///
/// Smoothing uses plain trailing sums rather than the recursive Wilder
/// average; close enough for regime bucketing and cheap to recompute.
pub fn trend_strength(candles: &[Candle], period: usize) -> f64 {
    if candles.len() < period + 1 {
        return 0.0;
    }
    let start = candles.len() - period - 1;
    let mut plus_dm = 0.0;
    let mut minus_dm = 0.0;
    let mut tr_sum = 0.0;
    for i in (start + 1)..candles.len() {
        let up = candles[i].high - candles[i - 1].high;
        let down = candles[i - 1].low - candles[i].low;
        if up > down && up > 0.0 {
            plus_dm += up;
        }
        if down > up && down > 0.0 {
            minus_dm += down;
        }
        tr_sum += candles[i].true_range(candles[i - 1].close);
    }
    if tr_sum <= f64::EPSILON {
        return 0.0;
    }
    let plus_di = 100.0 * plus_dm / tr_sum;
    let minus_di = 100.0 * minus_dm / tr_sum;
    let di_sum = plus_di + minus_di;
    if di_sum <= f64::EPSILON {
        return 0.0;
    }
    100.0 * (plus_di - minus_di).abs() / di_sum
}

/// Latest volume relative to the trailing average. Neutral 1.0 when short.
pub fn volume_ratio(volumes: &[f64], period: usize) -> f64 {
    if volumes.len() < 2 {
        return 1.0;
    }
    let window = period.min(volumes.len());
    let start = volumes.len() - window;
    let avg = volumes[start..].iter().sum::<f64>() / window as f64;
    let latest = volumes.last().copied().unwrap_or(0.0);
    if avg > 0.0 {
        latest / avg
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn series_from(closes: &[f64]) -> CandleSeries {
        let mut series = CandleSeries::new(500);
        for (i, close) in closes.iter().enumerate() {
            let ts = Utc
                .with_ymd_and_hms(2025, 3, 1, 0, 0, 0)
                .unwrap()
                + chrono::Duration::minutes(5 * i as i64);
            series.update(Candle::new(ts, *close, *close, *close, *close, 100.0, true));
        }
        series
    }

    #[test]
    fn empty_series_yields_neutral_snapshot() {
        let series = CandleSeries::new(10);
        let snap = enrich("BTCUSDT", Timeframe::M5, &series);
        assert_eq!(snap.bars, 0);
        assert_eq!(snap.rsi, 50.0);
        assert_eq!(snap.volume_ratio, 1.0);
        assert!(!snap.is_warmed_up());
    }

    #[test]
    fn short_series_does_not_panic() {
        let series = series_from(&[100.0, 101.0, 102.0]);
        let snap = enrich("BTCUSDT", Timeframe::M5, &series);
        assert_eq!(snap.bars, 3);
        assert!(snap.sma_short > 0.0);
        assert!(!snap.is_warmed_up());
    }

    #[test]
    fn rsi_extremes() {
        let rising: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        assert_eq!(rsi(&rising, 14), 100.0);

        let falling: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        assert!(rsi(&falling, 14) < 1.0);
    }

    #[test]
    fn trend_strength_high_in_steady_trend() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let series = series_from(&closes);
        let snap = enrich("ETHUSDT", Timeframe::M5, &series);
        assert!(snap.trend_strength > 50.0, "got {}", snap.trend_strength);
        assert!(snap.mas_aligned_up());
    }

    #[test]
    fn bollinger_width_zero_for_flat_series() {
        let closes = vec![100.0; 40];
        let (middle, upper, lower, width) = bollinger(&closes, 20, 2.0);
        assert_eq!(middle, 100.0);
        assert_eq!(upper, lower);
        assert_eq!(width, 0.0);
    }

    #[test]
    fn macro_trend_direction() {
        let up = series_from(&(0..40).map(|i| 100.0 + i as f64).collect::<Vec<_>>());
        assert_eq!(trend_direction(&up), TrendDirection::Up);

        let flat = series_from(&vec![100.0; 40]);
        assert_eq!(trend_direction(&flat), TrendDirection::Flat);
    }
}
