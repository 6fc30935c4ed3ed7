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

//! Rule-based market regime classification.
//!
//! Branches run in a fixed priority order; the first match wins. The
//! thresholds are hand-tuned operating points, configuration rather than
//! invariants, and live in [`RegimeThresholds`] so a deployment can move
//! them without touching the rules.

use serde::{Deserialize, Serialize};

use crate::indicators::{MarketSnapshot, TrendDirection};
use crate::strategy::StrategyTag;

/// Market regime buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    /// Not enough history to say anything
    Uncertain,
    /// Volatility too high to trade directionally
    ExtremeVolatility,
    TrendingUp,
    TrendingDown,
    /// Elevated volatility with momentum behind it
    Volatile,
    WeakTrend,
    RangingTight,
    RangingWide,
    /// Nothing notable happening
    Quiet,
}

impl Regime {
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "uncertain" => Some(Regime::Uncertain),
            "extreme_volatility" => Some(Regime::ExtremeVolatility),
            "trending_up" => Some(Regime::TrendingUp),
            "trending_down" => Some(Regime::TrendingDown),
            "volatile" => Some(Regime::Volatile),
            "weak_trend" => Some(Regime::WeakTrend),
            "ranging_tight" => Some(Regime::RangingTight),
            "ranging_wide" => Some(Regime::RangingWide),
            "quiet" => Some(Regime::Quiet),
            _ => None,
        }
    }
}

/// Strategy suggested for each regime.
pub fn suggested_strategy(regime: Regime) -> StrategyTag {
    match regime {
        Regime::TrendingUp | Regime::TrendingDown | Regime::WeakTrend => StrategyTag::TrendFollowing,
        Regime::Volatile => StrategyTag::MomentumBreakout,
        Regime::RangingTight => StrategyTag::Grid,
        Regime::RangingWide => StrategyTag::MeanReversion,
        Regime::Uncertain | Regime::ExtremeVolatility | Regime::Quiet => StrategyTag::Conservative,
    }
}

/// Classification output: regime, the strategy it suggests, and how sure
/// the classifier is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeDecision {
    pub regime: Regime,
    pub strategy: StrategyTag,
    /// In [0, 1]
    pub confidence: f64,
    pub reason: String,
}

impl RegimeDecision {
    fn new(regime: Regime, confidence: f64, reason: String) -> Self {
        Self {
            regime,
            strategy: suggested_strategy(regime),
            confidence: confidence.clamp(0.0, 1.0),
            reason,
        }
    }
}

/// Hand-tuned operating points for the rule branches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeThresholds {
    /// ATR percent above which directional trading is off
    pub extreme_atr_pct: f64,
    /// ATR percent marking elevated volatility
    pub high_atr_pct: f64,
    /// Trend-strength reading that counts as a strong trend
    pub strong_trend: f64,
    /// Trend-strength reading that still counts as a weak trend
    pub weak_trend: f64,
    /// Volume-over-average ratio backing a momentum read
    pub momentum_volume: f64,
    /// Band width at or below which a range is tight
    pub tight_band_width: f64,
    /// Band width at or above which a range is wide
    pub wide_band_width: f64,
}

impl Default for RegimeThresholds {
    fn default() -> Self {
        Self {
            extreme_atr_pct: 6.0,
            high_atr_pct: 2.5,
            strong_trend: 30.0,
            weak_trend: 18.0,
            momentum_volume: 1.8,
            tight_band_width: 0.025,
            wide_band_width: 0.05,
        }
    }
}

/// Classify one snapshot. Pure; same snapshot and thresholds always yield
/// the same decision.
pub fn classify(snapshot: &MarketSnapshot, thresholds: &RegimeThresholds) -> RegimeDecision {
    if !snapshot.is_warmed_up() {
        return RegimeDecision::new(
            Regime::Uncertain,
            0.0,
            format!("only {} bars of history", snapshot.bars),
        );
    }

    if snapshot.atr_pct >= thresholds.extreme_atr_pct {
        return RegimeDecision::new(
            Regime::ExtremeVolatility,
            0.9,
            format!("atr {:.2}% above extreme bound", snapshot.atr_pct),
        );
    }

    if snapshot.trend_strength >= thresholds.strong_trend {
        let clearance = ((snapshot.trend_strength - thresholds.strong_trend) / 100.0).min(0.25);
        if snapshot.mas_aligned_up() {
            let mut confidence = 0.7 + clearance;
            if snapshot.macro_trend == Some(TrendDirection::Down) {
                confidence -= 0.15;
            }
            return RegimeDecision::new(
                Regime::TrendingUp,
                confidence,
                format!("trend strength {:.1} with rising averages", snapshot.trend_strength),
            );
        }
        if snapshot.mas_aligned_down() {
            let mut confidence = 0.7 + clearance;
            if snapshot.macro_trend == Some(TrendDirection::Up) {
                confidence -= 0.15;
            }
            return RegimeDecision::new(
                Regime::TrendingDown,
                confidence,
                format!("trend strength {:.1} with falling averages", snapshot.trend_strength),
            );
        }
        // Strong reading without aligned averages: treat as churn.
    }

    if snapshot.atr_pct >= thresholds.high_atr_pct && snapshot.volume_ratio >= thresholds.momentum_volume
    {
        let span = (thresholds.extreme_atr_pct - thresholds.high_atr_pct).max(f64::EPSILON);
        let clearance = ((snapshot.atr_pct - thresholds.high_atr_pct) / span * 0.2).min(0.2);
        return RegimeDecision::new(
            Regime::Volatile,
            0.65 + clearance,
            format!(
                "atr {:.2}% with volume {:.1}x average",
                snapshot.atr_pct, snapshot.volume_ratio
            ),
        );
    }

    if snapshot.trend_strength >= thresholds.weak_trend
        && (snapshot.mas_aligned_up() || snapshot.mas_aligned_down())
    {
        return RegimeDecision::new(
            Regime::WeakTrend,
            0.55,
            format!("trend strength {:.1} below strong bound", snapshot.trend_strength),
        );
    }

    if snapshot.bb_width <= thresholds.tight_band_width {
        let clearance =
            (thresholds.tight_band_width - snapshot.bb_width) / thresholds.tight_band_width * 0.2;
        return RegimeDecision::new(
            Regime::RangingTight,
            0.6 + clearance,
            format!("band width {:.3} inside tight bound", snapshot.bb_width),
        );
    }
    if snapshot.bb_width >= thresholds.wide_band_width {
        return RegimeDecision::new(
            Regime::RangingWide,
            0.6,
            format!("band width {:.3} past wide bound", snapshot.bb_width),
        );
    }

    RegimeDecision::new(Regime::Quiet, 0.5, "no branch matched".to_string())
}
