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

//! Strategy trait, the regime-driven factory, and the concrete strategies.
//!
//! Strategies are pure evaluators: snapshot in, signal out. A HOLD signal
//! carries no side effect anywhere downstream. The factory maps the
//! classifier's suggestion to an implementation, honoring per-strategy
//! runtime toggles; a disabled strategy falls through to the conservative
//! default rather than to nothing.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ConfigSource, Toggles};
use crate::indicators::MarketSnapshot;
use crate::regime::{Regime, RegimeDecision};

/// Strategy identifiers, also used in toggle keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyTag {
    TrendFollowing,
    Grid,
    MeanReversion,
    MomentumBreakout,
    Conservative,
}

impl StrategyTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyTag::TrendFollowing => "trend_following",
            StrategyTag::Grid => "grid",
            StrategyTag::MeanReversion => "mean_reversion",
            StrategyTag::MomentumBreakout => "momentum_breakout",
            StrategyTag::Conservative => "conservative",
        }
    }
}

impl std::fmt::Display for StrategyTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the strategy wants done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
    Exit,
}

/// One strategy decision for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub action: SignalAction,
    /// In [0, 1]
    pub confidence: f64,
    /// Price the decision was made against
    pub price: f64,
    /// Free-form context for the front end and logs
    pub metadata: HashMap<String, String>,
}

impl Signal {
    pub fn new(symbol: &str, action: SignalAction, confidence: f64, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            action,
            confidence: confidence.clamp(0.0, 1.0),
            price,
            metadata: HashMap::new(),
        }
    }

    pub fn hold(symbol: &str, price: f64) -> Self {
        Self::new(symbol, SignalAction::Hold, 0.0, price)
    }

    pub fn with_meta(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_actionable(&self) -> bool {
        self.action != SignalAction::Hold
    }
}

/// A pure snapshot evaluator.
pub trait Strategy: Send + Sync {
    fn tag(&self) -> StrategyTag;

    fn evaluate(&self, snapshot: &MarketSnapshot, decision: &RegimeDecision) -> Signal;
}

/// Pick the strategy for a classification, honoring runtime toggles.
/// Disabled strategies fall through to the conservative default.
pub fn strategy_for(decision: &RegimeDecision, config: &dyn ConfigSource) -> Arc<dyn Strategy> {
    let tag = decision.strategy;
    if tag != StrategyTag::Conservative && !Toggles::strategy_enabled(config, tag.as_str()) {
        debug!(strategy = %tag, "strategy disabled, using conservative default");
        return Arc::new(ConservativeStrategy);
    }
    match tag {
        StrategyTag::TrendFollowing => Arc::new(TrendFollowingStrategy),
        StrategyTag::Grid => Arc::new(GridStrategy),
        StrategyTag::MeanReversion => Arc::new(MeanReversionStrategy),
        StrategyTag::MomentumBreakout => Arc::new(MomentumBreakoutStrategy),
        StrategyTag::Conservative => Arc::new(ConservativeStrategy),
    }
}

fn tagged(signal: Signal, strategy: StrategyTag, decision: &RegimeDecision) -> Signal {
    signal
        .with_meta("strategy", strategy.as_str())
        .with_meta("regime", format!("{:?}", decision.regime))
        .with_meta("reason", &decision.reason)
}

/// Rides established trends: moving-average alignment plus directional
/// strength, exiting when the trend decays.
pub struct TrendFollowingStrategy;

impl TrendFollowingStrategy {
    const ENTRY_STRENGTH: f64 = 25.0;
    const EXIT_STRENGTH: f64 = 15.0;
    const OVERBOUGHT: f64 = 78.0;
    const OVERSOLD: f64 = 22.0;
}

impl Strategy for TrendFollowingStrategy {
    fn tag(&self) -> StrategyTag {
        StrategyTag::TrendFollowing
    }

    fn evaluate(&self, snapshot: &MarketSnapshot, decision: &RegimeDecision) -> Signal {
        let price = snapshot.last_price;
        if snapshot.trend_strength < Self::EXIT_STRENGTH {
            let signal = Signal::new(&snapshot.symbol, SignalAction::Exit, 0.6, price);
            return tagged(signal, self.tag(), decision);
        }
        let signal = if snapshot.mas_aligned_up()
            && snapshot.trend_strength >= Self::ENTRY_STRENGTH
            && snapshot.rsi < Self::OVERBOUGHT
        {
            Signal::new(&snapshot.symbol, SignalAction::Buy, decision.confidence, price)
        } else if snapshot.mas_aligned_down()
            && snapshot.trend_strength >= Self::ENTRY_STRENGTH
            && snapshot.rsi > Self::OVERSOLD
        {
            Signal::new(&snapshot.symbol, SignalAction::Sell, decision.confidence, price)
        } else {
            Signal::hold(&snapshot.symbol, price)
        };
        tagged(signal, self.tag(), decision)
    }
}

/// Buys the bottom of a tight band and sells the top.
pub struct GridStrategy;

impl GridStrategy {
    /// Fraction of the band span counted as "near" an edge.
    const EDGE_FRACTION: f64 = 0.2;
}

impl Strategy for GridStrategy {
    fn tag(&self) -> StrategyTag {
        StrategyTag::Grid
    }

    fn evaluate(&self, snapshot: &MarketSnapshot, decision: &RegimeDecision) -> Signal {
        let price = snapshot.last_price;
        let span = snapshot.bb_upper - snapshot.bb_lower;
        if span <= f64::EPSILON {
            return tagged(Signal::hold(&snapshot.symbol, price), self.tag(), decision);
        }
        let edge = span * Self::EDGE_FRACTION;
        let signal = if price <= snapshot.bb_lower + edge {
            Signal::new(&snapshot.symbol, SignalAction::Buy, decision.confidence, price)
        } else if price >= snapshot.bb_upper - edge {
            Signal::new(&snapshot.symbol, SignalAction::Sell, decision.confidence, price)
        } else {
            Signal::hold(&snapshot.symbol, price)
        };
        tagged(signal, self.tag(), decision)
    }
}

/// Fades extremes in a wide range: oversold below the lower band, buy;
/// overbought above the upper band, sell.
pub struct MeanReversionStrategy;

impl MeanReversionStrategy {
    const OVERSOLD: f64 = 30.0;
    const OVERBOUGHT: f64 = 70.0;
}

impl Strategy for MeanReversionStrategy {
    fn tag(&self) -> StrategyTag {
        StrategyTag::MeanReversion
    }

    fn evaluate(&self, snapshot: &MarketSnapshot, decision: &RegimeDecision) -> Signal {
        let price = snapshot.last_price;
        let signal = if snapshot.rsi <= Self::OVERSOLD && price <= snapshot.bb_lower {
            Signal::new(&snapshot.symbol, SignalAction::Buy, decision.confidence, price)
        } else if snapshot.rsi >= Self::OVERBOUGHT && price >= snapshot.bb_upper {
            Signal::new(&snapshot.symbol, SignalAction::Sell, decision.confidence, price)
        } else {
            Signal::hold(&snapshot.symbol, price)
        };
        tagged(signal, self.tag(), decision)
    }
}

/// Chases volume-backed band breaks in a volatile regime.
pub struct MomentumBreakoutStrategy;

impl MomentumBreakoutStrategy {
    const VOLUME_BACKING: f64 = 1.5;
}

impl Strategy for MomentumBreakoutStrategy {
    fn tag(&self) -> StrategyTag {
        StrategyTag::MomentumBreakout
    }

    fn evaluate(&self, snapshot: &MarketSnapshot, decision: &RegimeDecision) -> Signal {
        let price = snapshot.last_price;
        let backed = snapshot.volume_ratio >= Self::VOLUME_BACKING;
        let signal = if backed && price > snapshot.bb_upper {
            Signal::new(&snapshot.symbol, SignalAction::Buy, decision.confidence, price)
        } else if backed && price < snapshot.bb_lower {
            Signal::new(&snapshot.symbol, SignalAction::Sell, decision.confidence, price)
        } else {
            Signal::hold(&snapshot.symbol, price)
        };
        tagged(signal, self.tag(), decision)
    }
}

/// The default when nothing else applies or the picked strategy is
/// disabled. Holds, except it flattens into extreme volatility.
pub struct ConservativeStrategy;

impl Strategy for ConservativeStrategy {
    fn tag(&self) -> StrategyTag {
        StrategyTag::Conservative
    }

    fn evaluate(&self, snapshot: &MarketSnapshot, decision: &RegimeDecision) -> Signal {
        let price = snapshot.last_price;
        let signal = if decision.regime == Regime::ExtremeVolatility {
            Signal::new(&snapshot.symbol, SignalAction::Exit, decision.confidence, price)
        } else {
            Signal::hold(&snapshot.symbol, price)
        };
        tagged(signal, self.tag(), decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle::Timeframe;
    use crate::config::RuntimeConfig;
    use crate::regime::suggested_strategy;

    fn snapshot() -> MarketSnapshot {
        MarketSnapshot {
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::M5,
            candles: Vec::new(),
            last_price: 100.0,
            sma_short: 100.0,
            sma_long: 100.0,
            ema_short: 100.0,
            ema_long: 100.0,
            rsi: 50.0,
            atr: 1.0,
            atr_pct: 1.0,
            bb_middle: 100.0,
            bb_upper: 104.0,
            bb_lower: 96.0,
            bb_width: 0.08,
            trend_strength: 20.0,
            volume_ratio: 1.0,
            macro_trend: None,
            bars: 100,
        }
    }

    fn decision(regime: Regime, confidence: f64) -> RegimeDecision {
        RegimeDecision {
            regime,
            strategy: suggested_strategy(regime),
            confidence,
            reason: "test".to_string(),
        }
    }

    #[test]
    fn trend_following_buys_aligned_uptrend() {
        let mut snap = snapshot();
        snap.sma_short = 105.0;
        snap.sma_long = 100.0;
        snap.trend_strength = 40.0;
        let signal =
            TrendFollowingStrategy.evaluate(&snap, &decision(Regime::TrendingUp, 0.8));
        assert_eq!(signal.action, SignalAction::Buy);
        assert_eq!(signal.confidence, 0.8);
        assert_eq!(signal.metadata.get("strategy").unwrap(), "trend_following");
    }

    #[test]
    fn trend_following_exits_decayed_trend() {
        let mut snap = snapshot();
        snap.trend_strength = 10.0;
        let signal =
            TrendFollowingStrategy.evaluate(&snap, &decision(Regime::WeakTrend, 0.55));
        assert_eq!(signal.action, SignalAction::Exit);
    }

    #[test]
    fn trend_following_skips_overbought_entry() {
        let mut snap = snapshot();
        snap.sma_short = 105.0;
        snap.sma_long = 100.0;
        snap.trend_strength = 40.0;
        snap.rsi = 85.0;
        let signal =
            TrendFollowingStrategy.evaluate(&snap, &decision(Regime::TrendingUp, 0.8));
        assert_eq!(signal.action, SignalAction::Hold);
    }

    #[test]
    fn grid_trades_band_edges() {
        let mut snap = snapshot();
        snap.last_price = 96.5;
        let buy = GridStrategy.evaluate(&snap, &decision(Regime::RangingTight, 0.7));
        assert_eq!(buy.action, SignalAction::Buy);

        snap.last_price = 103.6;
        let sell = GridStrategy.evaluate(&snap, &decision(Regime::RangingTight, 0.7));
        assert_eq!(sell.action, SignalAction::Sell);

        snap.last_price = 100.0;
        let hold = GridStrategy.evaluate(&snap, &decision(Regime::RangingTight, 0.7));
        assert_eq!(hold.action, SignalAction::Hold);
    }

    #[test]
    fn mean_reversion_needs_both_rsi_and_band() {
        let mut snap = snapshot();
        snap.rsi = 25.0;
        snap.last_price = 100.0;
        let hold = MeanReversionStrategy.evaluate(&snap, &decision(Regime::RangingWide, 0.6));
        assert_eq!(hold.action, SignalAction::Hold);

        snap.last_price = 95.0;
        let buy = MeanReversionStrategy.evaluate(&snap, &decision(Regime::RangingWide, 0.6));
        assert_eq!(buy.action, SignalAction::Buy);
    }

    #[test]
    fn breakout_requires_volume_backing() {
        let mut snap = snapshot();
        snap.last_price = 105.0;
        let hold = MomentumBreakoutStrategy.evaluate(&snap, &decision(Regime::Volatile, 0.7));
        assert_eq!(hold.action, SignalAction::Hold);

        snap.volume_ratio = 2.0;
        let buy = MomentumBreakoutStrategy.evaluate(&snap, &decision(Regime::Volatile, 0.7));
        assert_eq!(buy.action, SignalAction::Buy);
    }

    #[test]
    fn conservative_flattens_only_extreme_volatility() {
        let snap = snapshot();
        let hold = ConservativeStrategy.evaluate(&snap, &decision(Regime::Quiet, 0.5));
        assert_eq!(hold.action, SignalAction::Hold);
        assert!(!hold.is_actionable());

        let exit =
            ConservativeStrategy.evaluate(&snap, &decision(Regime::ExtremeVolatility, 0.9));
        assert_eq!(exit.action, SignalAction::Exit);
    }

    #[test]
    fn factory_follows_suggestion() {
        let config = RuntimeConfig::new();
        let strategy = strategy_for(&decision(Regime::RangingTight, 0.7), &config);
        assert_eq!(strategy.tag(), StrategyTag::Grid);
    }

    #[test]
    fn disabled_strategy_falls_back_to_conservative() {
        let config = RuntimeConfig::new();
        config.set("strategy.grid.enabled", "false");
        let strategy = strategy_for(&decision(Regime::RangingTight, 0.7), &config);
        assert_eq!(strategy.tag(), StrategyTag::Conservative);
    }
}
