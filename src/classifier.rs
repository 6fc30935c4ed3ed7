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

//! Two-stage regime classification.
//!
//! A learned linear model is attempted first when present and enabled; a
//! missing model file, a feature the model expects but the snapshot cannot
//! provide, or a winning probability under the confidence floor all fall
//! back to the rule-based classifier. The fallback is unconditional and
//! side-effect-free: the learned stage never mutates anything.

use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::{ConfigSource, Toggles};
use crate::indicators::MarketSnapshot;
use crate::regime::{classify, Regime, RegimeDecision, RegimeThresholds};

/// Winning probability below which the learned stage abstains.
pub const CONFIDENCE_FLOOR: f64 = 0.70;

/// Default location of the serialized model bundle.
pub const DEFAULT_MODEL_PATH: &str = "models/regime.json";

/// Serialized linear classifier: one weight row and bias per label.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelBundle {
    pub labels: Vec<String>,
    pub feature_names: Vec<String>,
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
}

impl ModelBundle {
    pub fn from_json(raw: &str) -> Result<Self, String> {
        let bundle: ModelBundle = serde_json::from_str(raw).map_err(|e| e.to_string())?;
        if bundle.labels.is_empty() {
            return Err("bundle has no labels".to_string());
        }
        if bundle.weights.len() != bundle.labels.len() || bundle.bias.len() != bundle.labels.len() {
            return Err(format!(
                "dimension mismatch: {} labels, {} weight rows, {} biases",
                bundle.labels.len(),
                bundle.weights.len(),
                bundle.bias.len()
            ));
        }
        for row in &bundle.weights {
            if row.len() != bundle.feature_names.len() {
                return Err(format!(
                    "weight row of {} values for {} features",
                    row.len(),
                    bundle.feature_names.len()
                ));
            }
        }
        Ok(bundle)
    }
}

/// Feature extraction by model-declared name. `None` means the model
/// expects something this snapshot cannot provide.
fn feature_value(snapshot: &MarketSnapshot, name: &str) -> Option<f64> {
    match name {
        "rsi" => Some(snapshot.rsi),
        "atr_pct" => Some(snapshot.atr_pct),
        "trend_strength" => Some(snapshot.trend_strength),
        "bb_width" => Some(snapshot.bb_width),
        "volume_ratio" => Some(snapshot.volume_ratio),
        "ma_spread" => {
            if snapshot.sma_long.abs() > f64::EPSILON {
                Some((snapshot.sma_short - snapshot.sma_long) / snapshot.sma_long)
            } else {
                None
            }
        }
        "ema_spread" => {
            if snapshot.ema_long.abs() > f64::EPSILON {
                Some((snapshot.ema_short - snapshot.ema_long) / snapshot.ema_long)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Learned classification stage. Holding no bundle is a valid state.
pub struct LearnedClassifier {
    bundle: Option<ModelBundle>,
}

impl LearnedClassifier {
    /// Load the bundle from disk. Absence is non-fatal; the classifier
    /// simply abstains for the whole run.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => {
                info!(path = %path.display(), "no model bundle, rules only");
                return Self { bundle: None };
            }
        };
        match ModelBundle::from_json(&raw) {
            Ok(bundle) => {
                info!(
                    path = %path.display(),
                    labels = bundle.labels.len(),
                    features = bundle.feature_names.len(),
                    "model bundle loaded"
                );
                Self { bundle: Some(bundle) }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "rejected model bundle, rules only");
                Self { bundle: None }
            }
        }
    }

    pub fn from_bundle(bundle: ModelBundle) -> Self {
        Self { bundle: Some(bundle) }
    }

    pub fn empty() -> Self {
        Self { bundle: None }
    }

    pub fn has_model(&self) -> bool {
        self.bundle.is_some()
    }

    /// Attempt a learned classification. `None` means "no opinion": the
    /// caller must fall back to rules.
    pub fn classify(&self, snapshot: &MarketSnapshot) -> Option<RegimeDecision> {
        let bundle = self.bundle.as_ref()?;

        let mut features = Vec::with_capacity(bundle.feature_names.len());
        for name in &bundle.feature_names {
            match feature_value(snapshot, name) {
                Some(value) => features.push(value),
                None => {
                    debug!(symbol = %snapshot.symbol, feature = %name, "feature unavailable");
                    return None;
                }
            }
        }

        let logits: Vec<f64> = bundle
            .weights
            .iter()
            .zip(&bundle.bias)
            .map(|(row, bias)| row.iter().zip(&features).map(|(w, x)| w * x).sum::<f64>() + bias)
            .collect();
        let probs = softmax(&logits);
        let (best, prob) = probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, p)| (i, *p))?;

        if prob < CONFIDENCE_FLOOR {
            debug!(symbol = %snapshot.symbol, prob, "model below confidence floor");
            return None;
        }

        let regime = Regime::from_label(&bundle.labels[best])?;
        Some(RegimeDecision {
            regime,
            strategy: crate::regime::suggested_strategy(regime),
            confidence: prob,
            reason: format!("model picked {} at p={:.2}", bundle.labels[best], prob),
        })
    }
}

/// Learned-first classifier with an unconditional rules fallback.
pub struct TwoStageClassifier {
    thresholds: RegimeThresholds,
    learned: LearnedClassifier,
}

impl TwoStageClassifier {
    pub fn new(thresholds: RegimeThresholds, learned: LearnedClassifier) -> Self {
        Self { thresholds, learned }
    }

    pub fn decide(&self, snapshot: &MarketSnapshot, config: &dyn ConfigSource) -> RegimeDecision {
        if Toggles::ml_enabled(config) {
            if let Some(decision) = self.learned.classify(snapshot) {
                return decision;
            }
        }
        classify(snapshot, &self.thresholds)
    }
}

/// Create the classifier, loading the bundle from the default path.
pub fn create_classifier() -> TwoStageClassifier {
    TwoStageClassifier::new(
        RegimeThresholds::default(),
        LearnedClassifier::load(Path::new(DEFAULT_MODEL_PATH)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle::Timeframe;
    use crate::config::RuntimeConfig;
    use crate::strategy::StrategyTag;

    fn snapshot() -> MarketSnapshot {
        MarketSnapshot {
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::M5,
            candles: Vec::new(),
            last_price: 100.0,
            sma_short: 105.0,
            sma_long: 100.0,
            ema_short: 105.0,
            ema_long: 100.0,
            rsi: 60.0,
            atr: 1.0,
            atr_pct: 1.0,
            bb_middle: 100.0,
            bb_upper: 102.0,
            bb_lower: 98.0,
            bb_width: 0.04,
            trend_strength: 45.0,
            volume_ratio: 1.0,
            macro_trend: None,
            bars: 100,
        }
    }

    fn confident_bundle() -> ModelBundle {
        // Two labels over one feature; large weight gap makes the winner
        // near-certain for any positive trend_strength.
        ModelBundle::from_json(
            r#"{
                "labels": ["trending_up", "quiet"],
                "feature_names": ["trend_strength"],
                "weights": [[1.0], [0.0]],
                "bias": [0.0, 0.0]
            }"#,
        )
        .unwrap()
    }

    fn unsure_bundle() -> ModelBundle {
        ModelBundle::from_json(
            r#"{
                "labels": ["trending_up", "quiet"],
                "feature_names": ["trend_strength"],
                "weights": [[0.0], [0.0]],
                "bias": [0.0, 0.0]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn confident_model_wins() {
        let classifier = LearnedClassifier::from_bundle(confident_bundle());
        let decision = classifier.classify(&snapshot()).expect("decision");
        assert_eq!(decision.regime, Regime::TrendingUp);
        assert_eq!(decision.strategy, StrategyTag::TrendFollowing);
        assert!(decision.confidence >= CONFIDENCE_FLOOR);
    }

    #[test]
    fn below_floor_abstains() {
        // Equal logits give p = 0.5 < 0.70.
        let classifier = LearnedClassifier::from_bundle(unsure_bundle());
        assert!(classifier.classify(&snapshot()).is_none());
    }

    #[test]
    fn unknown_feature_abstains() {
        let bundle = ModelBundle::from_json(
            r#"{
                "labels": ["quiet"],
                "feature_names": ["order_book_imbalance"],
                "weights": [[1.0]],
                "bias": [0.0]
            }"#,
        )
        .unwrap();
        let classifier = LearnedClassifier::from_bundle(bundle);
        assert!(classifier.classify(&snapshot()).is_none());
    }

    #[test]
    fn malformed_bundle_rejected() {
        assert!(ModelBundle::from_json("{}").is_err());
        assert!(ModelBundle::from_json(
            r#"{
                "labels": ["a", "b"],
                "feature_names": ["rsi"],
                "weights": [[1.0]],
                "bias": [0.0, 0.0]
            }"#
        )
        .is_err());
    }

    #[test]
    fn missing_model_falls_back_to_rules() {
        let classifier = TwoStageClassifier::new(
            RegimeThresholds::default(),
            LearnedClassifier::load(Path::new("/nonexistent/model.json")),
        );
        let config = RuntimeConfig::new();
        let decision = classifier.decide(&snapshot(), &config);
        // Rules see a strong aligned uptrend.
        assert_eq!(decision.regime, Regime::TrendingUp);
    }

    #[test]
    fn low_confidence_falls_back_to_rules() {
        let classifier = TwoStageClassifier::new(
            RegimeThresholds::default(),
            LearnedClassifier::from_bundle(unsure_bundle()),
        );
        let config = RuntimeConfig::new();
        let decision = classifier.decide(&snapshot(), &config);
        assert_eq!(decision.regime, Regime::TrendingUp);
        assert!(decision.reason.contains("trend strength"));
    }

    #[test]
    fn toggle_disables_learned_stage() {
        let classifier = TwoStageClassifier::new(
            RegimeThresholds::default(),
            LearnedClassifier::from_bundle(confident_bundle()),
        );
        let config = RuntimeConfig::new();
        config.set("classifier.ml.enabled", "false");
        let decision = classifier.decide(&snapshot(), &config);
        // Rules decision, not the model's near-certain one.
        assert!(decision.reason.contains("trend strength"));
    }
}
