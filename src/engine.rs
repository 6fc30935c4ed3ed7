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

//! The decision loop.
//!
//! Every cycle walks the active symbols: fetch, classify, evaluate, emit.
//! A failure on one symbol is counted and logged, never allowed to abort
//! the cycle; margin and notional rejections put the symbol on a cool-down
//! instead of burning retries. The engine owns the stream manager tasks
//! and everything winds down through one stop signal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::candle::CandleSeries;
use crate::classifier::TwoStageClassifier;
use crate::config::{ConfigSource, SymbolGroups, Toggles};
use crate::gateway::{GatewayError, TradingGateway};
use crate::indicators::trend_direction;
use crate::market_service::MarketDataService;
use crate::strategy::{strategy_for, Signal, SignalAction};
use crate::stream::{BrokerStreamManager, CryptoStreamManager, StopSignal};
use crate::venue::OrderResult;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Gap between decision cycles
    pub cycle_interval: Duration,
    /// Act on signals directly instead of emit-only
    pub auto_execute: bool,
    /// Cool-down after a margin or notional rejection
    pub rejection_cooldown: Duration,
    /// Outbound signal channel depth
    pub signal_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_secs(60),
            auto_execute: true,
            rejection_cooldown: Duration::from_secs(900),
            signal_buffer: 256,
        }
    }
}

/// Per-cycle outcome counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub cycle: u64,
    pub evaluated: usize,
    pub signals: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// The per-symbol decision loop plus stream task ownership.
pub struct TradingEngine {
    market: Arc<MarketDataService>,
    gateway: Arc<TradingGateway>,
    classifier: Arc<TwoStageClassifier>,
    config: Arc<dyn ConfigSource>,
    groups: SymbolGroups,
    engine_config: EngineConfig,
    signals: mpsc::Sender<Signal>,
    stop: StopSignal,
    cooldowns: Mutex<HashMap<String, Instant>>,
    stream_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TradingEngine {
    /// Build the engine and hand back the signal stream the front end
    /// subscribes to.
    pub fn new(
        market: Arc<MarketDataService>,
        gateway: Arc<TradingGateway>,
        classifier: Arc<TwoStageClassifier>,
        config: Arc<dyn ConfigSource>,
        groups: SymbolGroups,
        engine_config: EngineConfig,
    ) -> (Arc<Self>, mpsc::Receiver<Signal>) {
        let (tx, rx) = mpsc::channel(engine_config.signal_buffer);
        let engine = Arc::new(Self {
            market,
            gateway,
            classifier,
            config,
            groups,
            engine_config,
            signals: tx,
            stop: StopSignal::new(),
            cooldowns: Mutex::new(HashMap::new()),
            stream_tasks: Mutex::new(Vec::new()),
        });
        (engine, rx)
    }

    /// Shared stop signal; stream managers take a clone of this.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Request shutdown. Stream tasks see it through the shared signal.
    pub fn stop(&self) {
        self.stop.trigger();
    }

    /// Spawn and take ownership of the stream manager tasks.
    pub fn spawn_streams(
        &self,
        crypto: Option<Arc<CryptoStreamManager>>,
        broker: Option<Arc<BrokerStreamManager>>,
    ) {
        let mut tasks = self.stream_tasks.lock();
        if let Some(manager) = crypto {
            tasks.push(tokio::spawn(manager.run()));
        }
        if let Some(manager) = broker {
            tasks.push(tokio::spawn(manager.run()));
        }
    }

    /// Main loop. Returns once stop is triggered and stream tasks have
    /// wound down.
    pub async fn run(self: Arc<Self>) {
        info!(
            interval_s = self.engine_config.cycle_interval.as_secs(),
            auto_execute = self.engine_config.auto_execute,
            "engine starting"
        );
        let mut cycle = 0u64;
        while !self.stop.triggered() {
            cycle += 1;
            let started = Instant::now();
            let stats = self.run_cycle(cycle).await;
            info!(
                cycle = stats.cycle,
                evaluated = stats.evaluated,
                signals = stats.signals,
                skipped = stats.skipped,
                errors = stats.errors,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "cycle complete"
            );
            if !self.stop.sleep(self.engine_config.cycle_interval).await {
                break;
            }
        }
        for task in self.stream_tasks.lock().drain(..) {
            task.abort();
        }
        info!("engine stopped");
    }

    /// One pass over the active symbols. Never aborts early.
    pub async fn run_cycle(&self, cycle: u64) -> CycleStats {
        let mut stats = CycleStats {
            cycle,
            ..CycleStats::default()
        };
        for symbol in self.groups.all_symbols() {
            if Toggles::symbol_disabled(self.config.as_ref(), &symbol) {
                stats.skipped += 1;
                continue;
            }
            if self.cooling_down(&symbol) {
                stats.skipped += 1;
                continue;
            }
            stats.evaluated += 1;
            match self.process_symbol(&symbol).await {
                Ok(emitted) => {
                    if emitted {
                        stats.signals += 1;
                    }
                }
                Err(e) => {
                    stats.errors += 1;
                    warn!(symbol = %symbol, error = %e, "symbol skipped this cycle");
                }
            }
        }
        stats
    }

    async fn process_symbol(
        &self,
        symbol: &str,
    ) -> Result<bool, crate::market_service::MarketDataError> {
        let frames = self.market.get_multiframe_candles(symbol).await?;

        let mut snapshot = frames.main.snapshot;
        let macro_candles = frames.macro_frame.snapshot.candles;
        if !macro_candles.is_empty() {
            let macro_series = CandleSeries::from_candles(macro_candles.len(), macro_candles);
            snapshot.macro_trend = Some(trend_direction(&macro_series));
        }

        let decision = self.classifier.decide(&snapshot, self.config.as_ref());
        let strategy = strategy_for(&decision, self.config.as_ref());
        let signal = strategy.evaluate(&snapshot, &decision);
        debug!(
            symbol,
            regime = ?decision.regime,
            strategy = %strategy.tag(),
            action = ?signal.action,
            confidence = signal.confidence,
            "evaluated"
        );

        let actionable = signal.is_actionable();
        if self.signals.try_send(signal.clone()).is_err() {
            warn!(symbol, "signal channel full, dropping");
        }

        if actionable && self.engine_config.auto_execute {
            self.execute(&signal).await;
        }
        Ok(actionable)
    }

    async fn execute(&self, signal: &Signal) {
        let strategy_tag = signal
            .metadata
            .get("strategy")
            .map(String::as_str)
            .unwrap_or("unknown");
        let outcome = match signal.action {
            SignalAction::Buy => self.gateway.execute_long(&signal.symbol, strategy_tag).await,
            SignalAction::Sell => self.gateway.execute_short(&signal.symbol, strategy_tag).await,
            SignalAction::Exit => self.gateway.close_position(&signal.symbol).await,
            SignalAction::Hold => return,
        };
        match outcome {
            Ok(OrderResult { error: Some(e), .. }) if e.wants_cooldown() => {
                self.note_cooldown(&signal.symbol);
                info!(symbol = %signal.symbol, error = %e, "symbol on cool-down");
            }
            Ok(result) => {
                debug!(symbol = %signal.symbol, status = ?result.status, "execution result");
            }
            Err(GatewayError::Venue(e)) if e.wants_cooldown() => {
                self.note_cooldown(&signal.symbol);
                info!(symbol = %signal.symbol, error = %e, "symbol on cool-down");
            }
            Err(e) => warn!(symbol = %signal.symbol, error = %e, "execution failed"),
        }
    }

    fn cooling_down(&self, symbol: &str) -> bool {
        let mut cooldowns = self.cooldowns.lock();
        match cooldowns.get(symbol) {
            Some(until) if Instant::now() < *until => true,
            Some(_) => {
                cooldowns.remove(symbol);
                false
            }
            None => false,
        }
    }

    fn note_cooldown(&self, symbol: &str) {
        self.cooldowns.lock().insert(
            symbol.to_string(),
            Instant::now() + self.engine_config.rejection_cooldown,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle::{Candle, Timeframe};
    use crate::candle_cache::CandleCache;
    use crate::classifier::{LearnedClassifier, TwoStageClassifier};
    use crate::config::{RuntimeConfig, VenueId};
    use crate::gateway::create_gateway;
    use crate::market_service::MarketDataService;
    use crate::rate_limiter::{RateLimiterConfig, RestRateLimiter};
    use crate::regime::RegimeThresholds;
    use crate::venue::{
        BalanceState, OrderRequest, PositionState, VenueAdapter, VenueError, VenueResult,
    };
    use crate::wallet::create_wallet_store;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::HashSet;

    struct ScriptedVenue {
        failing: HashSet<String>,
    }

    #[async_trait]
    impl VenueAdapter for ScriptedVenue {
        fn venue(&self) -> VenueId {
            VenueId::Binance
        }

        async fn initialize(&self) -> VenueResult<()> {
            Ok(())
        }

        async fn fetch_candles(
            &self,
            symbol: &str,
            _timeframe: Timeframe,
            limit: usize,
        ) -> VenueResult<CandleSeries> {
            if self.failing.contains(symbol) {
                return Err(VenueError::VenueUnavailable("scripted".to_string()));
            }
            // An uptrend with periodic pullbacks: strong enough to classify
            // as trending, not so one-sided that RSI pins at 100 and the
            // trend follower refuses the entry.
            let mut series = CandleSeries::new(limit.max(60));
            for i in 0..60i64 {
                let ts = Utc.with_ymd_and_hms(2025, 3, 3, 0, 0, 0).unwrap()
                    + chrono::Duration::minutes(5 * i);
                let base = 100.0 + i as f64 - if i % 4 == 0 { 3.0 } else { 0.0 };
                series.update(Candle::new(ts, base, base + 0.8, base - 0.2, base + 0.5, 10.0, true));
            }
            Ok(series)
        }

        async fn balance(&self) -> VenueResult<BalanceState> {
            Ok(BalanceState::new(1000.0, 1000.0, "USDT"))
        }

        async fn place_order(&self, _request: &OrderRequest) -> VenueResult<OrderResult> {
            Ok(OrderResult::filled("scripted".to_string(), 100.0))
        }

        async fn cancel_orders(&self, _symbol: &str) -> VenueResult<()> {
            Ok(())
        }

        async fn positions(&self) -> VenueResult<Vec<PositionState>> {
            Ok(vec![])
        }

        async fn close_position(&self, _symbol: &str) -> VenueResult<OrderResult> {
            Ok(OrderResult::filled("scripted".to_string(), 100.0))
        }

        async fn close(&self) -> VenueResult<()> {
            Ok(())
        }
    }

    fn crypto_only_groups(symbols: &[&str]) -> SymbolGroups {
        let set = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        SymbolGroups {
            crypto_primary: set(symbols),
            crypto_fallback: HashSet::new(),
            broker_only: HashSet::new(),
            majors: HashSet::new(),
            high_volatility: HashSet::new(),
        }
    }

    async fn engine_with(
        failing: &[&str],
        groups: SymbolGroups,
        config: Arc<RuntimeConfig>,
    ) -> (Arc<TradingEngine>, mpsc::Receiver<Signal>) {
        let gateway = create_gateway(
            groups.clone(),
            config.clone(),
            create_wallet_store(),
            "t1",
        );
        gateway.register(Arc::new(ScriptedVenue {
            failing: failing.iter().map(|s| s.to_string()).collect(),
        }));
        gateway.connect(VenueId::Binance).await.unwrap();

        let limiter = Arc::new(RestRateLimiter::new(RateLimiterConfig {
            min_spacing: Duration::ZERO,
            symbol_cooldown: Duration::ZERO,
            hourly_budget: 10_000,
        }));
        let market = Arc::new(MarketDataService::new(
            gateway.clone(),
            Arc::new(CandleCache::default()),
            limiter,
            groups.clone(),
        ));
        let classifier = Arc::new(TwoStageClassifier::new(
            RegimeThresholds::default(),
            LearnedClassifier::empty(),
        ));
        TradingEngine::new(
            market,
            gateway,
            classifier,
            config,
            groups,
            EngineConfig {
                auto_execute: false,
                ..EngineConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn cycle_emits_signals_for_healthy_symbols() {
        let groups = crypto_only_groups(&["BTCUSDT", "ETHUSDT"]);
        let (engine, mut rx) = engine_with(&[], groups, Arc::new(RuntimeConfig::new())).await;

        let stats = engine.run_cycle(1).await;
        assert_eq!(stats.evaluated, 2);
        assert_eq!(stats.errors, 0);
        // Uptrend data: both symbols produce actionable buy signals.
        assert_eq!(stats.signals, 2);
        let signal = rx.recv().await.unwrap();
        assert_eq!(signal.action, SignalAction::Buy);
    }

    #[tokio::test]
    async fn one_failing_symbol_does_not_abort_the_cycle() {
        let groups = crypto_only_groups(&["BTCUSDT", "ETHUSDT", "SOLUSDT"]);
        let (engine, _rx) = engine_with(&["ETHUSDT"], groups, Arc::new(RuntimeConfig::new())).await;

        let stats = engine.run_cycle(1).await;
        assert_eq!(stats.evaluated, 3);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.signals, 2);
    }

    #[tokio::test]
    async fn disabled_symbol_skipped() {
        let groups = crypto_only_groups(&["BTCUSDT", "ETHUSDT"]);
        let config = Arc::new(RuntimeConfig::new());
        config.set("symbols.disabled", "ETHUSDT");
        let (engine, _rx) = engine_with(&[], groups, config).await;

        let stats = engine.run_cycle(1).await;
        assert_eq!(stats.evaluated, 1);
        assert_eq!(stats.skipped, 1);
    }

    #[tokio::test]
    async fn cooldown_skips_symbol_until_expiry() {
        let groups = crypto_only_groups(&["BTCUSDT"]);
        let (engine, _rx) = engine_with(&[], groups, Arc::new(RuntimeConfig::new())).await;

        engine.note_cooldown("BTCUSDT");
        let stats = engine.run_cycle(1).await;
        assert_eq!(stats.evaluated, 0);
        assert_eq!(stats.skipped, 1);
    }

    #[tokio::test]
    async fn stop_signal_shared_with_streams() {
        let groups = crypto_only_groups(&["BTCUSDT"]);
        let (engine, _rx) = engine_with(&[], groups, Arc::new(RuntimeConfig::new())).await;

        let signal = engine.stop_signal();
        assert!(!signal.triggered());
        engine.stop();
        assert!(signal.triggered());
    }
}
