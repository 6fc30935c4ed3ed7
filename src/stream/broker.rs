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

//! Broker bar stream manager.
//!
//! The broker feed only publishes 1-minute bars, so the manager aggregates
//! them client-side into each symbol's strategy timeframe: bars are bucketed
//! by period start, the running bucket is written to the cache as an
//! in-progress candle, and the first bar of the next bucket seals it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::candle::{Candle, Timeframe};
use crate::candle_cache::CandleCache;
use crate::config::{Credentials, SymbolGroups};
use crate::stream::{BackoffPolicy, StopSignal, StreamError, StreamResult};

const WS_URL: &str = "wss://stream.data.alpaca.markets/v2/iex";

const IDLE_PING: Duration = Duration::from_secs(30);

/// Client-side aggregation of 1-minute bars into a coarser timeframe.
///
/// `push` returns every candle the cache should see for the update: the
/// refreshed in-progress bucket, preceded by the sealed previous bucket
/// when the bar opened a new one.
pub struct BarAggregator {
    groups: SymbolGroups,
    building: HashMap<String, Candle>,
}

impl BarAggregator {
    pub fn new(groups: SymbolGroups) -> Self {
        Self {
            groups,
            building: HashMap::new(),
        }
    }

    pub fn push(&mut self, symbol: &str, bar: Candle) -> (Timeframe, Vec<Candle>) {
        let timeframe = self.groups.timeframe_for(symbol);
        let bucket = timeframe.period_start(bar.open_time);
        let mut out = Vec::new();

        match self.building.get_mut(symbol) {
            Some(current) if current.open_time == bucket => {
                current.high = current.high.max(bar.high);
                current.low = current.low.min(bar.low);
                current.close = bar.close;
                current.volume += bar.volume;
                out.push(current.clone());
            }
            Some(current) if bucket > current.open_time => {
                current.closed = true;
                out.push(current.clone());
                let next = Self::open_bucket(bucket, &bar);
                out.push(next.clone());
                self.building.insert(symbol.to_string(), next);
            }
            Some(_) => {
                // Bar older than the running bucket. Ignore.
            }
            None => {
                let next = Self::open_bucket(bucket, &bar);
                out.push(next.clone());
                self.building.insert(symbol.to_string(), next);
            }
        }
        (timeframe, out)
    }

    fn open_bucket(bucket: DateTime<Utc>, bar: &Candle) -> Candle {
        Candle::new(bucket, bar.open, bar.high, bar.low, bar.close, bar.volume, false)
    }
}

/// Broker market data stream manager.
pub struct BrokerStreamManager {
    cache: Arc<CandleCache>,
    credentials: Credentials,
    symbols: Vec<String>,
    aggregator: Mutex<BarAggregator>,
    backoff: BackoffPolicy,
    stop: StopSignal,
    disabled: AtomicBool,
}

impl BrokerStreamManager {
    pub fn new(
        cache: Arc<CandleCache>,
        groups: SymbolGroups,
        credentials: Credentials,
        symbols: Vec<String>,
        stop: StopSignal,
    ) -> Self {
        Self {
            cache,
            credentials,
            symbols,
            aggregator: Mutex::new(BarAggregator::new(groups)),
            backoff: BackoffPolicy::default(),
            stop,
            disabled: AtomicBool::new(false),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Override the reconnect backoff tuning.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn run(self: Arc<Self>) {
        let mut attempt = 0u32;
        info!(symbols = self.symbols.len(), "broker stream starting");
        while !self.stop.triggered() {
            let result = self.connect_and_pump().await;
            if !self.next_attempt(&mut attempt, result).await {
                break;
            }
        }
        info!("broker stream stopped");
    }

    /// Fold one session result into the reconnect budget. Returns false
    /// when the loop should end: stop requested, or the attempt budget
    /// spent, which marks the manager disabled for the rest of the run.
    async fn next_attempt(&self, attempt: &mut u32, result: StreamResult<u64>) -> bool {
        match result {
            Ok(handled) if handled > 0 => {
                *attempt = 0;
                debug!(handled, "broker stream session ended");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "broker stream session failed"),
        }
        if self.stop.triggered() {
            return false;
        }
        match self.backoff.delay(*attempt) {
            Some(delay) => {
                *attempt += 1;
                self.stop.sleep(delay).await
            }
            None => {
                self.disabled.store(true, Ordering::SeqCst);
                error!("broker stream reconnect budget spent, streaming disabled");
                false
            }
        }
    }

    async fn connect_and_pump(&self) -> StreamResult<u64> {
        let (ws, _) = connect_async(WS_URL)
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;
        let (mut write, mut read) = ws.split();

        let auth = json!({
            "action": "auth",
            "key": self.credentials.api_key,
            "secret": self.credentials.api_secret,
        });
        write
            .send(Message::Text(auth.to_string()))
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;

        let mut idle = tokio::time::interval(IDLE_PING);
        idle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        idle.reset();

        let mut handled = 0u64;
        loop {
            tokio::select! {
                _ = self.stop.wait() => return Ok(handled),
                _ = idle.tick() => {
                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                        return Err(StreamError::Closed("ping failed".to_string()));
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        idle.reset();
                        match classify_message(&text) {
                            ControlFlow::Authenticated => {
                                let subscribe = json!({
                                    "action": "subscribe",
                                    "bars": self.symbols,
                                });
                                write
                                    .send(Message::Text(subscribe.to_string()))
                                    .await
                                    .map_err(|e| StreamError::Closed(e.to_string()))?;
                                info!("broker stream subscribed");
                            }
                            ControlFlow::Error(msg) => {
                                return Err(StreamError::Closed(msg));
                            }
                            ControlFlow::Bars(bars) => {
                                for (symbol, bar) in bars {
                                    let (timeframe, updates) =
                                        self.aggregator.lock().push(&symbol, bar);
                                    for candle in updates {
                                        self.cache.update(&symbol, timeframe, candle);
                                    }
                                    handled += 1;
                                }
                            }
                            ControlFlow::Ignore => {}
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        idle.reset();
                        if write.send(Message::Pong(payload)).await.is_err() {
                            return Err(StreamError::Closed("pong failed".to_string()));
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(StreamError::Closed("server closed".to_string()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(StreamError::Closed(e.to_string())),
                },
            }
        }
    }
}

enum ControlFlow {
    Authenticated,
    Error(String),
    Bars(Vec<(String, Candle)>),
    Ignore,
}

/// The broker multiplexes control and data messages on one channel as JSON
/// arrays tagged by `T`.
fn classify_message(text: &str) -> ControlFlow {
    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(text) else {
        return ControlFlow::Ignore;
    };

    let mut bars = Vec::new();
    for item in &items {
        match item.get("T").and_then(Value::as_str) {
            Some("success") => {
                if item.get("msg").and_then(Value::as_str) == Some("authenticated") {
                    return ControlFlow::Authenticated;
                }
            }
            Some("error") => {
                let msg = item
                    .get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown stream error");
                return ControlFlow::Error(msg.to_string());
            }
            Some("b") => {
                if let Some(parsed) = parse_bar(item) {
                    bars.push(parsed);
                }
            }
            _ => {}
        }
    }
    if bars.is_empty() {
        ControlFlow::Ignore
    } else {
        ControlFlow::Bars(bars)
    }
}

fn parse_bar(item: &Value) -> Option<(String, Candle)> {
    let symbol = item.get("S")?.as_str()?.to_string();
    let open_time = item
        .get("t")?
        .as_str()?
        .parse::<DateTime<Utc>>()
        .ok()?;
    let num = |key: &str| item.get(key).and_then(Value::as_f64);
    Some((
        symbol,
        Candle::new(
            open_time,
            num("o")?,
            num("h")?,
            num("l")?,
            num("c")?,
            num("v")?,
            true,
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn minute_bar(minute: u32, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        let ts = Utc.with_ymd_and_hms(2025, 3, 3, 15, minute, 0).unwrap();
        Candle::new(ts, open, high, low, close, volume, true)
    }

    #[test]
    fn minute_bars_aggregate_into_strategy_bucket() {
        // AAPL is broker-only, strategy timeframe 15m.
        let mut agg = BarAggregator::new(SymbolGroups::default());

        let (tf, first) = agg.push("AAPL", minute_bar(0, 100.0, 101.0, 99.0, 100.5, 10.0));
        assert_eq!(tf, Timeframe::M15);
        assert_eq!(first.len(), 1);
        assert!(!first[0].closed);
        assert_eq!(first[0].open, 100.0);

        let (_, second) = agg.push("AAPL", minute_bar(5, 100.5, 102.0, 100.0, 101.5, 12.0));
        assert_eq!(second.len(), 1);
        let running = &second[0];
        assert_eq!(running.open, 100.0);
        assert_eq!(running.high, 102.0);
        assert_eq!(running.low, 99.0);
        assert_eq!(running.close, 101.5);
        assert_eq!(running.volume, 22.0);
        assert!(!running.closed);
    }

    #[test]
    fn new_bucket_seals_previous() {
        let mut agg = BarAggregator::new(SymbolGroups::default());
        agg.push("AAPL", minute_bar(0, 100.0, 101.0, 99.0, 100.5, 10.0));

        // Minute 15 starts the next 15m bucket.
        let (_, updates) = agg.push("AAPL", minute_bar(15, 101.0, 101.5, 100.5, 101.0, 5.0));
        assert_eq!(updates.len(), 2);
        assert!(updates[0].closed);
        assert_eq!(updates[0].close, 100.5);
        assert!(!updates[1].closed);
        assert_eq!(updates[1].open, 101.0);
    }

    #[test]
    fn late_minute_bar_ignored() {
        let mut agg = BarAggregator::new(SymbolGroups::default());
        agg.push("AAPL", minute_bar(15, 101.0, 101.5, 100.5, 101.0, 5.0));
        let (_, updates) = agg.push("AAPL", minute_bar(0, 100.0, 101.0, 99.0, 100.5, 10.0));
        assert!(updates.is_empty());
    }

    #[test]
    fn symbols_aggregate_independently() {
        let mut agg = BarAggregator::new(SymbolGroups::default());
        agg.push("AAPL", minute_bar(0, 100.0, 101.0, 99.0, 100.5, 10.0));
        let (_, updates) = agg.push("TSLA", minute_bar(5, 200.0, 201.0, 199.0, 200.5, 20.0));
        // TSLA opens its own bucket; AAPL's is untouched.
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].open, 200.0);
    }

    #[tokio::test]
    async fn exhausted_reconnect_budget_disables_streaming() {
        let manager = BrokerStreamManager::new(
            Arc::new(CandleCache::default()),
            SymbolGroups::default(),
            Credentials::default(),
            vec!["AAPL".to_string()],
            StopSignal::new(),
        )
        .with_backoff(BackoffPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2),
            max_attempts: 2,
        });

        let mut attempt = 0u32;
        for _ in 0..2 {
            assert!(
                manager
                    .next_attempt(&mut attempt, Err(StreamError::Closed("reset".into())))
                    .await
            );
        }
        assert!(
            !manager
                .next_attempt(&mut attempt, Err(StreamError::Closed("reset".into())))
                .await
        );
        assert!(manager.is_disabled());
    }

    #[test]
    fn control_and_bar_messages_classified() {
        let auth = r#"[{"T":"success","msg":"authenticated"}]"#;
        assert!(matches!(classify_message(auth), ControlFlow::Authenticated));

        let error = r#"[{"T":"error","code":402,"msg":"auth failed"}]"#;
        assert!(matches!(classify_message(error), ControlFlow::Error(_)));

        let bars = r#"[{"T":"b","S":"AAPL","o":100.0,"h":101.0,"l":99.5,"c":100.5,"v":1200,"t":"2025-03-03T15:20:00Z"}]"#;
        match classify_message(bars) {
            ControlFlow::Bars(parsed) => {
                assert_eq!(parsed.len(), 1);
                assert_eq!(parsed[0].0, "AAPL");
                assert_eq!(parsed[0].1.close, 100.5);
            }
            _ => panic!("expected bars"),
        }

        assert!(matches!(classify_message("[]"), ControlFlow::Ignore));
        assert!(matches!(classify_message("garbage"), ControlFlow::Ignore));
    }
}
