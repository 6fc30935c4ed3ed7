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

//! Crypto kline stream manager.
//!
//! One combined WebSocket carries every subscribed symbol at its configured
//! timeframe (plus a 1-minute feed for fine-entry symbols). Partial bar
//! updates overwrite the in-progress cache entry; the close update for the
//! same period lands in the same slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::candle::{Candle, Timeframe};
use crate::candle_cache::CandleCache;
use crate::config::SymbolGroups;
use crate::stream::{BackoffPolicy, StopSignal, StreamError, StreamResult};
use crate::venue::BinanceAdapter;

const WS_BASE: &str = "wss://fstream.binance.com/stream";

/// Ping the venue after this long without any inbound frame.
const IDLE_PING: Duration = Duration::from_secs(30);

/// Combined kline WebSocket manager for the primary crypto venue.
pub struct CryptoStreamManager {
    cache: Arc<CandleCache>,
    groups: SymbolGroups,
    symbols: Vec<String>,
    backoff: BackoffPolicy,
    stop: StopSignal,
    disabled: AtomicBool,
}

impl CryptoStreamManager {
    pub fn new(
        cache: Arc<CandleCache>,
        groups: SymbolGroups,
        symbols: Vec<String>,
        stop: StopSignal,
    ) -> Self {
        Self {
            cache,
            groups,
            symbols,
            backoff: BackoffPolicy::default(),
            stop,
            disabled: AtomicBool::new(false),
        }
    }

    /// Whether reconnect attempts were exhausted this run.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Override the reconnect backoff tuning.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Combined-stream URL covering every symbol at its strategy timeframe,
    /// with an extra 1-minute leg for fine-entry symbols.
    fn stream_url(&self) -> String {
        let mut legs = Vec::new();
        for symbol in &self.symbols {
            let venue = BinanceAdapter::venue_symbol(symbol).to_lowercase();
            let timeframe = self.groups.timeframe_for(symbol);
            legs.push(format!("{}@kline_{}", venue, timeframe.as_venue_str()));
            if self.groups.needs_micro_frame(symbol) && timeframe != Timeframe::M1 {
                legs.push(format!("{}@kline_1m", venue));
            }
        }
        format!("{}?streams={}", WS_BASE, legs.join("/"))
    }

    /// Reconnect loop. Runs until stop or until the attempt budget is
    /// spent, after which streaming stays off for the rest of the run.
    pub async fn run(self: Arc<Self>) {
        let mut attempt = 0u32;
        info!(symbols = self.symbols.len(), "crypto stream starting");
        while !self.stop.triggered() {
            let result = self.connect_and_pump().await;
            if !self.next_attempt(&mut attempt, result).await {
                break;
            }
        }
        info!("crypto stream stopped");
    }

    /// Fold one session result into the reconnect budget. Returns false
    /// when the loop should end: stop requested, or the attempt budget
    /// spent, which marks the manager disabled for the rest of the run.
    async fn next_attempt(&self, attempt: &mut u32, result: StreamResult<u64>) -> bool {
        match result {
            Ok(handled) if handled > 0 => {
                // A session that made progress resets the budget.
                *attempt = 0;
                debug!(handled, "crypto stream session ended");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "crypto stream session failed"),
        }
        if self.stop.triggered() {
            return false;
        }
        match self.backoff.delay(*attempt) {
            Some(delay) => {
                *attempt += 1;
                debug!(attempt = *attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
                self.stop.sleep(delay).await
            }
            None => {
                self.disabled.store(true, Ordering::SeqCst);
                error!("crypto stream reconnect budget spent, streaming disabled");
                false
            }
        }
    }

    async fn connect_and_pump(&self) -> StreamResult<u64> {
        let url = self.stream_url();
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;
        let (mut write, mut read) = ws.split();
        info!("crypto stream connected");

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
                        if let Some((symbol, timeframe, candle)) = parse_kline(&text) {
                            self.cache.update(&symbol, timeframe, candle);
                            handled += 1;
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

/// Parse one combined-stream kline frame into a cache update. Returns the
/// canonical symbol, never the venue spelling.
fn parse_kline(text: &str) -> Option<(String, Timeframe, Candle)> {
    let value: Value = serde_json::from_str(text).ok()?;
    let kline = value.get("data")?.get("k")?;

    let venue_symbol = kline.get("s")?.as_str()?;
    let symbol = venue_symbol.trim_start_matches("1000").to_string();
    let timeframe = Timeframe::from_venue_str(kline.get("i")?.as_str()?)?;

    let open_time = DateTime::from_timestamp_millis(kline.get("t")?.as_i64()?)?;
    let price = |key: &str| {
        kline
            .get(key)
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<f64>().ok())
    };
    let closed = kline.get("x")?.as_bool()?;

    Some((
        symbol,
        timeframe,
        Candle::new(
            open_time,
            price("o")?,
            price("h")?,
            price("l")?,
            price("c")?,
            price("v")?,
            closed,
        ),
    ))
}
