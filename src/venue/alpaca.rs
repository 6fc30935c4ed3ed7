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

//! Alpaca stock-broker adapter.
//!
//! Equities only trade during the regular session; the calendar check lives
//! here so the market-data service can skip REST entirely while the market
//! is closed.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::candle::{Candle, CandleSeries, Timeframe};
use crate::config::{Credentials, VenueId};
use crate::venue::{
    build_http_client, transport_error, BalanceState, OrderKind, OrderRequest, OrderResult,
    PositionSide, PositionState, Side, VenueAdapter, VenueError, VenueResult,
};

const LIVE_URL: &str = "https://api.alpaca.markets";
const PAPER_URL: &str = "https://paper-api.alpaca.markets";
const DATA_URL: &str = "https://data.alpaca.markets";

/// Regular US equity session in UTC, ignoring DST shifts and holidays.
/// Outside-window errors from the venue come back as empty bar sets and are
/// handled as `NoData`.
const SESSION_OPEN_MINUTES: u32 = 14 * 60 + 30;
const SESSION_CLOSE_MINUTES: u32 = 21 * 60;

/// Alpaca broker venue adapter.
pub struct AlpacaAdapter {
    credentials: Credentials,
    http: reqwest::Client,
    connected: AtomicBool,
    base_url: String,
}

impl AlpacaAdapter {
    pub fn new(credentials: Credentials) -> Self {
        let http = build_http_client(&credentials).unwrap_or_default();
        let base_url = if credentials.paper { PAPER_URL } else { LIVE_URL }.to_string();
        Self {
            credentials,
            http,
            connected: AtomicBool::new(false),
            base_url,
        }
    }

    /// Whether the regular equity session is open at `now`.
    pub fn is_market_open(now: DateTime<Utc>) -> bool {
        let weekday = now.weekday().number_from_monday();
        if weekday > 5 {
            return false;
        }
        let minutes = now.hour() * 60 + now.minute();
        minutes >= SESSION_OPEN_MINUTES && minutes < SESSION_CLOSE_MINUTES
    }

    /// Broker bar timeframe strings.
    pub fn timeframe_str(timeframe: Timeframe) -> &'static str {
        match timeframe {
            Timeframe::M1 => "1Min",
            Timeframe::M5 => "5Min",
            Timeframe::M15 => "15Min",
            Timeframe::H1 => "1Hour",
            Timeframe::H4 => "4Hour",
            Timeframe::D1 => "1Day",
        }
    }

    /// Broker order type for a conditional order. The broker has no trigger
    /// direction flag; direction is implied by type and side: a protective
    /// stop is a `stop` order, a profit target is a `limit` order.
    pub fn conditional_order_type(kind: OrderKind, closes: PositionSide) -> VenueResult<&'static str> {
        match (kind, closes) {
            (OrderKind::StopLoss, PositionSide::Long) => Ok("stop"),
            (OrderKind::StopLoss, PositionSide::Short) => Ok("stop"),
            (OrderKind::TakeProfit, PositionSide::Long) => Ok("limit"),
            (OrderKind::TakeProfit, PositionSide::Short) => Ok("limit"),
            (OrderKind::TrailingStop, _) => Ok("trailing_stop"),
            (kind, _) => Err(VenueError::TriggerAlreadyMet(format!(
                "{:?} is not a conditional order kind",
                kind
            ))),
        }
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("APCA-API-KEY-ID", &self.credentials.api_key)
            .header("APCA-API-SECRET-KEY", &self.credentials.api_secret)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> VenueResult<Value> {
        let response = self.auth(req).send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if (200..300).contains(&status) {
            return Ok(body);
        }
        let msg = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        Err(Self::map_error(status, msg))
    }

    fn map_error(status: u16, msg: String) -> VenueError {
        let lower = msg.to_ascii_lowercase();
        match status {
            401 | 403 => VenueError::CredentialsInvalid(msg),
            429 => VenueError::RateLimited(msg),
            404 => {
                if lower.contains("asset") || lower.contains("symbol") {
                    VenueError::InvalidSymbol(msg)
                } else {
                    VenueError::UnknownOrder(msg)
                }
            }
            422 => {
                if lower.contains("buying power") || lower.contains("insufficient") {
                    VenueError::InsufficientMargin(msg)
                } else if lower.contains("asset") || lower.contains("symbol") {
                    VenueError::InvalidSymbol(msg)
                } else {
                    VenueError::MinNotionalViolation(msg)
                }
            }
            _ => VenueError::VenueUnavailable(format!("status {}: {}", status, msg)),
        }
    }

    fn parse_bar(bar: &Value, timeframe: Timeframe) -> Option<Candle> {
        let ts = bar.get("t")?.as_str()?;
        let open_time = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);
        let num = |name: &str| bar.get(name)?.as_f64();
        let closed = open_time + timeframe.duration() <= Utc::now();
        Some(Candle::new(
            open_time,
            num("o")?,
            num("h")?,
            num("l")?,
            num("c")?,
            num("v")?,
            closed,
        ))
    }
}

#[async_trait]
impl VenueAdapter for AlpacaAdapter {
    fn venue(&self) -> VenueId {
        VenueId::Alpaca
    }

    async fn initialize(&self) -> VenueResult<()> {
        let account = self
            .send(self.http.get(format!("{}/v2/account", self.base_url)))
            .await?;
        if account.get("trading_blocked").and_then(Value::as_bool) == Some(true) {
            return Err(VenueError::CredentialsInvalid(
                "account is blocked from trading".into(),
            ));
        }
        self.connected.store(true, Ordering::SeqCst);
        info!(venue = "alpaca", paper = self.credentials.paper, "adapter connected");
        Ok(())
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> VenueResult<CandleSeries> {
        let url = format!(
            "{}/v2/stocks/{}/bars?timeframe={}&limit={}",
            DATA_URL,
            symbol,
            Self::timeframe_str(timeframe),
            limit
        );
        let body = self.send(self.http.get(url)).await?;
        let bars = body
            .get("bars")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if bars.is_empty() {
            warn!(venue = "alpaca", symbol, "empty bar response");
            return Ok(CandleSeries::new(limit.max(1)));
        }
        let candles: Vec<Candle> = bars
            .iter()
            .filter_map(|b| Self::parse_bar(b, timeframe))
            .collect();
        Ok(CandleSeries::from_candles(limit.max(candles.len()), candles))
    }

    async fn balance(&self) -> VenueResult<BalanceState> {
        let account = self
            .send(self.http.get(format!("{}/v2/account", self.base_url)))
            .await?;
        let num = |name: &str| {
            account
                .get(name)
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0)
        };
        Ok(BalanceState::new(num("equity"), num("cash"), "USD"))
    }

    async fn place_order(&self, request: &OrderRequest) -> VenueResult<OrderResult> {
        request.validate()?;
        let mut body = json!({
            "symbol": request.symbol,
            "qty": request.quantity.to_string(),
            "side": match request.side {
                Side::Buy => "buy",
                Side::Sell => "sell",
            },
            "time_in_force": "day",
        });
        let obj = body.as_object_mut().expect("literal object");

        match request.kind {
            OrderKind::Market => {
                obj.insert("type".into(), json!("market"));
            }
            OrderKind::Limit => {
                let price = request.price.ok_or_else(|| {
                    VenueError::MinNotionalViolation("limit order without price".into())
                })?;
                obj.insert("type".into(), json!("limit"));
                obj.insert("limit_price".into(), json!(price.to_string()));
            }
            kind => {
                let closes = request.closes.ok_or_else(|| {
                    VenueError::TriggerAlreadyMet("conditional order without position side".into())
                })?;
                let order_type = Self::conditional_order_type(kind, closes)?;
                let trigger = request.trigger_price.unwrap_or_default();
                obj.insert("type".into(), json!(order_type));
                match order_type {
                    "stop" => {
                        obj.insert("stop_price".into(), json!(trigger.to_string()));
                    }
                    "limit" => {
                        obj.insert("limit_price".into(), json!(trigger.to_string()));
                    }
                    _ => {
                        obj.insert("trail_price".into(), json!(trigger.to_string()));
                    }
                }
            }
        }

        if let Some(client_id) = &request.client_id {
            obj.insert("client_order_id".into(), json!(client_id));
        }

        match self
            .send(self.http.post(format!("{}/v2/orders", self.base_url)).json(&body))
            .await
        {
            Ok(result) => {
                let order_id = result
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let filled = result
                    .get("filled_avg_price")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<f64>().ok());
                debug!(venue = "alpaca", symbol = %request.symbol, order_id, "order accepted");
                Ok(OrderResult::accepted(order_id, filled))
            }
            Err(err) if !err.is_transient() && !matches!(err, VenueError::CredentialsInvalid(_)) => {
                Ok(OrderResult::rejected(err))
            }
            Err(err) => Err(err),
        }
    }

    async fn cancel_orders(&self, symbol: &str) -> VenueResult<()> {
        // No single-call per-symbol cancel on this venue: list, then delete
        // each matching order.
        let orders = self
            .send(
                self.http
                    .get(format!("{}/v2/orders?status=open&symbols={}", self.base_url, symbol)),
            )
            .await?;
        for order in orders.as_array().into_iter().flatten() {
            let Some(id) = order.get("id").and_then(Value::as_str) else {
                continue;
            };
            match self
                .send(self.http.delete(format!("{}/v2/orders/{}", self.base_url, id)))
                .await
            {
                Ok(_) | Err(VenueError::UnknownOrder(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn positions(&self) -> VenueResult<Vec<PositionState>> {
        let rows = self
            .send(self.http.get(format!("{}/v2/positions", self.base_url)))
            .await?;
        let mut positions = Vec::new();
        for row in rows.as_array().into_iter().flatten() {
            let num = |name: &str| {
                row.get(name)
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(0.0)
            };
            let qty = num("qty");
            if qty == 0.0 {
                continue;
            }
            positions.push(PositionState {
                symbol: row
                    .get("symbol")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                side: if row.get("side").and_then(Value::as_str) == Some("short") {
                    PositionSide::Short
                } else {
                    PositionSide::Long
                },
                quantity: qty.abs(),
                entry_price: num("avg_entry_price"),
                unrealized_pnl: num("unrealized_pl"),
                leverage: 1.0,
            });
        }
        Ok(positions)
    }

    async fn close_position(&self, symbol: &str) -> VenueResult<OrderResult> {
        match self
            .send(self.http.delete(format!("{}/v2/positions/{}", self.base_url, symbol)))
            .await
        {
            Ok(result) => {
                let order_id = result
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(OrderResult::accepted(order_id, None))
            }
            // Already flat.
            Err(VenueError::UnknownOrder(_)) => Ok(OrderResult::accepted(String::new(), None)),
            Err(err) => Err(err),
        }
    }

    async fn close(&self) -> VenueResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
