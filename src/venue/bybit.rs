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

//! Bybit v5 linear-perpetual adapter.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::candle::{Candle, CandleSeries, Timeframe};
use crate::config::{Credentials, VenueId};
use crate::venue::{
    build_http_client, transport_error, BalanceState, OrderKind, OrderRequest, OrderResult,
    PositionSide, PositionState, VenueAdapter, VenueError, VenueResult,
};

const BASE_URL: &str = "https://api.bybit.com";
const RECV_WINDOW: &str = "5000";
const CATEGORY: &str = "linear";

/// Upper bound on the learned failed-symbol set.
const FAILED_CACHE_CAP: usize = 64;

type HmacSha256 = Hmac<Sha256>;

/// Bybit v5 venue adapter.
pub struct BybitAdapter {
    credentials: Credentials,
    http: reqwest::Client,
    connected: AtomicBool,
    /// Hedge-mode flag detected at connect time and cached.
    hedge_mode: RwLock<Option<bool>>,
    /// Symbols this venue has rejected as unknown. Bounded, instance-owned,
    /// so two adapters never share learned failures; operators can clear it
    /// with [`BybitAdapter::clear_failed_cache`].
    failed_symbols: Mutex<HashSet<String>>,
}

impl BybitAdapter {
    pub fn new(credentials: Credentials) -> Self {
        let http = build_http_client(&credentials).unwrap_or_default();
        Self {
            credentials,
            http,
            connected: AtomicBool::new(false),
            hedge_mode: RwLock::new(None),
            failed_symbols: Mutex::new(HashSet::new()),
        }
    }

    /// Bybit interval strings ("1", "5", "60", "D").
    pub fn interval_str(timeframe: Timeframe) -> &'static str {
        match timeframe {
            Timeframe::M1 => "1",
            Timeframe::M5 => "5",
            Timeframe::M15 => "15",
            Timeframe::H1 => "60",
            Timeframe::H4 => "240",
            Timeframe::D1 => "D",
        }
    }

    /// Bybit wire value for the trigger direction: 1 fires when the mark
    /// price rises through the trigger, 2 when it falls through.
    pub fn trigger_direction_code(kind: OrderKind, closes: PositionSide) -> VenueResult<u8> {
        use crate::venue::{trigger_direction, TriggerDirection};
        match trigger_direction(kind, closes) {
            Some(TriggerDirection::RisesThrough) => Ok(1),
            Some(TriggerDirection::FallsThrough) => Ok(2),
            None => Err(VenueError::TriggerAlreadyMet(format!(
                "{:?} is not a conditional order kind",
                kind
            ))),
        }
    }

    /// Drop all learned failed symbols.
    pub fn clear_failed_cache(&self) {
        self.failed_symbols.lock().clear();
    }

    fn remember_failed(&self, symbol: &str) {
        let mut failed = self.failed_symbols.lock();
        if failed.len() >= FAILED_CACHE_CAP {
            // Cheapest possible bound; precision does not matter here.
            failed.clear();
        }
        failed.insert(symbol.to_string());
        warn!(venue = "bybit", symbol, "symbol added to failed cache");
    }

    fn is_known_failed(&self, symbol: &str) -> bool {
        self.failed_symbols.lock().contains(symbol)
    }

    fn sign(&self, timestamp: &str, payload: &str) -> String {
        let material = format!(
            "{}{}{}{}",
            timestamp, self.credentials.api_key, RECV_WINDOW, payload
        );
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(material.as_bytes());
        mac.finalize()
            .into_bytes()
            .iter()
            .fold(String::with_capacity(64), |mut acc, b| {
                use std::fmt::Write;
                let _ = write!(acc, "{:02x}", b);
                acc
            })
    }

    async fn get(&self, path: &str, query: &str, signed: bool) -> VenueResult<Value> {
        let url = if query.is_empty() {
            format!("{}{}", BASE_URL, path)
        } else {
            format!("{}{}?{}", BASE_URL, path, query)
        };
        let mut req = self.http.get(&url);
        if signed {
            let timestamp = Utc::now().timestamp_millis().to_string();
            let signature = self.sign(&timestamp, query);
            req = req
                .header("X-BAPI-API-KEY", &self.credentials.api_key)
                .header("X-BAPI-TIMESTAMP", timestamp)
                .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
                .header("X-BAPI-SIGN", signature);
        }
        let response = req.send().await.map_err(transport_error)?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| VenueError::VenueUnavailable(format!("bad response body: {}", e)))?;
        Self::check_ret_code(body)
    }

    async fn post(&self, path: &str, body: Value) -> VenueResult<Value> {
        let payload = body.to_string();
        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature = self.sign(&timestamp, &payload);
        let response = self
            .http
            .post(format!("{}{}", BASE_URL, path))
            .header("X-BAPI-API-KEY", &self.credentials.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", signature)
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await
            .map_err(transport_error)?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| VenueError::VenueUnavailable(format!("bad response body: {}", e)))?;
        Self::check_ret_code(body)
    }

    /// Bybit wraps everything in retCode/retMsg; normalize here.
    fn check_ret_code(body: Value) -> VenueResult<Value> {
        let code = body.get("retCode").and_then(Value::as_i64).unwrap_or(-1);
        if code == 0 {
            return Ok(body.get("result").cloned().unwrap_or(Value::Null));
        }
        let msg = body
            .get("retMsg")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        Err(Self::map_ret_code(code, msg))
    }

    fn map_ret_code(code: i64, msg: String) -> VenueError {
        match code {
            10003 | 10004 | 10005 | 33004 => VenueError::CredentialsInvalid(msg),
            10006 | 10018 => VenueError::RateLimited(msg),
            110007 | 110045 | 110052 => VenueError::InsufficientMargin(msg),
            110094 | 170136 => VenueError::MinNotionalViolation(msg),
            10029 | 110029 => VenueError::InvalidSymbol(msg),
            110092 | 110093 => VenueError::TriggerAlreadyMet(msg),
            110001 | 170213 => VenueError::UnknownOrder(msg),
            _ if msg.to_ascii_lowercase().contains("symbol") => VenueError::InvalidSymbol(msg),
            _ => VenueError::VenueUnavailable(format!("retCode {}: {}", code, msg)),
        }
    }

    fn is_hedge_mode(&self) -> bool {
        self.hedge_mode.read().unwrap_or(false)
    }

    fn parse_kline_row(row: &Value, timeframe: Timeframe) -> Option<Candle> {
        let arr = row.as_array()?;
        let start_ms: i64 = arr.first()?.as_str()?.parse().ok()?;
        let open_time = chrono::DateTime::from_timestamp_millis(start_ms)?;
        let parse = |i: usize| arr.get(i)?.as_str()?.parse::<f64>().ok();
        let closed =
            start_ms + timeframe.seconds() * 1000 <= Utc::now().timestamp_millis();
        Some(Candle::new(
            open_time,
            parse(1)?,
            parse(2)?,
            parse(3)?,
            parse(4)?,
            parse(5)?,
            closed,
        ))
    }
}

#[async_trait]
impl VenueAdapter for BybitAdapter {
    fn venue(&self) -> VenueId {
        VenueId::Bybit
    }

    async fn initialize(&self) -> VenueResult<()> {
        // Position mode probe: any open position with a non-zero positionIdx
        // means the account runs hedge mode. Empty accounts default to
        // one-way, which matches the venue default.
        let query = format!("category={}&settleCoin=USDT", CATEGORY);
        let result = self.get("/v5/position/list", &query, true).await?;
        let hedge = result
            .get("list")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter().any(|r| {
                    r.get("positionIdx").and_then(Value::as_i64).unwrap_or(0) != 0
                })
            })
            .unwrap_or(false);
        *self.hedge_mode.write() = Some(hedge);
        self.connected.store(true, Ordering::SeqCst);
        info!(venue = "bybit", hedge_mode = hedge, "adapter connected");
        Ok(())
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> VenueResult<CandleSeries> {
        if self.is_known_failed(symbol) {
            debug!(venue = "bybit", symbol, "skipping symbol in failed cache");
            return Ok(CandleSeries::new(limit.max(1)));
        }
        let query = format!(
            "category={}&symbol={}&interval={}&limit={}",
            CATEGORY,
            symbol,
            Self::interval_str(timeframe),
            limit
        );
        let result = match self.get("/v5/market/kline", &query, false).await {
            Ok(result) => result,
            Err(VenueError::InvalidSymbol(msg)) => {
                self.remember_failed(symbol);
                return Err(VenueError::InvalidSymbol(msg));
            }
            Err(err) => return Err(err),
        };
        let rows = result
            .get("list")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if rows.is_empty() {
            warn!(venue = "bybit", symbol, "empty kline response");
            return Ok(CandleSeries::new(limit.max(1)));
        }
        // Bybit returns newest first.
        let candles: Vec<Candle> = rows
            .iter()
            .rev()
            .filter_map(|row| Self::parse_kline_row(row, timeframe))
            .collect();
        Ok(CandleSeries::from_candles(limit.max(candles.len()), candles))
    }

    async fn balance(&self) -> VenueResult<BalanceState> {
        let result = self
            .get("/v5/account/wallet-balance", "accountType=UNIFIED", true)
            .await?;
        let account = result
            .get("list")
            .and_then(Value::as_array)
            .and_then(|l| l.first())
            .cloned()
            .unwrap_or(Value::Null);
        let parse = |v: &Value, name: &str| {
            v.get(name)
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0)
        };
        let total = parse(&account, "totalEquity");
        let available = parse(&account, "totalAvailableBalance");
        Ok(BalanceState::new(total, available, "USDT"))
    }

    async fn place_order(&self, request: &OrderRequest) -> VenueResult<OrderResult> {
        request.validate()?;
        if self.is_known_failed(&request.symbol) {
            return Ok(OrderResult::rejected(VenueError::InvalidSymbol(format!(
                "{} previously rejected by venue",
                request.symbol
            ))));
        }

        let mut body = json!({
            "category": CATEGORY,
            "symbol": request.symbol,
            "side": match request.side {
                crate::venue::Side::Buy => "Buy",
                crate::venue::Side::Sell => "Sell",
            },
            "qty": request.quantity.to_string(),
        });
        let obj = body.as_object_mut().expect("literal object");

        match request.kind {
            OrderKind::Market => {
                obj.insert("orderType".into(), json!("Market"));
            }
            OrderKind::Limit => {
                let price = request.price.ok_or_else(|| {
                    VenueError::MinNotionalViolation("limit order without price".into())
                })?;
                obj.insert("orderType".into(), json!("Limit"));
                obj.insert("price".into(), json!(price.to_string()));
            }
            kind => {
                let closes = request.closes.ok_or_else(|| {
                    VenueError::TriggerAlreadyMet("conditional order without position side".into())
                })?;
                let direction = Self::trigger_direction_code(kind, closes)?;
                let trigger = request.trigger_price.unwrap_or_default();
                obj.insert("orderType".into(), json!("Market"));
                obj.insert("triggerPrice".into(), json!(trigger.to_string()));
                obj.insert("triggerDirection".into(), json!(direction));
            }
        }

        if self.is_hedge_mode() {
            let idx = match request.closes {
                Some(PositionSide::Short) => 2,
                _ => 1,
            };
            obj.insert("positionIdx".into(), json!(idx));
        } else {
            obj.insert("positionIdx".into(), json!(0));
            if request.reduce_only {
                obj.insert("reduceOnly".into(), json!(true));
            }
        }

        if let Some(client_id) = &request.client_id {
            obj.insert("orderLinkId".into(), json!(client_id));
        }

        match self.post("/v5/order/create", body).await {
            Ok(result) => {
                let order_id = result
                    .get("orderId")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                debug!(venue = "bybit", symbol = %request.symbol, order_id, "order accepted");
                Ok(OrderResult::accepted(order_id, None))
            }
            Err(VenueError::InvalidSymbol(msg)) => {
                self.remember_failed(&request.symbol);
                Ok(OrderResult::rejected(VenueError::InvalidSymbol(msg)))
            }
            Err(err) if !err.is_transient() && !matches!(err, VenueError::CredentialsInvalid(_)) => {
                Ok(OrderResult::rejected(err))
            }
            Err(err) => Err(err),
        }
    }

    async fn cancel_orders(&self, symbol: &str) -> VenueResult<()> {
        let body = json!({ "category": CATEGORY, "symbol": symbol });
        match self.post("/v5/order/cancel-all", body).await {
            Ok(_) => Ok(()),
            Err(VenueError::UnknownOrder(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn positions(&self) -> VenueResult<Vec<PositionState>> {
        let query = format!("category={}&settleCoin=USDT", CATEGORY);
        let result = self.get("/v5/position/list", &query, true).await?;
        let rows = result
            .get("list")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut positions = Vec::new();
        for row in rows {
            let parse = |name: &str| {
                row.get(name)
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(0.0)
            };
            let size = parse("size");
            if size == 0.0 {
                continue;
            }
            let side = match row.get("side").and_then(Value::as_str) {
                Some("Buy") => PositionSide::Long,
                _ => PositionSide::Short,
            };
            positions.push(PositionState {
                symbol: row
                    .get("symbol")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                side,
                quantity: size,
                entry_price: parse("avgPrice"),
                unrealized_pnl: parse("unrealisedPnl"),
                leverage: parse("leverage").max(1.0),
            });
        }
        Ok(positions)
    }

    async fn close_position(&self, symbol: &str) -> VenueResult<OrderResult> {
        let positions = self.positions().await?;
        let Some(position) = positions.iter().find(|p| p.symbol == symbol) else {
            return Ok(OrderResult::accepted(String::new(), None));
        };
        let mut request = OrderRequest::market(
            symbol,
            position.side.closing_side(),
            position.quantity,
        );
        request.reduce_only = true;
        request.closes = Some(position.side);
        self.place_order(&request).await
    }

    fn supports_cancel_all(&self) -> bool {
        true
    }

    async fn close(&self) -> VenueResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_direction_table() {
        // Documented venue table: 1 = rises through, 2 = falls through.
        let cases = [
            (OrderKind::StopLoss, PositionSide::Long, 2u8),
            (OrderKind::TakeProfit, PositionSide::Long, 1u8),
            (OrderKind::StopLoss, PositionSide::Short, 1u8),
            (OrderKind::TakeProfit, PositionSide::Short, 2u8),
        ];
        for (kind, closes, expected) in cases {
            assert_eq!(
                BybitAdapter::trigger_direction_code(kind, closes).unwrap(),
                expected,
                "{:?}/{:?}",
                kind,
                closes
            );
        }
        assert!(BybitAdapter::trigger_direction_code(OrderKind::Limit, PositionSide::Long).is_err());
    }

    #[test]
    fn interval_mapping() {
        assert_eq!(BybitAdapter::interval_str(Timeframe::M1), "1");
        assert_eq!(BybitAdapter::interval_str(Timeframe::H1), "60");
        assert_eq!(BybitAdapter::interval_str(Timeframe::D1), "D");
    }

    #[test]
    fn ret_code_mapping() {
        assert!(matches!(
            BybitAdapter::map_ret_code(10006, "too many visits".into()),
            VenueError::RateLimited(_)
        ));
        assert!(matches!(
            BybitAdapter::map_ret_code(110007, "ab not enough".into()),
            VenueError::InsufficientMargin(_)
        ));
        assert!(matches!(
            BybitAdapter::map_ret_code(110001, "order not exists".into()),
            VenueError::UnknownOrder(_)
        ));
        assert!(matches!(
            BybitAdapter::map_ret_code(99999, "Symbol not supported".into()),
            VenueError::InvalidSymbol(_)
        ));
    }

    #[test]
    fn failed_cache_learns_and_clears() {
        let adapter = BybitAdapter::new(Credentials::default());
        assert!(!adapter.is_known_failed("FAKEUSDT"));
        adapter.remember_failed("FAKEUSDT");
        assert!(adapter.is_known_failed("FAKEUSDT"));

        adapter.clear_failed_cache();
        assert!(!adapter.is_known_failed("FAKEUSDT"));
    }

    #[test]
    fn failed_cache_is_bounded() {
        let adapter = BybitAdapter::new(Credentials::default());
        for i in 0..(FAILED_CACHE_CAP * 2) {
            adapter.remember_failed(&format!("SYM{}USDT", i));
        }
        assert!(adapter.failed_symbols.lock().len() <= FAILED_CACHE_CAP);
    }

    #[test]
    fn kline_row_parsing_newest_first_order() {
        let row = serde_json::json!([
            "1700000000000", "100.0", "101.0", "99.0", "100.5", "500.0", "50000.0"
        ]);
        let candle = BybitAdapter::parse_kline_row(&row, Timeframe::M5).unwrap();
        assert_eq!(candle.close, 100.5);
        assert!(candle.closed);
    }
}
