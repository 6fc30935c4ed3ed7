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

//! Binance USD-M futures adapter.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::candle::{Candle, CandleSeries, Timeframe};
use crate::config::{Credentials, VenueId};
use crate::venue::{
    build_http_client, transport_error, BalanceState, OrderKind, OrderRequest, OrderResult,
    PositionSide, PositionState, Side, SymbolMetadata, VenueAdapter, VenueError, VenueResult,
};

const BASE_URL: &str = "https://fapi.binance.com";
const RECV_WINDOW: u64 = 5000;

/// Tokens Binance futures lists with a 1000x multiplier prefix.
const PREFIXED_TOKENS: &[&str] = &["PEPE", "SHIB", "BONK", "FLOKI", "LUNC", "XEC"];

type HmacSha256 = Hmac<Sha256>;

/// Binance USD-M futures venue adapter.
pub struct BinanceAdapter {
    credentials: Credentials,
    http: reqwest::Client,
    connected: AtomicBool,
    /// Hedge-mode flag detected once at connect time and cached for the
    /// adapter's lifetime. An operator flipping the account setting mid-run
    /// requires a fresh `initialize` to be picked up.
    dual_side: RwLock<Option<bool>>,
}

impl BinanceAdapter {
    pub fn new(credentials: Credentials) -> Self {
        let http = build_http_client(&credentials).unwrap_or_default();
        Self {
            credentials,
            http,
            connected: AtomicBool::new(false),
            dual_side: RwLock::new(None),
        }
    }

    /// Canonical symbol to Binance spelling: large-supply tokens carry a
    /// "1000" prefix on the futures market.
    pub fn venue_symbol(symbol: &str) -> String {
        for token in PREFIXED_TOKENS {
            if let Some(quote) = symbol.strip_prefix(token) {
                if quote.starts_with("USD") {
                    return format!("1000{}", symbol);
                }
            }
        }
        symbol.to_string()
    }

    /// Conditional order type string. Binance encodes the trigger direction
    /// in the order type itself: a protective stop is STOP_MARKET and a
    /// profit target is TAKE_PROFIT_MARKET, for either closing side.
    pub fn conditional_order_type(kind: OrderKind, closes: PositionSide) -> VenueResult<&'static str> {
        match (kind, closes) {
            (OrderKind::StopLoss, PositionSide::Long) => Ok("STOP_MARKET"),
            (OrderKind::StopLoss, PositionSide::Short) => Ok("STOP_MARKET"),
            (OrderKind::TakeProfit, PositionSide::Long) => Ok("TAKE_PROFIT_MARKET"),
            (OrderKind::TakeProfit, PositionSide::Short) => Ok("TAKE_PROFIT_MARKET"),
            (OrderKind::TrailingStop, _) => Ok("TRAILING_STOP_MARKET"),
            (kind, _) => Err(VenueError::TriggerAlreadyMet(format!(
                "{:?} is not a conditional order kind",
                kind
            ))),
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(query.as_bytes());
        mac.finalize()
            .into_bytes()
            .iter()
            .fold(String::with_capacity(64), |mut acc, b| {
                use std::fmt::Write;
                let _ = write!(acc, "{:02x}", b);
                acc
            })
    }

    fn signed_query(&self, mut params: Vec<(String, String)>) -> String {
        params.push(("timestamp".into(), Utc::now().timestamp_millis().to_string()));
        params.push(("recvWindow".into(), RECV_WINDOW.to_string()));
        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query);
        format!("{}&signature={}", query, signature)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: Vec<(String, String)>,
        signed: bool,
    ) -> VenueResult<Value> {
        let query = if signed {
            self.signed_query(params)
        } else {
            params
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("&")
        };
        let url = format!("{}{}?{}", BASE_URL, path, query);
        let mut req = self.http.request(method, &url);
        if signed {
            req = req.header("X-MBX-APIKEY", &self.credentials.api_key);
        }
        let response = req.send().await.map_err(transport_error)?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| VenueError::VenueUnavailable(format!("bad response body: {}", e)))?;

        if status.is_success() {
            return Ok(body);
        }
        Err(Self::map_error(status.as_u16(), &body))
    }

    /// Map a Binance error payload into the shared taxonomy. No caller
    /// above this point sees venue error codes.
    fn map_error(http_status: u16, body: &Value) -> VenueError {
        let code = body.get("code").and_then(Value::as_i64).unwrap_or(0);
        let msg = body
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        match (http_status, code) {
            (429, _) | (418, _) | (_, -1003) => VenueError::RateLimited(msg),
            (401, _) | (_, -2014) | (_, -2015) | (_, -1022) => VenueError::CredentialsInvalid(msg),
            (_, -1121) => VenueError::InvalidSymbol(msg),
            (_, -2019) => VenueError::InsufficientMargin(msg),
            (_, -4164) | (_, -1013) => VenueError::MinNotionalViolation(msg),
            (_, -2021) => VenueError::TriggerAlreadyMet(msg),
            (_, -2011) | (_, -2013) => VenueError::UnknownOrder(msg),
            _ => VenueError::VenueUnavailable(format!("code {}: {}", code, msg)),
        }
    }

    fn is_hedge_mode(&self) -> bool {
        self.dual_side.read().unwrap_or(false)
    }

    fn parse_kline_row(row: &Value) -> Option<Candle> {
        let arr = row.as_array()?;
        let open_time = chrono::DateTime::from_timestamp_millis(arr.first()?.as_i64()?)?;
        let close_time_ms = arr.get(6)?.as_i64()?;
        let parse = |i: usize| arr.get(i)?.as_str()?.parse::<f64>().ok();
        Some(Candle::new(
            open_time,
            parse(1)?,
            parse(2)?,
            parse(3)?,
            parse(4)?,
            parse(5)?,
            close_time_ms <= Utc::now().timestamp_millis(),
        ))
    }
}

#[async_trait]
impl VenueAdapter for BinanceAdapter {
    fn venue(&self) -> VenueId {
        VenueId::Binance
    }

    async fn initialize(&self) -> VenueResult<()> {
        // Probe the account position mode once. One-way accounts must never
        // receive a positionSide parameter on orders.
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/positionSide/dual", vec![], true)
            .await?;
        let dual = body
            .get("dualSidePosition")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        *self.dual_side.write() = Some(dual);
        self.connected.store(true, Ordering::SeqCst);
        info!(venue = "binance", hedge_mode = dual, "adapter connected");
        Ok(())
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> VenueResult<CandleSeries> {
        let params = vec![
            ("symbol".into(), Self::venue_symbol(symbol)),
            ("interval".into(), timeframe.as_venue_str().into()),
            ("limit".into(), limit.to_string()),
        ];
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/klines", params, false)
            .await?;
        let rows = body.as_array().cloned().unwrap_or_default();
        if rows.is_empty() {
            warn!(venue = "binance", symbol, "empty kline response");
            return Ok(CandleSeries::new(limit.max(1)));
        }
        let candles: Vec<Candle> = rows.iter().filter_map(Self::parse_kline_row).collect();
        Ok(CandleSeries::from_candles(limit.max(candles.len()), candles))
    }

    async fn balance(&self) -> VenueResult<BalanceState> {
        let body = self
            .request(reqwest::Method::GET, "/fapi/v2/balance", vec![], true)
            .await?;
        let entries = body.as_array().cloned().unwrap_or_default();
        for entry in entries {
            if entry.get("asset").and_then(Value::as_str) == Some("USDT") {
                let total = entry
                    .get("balance")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0);
                let available = entry
                    .get("availableBalance")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0);
                return Ok(BalanceState::new(total, available, "USDT"));
            }
        }
        Ok(BalanceState::new(0.0, 0.0, "USDT"))
    }

    async fn place_order(&self, request: &OrderRequest) -> VenueResult<OrderResult> {
        request.validate()?;
        let mut params: Vec<(String, String)> = vec![
            ("symbol".into(), Self::venue_symbol(&request.symbol)),
            ("side".into(), request.side.as_str().into()),
            ("quantity".into(), request.quantity.to_string()),
        ];

        match request.kind {
            OrderKind::Market => params.push(("type".into(), "MARKET".into())),
            OrderKind::Limit => {
                let price = request.price.ok_or_else(|| {
                    VenueError::MinNotionalViolation("limit order without price".into())
                })?;
                params.push(("type".into(), "LIMIT".into()));
                params.push(("price".into(), price.to_string()));
                params.push(("timeInForce".into(), "GTC".into()));
            }
            kind => {
                let closes = request.closes.ok_or_else(|| {
                    VenueError::TriggerAlreadyMet("conditional order without position side".into())
                })?;
                let order_type = Self::conditional_order_type(kind, closes)?;
                params.push(("type".into(), order_type.into()));
                if let Some(trigger) = request.trigger_price {
                    params.push(("stopPrice".into(), trigger.to_string()));
                }
            }
        }

        if self.is_hedge_mode() {
            // Hedge accounts address one leg explicitly; reduceOnly is
            // implied by the leg and rejected if sent.
            let position_side = match request.closes {
                Some(PositionSide::Long) => "LONG",
                Some(PositionSide::Short) => "SHORT",
                None => match request.side {
                    Side::Buy => "LONG",
                    Side::Sell => "SHORT",
                },
            };
            params.push(("positionSide".into(), position_side.into()));
        } else if request.reduce_only {
            params.push(("reduceOnly".into(), "true".into()));
        }

        if let Some(client_id) = &request.client_id {
            params.push(("newClientOrderId".into(), client_id.clone()));
        }

        match self
            .request(reqwest::Method::POST, "/fapi/v1/order", params, true)
            .await
        {
            Ok(body) => {
                let order_id = body
                    .get("orderId")
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                let avg_price = body
                    .get("avgPrice")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<f64>().ok())
                    .filter(|p| *p > 0.0);
                debug!(venue = "binance", symbol = %request.symbol, order_id, "order accepted");
                Ok(OrderResult::accepted(order_id, avg_price))
            }
            // Expected trading rejections become structured results; only
            // transport and auth problems propagate as errors.
            Err(err) if !err.is_transient() && !matches!(err, VenueError::CredentialsInvalid(_)) => {
                Ok(OrderResult::rejected(err))
            }
            Err(err) => Err(err),
        }
    }

    async fn cancel_orders(&self, symbol: &str) -> VenueResult<()> {
        let params = vec![("symbol".into(), Self::venue_symbol(symbol))];
        match self
            .request(reqwest::Method::DELETE, "/fapi/v1/allOpenOrders", params, true)
            .await
        {
            Ok(_) => Ok(()),
            // The desired end state (no open orders) already holds.
            Err(VenueError::UnknownOrder(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn positions(&self) -> VenueResult<Vec<PositionState>> {
        let body = self
            .request(reqwest::Method::GET, "/fapi/v2/positionRisk", vec![], true)
            .await?;
        let rows = body.as_array().cloned().unwrap_or_default();
        let mut positions = Vec::new();
        for row in rows {
            let amt: f64 = row
                .get("positionAmt")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            if amt == 0.0 {
                continue;
            }
            let field = |name: &str| {
                row.get(name)
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(0.0)
            };
            positions.push(PositionState {
                symbol: row
                    .get("symbol")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .trim_start_matches("1000")
                    .to_string(),
                side: if amt > 0.0 { PositionSide::Long } else { PositionSide::Short },
                quantity: amt.abs(),
                entry_price: field("entryPrice"),
                unrealized_pnl: field("unRealizedProfit"),
                leverage: field("leverage").max(1.0),
            });
        }
        Ok(positions)
    }

    async fn close_position(&self, symbol: &str) -> VenueResult<OrderResult> {
        let positions = self.positions().await?;
        let Some(position) = positions.iter().find(|p| p.symbol == symbol) else {
            // Already flat; normalize to success.
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

    async fn symbol_metadata(&self, symbol: &str) -> VenueResult<Option<SymbolMetadata>> {
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/exchangeInfo", vec![], false)
            .await?;
        let venue_symbol = Self::venue_symbol(symbol);
        let symbols = body
            .get("symbols")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for entry in symbols {
            if entry.get("symbol").and_then(Value::as_str) != Some(venue_symbol.as_str()) {
                continue;
            }
            let mut meta = SymbolMetadata { min_qty: 0.0, qty_step: 0.0, min_notional: 0.0 };
            for filter in entry.get("filters").and_then(Value::as_array).into_iter().flatten() {
                let num = |name: &str| {
                    filter
                        .get(name)
                        .and_then(Value::as_str)
                        .and_then(|s| s.parse::<f64>().ok())
                        .unwrap_or(0.0)
                };
                match filter.get("filterType").and_then(Value::as_str) {
                    Some("LOT_SIZE") => {
                        meta.min_qty = num("minQty");
                        meta.qty_step = num("stepSize");
                    }
                    Some("MIN_NOTIONAL") => meta.min_notional = num("notional"),
                    _ => {}
                }
            }
            return Ok(Some(meta));
        }
        Ok(None)
    }

    fn supports_cancel_all(&self) -> bool {
        true
    }

    fn supports_trailing_stop(&self) -> bool {
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
    use crate::venue::{trigger_direction, TriggerDirection};

    #[test]
    fn symbol_prefixing() {
        assert_eq!(BinanceAdapter::venue_symbol("PEPEUSDT"), "1000PEPEUSDT");
        assert_eq!(BinanceAdapter::venue_symbol("SHIBUSDT"), "1000SHIBUSDT");
        assert_eq!(BinanceAdapter::venue_symbol("BTCUSDT"), "BTCUSDT");
        // Prefix applies only to the USD-quoted contract.
        assert_eq!(BinanceAdapter::venue_symbol("PEPEBTC"), "PEPEBTC");
    }

    #[test]
    fn conditional_order_type_table() {
        // Documented venue table for all four (kind, closing side) combos.
        let cases = [
            (OrderKind::StopLoss, PositionSide::Long, "STOP_MARKET"),
            (OrderKind::StopLoss, PositionSide::Short, "STOP_MARKET"),
            (OrderKind::TakeProfit, PositionSide::Long, "TAKE_PROFIT_MARKET"),
            (OrderKind::TakeProfit, PositionSide::Short, "TAKE_PROFIT_MARKET"),
        ];
        for (kind, closes, expected) in cases {
            assert_eq!(
                BinanceAdapter::conditional_order_type(kind, closes).unwrap(),
                expected,
                "{:?}/{:?}",
                kind,
                closes
            );
            // Every mapped combination has a neutral trigger direction too.
            assert!(trigger_direction(kind, closes).is_some());
        }
        assert!(BinanceAdapter::conditional_order_type(OrderKind::Market, PositionSide::Long).is_err());
    }

    #[test]
    fn stop_loss_on_long_fires_falling() {
        // The neutral table backs the type mapping: STOP_MARKET sell on a
        // long must fire as price falls through the trigger.
        assert_eq!(
            trigger_direction(OrderKind::StopLoss, PositionSide::Long),
            Some(TriggerDirection::FallsThrough)
        );
    }

    #[test]
    fn error_code_mapping() {
        let body = serde_json::json!({"code": -2019, "msg": "Margin is insufficient."});
        assert!(matches!(
            BinanceAdapter::map_error(400, &body),
            VenueError::InsufficientMargin(_)
        ));

        let body = serde_json::json!({"code": -1121, "msg": "Invalid symbol."});
        assert!(matches!(
            BinanceAdapter::map_error(400, &body),
            VenueError::InvalidSymbol(_)
        ));

        let body = serde_json::json!({"code": -2011, "msg": "Unknown order sent."});
        assert!(matches!(
            BinanceAdapter::map_error(400, &body),
            VenueError::UnknownOrder(_)
        ));

        let body = serde_json::json!({"msg": "banned"});
        assert!(matches!(
            BinanceAdapter::map_error(429, &body),
            VenueError::RateLimited(_)
        ));

        let body = serde_json::json!({"code": -2021, "msg": "Order would immediately trigger."});
        assert!(matches!(
            BinanceAdapter::map_error(400, &body),
            VenueError::TriggerAlreadyMet(_)
        ));
    }

    #[test]
    fn kline_row_parsing() {
        let row = serde_json::json!([
            1700000000000i64,
            "100.0", "105.0", "99.0", "102.0", "1234.5",
            1700000299999i64,
            "0", 0, "0", "0", "0"
        ]);
        let candle = BinanceAdapter::parse_kline_row(&row).unwrap();
        assert_eq!(candle.open, 100.0);
        assert_eq!(candle.high, 105.0);
        assert_eq!(candle.close, 102.0);
        assert!(candle.closed);
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let adapter = BinanceAdapter::new(Credentials {
            api_key: "key".into(),
            api_secret: "secret".into(),
            ..Default::default()
        });
        let sig1 = adapter.sign("symbol=BTCUSDT&timestamp=1");
        let sig2 = adapter.sign("symbol=BTCUSDT&timestamp=1");
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64);
        assert!(sig1.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
