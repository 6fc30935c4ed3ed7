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

//! REST request budget.
//!
//! Three independent counters gate every REST candle fetch: a global minimum
//! spacing between any two calls, a per-symbol cool-down, and a rolling
//! one-hour budget. `try_acquire` never blocks; a denial tells the caller to
//! serve cached data this cycle, it is not an error.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// Limiter tuning. Values are operational knobs, not correctness bounds.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Minimum gap between any two REST calls
    pub min_spacing: Duration,
    /// Minimum gap between two REST calls for the same symbol
    pub symbol_cooldown: Duration,
    /// Maximum REST calls within any rolling hour
    pub hourly_budget: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            min_spacing: Duration::from_millis(250),
            symbol_cooldown: Duration::from_secs(20),
            hourly_budget: 1200,
        }
    }
}

/// Why an acquire attempt was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Global spacing window not yet elapsed
    GlobalSpacing,
    /// Symbol still cooling down from its last fetch
    SymbolCooldown,
    /// Rolling-hour budget exhausted
    HourlyBudget,
}

struct LimiterState {
    last_call: Option<Instant>,
    per_symbol: HashMap<String, Instant>,
    window: VecDeque<Instant>,
}

/// Non-blocking three-counter REST limiter.
pub struct RestRateLimiter {
    config: RateLimiterConfig,
    state: Mutex<LimiterState>,
}

impl RestRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LimiterState {
                last_call: None,
                per_symbol: HashMap::new(),
                window: VecDeque::new(),
            }),
        }
    }

    /// Try to reserve one REST call for `symbol`. On success all three
    /// counters are charged atomically; on denial nothing is charged.
    pub fn try_acquire(&self, symbol: &str) -> Result<(), DenyReason> {
        self.try_acquire_at(symbol, Instant::now())
    }

    fn try_acquire_at(&self, symbol: &str, now: Instant) -> Result<(), DenyReason> {
        let mut state = self.state.lock();

        // Expire window entries older than one hour before counting.
        while let Some(front) = state.window.front() {
            if now.duration_since(*front) >= Duration::from_secs(3600) {
                state.window.pop_front();
            } else {
                break;
            }
        }

        if let Some(last) = state.last_call {
            if now.duration_since(last) < self.config.min_spacing {
                return Err(DenyReason::GlobalSpacing);
            }
        }
        if let Some(last) = state.per_symbol.get(symbol) {
            if now.duration_since(*last) < self.config.symbol_cooldown {
                debug!(symbol, "rest fetch denied, symbol cooling down");
                return Err(DenyReason::SymbolCooldown);
            }
        }
        if state.window.len() >= self.config.hourly_budget {
            debug!(symbol, "rest fetch denied, hourly budget exhausted");
            return Err(DenyReason::HourlyBudget);
        }

        state.last_call = Some(now);
        state.per_symbol.insert(symbol.to_string(), now);
        state.window.push_back(now);
        Ok(())
    }

    /// Calls charged against the current rolling hour.
    pub fn hourly_used(&self) -> usize {
        let mut state = self.state.lock();
        let now = Instant::now();
        while let Some(front) = state.window.front() {
            if now.duration_since(*front) >= Duration::from_secs(3600) {
                state.window.pop_front();
            } else {
                break;
            }
        }
        state.window.len()
    }
}

/// Create the shared limiter with default tuning.
pub fn create_rate_limiter() -> Arc<RestRateLimiter> {
    Arc::new(RestRateLimiter::new(RateLimiterConfig::default()))
}
