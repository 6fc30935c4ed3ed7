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

//! Stream manager plumbing shared by the crypto and broker feeds.
//!
//! Each manager owns one WebSocket connection and is the sole writer for
//! its cache entries. Reconnects use exponential backoff with a bounded
//! attempt count; once exhausted, streaming stays disabled for the rest of
//! the run and the market data service falls back to REST.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;

pub mod broker;
pub mod crypto;

pub use broker::BrokerStreamManager;
pub use crypto::CryptoStreamManager;

/// Stream error types.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("websocket connect failed: {0}")]
    Connect(String),

    #[error("websocket closed: {0}")]
    Closed(String),

    #[error("unparseable stream payload: {0}")]
    Payload(String),

    #[error("reconnect attempts exhausted, streaming disabled")]
    Disabled,
}

/// Result type for stream operations.
pub type StreamResult<T> = Result<T, StreamError>;

/// Reconnect backoff tuning.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// First retry delay; doubles per attempt
    pub base: Duration,
    /// Upper bound on any single delay
    pub cap: Duration,
    /// Attempts before streaming is permanently disabled
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (zero-based), or `None` once the
    /// attempt budget is spent.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt);
        Some(self.base.saturating_mul(factor).min(self.cap))
    }
}

/// Cooperative stop signal shared between the engine and its stream tasks.
///
/// Backoff sleeps select against the notify so a stop lands promptly even
/// mid-wait.
#[derive(Clone)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Request stop. Idempotent; wakes every waiter.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once stop is requested.
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before the flag check so a concurrent trigger cannot
        // slip between the two.
        notified.as_mut().enable();
        if self.triggered() {
            return;
        }
        notified.await;
    }

    /// Sleep that a stop interrupts. Returns false when interrupted.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.triggered() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.notify.notified() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(8),
            max_attempts: 6,
        };
        assert_eq!(policy.delay(0), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay(1), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay(2), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay(3), Some(Duration::from_secs(8)));
        // Capped from here on.
        assert_eq!(policy.delay(4), Some(Duration::from_secs(8)));
        assert_eq!(policy.delay(5), Some(Duration::from_secs(8)));
        // Budget spent.
        assert_eq!(policy.delay(6), None);
    }

    #[tokio::test]
    async fn stop_interrupts_backoff_sleep() {
        let signal = StopSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.sleep(Duration::from_secs(30)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.trigger();
        let completed = handle.await.unwrap();
        assert!(!completed);
        assert!(signal.triggered());
    }

    #[tokio::test]
    async fn triggered_signal_never_sleeps() {
        let signal = StopSignal::new();
        signal.trigger();
        assert!(!signal.sleep(Duration::from_secs(30)).await);
    }
}
