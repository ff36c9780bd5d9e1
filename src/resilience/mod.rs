//! Circuit breakers around external calls
//!
//! One breaker per endpoint key, held in a [`BreakerRegistry`]. Only transient
//! failures (transport errors, timeouts) count against a breaker; a rejection
//! from a healthy service does not.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ResilienceConfig;
use crate::error::{Error, Result};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls flow normally
    Closed,
    /// Calls fail fast until `next_retry_at`
    Open,
    /// Probing whether the endpoint recovered
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Three-state breaker for one endpoint
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    key: String,
    failure_threshold: u32,
    success_threshold: u32,
    open_timeout: Duration,
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    next_retry_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: &ResilienceConfig) -> Self {
        Self {
            key: key.into(),
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            open_timeout: Duration::from_secs(config.open_timeout_secs),
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            next_retry_at: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Admit a call at `now`; an open breaker past its timeout goes half-open
    pub fn try_acquire(&mut self, now: Instant) -> Result<()> {
        if self.state != BreakerState::Open {
            return Ok(());
        }

        match self.next_retry_at {
            Some(at) if now < at => Err(Error::CircuitOpen {
                key: self.key.clone(),
                retry_in_secs: at.duration_since(now).as_secs().max(1),
            }),
            _ => {
                self.state = BreakerState::HalfOpen;
                self.success_count = 0;
                info!(key = %self.key, "Circuit half-open, probing");
                Ok(())
            }
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            BreakerState::Closed => self.failure_count = 0,
            BreakerState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.success_threshold {
                    self.state = BreakerState::Closed;
                    self.failure_count = 0;
                    self.success_count = 0;
                    self.next_retry_at = None;
                    info!(key = %self.key, "Circuit closed");
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.failure_count = self.failure_count.saturating_add(1);
        let trip = match self.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => self.failure_count >= self.failure_threshold,
            BreakerState::Open => false,
        };

        if trip {
            self.state = BreakerState::Open;
            self.success_count = 0;
            self.next_retry_at = Some(now + self.open_timeout);
            warn!(
                key = %self.key,
                failures = self.failure_count,
                open_secs = self.open_timeout.as_secs(),
                "Circuit opened"
            );
        }
    }

    pub fn snapshot(&self, now: Instant) -> BreakerSnapshot {
        BreakerSnapshot {
            key: self.key.clone(),
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            retry_in_secs: self
                .next_retry_at
                .filter(|_| self.state == BreakerState::Open)
                .map(|at| at.saturating_duration_since(now).as_secs()),
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub retry_in_secs: Option<u64>,
}

/// Breakers keyed by endpoint
pub struct BreakerRegistry {
    config: ResilienceConfig,
    breakers: DashMap<String, CircuitBreaker>,
}

impl BreakerRegistry {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Run `op` through the breaker for `key`
    pub async fn call<T, F, Fut>(&self, key: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.breaker(key).try_acquire(Instant::now())?;

        // The entry guard is not held across the call
        let result = op().await;

        let mut breaker = self.breaker(key);
        match &result {
            Ok(_) => breaker.record_success(),
            Err(e) if e.is_retryable() => breaker.record_failure(Instant::now()),
            Err(_) => {}
        }
        result
    }

    pub fn state(&self, key: &str) -> BreakerState {
        self.breakers
            .get(key)
            .map(|b| b.state())
            .unwrap_or(BreakerState::Closed)
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let now = Instant::now();
        let mut snapshots: Vec<BreakerSnapshot> =
            self.breakers.iter().map(|b| b.snapshot(now)).collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    fn breaker(&self, key: &str) -> dashmap::mapref::one::RefMut<'_, String, CircuitBreaker> {
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreaker::new(key, &self.config))
    }
}
