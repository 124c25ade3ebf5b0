//! In-memory sliding-window rate limiting
//!
//! Each client key keeps the timestamps of its recent requests. Timestamps
//! older than the window are pruned on every check; a key at or above
//! `max_requests` is rejected with `resource-exhausted` and the handler is
//! never invoked. Keys whose window has emptied are swept at most once per
//! sweep interval so idle clients do not accumulate.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::error::Result;
use crate::pipeline::{Middleware, MiddlewareContext, Next};
use crate::status::StatusKind;

/// Derives the rate-limit key of a call
pub type KeyExtractor = Arc<dyn Fn(&MiddlewareContext) -> String + Send + Sync>;

/// Sliding-window rate limiter keyed by client
pub struct RateLimitMiddleware {
    max_requests: usize,
    window: Duration,
    sweep_interval: Duration,
    key: KeyExtractor,
    windows: DashMap<String, VecDeque<Instant>>,
    last_sweep: Mutex<Instant>,
}

impl RateLimitMiddleware {
    /// Allow `max_requests` per `window` for each client address
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            sweep_interval: window,
            key: Arc::new(|ctx: &MiddlewareContext| ctx.request.client_address.clone()),
            windows: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Build from configuration
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests, config.window()).with_sweep_interval(config.sweep_interval())
    }

    /// Use a custom key instead of the client address
    pub fn with_key_extractor<F>(mut self, key: F) -> Self
    where
        F: Fn(&MiddlewareContext) -> String + Send + Sync + 'static,
    {
        self.key = Arc::new(key);
        self
    }

    /// How often idle keys are removed
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Record a request for `key` at `now`
    ///
    /// Returns `false` when the key is over its limit; rejected requests are
    /// not recorded.
    pub fn check(&self, key: &str, now: Instant) -> bool {
        let mut timestamps = self.windows.entry(key.to_string()).or_default();
        prune(&mut timestamps, now, self.window);

        if timestamps.len() >= self.max_requests {
            return false;
        }
        timestamps.push_back(now);
        true
    }

    /// Requests left for `key` in the current window
    pub fn remaining(&self, key: &str, now: Instant) -> usize {
        let used = self
            .windows
            .get_mut(key)
            .map(|mut timestamps| {
                prune(&mut timestamps, now, self.window);
                timestamps.len()
            })
            .unwrap_or(0);
        self.max_requests.saturating_sub(used)
    }

    /// Number of keys currently tracked
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Drop keys with no requests inside the window
    pub fn sweep(&self, now: Instant) {
        let before = self.windows.len();
        self.windows.retain(|_, timestamps| {
            prune(timestamps, now, self.window);
            !timestamps.is_empty()
        });
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            tracing::debug!(removed, remaining = self.windows.len(), "swept idle rate-limit keys");
        }
    }

    fn maybe_sweep(&self, now: Instant) {
        {
            let mut last = self.last_sweep.lock().unwrap_or_else(PoisonError::into_inner);
            if now.saturating_duration_since(*last) < self.sweep_interval {
                return;
            }
            *last = now;
        }
        self.sweep(now);
    }
}

fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = timestamps.front() {
        if now.saturating_duration_since(*oldest) >= window {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}

impl fmt::Debug for RateLimitMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitMiddleware")
            .field("max_requests", &self.max_requests)
            .field("window", &self.window)
            .field("sweep_interval", &self.sweep_interval)
            .field("tracked_keys", &self.windows.len())
            .finish()
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<()> {
        let now = Instant::now();
        self.maybe_sweep(now);

        let key = (self.key)(ctx);
        if !self.check(&key, now) {
            tracing::warn!(
                key = %key,
                limit = self.max_requests,
                window_ms = self.window.as_millis() as u64,
                "Rate limit exceeded"
            );
            ctx.response
                .headers
                .insert("x-ratelimit-limit", self.max_requests.to_string());
            ctx.response.headers.insert("x-ratelimit-remaining", "0");
            ctx.response
                .send(StatusKind::ResourceExhausted, "rate limit exceeded");
            return Ok(());
        }

        next.run(ctx).await
    }

    fn name(&self) -> &'static str {
        "rate_limit"
    }
}
