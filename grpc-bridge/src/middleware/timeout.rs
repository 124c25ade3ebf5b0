//! Advisory request timeout
//!
//! The timeout cancels the call's token; handlers observe it cooperatively.
//! Transport deadlines remain authoritative and converge on the same token.

use std::time::Duration;

use async_trait::async_trait;
use tokio::task::AbortHandle;

use crate::cancellation::CancelReason;
use crate::error::Result;
use crate::pipeline::{Middleware, MiddlewareContext, Next};

/// Cancels the call if the rest of the chain takes longer than `timeout`
#[derive(Debug, Clone)]
pub struct TimeoutMiddleware {
    timeout: Duration,
}

impl TimeoutMiddleware {
    /// Timeout after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Configured timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

struct TimerGuard(AbortHandle);

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[async_trait]
impl Middleware for TimeoutMiddleware {
    async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<()> {
        let token = ctx.context().cancellation().clone();
        let timeout = self.timeout;
        let method = ctx.request.path.clone();

        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if token.cancel(CancelReason::Timeout) {
                tracing::warn!(
                    method = %method,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
            }
        });
        let _guard = TimerGuard(timer.abort_handle());

        next.run(ctx).await
    }

    fn name(&self) -> &'static str {
        "timeout"
    }
}
