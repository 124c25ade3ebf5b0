//! Middleware trait and the continuation that drives the chain

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::pipeline::view::MiddlewareContext;

/// A step of the interceptor chain
///
/// Call `next.run(ctx)` to continue; return without calling it to
/// short-circuit. A middleware that short-circuits should
/// [`send`](crate::pipeline::ResponseView::send) a response, otherwise the
/// call fails with an internal error.
///
/// ```rust
/// use async_trait::async_trait;
/// use grpc_bridge::error::Result;
/// use grpc_bridge::pipeline::{Middleware, MiddlewareContext, Next};
/// use grpc_bridge::status::StatusKind;
///
/// struct RequireUser;
///
/// #[async_trait]
/// impl Middleware for RequireUser {
///     async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<()> {
///         if ctx.context().user_id().is_none() {
///             ctx.response.send(StatusKind::Unauthenticated, "user required");
///             return Ok(());
///         }
///         next.run(ctx).await
///     }
/// }
/// ```
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Process the call
    async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<()>;

    /// Name used in logs
    fn name(&self) -> &'static str {
        "middleware"
    }
}

/// Terminal step of the chain
#[async_trait]
pub(crate) trait Endpoint: Send {
    async fn call(&mut self, ctx: &mut MiddlewareContext) -> Result<()>;
}

/// The rest of the chain
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    endpoint: &'a mut (dyn Endpoint + 'a),
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Middleware>], endpoint: &'a mut (dyn Endpoint + 'a)) -> Self {
        Self { chain, endpoint }
    }

    /// Continue with the next middleware, or the handler at the end
    pub async fn run(self, ctx: &mut MiddlewareContext) -> Result<()> {
        match self.chain.split_first() {
            Some((current, rest)) => {
                tracing::trace!(middleware = current.name(), "entering middleware");
                current
                    .handle(
                        ctx,
                        Next {
                            chain: rest,
                            endpoint: self.endpoint,
                        },
                    )
                    .await
            }
            None => self.endpoint.call(ctx).await,
        }
    }

    /// Number of middleware still ahead
    pub fn remaining(&self) -> usize {
        self.chain.len()
    }
}
