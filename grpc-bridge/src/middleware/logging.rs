//! Request logging middleware

use std::time::Instant;

use async_trait::async_trait;

use crate::error::Result;
use crate::pipeline::{Middleware, MiddlewareContext, Next};

/// Logs the start and end of every call
///
/// Never alters control flow; failures of later middleware are logged and
/// passed through unchanged.
#[derive(Debug, Clone, Default)]
pub struct LoggingMiddleware;

impl LoggingMiddleware {
    /// Create the middleware
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<()> {
        let start = Instant::now();
        let trace_id = ctx.context().trace_id().to_string();

        tracing::info!(
            trace_id = %trace_id,
            service = %ctx.request.params.service,
            method = %ctx.request.params.method,
            call_type = %ctx.request.streaming.call_type,
            peer = %ctx.request.client_address,
            "gRPC request started"
        );

        let result = next.run(ctx).await;
        let duration = start.elapsed();

        match &result {
            Ok(()) => {
                let status = ctx.response.status();
                if status.is_error() {
                    tracing::warn!(
                        trace_id = %trace_id,
                        duration_ms = duration.as_millis() as u64,
                        status = %status,
                        grpc.status_code = ?status.code(),
                        detail = ctx.response.message().unwrap_or_default(),
                        "gRPC request completed with error"
                    );
                } else {
                    tracing::info!(
                        trace_id = %trace_id,
                        duration_ms = duration.as_millis() as u64,
                        status = %status,
                        "gRPC request completed"
                    );
                }
            }
            Err(err) => {
                tracing::warn!(
                    trace_id = %trace_id,
                    duration_ms = duration.as_millis() as u64,
                    error = %err,
                    "gRPC request failed"
                );
            }
        }

        result
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::CallDescriptor;
    use crate::pipeline::{Pipeline, RpcCall};
    use crate::status::StatusKind;
    use tonic::{Code, Request, Response, Status};

    struct Reject;

    #[async_trait]
    impl Middleware for Reject {
        async fn handle(&self, ctx: &mut MiddlewareContext, _next: Next<'_>) -> Result<()> {
            ctx.response.send(StatusKind::Unauthenticated, "who are you");
            Ok(())
        }
    }

    fn descriptor() -> CallDescriptor {
        CallDescriptor::unary("example.v1.Greeter", "SayHello")
    }

    #[tokio::test]
    async fn test_passes_success_through() {
        let pipeline = Pipeline::builder().layer(LoggingMiddleware::new()).build();
        let response = pipeline
            .unary(&descriptor(), Request::new(2u32), |call: RpcCall<u32>| async move {
                Ok(Response::new(*call.message() * 2))
            })
            .await
            .unwrap();
        assert_eq!(*response.get_ref(), 4);
        assert_eq!(pipeline.middleware_names(), vec!["logging"]);
    }

    #[tokio::test]
    async fn test_passes_short_circuit_through() {
        let pipeline = Pipeline::builder()
            .layer(LoggingMiddleware::new())
            .layer(Reject)
            .build();
        let status = pipeline
            .unary(&descriptor(), Request::new(()), |_call: RpcCall<()>| async move {
                Ok::<_, Status>(Response::new(()))
            })
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unauthenticated);
    }
}
