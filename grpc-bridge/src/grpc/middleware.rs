//! Tower middleware for tonic servers
//!
//! [`TransportSignalLayer`] gives every incoming HTTP/2 request a
//! [`CallSignals`] channel so the pipeline can observe the transport side of
//! the call. The signals are emitted from the lifetime of the inner future:
//! completion closes the call, a service error reports a transport error and
//! dropping the future before it resolves (client reset, connection loss,
//! server shutdown) reports a cancellation.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tonic::Code;
use tower::{Layer, Service};

use crate::cancellation::CallSignals;

/// Attaches [`CallSignals`] to every request
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportSignalLayer;

impl TransportSignalLayer {
    /// Create the layer
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for TransportSignalLayer {
    type Service = TransportSignalService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TransportSignalService { inner }
    }
}

/// Service produced by [`TransportSignalLayer`]
#[derive(Debug, Clone)]
pub struct TransportSignalService<S> {
    inner: S,
}

impl<S, ReqBody> Service<http::Request<ReqBody>> for TransportSignalService<S>
where
    S: Service<http::Request<ReqBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<ReqBody>) -> Self::Future {
        // The clone is not guaranteed to be ready; swap so the ready instance
        // serves this request.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let signals = CallSignals::new();
        req.extensions_mut().insert(signals.clone());
        let guard = SignalGuard::new(signals, req.uri().path().to_string());

        Box::pin(async move {
            let result = inner.call(req).await;
            match &result {
                Ok(_) => guard.close(),
                Err(_) => guard.fail(Code::Unknown, "service error"),
            }
            result
        })
    }
}

/// Reports a cancellation unless the call resolved first
struct SignalGuard {
    signals: CallSignals,
    path: String,
    resolved: bool,
}

impl SignalGuard {
    fn new(signals: CallSignals, path: String) -> Self {
        Self {
            signals,
            path,
            resolved: false,
        }
    }

    fn close(mut self) {
        self.resolved = true;
        self.signals.close();
    }

    fn fail(mut self, code: Code, message: &str) {
        self.resolved = true;
        tracing::warn!(path = %self.path, code = ?code, "transport error");
        self.signals.error(code, message);
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        if !self.resolved {
            tracing::debug!(path = %self.path, "call dropped by transport");
            self.signals.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::TransportEvent;
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tower::ServiceExt;

    type Captured = Arc<Mutex<Option<CallSignals>>>;

    macro_rules! capturing {
        ($captured:expr, $delay:expr) => {{
            let captured = $captured.clone();
            let delay = $delay;
            tower::service_fn(move |req: http::Request<()>| {
                *captured.lock().unwrap() = req.extensions().get::<CallSignals>().cloned();
                async move {
                    tokio::time::sleep(delay).await;
                    Ok::<_, Infallible>(http::Response::new(()))
                }
            })
        }};
    }

    #[tokio::test]
    async fn test_signals_attached_and_closed() {
        let captured: Captured = Arc::default();
        let service = TransportSignalLayer::new().layer(capturing!(captured, Duration::ZERO));

        service.oneshot(http::Request::new(())).await.unwrap();

        let signals = captured.lock().unwrap().clone().unwrap();
        assert_eq!(signals.current(), TransportEvent::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_future_reports_cancel() {
        let captured: Captured = Arc::default();
        let service = TransportSignalLayer::new()
            .layer(capturing!(captured, Duration::from_secs(60)));

        let call = service.oneshot(http::Request::new(()));
        let timed_out = tokio::time::timeout(Duration::from_secs(1), call).await;
        assert!(timed_out.is_err());

        let signals = captured.lock().unwrap().clone().unwrap();
        assert_eq!(signals.current(), TransportEvent::Cancelled);
    }

    #[tokio::test]
    async fn test_service_error_reported() {
        let captured: Captured = Arc::default();
        let inner = {
            let captured = captured.clone();
            tower::service_fn(move |req: http::Request<()>| {
                *captured.lock().unwrap() = req.extensions().get::<CallSignals>().cloned();
                async move { Err::<http::Response<()>, _>("boom") }
            })
        };
        let service = TransportSignalLayer::new().layer(inner);

        assert!(service.oneshot(http::Request::new(())).await.is_err());

        let signals = captured.lock().unwrap().clone().unwrap();
        assert!(matches!(
            signals.current(),
            TransportEvent::Error { code: Code::Unknown, .. }
        ));
    }
}
