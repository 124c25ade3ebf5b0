//! Interceptor pipeline
//!
//! A [`Pipeline`] runs an ordered chain of [`Middleware`] around every
//! handler invocation. Each call gets its own [`RequestContext`] (bridged to
//! the transport deadline and cancellation signals) and a
//! [`MiddlewareContext`] view; middleware may act before and after the
//! handler, or short-circuit by sending a response without calling
//! [`Next::run`].
//!
//! Exactly one terminal outcome is produced per call:
//!
//! - a middleware sent a response: its status is translated and returned,
//!   the handler never runs;
//! - the call was cancelled before the handler: a `Cancelled` status;
//! - otherwise the handler's own result, with the trace and request ids
//!   added to the response metadata;
//! - middleware errors and panics resolve through the error transformer.
//!
//! Streaming responses are handed back as soon as the handler returns the
//! stream; the call completes when the stream ends.

mod chain;
mod stream;
mod view;

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{FutureExt, Stream};
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, MetadataMap};
use tonic::{Request, Response, Status};
use tracing::Instrument;

pub use chain::{Middleware, Next};
pub use view::{InvocationState, MiddlewareContext, RequestView, ResponseView, RouteParams, StreamingInfo};

use crate::config::Config;
use crate::context::{ContextFactory, RequestContext};
use crate::descriptor::CallDescriptor;
use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::middleware::{LoggingMiddleware, RateLimitMiddleware, TimeoutMiddleware};
use crate::status::{default_error_transformer, ErrorTransformer, StatusKind};
use chain::Endpoint;
use stream::{CallCompletion, ContextStream};

/// Stream of messages flowing in either direction of a streaming call
pub type MessageStream<T> = Pin<Box<dyn Stream<Item = std::result::Result<T, Status>> + Send + 'static>>;

/// Invoked when a call completes normally, with the elapsed time
pub type CompletionHook = Arc<dyn Fn(&RequestContext, Duration) + Send + Sync>;

/// What a handler receives: the original call plus its context
#[derive(Debug)]
pub struct RpcCall<T> {
    context: Arc<RequestContext>,
    request: Request<T>,
}

impl<T> RpcCall<T> {
    /// Pair a request with its context
    pub fn new(context: Arc<RequestContext>, request: Request<T>) -> Self {
        Self { context, request }
    }

    /// Request context
    pub fn context(&self) -> &Arc<RequestContext> {
        &self.context
    }

    /// The tonic request
    pub fn request(&self) -> &Request<T> {
        &self.request
    }

    /// The request message
    pub fn message(&self) -> &T {
        self.request.get_ref()
    }

    /// Take the request message, keeping the context
    pub fn into_message(self) -> (Arc<RequestContext>, T) {
        (self.context, self.request.into_inner())
    }

    /// Split into context and request
    pub fn into_parts(self) -> (Arc<RequestContext>, Request<T>) {
        (self.context, self.request)
    }
}

/// Ordered middleware chain plus the context factory feeding it
#[derive(Clone)]
pub struct Pipeline {
    middleware: Arc<[Arc<dyn Middleware>]>,
    factory: ContextFactory,
    error_transformer: Option<ErrorTransformer>,
    on_request_complete: Option<CompletionHook>,
}

impl Pipeline {
    /// Start building a pipeline
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// A pipeline without middleware
    pub fn new(factory: ContextFactory) -> Self {
        Self::builder().context_factory(factory).build()
    }

    /// Pipeline with the built-in middleware enabled in `config`,
    /// installed in the order logging, timeout, rate limit
    pub fn from_config(config: &Config) -> Self {
        let factory =
            ContextFactory::new(config.service.protocol.clone()).with_headers(config.headers.clone());
        let mut builder = Self::builder().context_factory(factory);

        if config.logging.enabled {
            builder = builder.layer(LoggingMiddleware::new());
        }
        if config.timeout.enabled {
            builder = builder.layer(TimeoutMiddleware::new(config.timeout.duration()));
        }
        if config.rate_limit.enabled {
            builder = builder.layer(RateLimitMiddleware::from_config(&config.rate_limit));
        }

        builder.build()
    }

    /// Context factory used for every call
    pub fn context_factory(&self) -> &ContextFactory {
        &self.factory
    }

    /// Names of the installed middleware, in order
    pub fn middleware_names(&self) -> Vec<&'static str> {
        self.middleware.iter().map(|m| m.name()).collect()
    }

    /// Translate an error into a status with the configured transformer
    pub fn translate_error(&self, err: &Error) -> Status {
        match &self.error_transformer {
            Some(transform) => transform(err),
            None => default_error_transformer(err),
        }
    }

    /// Run a unary call through the pipeline
    pub async fn unary<Req, Resp, H, Fut>(
        &self,
        descriptor: &CallDescriptor,
        request: Request<Req>,
        handler: H,
    ) -> std::result::Result<Response<Resp>, Status>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        H: FnOnce(RpcCall<Req>) -> Fut + Send,
        Fut: Future<Output = std::result::Result<Response<Resp>, Status>> + Send,
    {
        self.single(descriptor, request, handler).await
    }

    /// Run a client-streaming call; `S` is the incoming message stream
    pub async fn client_streaming<S, Resp, H, Fut>(
        &self,
        descriptor: &CallDescriptor,
        request: Request<S>,
        handler: H,
    ) -> std::result::Result<Response<Resp>, Status>
    where
        S: Send + 'static,
        Resp: Send + 'static,
        H: FnOnce(RpcCall<S>) -> Fut + Send,
        Fut: Future<Output = std::result::Result<Response<Resp>, Status>> + Send,
    {
        self.single(descriptor, request, handler).await
    }

    /// Run a server-streaming call
    pub async fn server_streaming<Req, Resp, S, H, Fut>(
        &self,
        descriptor: &CallDescriptor,
        request: Request<Req>,
        handler: H,
    ) -> std::result::Result<Response<MessageStream<Resp>>, Status>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        S: Stream<Item = std::result::Result<Resp, Status>> + Send + 'static,
        H: FnOnce(RpcCall<Req>) -> Fut + Send,
        Fut: Future<Output = std::result::Result<Response<S>, Status>> + Send,
    {
        self.streaming(descriptor, request, handler).await
    }

    /// Run a bidirectional call; `In` is the incoming message stream
    pub async fn bidirectional<In, Resp, S, H, Fut>(
        &self,
        descriptor: &CallDescriptor,
        request: Request<In>,
        handler: H,
    ) -> std::result::Result<Response<MessageStream<Resp>>, Status>
    where
        In: Send + 'static,
        Resp: Send + 'static,
        S: Stream<Item = std::result::Result<Resp, Status>> + Send + 'static,
        H: FnOnce(RpcCall<In>) -> Fut + Send,
        Fut: Future<Output = std::result::Result<Response<S>, Status>> + Send,
    {
        self.streaming(descriptor, request, handler).await
    }

    async fn single<In, Out, H, Fut>(
        &self,
        descriptor: &CallDescriptor,
        request: Request<In>,
        handler: H,
    ) -> std::result::Result<Response<Out>, Status>
    where
        In: Send + 'static,
        Out: Send + 'static,
        H: FnOnce(RpcCall<In>) -> Fut + Send,
        Fut: Future<Output = std::result::Result<Response<Out>, Status>> + Send,
    {
        let (outcome, completion) = self.execute(descriptor, request, handler).await;
        completion.finish();
        outcome
    }

    async fn streaming<In, Resp, S, H, Fut>(
        &self,
        descriptor: &CallDescriptor,
        request: Request<In>,
        handler: H,
    ) -> std::result::Result<Response<MessageStream<Resp>>, Status>
    where
        In: Send + 'static,
        Resp: Send + 'static,
        S: Stream<Item = std::result::Result<Resp, Status>> + Send + 'static,
        H: FnOnce(RpcCall<In>) -> Fut + Send,
        Fut: Future<Output = std::result::Result<Response<S>, Status>> + Send,
    {
        let boxed = move |call: RpcCall<In>| async move {
            handler(call)
                .await
                .map(|response| response.map(|stream| Box::pin(stream) as MessageStream<Resp>))
        };

        let (outcome, completion) = self.execute(descriptor, request, boxed).await;
        match outcome {
            Ok(response) => Ok(response.map(move |stream| {
                Box::pin(ContextStream::new(stream, completion)) as MessageStream<Resp>
            })),
            Err(status) => {
                completion.finish();
                Err(status)
            }
        }
    }

    async fn execute<In, Out, H, Fut>(
        &self,
        descriptor: &CallDescriptor,
        request: Request<In>,
        handler: H,
    ) -> (std::result::Result<Response<Out>, Status>, CallCompletion)
    where
        In: Send + 'static,
        Out: Send + 'static,
        H: FnOnce(RpcCall<In>) -> Fut + Send,
        Fut: Future<Output = std::result::Result<Response<Out>, Status>> + Send,
    {
        let started = Instant::now();

        let scope = match self.factory.enter(&request, descriptor) {
            Ok(scope) => scope,
            Err(err) => {
                tracing::error!(method = %descriptor.path, error = %err, "failed to establish request context");
                return (Err(self.translate_error(&err)), CallCompletion::detached(started));
            }
        };
        let context = scope.context().clone();
        let completion = CallCompletion::new(scope, started, self.on_request_complete.clone());

        let span = tracing::info_span!(
            "grpc_call",
            otel.kind = "server",
            rpc.system = "grpc",
            rpc.service = %descriptor.service_name,
            rpc.method = %descriptor.method_name,
            trace_id = %context.trace_id(),
            request_id = %context.request_id(),
        );

        let outcome = self
            .run_chain(context, descriptor, request, handler)
            .instrument(span)
            .await;
        (outcome, completion)
    }

    async fn run_chain<In, Out, H, Fut>(
        &self,
        context: Arc<RequestContext>,
        descriptor: &CallDescriptor,
        request: Request<In>,
        handler: H,
    ) -> std::result::Result<Response<Out>, Status>
    where
        In: Send + 'static,
        Out: Send + 'static,
        H: FnOnce(RpcCall<In>) -> Fut + Send,
        Fut: Future<Output = std::result::Result<Response<Out>, Status>> + Send,
    {
        let (metadata, extensions, message) = request.into_parts();
        let mut ctx = MiddlewareContext::new(context, descriptor, self.factory.protocol(), Box::new(message));
        ctx.set_state(InvocationState::ContextEstablished);

        let mut endpoint = HandlerEndpoint::<In, Out, H, Fut> {
            handler: Some(handler),
            parts: Some((metadata, extensions)),
            outcome: None,
            error_transformer: self.error_transformer.clone(),
            _types: PhantomData,
        };

        ctx.set_state(InvocationState::MiddlewareRunning);
        let chain = AssertUnwindSafe(Next::new(&self.middleware, &mut endpoint).run(&mut ctx))
            .catch_unwind()
            .await;

        // A middleware error after the handler ran still wins; nothing has
        // been delivered yet.
        let outcome = match chain {
            Ok(Ok(())) => match endpoint.outcome.take() {
                Some(outcome) => outcome,
                None => Err(short_circuit_status(&ctx.response)),
            },
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "middleware failed");
                Err(self.translate_error(&err))
            }
            Err(panic) => {
                let err = Error::Internal(format!("middleware panicked: {}", panic_message(&*panic)));
                tracing::error!(error = %err, "middleware panicked");
                Err(self.translate_error(&err))
            }
        };

        ctx.set_state(InvocationState::Completed);
        self.decorate(outcome, &ctx)
    }

    fn decorate<Out>(
        &self,
        outcome: std::result::Result<Response<Out>, Status>,
        ctx: &MiddlewareContext,
    ) -> std::result::Result<Response<Out>, Status> {
        match outcome {
            Ok(mut response) => {
                let names = self.factory.headers();
                let metadata = response.metadata_mut();
                copy_headers(&ctx.response.headers, metadata);
                set_header(metadata, &names.trace_id, ctx.context().trace_id());
                set_header(metadata, &names.request_id, ctx.context().request_id());
                Ok(response)
            }
            Err(mut status) => {
                copy_headers(&ctx.response.headers, status.metadata_mut());
                Err(status)
            }
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("middleware", &self.middleware_names())
            .field("factory", &self.factory)
            .field("error_transformer", &self.error_transformer.is_some())
            .field("on_request_complete", &self.on_request_complete.is_some())
            .finish()
    }
}

/// Builder for [`Pipeline`]
#[derive(Default)]
pub struct PipelineBuilder {
    middleware: Vec<Arc<dyn Middleware>>,
    factory: ContextFactory,
    error_transformer: Option<ErrorTransformer>,
    on_request_complete: Option<CompletionHook>,
}

impl PipelineBuilder {
    /// Context factory for every call
    pub fn context_factory(mut self, factory: ContextFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Append a middleware; middleware run in the order they are added
    pub fn layer<M: Middleware>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Append a shared middleware
    pub fn layer_shared(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Replace the default error-to-status translation
    pub fn error_transformer<F>(mut self, transform: F) -> Self
    where
        F: Fn(&Error) -> Status + Send + Sync + 'static,
    {
        self.error_transformer = Some(Arc::new(transform));
        self
    }

    /// Hook run after every normally completed call
    pub fn on_request_complete<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RequestContext, Duration) + Send + Sync + 'static,
    {
        self.on_request_complete = Some(Arc::new(hook));
        self
    }

    /// Finish the pipeline
    pub fn build(self) -> Pipeline {
        Pipeline {
            middleware: self.middleware.into(),
            factory: self.factory,
            error_transformer: self.error_transformer,
            on_request_complete: self.on_request_complete,
        }
    }
}

struct HandlerEndpoint<In, Out, H, Fut> {
    handler: Option<H>,
    parts: Option<(MetadataMap, tonic::Extensions)>,
    outcome: Option<std::result::Result<Response<Out>, Status>>,
    error_transformer: Option<ErrorTransformer>,
    _types: PhantomData<(In, Fut)>,
}

#[async_trait]
impl<In, Out, H, Fut> Endpoint for HandlerEndpoint<In, Out, H, Fut>
where
    In: Send + 'static,
    Out: Send + 'static,
    H: FnOnce(RpcCall<In>) -> Fut + Send,
    Fut: Future<Output = std::result::Result<Response<Out>, Status>> + Send,
{
    async fn call(&mut self, ctx: &mut MiddlewareContext) -> Result<()> {
        if ctx.response.is_sent() {
            ctx.set_state(InvocationState::ShortCircuited);
            return Ok(());
        }
        if let Some(reason) = ctx.context().cancellation().reason() {
            tracing::debug!(reason = %reason, "call cancelled before handler");
            ctx.response
                .complete(StatusKind::Cancelled, Some(reason.to_string()));
            ctx.set_state(InvocationState::ShortCircuited);
            return Ok(());
        }

        let (handler, (metadata, extensions)) = match (self.handler.take(), self.parts.take()) {
            (Some(handler), Some(parts)) => (handler, parts),
            _ => return Err(Error::Internal("handler invoked more than once".to_string())),
        };
        let message = ctx.request.take_body::<In>().ok_or_else(|| {
            Error::Internal("request body was replaced with a different type".to_string())
        })?;

        ctx.set_state(InvocationState::HandlerInvoked);
        let call = RpcCall::new(ctx.context().clone(), Request::from_parts(metadata, extensions, message));
        let outcome = AssertUnwindSafe(async move { handler(call).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let err = Error::Internal(format!("handler panicked: {}", panic_message(&*panic)));
                tracing::error!(error = %err, "handler panicked");
                Err(match &self.error_transformer {
                    Some(transform) => transform(&err),
                    None => default_error_transformer(&err),
                })
            });

        match &outcome {
            Ok(_) => ctx.response.complete(StatusKind::Ok, None),
            Err(status) => ctx.response.complete(
                StatusKind::from_code(status.code()),
                Some(status.message().to_string()),
            ),
        }
        self.outcome = Some(outcome);
        Ok(())
    }
}

fn short_circuit_status(response: &ResponseView) -> Status {
    let kind = response.status();
    if !response.is_sent() {
        return Status::internal("middleware chain ended without a response");
    }
    if !kind.is_error() {
        return Status::internal("middleware sent a success status without invoking the handler");
    }
    let message = response
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| kind.to_string());
    kind.into_status(message)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn set_header(map: &mut MetadataMap, name: &str, value: &str) {
    match (AsciiMetadataKey::from_bytes(name.as_bytes()), AsciiMetadataValue::try_from(value)) {
        (Ok(key), Ok(value)) => {
            map.insert(key, value);
        }
        _ => tracing::debug!(header = name, "skipping header that is not valid ASCII metadata"),
    }
}

fn copy_headers(headers: &Metadata, map: &mut MetadataMap) {
    for (name, values) in headers.iter() {
        for value in values.values() {
            match (AsciiMetadataKey::from_bytes(name.as_bytes()), AsciiMetadataValue::try_from(value)) {
                (Ok(key), Ok(value)) => {
                    map.append(key, value);
                }
                _ => tracing::debug!(header = name, "skipping header that is not valid ASCII metadata"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::{CallDeadline, CancelReason};
    use crate::ids::matches_generated_pattern;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tonic::Code;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        log: Log,
    }

    #[async_trait]
    impl Middleware for Recorder {
        async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<()> {
            self.log.lock().unwrap().push(format!("{}:before", self.name));
            let result = next.run(ctx).await;
            self.log.lock().unwrap().push(format!("{}:after", self.name));
            result
        }
    }

    struct Reject(StatusKind);

    #[async_trait]
    impl Middleware for Reject {
        async fn handle(&self, ctx: &mut MiddlewareContext, _next: Next<'_>) -> Result<()> {
            ctx.response.send(self.0, "rejected by middleware");
            Ok(())
        }
    }

    struct Fail;

    #[async_trait]
    impl Middleware for Fail {
        async fn handle(&self, _ctx: &mut MiddlewareContext, _next: Next<'_>) -> Result<()> {
            Err(Error::http(404, "no such greeting"))
        }
    }

    struct Swallow;

    #[async_trait]
    impl Middleware for Swallow {
        async fn handle(&self, _ctx: &mut MiddlewareContext, _next: Next<'_>) -> Result<()> {
            Ok(())
        }
    }

    fn greeter() -> CallDescriptor {
        CallDescriptor::unary("example.v1.Greeter", "SayHello")
    }

    async fn echo(call: RpcCall<String>) -> std::result::Result<Response<String>, Status> {
        let (ctx, name) = call.into_message();
        Ok(Response::new(format!("Hello {} ({})", name, ctx.trace_id())))
    }

    #[tokio::test]
    async fn test_middleware_runs_in_registration_order() {
        let log: Log = Arc::default();
        let pipeline = Pipeline::builder()
            .layer(Recorder { name: "first", log: log.clone() })
            .layer(Recorder { name: "second", log: log.clone() })
            .build();

        let handler_log = log.clone();
        let response = pipeline
            .unary(&greeter(), Request::new("world".to_string()), |call| async move {
                handler_log.lock().unwrap().push("handler".to_string());
                echo(call).await
            })
            .await
            .unwrap();

        assert!(response.get_ref().starts_with("Hello world"));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:before", "second:before", "handler", "second:after", "first:after"]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_handler_and_later_middleware() {
        let log: Log = Arc::default();
        let pipeline = Pipeline::builder()
            .layer(Recorder { name: "outer", log: log.clone() })
            .layer(Reject(StatusKind::BadRequest))
            .layer(Recorder { name: "inner", log: log.clone() })
            .build();

        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let status = pipeline
            .unary(&greeter(), Request::new(String::new()), |call| async move {
                flag.store(true, Ordering::SeqCst);
                echo(call).await
            })
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "rejected by middleware");
        assert!(!called.load(Ordering::SeqCst));
        assert_eq!(*log.lock().unwrap(), vec!["outer:before", "outer:after"]);
    }

    #[tokio::test]
    async fn test_chain_ending_without_response_is_internal() {
        let pipeline = Pipeline::builder().layer(Swallow).build();
        let status = pipeline
            .unary(&greeter(), Request::new(String::new()), echo)
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "middleware chain ended without a response");
    }

    #[tokio::test]
    async fn test_success_sent_by_middleware_is_internal() {
        let pipeline = Pipeline::builder().layer(Reject(StatusKind::Ok)).build();
        let status = pipeline
            .unary(&greeter(), Request::new(String::new()), echo)
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(
            status.message(),
            "middleware sent a success status without invoking the handler"
        );
    }

    #[test]
    fn test_from_config_installs_enabled_middleware_in_order() {
        let mut config = Config::default();
        config.logging.enabled = true;
        config.timeout.enabled = true;
        config.rate_limit.enabled = true;
        let pipeline = Pipeline::from_config(&config);
        assert_eq!(pipeline.middleware_names(), vec!["logging", "timeout", "rate_limit"]);
        assert_eq!(pipeline.context_factory().protocol(), "grpc");

        config.logging.enabled = false;
        config.timeout.enabled = false;
        config.rate_limit.enabled = false;
        assert!(Pipeline::from_config(&config).middleware_names().is_empty());
    }

    #[tokio::test]
    async fn test_middleware_error_uses_default_transformer() {
        let pipeline = Pipeline::builder().layer(Fail).build();
        let status = pipeline
            .unary(&greeter(), Request::new(String::new()), echo)
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "no such greeting");
    }

    #[tokio::test]
    async fn test_configured_error_transformer_wins() {
        let pipeline = Pipeline::builder()
            .layer(Fail)
            .error_transformer(|err| Status::unavailable(format!("custom: {}", err)))
            .build();
        let status = pipeline
            .unary(&greeter(), Request::new(String::new()), echo)
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
        assert!(status.message().starts_with("custom:"));
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_internal() {
        let pipeline = Pipeline::new(ContextFactory::default());
        let status = pipeline
            .unary(&greeter(), Request::new(String::new()), |_call: RpcCall<String>| async move {
                if true {
                    panic!("greeting exploded");
                }
                Ok(Response::new(String::new()))
            })
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Internal);
        assert!(status.message().contains("greeting exploded"));
    }

    #[tokio::test]
    async fn test_handler_status_passes_through() {
        let log: Log = Arc::default();
        let pipeline = Pipeline::builder()
            .layer(Recorder { name: "outer", log: log.clone() })
            .build();
        let status = pipeline
            .unary(&greeter(), Request::new(String::new()), |_call: RpcCall<String>| async move {
                Err::<Response<String>, _>(Status::permission_denied("not yours"))
            })
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::PermissionDenied);
        assert_eq!(status.message(), "not yours");
    }

    #[tokio::test]
    async fn test_elapsed_deadline_cancels_before_handler() {
        let pipeline = Pipeline::new(ContextFactory::default());
        let mut request = Request::new(String::new());
        request
            .extensions_mut()
            .insert(CallDeadline(Some(chrono::Utc::now() - chrono::Duration::seconds(1))));

        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let status = pipeline
            .unary(&greeter(), request, |call| async move {
                flag.store(true, Ordering::SeqCst);
                echo(call).await
            })
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::Cancelled);
        assert_eq!(status.message(), "deadline exceeded");
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_success_carries_ids_in_metadata() {
        let pipeline = Pipeline::new(ContextFactory::default());
        let mut request = Request::new("world".to_string());
        request.metadata_mut().insert("x-trace-id", "trace-abc".parse().unwrap());

        let response = pipeline.unary(&greeter(), request, echo).await.unwrap();
        let metadata = response.metadata();
        assert_eq!(metadata.get("x-trace-id").unwrap().to_str().unwrap(), "trace-abc");
        let request_id = metadata.get("x-request-id").unwrap().to_str().unwrap();
        assert!(matches_generated_pattern(request_id, "req"));
        assert_eq!(response.get_ref(), "Hello world (trace-abc)");
    }

    #[tokio::test]
    async fn test_middleware_sees_and_rewrites_body() {
        struct Shout;

        #[async_trait]
        impl Middleware for Shout {
            async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<()> {
                if let Some(name) = ctx.request.body_mut::<String>() {
                    *name = name.to_uppercase();
                }
                ctx.response.headers.insert("x-shouted", "yes");
                next.run(ctx).await
            }
        }

        let pipeline = Pipeline::builder().layer(Shout).build();
        let response = pipeline
            .unary(&greeter(), Request::new("world".to_string()), echo)
            .await
            .unwrap();
        assert!(response.get_ref().starts_with("Hello WORLD"));
        assert_eq!(response.metadata().get("x-shouted").unwrap().to_str().unwrap(), "yes");
    }

    #[tokio::test]
    async fn test_middleware_observes_final_status() {
        struct Observe(Arc<Mutex<Vec<(StatusKind, InvocationState)>>>);

        #[async_trait]
        impl Middleware for Observe {
            async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<()> {
                let result = next.run(ctx).await;
                self.0.lock().unwrap().push((ctx.response.status(), ctx.state()));
                result
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::builder().layer(Observe(seen.clone())).build();
        pipeline
            .unary(&greeter(), Request::new(String::new()), |_call: RpcCall<String>| async move {
                Err::<Response<String>, _>(Status::not_found("gone"))
            })
            .await
            .unwrap_err();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(StatusKind::NotFound, InvocationState::HandlerInvoked)]
        );
    }

    #[tokio::test]
    async fn test_completion_hook_receives_context() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let pipeline = Pipeline::builder()
            .on_request_complete(move |ctx, elapsed| {
                *sink.lock().unwrap() = Some((ctx.method_path().to_string(), elapsed));
            })
            .build();

        pipeline
            .unary(&greeter(), Request::new(String::new()), echo)
            .await
            .unwrap();
        let (path, _elapsed) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(path, "/example.v1.Greeter/SayHello");
    }

    #[tokio::test]
    async fn test_dropped_call_cancels_token() {
        let pipeline = Pipeline::new(ContextFactory::default());
        let (tx, rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            let _ = pipeline
                .unary(&greeter(), Request::new(String::new()), |call: RpcCall<String>| async move {
                    let _ = tx.send(call.context().clone());
                    futures::future::pending::<std::result::Result<Response<String>, Status>>().await
                })
                .await;
        });

        let ctx = rx.await.unwrap();
        assert!(!ctx.is_cancelled());
        handle.abort();
        let _ = handle.await;
        assert_eq!(ctx.cancellation().reason(), Some(CancelReason::Transport));
    }

    #[tokio::test]
    async fn test_server_streaming_completes_when_stream_ends() {
        let completed = Arc::new(AtomicBool::new(false));
        let flag = completed.clone();
        let pipeline = Pipeline::builder()
            .on_request_complete(move |_, _| flag.store(true, Ordering::SeqCst))
            .build();
        let descriptor = greeter().with_response_stream();

        let response = pipeline
            .server_streaming(&descriptor, Request::new(3usize), |call: RpcCall<usize>| async move {
                let count = *call.message();
                let items = (0..count).map(|i| Ok(format!("item-{}", i)));
                Ok(Response::new(futures::stream::iter(items)))
            })
            .await
            .unwrap();

        assert!(response.metadata().get("x-trace-id").is_some());
        assert!(!completed.load(Ordering::SeqCst));

        let items: Vec<String> = response
            .into_inner()
            .map(|item| item.unwrap())
            .collect()
            .await;
        assert_eq!(items, vec!["item-0", "item-1", "item-2"]);
        assert!(completed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_server_streaming_error_item_completes_call() {
        let completed = Arc::new(AtomicBool::new(false));
        let flag = completed.clone();
        let pipeline = Pipeline::builder()
            .on_request_complete(move |_, _| flag.store(true, Ordering::SeqCst))
            .build();
        let descriptor = greeter().with_response_stream();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let response = pipeline
            .server_streaming(&descriptor, Request::new(()), |call: RpcCall<()>| async move {
                let _ = tx.send(call.context().clone());
                let items = vec![Ok(1u32), Err(Status::not_found("no more items"))];
                Ok(Response::new(futures::stream::iter(items)))
            })
            .await
            .unwrap();
        let ctx = rx.await.unwrap();

        // The server stops reading at the first error and drops the body
        let mut stream = response.into_inner();
        assert_eq!(stream.next().await.unwrap().unwrap(), 1);
        let status = stream.next().await.unwrap().unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
        drop(stream);

        assert!(completed.load(Ordering::SeqCst));
        assert!(!ctx.is_cancelled());
        assert_eq!(ctx.cancellation().reason(), None);
    }

    #[tokio::test]
    async fn test_dropping_response_stream_cancels_call() {
        let pipeline = Pipeline::new(ContextFactory::default());
        let descriptor = greeter().with_response_stream();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let response = pipeline
            .server_streaming(&descriptor, Request::new(()), |call: RpcCall<()>| async move {
                let _ = tx.send(call.context().clone());
                Ok(Response::new(futures::stream::pending::<std::result::Result<u32, Status>>()))
            })
            .await
            .unwrap();

        let ctx = rx.await.unwrap();
        assert!(!ctx.is_cancelled());
        drop(response);
        assert_eq!(ctx.cancellation().reason(), Some(CancelReason::Transport));
    }

    #[tokio::test]
    async fn test_bidirectional_consumes_request_stream() {
        let pipeline = Pipeline::new(ContextFactory::default());
        let descriptor = greeter().with_request_stream().with_response_stream();
        let incoming: MessageStream<u32> = Box::pin(futures::stream::iter(vec![Ok(1), Ok(2), Ok(3)]));

        let response = pipeline
            .bidirectional(&descriptor, Request::new(incoming), |call: RpcCall<MessageStream<u32>>| async move {
                let (_ctx, stream) = call.into_message();
                Ok(Response::new(stream.map(|item| item.map(|n| n * 10))))
            })
            .await
            .unwrap();

        let doubled: Vec<u32> = response
            .into_inner()
            .map(|item| item.unwrap())
            .collect()
            .await;
        assert_eq!(doubled, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_client_streaming_single_response() {
        let pipeline = Pipeline::new(ContextFactory::default());
        let descriptor = greeter().with_request_stream();
        let incoming: MessageStream<u32> = Box::pin(futures::stream::iter(vec![Ok(1), Ok(2), Ok(3)]));

        let response = pipeline
            .client_streaming(&descriptor, Request::new(incoming), |call: RpcCall<MessageStream<u32>>| async move {
                let (_ctx, stream) = call.into_message();
                let values: Vec<u32> = stream.map(|item| item.unwrap_or(0)).collect().await;
                Ok(Response::new(values.iter().sum::<u32>()))
            })
            .await
            .unwrap();
        assert_eq!(*response.get_ref(), 6);
    }
}
