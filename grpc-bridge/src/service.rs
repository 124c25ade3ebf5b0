//! Service implementations and their pipeline-wrapped counterparts
//!
//! A [`ServiceImplementation`] maps method names to handlers. Wrapping it
//! with [`Pipeline::wrap_service`] resolves a [`CallDescriptor`] for every
//! method and routes each invocation through the pipeline.
//!
//! ```rust
//! use grpc_bridge::pipeline::Pipeline;
//! use grpc_bridge::service::ServiceImplementation;
//! use tonic::Response;
//!
//! let implementation = ServiceImplementation::<String, String>::new()
//!     .unary("SayHello", |call| async move {
//!         let (_ctx, name) = call.into_message();
//!         Ok(Response::new(format!("Hello {}", name)))
//!     });
//!
//! let service = Pipeline::default()
//!     .wrap_service("example.v1.Greeter", implementation, [])
//!     .unwrap();
//! assert_eq!(service.descriptor("SayHello").unwrap().path, "/example.v1.Greeter/SayHello");
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::Stream;
use tonic::{Request, Response, Status};

use crate::descriptor::{CallDescriptor, CallType};
use crate::error::{Error, Result};
use crate::pipeline::{MessageStream, Pipeline, RpcCall};

type Outcome<T> = std::result::Result<Response<T>, Status>;

/// Boxed future returned by a method handler
pub type HandlerFuture<T> = BoxFuture<'static, Outcome<T>>;

type HandlerFn<In, Out> = Arc<dyn Fn(RpcCall<In>) -> HandlerFuture<Out> + Send + Sync>;

/// Handler for one method, tagged with its call shape
pub enum MethodHandler<Req, Resp> {
    /// Single request, single response
    Unary(HandlerFn<Req, Resp>),
    /// Request stream, single response
    ClientStreaming(HandlerFn<MessageStream<Req>, Resp>),
    /// Single request, response stream
    ServerStreaming(HandlerFn<Req, MessageStream<Resp>>),
    /// Streams both ways
    Bidirectional(HandlerFn<MessageStream<Req>, MessageStream<Resp>>),
}

impl<Req, Resp> MethodHandler<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Wrap a unary handler
    pub fn unary<F, Fut>(handler: F) -> Self
    where
        F: Fn(RpcCall<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<Resp>> + Send + 'static,
    {
        Self::Unary(Arc::new(move |call: RpcCall<Req>| -> HandlerFuture<Resp> {
            Box::pin(handler(call))
        }))
    }

    /// Wrap a client-streaming handler
    pub fn client_streaming<F, Fut>(handler: F) -> Self
    where
        F: Fn(RpcCall<MessageStream<Req>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<Resp>> + Send + 'static,
    {
        Self::ClientStreaming(Arc::new(move |call: RpcCall<MessageStream<Req>>| -> HandlerFuture<Resp> {
            Box::pin(handler(call))
        }))
    }

    /// Wrap a server-streaming handler
    pub fn server_streaming<F, Fut, S>(handler: F) -> Self
    where
        F: Fn(RpcCall<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<S>> + Send + 'static,
        S: Stream<Item = std::result::Result<Resp, Status>> + Send + 'static,
    {
        Self::ServerStreaming(Arc::new(move |call: RpcCall<Req>| -> HandlerFuture<MessageStream<Resp>> {
            let fut = handler(call);
            Box::pin(async move { fut.await.map(|r| r.map(|s| Box::pin(s) as MessageStream<Resp>)) })
        }))
    }

    /// Wrap a bidirectional handler
    pub fn bidirectional<F, Fut, S>(handler: F) -> Self
    where
        F: Fn(RpcCall<MessageStream<Req>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<S>> + Send + 'static,
        S: Stream<Item = std::result::Result<Resp, Status>> + Send + 'static,
    {
        Self::Bidirectional(Arc::new(
            move |call: RpcCall<MessageStream<Req>>| -> HandlerFuture<MessageStream<Resp>> {
                let fut = handler(call);
                Box::pin(async move { fut.await.map(|r| r.map(|s| Box::pin(s) as MessageStream<Resp>)) })
            },
        ))
    }
}

impl<Req, Resp> MethodHandler<Req, Resp> {
    /// Call shape of the handler
    pub fn call_type(&self) -> CallType {
        match self {
            MethodHandler::Unary(_) => CallType::Unary,
            MethodHandler::ClientStreaming(_) => CallType::ClientStreaming,
            MethodHandler::ServerStreaming(_) => CallType::ServerStreaming,
            MethodHandler::Bidirectional(_) => CallType::Bidirectional,
        }
    }
}

impl<Req, Resp> Clone for MethodHandler<Req, Resp> {
    fn clone(&self) -> Self {
        match self {
            MethodHandler::Unary(h) => MethodHandler::Unary(h.clone()),
            MethodHandler::ClientStreaming(h) => MethodHandler::ClientStreaming(h.clone()),
            MethodHandler::ServerStreaming(h) => MethodHandler::ServerStreaming(h.clone()),
            MethodHandler::Bidirectional(h) => MethodHandler::Bidirectional(h.clone()),
        }
    }
}

impl<Req, Resp> fmt::Debug for MethodHandler<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodHandler({})", self.call_type())
    }
}

/// Handlers of one service keyed by method name
pub struct ServiceImplementation<Req, Resp> {
    methods: BTreeMap<String, MethodHandler<Req, Resp>>,
}

impl<Req, Resp> ServiceImplementation<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Empty implementation
    pub fn new() -> Self {
        Self {
            methods: BTreeMap::new(),
        }
    }

    /// Register a handler; replaces any previous handler for `method`
    pub fn method(mut self, method: impl Into<String>, handler: MethodHandler<Req, Resp>) -> Self {
        self.methods.insert(method.into(), handler);
        self
    }

    /// Register a unary handler
    pub fn unary<F, Fut>(self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(RpcCall<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<Resp>> + Send + 'static,
    {
        self.method(method, MethodHandler::unary(handler))
    }

    /// Register a client-streaming handler
    pub fn client_streaming<F, Fut>(self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(RpcCall<MessageStream<Req>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<Resp>> + Send + 'static,
    {
        self.method(method, MethodHandler::client_streaming(handler))
    }

    /// Register a server-streaming handler
    pub fn server_streaming<F, Fut, S>(self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(RpcCall<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<S>> + Send + 'static,
        S: Stream<Item = std::result::Result<Resp, Status>> + Send + 'static,
    {
        self.method(method, MethodHandler::server_streaming(handler))
    }

    /// Register a bidirectional handler
    pub fn bidirectional<F, Fut, S>(self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(RpcCall<MessageStream<Req>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<S>> + Send + 'static,
        S: Stream<Item = std::result::Result<Resp, Status>> + Send + 'static,
    {
        self.method(method, MethodHandler::bidirectional(handler))
    }
}

impl<Req, Resp> ServiceImplementation<Req, Resp> {
    /// Handler for `method`
    pub fn handler(&self, method: &str) -> Option<&MethodHandler<Req, Resp>> {
        self.methods.get(method)
    }

    /// Method names in order
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Number of methods
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether no method is registered
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl<Req, Resp> Default for ServiceImplementation<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Req, Resp> Clone for ServiceImplementation<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            methods: self.methods.clone(),
        }
    }
}

impl<Req, Resp> fmt::Debug for ServiceImplementation<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.methods.iter()).finish()
    }
}

struct WrappedMethod<Req, Resp> {
    descriptor: CallDescriptor,
    handler: MethodHandler<Req, Resp>,
}

impl<Req, Resp> Clone for WrappedMethod<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            handler: self.handler.clone(),
        }
    }
}

/// A service whose every method runs through a pipeline
pub struct WrappedService<Req, Resp> {
    name: String,
    pipeline: Pipeline,
    methods: BTreeMap<String, WrappedMethod<Req, Resp>>,
}

impl<Req, Resp> WrappedService<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Invoke a unary method
    pub async fn unary(&self, method: &str, request: Request<Req>) -> Outcome<Resp> {
        let wrapped = self.resolve(method)?;
        match &wrapped.handler {
            MethodHandler::Unary(handler) => {
                let handler = handler.clone();
                self.pipeline
                    .unary(&wrapped.descriptor, request, move |call| handler(call))
                    .await
            }
            other => Err(self.wrong_shape(method, other.call_type(), CallType::Unary)),
        }
    }

    /// Invoke a client-streaming method
    pub async fn client_streaming(&self, method: &str, request: Request<MessageStream<Req>>) -> Outcome<Resp> {
        let wrapped = self.resolve(method)?;
        match &wrapped.handler {
            MethodHandler::ClientStreaming(handler) => {
                let handler = handler.clone();
                self.pipeline
                    .client_streaming(&wrapped.descriptor, request, move |call| handler(call))
                    .await
            }
            other => Err(self.wrong_shape(method, other.call_type(), CallType::ClientStreaming)),
        }
    }

    /// Invoke a server-streaming method
    pub async fn server_streaming(&self, method: &str, request: Request<Req>) -> Outcome<MessageStream<Resp>> {
        let wrapped = self.resolve(method)?;
        match &wrapped.handler {
            MethodHandler::ServerStreaming(handler) => {
                let handler = handler.clone();
                self.pipeline
                    .server_streaming(&wrapped.descriptor, request, move |call| handler(call))
                    .await
            }
            other => Err(self.wrong_shape(method, other.call_type(), CallType::ServerStreaming)),
        }
    }

    /// Invoke a bidirectional method
    pub async fn bidirectional(
        &self,
        method: &str,
        request: Request<MessageStream<Req>>,
    ) -> Outcome<MessageStream<Resp>> {
        let wrapped = self.resolve(method)?;
        match &wrapped.handler {
            MethodHandler::Bidirectional(handler) => {
                let handler = handler.clone();
                self.pipeline
                    .bidirectional(&wrapped.descriptor, request, move |call| handler(call))
                    .await
            }
            other => Err(self.wrong_shape(method, other.call_type(), CallType::Bidirectional)),
        }
    }
}

impl<Req, Resp> WrappedService<Req, Resp> {
    /// Fully qualified service name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolved descriptor of `method`
    pub fn descriptor(&self, method: &str) -> Option<&CallDescriptor> {
        self.methods.get(method).map(|m| &m.descriptor)
    }

    /// All resolved descriptors keyed by method name
    pub fn descriptors(&self) -> BTreeMap<String, CallDescriptor> {
        self.methods
            .iter()
            .map(|(name, m)| (name.clone(), m.descriptor.clone()))
            .collect()
    }

    /// Pipeline the service runs through
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    fn resolve(&self, method: &str) -> std::result::Result<&WrappedMethod<Req, Resp>, Status> {
        self.methods.get(method).ok_or_else(|| {
            tracing::debug!(service = %self.name, method, "unknown method");
            Status::unimplemented(format!("method {}/{} is not implemented", self.name, method))
        })
    }

    fn wrong_shape(&self, method: &str, registered: CallType, invoked: CallType) -> Status {
        tracing::warn!(
            service = %self.name,
            method,
            registered = %registered,
            invoked = %invoked,
            "method invoked with the wrong call shape"
        );
        Status::unimplemented(format!(
            "method {}/{} is {}, not {}",
            self.name, method, registered, invoked
        ))
    }
}

impl<Req, Resp> Clone for WrappedService<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            pipeline: self.pipeline.clone(),
            methods: self.methods.clone(),
        }
    }
}

impl<Req, Resp> fmt::Debug for WrappedService<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedService")
            .field("name", &self.name)
            .field("methods", &self.descriptors())
            .finish()
    }
}

impl Pipeline {
    /// Wrap every method of `implementation`
    ///
    /// Each method takes its descriptor from `descriptors` (matched by
    /// method name); methods without one get a synthesized descriptor with
    /// the conventional `/Service/Method` path. A supplied descriptor whose
    /// stream flags disagree with the handler's shape is rejected.
    pub fn wrap_service<Req, Resp>(
        &self,
        name: &str,
        implementation: ServiceImplementation<Req, Resp>,
        descriptors: impl IntoIterator<Item = CallDescriptor>,
    ) -> Result<WrappedService<Req, Resp>> {
        let mut known: BTreeMap<String, CallDescriptor> = descriptors
            .into_iter()
            .map(|d| (d.method_name.clone(), d))
            .collect();

        let mut methods = BTreeMap::new();
        for (method, handler) in implementation.methods {
            let shape = handler.call_type();
            let descriptor = match known.remove(&method) {
                Some(descriptor) => {
                    if descriptor.call_type() != shape {
                        return Err(Error::InvalidDescriptor(format!(
                            "{} is declared {} but implemented as {}",
                            descriptor.path,
                            descriptor.call_type(),
                            shape
                        )));
                    }
                    descriptor
                }
                None => {
                    let synthesized = CallDescriptor::synthesize(name, &method);
                    CallDescriptor {
                        request_stream: matches!(shape, CallType::ClientStreaming | CallType::Bidirectional),
                        response_stream: shape.streams_response(),
                        ..synthesized
                    }
                }
            };
            methods.insert(method, WrappedMethod { descriptor, handler });
        }

        for descriptor in known.values() {
            tracing::debug!(method = %descriptor.path, "descriptor has no implementation");
        }
        tracing::debug!(service = name, methods = methods.len(), "service wrapped");

        Ok(WrappedService {
            name: name.to_string(),
            pipeline: self.clone(),
            methods,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::matches_generated_pattern;
    use crate::middleware::RateLimitMiddleware;
    use crate::pipeline::{Middleware, MiddlewareContext, Next};
    use crate::status::StatusKind;
    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tonic::Code;

    type Json = ServiceImplementation<Value, Value>;

    fn greeter() -> Json {
        Json::new()
            .unary("SayHello", |call| async move {
                let (ctx, message) = call.into_message();
                let name = message["name"].as_str().unwrap_or_default().to_string();
                Ok(Response::new(json!({
                    "message": format!("Echo: {}", name),
                    "trace_id": ctx.trace_id(),
                })))
            })
            .server_streaming("Countdown", |call| async move {
                let from = call.message()["from"].as_u64().unwrap_or(0);
                let items = (0..from).rev().map(|n| Ok(json!({ "n": n })));
                Ok(Response::new(futures::stream::iter(items)))
            })
    }

    #[test]
    fn test_descriptors_resolved_or_synthesized() {
        let declared = CallDescriptor::unary("example.v1.Greeter", "SayHello");
        let service = Pipeline::default()
            .wrap_service("example.v1.Greeter", greeter(), [declared.clone()])
            .unwrap();

        assert_eq!(service.descriptor("SayHello"), Some(&declared));

        let countdown = service.descriptor("Countdown").unwrap();
        assert_eq!(countdown.path, "/example.v1.Greeter/Countdown");
        assert_eq!(countdown.call_type(), CallType::ServerStreaming);
    }

    #[test]
    fn test_mismatched_descriptor_rejected() {
        let declared = CallDescriptor::unary("example.v1.Greeter", "Countdown");
        let err = Pipeline::default()
            .wrap_service("example.v1.Greeter", greeter(), [declared])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDescriptor(_)));
    }

    #[tokio::test]
    async fn test_echo_end_to_end() {
        let service = Pipeline::default()
            .wrap_service("example.v1.Greeter", greeter(), [])
            .unwrap();

        let response = service
            .unary("SayHello", Request::new(json!({ "name": "Hello" })))
            .await
            .unwrap();

        let body = response.get_ref();
        assert_eq!(body["message"], "Echo: Hello");
        let trace_id = body["trace_id"].as_str().unwrap();
        assert!(matches_generated_pattern(trace_id, "grpc"));
        assert_eq!(
            response.metadata().get("x-trace-id").unwrap().to_str().unwrap(),
            trace_id
        );
    }

    #[tokio::test]
    async fn test_bad_request_short_circuit_end_to_end() {
        struct RequireName;

        #[async_trait]
        impl Middleware for RequireName {
            async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<()> {
                let has_name = ctx
                    .request
                    .body::<Value>()
                    .and_then(|body| body["name"].as_str())
                    .is_some_and(|name| !name.is_empty());
                if !has_name {
                    ctx.response.send(StatusKind::BadRequest, "name is required");
                    return Ok(());
                }
                next.run(ctx).await
            }
        }

        let pipeline = Pipeline::builder().layer(RequireName).build();
        let service = pipeline.wrap_service("example.v1.Greeter", greeter(), []).unwrap();

        let status = service
            .unary("SayHello", Request::new(json!({})))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "name is required");

        assert!(service
            .unary("SayHello", Request::new(json!({ "name": "ok" })))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_streaming_method_through_wrapper() {
        let service = Pipeline::default()
            .wrap_service("example.v1.Greeter", greeter(), [])
            .unwrap();

        let response = service
            .server_streaming("Countdown", Request::new(json!({ "from": 3 })))
            .await
            .unwrap();
        let values: Vec<u64> = response
            .into_inner()
            .map(|item| item.unwrap()["n"].as_u64().unwrap())
            .collect()
            .await;
        assert_eq!(values, vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn test_unknown_method_and_wrong_shape() {
        let service = Pipeline::default()
            .wrap_service("example.v1.Greeter", greeter(), [])
            .unwrap();

        let status = service
            .unary("Missing", Request::new(json!({})))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unimplemented);

        let status = service
            .unary("Countdown", Request::new(json!({})))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unimplemented);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrapped_methods_share_pipeline_state() {
        let pipeline = Pipeline::builder()
            .layer(RateLimitMiddleware::new(1, Duration::from_secs(10)))
            .build();
        let service = pipeline.wrap_service("example.v1.Greeter", greeter(), []).unwrap();

        assert!(service
            .unary("SayHello", Request::new(json!({ "name": "a" })))
            .await
            .is_ok());
        let status = service
            .server_streaming("Countdown", Request::new(json!({ "from": 1 })))
            .await
            .err()
            .unwrap();
        assert_eq!(status.code(), Code::ResourceExhausted);
    }
}
