//! The request/response view middleware operates on
//!
//! gRPC calls are presented to middleware the way an HTTP framework presents
//! a request: method, path, headers, route params, body and client address,
//! plus a response with a status, headers and a "sent" flag. The pipeline
//! translates the final response view back into a gRPC status.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::context::RequestContext;
use crate::descriptor::{CallDescriptor, CallType};
use crate::metadata::Metadata;
use crate::status::StatusKind;

/// Where an invocation is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    /// The call arrived and the view was built
    Received,
    /// The request context is attached
    ContextEstablished,
    /// Middleware is running
    MiddlewareRunning,
    /// A middleware sent a response before the handler ran
    ShortCircuited,
    /// The handler was invoked
    HandlerInvoked,
    /// The outcome was delivered
    Completed,
}

/// Route parameters derived from the method path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteParams {
    /// Fully qualified service name
    pub service: String,
    /// Method name
    pub method: String,
}

/// Streaming characteristics of the call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingInfo {
    /// Client streams messages
    pub request_stream: bool,
    /// Server streams messages
    pub response_stream: bool,
    /// Derived call shape
    pub call_type: CallType,
}

/// Incoming call as seen by middleware
pub struct RequestView {
    /// Always `POST`; gRPC calls are HTTP/2 POSTs
    pub method: String,
    /// Full method path
    pub path: String,
    /// Incoming metadata
    pub headers: Metadata,
    /// Query parameters (gRPC has none, kept for middleware written against
    /// HTTP-style requests)
    pub query: BTreeMap<String, String>,
    /// Service and method names
    pub params: RouteParams,
    /// Peer address
    pub client_address: String,
    /// Protocol tag
    pub protocol: String,
    /// Streaming flags
    pub streaming: StreamingInfo,
    body: Option<Box<dyn Any + Send>>,
}

impl RequestView {
    pub(crate) fn new(
        descriptor: &CallDescriptor,
        context: &RequestContext,
        protocol: &str,
        body: Box<dyn Any + Send>,
    ) -> Self {
        Self {
            method: "POST".to_string(),
            path: descriptor.path.clone(),
            headers: context.metadata().clone(),
            query: BTreeMap::new(),
            params: RouteParams {
                service: descriptor.service_name.clone(),
                method: descriptor.method_name.clone(),
            },
            client_address: context.peer().to_string(),
            protocol: protocol.to_string(),
            streaming: StreamingInfo {
                request_stream: descriptor.request_stream,
                response_stream: descriptor.response_stream,
                call_type: descriptor.call_type(),
            },
            body: Some(body),
        }
    }

    /// The request message, if it has type `T`
    ///
    /// For client-streaming calls the body is the incoming message stream.
    pub fn body<T: 'static>(&self) -> Option<&T> {
        self.body.as_ref().and_then(|body| body.downcast_ref())
    }

    /// Mutable access to the request message
    pub fn body_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.body.as_mut().and_then(|body| body.downcast_mut())
    }

    /// Whether a body is still attached
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    pub(crate) fn take_body<T: 'static>(&mut self) -> Option<T> {
        let body = self.body.take()?;
        match body.downcast::<T>() {
            Ok(body) => Some(*body),
            Err(body) => {
                self.body = Some(body);
                None
            }
        }
    }
}

impl fmt::Debug for RequestView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestView")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("headers", &self.headers)
            .field("params", &self.params)
            .field("client_address", &self.client_address)
            .field("protocol", &self.protocol)
            .field("streaming", &self.streaming)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

/// Outgoing response as seen by middleware
#[derive(Debug, Clone, Default)]
pub struct ResponseView {
    status: StatusKind,
    message: Option<String>,
    /// Extra response metadata
    pub headers: Metadata,
    sent: bool,
}

impl ResponseView {
    /// Current status
    pub fn status(&self) -> StatusKind {
        self.status
    }

    /// Status message, if any
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Whether a terminal response has been produced
    pub fn is_sent(&self) -> bool {
        self.sent
    }

    /// Set the status without sending
    ///
    /// Ignored once the response is sent.
    pub fn set_status(&mut self, status: StatusKind) {
        if self.sent {
            tracing::debug!(status = %status, "response already sent, status change ignored");
            return;
        }
        self.status = status;
    }

    /// Produce a terminal response
    ///
    /// Sending twice keeps the first outcome. Only error statuses can end a
    /// call without its handler; a middleware that sends `Ok` and returns
    /// without calling `next` fails the call with `internal`.
    pub fn send(&mut self, status: StatusKind, message: impl Into<String>) {
        if self.sent {
            tracing::debug!(status = %status, "response already sent");
            return;
        }
        self.status = status;
        self.message = Some(message.into());
        self.sent = true;
    }

    pub(crate) fn complete(&mut self, status: StatusKind, message: Option<String>) {
        self.status = status;
        self.message = message;
        self.sent = true;
    }
}

/// Everything a middleware sees for one call
pub struct MiddlewareContext {
    /// Request view
    pub request: RequestView,
    /// Response view
    pub response: ResponseView,
    items: http::Extensions,
    context: Arc<RequestContext>,
    state: InvocationState,
}

impl MiddlewareContext {
    pub(crate) fn new(
        context: Arc<RequestContext>,
        descriptor: &CallDescriptor,
        protocol: &str,
        body: Box<dyn Any + Send>,
    ) -> Self {
        Self {
            request: RequestView::new(descriptor, &context, protocol, body),
            response: ResponseView::default(),
            items: http::Extensions::new(),
            context,
            state: InvocationState::Received,
        }
    }

    /// Request context of the call
    pub fn context(&self) -> &Arc<RequestContext> {
        &self.context
    }

    /// Invocation state
    pub fn state(&self) -> InvocationState {
        self.state
    }

    /// Typed item store shared by middleware for the duration of the call
    pub fn items(&self) -> &http::Extensions {
        &self.items
    }

    /// Mutable item store
    pub fn items_mut(&mut self) -> &mut http::Extensions {
        &mut self.items
    }

    pub(crate) fn set_state(&mut self, state: InvocationState) {
        tracing::trace!(from = ?self.state, to = ?state, "invocation state");
        self.state = state;
    }
}

impl fmt::Debug for MiddlewareContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareContext")
            .field("request", &self.request)
            .field("response", &self.response)
            .field("trace_id", &self.context.trace_id())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextFactory;

    fn middleware_context(body: Box<dyn Any + Send>) -> MiddlewareContext {
        let descriptor = CallDescriptor::unary("example.v1.Greeter", "SayHello");
        let context = ContextFactory::default()
            .create_context(&tonic::Request::new(()), &descriptor)
            .unwrap();
        MiddlewareContext::new(Arc::new(context), &descriptor, "grpc", body)
    }

    #[test]
    fn test_request_view_fields() {
        let ctx = middleware_context(Box::new("hello".to_string()));
        assert_eq!(ctx.request.method, "POST");
        assert_eq!(ctx.request.path, "/example.v1.Greeter/SayHello");
        assert_eq!(ctx.request.params.service, "example.v1.Greeter");
        assert_eq!(ctx.request.params.method, "SayHello");
        assert_eq!(ctx.request.client_address, "unknown");
        assert!(ctx.request.query.is_empty());
        assert_eq!(ctx.request.streaming.call_type, CallType::Unary);
        assert_eq!(ctx.state(), InvocationState::Received);
    }

    #[test]
    fn test_body_downcast() {
        let mut ctx = middleware_context(Box::new("hello".to_string()));
        assert_eq!(ctx.request.body::<String>().map(String::as_str), Some("hello"));
        assert!(ctx.request.body::<u32>().is_none());

        ctx.request.body_mut::<String>().unwrap().push('!');
        assert!(ctx.request.take_body::<u32>().is_none());
        assert!(ctx.request.has_body());
        assert_eq!(ctx.request.take_body::<String>().as_deref(), Some("hello!"));
        assert!(!ctx.request.has_body());
    }

    #[test]
    fn test_send_is_terminal() {
        let mut response = ResponseView::default();
        response.set_status(StatusKind::NotFound);
        assert!(!response.is_sent());

        response.send(StatusKind::BadRequest, "missing name");
        response.send(StatusKind::Internal, "ignored");
        response.set_status(StatusKind::Ok);

        assert!(response.is_sent());
        assert_eq!(response.status(), StatusKind::BadRequest);
        assert_eq!(response.message(), Some("missing name"));
    }

    #[test]
    fn test_item_store() {
        #[derive(Clone, Debug, PartialEq)]
        struct Tenant(&'static str);

        let mut ctx = middleware_context(Box::new(()));
        ctx.items_mut().insert(Tenant("acme"));
        assert_eq!(ctx.items().get::<Tenant>(), Some(&Tenant("acme")));
    }
}
