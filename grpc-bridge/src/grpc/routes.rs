//! Serving wrapped services over tonic
//!
//! [`GrpcService`] is the transport face of a [`WrappedService`]: it decodes
//! requests with [`JsonCodec`], picks the method from the request path and
//! runs it through the service's pipeline. Unknown methods answer
//! `unimplemented`.

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tonic::server::{ClientStreamingService, Grpc, ServerStreamingService, StreamingService, UnaryService};
use tonic::{Request, Response, Status, Streaming};
use tower::Service;

use crate::descriptor::{CallDescriptor, CallType};
use crate::grpc::codec::JsonCodec;
use crate::pipeline::MessageStream;
use crate::service::WrappedService;

type HttpResponse = http::Response<tonic::body::Body>;

/// tower service routing gRPC requests into a [`WrappedService`]
pub struct GrpcService<Req, Resp> {
    service: Arc<WrappedService<Req, Resp>>,
}

impl<Req, Resp> GrpcService<Req, Resp> {
    /// Serve `service`
    pub fn new(service: Arc<WrappedService<Req, Resp>>) -> Self {
        Self { service }
    }

    /// Route path matching every method of the service
    pub fn route_path(&self) -> String {
        format!("/{}/{{method}}", self.service.name())
    }

    fn resolve(&self, path: &str) -> Option<(String, CallType)> {
        let parsed = CallDescriptor::from_path(path, false, false).ok()?;
        if parsed.service_name != self.service.name() {
            return None;
        }
        let call_type = self.service.descriptor(&parsed.method_name)?.call_type();
        Some((parsed.method_name, call_type))
    }
}

impl<Req, Resp> Clone for GrpcService<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
        }
    }
}

impl<Req, Resp> fmt::Debug for GrpcService<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpcService")
            .field("service", &self.service.name())
            .finish()
    }
}

impl<Req, Resp> Service<http::Request<axum::body::Body>> for GrpcService<Req, Resp>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    type Response = HttpResponse;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<HttpResponse, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<axum::body::Body>) -> Self::Future {
        let path = req.uri().path().to_string();
        let Some((method, call_type)) = self.resolve(&path) else {
            tracing::debug!(path = %path, "no such method");
            let response: HttpResponse =
                Status::unimplemented(format!("method {} is not implemented", path)).into_http();
            return Box::pin(async move { Ok(response) });
        };

        let call = MethodCall {
            service: self.service.clone(),
            method,
        };
        Box::pin(async move {
            let mut grpc = Grpc::new(JsonCodec::<Resp, Req>::default());
            let response = match call_type {
                CallType::Unary => grpc.unary(call, req).await,
                CallType::ClientStreaming => grpc.client_streaming(call, req).await,
                CallType::ServerStreaming => grpc.server_streaming(call, req).await,
                CallType::Bidirectional => grpc.streaming(call, req).await,
            };
            Ok(response)
        })
    }
}

/// One method of a wrapped service, adapted to tonic's handler traits
struct MethodCall<Req, Resp> {
    service: Arc<WrappedService<Req, Resp>>,
    method: String,
}

fn incoming<Req: Send + 'static>(request: Request<Streaming<Req>>) -> Request<MessageStream<Req>> {
    request.map(|stream| Box::pin(stream) as MessageStream<Req>)
}

impl<Req, Resp> UnaryService<Req> for MethodCall<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Response = Resp;
    type Future = BoxFuture<'static, Result<Response<Resp>, Status>>;

    fn call(&mut self, request: Request<Req>) -> Self::Future {
        let service = self.service.clone();
        let method = self.method.clone();
        Box::pin(async move { service.unary(&method, request).await })
    }
}

impl<Req, Resp> ClientStreamingService<Req> for MethodCall<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Response = Resp;
    type Future = BoxFuture<'static, Result<Response<Resp>, Status>>;

    fn call(&mut self, request: Request<Streaming<Req>>) -> Self::Future {
        let service = self.service.clone();
        let method = self.method.clone();
        Box::pin(async move { service.client_streaming(&method, incoming(request)).await })
    }
}

impl<Req, Resp> ServerStreamingService<Req> for MethodCall<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Response = Resp;
    type ResponseStream = MessageStream<Resp>;
    type Future = BoxFuture<'static, Result<Response<MessageStream<Resp>>, Status>>;

    fn call(&mut self, request: Request<Req>) -> Self::Future {
        let service = self.service.clone();
        let method = self.method.clone();
        Box::pin(async move { service.server_streaming(&method, request).await })
    }
}

impl<Req, Resp> StreamingService<Req> for MethodCall<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Response = Resp;
    type ResponseStream = MessageStream<Resp>;
    type Future = BoxFuture<'static, Result<Response<MessageStream<Resp>>, Status>>;

    fn call(&mut self, request: Request<Streaming<Req>>) -> Self::Future {
        let service = self.service.clone();
        let method = self.method.clone();
        Box::pin(async move { service.bidirectional(&method, incoming(request)).await })
    }
}
