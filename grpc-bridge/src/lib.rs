//! # grpc-bridge
//!
//! Request-context bridge and interceptor pipeline for tonic gRPC services.
//!
//! Every RPC, whether unary, client-streaming, server-streaming or
//! bidirectional, runs inside an explicit [`RequestContext`](context::RequestContext)
//! carrying trace and request ids, caller identity, the call deadline and a
//! cooperative cancellation token. An ordered chain of middleware wraps each
//! handler and may short-circuit it; errors from any layer resolve to a
//! `tonic::Status`.
//!
//! ## Features
//!
//! - **Context bridge**: ids from metadata or generated, `grpc-timeout`
//!   deadlines, transport cancellation signals
//! - **Pipeline**: ordered middleware, short-circuit responses, pluggable
//!   error translation, panic recovery
//! - **Built-in middleware**: logging, advisory timeouts, sliding-window
//!   rate limiting
//! - **Registry**: wraps service implementations and tracks health
//! - **Hosting**: tonic server with lifecycle hooks and graceful shutdown,
//!   registered services routed by `/Service/Method` with a JSON codec
//!
//! ## Example
//!
//! ```rust,no_run
//! use grpc_bridge::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let registry = ServiceRegistry::new(Pipeline::from_config(&config));
//!     let greeter = registry.register(
//!         "example.v1.Greeter",
//!         [CallDescriptor::unary("example.v1.Greeter", "SayHello")],
//!         ServiceImplementation::new().unary("SayHello", |call: RpcCall<String>| async move {
//!             let (_ctx, name) = call.into_message();
//!             Ok(Response::new(format!("Hello {}", name)))
//!         }),
//!     )?;
//!     let reply = greeter.unary("SayHello", Request::new("Ada".to_string())).await?;
//!     tracing::info!(reply = %reply.get_ref(), "called");
//!
//!     RpcServer::new(config).serve_registry(&registry).await
//! }
//! ```

pub mod cancellation;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod grpc;
pub mod ids;
pub mod metadata;
pub mod middleware;
pub mod observability;
pub mod pipeline;
pub mod registry;
pub mod service;
pub mod status;

pub use error::{Error, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{CallSignals, CancelReason, CancellationToken, TransportEvent};
    pub use crate::config::Config;
    pub use crate::context::{ContextFactory, ContextValue, RequestContext};
    pub use crate::descriptor::{CallDescriptor, CallType};
    pub use crate::error::{Error, Result};
    pub use crate::grpc::{
        GrpcService, HealthRegistry, JsonCodec, LifecycleHooks, RpcServer, ServerInfo, ServingStatus,
        TransportSignalLayer,
    };
    pub use crate::ids::{IdGenerator, PrefixedIdGenerator};
    pub use crate::metadata::{HeaderNames, Metadata};
    pub use crate::middleware::{LoggingMiddleware, RateLimitMiddleware, TimeoutMiddleware};
    pub use crate::observability::{init_tracing, shutdown_tracing};
    pub use crate::pipeline::{
        MessageStream, Middleware, MiddlewareContext, Next, Pipeline, PipelineBuilder, RpcCall,
    };
    pub use crate::registry::ServiceRegistry;
    pub use crate::service::{ServiceImplementation, WrappedService};
    pub use crate::status::{default_error_transformer, StatusKind};

    pub use async_trait::async_trait;
    pub use tonic::{Code, Request, Response, Status};
}
