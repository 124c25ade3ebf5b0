//! Hosting on a tonic server
//!
//! - [`server`]: binds, runs lifecycle hooks and shuts down gracefully
//! - [`routes`]: routes requests into wrapped services
//! - [`codec`]: JSON message codec
//! - [`middleware`]: tower layer feeding transport events into each call
//! - [`health`]: per-service serving status
//!
//! ## Example
//!
//! ```rust,no_run
//! use grpc_bridge::config::Config;
//! use grpc_bridge::grpc::RpcServer;
//! use grpc_bridge::registry::ServiceRegistry;
//!
//! # async fn example(registry: ServiceRegistry) -> grpc_bridge::Result<()> {
//! let config = Config::load()?;
//!
//! RpcServer::new(config).serve_registry(&registry).await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod health;
pub mod middleware;
pub mod routes;
pub mod server;

pub use codec::JsonCodec;

pub use health::{HealthRegistry, ServingStatus};
pub use middleware::{TransportSignalLayer, TransportSignalService};
pub use routes::GrpcService;
pub use server::{shutdown_signal, LifecycleHooks, NoopHooks, RpcServer, ServerInfo};
