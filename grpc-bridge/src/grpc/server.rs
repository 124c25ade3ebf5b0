//! gRPC server host
//!
//! [`RpcServer`] binds the configured address, reports a [`ServerInfo`],
//! drives the [`LifecycleHooks`] and serves tonic routes behind the
//! [`TransportSignalLayer`] until a shutdown signal arrives.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::service::Routes;
use tonic::transport::Server;

use crate::config::Config;
use crate::error::Result;
use crate::grpc::health::{HealthRegistry, ServingStatus};
use crate::grpc::middleware::TransportSignalLayer;
use crate::registry::ServiceRegistry;

const MIN_FRAME_SIZE: usize = 16_384;
const MAX_FRAME_SIZE: usize = 16_777_215;

/// Where a started server can be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Protocol tag from configuration
    pub protocol: String,
    /// Bound host
    pub host: String,
    /// Bound port
    pub port: u16,
    /// `http://host:port`
    pub url: String,
    /// Free-form server metadata
    pub metadata: BTreeMap<String, String>,
}

/// Hooks run around the server lifecycle
///
/// All hooks default to doing nothing.
#[async_trait]
pub trait LifecycleHooks: Send + Sync + 'static {
    /// Before anything else, with the effective configuration
    async fn on_init(&self, _config: &Config) -> Result<()> {
        Ok(())
    }

    /// Before the listener is bound
    async fn before_start(&self) -> Result<()> {
        Ok(())
    }

    /// After the listener is bound
    async fn after_start(&self, _info: &ServerInfo) -> Result<()> {
        Ok(())
    }

    /// Once shutdown has been requested, before connections drain
    async fn before_stop(&self) {}

    /// After the server has stopped
    async fn after_stop(&self) {}
}

/// Hooks that do nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl LifecycleHooks for NoopHooks {}

/// tonic server with health tracking and lifecycle hooks
pub struct RpcServer {
    config: Config,
    health: Arc<HealthRegistry>,
    hooks: Arc<dyn LifecycleHooks>,
}

impl RpcServer {
    /// Create a server for `config`
    pub fn new(config: Config) -> Self {
        Self {
            config,
            health: Arc::new(HealthRegistry::new()),
            hooks: Arc::new(NoopHooks),
        }
    }

    /// Install lifecycle hooks
    pub fn with_hooks(mut self, hooks: impl LifecycleHooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Share a health registry, typically the one of a
    /// [`ServiceRegistry`](crate::registry::ServiceRegistry)
    pub fn with_health(mut self, health: Arc<HealthRegistry>) -> Self {
        self.health = health;
        self
    }

    /// Configuration in use
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Health registry updated on start and stop
    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    /// tonic builder configured from the `grpc` section
    pub fn server_builder(&self) -> Server {
        let grpc = &self.config.grpc;
        let frame_size = grpc.max_message_size_bytes().clamp(MIN_FRAME_SIZE, MAX_FRAME_SIZE);

        let mut builder = Server::builder()
            .max_frame_size(Some(frame_size as u32))
            .http2_keepalive_interval(grpc.keepalive_interval())
            .http2_keepalive_timeout(Some(grpc.keepalive_timeout()));
        if let Some(timeout) = grpc.timeout() {
            builder = builder.timeout(timeout);
        }
        builder
    }

    /// Serve `routes` until SIGINT or SIGTERM
    pub async fn serve(self, routes: Routes) -> Result<()> {
        self.serve_with_shutdown(routes, shutdown_signal()).await
    }

    /// Serve every service in `registry` until SIGINT or SIGTERM
    ///
    /// The server shares the registry's health entries.
    pub async fn serve_registry(self, registry: &ServiceRegistry) -> Result<()> {
        self.serve_registry_with_shutdown(registry, shutdown_signal()).await
    }

    /// Serve every service in `registry` until `signal` resolves
    pub async fn serve_registry_with_shutdown<F>(self, registry: &ServiceRegistry, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let routes = registry.routes();
        self.with_health(registry.health().clone())
            .serve_with_shutdown(routes, signal)
            .await
    }

    /// Serve `routes` until `signal` resolves
    ///
    /// On shutdown every health entry is marked `NOT_SERVING` before in-flight
    /// calls drain.
    pub async fn serve_with_shutdown<F>(self, routes: Routes, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.hooks.on_init(&self.config).await?;
        self.hooks.before_start().await?;

        let listener = TcpListener::bind(self.config.bind_address()).await?;
        let local = listener.local_addr()?;
        let info = ServerInfo {
            protocol: self.config.service.protocol.clone(),
            host: self.config.service.host.clone(),
            port: local.port(),
            url: format!("http://{}:{}", self.config.service.host, local.port()),
            metadata: self.config.grpc.metadata.clone(),
        };

        tracing::info!(
            service = %self.config.service.name,
            url = %info.url,
            "gRPC server listening"
        );
        self.health.set(super::health::OVERALL, ServingStatus::Serving);
        self.hooks.after_start(&info).await?;

        let health = self.health.clone();
        let hooks = self.hooks.clone();
        let shutdown = async move {
            signal.await;
            tracing::info!("Shutdown signal received, draining requests...");
            health.set_all(ServingStatus::NotServing);
            hooks.before_stop().await;
        };

        let result = self
            .server_builder()
            .layer(TransportSignalLayer::new())
            .add_routes(routes)
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
            .await;

        self.hooks.after_stop().await;
        result?;

        tracing::info!(service = %self.config.service.name, "gRPC server shutdown complete");
        Ok(())
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("bind_address", &self.config.bind_address())
            .field("health", &self.health)
            .finish()
    }
}

/// Wait for SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C), starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
