//! Service registration
//!
//! Registering a service wraps its implementation with the registry's
//! pipeline, keeps the raw implementation alongside, and marks the service
//! as serving in the health registry. [`ServiceRegistry::routes`] mounts
//! every registered service for a tonic server.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tonic::service::Routes;

use crate::descriptor::CallDescriptor;
use crate::error::{Error, Result};
use crate::grpc::health::{HealthRegistry, ServingStatus};
use crate::grpc::routes::GrpcService;
use crate::pipeline::Pipeline;
use crate::service::{ServiceImplementation, WrappedService};

struct RegisteredService {
    descriptors: BTreeMap<String, CallDescriptor>,
    raw: Arc<dyn Any + Send + Sync>,
    wrapped: Arc<dyn Any + Send + Sync>,
    mount: Arc<dyn Fn(axum::Router) -> axum::Router + Send + Sync>,
}

/// Registered services and their health
pub struct ServiceRegistry {
    pipeline: Pipeline,
    services: RwLock<BTreeMap<String, RegisteredService>>,
    health: Arc<HealthRegistry>,
}

impl ServiceRegistry {
    /// Registry wrapping services with `pipeline`
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            services: RwLock::new(BTreeMap::new()),
            health: Arc::new(HealthRegistry::new()),
        }
    }

    /// Register a service
    ///
    /// Re-registering a name replaces the previous entry. Names are
    /// protobuf full names: letters, digits, `_` and `.`.
    pub fn register<Req, Resp>(
        &self,
        name: &str,
        descriptors: impl IntoIterator<Item = CallDescriptor>,
        implementation: ServiceImplementation<Req, Resp>,
    ) -> Result<Arc<WrappedService<Req, Resp>>>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        validate_name(name)?;
        let raw = Arc::new(implementation.clone());
        let wrapped = Arc::new(self.pipeline.wrap_service(name, implementation, descriptors)?);

        let service = GrpcService::new(wrapped.clone());
        let entry = RegisteredService {
            descriptors: wrapped.descriptors(),
            raw,
            wrapped: wrapped.clone(),
            mount: Arc::new(move |router: axum::Router| {
                router.route_service(&service.route_path(), service.clone())
            }),
        };
        let replaced = self
            .services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), entry)
            .is_some();
        if replaced {
            tracing::warn!(service = name, "service registered twice, replacing");
        }

        self.health.set(name, ServingStatus::Serving);
        tracing::info!(service = name, methods = wrapped.descriptors().len(), "service registered");

        Ok(wrapped)
    }

    /// Wrapped service, if registered with these message types
    pub fn wrapped<Req, Resp>(&self, name: &str) -> Option<Arc<WrappedService<Req, Resp>>>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let entry = self.read().get(name)?.wrapped.clone();
        entry.downcast().ok()
    }

    /// Raw implementation, if registered with these message types
    pub fn raw<Req, Resp>(&self, name: &str) -> Option<Arc<ServiceImplementation<Req, Resp>>>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let entry = self.read().get(name)?.raw.clone();
        entry.downcast().ok()
    }

    /// Descriptors of a registered service
    pub fn descriptors(&self, name: &str) -> Option<BTreeMap<String, CallDescriptor>> {
        self.read().get(name).map(|s| s.descriptors.clone())
    }

    /// Find the descriptor serving a `/Service/Method` path
    pub fn find_descriptor(&self, path: &str) -> Option<CallDescriptor> {
        let parsed = CallDescriptor::from_path(path, false, false).ok()?;
        self.read()
            .get(&parsed.service_name)?
            .descriptors
            .get(&parsed.method_name)
            .cloned()
    }

    /// Routes serving every registered service
    ///
    /// Services registered afterwards are not included.
    pub fn routes(&self) -> Routes {
        let router = self
            .read()
            .values()
            .fold(axum::Router::new(), |router, service| (service.mount)(router));
        Routes::from(router)
    }

    /// Registered service names in order
    pub fn service_names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Remove a service; its health becomes unknown
    pub fn deregister(&self, name: &str) -> bool {
        let removed = self
            .services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        if removed {
            self.health.set(name, ServingStatus::ServiceUnknown);
        }
        removed
    }

    /// Health registry shared with the server
    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    /// Health of `service` (`""` for the overall server)
    pub fn get_health(&self, service: &str) -> ServingStatus {
        self.health.get(service)
    }

    /// Set the health of `service`
    pub fn set_health(&self, service: &str, status: ServingStatus) {
        self.health.set(service, status);
    }

    /// Pipeline used for registration
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, RegisteredService>> {
        self.services.read().unwrap_or_else(PoisonError::into_inner)
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidDescriptor(format!("invalid service name {:?}", name)))
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(Pipeline::default())
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.service_names())
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::{Request, Response};

    fn greeter() -> ServiceImplementation<String, String> {
        ServiceImplementation::new().unary("SayHello", |call| async move {
            let (_ctx, name) = call.into_message();
            Ok(Response::new(format!("Hello {}", name)))
        })
    }

    #[tokio::test]
    async fn test_register_and_invoke() {
        let registry = ServiceRegistry::default();
        registry
            .register(
                "example.v1.Greeter",
                [CallDescriptor::unary("example.v1.Greeter", "SayHello")],
                greeter(),
            )
            .unwrap();

        let service = registry
            .wrapped::<String, String>("example.v1.Greeter")
            .unwrap();
        let response = service
            .unary("SayHello", Request::new("Ada".to_string()))
            .await
            .unwrap();
        assert_eq!(response.get_ref(), "Hello Ada");

        let raw = registry.raw::<String, String>("example.v1.Greeter").unwrap();
        assert_eq!(raw.method_names().collect::<Vec<_>>(), vec!["SayHello"]);
    }

    #[test]
    fn test_wrong_message_types_yield_none() {
        let registry = ServiceRegistry::default();
        registry.register("example.v1.Greeter", [], greeter()).unwrap();
        assert!(registry.wrapped::<u32, u32>("example.v1.Greeter").is_none());
        assert!(registry.wrapped::<String, String>("example.v1.Other").is_none());
    }

    #[test]
    fn test_registration_updates_health() {
        let registry = ServiceRegistry::default();
        assert_eq!(registry.get_health("example.v1.Greeter"), ServingStatus::ServiceUnknown);

        registry.register("example.v1.Greeter", [], greeter()).unwrap();
        assert_eq!(registry.get_health("example.v1.Greeter"), ServingStatus::Serving);
        assert_eq!(registry.get_health(""), ServingStatus::Serving);

        registry.set_health("example.v1.Greeter", ServingStatus::NotServing);
        assert_eq!(registry.get_health("example.v1.Greeter"), ServingStatus::NotServing);

        assert!(registry.deregister("example.v1.Greeter"));
        assert_eq!(registry.get_health("example.v1.Greeter"), ServingStatus::ServiceUnknown);
        assert!(registry.service_names().is_empty());
    }

    #[test]
    fn test_find_descriptor() {
        let registry = ServiceRegistry::default();
        registry.register("example.v1.Greeter", [], greeter()).unwrap();

        let found = registry.find_descriptor("/example.v1.Greeter/SayHello").unwrap();
        assert_eq!(found.method_name, "SayHello");
        assert!(registry.find_descriptor("/example.v1.Greeter/Missing").is_none());
        assert!(registry.find_descriptor("garbage").is_none());
    }

    #[test]
    fn test_invalid_service_name_is_rejected() {
        let registry = ServiceRegistry::default();
        for name in ["", "example/Greeter", "example.{v1}", ".example"] {
            assert!(matches!(
                registry.register(name, [], greeter()),
                Err(Error::InvalidDescriptor(_))
            ));
        }
        assert!(registry.service_names().is_empty());
    }
}
