//! In-memory health status registry
//!
//! Follows the vocabulary of the gRPC health checking protocol. The empty
//! service name `""` denotes the overall server.
//! See: https://github.com/grpc/grpc/blob/master/doc/health-checking.md

use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// Key of the overall server status
pub const OVERALL: &str = "";

/// Serving status of a service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServingStatus {
    /// Status not known
    #[default]
    Unknown,
    /// Serving requests
    Serving,
    /// Not serving requests
    NotServing,
    /// No such service
    ServiceUnknown,
}

impl fmt::Display for ServingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServingStatus::Unknown => "UNKNOWN",
            ServingStatus::Serving => "SERVING",
            ServingStatus::NotServing => "NOT_SERVING",
            ServingStatus::ServiceUnknown => "SERVICE_UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Health status per service name
#[derive(Debug)]
pub struct HealthRegistry {
    statuses: RwLock<HashMap<String, ServingStatus>>,
}

impl HealthRegistry {
    /// Registry with the overall server marked serving
    pub fn new() -> Self {
        let mut statuses = HashMap::new();
        statuses.insert(OVERALL.to_string(), ServingStatus::Serving);
        Self {
            statuses: RwLock::new(statuses),
        }
    }

    /// Status of `service`; unknown names report `ServiceUnknown`
    pub fn get(&self, service: &str) -> ServingStatus {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .copied()
            .unwrap_or(ServingStatus::ServiceUnknown)
    }

    /// Set the status of `service`
    pub fn set(&self, service: &str, status: ServingStatus) {
        let previous = self
            .statuses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service.to_string(), status);
        if previous != Some(status) {
            tracing::info!(
                service = if service.is_empty() { "<overall>" } else { service },
                status = %status,
                "health status changed"
            );
        }
    }

    /// Set every known service, including the overall entry
    pub fn set_all(&self, status: ServingStatus) {
        let mut statuses = self.statuses.write().unwrap_or_else(PoisonError::into_inner);
        for value in statuses.values_mut() {
            *value = status;
        }
        tracing::info!(status = %status, services = statuses.len(), "health status changed for all services");
    }

    /// Whether the overall server is serving
    pub fn is_serving(&self) -> bool {
        self.get(OVERALL) == ServingStatus::Serving
    }

    /// Snapshot of all statuses
    pub fn snapshot(&self) -> HashMap<String, ServingStatus> {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}
