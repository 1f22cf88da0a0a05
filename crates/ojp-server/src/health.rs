//! Per-service health registry and its gRPC surface
//!
//! The registry is an explicit lifecycle object created at startup and
//! passed by reference into whatever needs it; there are no ambient
//! global reads. Load balancers and probes consult the gRPC `Check` call.

use crate::error::ServerError;
use dashmap::DashMap;
use ojp_proto::health_check_response::ServingStatus as PbServingStatus;
use ojp_proto::health_service_server::HealthService;
use ojp_proto::{HealthCheckRequest, HealthCheckResponse};
use std::sync::Arc;
use tonic::{Request, Response, Status};

/// The proxy's own serving status.
pub const OJP_SERVER: &str = "OJP_SERVER";
/// Status of the telemetry export pipeline.
pub const OPENTELEMETRY_SERVICE: &str = "OPENTELEMETRY_SERVICE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingStatus {
    Unknown,
    Serving,
    NotServing,
}

impl ServingStatus {
    fn to_pb(self) -> PbServingStatus {
        match self {
            ServingStatus::Unknown => PbServingStatus::Unknown,
            ServingStatus::Serving => PbServingStatus::Serving,
            ServingStatus::NotServing => PbServingStatus::NotServing,
        }
    }
}

/// Name → status map for the named sub-services.
#[derive(Default)]
pub struct HealthRegistry {
    statuses: DashMap<String, ServingStatus>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, service: &str, status: ServingStatus) {
        self.statuses.insert(service.to_string(), status);
    }

    /// Unregistered services report Unknown.
    pub fn get(&self, service: &str) -> ServingStatus {
        self.statuses
            .get(service)
            .map(|s| *s)
            .unwrap_or(ServingStatus::Unknown)
    }
}

/// gRPC surface over the registry.
pub struct HealthServiceImpl {
    registry: Arc<HealthRegistry>,
}

impl HealthServiceImpl {
    pub fn new(registry: Arc<HealthRegistry>) -> Self {
        Self { registry }
    }
}

#[tonic::async_trait]
impl HealthService for HealthServiceImpl {
    async fn check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let service = request.into_inner().service;
        if service.is_empty() {
            return Err(ServerError::InvalidArgument("missing service name".to_string()).into());
        }
        let status = self.registry.get(&service);
        Ok(Response::new(HealthCheckResponse {
            status: status.to_pb() as i32,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_until_set() {
        let registry = HealthRegistry::new();
        assert_eq!(registry.get(OJP_SERVER), ServingStatus::Unknown);

        registry.set(OJP_SERVER, ServingStatus::Serving);
        assert_eq!(registry.get(OJP_SERVER), ServingStatus::Serving);

        registry.set(OJP_SERVER, ServingStatus::NotServing);
        assert_eq!(registry.get(OJP_SERVER), ServingStatus::NotServing);
    }

    #[tokio::test]
    async fn test_check_reports_registry_state() {
        let registry = Arc::new(HealthRegistry::new());
        registry.set(OJP_SERVER, ServingStatus::Serving);
        registry.set(OPENTELEMETRY_SERVICE, ServingStatus::NotServing);
        let service = HealthServiceImpl::new(registry);

        let response = service
            .check(Request::new(HealthCheckRequest {
                service: OJP_SERVER.to_string(),
            }))
            .await
            .unwrap();
        assert_eq!(response.into_inner().status, PbServingStatus::Serving as i32);

        let response = service
            .check(Request::new(HealthCheckRequest {
                service: "unregistered".to_string(),
            }))
            .await
            .unwrap();
        assert_eq!(response.into_inner().status, PbServingStatus::Unknown as i32);
    }
}
