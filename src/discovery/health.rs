use tonic::{Request, Response, Status};
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::{HealthCheckRequest, HealthCheckResponse};
use tracing::debug;

/// Services answered as serving by the capture endpoint
const CAPTURE_SERVICES: [&str; 3] = [
    "",
    "nimbus.faas.v1.FaasService",
    "nimbus.resource.v1.ResourceService",
];

/// Health service for the capture endpoint
///
/// Handler SDKs may probe the endpoint before opening their trigger stream. The
/// endpoint only exists while a discovery run is active, so the capture services
/// always report `SERVING`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CaptureHealth;

#[tonic::async_trait]
impl tonic_health::pb::health_server::Health for CaptureHealth {
    type WatchStream =
        tokio_stream::wrappers::ReceiverStream<Result<HealthCheckResponse, Status>>;

    async fn check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let service = request.into_inner().service;
        debug!(service = %service, "Health check");

        let status = if CAPTURE_SERVICES.contains(&service.as_str()) {
            ServingStatus::Serving
        } else {
            ServingStatus::ServiceUnknown
        };

        Ok(Response::new(HealthCheckResponse {
            status: status as i32,
        }))
    }

    async fn watch(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        Err(Status::unimplemented("health watch is not supported"))
    }
}
