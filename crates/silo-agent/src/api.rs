//! HTTP control plane consumed by the broker.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, put},
};
use serde::Serialize;
use silo_instance::{DeleteOutcome, InstanceInfo, InstanceSummary};

use crate::manager::{InstanceError, InstanceManager};
use crate::request_meta;

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Debug)]
pub struct ApiError(InstanceError);

impl From<InstanceError> for ApiError {
    fn from(value: InstanceError) -> Self {
        Self(value)
    }
}

pub fn status_for(err: &InstanceError) -> StatusCode {
    match err {
        InstanceError::InvalidId(_)
        | InstanceError::AlreadyExists(_)
        | InstanceError::NotFound(_)
        | InstanceError::NoCapacity { .. } => StatusCode::BAD_REQUEST,
        InstanceError::CredentialsUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        InstanceError::Spawn { .. } | InstanceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, code = self.0.code(), "request failed");
        } else {
            tracing::debug!(error = %self.0, code = self.0.code(), "request rejected");
        }
        let body = ErrorBody {
            code: self.0.code(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    instances: usize,
    capacity: usize,
}

async fn healthz(State(manager): State<InstanceManager>) -> Result<Json<HealthzResponse>, ApiError> {
    let instances = manager.list().await?.len();
    Ok(Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        instances,
        capacity: manager.config().port_range().len(),
    }))
}

async fn list_instances(
    State(manager): State<InstanceManager>,
) -> Result<Json<Vec<InstanceSummary>>, ApiError> {
    Ok(Json(manager.list().await?))
}

async fn create_instance(
    State(manager): State<InstanceManager>,
    Path(instance_id): Path<String>,
) -> Result<Json<InstanceSummary>, ApiError> {
    Ok(Json(manager.create(&instance_id).await?))
}

async fn get_instance(
    State(manager): State<InstanceManager>,
    Path(instance_id): Path<String>,
) -> Result<Json<InstanceInfo>, ApiError> {
    Ok(Json(manager.get(&instance_id).await?))
}

async fn delete_instance(
    State(manager): State<InstanceManager>,
    Path(instance_id): Path<String>,
) -> Result<Json<DeleteOutcome>, ApiError> {
    Ok(Json(manager.delete(&instance_id).await?))
}

pub fn router(manager: InstanceManager) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/instances", get(list_instances))
        .route(
            "/instances/:instance_id",
            put(create_instance)
                .get(get_instance)
                .delete(delete_instance),
        )
        .layer(middleware::from_fn(request_meta::request_id))
        .with_state(manager)
}

#[cfg(test)]
mod tests {
    use silo_instance::{IdError, InstanceId};

    use super::*;
    use crate::state_store::StoreError;

    fn id() -> InstanceId {
        InstanceId::parse("db1").unwrap()
    }

    #[test]
    fn client_mistakes_map_to_400() {
        for err in [
            InstanceError::InvalidId(IdError::Invalid),
            InstanceError::AlreadyExists(id()),
            InstanceError::NotFound(id()),
            InstanceError::NoCapacity {
                start: 9001,
                end: 9101,
                capacity: 100,
            },
        ] {
            assert_eq!(status_for(&err), StatusCode::BAD_REQUEST, "{err}");
        }
    }

    #[test]
    fn pending_credentials_map_to_503() {
        let err = InstanceError::CredentialsUnavailable(id());
        assert_eq!(status_for(&err), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn teardown_failure_maps_to_500() {
        let err = InstanceError::Io(StoreError::Io {
            context: "remove dir",
            path: "/srv/agent/minio/db1".into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        });
        assert_eq!(status_for(&err), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code(), "io_error");
    }
}
