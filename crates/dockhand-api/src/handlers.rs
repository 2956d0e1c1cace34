//! Agent endpoint handlers and the error-to-response mapping.

use axum::Json;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use dockhand_core::{ClusterMember, Schedule};
use dockhand_proxy::{ProxyError, RoutingError};

use crate::ApiState;
use crate::trust::AuthError;

/// JSON body of every error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    pub details: String,
}

/// Failures surfaced to API clients.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Auth(_) => StatusCode::FORBIDDEN,
            ApiError::Proxy(ProxyError::Routing(RoutingError::UnknownNode(_))) => StatusCode::NOT_FOUND,
            ApiError::Proxy(ProxyError::Routing(RoutingError::NoManager)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Proxy(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn message(&self) -> &'static str {
        match self {
            ApiError::Auth(_) => "Unauthorized",
            ApiError::Proxy(ProxyError::Routing(_)) => "Unable to route request",
            ApiError::Proxy(ProxyError::Gateway(_)) => "Unable to reach cluster member",
            ApiError::Proxy(ProxyError::Aggregation(_)) => "Unable to query cluster",
            ApiError::Proxy(ProxyError::Engine(_)) => "Unable to reach the container engine",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            message: self.message().to_string(),
            details: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

/// GET /ping
pub async fn ping() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// GET /agents
pub async fn list_agents(State(state): State<ApiState>) -> Json<Vec<ClusterMember>> {
    Json(state.router.members().as_ref().clone())
}

/// GET /schedules
pub async fn list_schedules(State(state): State<ApiState>) -> Json<Vec<Schedule>> {
    Json(state.schedules.schedules())
}

/// Everything else goes to the engine, a peer, or the whole cluster.
pub async fn proxy(State(state): State<ApiState>, req: Request) -> Result<Response, ApiError> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    state.router.dispatch(req).await.map_err(|e| {
        warn!(%method, %path, error = %e, "request failed");
        ApiError::from(e)
    })
}
