//! dockhand-api: the agent's HTTP surface.
//!
//! # Routes
//!
//! | Method | Path | Signed | Description |
//! |---|---|---|---|
//! | GET | `/ping` | no | Liveness check, 204 |
//! | GET | `/agents` | yes | Current membership snapshot |
//! | GET | `/schedules` | yes | Schedules last applied by the edge loop |
//! | any | everything else | yes | Routed through [`AgentRouter`] |
//!
//! Every response, errors included, carries the `Dockhand-Agent` and
//! `Dockhand-Agent-Api-Version` headers.

pub mod handlers;
pub mod trust;

use std::sync::Arc;

use axum::Router;
use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;

use dockhand_core::{AGENT_VERSION, API_VERSION, RESPONSE_AGENT_HEADER, RESPONSE_API_VERSION_HEADER};
use dockhand_edge::ScheduleManager;
use dockhand_proxy::AgentRouter;

pub use handlers::{ApiError, ErrorBody};
pub use trust::{AuthError, EcdsaVerifier, SignatureEnvelope, SignatureVerifier, signing_key_from_secret};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub router: Arc<AgentRouter>,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub schedules: Arc<dyn ScheduleManager>,
}

impl ApiState {
    pub fn new(
        router: AgentRouter,
        verifier: Arc<dyn SignatureVerifier>,
        schedules: Arc<dyn ScheduleManager>,
    ) -> Self {
        Self {
            router: Arc::new(router),
            verifier,
            schedules,
        }
    }
}

async fn agent_headers(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(RESPONSE_AGENT_HEADER, HeaderValue::from_static(AGENT_VERSION));
    headers.insert(RESPONSE_API_VERSION_HEADER, HeaderValue::from_static(API_VERSION));
    response
}

/// Build the complete agent router.
pub fn build_router(state: ApiState) -> Router {
    let signed = Router::new()
        .route("/agents", get(handlers::list_agents))
        .route("/schedules", get(handlers::list_schedules))
        .fallback(handlers::proxy)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.verifier),
            trust::require_signature,
        ))
        .with_state(state);

    Router::new()
        .route("/ping", get(handlers::ping))
        .merge(signed)
        .layer(middleware::from_fn(agent_headers))
}
