use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::routing::get;
use http_body_util::BodyExt;
use p256::ecdsa::SigningKey;
use serde_json::{Value, json};
use tower::ServiceExt;

use dockhand_api::{
    ApiState, EcdsaVerifier, ErrorBody, SignatureEnvelope, build_router, signing_key_from_secret,
};
use dockhand_cluster::{ClusterService, StaticMembership};
use dockhand_core::{AgentTags, HEADER_TARGET, NodeRole, Schedule};
use dockhand_edge::{ScheduleManager, ScheduleRegistry};
use dockhand_proxy::{AgentRouter, Upstream};

const SECRET: &str = "cluster-secret";

fn tags() -> AgentTags {
    AgentTags {
        node_name: "node-1".to_string(),
        node_role: NodeRole::Manager,
        agent_port: 9001,
    }
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn engine() -> SocketAddr {
    serve(Router::new().route("/info", get(|| async { axum::Json(json!({"Name": "engine-1"})) }))).await
}

async fn dead_address() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

fn state(router: AgentRouter, schedules: Arc<ScheduleRegistry>) -> ApiState {
    ApiState::new(
        router,
        Arc::new(EcdsaVerifier::from_secret(SECRET).unwrap()),
        schedules,
    )
}

fn standalone(engine: SocketAddr) -> Router {
    let router = AgentRouter::new(tags(), Upstream::Tcp(engine.to_string()));
    build_router(state(router, Arc::new(ScheduleRegistry::new())))
}

fn signed(uri: &str, key: &SigningKey) -> Request<Body> {
    let mut req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    SignatureEnvelope::sign(key).apply(req.headers_mut()).unwrap();
    req
}

fn unsigned(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn secret_key() -> SigningKey {
    signing_key_from_secret(SECRET).unwrap()
}

async fn json_body<T: serde::de::DeserializeOwned>(response: Response<Body>) -> T {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn assert_versioned(response: &Response<Body>) {
    assert_eq!(response.headers()["dockhand-agent"], "1.2.1");
    assert_eq!(response.headers()["dockhand-agent-api-version"], "2");
}

#[tokio::test]
async fn ping_needs_no_signature() {
    let app = standalone(dead_address().await);
    let response = app.oneshot(unsigned("/ping")).await.unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_versioned(&response);
}

#[tokio::test]
async fn unsigned_requests_are_forbidden() {
    let app = standalone(engine().await);

    for uri in ["/agents", "/schedules", "/v1.41/info"] {
        let response = app.clone().oneshot(unsigned(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{uri}");
        assert_versioned(&response);
        let body: ErrorBody = json_body(response).await;
        assert_eq!(body.message, "Unauthorized");
    }
}

#[tokio::test]
async fn foreign_keys_are_forbidden_under_shared_secret() {
    let app = standalone(engine().await);
    let stranger = signing_key_from_secret("not-the-secret").unwrap();

    let response = app.oneshot(signed("/agents", &stranger)).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn first_key_is_pinned_without_secret() {
    let router = AgentRouter::new(tags(), Upstream::Tcp(engine().await.to_string()));
    let app = build_router(ApiState::new(
        router,
        Arc::new(EcdsaVerifier::trust_on_first_use()),
        Arc::new(ScheduleRegistry::new()),
    ));
    let first = signing_key_from_secret("first").unwrap();
    let second = signing_key_from_secret("second").unwrap();

    let response = app.clone().oneshot(signed("/agents", &first)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.clone().oneshot(signed("/agents", &second)).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app.oneshot(signed("/agents", &first)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn agents_lists_membership_snapshot() {
    let engine = engine().await;
    let membership = Arc::new(StaticMembership::new(None));
    membership.create("127.0.0.1", None, &tags()).await.unwrap();

    let router = AgentRouter::new(tags(), Upstream::Tcp(engine.to_string()))
        .with_cluster(membership.clone() as Arc<dyn ClusterService>);
    let app = build_router(state(router, Arc::new(ScheduleRegistry::new())));

    let response = app.oneshot(signed("/agents", &secret_key())).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let members: Value = json_body(response).await;
    assert_eq!(
        members,
        json!([{
            "address": "127.0.0.1",
            "port": 9001,
            "node_name": "node-1",
            "node_role": "manager",
        }])
    );
}

#[tokio::test]
async fn standalone_agent_has_no_members() {
    let app = standalone(engine().await);
    let response = app.oneshot(signed("/agents", &secret_key())).await.unwrap();
    let members: Vec<Value> = json_body(response).await;
    assert!(members.is_empty());
}

#[tokio::test]
async fn schedules_reflect_the_registry() {
    let registry = Arc::new(ScheduleRegistry::new());
    let schedule = Schedule {
        id: 7,
        cron_expression: "0 3 * * *".to_string(),
        script: String::new(),
        version: 1,
    };
    registry.apply(std::slice::from_ref(&schedule)).await.unwrap();

    let router = AgentRouter::new(tags(), Upstream::Tcp(dead_address().await.to_string()));
    let app = build_router(state(router, registry));

    let response = app.oneshot(signed("/schedules", &secret_key())).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let schedules: Vec<Schedule> = json_body(response).await;
    assert_eq!(schedules, vec![schedule]);
}

#[tokio::test]
async fn engine_calls_are_proxied() {
    let app = standalone(engine().await);

    let response = app.oneshot(signed("/v1.41/info", &secret_key())).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_versioned(&response);
    let body: Value = json_body(response).await;
    assert_eq!(body["Name"], "engine-1");
}

#[tokio::test]
async fn unknown_target_is_not_found() {
    let app = standalone(engine().await);
    let mut req = signed("/containers/json", &secret_key());
    req.headers_mut().insert(HEADER_TARGET, "ghost".parse().unwrap());

    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: ErrorBody = json_body(response).await;
    assert!(body.details.contains("ghost"), "{}", body.details);
}

#[tokio::test]
async fn unreachable_engine_is_a_bad_gateway() {
    let app = standalone(dead_address().await);

    let response = app.oneshot(signed("/info", &secret_key())).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_versioned(&response);
}
