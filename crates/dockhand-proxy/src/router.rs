//! Request resolution and dispatch.
//!
//! A request is classified once, resolved against the current membership
//! snapshot into a [`Route`], then served:
//!
//! - **Local**: streamed to and from the local engine.
//! - **Peer**: relayed to one agent, whose buffered answer is returned as is.
//! - **Fanout**: sent to every member concurrently and merged.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderValue};
use http::request::Parts;
use http::{Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use dockhand_cluster::ClusterService;
use dockhand_core::{
    AgentTags, ClusterMember, HEADER_MANAGER_OPERATION, HEADER_TARGET, HEADER_UNREACHABLE_NODES,
    NodeRole,
};

use crate::aggregate::{self, MemberFailure, NodeContribution};
use crate::classify::{self, RequestClass, strip_version_prefix};
use crate::client::{self, Upstream};
use crate::error::{EngineError, GatewayError, ProxyError, RoutingError};

/// Default bound on waiting for the engine's response head.
pub const DEFAULT_ENGINE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default bound on a whole peer exchange, body included.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a classified request is served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Local,
    Peer(ClusterMember),
    Fanout(Arc<Vec<ClusterMember>>),
}

/// Routes engine API calls across the cluster.
#[derive(Clone)]
pub struct AgentRouter {
    tags: AgentTags,
    engine: Upstream,
    cluster: Option<Arc<dyn ClusterService>>,
    engine_timeout: Duration,
    peer_timeout: Duration,
}

impl AgentRouter {
    /// A standalone router serving everything from `engine`.
    pub fn new(tags: AgentTags, engine: Upstream) -> Self {
        Self {
            tags,
            engine,
            cluster: None,
            engine_timeout: DEFAULT_ENGINE_TIMEOUT,
            peer_timeout: DEFAULT_PEER_TIMEOUT,
        }
    }

    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterService>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn with_engine_timeout(mut self, timeout: Duration) -> Self {
        self.engine_timeout = timeout;
        self
    }

    pub fn with_peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }

    pub fn tags(&self) -> &AgentTags {
        &self.tags
    }

    /// Current membership snapshot; empty when running standalone.
    pub fn members(&self) -> Arc<Vec<ClusterMember>> {
        match &self.cluster {
            Some(cluster) => cluster.members(),
            None => Arc::new(Vec::new()),
        }
    }

    pub fn classify<B>(&self, req: &Request<B>) -> RequestClass {
        classify::classify(
            req.method(),
            req.uri().path(),
            req.headers(),
            &self.tags,
            self.cluster.is_some(),
        )
    }

    /// Map a classification onto a route. Never falls back to local
    /// execution when a named node or a manager cannot be found.
    pub fn resolve(&self, class: &RequestClass) -> Result<Route, RoutingError> {
        match class {
            RequestClass::Local => Ok(Route::Local),
            RequestClass::Targeted(name) => {
                if *name == self.tags.node_name {
                    return Ok(Route::Local);
                }
                let member = self
                    .cluster
                    .as_ref()
                    .and_then(|c| c.member_by_node_name(name))
                    .ok_or_else(|| RoutingError::UnknownNode(name.clone()))?;
                Ok(Route::Peer(member))
            }
            RequestClass::RequireManager => {
                let member = self
                    .cluster
                    .as_ref()
                    .and_then(|c| c.member_by_role(NodeRole::Manager))
                    .ok_or(RoutingError::NoManager)?;
                if member.node_name == self.tags.node_name {
                    return Ok(Route::Local);
                }
                Ok(Route::Peer(member))
            }
            RequestClass::Aggregate => match &self.cluster {
                Some(cluster) => Ok(Route::Fanout(cluster.members())),
                None => Ok(Route::Local),
            },
        }
    }

    /// Serve one request.
    pub async fn dispatch(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let class = self.classify(&req);
        debug!(method = %req.method(), path = req.uri().path(), class = ?class, "routing request");

        let route = self.resolve(&class).inspect_err(|e| {
            warn!(method = %req.method(), path = req.uri().path(), error = %e, "request rejected");
        })?;

        match route {
            Route::Local => Ok(self.serve_local(req).await?),
            Route::Peer(member) => Ok(self.forward(&member, req).await?),
            Route::Fanout(members) => self.aggregate(members, req).await,
        }
    }

    async fn serve_local(&self, req: Request<Body>) -> Result<Response<Body>, EngineError> {
        let (mut parts, body) = req.into_parts();
        parts.uri = engine_uri(&parts.uri).map_err(EngineError::Unreachable)?;
        remove_routing_headers(&mut parts.headers);

        let response = tokio::time::timeout(
            self.engine_timeout,
            client::send(&self.engine, Request::from_parts(parts, body)),
        )
        .await
        .map_err(|_| EngineError::Timeout)?
        .map_err(|e| {
            warn!(error = %e, "engine request failed");
            EngineError::Unreachable(e.to_string())
        })?;

        let (mut parts, body) = response.into_parts();
        client::strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, Body::new(body)))
    }

    async fn forward(
        &self,
        member: &ClusterMember,
        req: Request<Body>,
    ) -> Result<Response<Body>, GatewayError> {
        let gateway = |reason: String| {
            warn!(node = %member.node_name, reason = %reason, "forwarding failed");
            GatewayError {
                node: member.node_name.clone(),
                reason,
            }
        };

        let (mut parts, body) = req.into_parts();
        retarget(&mut parts.headers, &member.node_name).map_err(gateway)?;

        let upstream = Upstream::peer(member);
        let (parts, bytes) = tokio::time::timeout(
            self.peer_timeout,
            fetch(&upstream, Request::from_parts(parts, body)),
        )
        .await
        .map_err(|_| gateway(format!("no answer within {:?}", self.peer_timeout)))?
        .map_err(gateway)?;

        debug!(node = %member.node_name, status = %parts.status, bytes = bytes.len(), "relayed peer response");
        Ok(Response::from_parts(parts, Body::from(bytes)))
    }

    async fn aggregate(
        &self,
        members: Arc<Vec<ClusterMember>>,
        req: Request<Body>,
    ) -> Result<Response<Body>, ProxyError> {
        let (parts, _) = req.into_parts();
        let mut tasks = JoinSet::new();

        for member in members.iter() {
            let local = member.node_name == self.tags.node_name;
            let (upstream, limit) = if local {
                (self.engine.clone(), self.engine_timeout)
            } else {
                (Upstream::peer(member), self.peer_timeout)
            };
            let request = fanout_request(&parts, member, local);
            let node_name = member.node_name.clone();

            tasks.spawn(async move {
                let result = match request {
                    Ok(request) => fetch_json(&upstream, request, limit).await,
                    Err(reason) => Err(reason),
                };
                match result {
                    Ok(body) => Ok(NodeContribution { node_name, body }),
                    Err(reason) => Err(MemberFailure::new(node_name, reason)),
                }
            });
        }

        let mut results = Vec::with_capacity(members.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => results.push(Err(MemberFailure::new("unknown", format!("task failed: {e}")))),
            }
        }

        let aggregation = aggregate::collect(results).inspect_err(|e| {
            for failure in &e.failures {
                warn!(node = %failure.node_name, reason = %failure.reason, "member failed");
            }
        })?;

        for failure in &aggregation.failures {
            warn!(node = %failure.node_name, reason = %failure.reason, "member omitted from aggregated response");
        }

        let mut response = Response::new(Body::from(aggregation.body.to_string()));
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if !aggregation.failures.is_empty() {
            let unreachable = aggregation.unreachable_nodes().join(",");
            if let Ok(value) = HeaderValue::from_str(&unreachable) {
                response.headers_mut().insert(HEADER_UNREACHABLE_NODES, value);
            }
        }
        *response.status_mut() = StatusCode::OK;
        Ok(response)
    }
}

/// Path and query as the engine expects them: no API version segment.
fn engine_uri(uri: &Uri) -> Result<Uri, String> {
    let path = strip_version_prefix(uri.path());
    let target = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };
    target.parse::<Uri>().map_err(|e| e.to_string())
}

fn remove_routing_headers(headers: &mut HeaderMap) {
    headers.remove(HEADER_TARGET);
    headers.remove(HEADER_MANAGER_OPERATION);
}

/// Point a forwarded request at `node_name` so the receiving agent serves
/// it locally. Signature headers travel unchanged.
fn retarget(headers: &mut HeaderMap, node_name: &str) -> Result<(), String> {
    let value = HeaderValue::from_str(node_name).map_err(|e| format!("invalid node name: {e}"))?;
    remove_routing_headers(headers);
    headers.insert(HEADER_TARGET, value);
    Ok(())
}

fn fanout_request(parts: &Parts, member: &ClusterMember, local: bool) -> Result<Request<Body>, String> {
    let mut headers = parts.headers.clone();
    headers.remove(header::CONTENT_LENGTH);

    let uri = if local {
        remove_routing_headers(&mut headers);
        engine_uri(&parts.uri)?
    } else {
        retarget(&mut headers, &member.node_name)?;
        parts.uri.clone()
    };

    let mut request = Request::builder()
        .method(parts.method.clone())
        .uri(uri)
        .body(Body::empty())
        .map_err(|e| e.to_string())?;
    *request.headers_mut() = headers;
    Ok(request)
}

/// One full exchange with the response body buffered.
async fn fetch(upstream: &Upstream, req: Request<Body>) -> Result<(http::response::Parts, Bytes), String> {
    let response = client::send(upstream, req).await.map_err(|e| e.to_string())?;
    let (mut parts, body) = response.into_parts();
    let bytes = body
        .collect()
        .await
        .map_err(|e| format!("reading body: {e}"))?
        .to_bytes();
    client::strip_hop_by_hop(&mut parts.headers);
    Ok((parts, bytes))
}

async fn fetch_json(upstream: &Upstream, req: Request<Body>, limit: Duration) -> Result<Value, String> {
    let (parts, bytes) = tokio::time::timeout(limit, fetch(upstream, req))
        .await
        .map_err(|_| format!("no answer within {limit:?}"))??;
    if !parts.status.is_success() {
        return Err(format!("answered {}", parts.status));
    }
    serde_json::from_slice(&bytes).map_err(|e| format!("invalid JSON body: {e}"))
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use async_trait::async_trait;
    use axum::Json;
    use axum::routing::get;
    use dockhand_cluster::ClusterResult;
    use serde_json::json;

    use super::*;

    struct FixedCluster(Arc<Vec<ClusterMember>>);

    #[async_trait]
    impl ClusterService for FixedCluster {
        async fn create(&self, _: &str, _: Option<&str>, _: &AgentTags) -> ClusterResult<()> {
            Ok(())
        }

        fn members(&self) -> Arc<Vec<ClusterMember>> {
            self.0.clone()
        }

        async fn leave(&self) {}
    }

    fn tags(role: NodeRole) -> AgentTags {
        AgentTags {
            node_name: "node-1".to_string(),
            node_role: role,
            agent_port: 9001,
        }
    }

    fn member(name: &str, role: NodeRole, addr: SocketAddr) -> ClusterMember {
        ClusterMember {
            address: addr.ip().to_string(),
            port: addr.port(),
            node_name: name.to_string(),
            node_role: role,
        }
    }

    async fn serve(app: axum::Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn closed_addr() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    fn engine_app(id: &'static str) -> axum::Router {
        axum::Router::new()
            .route("/containers/json", get(move || async move { Json(json!([{ "Id": id }])) }))
            .route(
                "/info",
                get(|headers: HeaderMap| async move {
                    let routed = headers.contains_key(HEADER_TARGET);
                    (StatusCode::CREATED, [("x-engine", "yes")], format!("info routed={routed}"))
                }),
            )
    }

    fn peer_app() -> axum::Router {
        axum::Router::new()
            .route("/v1.41/containers/json", get(|| async { Json(json!([{ "Id": "b1" }])) }))
            .fallback(|req: axum::extract::Request| async move {
                let target = req
                    .headers()
                    .get(HEADER_TARGET)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let manager = req.headers().contains_key(HEADER_MANAGER_OPERATION);
                (
                    StatusCode::ACCEPTED,
                    [("x-peer", "yes")],
                    format!("{} {} target={target} manager={manager}", req.method(), req.uri()),
                )
            })
    }

    fn router(role: NodeRole, engine: SocketAddr, members: Vec<ClusterMember>) -> AgentRouter {
        AgentRouter::new(tags(role), Upstream::Tcp(engine.to_string()))
            .with_cluster(Arc::new(FixedCluster(Arc::new(members))))
            .with_peer_timeout(Duration::from_secs(5))
    }

    fn request(method: &str, uri: &str, headers: &[(&'static str, &'static str)]) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_string(response: Response<Body>) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn unknown_target_is_a_routing_error() {
        let engine = serve(engine_app("a1")).await;
        let me = member("node-1", NodeRole::Worker, engine);
        let router = router(NodeRole::Worker, engine, vec![me]);

        let err = router
            .dispatch(request("GET", "/containers/json", &[(HEADER_TARGET, "ghost")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Routing(RoutingError::UnknownNode(ref n)) if n == "ghost"));
    }

    #[tokio::test]
    async fn unknown_target_without_cluster_is_a_routing_error() {
        let engine = serve(engine_app("a1")).await;
        let router = AgentRouter::new(tags(NodeRole::Manager), Upstream::Tcp(engine.to_string()));

        let err = router
            .dispatch(request("GET", "/info", &[(HEADER_TARGET, "node-9")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Routing(RoutingError::UnknownNode(_))));
    }

    #[tokio::test]
    async fn manager_operation_without_manager_fails() {
        let engine = closed_addr().await;
        let other = closed_addr().await;
        let router = router(
            NodeRole::Worker,
            engine,
            vec![
                member("node-1", NodeRole::Worker, engine),
                member("node-2", NodeRole::Worker, other),
            ],
        );

        let err = router
            .dispatch(request("GET", "/services", &[(HEADER_MANAGER_OPERATION, "1")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Routing(RoutingError::NoManager)));
    }

    #[tokio::test]
    async fn role_lookup_only_returns_managers() {
        let engine = closed_addr().await;
        let a = closed_addr().await;
        let b = closed_addr().await;
        let router = router(
            NodeRole::Worker,
            engine,
            vec![
                member("node-1", NodeRole::Worker, engine),
                member("node-2", NodeRole::Worker, a),
                member("node-3", NodeRole::Manager, b),
            ],
        );

        match router.resolve(&RequestClass::RequireManager).unwrap() {
            Route::Peer(m) => {
                assert_eq!(m.node_role, NodeRole::Manager);
                assert_eq!(m.node_name, "node-3");
            }
            other => panic!("unexpected route {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_request_is_served_by_the_engine() {
        let engine = serve(engine_app("a1")).await;
        let router = router(
            NodeRole::Worker,
            engine,
            vec![member("node-1", NodeRole::Worker, engine)],
        );

        let response = router
            .dispatch(request("GET", "/v1.41/info", &[(HEADER_TARGET, "node-1")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-engine"], "yes");
        assert_eq!(body_string(response).await, "info routed=false");
    }

    #[tokio::test]
    async fn targeted_request_is_relayed_verbatim() {
        let engine = closed_addr().await;
        let peer = serve(peer_app()).await;
        let router = router(
            NodeRole::Worker,
            engine,
            vec![
                member("node-1", NodeRole::Worker, engine),
                member("node-2", NodeRole::Manager, peer),
            ],
        );

        let response = router
            .dispatch(request(
                "POST",
                "/v1.41/containers/abc/start?t=5",
                &[(HEADER_TARGET, "node-2"), (HEADER_MANAGER_OPERATION, "1")],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers()["x-peer"], "yes");
        assert_eq!(
            body_string(response).await,
            "POST /v1.41/containers/abc/start?t=5 target=node-2 manager=false"
        );
    }

    #[tokio::test]
    async fn unreachable_peer_is_a_gateway_error() {
        let engine = serve(engine_app("a1")).await;
        let down = closed_addr().await;
        let router = router(
            NodeRole::Worker,
            engine,
            vec![
                member("node-1", NodeRole::Worker, engine),
                member("node-2", NodeRole::Worker, down),
            ],
        );

        let err = router
            .dispatch(request("GET", "/info", &[(HEADER_TARGET, "node-2")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Gateway(ref g) if g.node == "node-2"));
    }

    #[tokio::test]
    async fn aggregation_merges_every_member() {
        let engine = serve(engine_app("a1")).await;
        let peer = serve(peer_app()).await;
        let router = router(
            NodeRole::Worker,
            engine,
            vec![
                member("node-2", NodeRole::Manager, peer),
                member("node-1", NodeRole::Worker, engine),
            ],
        );

        let response = router
            .dispatch(request("GET", "/v1.41/containers/json", &[]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(HEADER_UNREACHABLE_NODES).is_none());

        let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(
            body,
            json!([
                { "Id": "a1", "Dockhand": { "Agent": { "NodeName": "node-1" } } },
                { "Id": "b1", "Dockhand": { "Agent": { "NodeName": "node-2" } } }
            ])
        );
    }

    #[tokio::test]
    async fn aggregation_tolerates_one_failed_member() {
        let engine = serve(engine_app("a1")).await;
        let down = closed_addr().await;
        let router = router(
            NodeRole::Worker,
            engine,
            vec![
                member("node-1", NodeRole::Worker, engine),
                member("node-2", NodeRole::Manager, down),
            ],
        );

        let response = router
            .dispatch(request("GET", "/containers/json", &[]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[HEADER_UNREACHABLE_NODES], "node-2");

        let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
        let items = body.as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["Dockhand"]["Agent"]["NodeName"], "node-1");
    }

    #[tokio::test]
    async fn aggregation_with_every_member_down_fails() {
        let engine = closed_addr().await;
        let down = closed_addr().await;
        let router = router(
            NodeRole::Worker,
            engine,
            vec![
                member("node-1", NodeRole::Worker, engine),
                member("node-2", NodeRole::Manager, down),
            ],
        );

        let err = router
            .dispatch(request("GET", "/containers/json", &[]))
            .await
            .unwrap_err();
        match err {
            ProxyError::Aggregation(e) => {
                assert_eq!(e.attempted, 2);
                assert_eq!(e.failures.len(), 2);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
