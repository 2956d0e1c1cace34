//! Minimal HTTP/1 client for engine and peer hops.
//!
//! Each call opens a fresh connection (TCP or unix socket), performs the
//! hyper handshake, drives the connection in the background and sends a
//! single request.

use std::path::PathBuf;

use axum::body::Body;
use http::header::{self, HeaderMap, HeaderValue};
use http::{Request, Response, Uri};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use dockhand_core::ClusterMember;

use crate::error::{ClientError, EngineError};

/// Where a request is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    /// `host:port`
    Tcp(String),
    /// Path of a unix domain socket.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl Upstream {
    /// Parse an engine endpoint: `unix:///path`, `tcp://host:port`,
    /// `http://host:port` or a bare `host:port`.
    pub fn parse(endpoint: &str) -> Result<Self, EngineError> {
        let endpoint = endpoint.trim();
        if let Some(path) = endpoint.strip_prefix("unix://") {
            return Self::unix(path, endpoint);
        }

        let authority = endpoint
            .strip_prefix("tcp://")
            .or_else(|| endpoint.strip_prefix("http://"))
            .unwrap_or(endpoint)
            .trim_end_matches('/');

        match authority.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Upstream::Tcp(authority.to_string()))
            }
            _ => Err(EngineError::InvalidEndpoint(endpoint.to_string())),
        }
    }

    #[cfg(unix)]
    fn unix(path: &str, endpoint: &str) -> Result<Self, EngineError> {
        if path.is_empty() {
            return Err(EngineError::InvalidEndpoint(endpoint.to_string()));
        }
        Ok(Upstream::Unix(PathBuf::from(path)))
    }

    #[cfg(not(unix))]
    fn unix(_path: &str, endpoint: &str) -> Result<Self, EngineError> {
        Err(EngineError::InvalidEndpoint(endpoint.to_string()))
    }

    /// The agent API of a cluster member.
    pub fn peer(member: &ClusterMember) -> Self {
        Upstream::Tcp(member.endpoint())
    }

    /// Value for the `Host` header.
    fn host(&self) -> &str {
        match self {
            Upstream::Tcp(addr) => addr,
            #[cfg(unix)]
            Upstream::Unix(_) => "localhost",
        }
    }
}

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Drop connection-scoped headers before a message crosses a hop.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Send `req` to `upstream` and return the response head with a
/// streaming body.
///
/// Only the path and query of the request URI are kept; `Host` is set
/// for the upstream.
pub async fn send(upstream: &Upstream, req: Request<Body>) -> Result<Response<Incoming>, ClientError> {
    let (mut parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    parts.uri = path_and_query
        .parse::<Uri>()
        .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;

    strip_hop_by_hop(&mut parts.headers);
    let host = HeaderValue::from_str(upstream.host())
        .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;
    parts.headers.insert(header::HOST, host);

    let req = Request::from_parts(parts, body);

    match upstream {
        Upstream::Tcp(addr) => {
            let stream = tokio::net::TcpStream::connect(addr.as_str())
                .await
                .map_err(ClientError::Connect)?;
            exchange(stream, req).await
        }
        #[cfg(unix)]
        Upstream::Unix(path) => {
            let stream = tokio::net::UnixStream::connect(path)
                .await
                .map_err(ClientError::Connect)?;
            exchange(stream, req).await
        }
    }
}

async fn exchange<S>(stream: S, req: Request<Body>) -> Result<Response<Incoming>, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(ClientError::Handshake)?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "upstream connection closed with error");
        }
    });

    sender.send_request(req).await.map_err(ClientError::Request)
}
