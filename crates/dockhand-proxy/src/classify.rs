//! Request classification.
//!
//! Routing headers are inspected exactly once per request; the rest of
//! the router only matches on the resulting [`RequestClass`].

use std::sync::LazyLock;

use http::{HeaderMap, Method};
use regex::Regex;

use dockhand_core::{AgentTags, HEADER_MANAGER_OPERATION, HEADER_TARGET};

/// Engine queries whose answer needs every node's view.
const AGGREGATE_PATHS: &[&str] = &["/containers/json", "/images/json", "/networks", "/volumes"];

static VERSION_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/v[0-9]+(?:\.[0-9]+)?(/|$)").expect("static regex")
});

/// How a request must be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestClass {
    /// Serve against the local engine.
    Local,
    /// Serve on the node with this name.
    Targeted(String),
    /// Serve on any manager node.
    RequireManager,
    /// Ask every member and merge the answers.
    Aggregate,
}

/// Remove a leading `/vN` or `/vN.M` API version segment.
pub fn strip_version_prefix(path: &str) -> &str {
    match VERSION_PREFIX.captures(path) {
        Some(caps) => {
            let (Some(whole), Some(sep)) = (caps.get(0), caps.get(1)) else {
                return path;
            };
            let rest = &path[whole.end() - sep.as_str().len()..];
            if rest.is_empty() { "/" } else { rest }
        }
        None => path,
    }
}

/// Whether `path` (already stripped of its version) is a cluster-wide query.
pub fn is_aggregate_path(path: &str) -> bool {
    let path = if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    };
    AGGREGATE_PATHS.contains(&path)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Classify a request.
///
/// A target header wins over the manager flag; aggregation only applies
/// to GETs on cluster-wide paths when no routing header is present.
pub fn classify(
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    local: &AgentTags,
    cluster_enabled: bool,
) -> RequestClass {
    if let Some(target) = header(headers, HEADER_TARGET) {
        if target == local.node_name {
            return RequestClass::Local;
        }
        return RequestClass::Targeted(target.to_string());
    }

    if header(headers, HEADER_MANAGER_OPERATION).is_some() {
        if local.is_manager() {
            return RequestClass::Local;
        }
        return RequestClass::RequireManager;
    }

    if cluster_enabled && method == Method::GET && is_aggregate_path(strip_version_prefix(path)) {
        return RequestClass::Aggregate;
    }

    RequestClass::Local
}
