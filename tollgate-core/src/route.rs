use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tollgate_transform::TransformSpec;

/// A Route defines how incoming requests are matched, rewritten, and bound
/// to an upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// Unique route identifier
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    /// Path to match, interpreted per `match_type`.
    pub path_pattern: String,

    #[serde(default)]
    pub match_type: MatchType,

    /// Allowed HTTP methods (empty = all methods)
    #[serde(default)]
    pub methods: Vec<String>,

    /// Header predicates; all must pass.
    #[serde(default)]
    pub header_matches: Vec<HeaderMatch>,

    /// Priority (higher = matched first, default 0)
    #[serde(default)]
    pub priority: i32,

    /// Upstream this route forwards to.
    pub upstream_id: String,

    /// Rewrite template for the upstream path; `${name}` expands captures.
    #[serde(default)]
    pub path_rewrite: Option<String>,

    /// Replace the request method before forwarding.
    #[serde(default)]
    pub method_override: Option<String>,

    #[serde(default)]
    pub request_transform: Option<TransformSpec>,

    #[serde(default)]
    pub response_transform: Option<TransformSpec>,

    /// Cost multiplier expression for usage metering (default cost 1).
    #[serde(default)]
    pub metering_expr: Option<String>,

    /// Scope the calling key must carry.
    #[serde(default)]
    pub required_scope: Option<String>,

    #[serde(default)]
    pub protocol: Protocol,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    #[default]
    Prefix,
    Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Ws,
    Sse,
    Grpc,
}

impl Protocol {
    /// Protocols that are always dispatched on the streaming path.
    pub fn always_streams(&self) -> bool {
        matches!(self, Protocol::Ws | Protocol::Sse | Protocol::Grpc)
    }
}

/// Header predicate for route matching.
///
/// `required = false` means the header may be absent, but when present it
/// must match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderMatch {
    pub name: String,

    pub value: String,

    #[serde(default)]
    pub is_regex: bool,

    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_required() -> bool {
    true
}

impl Route {
    /// Check if a given HTTP method is allowed by this route.
    pub fn method_allowed(&self, method: &str) -> bool {
        if self.methods.is_empty() {
            return true;
        }
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_route_deserializes_with_defaults() {
        let route: Route = serde_json::from_value(serde_json::json!({
            "id": "r1",
            "path_pattern": "/v1/echo",
            "upstream_id": "u1",
        }))
        .unwrap();
        assert_eq!(route.match_type, MatchType::Prefix);
        assert_eq!(route.protocol, Protocol::Http);
        assert!(route.enabled);
        assert_eq!(route.priority, 0);
        assert!(route.methods.is_empty());
        assert!(route.metering_expr.is_none());
    }

    #[test]
    fn method_allowed_empty_means_all() {
        let route: Route = serde_json::from_value(serde_json::json!({
            "id": "r1", "path_pattern": "/", "upstream_id": "u1",
        }))
        .unwrap();
        assert!(route.method_allowed("GET"));
        assert!(route.method_allowed("DELETE"));
    }

    #[test]
    fn method_allowed_is_case_insensitive() {
        let route: Route = serde_json::from_value(serde_json::json!({
            "id": "r1", "path_pattern": "/", "upstream_id": "u1",
            "methods": ["GET", "POST"],
        }))
        .unwrap();
        assert!(route.method_allowed("get"));
        assert!(route.method_allowed("POST"));
        assert!(!route.method_allowed("PUT"));
    }

    #[test]
    fn header_match_defaults_to_required() {
        let hm: HeaderMatch = serde_json::from_value(serde_json::json!({
            "name": "X-Tenant", "value": "acme",
        }))
        .unwrap();
        assert!(hm.required);
        assert!(!hm.is_regex);
    }

    #[test]
    fn streaming_protocols() {
        assert!(!Protocol::Http.always_streams());
        assert!(Protocol::Ws.always_streams());
        assert!(Protocol::Sse.always_streams());
        assert!(Protocol::Grpc.always_streams());
    }
}
