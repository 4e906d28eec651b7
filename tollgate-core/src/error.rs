use thiserror::Error;

/// Unified error type for the gateway data plane.
///
/// Every variant maps to a stable wire `kind` (snake_case) and an HTTP
/// status. Responses built from these errors always carry the request id.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("No API key supplied")]
    MissingCredentials,

    #[error("Invalid API key")]
    InvalidCredentials,

    #[error("API key has been revoked")]
    KeyRevoked,

    #[error("API key has expired")]
    KeyExpired,

    #[error("Account is not active")]
    UserInactive,

    #[error("Key is missing required scope: {0}")]
    ScopeInsufficient(String),

    #[error("No route matched: {0}")]
    RouteNotFound(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Request body too large")]
    BodyTooLarge,

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Monthly quota exceeded")]
    QuotaExceeded,

    #[error("Client closed the connection")]
    ClientCancelled,

    #[error("Upstream timed out")]
    UpstreamTimeout,

    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("Upstream protocol error: {0}")]
    UpstreamProtocolError(String),

    #[error("Transform failed: {0}")]
    TransformFailed(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Gateway overloaded")]
    Overloaded,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable error code.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::MissingCredentials => "missing_credentials",
            GatewayError::InvalidCredentials => "invalid_credentials",
            GatewayError::KeyRevoked => "key_revoked",
            GatewayError::KeyExpired => "key_expired",
            GatewayError::UserInactive => "user_inactive",
            GatewayError::ScopeInsufficient(_) => "scope_insufficient",
            GatewayError::RouteNotFound(_) => "not_found",
            GatewayError::MalformedRequest(_) => "malformed_request",
            GatewayError::BodyTooLarge => "body_too_large",
            GatewayError::RateLimitExceeded => "rate_limit_exceeded",
            GatewayError::QuotaExceeded => "quota_exceeded",
            GatewayError::ClientCancelled => "client_cancelled",
            GatewayError::UpstreamTimeout => "upstream_timeout",
            GatewayError::UpstreamUnreachable(_) => "upstream_unreachable",
            GatewayError::UpstreamProtocolError(_) => "upstream_protocol_error",
            GatewayError::TransformFailed(_) => "transform_failed",
            GatewayError::StoreUnavailable(_) => "store_unavailable",
            GatewayError::Overloaded => "overloaded",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// Map to HTTP status code.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::MissingCredentials | GatewayError::InvalidCredentials => 401,
            GatewayError::KeyExpired => 401,
            GatewayError::KeyRevoked
            | GatewayError::UserInactive
            | GatewayError::ScopeInsufficient(_) => 403,
            GatewayError::RouteNotFound(_) => 404,
            GatewayError::MalformedRequest(_) => 400,
            GatewayError::BodyTooLarge => 413,
            GatewayError::RateLimitExceeded | GatewayError::QuotaExceeded => 429,
            GatewayError::ClientCancelled => 499,
            GatewayError::UpstreamTimeout => 504,
            GatewayError::UpstreamUnreachable(_)
            | GatewayError::UpstreamProtocolError(_)
            | GatewayError::TransformFailed(_) => 502,
            GatewayError::StoreUnavailable(_) | GatewayError::Overloaded => 503,
            GatewayError::Internal(_) => 500,
        }
    }

    /// JSON error body: `{"error":{"code":..,"message":..,"request_id":..}}`.
    pub fn to_json_body(&self, request_id: &str) -> Vec<u8> {
        let body = serde_json::json!({
            "error": {
                "code": self.kind(),
                "message": self.to_string(),
                "request_id": request_id,
            }
        });
        serde_json::to_vec(&body).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(GatewayError::MissingCredentials.status_code(), 401);
        assert_eq!(GatewayError::InvalidCredentials.status_code(), 401);
        assert_eq!(GatewayError::KeyExpired.status_code(), 401);
        assert_eq!(GatewayError::KeyRevoked.status_code(), 403);
        assert_eq!(GatewayError::UserInactive.status_code(), 403);
        assert_eq!(GatewayError::ScopeInsufficient("admin".into()).status_code(), 403);
        assert_eq!(GatewayError::RouteNotFound("/x".into()).status_code(), 404);
        assert_eq!(GatewayError::MalformedRequest("bad".into()).status_code(), 400);
        assert_eq!(GatewayError::BodyTooLarge.status_code(), 413);
        assert_eq!(GatewayError::RateLimitExceeded.status_code(), 429);
        assert_eq!(GatewayError::QuotaExceeded.status_code(), 429);
        assert_eq!(GatewayError::ClientCancelled.status_code(), 499);
        assert_eq!(GatewayError::UpstreamTimeout.status_code(), 504);
        assert_eq!(GatewayError::UpstreamUnreachable("x".into()).status_code(), 502);
        assert_eq!(GatewayError::TransformFailed("x".into()).status_code(), 502);
        assert_eq!(GatewayError::StoreUnavailable("x".into()).status_code(), 503);
        assert_eq!(GatewayError::Overloaded.status_code(), 503);
        assert_eq!(GatewayError::Internal("x".into()).status_code(), 500);
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(GatewayError::MissingCredentials.kind(), "missing_credentials");
        assert_eq!(GatewayError::RateLimitExceeded.kind(), "rate_limit_exceeded");
        assert_eq!(GatewayError::TransformFailed("e".into()).kind(), "transform_failed");
        assert_eq!(GatewayError::RouteNotFound("/".into()).kind(), "not_found");
        assert_eq!(GatewayError::Overloaded.kind(), "overloaded");
    }

    #[test]
    fn json_body_is_valid_and_carries_request_id() {
        let err = GatewayError::InvalidCredentials;
        let body = err.to_json_body("deadbeefdeadbeefdeadbeefdeadbeef");
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["error"]["code"], "invalid_credentials");
        assert_eq!(
            parsed["error"]["request_id"],
            "deadbeefdeadbeefdeadbeefdeadbeef"
        );
        assert!(parsed["error"]["message"].as_str().is_some());
    }

    #[test]
    fn json_body_escapes_message_content() {
        let err = GatewayError::MalformedRequest("quote \" and \\ slash".into());
        let body = err.to_json_body("rid");
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(
            parsed["error"]["message"]
                .as_str()
                .unwrap()
                .contains("quote \" and \\ slash")
        );
    }
}
