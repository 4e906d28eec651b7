use crate::error::GatewayError;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backend service the gateway forwards to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upstream {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// `scheme://host[:port][/base-path]`
    pub base_url: String,

    /// Per-attempt connect/read/write budget (ms).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Idle connections kept per worker pool.
    #[serde(default = "default_max_idle")]
    pub max_idle_conns: usize,

    #[serde(default = "default_idle_timeout_ms")]
    pub idle_conn_timeout_ms: u64,

    #[serde(default)]
    pub auth: UpstreamAuth,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Credentials injected on the upstream leg.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UpstreamAuth {
    #[default]
    None,
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
    Header {
        name: String,
        value: String,
    },
}

impl UpstreamAuth {
    /// The header to add to upstream requests, if any.
    pub fn header(&self) -> Option<(String, String)> {
        match self {
            UpstreamAuth::None => None,
            UpstreamAuth::Bearer { token } => {
                Some(("authorization".to_string(), format!("Bearer {}", token)))
            }
            UpstreamAuth::Basic { username, password } => {
                let encoded = BASE64.encode(format!("{}:{}", username, password));
                Some(("authorization".to_string(), format!("Basic {}", encoded)))
            }
            UpstreamAuth::Header { name, value } => Some((name.clone(), value.clone())),
        }
    }
}

/// Parsed connection target for an upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// `host:port` dialed by the dispatcher.
    pub addr: String,
    /// Host value for the upstream `Host` header.
    pub host: String,
    /// Base path prepended to the rewritten request path ("" when absent).
    pub base_path: String,
    pub tls: bool,
}

impl Endpoint {
    /// Join the upstream base path with a request path.
    pub fn join_path(&self, path: &str) -> String {
        if self.base_path.is_empty() {
            return path.to_string();
        }
        format!("{}{}", self.base_path, path)
    }
}

fn default_timeout_ms() -> u64 {
    6000
}

fn default_max_idle() -> usize {
    32
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_enabled() -> bool {
    true
}

impl Upstream {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn idle_conn_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_conn_timeout_ms)
    }

    /// Parse `base_url` into a dialable endpoint.
    pub fn endpoint(&self) -> Result<Endpoint, GatewayError> {
        let (tls, rest) = if let Some(rest) = self.base_url.strip_prefix("http://") {
            (false, rest)
        } else if let Some(rest) = self.base_url.strip_prefix("https://") {
            (true, rest)
        } else {
            return Err(GatewayError::UpstreamUnreachable(format!(
                "upstream {} has unsupported base_url scheme: {}",
                self.id, self.base_url
            )));
        };

        let (authority, base_path) = match rest.find('/') {
            Some(pos) => (&rest[..pos], rest[pos..].trim_end_matches('/').to_string()),
            None => (rest, String::new()),
        };
        if authority.is_empty() {
            return Err(GatewayError::UpstreamUnreachable(format!(
                "upstream {} has empty host in base_url: {}",
                self.id, self.base_url
            )));
        }

        let addr = if authority.contains(':') {
            authority.to_string()
        } else if tls {
            format!("{}:443", authority)
        } else {
            format!("{}:80", authority)
        };

        Ok(Endpoint {
            addr,
            host: authority.to_string(),
            base_path,
            tls,
        })
    }
}
