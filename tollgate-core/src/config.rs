use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for the Tollgate gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway node ID (auto-generated if not set)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub quota: QuotaConfig,

    #[serde(default)]
    pub recorder: RecorderSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// HTTP listener address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Number of worker threads (0 = one per core)
    #[serde(default)]
    pub workers: usize,

    /// Largest body buffered in memory; beyond this the request is 413'd.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Concurrent in-flight request ceiling; beyond this the gateway
    /// answers 503 `overloaded`.
    #[serde(default = "default_max_inflight")]
    pub max_inflight: i64,

    /// Overall per-request deadline (ms).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Idle upstream connections kept per worker per upstream address.
    #[serde(default = "default_pool_size")]
    pub keepalive_pool_size: usize,

    /// Copy window for streaming bodies.
    #[serde(default = "default_stream_buf_bytes")]
    pub stream_buf_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Vanity prefix for issued keys (the raw key starts with this).
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Admit requests when the rate-limit store is unavailable.
    /// Default is fail-closed (503).
    #[serde(default)]
    pub fail_open: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Usage-summary cache TTL (seconds). The quota check may run against
    /// a summary up to this stale.
    #[serde(default = "default_summary_ttl_secs")]
    pub summary_ttl_secs: u64,

    /// Percent of the monthly ceiling at which responses start carrying a
    /// warning header.
    #[serde(default = "default_warn_percent")]
    pub warn_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderSettings {
    /// Ring capacity; overflow drops the oldest event.
    #[serde(default = "default_recorder_capacity")]
    pub capacity: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Flush retry attempts before a batch is dropped.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Drain deadline on close (ms).
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
}

impl GatewayConfig {
    /// Load configuration from a YAML file merged with `TOLLGATE_`-prefixed
    /// environment variables (`TOLLGATE_PROXY__HTTP_ADDR`, ...).
    pub fn load(config_path: &Path) -> anyhow::Result<Self> {
        let figment = Figment::new()
            .merge(Yaml::file(config_path))
            .merge(Env::prefixed("TOLLGATE_").split("__"));
        Ok(figment.extract()?)
    }

    pub fn effective_workers(&self) -> usize {
        if self.proxy.workers > 0 {
            self.proxy.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy.request_timeout_ms)
    }
}

// Defaults

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            proxy: ProxyConfig::default(),
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            quota: QuotaConfig::default(),
            recorder: RecorderSettings::default(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            workers: 0,
            max_body_bytes: default_max_body_bytes(),
            max_inflight: default_max_inflight(),
            request_timeout_ms: default_request_timeout_ms(),
            keepalive_pool_size: default_pool_size(),
            stream_buf_bytes: default_stream_buf_bytes(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { fail_open: false }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            summary_ttl_secs: default_summary_ttl_secs(),
            warn_percent: default_warn_percent(),
        }
    }
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            capacity: default_recorder_capacity(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            max_attempts: default_max_attempts(),
            close_timeout_ms: default_close_timeout_ms(),
        }
    }
}

// Serde default functions

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_http_addr() -> SocketAddr {
    "0.0.0.0:9080".parse().unwrap()
}

fn default_max_body_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_max_inflight() -> i64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_pool_size() -> usize {
    32
}

fn default_stream_buf_bytes() -> usize {
    64 * 1024
}

fn default_key_prefix() -> String {
    "tg_".to_string()
}

fn default_summary_ttl_secs() -> u64 {
    60
}

fn default_warn_percent() -> f64 {
    80.0
}

fn default_recorder_capacity() -> usize {
    4096
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_close_timeout_ms() -> u64 {
    5000
}
