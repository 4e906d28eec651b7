use crate::auth::{AuthSuccess, Authenticator, check_scope};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tollgate_core::config::GatewayConfig;
use tollgate_core::error::GatewayError;
use tollgate_core::route::Protocol;
use tollgate_core::router::{CompiledRoute, Snapshot};
use tollgate_core::upstream::Upstream;
use tollgate_core::usage::{EventSource, UsageEvent};
use tollgate_metering::{Admission, QuotaChecker, QuotaDecision, RateLimiter, UsageRecorder};
use tollgate_store::{PlanStore, SnapshotCache};
use tollgate_transform::{
    ErrorThrottle, EvalLimits, RequestParts, ResponseParts, Scope, TransformError, apply_request,
    eval, expand_template, to_display,
};
use tracing::{error, warn};

/// Rate-limit numbers attached to every authenticated response.
#[derive(Debug, Clone, Copy)]
pub struct RateHeaders {
    pub limit: i64,
    pub remaining: i64,
    pub reset_unix: i64,
}

/// Soft-quota annotation for the response.
#[derive(Debug, Clone, Copy)]
pub enum QuotaFlag {
    /// Past the warning threshold: `X-Quota-Warning: <percent>`.
    Warning(f64),
    /// Past a soft quota: `X-Quota-Exceeded: true`.
    Exceeded,
}

/// Everything the connection layer needs to decorate the response and
/// record exactly one usage event for this request.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_id: String,
    pub route_id: String,
    pub key_id: String,
    pub user_id: String,
    pub method: String,
    pub path: String,
    pub ip: String,
    pub user_agent: String,
    pub request_bytes: u64,
    pub cost_multiplier: f64,
    pub rate: Option<RateHeaders>,
    pub quota: Option<QuotaFlag>,
    pub retry_after_secs: Option<u64>,
}

/// What the connection should do after the pipeline ran.
pub enum PipelineOutcome {
    /// Terminal: write this response and record the event.
    Reply {
        response: ResponseParts,
        meta: RequestMeta,
    },

    /// Forward the rewritten request upstream.
    Forward(Box<ForwardPlan>),
}

/// A fully admitted, transformed request bound to its upstream.
pub struct ForwardPlan {
    pub snapshot: Arc<Snapshot>,
    pub route_index: usize,
    pub request: RequestParts,
    pub upstream: Upstream,
    pub protocol: Protocol,
    /// Evaluation scope reused by the response transform.
    pub scope: Scope,
    pub meta: RequestMeta,
}

impl ForwardPlan {
    pub fn route(&self) -> &CompiledRoute {
        &self.snapshot.routes()[self.route_index]
    }
}

/// The request-processing pipeline:
/// match → authenticate → rate limit → quota → transform → (dispatch).
///
/// Pure CPU + store lookups; all upstream I/O lives in the connection
/// layer. One instance is shared by every worker.
pub struct Pipeline {
    snapshots: Arc<SnapshotCache>,
    authenticator: Authenticator,
    limiter: RateLimiter,
    quota: QuotaChecker,
    plans: Arc<dyn PlanStore>,
    recorder: Arc<UsageRecorder>,
    throttle: ErrorThrottle,
    config: Arc<GatewayConfig>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        snapshots: Arc<SnapshotCache>,
        authenticator: Authenticator,
        limiter: RateLimiter,
        quota: QuotaChecker,
        plans: Arc<dyn PlanStore>,
        recorder: Arc<UsageRecorder>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            snapshots,
            authenticator,
            limiter,
            quota,
            plans,
            recorder,
            throttle: ErrorThrottle::default(),
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn recorder(&self) -> &Arc<UsageRecorder> {
        &self.recorder
    }

    /// Run the admission and transform stages for one parsed request.
    pub fn handle(&self, mut req: RequestParts, client_ip: &str) -> PipelineOutcome {
        let request_id = req
            .header("x-request-id")
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string())
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

        let mut meta = RequestMeta {
            request_id,
            route_id: String::new(),
            key_id: String::new(),
            user_id: String::new(),
            method: req.method.clone(),
            path: req.path.clone(),
            ip: client_ip.to_string(),
            user_agent: req.header("user-agent").unwrap_or("").to_string(),
            request_bytes: req.body.len() as u64,
            cost_multiplier: 1.0,
            rate: None,
            quota: None,
            retry_after_secs: None,
        };

        // ── [1] Route match ──
        let snapshot = match self.snapshots.current() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // Build failure surfaces once; requests continue on the
                // previously installed snapshot.
                error!(request_id = %meta.request_id, error = %e, "Snapshot rebuild failed");
                self.snapshots.latest()
            }
        };

        let header_refs: Vec<(&str, &str)> = req
            .headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let matched = match snapshot.match_route(&req.method, &req.path, &header_refs) {
            Some(m) => m,
            None => {
                let err = GatewayError::RouteNotFound(req.path.clone());
                return self.reply(err, meta);
            }
        };
        meta.route_id = matched.route.route.id.clone();
        let route_index = matched.route_index;
        let captures = matched.captures;
        let upstream = matched.upstream.cloned();
        let route = &snapshot.routes()[route_index];

        // ── [2] Authenticate ──
        let AuthSuccess { principal, user } = match self.authenticator.authenticate(&header_refs) {
            Ok(ok) => ok,
            Err(e) => return self.reply(e, meta),
        };
        meta.key_id = principal.key_id.clone();
        meta.user_id = principal.user_id.clone();

        if let Err(e) = check_scope(&principal, route.route.required_scope.as_deref()) {
            return self.reply(e, meta);
        }

        let plan = match self.plans.get(&principal.plan_id) {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                warn!(plan_id = %principal.plan_id, "Principal references unknown plan");
                return self.reply(
                    GatewayError::Internal(format!("plan {} not found", principal.plan_id)),
                    meta,
                );
            }
            Err(e) => return self.reply(GatewayError::StoreUnavailable(e.to_string()), meta),
        };

        let now = Utc::now();

        // ── [3] Rate limit ──
        match self
            .limiter
            .admit(&principal.key_id, plan.rate_limit_per_minute, now.timestamp())
        {
            Ok(Admission::Unlimited) => {}
            Ok(Admission::Allowed {
                limit,
                remaining,
                reset_unix,
            }) => {
                meta.rate = Some(RateHeaders {
                    limit,
                    remaining,
                    reset_unix,
                });
            }
            Ok(Admission::Denied {
                limit,
                retry_after_secs,
                reset_unix,
            }) => {
                meta.rate = Some(RateHeaders {
                    limit,
                    remaining: 0,
                    reset_unix,
                });
                meta.retry_after_secs = Some(retry_after_secs);
                return self.reply(GatewayError::RateLimitExceeded, meta);
            }
            Err(e) => return self.reply(e, meta),
        }

        // ── [4] Quota ──
        match self.quota.check(&principal.user_id, &plan, now) {
            Ok(QuotaDecision::Allow) => {}
            Ok(QuotaDecision::Warn { percent, exceeded }) => {
                meta.quota = Some(if exceeded {
                    QuotaFlag::Exceeded
                } else {
                    QuotaFlag::Warning(percent)
                });
            }
            Ok(QuotaDecision::Block { .. }) => {
                return self.reply(GatewayError::QuotaExceeded, meta);
            }
            Err(e) => return self.reply(e, meta),
        }

        // ── [5] Request transform ──
        let mut scope = Scope::new(now.timestamp() as f64);
        scope.bind(
            "user",
            json!({
                "id": user.id,
                "email": user.email,
                "plan_id": user.plan_id,
            }),
        );
        scope.bind(
            "key",
            json!({
                "id": principal.key_id,
                "scopes": principal.scopes,
            }),
        );
        scope.bind(
            "plan",
            json!({
                "id": plan.id,
                "name": plan.name,
                "rate_limit_per_minute": plan.rate_limit_per_minute,
                "requests_per_month": plan.requests_per_month,
            }),
        );
        scope.bind("captures", json!(&captures));
        scope.bind("env", json!({ "node_id": self.config.node_id.clone() }));
        scope.bind(
            "req",
            json!({
                "method": req.method.clone(),
                "path": req.path.clone(),
                "query": req.query.iter().cloned().collect::<std::collections::BTreeMap<_, _>>(),
                "headers": req.headers.iter()
                    .map(|(k, v)| (k.to_lowercase(), v.clone()))
                    .collect::<std::collections::BTreeMap<_, _>>(),
            }),
        );

        if let Some(template) = &route.route.path_rewrite {
            req.path = expand_template(template, &captures);
        }
        if let Some(method) = &route.route.method_override {
            req.method = method.to_uppercase();
        }

        if let Some(transform) = &route.request_transform {
            if let Err(e) = apply_request(
                transform,
                &mut req,
                &mut scope,
                EvalLimits::default(),
                &self.throttle,
                &route.route.id,
            ) {
                let err = match e {
                    TransformError::BodyNotJson(msg) => GatewayError::MalformedRequest(msg),
                    TransformError::Body(e) => GatewayError::TransformFailed(e.to_string()),
                };
                return self.reply(err, meta);
            }
        }

        // Metering multiplier; evaluation failures degrade to cost 1.
        if let Some(program) = &route.metering {
            match eval(program, &scope, EvalLimits::default()) {
                Ok(v) => {
                    let m = v.as_f64().unwrap_or_else(|| {
                        to_display(&v).parse().unwrap_or(1.0)
                    });
                    meta.cost_multiplier = if m.is_finite() { m.max(0.0) } else { 1.0 };
                }
                Err(e) => {
                    if self.throttle.should_log(&format!("{}:metering", route.route.id)) {
                        warn!(route_id = %route.route.id, error = %e, "Metering expression failed, using cost 1");
                    }
                }
            }
        }

        // ── [6] Upstream binding ──
        let Some(upstream) = upstream else {
            let err = GatewayError::UpstreamUnreachable(format!(
                "upstream {} is not available",
                route.route.upstream_id
            ));
            return self.reply(err, meta);
        };

        let protocol = route.route.protocol;
        PipelineOutcome::Forward(Box::new(ForwardPlan {
            snapshot: Arc::clone(&snapshot),
            route_index,
            request: req,
            upstream,
            protocol,
            scope,
            meta,
        }))
    }

    /// Build a terminal error response.
    pub fn reply(&self, err: GatewayError, meta: RequestMeta) -> PipelineOutcome {
        warn!(
            request_id = %meta.request_id,
            route_id = %meta.route_id,
            key_id = %meta.key_id,
            kind = err.kind(),
            status = err.status_code(),
            "Request rejected"
        );
        let response = error_response(&err, &meta);
        PipelineOutcome::Reply { response, meta }
    }

    /// Apply the route's response transform to a buffered response.
    /// Header directives are soft; body failures are hard.
    pub fn transform_response(
        &self,
        route: &CompiledRoute,
        resp: &mut ResponseParts,
        scope: &mut Scope,
    ) -> Result<(), GatewayError> {
        let Some(transform) = &route.response_transform else {
            return Ok(());
        };
        tollgate_transform::apply_response(
            transform,
            resp,
            scope,
            EvalLimits::default(),
            &self.throttle,
            &route.route.id,
        )
        .map_err(|e| match e {
            TransformError::BodyNotJson(msg) => GatewayError::UpstreamProtocolError(format!(
                "upstream body is not valid JSON: {}",
                msg
            )),
            TransformError::Body(e) => GatewayError::TransformFailed(e.to_string()),
        })
    }

    /// Build the usage event for a finished request. Exactly one event per
    /// response the gateway produced, cancellations included.
    pub fn build_event(
        &self,
        meta: &RequestMeta,
        status: u16,
        latency_ms: u64,
        response_bytes: u64,
    ) -> UsageEvent {
        UsageEvent {
            id: uuid::Uuid::new_v4().to_string(),
            key_id: meta.key_id.clone(),
            user_id: meta.user_id.clone(),
            method: meta.method.clone(),
            path: meta.path.clone(),
            status_code: status,
            latency_ms,
            request_bytes: meta.request_bytes,
            response_bytes,
            cost_multiplier: meta.cost_multiplier,
            ip: meta.ip.clone(),
            user_agent: meta.user_agent.clone(),
            timestamp: Utc::now(),
            source: EventSource::Proxy,
            event_type: String::new(),
            resource_id: String::new(),
            resource_type: String::new(),
            source_name: String::new(),
            quantity: 1.0,
            metadata: serde_json::Value::Null,
        }
    }

    /// Enqueue the event; never blocks, never fails the request.
    pub fn record(&self, event: UsageEvent) {
        self.recorder.record(event);
    }
}

/// Build a decorated JSON error response for a request that terminated
/// inside the gateway.
pub fn error_response(err: &GatewayError, meta: &RequestMeta) -> ResponseParts {
    let mut response = ResponseParts {
        status: err.status_code(),
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body: err.to_json_body(&meta.request_id),
    };
    decorate_response(&mut response, meta);
    response
}

/// A meta for requests that never reached the pipeline (parse failures,
/// overload shedding). Carries a fresh request id so even those responses
/// and events are correlatable.
pub fn bare_meta(method: &str, path: &str, client_ip: &str) -> RequestMeta {
    RequestMeta {
        request_id: uuid::Uuid::new_v4().simple().to_string(),
        route_id: String::new(),
        key_id: String::new(),
        user_id: String::new(),
        method: method.to_string(),
        path: path.to_string(),
        ip: client_ip.to_string(),
        user_agent: String::new(),
        request_bytes: 0,
        cost_multiplier: 1.0,
        rate: None,
        quota: None,
        retry_after_secs: None,
    }
}

/// Attach the gateway's response headers: request id, rate-limit trio,
/// quota annotations, Retry-After on 429.
pub fn decorate_response(response: &mut ResponseParts, meta: &RequestMeta) {
    response.set_header("x-request-id", meta.request_id.clone());
    if let Some(rate) = &meta.rate {
        response.set_header("x-ratelimit-limit", rate.limit.to_string());
        response.set_header("x-ratelimit-remaining", rate.remaining.max(0).to_string());
        response.set_header("x-ratelimit-reset", rate.reset_unix.to_string());
    }
    match meta.quota {
        Some(QuotaFlag::Warning(percent)) => {
            response.set_header("x-quota-warning", format!("{:.0}", percent));
        }
        Some(QuotaFlag::Exceeded) => {
            response.set_header("x-quota-exceeded", "true".to_string());
        }
        None => {}
    }
    if let Some(secs) = meta.retry_after_secs {
        response.set_header("retry-after", secs.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use tollgate_core::key::{ApiKey, generate_key};
    use tollgate_metering::RecorderConfig;
    use tollgate_store::{
        MemoryKeyStore, MemoryPlanStore, MemoryRateLimitStore, MemoryRouteStore,
        MemoryUpstreamStore, MemoryUsageStore, MemoryUserStore,
    };

    struct Fixture {
        pipeline: Pipeline,
        routes: Arc<MemoryRouteStore>,
        usage: Arc<MemoryUsageStore>,
        keys: Arc<MemoryKeyStore>,
        raw_key: String,
    }

    fn fixture() -> Fixture {
        fixture_with_rate(100)
    }

    fn fixture_with_rate(rate_per_min: i64) -> Fixture {
        let keys = Arc::new(MemoryKeyStore::new());
        let users = Arc::new(MemoryUserStore::new());
        let plans = Arc::new(MemoryPlanStore::new());
        let routes = Arc::new(MemoryRouteStore::new());
        let upstreams = Arc::new(MemoryUpstreamStore::new());
        let usage = Arc::new(MemoryUsageStore::new());
        let windows = Arc::new(MemoryRateLimitStore::new());

        users.insert(
            serde_json::from_value(serde_json::json!({
                "id": "u1", "email": "a@b.co", "plan_id": "pro",
            }))
            .unwrap(),
        );
        plans.insert(
            serde_json::from_value(serde_json::json!({
                "id": "pro", "name": "Pro",
                "rate_limit_per_minute": rate_per_min,
                "requests_per_month": 0,
            }))
            .unwrap(),
        );
        upstreams.insert(
            serde_json::from_value(serde_json::json!({
                "id": "u1", "base_url": "http://127.0.0.1:3001",
            }))
            .unwrap(),
        );
        routes.insert(
            serde_json::from_value(serde_json::json!({
                "id": "r1", "path_pattern": "/v1/echo", "upstream_id": "u1",
                "metering_expr": "1",
            }))
            .unwrap(),
        );

        let generated = generate_key("tg_");
        keys.insert(ApiKey {
            id: "k1".into(),
            user_id: "u1".into(),
            prefix: generated.prefix.clone(),
            hash: generated.hash.clone(),
            name: "test".into(),
            scopes: vec![],
            expires_at: None,
            revoked_at: None,
            created_at: Utc::now(),
            last_used: None,
        });

        let snapshots = SnapshotCache::new(routes.clone(), upstreams.clone()).unwrap();
        {
            let cache = Arc::clone(&snapshots);
            routes.set_on_change(Arc::new(move || cache.invalidate()));
        }

        let recorder = UsageRecorder::start(
            usage.clone(),
            RecorderConfig {
                flush_interval: Duration::from_millis(20),
                ..RecorderConfig::default()
            },
        );
        let config = Arc::new(GatewayConfig::default());

        let pipeline = Pipeline::new(
            Arc::clone(&snapshots),
            Authenticator::new(keys.clone(), users.clone()),
            RateLimiter::new(windows, false),
            QuotaChecker::new(usage.clone(), Duration::from_secs(0), 80.0),
            plans,
            recorder,
            config,
        );

        Fixture {
            pipeline,
            routes,
            usage,
            keys,
            raw_key: generated.raw,
        }
    }

    fn request(path: &str, key: Option<&str>) -> RequestParts {
        let mut headers = vec![("host".to_string(), "gw.example.com".to_string())];
        if let Some(key) = key {
            headers.push(("x-api-key".to_string(), key.to_string()));
        }
        RequestParts {
            method: "GET".into(),
            path: path.into(),
            query: vec![],
            headers,
            body: Vec::new(),
        }
    }

    fn expect_reply(outcome: PipelineOutcome) -> (ResponseParts, RequestMeta) {
        match outcome {
            PipelineOutcome::Reply { response, meta } => (response, meta),
            PipelineOutcome::Forward(_) => panic!("expected Reply, got Forward"),
        }
    }

    fn expect_forward(outcome: PipelineOutcome) -> Box<ForwardPlan> {
        match outcome {
            PipelineOutcome::Forward(plan) => plan,
            PipelineOutcome::Reply { response, .. } => {
                panic!("expected Forward, got Reply {}", response.status)
            }
        }
    }

    #[test]
    fn no_route_is_404() {
        let f = fixture();
        let (response, meta) = expect_reply(f.pipeline.handle(request("/nope", None), "1.2.3.4"));
        assert_eq!(response.status, 404);
        assert!(!meta.request_id.is_empty());
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["error"]["code"], "not_found");
    }

    #[test]
    fn missing_key_is_401() {
        let f = fixture();
        let (response, _) = expect_reply(f.pipeline.handle(request("/v1/echo", None), "1.2.3.4"));
        assert_eq!(response.status, 401);
    }

    #[test]
    fn valid_request_forwards_with_rate_headers() {
        let f = fixture();
        let plan = expect_forward(
            f.pipeline
                .handle(request("/v1/echo", Some(&f.raw_key)), "1.2.3.4"),
        );
        assert_eq!(plan.meta.key_id, "k1");
        assert_eq!(plan.meta.user_id, "u1");
        assert_eq!(plan.meta.cost_multiplier, 1.0);
        let rate = plan.meta.rate.expect("rate headers set");
        assert_eq!(rate.limit, 100);
        assert_eq!(rate.remaining, 99);
        assert_eq!(plan.upstream.id, "u1");
    }

    #[test]
    fn request_id_is_preserved_when_present() {
        let f = fixture();
        let mut req = request("/v1/echo", Some(&f.raw_key));
        req.headers.push(("x-request-id".into(), "client-chosen".into()));
        let plan = expect_forward(f.pipeline.handle(req, "1.2.3.4"));
        assert_eq!(plan.meta.request_id, "client-chosen");
    }

    #[test]
    fn generated_request_id_is_16_bytes_hex() {
        let f = fixture();
        let plan = expect_forward(
            f.pipeline
                .handle(request("/v1/echo", Some(&f.raw_key)), "1.2.3.4"),
        );
        assert_eq!(plan.meta.request_id.len(), 32);
        assert!(plan.meta.request_id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn rate_limit_denial_is_429_with_retry_after() {
        let f = fixture_with_rate(2);
        let req = || request("/v1/echo", Some(&f.raw_key));
        assert!(matches!(
            f.pipeline.handle(req(), "1.2.3.4"),
            PipelineOutcome::Forward(_)
        ));
        assert!(matches!(
            f.pipeline.handle(req(), "1.2.3.4"),
            PipelineOutcome::Forward(_)
        ));
        let (response, meta) = expect_reply(f.pipeline.handle(req(), "1.2.3.4"));
        assert_eq!(response.status, 429);
        assert!(meta.retry_after_secs.unwrap_or(0) >= 1);
        let retry = response.header("retry-after").unwrap();
        assert!(retry.parse::<u64>().unwrap() >= 1);
        assert_eq!(response.header("x-ratelimit-remaining"), Some("0"));
    }

    #[test]
    fn regex_route_rewrites_path() {
        let f = fixture();
        f.routes.insert(
            serde_json::from_value(serde_json::json!({
                "id": "r2",
                "path_pattern": "^/u/(?P<uid>[0-9]+)/profile$",
                "match_type": "regex",
                "path_rewrite": "/users/${uid}",
                "upstream_id": "u1",
            }))
            .unwrap(),
        );
        let plan = expect_forward(
            f.pipeline
                .handle(request("/u/42/profile", Some(&f.raw_key)), "1.2.3.4"),
        );
        assert_eq!(plan.request.path, "/users/42");
        assert_eq!(plan.meta.path, "/u/42/profile", "event keeps the inbound path");
    }

    #[test]
    fn failing_header_transform_still_forwards() {
        let f = fixture();
        f.routes.insert(
            serde_json::from_value(serde_json::json!({
                "id": "r3",
                "path_pattern": "/soft",
                "upstream_id": "u1",
                "request_transform": {
                    "set_headers": { "X-Plan": "user.plan.undefined_field" }
                },
            }))
            .unwrap(),
        );
        let plan = expect_forward(
            f.pipeline
                .handle(request("/soft", Some(&f.raw_key)), "1.2.3.4"),
        );
        assert_eq!(plan.request.header("X-Plan"), None, "failed directive is skipped");
    }

    #[test]
    fn failing_body_transform_is_502() {
        let f = fixture();
        f.routes.insert(
            serde_json::from_value(serde_json::json!({
                "id": "r4",
                "path_pattern": "/hard",
                "upstream_id": "u1",
                "request_transform": { "body_expr": "reqBody.missing" },
            }))
            .unwrap(),
        );
        let mut req = request("/hard", Some(&f.raw_key));
        req.body = br#"{"a":1}"#.to_vec();
        let (response, _) = expect_reply(f.pipeline.handle(req, "1.2.3.4"));
        assert_eq!(response.status, 502);
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["error"]["code"], "transform_failed");
    }

    #[test]
    fn transform_sets_headers_from_scope() {
        let f = fixture();
        f.routes.insert(
            serde_json::from_value(serde_json::json!({
                "id": "r5",
                "path_pattern": "/decorated",
                "upstream_id": "u1",
                "request_transform": {
                    "set_headers": { "X-User": "user.id", "X-Plan-Name": "plan.name" }
                },
            }))
            .unwrap(),
        );
        let plan = expect_forward(
            f.pipeline
                .handle(request("/decorated", Some(&f.raw_key)), "1.2.3.4"),
        );
        assert_eq!(plan.request.header("x-user"), Some("u1"));
        assert_eq!(plan.request.header("x-plan-name"), Some("Pro"));
    }

    #[test]
    fn metering_expression_sets_multiplier() {
        let f = fixture();
        f.routes.insert(
            serde_json::from_value(serde_json::json!({
                "id": "r6",
                "path_pattern": "/costly",
                "upstream_id": "u1",
                "metering_expr": "2 * 1.5",
            }))
            .unwrap(),
        );
        let plan = expect_forward(
            f.pipeline
                .handle(request("/costly", Some(&f.raw_key)), "1.2.3.4"),
        );
        assert_eq!(plan.meta.cost_multiplier, 3.0);
    }

    #[test]
    fn scope_requirement_is_enforced() {
        let f = fixture();
        f.routes.insert(
            serde_json::from_value(serde_json::json!({
                "id": "r7",
                "path_pattern": "/scoped",
                "upstream_id": "u1",
                "required_scope": "admin",
            }))
            .unwrap(),
        );
        // Key has empty scopes (= all), so it passes.
        assert!(matches!(
            f.pipeline.handle(request("/scoped", Some(&f.raw_key)), "1.2.3.4"),
            PipelineOutcome::Forward(_)
        ));

        // A key with explicit non-matching scopes is refused.
        let generated = generate_key("tg_");
        f.keys.insert(ApiKey {
            id: "k2".into(),
            user_id: "u1".into(),
            prefix: generated.prefix.clone(),
            hash: generated.hash.clone(),
            name: "narrow".into(),
            scopes: vec!["read".into()],
            expires_at: None,
            revoked_at: None,
            created_at: Utc::now(),
            last_used: None,
        });
        let (response, _) = expect_reply(
            f.pipeline
                .handle(request("/scoped", Some(&generated.raw)), "1.2.3.4"),
        );
        assert_eq!(response.status, 403);
    }

    #[test]
    fn missing_upstream_is_502() {
        let f = fixture();
        f.routes.insert(
            serde_json::from_value(serde_json::json!({
                "id": "r8", "path_pattern": "/lost", "upstream_id": "ghost",
            }))
            .unwrap(),
        );
        let (response, _) = expect_reply(
            f.pipeline
                .handle(request("/lost", Some(&f.raw_key)), "1.2.3.4"),
        );
        assert_eq!(response.status, 502);
    }

    #[test]
    fn usage_event_carries_meta() {
        let f = fixture();
        let plan = expect_forward(
            f.pipeline
                .handle(request("/v1/echo", Some(&f.raw_key)), "9.9.9.9"),
        );
        let event = f.pipeline.build_event(&plan.meta, 200, 12, 345);
        assert_eq!(event.key_id, "k1");
        assert_eq!(event.user_id, "u1");
        assert_eq!(event.status_code, 200);
        assert_eq!(event.latency_ms, 12);
        assert_eq!(event.response_bytes, 345);
        assert_eq!(event.cost_multiplier, 1.0);
        assert_eq!(event.ip, "9.9.9.9");
        assert_eq!(event.source, EventSource::Proxy);
        assert_eq!(event.quantity, 1.0);

        f.pipeline.record(event);
        assert!(f.pipeline.recorder().flush());
        assert_eq!(f.usage.len(), 1);
    }

    #[test]
    fn decorate_adds_rate_and_quota_headers() {
        let mut response = ResponseParts {
            status: 200,
            headers: vec![],
            body: vec![],
        };
        let meta = RequestMeta {
            request_id: "rid".into(),
            route_id: "r1".into(),
            key_id: "k1".into(),
            user_id: "u1".into(),
            method: "GET".into(),
            path: "/v1".into(),
            ip: "1.1.1.1".into(),
            user_agent: String::new(),
            request_bytes: 0,
            cost_multiplier: 1.0,
            rate: Some(RateHeaders {
                limit: 100,
                remaining: 42,
                reset_unix: 1_700_000_060,
            }),
            quota: Some(QuotaFlag::Warning(85.0)),
            retry_after_secs: None,
        };
        decorate_response(&mut response, &meta);
        assert_eq!(response.header("x-request-id"), Some("rid"));
        assert_eq!(response.header("x-ratelimit-limit"), Some("100"));
        assert_eq!(response.header("x-ratelimit-remaining"), Some("42"));
        assert_eq!(response.header("x-ratelimit-reset"), Some("1700000060"));
        assert_eq!(response.header("x-quota-warning"), Some("85"));
    }
}
