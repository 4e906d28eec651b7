use crate::eval::{EvalError, EvalLimits, Scope, eval, to_display};
use crate::expr::{ParseError, Program};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

/// Declarative transform attached to a route. Header/query values and the
/// body are expression source strings, compiled once at snapshot build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformSpec {
    #[serde(default)]
    pub set_headers: BTreeMap<String, String>,

    #[serde(default)]
    pub delete_headers: Vec<String>,

    #[serde(default)]
    pub set_query: BTreeMap<String, String>,

    #[serde(default)]
    pub delete_query: Vec<String>,

    #[serde(default)]
    pub body_expr: Option<String>,
}

impl TransformSpec {
    pub fn is_empty(&self) -> bool {
        self.set_headers.is_empty()
            && self.delete_headers.is_empty()
            && self.set_query.is_empty()
            && self.delete_query.is_empty()
            && self.body_expr.is_none()
    }
}

/// Errors surfaced by transform application. Only body expressions are
/// hard failures; header/query directives are skipped with a throttled log.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("body expression failed: {0}")]
    Body(#[from] EvalError),

    #[error("request body is not valid JSON: {0}")]
    BodyNotJson(String),
}

/// A `TransformSpec` with every expression parsed.
#[derive(Debug)]
pub struct CompiledTransform {
    set_headers: Vec<(String, Program)>,
    delete_headers: Vec<String>,
    set_query: Vec<(String, Program)>,
    delete_query: Vec<String>,
    body: Option<Program>,
}

impl CompiledTransform {
    pub fn compile(spec: &TransformSpec) -> Result<Self, ParseError> {
        let mut set_headers = Vec::with_capacity(spec.set_headers.len());
        for (name, src) in &spec.set_headers {
            set_headers.push((name.clone(), Program::parse(src)?));
        }
        let mut set_query = Vec::with_capacity(spec.set_query.len());
        for (name, src) in &spec.set_query {
            set_query.push((name.clone(), Program::parse(src)?));
        }
        let body = match &spec.body_expr {
            Some(src) => Some(Program::parse(src)?),
            None => None,
        };
        Ok(Self {
            set_headers,
            delete_headers: spec.delete_headers.clone(),
            set_query,
            delete_query: spec.delete_query.clone(),
            body,
        })
    }

    pub fn has_body_expr(&self) -> bool {
        self.body.is_some()
    }
}

// ── HTTP parts ───────────────────────────────────────────────

/// Decomposed request the pipeline carries between parsing and dispatch.
#[derive(Debug, Clone, Default)]
pub struct RequestParts {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RequestParts {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: String) {
        for (k, v) in &mut self.headers {
            if k.eq_ignore_ascii_case(name) {
                *v = value;
                return;
            }
        }
        self.headers.push((name.to_string(), value));
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// Reassemble path + query for the wire.
    pub fn uri(&self) -> String {
        if self.query.is_empty() {
            return self.path.clone();
        }
        let qs: Vec<String> = self
            .query
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{}={}", k, v)
                }
            })
            .collect();
        format!("{}?{}", self.path, qs.join("&"))
    }
}

/// Decomposed upstream response, for the buffered path only.
#[derive(Debug, Clone, Default)]
pub struct ResponseParts {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ResponseParts {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: String) {
        for (k, v) in &mut self.headers {
            if k.eq_ignore_ascii_case(name) {
                *v = value;
                return;
            }
        }
        self.headers.push((name.to_string(), value));
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }
}

// ── Error throttle ───────────────────────────────────────────

/// Suppresses repeat logs for the same (route, directive) failure.
/// One log line per key per period; entries are pruned lazily.
pub struct ErrorThrottle {
    seen: DashMap<String, Instant>,
    period: Duration,
}

impl ErrorThrottle {
    pub fn new(period: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            period,
        }
    }

    /// Returns true when the caller should emit a log line for this key.
    pub fn should_log(&self, key: &str) -> bool {
        use dashmap::mapref::entry::Entry;
        let now = Instant::now();
        match self.seen.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if now.duration_since(*e.get()) >= self.period {
                    e.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(e) => {
                e.insert(now);
                true
            }
        }
    }
}

impl Default for ErrorThrottle {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

// ── Application ──────────────────────────────────────────────

fn is_json_content(content_type: Option<&str>) -> bool {
    match content_type {
        None => true,
        Some(v) => {
            let v = v.to_ascii_lowercase();
            v.contains("application/json") || v.contains("+json")
        }
    }
}

fn apply_soft_directive(
    program: &Program,
    scope: &Scope,
    limits: EvalLimits,
    throttle: &ErrorThrottle,
    route_id: &str,
    directive: &str,
) -> Option<String> {
    match eval(program, scope, limits) {
        Ok(v) => Some(to_display(&v)),
        Err(e) => {
            if throttle.should_log(&format!("{}:{}", route_id, directive)) {
                warn!(
                    route_id = %route_id,
                    directive = %directive,
                    expr = %program.src(),
                    error = %e,
                    "Transform directive failed, skipping"
                );
            }
            None
        }
    }
}

/// Apply header/query/body directives to a request.
///
/// Header and query failures skip the directive (throttled warn). A failing
/// body expression is a hard error; so is a JSON-typed body that does not
/// parse.
pub fn apply_request(
    ct: &CompiledTransform,
    req: &mut RequestParts,
    scope: &mut Scope,
    limits: EvalLimits,
    throttle: &ErrorThrottle,
    route_id: &str,
) -> Result<(), TransformError> {
    for (name, program) in &ct.set_headers {
        let directive = format!("set_header:{}", name);
        if let Some(v) = apply_soft_directive(program, scope, limits, throttle, route_id, &directive)
        {
            req.set_header(name, v);
        }
    }
    for name in &ct.delete_headers {
        req.remove_header(name);
    }
    for (name, program) in &ct.set_query {
        let directive = format!("set_query:{}", name);
        if let Some(v) = apply_soft_directive(program, scope, limits, throttle, route_id, &directive)
        {
            set_query_param(&mut req.query, name, v);
        }
    }
    for name in &ct.delete_query {
        req.query.retain(|(k, _)| k != name);
    }

    if let Some(program) = &ct.body {
        // Only JSON (or untyped) bodies are rewritten; anything else passes
        // through untouched.
        if !is_json_content(req.header("content-type")) {
            return Ok(());
        }
        let current: Value = if req.body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&req.body)
                .map_err(|e| TransformError::BodyNotJson(e.to_string()))?
        };
        scope.bind("reqBody", current);
        let out = eval(program, scope, limits)?;
        req.body = serde_json::to_vec(&out).unwrap_or_default();
        req.set_header("content-type", "application/json".to_string());
    }
    Ok(())
}

/// Apply header/body directives to a buffered response. Never called for
/// streaming bodies.
pub fn apply_response(
    ct: &CompiledTransform,
    resp: &mut ResponseParts,
    scope: &mut Scope,
    limits: EvalLimits,
    throttle: &ErrorThrottle,
    route_id: &str,
) -> Result<(), TransformError> {
    for (name, program) in &ct.set_headers {
        let directive = format!("set_resp_header:{}", name);
        if let Some(v) = apply_soft_directive(program, scope, limits, throttle, route_id, &directive)
        {
            resp.set_header(name, v);
        }
    }
    for name in &ct.delete_headers {
        resp.remove_header(name);
    }

    if let Some(program) = &ct.body {
        if !is_json_content(resp.header("content-type")) {
            return Ok(());
        }
        let current: Value = if resp.body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&resp.body)
                .map_err(|e| TransformError::BodyNotJson(e.to_string()))?
        };
        scope.bind("respBody", current);
        let out = eval(program, scope, limits)?;
        resp.body = serde_json::to_vec(&out).unwrap_or_default();
        resp.set_header("content-type", "application/json".to_string());
    }
    Ok(())
}

fn set_query_param(query: &mut Vec<(String, String)>, name: &str, value: String) {
    for (k, v) in query.iter_mut() {
        if k == name {
            *v = value;
            return;
        }
    }
    query.push((name.to_string(), value));
}

/// Expand `${name}` references in a path-rewrite template from route
/// captures. Unknown names expand to the empty string.
pub fn expand_template(template: &str, captures: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(end) = template[i + 2..].find('}') {
                let name = &template[i + 2..i + 2 + end];
                if let Some(v) = captures.get(name) {
                    out.push_str(v);
                }
                i += end + 3;
                continue;
            }
        }
        let ch = template[i..].chars().next().unwrap_or('\u{fffd}');
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}
