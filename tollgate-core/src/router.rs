use crate::route::{MatchType, Route};
use crate::upstream::Upstream;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tollgate_transform::{CompiledTransform, Program};
use tracing::warn;

/// Errors raised while compiling a snapshot. A failed build leaves the
/// previously installed snapshot in place (see `SnapshotCache`).
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("route {route_id}: invalid path regex '{pattern}': {source}")]
    PathRegex {
        route_id: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("route {route_id}: invalid regex for header '{header}': {source}")]
    HeaderRegex {
        route_id: String,
        header: String,
        #[source]
        source: regex::Error,
    },

    #[error("route {route_id}: bad transform: {source}")]
    Transform {
        route_id: String,
        #[source]
        source: tollgate_transform::ParseError,
    },

    #[error("route {route_id}: bad metering expression: {source}")]
    Metering {
        route_id: String,
        #[source]
        source: tollgate_transform::ParseError,
    },
}

/// A route with its regexes and expressions compiled, ready for the
/// per-request hot path.
#[derive(Debug)]
pub struct CompiledRoute {
    pub route: Route,

    /// Compiled path regex (match_type = regex only). Patterns are anchored
    /// at both ends: `^`/`$` are added when the pattern lacks them.
    path_regex: Option<Regex>,

    /// Longest literal prefix of the pattern, used for deterministic
    /// tie-breaking between routes of equal priority.
    literal_prefix_len: usize,

    /// Compiled regexes parallel to `route.header_matches` (None for
    /// literal matches).
    header_regexes: Vec<Option<Regex>>,

    pub request_transform: Option<CompiledTransform>,
    pub response_transform: Option<CompiledTransform>,
    pub metering: Option<Program>,
}

impl CompiledRoute {
    pub fn compile(route: Route) -> Result<Self, CompileError> {
        let path_regex = if route.match_type == MatchType::Regex && !route.path_pattern.is_empty() {
            let anchored = anchor(&route.path_pattern);
            Some(Regex::new(&anchored).map_err(|source| CompileError::PathRegex {
                route_id: route.id.clone(),
                pattern: route.path_pattern.clone(),
                source,
            })?)
        } else {
            None
        };

        let mut header_regexes = Vec::with_capacity(route.header_matches.len());
        for hm in &route.header_matches {
            if hm.is_regex {
                let re = Regex::new(&hm.value).map_err(|source| CompileError::HeaderRegex {
                    route_id: route.id.clone(),
                    header: hm.name.clone(),
                    source,
                })?;
                header_regexes.push(Some(re));
            } else {
                header_regexes.push(None);
            }
        }

        let request_transform = match &route.request_transform {
            Some(spec) if !spec.is_empty() => Some(CompiledTransform::compile(spec).map_err(
                |source| CompileError::Transform {
                    route_id: route.id.clone(),
                    source,
                },
            )?),
            _ => None,
        };
        let response_transform = match &route.response_transform {
            Some(spec) if !spec.is_empty() => Some(CompiledTransform::compile(spec).map_err(
                |source| CompileError::Transform {
                    route_id: route.id.clone(),
                    source,
                },
            )?),
            _ => None,
        };
        let metering = match &route.metering_expr {
            Some(src) => Some(Program::parse(src).map_err(|source| CompileError::Metering {
                route_id: route.id.clone(),
                source,
            })?),
            None => None,
        };

        let literal_prefix_len = literal_prefix_len(&route.path_pattern, route.match_type);

        Ok(Self {
            route,
            path_regex,
            literal_prefix_len,
            header_regexes,
            request_transform,
            response_transform,
            metering,
        })
    }

    /// Test the path. Returns captures and the matched prefix length.
    fn match_path(&self, path: &str) -> Option<(BTreeMap<String, String>, usize)> {
        let pattern = &self.route.path_pattern;
        if pattern.is_empty() {
            return None;
        }
        match self.route.match_type {
            MatchType::Exact => {
                if path == pattern {
                    Some((BTreeMap::new(), path.len()))
                } else {
                    None
                }
            }
            MatchType::Prefix => {
                if pattern == "/" {
                    return Some((BTreeMap::new(), 1));
                }
                let trimmed = pattern.strip_suffix('/').unwrap_or(pattern);
                if path == trimmed {
                    return Some((BTreeMap::new(), trimmed.len()));
                }
                if let Some(rest) = path.strip_prefix(trimmed) {
                    // Prefix matches only on a `/` boundary.
                    if rest.starts_with('/') {
                        return Some((BTreeMap::new(), trimmed.len()));
                    }
                }
                None
            }
            MatchType::Regex => {
                let re = self.path_regex.as_ref()?;
                let caps = re.captures(path)?;
                let mut out = BTreeMap::new();
                for (i, group) in caps.iter().enumerate().skip(1) {
                    if let Some(m) = group {
                        out.insert(i.to_string(), m.as_str().to_string());
                    }
                }
                for name in re.capture_names().flatten() {
                    if let Some(m) = caps.name(name) {
                        out.insert(name.to_string(), m.as_str().to_string());
                    }
                }
                let full = caps.get(0).map(|m| m.len()).unwrap_or(0);
                Some((out, full))
            }
        }
    }

    /// All header predicates must pass: required ones must be present and
    /// match; optional ones must match when present.
    fn match_headers(&self, headers: &[(&str, &str)]) -> bool {
        for (hm, re) in self.route.header_matches.iter().zip(&self.header_regexes) {
            let found = headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(&hm.name))
                .map(|(_, value)| *value);
            match found {
                None => {
                    if hm.required {
                        return false;
                    }
                }
                Some(value) => {
                    let ok = match re {
                        Some(re) => re.is_match(value),
                        None => value.eq_ignore_ascii_case(&hm.value),
                    };
                    if !ok {
                        return false;
                    }
                }
            }
        }
        true
    }
}

/// Result of a route match.
#[derive(Debug)]
pub struct RouteMatch<'a> {
    pub route: &'a CompiledRoute,

    /// Position of `route` in `Snapshot::routes()`, for callers that hold
    /// the snapshot by `Arc` and need to reach the compiled route later.
    pub route_index: usize,

    /// Resolved upstream binding; `None` when the route references a
    /// missing or disabled upstream (the pipeline answers 502).
    pub upstream: Option<&'a Upstream>,

    /// Regex capture groups, numbered (`"1"`, ...) and named.
    pub captures: BTreeMap<String, String>,

    pub matched_prefix_len: usize,
}

/// Immutable compiled view of the enabled routes and upstreams.
///
/// Built by the `SnapshotCache`, shared with workers behind an `Arc`, and
/// replaced wholesale on invalidation. Readers holding an old snapshot keep
/// a consistent view for the remainder of their request.
#[derive(Debug)]
pub struct Snapshot {
    pub revision: u64,
    routes: Vec<CompiledRoute>,
    upstreams: HashMap<String, Upstream>,
}

impl Snapshot {
    pub fn empty(revision: u64) -> Self {
        Self {
            revision,
            routes: Vec::new(),
            upstreams: HashMap::new(),
        }
    }

    /// Compile and order routes. Disabled entries are dropped; a route
    /// naming an unknown upstream stays matchable (and 502s at dispatch),
    /// which keeps config mistakes observable instead of silently 404ing.
    pub fn build(
        revision: u64,
        routes: Vec<Route>,
        upstreams: Vec<Upstream>,
    ) -> Result<Self, CompileError> {
        let mut compiled = Vec::with_capacity(routes.len());
        for route in routes {
            if !route.enabled {
                continue;
            }
            if route.path_pattern.is_empty() {
                warn!(route_id = %route.id, "Route has empty path_pattern and will never match");
            }
            compiled.push(CompiledRoute::compile(route)?);
        }

        // Priority desc, then longer literal prefix, then id asc.
        compiled.sort_by(|a, b| {
            b.route
                .priority
                .cmp(&a.route.priority)
                .then(b.literal_prefix_len.cmp(&a.literal_prefix_len))
                .then(a.route.id.cmp(&b.route.id))
        });

        let upstreams = upstreams
            .into_iter()
            .filter(|u| u.enabled)
            .map(|u| (u.id.clone(), u))
            .collect();

        Ok(Self {
            revision,
            routes: compiled,
            upstreams,
        })
    }

    /// Match an incoming request. First match in priority order wins.
    pub fn match_route(
        &self,
        method: &str,
        path: &str,
        headers: &[(&str, &str)],
    ) -> Option<RouteMatch<'_>> {
        for (route_index, compiled) in self.routes.iter().enumerate() {
            if !compiled.route.method_allowed(method) {
                continue;
            }
            let Some((captures, matched_prefix_len)) = compiled.match_path(path) else {
                continue;
            };
            if !compiled.match_headers(headers) {
                continue;
            }
            return Some(RouteMatch {
                route: compiled,
                route_index,
                upstream: self.upstreams.get(&compiled.route.upstream_id),
                captures,
                matched_prefix_len,
            });
        }
        None
    }

    pub fn routes(&self) -> &[CompiledRoute] {
        &self.routes
    }

    pub fn upstream(&self, id: &str) -> Option<&Upstream> {
        self.upstreams.get(id)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn upstream_count(&self) -> usize {
        self.upstreams.len()
    }

    /// All dialable upstream addresses (for pool pre-warming).
    pub fn upstream_addresses(&self) -> Vec<String> {
        let mut addrs = Vec::new();
        for ups in self.upstreams.values() {
            if let Ok(ep) = ups.endpoint() {
                if !addrs.contains(&ep.addr) {
                    addrs.push(ep.addr);
                }
            }
        }
        addrs
    }
}

/// Anchor a user-supplied path regex at both ends.
fn anchor(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 2);
    if !pattern.starts_with('^') {
        out.push('^');
    }
    out.push_str(pattern);
    if !pattern.ends_with('$') {
        out.push('$');
    }
    out
}

/// Length of the leading literal part of a pattern. For exact/prefix
/// matches that is the whole pattern; for regexes, everything before the
/// first metacharacter (after a leading `^`).
fn literal_prefix_len(pattern: &str, match_type: MatchType) -> usize {
    match match_type {
        MatchType::Exact | MatchType::Prefix => pattern.len(),
        MatchType::Regex => {
            let body = pattern.strip_prefix('^').unwrap_or(pattern);
            body.chars()
                .take_while(|c| !"\\.[]{}()*+?|^$".contains(*c))
                .map(|c| c.len_utf8())
                .sum()
        }
    }
}
