//! Request matchers built from container labels.
//!
//! A container declares how requests are routed to it with labels under
//! [`MATCHER_LABEL_PREFIX`], for example
//! `com.caddyserver.http.matchers.host=app.example.com`. Each recognized
//! key maps to one [`MatcherKind`]; the kinds are tried in [`REGISTRY`]
//! order so a rebuilt [`MatcherSet`] always evaluates in the same order.
//!
//! A label whose value cannot be turned into a matcher is logged and
//! skipped. The rest of the container's matchers are still built.

use std::collections::HashMap;

use http::header::{HeaderName, CONTENT_TYPE, HOST};
use http::{Method, Request, Version};
use log::{debug, warn};
use thiserror::Error;

pub const MATCHER_LABEL_PREFIX: &str = "com.caddyserver.http.matchers.";

/// Every matcher kind, in evaluation order.
pub const REGISTRY: [MatcherKind; 6] = [
    MatcherKind::Protocol,
    MatcherKind::Host,
    MatcherKind::Method,
    MatcherKind::Path,
    MatcherKind::Query,
    MatcherKind::Header,
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MatcherError {
    #[error("empty matcher value")]
    Empty,
    #[error("unknown protocol `{0}`")]
    UnknownProtocol(String),
    #[error("invalid host `{0}`")]
    InvalidHost(String),
    #[error("invalid method `{0}`")]
    InvalidMethod(String),
    #[error("invalid query `{0}`: {1}")]
    InvalidQuery(String, &'static str),
    #[error("invalid header matcher `{0}`: {1}")]
    InvalidHeader(String, &'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherKind {
    Protocol,
    Host,
    Method,
    Path,
    Query,
    Header,
}

impl MatcherKind {
    /// The container label this kind is read from.
    pub fn label(self) -> &'static str {
        match self {
            MatcherKind::Protocol => "com.caddyserver.http.matchers.protocol",
            MatcherKind::Host => "com.caddyserver.http.matchers.host",
            MatcherKind::Method => "com.caddyserver.http.matchers.method",
            MatcherKind::Path => "com.caddyserver.http.matchers.path",
            MatcherKind::Query => "com.caddyserver.http.matchers.query",
            MatcherKind::Header => "com.caddyserver.http.matchers.header",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        REGISTRY.into_iter().find(|kind| kind.label() == label)
    }

    /// Parses a label value into an unprovisioned matcher.
    pub fn build(self, value: &str) -> Result<Matcher, MatcherError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(MatcherError::Empty);
        }

        match self {
            MatcherKind::Protocol => Protocol::parse(value).map(Matcher::Protocol),
            MatcherKind::Host => non_empty_list(value).map(Matcher::Host),
            MatcherKind::Method => non_empty_list(value)?
                .into_iter()
                .map(|m| {
                    Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                        .map_err(|_| MatcherError::InvalidMethod(m))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Matcher::Method),
            MatcherKind::Path => non_empty_list(value).map(Matcher::Path),
            MatcherKind::Query => parse_query_pattern(value).map(Matcher::Query),
            MatcherKind::Header => {
                let (name, pattern) = value
                    .split_once(':')
                    .ok_or_else(|| MatcherError::InvalidHeader(value.to_string(), "missing `:`"))?;
                let name = HeaderName::from_bytes(name.trim().as_bytes())
                    .map_err(|_| MatcherError::InvalidHeader(value.to_string(), "bad header name"))?;
                Ok(Matcher::Header {
                    name,
                    pattern: pattern.trim().to_string(),
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
    Grpc,
    Version(Version),
}

impl Protocol {
    fn parse(value: &str) -> Result<Self, MatcherError> {
        match value.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "grpc" => Ok(Protocol::Grpc),
            "http/1.0" => Ok(Protocol::Version(Version::HTTP_10)),
            "http/1.1" => Ok(Protocol::Version(Version::HTTP_11)),
            "http/2" => Ok(Protocol::Version(Version::HTTP_2)),
            "http/3" => Ok(Protocol::Version(Version::HTTP_3)),
            _ => Err(MatcherError::UnknownProtocol(value.to_string())),
        }
    }

    fn matches<B>(self, req: &Request<B>) -> bool {
        let https = req.uri().scheme_str() == Some("https");
        match self {
            Protocol::Http => !https,
            Protocol::Https => https,
            Protocol::Grpc => req
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|ct| ct.starts_with("application/grpc"))
                .unwrap_or(false),
            Protocol::Version(version) => req.version() == version,
        }
    }
}

/// A single predicate over an inbound request.
#[derive(Debug, Clone)]
pub enum Matcher {
    Protocol(Protocol),
    /// Any of the hosts; `*` stands for exactly one label.
    Host(Vec<String>),
    Method(Vec<Method>),
    /// Any of the patterns; `*` matches any run of characters.
    Path(Vec<String>),
    /// Every key must be present with one of its values (`*` for any).
    Query(Vec<(String, Vec<String>)>),
    Header { name: HeaderName, pattern: String },
}

impl Matcher {
    /// Normalizes a freshly built matcher. Fails when the value parsed but
    /// cannot match anything sensible.
    pub fn provision(&mut self) -> Result<(), MatcherError> {
        match self {
            Matcher::Host(hosts) => {
                for host in hosts.iter_mut() {
                    *host = host.to_ascii_lowercase();
                    if !valid_host_pattern(host) {
                        return Err(MatcherError::InvalidHost(host.clone()));
                    }
                }
            }
            Matcher::Path(patterns) => {
                for pattern in patterns.iter_mut() {
                    *pattern = pattern.to_lowercase();
                    while pattern.contains("**") {
                        *pattern = pattern.replace("**", "*");
                    }
                }
            }
            Matcher::Protocol(_) | Matcher::Method(_) | Matcher::Query(_) | Matcher::Header { .. } => {}
        }
        Ok(())
    }

    pub fn matches<B>(&self, req: &Request<B>) -> bool {
        match self {
            Matcher::Protocol(protocol) => protocol.matches(req),
            Matcher::Host(hosts) => match request_host(req) {
                Some(host) => hosts.iter().any(|pattern| host_matches(pattern, &host)),
                None => false,
            },
            Matcher::Method(methods) => methods.contains(req.method()),
            Matcher::Path(patterns) => {
                let path = req.uri().path().to_lowercase();
                patterns.iter().any(|pattern| glob_matches(pattern, &path))
            }
            Matcher::Query(wanted) => {
                let actual = parse_request_query(req.uri().query().unwrap_or(""));
                wanted.iter().all(|(key, values)| {
                    actual.get(key.as_str()).is_some_and(|got| {
                        values.iter().any(|v| v == "*" || got.contains(v))
                    })
                })
            }
            Matcher::Header { name, pattern } => req
                .headers()
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .any(|v| pattern == "*" || glob_matches(pattern, v)),
        }
    }
}

/// All matchers of one candidate; a request must satisfy every one.
#[derive(Debug, Clone, Default)]
pub struct MatcherSet(Vec<Matcher>);

impl MatcherSet {
    pub fn new(matchers: Vec<Matcher>) -> Self {
        Self(matchers)
    }

    /// An empty set matches every request.
    pub fn matches<B>(&self, req: &Request<B>) -> bool {
        self.0.iter().all(|m| m.matches(req))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Matcher> {
        self.0.iter()
    }
}

/// Builds the matcher set declared by a container's labels.
pub fn build_matchers(container_id: &str, labels: &HashMap<String, String>) -> MatcherSet {
    let mut matchers = Vec::new();

    for kind in REGISTRY {
        let Some(value) = labels.get(kind.label()) else {
            continue;
        };

        let built = kind.build(value).and_then(|mut matcher| {
            matcher.provision()?;
            Ok(matcher)
        });
        match built {
            Ok(matcher) => matchers.push(matcher),
            Err(e) => warn!(
                "Skipping matcher {}={:?} on container {}: {}",
                kind.label(),
                value,
                container_id,
                e
            ),
        }
    }

    for key in labels.keys() {
        if key.starts_with(MATCHER_LABEL_PREFIX) && MatcherKind::from_label(key).is_none() {
            debug!("Ignoring unknown matcher label {} on container {}", key, container_id);
        }
    }

    MatcherSet(matchers)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Like [`split_list`], but a list with no usable entry (`","`) is an error.
fn non_empty_list(value: &str) -> Result<Vec<String>, MatcherError> {
    let items = split_list(value);
    if items.is_empty() {
        return Err(MatcherError::Empty);
    }
    Ok(items)
}

fn parse_query_pattern(value: &str) -> Result<Vec<(String, Vec<String>)>, MatcherError> {
    let mut wanted: Vec<(String, Vec<String>)> = Vec::new();

    for pair in value.split('&').filter(|p| !p.is_empty()) {
        let (key, val) = pair
            .split_once('=')
            .ok_or_else(|| MatcherError::InvalidQuery(value.to_string(), "expected key=value"))?;
        let key = decode_component(key)
            .ok_or_else(|| MatcherError::InvalidQuery(value.to_string(), "bad percent-encoding"))?;
        if key.is_empty() {
            return Err(MatcherError::InvalidQuery(value.to_string(), "empty key"));
        }
        let val = decode_component(val)
            .ok_or_else(|| MatcherError::InvalidQuery(value.to_string(), "bad percent-encoding"))?;

        match wanted.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(val),
            None => wanted.push((key, vec![val])),
        }
    }

    if wanted.is_empty() {
        return Err(MatcherError::Empty);
    }
    Ok(wanted)
}

fn parse_request_query(query: &str) -> HashMap<String, Vec<String>> {
    let mut params: HashMap<String, Vec<String>> = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, val) = pair.split_once('=').unwrap_or((pair, ""));
        if let (Some(key), Some(val)) = (decode_component(key), decode_component(val)) {
            params.entry(key).or_default().push(val);
        }
    }
    params
}

fn decode_component(s: &str) -> Option<String> {
    urlencoding::decode(&s.replace('+', " "))
        .ok()
        .map(|c| c.into_owned())
}

fn request_host<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;

    let host = if let Some(rest) = raw.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else {
        match raw.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => raw,
        }
    };
    Some(host.trim_end_matches('.').to_ascii_lowercase())
}

fn valid_host_pattern(host: &str) -> bool {
    if host.contains(':') {
        // IPv6 literal
        return host.chars().all(|c| c.is_ascii_hexdigit() || c == ':' || c == '.');
    }
    host.split('.').all(|label| {
        label == "*"
            || (!label.is_empty()
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'))
    })
}

fn host_matches(pattern: &str, host: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == host;
    }
    let want: Vec<&str> = pattern.split('.').collect();
    let got: Vec<&str> = host.split('.').collect();
    want.len() == got.len()
        && want
            .iter()
            .zip(&got)
            .all(|(w, g)| (*w == "*" && !g.is_empty()) || w == g)
}

fn glob_matches(pattern: &str, text: &str) -> bool {
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or("");
    let Some(mut rest) = text.strip_prefix(first) else {
        return false;
    };

    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        // No wildcard at all.
        return rest.is_empty();
    };

    for part in middle {
        match rest.find(*part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(*last)
}
