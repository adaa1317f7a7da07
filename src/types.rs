//! Data structures shared by the discovery pipeline.
//!
//! Containers come in from the runtime as [`ContainerDescriptor`]s and
//! leave as [`Candidate`]s grouped into an immutable [`CandidateSet`].
//! A candidate set is never patched; every rebuild produces a new one
//! which replaces the previous set wholesale.

use std::collections::HashMap;
use std::sync::Arc;

use crate::matchers::MatcherSet;

/// Label that opts a container into discovery (`"true"` to enable).
pub const LABEL_ENABLE: &str = "com.caddyserver.http.enable";
/// Label naming the network to dial the container on.
pub const LABEL_NETWORK: &str = "com.caddyserver.http.network";
/// Label carrying the port the container listens on.
pub const LABEL_UPSTREAM_PORT: &str = "com.caddyserver.http.upstream.port";
/// Compose project label, used to expand short network names.
/// See https://github.com/compose-spec/compose-go/blob/main/loader/normalize.go.
pub const LABEL_COMPOSE_PROJECT: &str = "com.docker.compose.project";

/// A network the container is attached to, with its assigned address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub name: String,
    pub ip_address: String,
}

impl NetworkAttachment {
    pub fn new(name: impl Into<String>, ip_address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip_address: ip_address.into(),
        }
    }
}

/// A container as reported by the runtime.
///
/// `networks` keeps the order the runtime enumerated them in. Runtimes
/// backed by unordered maps make that order arbitrary, but it is stable
/// for the lifetime of one descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerDescriptor {
    pub id: String,
    pub labels: HashMap<String, String>,
    pub networks: Vec<NetworkAttachment>,
}

impl ContainerDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_network(mut self, name: impl Into<String>, ip_address: impl Into<String>) -> Self {
        self.networks.push(NetworkAttachment::new(name, ip_address));
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Whether the enable label is present and set to `true`.
    pub fn is_enabled(&self) -> bool {
        self.label(LABEL_ENABLE)
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

/// An address the proxy layer can dial, in `host:port` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Upstream {
    pub dial: String,
}

impl Upstream {
    pub fn new(dial: impl Into<String>) -> Self {
        Self { dial: dial.into() }
    }
}

/// One routable backend: the matchers a request must satisfy and the
/// address it is forwarded to.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub container_id: String,
    pub matchers: MatcherSet,
    pub upstream: Arc<Upstream>,
}

/// The published list of candidates.
///
/// `generation` counts publications; the set built at startup is
/// generation 0.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    pub generation: u64,
    pub candidates: Vec<Candidate>,
}

impl CandidateSet {
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}
