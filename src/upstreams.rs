//! The per-request read path.

use std::sync::Arc;

use arc_swap::ArcSwap;
use http::Request;

use crate::types::{CandidateSet, Upstream};

/// Cheap, cloneable handle used by request handlers to look up upstreams.
///
/// Reads never block the engine: each lookup works on the snapshot that
/// was current when it started.
#[derive(Clone)]
pub struct Upstreams {
    candidates: Arc<ArcSwap<CandidateSet>>,
}

impl Upstreams {
    pub fn new(candidates: Arc<ArcSwap<CandidateSet>>) -> Self {
        Self { candidates }
    }

    /// Every upstream whose matchers all accept `req`, in candidate order.
    ///
    /// An empty result means no backend is configured for the request; it
    /// is up to the proxy to answer it with a gateway error. Duplicates are
    /// kept, choosing among them is the load balancer's job.
    pub fn get_upstreams<B>(&self, req: &Request<B>) -> Vec<Arc<Upstream>> {
        let snapshot = self.candidates.load();
        snapshot
            .candidates
            .iter()
            .filter(|c| c.matchers.matches(req))
            .map(|c| Arc::clone(&c.upstream))
            .collect()
    }

    /// The currently published candidate set.
    pub fn snapshot(&self) -> Arc<CandidateSet> {
        self.candidates.load_full()
    }
}
