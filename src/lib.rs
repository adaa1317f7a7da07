//! Reverse proxy upstreams discovered from labeled Docker containers.
//!
//! Containers opt in with `com.caddyserver.http.enable=true`, declare the
//! port to dial with `com.caddyserver.http.upstream.port` and describe
//! which requests they serve with `com.caddyserver.http.matchers.*`
//! labels. A [`SyncEngine`] keeps the resulting candidate set current by
//! following the runtime's event stream; request handlers query it through
//! an [`Upstreams`] handle.

pub mod candidates;
pub mod config;
pub mod engine;
pub mod matchers;
pub mod resolver;
pub mod runtime;
pub mod types;
pub mod upstreams;

pub use config::Config;
pub use engine::{SyncEngine, SyncError, SyncSettings};
pub use runtime::{ContainerRuntime, DockerRuntime};
pub use types::{Candidate, CandidateSet, ContainerDescriptor, Upstream};
pub use upstreams::Upstreams;
