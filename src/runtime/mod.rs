use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::types::ContainerDescriptor;

pub mod docker;
#[cfg(test)]
pub(crate) mod fake;

pub use docker::DockerRuntime;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("docker api error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

/// A container lifecycle event. Only used to trigger a rebuild, so the
/// payload is kept for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    pub action: String,
    pub container_id: String,
}

/// The source of truth for which containers exist.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Checks the runtime is reachable and returns its API version.
    async fn ping(&self) -> Result<String, RuntimeError>;

    /// Lists containers that opted into discovery.
    async fn list_containers(&self) -> Result<Vec<ContainerDescriptor>, RuntimeError>;

    /// Opens a fresh subscription to container lifecycle events. The
    /// stream ends or yields an error when the subscription breaks; call
    /// again to reconnect.
    fn events(&self) -> BoxStream<'_, Result<RuntimeEvent, RuntimeError>>;
}
