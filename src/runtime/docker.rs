use super::{ContainerRuntime, RuntimeError, RuntimeEvent};
use crate::types::{ContainerDescriptor, NetworkAttachment, LABEL_ENABLE};
use anyhow::{bail, Result};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerSummary, EndpointSettings};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::stream::{BoxStream, StreamExt};
use log::{debug, info};
use std::collections::HashMap;

pub struct DockerRuntime {
    docker: Docker,
    filter_health: bool,
}

impl DockerRuntime {
    pub fn new(docker: Docker, filter_health: bool) -> Self {
        Self {
            docker,
            filter_health,
        }
    }

    /// Connects to `docker_host` (`unix://` or `tcp://`), or to the local
    /// daemon when unset. `DOCKER_HOST` is honoured by the local defaults.
    pub fn connect(docker_host: Option<&str>, filter_health: bool) -> Result<Self> {
        let docker = match docker_host {
            Some(host) if host.starts_with("unix://") => {
                let socket_path = host.trim_start_matches("unix://");
                Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)?
            }
            Some(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
                Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)?
            }
            Some(host) => bail!(
                "Invalid docker_host '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            ),
            None => Docker::connect_with_local_defaults()?,
        };
        info!("Docker client created for {}", docker_host.unwrap_or("local defaults"));
        Ok(Self::new(docker, filter_health))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<String, RuntimeError> {
        self.docker.ping().await?;
        let version = self.docker.version().await?;
        Ok(version.api_version.unwrap_or_default())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerDescriptor>, RuntimeError> {
        let opts = ListContainersOptions::<String> {
            all: false,
            filters: list_filters(self.filter_health),
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;
        debug!("Docker listed {} containers", containers.len());
        Ok(containers.into_iter().filter_map(to_descriptor).collect())
    }

    fn events(&self) -> BoxStream<'_, Result<RuntimeEvent, RuntimeError>> {
        let opts = EventsOptions::<String> {
            filters: HashMap::from([("type".to_string(), vec!["container".to_string()])]),
            ..Default::default()
        };

        self.docker
            .events(Some(opts))
            .map(|msg| -> Result<RuntimeEvent, RuntimeError> {
                let event = msg?;
                let action = event.action.unwrap_or_default();
                let container_id = event.actor.and_then(|a| a.id).unwrap_or_default();
                Ok(RuntimeEvent {
                    action,
                    container_id,
                })
            })
            .boxed()
    }
}

fn list_filters(filter_health: bool) -> HashMap<String, Vec<String>> {
    let mut filters = HashMap::new();
    filters.insert("label".to_string(), vec![format!("{}=true", LABEL_ENABLE)]);
    if filter_health {
        filters.insert("status".to_string(), vec!["running".to_string()]);
        filters.insert(
            "health".to_string(),
            vec!["healthy".to_string(), "none".to_string()],
        );
    }
    filters
}

fn to_descriptor(summary: ContainerSummary) -> Option<ContainerDescriptor> {
    let id = summary.id?;
    let networks = summary
        .network_settings
        .and_then(|s| s.networks)
        .unwrap_or_default()
        .into_iter()
        .map(|(name, settings)| NetworkAttachment::new(name, endpoint_ip(&settings)))
        .collect();

    Some(ContainerDescriptor {
        id,
        labels: summary.labels.unwrap_or_default(),
        networks,
    })
}

fn endpoint_ip(settings: &EndpointSettings) -> String {
    if let Some(ipv4) = &settings.ip_address {
        if !ipv4.is_empty() {
            return ipv4.clone();
        }
    }
    if let Some(ipv6) = &settings.global_ipv6_address {
        if !ipv6.is_empty() {
            return ipv6.clone();
        }
    }
    String::new()
}
