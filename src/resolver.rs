//! Turns a container's network attachments into a dial address.

use std::collections::HashMap;

use thiserror::Error;

use crate::types::{ContainerDescriptor, LABEL_COMPOSE_PROJECT, LABEL_NETWORK, LABEL_UPSTREAM_PORT};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("container has no upstream port label")]
    MissingPort,
    #[error("invalid upstream port `{0}`")]
    InvalidPort(String),
    #[error("container is not attached to any network")]
    NoNetworks,
    #[error("container is not attached to network `{network}`")]
    NetworkNotFound { network: String },
    #[error("no network attachment has an address")]
    NoAddress,
}

/// Computes the `host:port` address a container should be dialed on.
///
/// The network is taken from the network label when present. A short
/// compose network name (`backend`) is retried as `<project>_backend`.
/// Without the label the first attachment carrying an address wins.
pub fn resolve_address(container: &ContainerDescriptor) -> Result<String, ResolveError> {
    let port = container
        .label(LABEL_UPSTREAM_PORT)
        .ok_or(ResolveError::MissingPort)?
        .trim();
    let port: u16 = port
        .parse()
        .map_err(|_| ResolveError::InvalidPort(port.to_string()))?;

    if container.networks.is_empty() {
        return Err(ResolveError::NoNetworks);
    }

    let ip = match container.label(LABEL_NETWORK) {
        Some(network) => {
            let attachment = container.networks.iter().find(|n| n.name == network);
            let attachment = match (attachment, container.label(LABEL_COMPOSE_PROJECT)) {
                (Some(a), _) => a,
                (None, Some(project)) => {
                    let network = format!("{}_{}", project, network);
                    container
                        .networks
                        .iter()
                        .find(|n| n.name == network)
                        .ok_or(ResolveError::NetworkNotFound { network })?
                }
                (None, None) => {
                    return Err(ResolveError::NetworkNotFound {
                        network: network.to_string(),
                    })
                }
            };
            if attachment.ip_address.is_empty() {
                return Err(ResolveError::NoAddress);
            }
            attachment.ip_address.as_str()
        }
        None => container
            .networks
            .iter()
            .map(|n| n.ip_address.as_str())
            .find(|ip| !ip.is_empty())
            .ok_or(ResolveError::NoAddress)?,
    };

    Ok(join_host_port(ip, port))
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Remembers resolved addresses per container id.
///
/// A container cannot change networks without being recreated under a
/// new id, so entries are never invalidated.
#[derive(Debug, Default)]
pub struct AddressCache {
    entries: HashMap<String, String>,
}

impl AddressCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&mut self, container: &ContainerDescriptor) -> Result<String, ResolveError> {
        if let Some(address) = self.entries.get(&container.id) {
            return Ok(address.clone());
        }
        let address = resolve_address(container)?;
        self.entries.insert(container.id.clone(), address.clone());
        Ok(address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
