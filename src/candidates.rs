//! Builds the candidate list from an enumeration of containers.

use std::sync::Arc;

use log::{debug, error};

use crate::matchers::build_matchers;
use crate::resolver::{resolve_address, AddressCache};
use crate::types::{Candidate, ContainerDescriptor, Upstream};

/// Converts container snapshots into candidates.
///
/// The builder is only ever driven by one rebuild at a time; it owns the
/// optional address cache that survives between rebuilds.
#[derive(Debug, Default)]
pub struct CandidateSetBuilder {
    cache: Option<AddressCache>,
}

impl CandidateSetBuilder {
    pub fn new(cache_addresses: bool) -> Self {
        Self {
            cache: cache_addresses.then(AddressCache::new),
        }
    }

    /// Builds one candidate per usable container, in enumeration order.
    ///
    /// Containers without the enable label are skipped even if the
    /// enumeration was supposed to filter them out. Containers whose
    /// address cannot be resolved are logged and dropped.
    pub fn build(&mut self, containers: &[ContainerDescriptor]) -> Vec<Candidate> {
        let mut candidates = Vec::with_capacity(containers.len());

        for c in containers {
            if !c.is_enabled() {
                debug!("Container {} is not enabled, skipping", c.id);
                continue;
            }

            let matchers = build_matchers(&c.id, &c.labels);

            let resolved = match self.cache.as_mut() {
                Some(cache) => cache.resolve(c),
                None => resolve_address(c),
            };
            let dial = match resolved {
                Ok(dial) => dial,
                Err(e) => {
                    error!("Unable to resolve upstream for container {}: {}", c.id, e);
                    continue;
                }
            };

            candidates.push(Candidate {
                container_id: c.id.clone(),
                matchers,
                upstream: Arc::new(Upstream::new(dial)),
            });
        }

        candidates
    }
}
