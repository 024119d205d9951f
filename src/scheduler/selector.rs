use std::collections::HashMap;

use rand::seq::IteratorRandom;

use crate::cluster::HostState;
use crate::error::ControllerError;

/// Picks the host a new job runs on.
///
/// Implementations only look at the snapshot they are given, so a policy can
/// be swapped without touching the dispatch path.
pub trait HostSelector: Send + Sync {
    fn select(&self, hosts: &HashMap<String, HostState>) -> Result<String, ControllerError>;
}

/// Any host will do.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomHost;

impl HostSelector for RandomHost {
    fn select(&self, hosts: &HashMap<String, HostState>) -> Result<String, ControllerError> {
        let host_id = hosts
            .keys()
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(ControllerError::NoHostsAvailable)?;
        tracing::debug!(host_id = %host_id, candidates = hosts.len(), "Host selected");
        Ok(host_id)
    }
}

/// Host with the fewest running jobs; ties go to the lowest host ID.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastLoaded;

impl HostSelector for LeastLoaded {
    fn select(&self, hosts: &HashMap<String, HostState>) -> Result<String, ControllerError> {
        let host = hosts
            .values()
            .min_by(|a, b| a.jobs.len().cmp(&b.jobs.len()).then_with(|| a.id.cmp(&b.id)))
            .ok_or(ControllerError::NoHostsAvailable)?;
        tracing::debug!(host_id = %host.id, running_jobs = host.jobs.len(), "Host selected");
        Ok(host.id.clone())
    }
}
