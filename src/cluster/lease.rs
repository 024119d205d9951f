use std::ops::Deref;

use crate::cluster::{ClusterClient, ClusterError, HostClient};

/// A dialed host that is closed when the lease is dropped.
///
/// Every request that talks to a single host holds one of these for exactly
/// as long as it needs the connection, so early returns and panics release
/// it the same way normal completion does.
pub struct HostLease {
    client: Box<dyn HostClient>,
}

impl HostLease {
    pub async fn dial(cluster: &dyn ClusterClient, host_id: &str) -> Result<Self, ClusterError> {
        let client = cluster.dial_host(host_id).await?;
        tracing::debug!(host_id, "Host dialed");
        Ok(Self { client })
    }

    pub fn new(client: Box<dyn HostClient>) -> Self {
        Self { client }
    }
}

impl Deref for HostLease {
    type Target = dyn HostClient;

    fn deref(&self) -> &Self::Target {
        self.client.as_ref()
    }
}

impl Drop for HostLease {
    fn drop(&mut self) {
        tracing::debug!(host_id = %self.client.host_id(), "Host connection released");
        self.client.close();
    }
}
