//! Per-invocation network scopes.
//!
//! Each invocation gets a freshly created, uniquely named network that is
//! the sandbox's only path to the outside world. Whoever creates a network
//! releases it before returning, however the work in between ended.

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{EgressScope, NetworkProvider, Teardown};
use crate::error::Result;

/// Upper bound on network teardown, independent of the execution timeout.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(15);

/// An isolated network owned by exactly one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkHandle {
    /// Name the network was created under (`skill-net-<uuid>`).
    pub name: String,
    /// Runtime-assigned id.
    pub id: String,
    /// Host-side bridge interface, when the provider manages one.
    pub bridge: Option<String>,
    /// True when the network has no route off the host.
    pub internal: bool,
    /// Destinations admitted through the network.
    pub admitted: Vec<IpAddr>,
}

pub struct NetworkScopeManager {
    provider: Arc<dyn NetworkProvider>,
}

impl NetworkScopeManager {
    pub fn new(provider: Arc<dyn NetworkProvider>) -> Self {
        Self { provider }
    }

    /// Creates a new uniquely named network for `scope`.
    pub async fn create_network(&self, scope: &EgressScope) -> Result<NetworkHandle> {
        let name = format!("skill-net-{}", uuid::Uuid::new_v4().simple());
        let handle = self.provider.create(&name, scope).await?;
        info!(
            "Network {} created ({}, {} admitted address(es))",
            handle.name,
            if handle.internal { "internal" } else { "allowlist" },
            handle.admitted.len()
        );
        Ok(handle)
    }

    /// Removes the network. Never fails: errors are logged and swallowed,
    /// since the caller cannot do anything about them.
    pub async fn destroy_network(&self, handle: NetworkHandle) {
        destroy(self.provider.clone(), handle).await;
    }

    /// Runs `work` inside a fresh network and destroys the network
    /// afterwards, on success, error, or cancellation of `work`.
    pub async fn with_network<F, Fut, T>(&self, scope: &EgressScope, work: F) -> Result<T>
    where
        F: FnOnce(NetworkHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = self.create_network(scope).await?;
        let teardown = Teardown::new(
            "network teardown",
            destroy(self.provider.clone(), handle.clone()),
        );

        let result = work(handle).await;
        teardown.run().await;
        result
    }
}

async fn destroy(provider: Arc<dyn NetworkProvider>, handle: NetworkHandle) {
    match tokio::time::timeout(TEARDOWN_TIMEOUT, provider.remove(&handle)).await {
        Ok(Ok(())) => debug!("Network {} destroyed", handle.name),
        Ok(Err(e)) => warn!("Failed to destroy network {}: {e}", handle.name),
        Err(_) => warn!(
            "Destroying network {} timed out after {}s",
            handle.name,
            TEARDOWN_TIMEOUT.as_secs()
        ),
    }
}
