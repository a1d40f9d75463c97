//! Execution sandbox.
//!
//! Every invocation gets its own container attached to its own freshly
//! created network, and both are torn down before control returns to the
//! caller. The security model is layered:
//!
//! 1. Declarative permissions (`manifest.json`): what a human reviews
//! 2. Per-invocation egress resolution: declared domains become addresses
//! 3. Network scope: the sandbox's only route out, allowlisted by construction
//! 4. Resource ceilings: memory, CPU and wall-clock timeout
//! 5. Output protocol: only the delimited JSON object is trusted
//!
//! The runtime, the image store and name resolution are external
//! collaborators reached through the traits below. [`SandboxBackend::docker`]
//! wires the Docker CLI implementations.

pub mod docker;
pub mod egress;
pub mod image;
pub mod network;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::BTreeMap;
use std::future::Future;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::warn;

use crate::error::Result;

pub use egress::{EgressScope, ResolvedEgress, SystemResolver};
pub use image::{image_name, ImageResolver};
pub use network::{NetworkHandle, NetworkScopeManager};
pub use supervisor::ExecutionSupervisor;

/// Resolves a host name to the addresses it currently points at.
#[async_trait]
pub trait DomainResolver: Send + Sync {
    async fn resolve(&self, domain: &str) -> std::io::Result<Vec<IpAddr>>;
}

/// Creates and removes isolated networks.
#[async_trait]
pub trait NetworkProvider: Send + Sync {
    /// Creates a network named `name` whose only reachable destinations are
    /// the ones admitted by `scope`.
    async fn create(&self, name: &str, scope: &EgressScope) -> Result<NetworkHandle>;

    async fn remove(&self, handle: &NetworkHandle) -> Result<()>;
}

/// Local image store with on-demand builds.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn exists(&self, image: &str) -> Result<bool>;

    /// Builds `image` from the skill directory (its `Dockerfile`).
    async fn build(&self, context_dir: &Path, image: &str) -> Result<()>;
}

/// Container lifecycle primitives.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates (but does not start) a container. Returns its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    /// Starts the container, writes `stdin` to it, and waits for it to exit.
    ///
    /// Must be cancel-safe: dropping the future detaches from the container
    /// without waiting. The caller follows up with [`ContainerRuntime::kill`].
    async fn start(&self, id: &str, stdin: Vec<u8>) -> Result<ContainerExit>;

    async fn kill(&self, id: &str) -> Result<()>;

    /// Removes the container, forcibly if it is still running.
    async fn remove(&self, id: &str) -> Result<()>;
}

/// Everything needed to create one sandbox container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network: String,
    pub memory_mb: u64,
    pub cpu: f64,
    pub env: BTreeMap<String, String>,
    /// Host entries pinned inside the container (`domain`, `address`).
    pub extra_hosts: Vec<(String, IpAddr)>,
}

/// How a container run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerExit {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ContainerExit {
    /// Both streams, stdout first.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// The set of external collaborators an invocation is driven against.
#[derive(Clone)]
pub struct SandboxBackend {
    pub resolver: Arc<dyn DomainResolver>,
    pub networks: Arc<dyn NetworkProvider>,
    pub images: Arc<dyn ImageStore>,
    pub containers: Arc<dyn ContainerRuntime>,
}

impl SandboxBackend {
    /// Docker CLI for containers, images and networks; system DNS for egress.
    pub fn docker() -> Self {
        let cli = Arc::new(docker::DockerCli::default());
        Self {
            resolver: Arc::new(SystemResolver),
            networks: cli.clone(),
            images: cli.clone(),
            containers: cli,
        }
    }
}

/// A cleanup step that must happen exactly once.
///
/// Normally awaited through [`Teardown::run`]. If the owning future is
/// dropped first (the caller cancelled the invocation), the step is spawned
/// onto the current runtime instead so nothing is orphaned.
pub(crate) struct Teardown {
    what: &'static str,
    task: Option<BoxFuture<'static, ()>>,
}

impl Teardown {
    pub(crate) fn new(what: &'static str, task: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            what,
            task: Some(Box::pin(task)),
        }
    }

    pub(crate) async fn run(mut self) {
        if let Some(task) = self.task.take() {
            task.await;
        }
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                warn!("Invocation dropped before {}, finishing it in the background", self.what);
                rt.spawn(task);
            }
            Err(_) => warn!("Invocation dropped outside a runtime, {} skipped", self.what),
        }
    }
}
