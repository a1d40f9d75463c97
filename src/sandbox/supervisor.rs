//! Execution supervisor: one skill, one network, one container.
//!
//! Steps run strictly in order and each one short-circuits on failure:
//!
//! 1. check required environment variables
//! 2. resolve egress and create the network scope
//! 3. ensure the skill image exists
//! 4. create the container and feed it the input
//! 5. race the container against the timeout, killing it if the timer wins
//! 6. remove the container and destroy the network, whatever happened
//! 7. turn the exit code and captured output into a result

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::egress::plan_egress;
use super::{
    ContainerExit, ContainerRuntime, ContainerSpec, ImageResolver, NetworkHandle,
    NetworkScopeManager, SandboxBackend, Teardown,
};
use crate::config::ResolvedConfig;
use crate::error::{Result, SkillError};
use crate::skills::{parse_skill_output, short_id, ExecutionMetadata, SkillManifest, SkillOutput};

/// Upper bound on each cleanup primitive (kill, remove).
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Amount of stderr kept on a non-zero exit.
const STDERR_TAIL_BYTES: usize = 2048;

pub struct ExecutionSupervisor {
    backend: SandboxBackend,
    networks: NetworkScopeManager,
    images: ImageResolver,
}

impl ExecutionSupervisor {
    pub fn new(backend: SandboxBackend) -> Self {
        Self {
            networks: NetworkScopeManager::new(backend.networks.clone()),
            images: ImageResolver::new(backend.images.clone()),
            backend,
        }
    }

    /// Runs one invocation of a skill end to end.
    pub async fn run_container(
        &self,
        manifest: &SkillManifest,
        input: &Map<String, Value>,
        skill_dir: &Path,
        config: &ResolvedConfig,
    ) -> Result<SkillOutput> {
        let env = sandbox_env(manifest, config, |name| std::env::var(name).ok())?;

        let scope = plan_egress(self.backend.resolver.as_ref(), config.egress, manifest).await?;
        let hosts = scope.host_entries();

        self.networks
            .with_network(&scope, |network| async move {
                let image = self
                    .images
                    .ensure_image(manifest, skill_dir, &config.image_prefix)
                    .await?;
                let spec = container_spec(manifest, &image, &network, hosts, config, env);
                self.run_in_network(manifest, spec, input, config).await
            })
            .await
    }

    async fn run_in_network(
        &self,
        manifest: &SkillManifest,
        spec: ContainerSpec,
        input: &Map<String, Value>,
        config: &ResolvedConfig,
    ) -> Result<SkillOutput> {
        let stdin = serde_json::to_vec(input)
            .map_err(|e| SkillError::runtime(format!("cannot serialize input: {e}")))?;

        let runtime = self.backend.containers.clone();
        let id = runtime.create(&spec).await?;
        let container_id = short_id(&id);
        let removal = Teardown::new("container removal", remove_container(runtime.clone(), id.clone()));

        info!(
            "Running {} v{} in container {container_id} (network {}, timeout {}s)",
            manifest.name, manifest.version, spec.network, config.timeout_secs
        );

        let started = Instant::now();
        let timeout = Duration::from_secs(config.timeout_secs);
        let outcome: Option<Result<ContainerExit>> = tokio::select! {
            exit = runtime.start(&id, stdin) => Some(exit),
            _ = tokio::time::sleep(timeout) => None,
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        if outcome.is_none() {
            warn!(
                "Container {container_id} exceeded {}s, killing it",
                config.timeout_secs
            );
            kill_container(runtime.as_ref(), &id).await;
        }
        removal.run().await;

        let exit = match outcome {
            None => {
                return Err(SkillError::ContainerTimeout {
                    timeout_secs: config.timeout_secs,
                    container_id,
                })
            }
            Some(exit) => exit?,
        };

        debug!(
            "Container {container_id} exited with {} after {duration_ms}ms",
            exit.exit_code
        );

        if exit.exit_code != 0 {
            return Err(SkillError::Container {
                exit_code: exit.exit_code,
                stderr: tail(&exit.stderr, STDERR_TAIL_BYTES),
            });
        }

        let data = parse_skill_output(&exit.combined())?;
        info!(
            "Skill {} succeeded in {duration_ms}ms ({} field(s))",
            manifest.name,
            data.len()
        );

        Ok(SkillOutput {
            success: true,
            data,
            metadata: ExecutionMetadata {
                skill_name: manifest.name.clone(),
                skill_version: manifest.version.clone(),
                container_id,
                duration_ms,
                exit_code: exit.exit_code,
            },
        })
    }
}

/// Environment handed to the sandbox: every declared variable found in the
/// config overrides or the ambient environment, plus all overrides.
/// Undeclared ambient variables never leak in.
fn sandbox_env(
    manifest: &SkillManifest,
    config: &ResolvedConfig,
    ambient: impl Fn(&str) -> Option<String>,
) -> Result<BTreeMap<String, String>> {
    let vars = &manifest.permissions.env_vars;
    let mut env = BTreeMap::new();

    for name in &vars.required {
        let value = config
            .env
            .get(name)
            .cloned()
            .or_else(|| ambient(name))
            .ok_or_else(|| {
                SkillError::config(format!(
                    "missing required environment variable '{name}' for skill '{}'",
                    manifest.name
                ))
            })?;
        env.insert(name.clone(), value);
    }
    for name in &vars.optional {
        if let Some(value) = config.env.get(name).cloned().or_else(|| ambient(name)) {
            env.insert(name.clone(), value);
        }
    }
    env.extend(config.env.iter().map(|(k, v)| (k.clone(), v.clone())));

    Ok(env)
}

fn container_spec(
    manifest: &SkillManifest,
    image: &str,
    network: &NetworkHandle,
    extra_hosts: Vec<(String, IpAddr)>,
    config: &ResolvedConfig,
    env: BTreeMap<String, String>,
) -> ContainerSpec {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    ContainerSpec {
        name: format!("skill-{}-{}", manifest.name.to_ascii_lowercase(), &suffix[..8]),
        image: image.to_string(),
        network: network.name.clone(),
        memory_mb: config.memory_mb,
        cpu: config.cpu,
        env,
        extra_hosts,
    }
}

async fn kill_container(runtime: &dyn ContainerRuntime, id: &str) {
    match tokio::time::timeout(CLEANUP_TIMEOUT, runtime.kill(id)).await {
        Ok(Ok(())) => debug!("Container {} killed", short_id(id)),
        Ok(Err(e)) => warn!("Failed to kill container {}: {e}", short_id(id)),
        Err(_) => warn!("Killing container {} timed out", short_id(id)),
    }
}

async fn remove_container(runtime: Arc<dyn ContainerRuntime>, id: String) {
    match tokio::time::timeout(CLEANUP_TIMEOUT, runtime.remove(&id)).await {
        Ok(Ok(())) => debug!("Container {} removed", short_id(&id)),
        Ok(Err(e)) => warn!("Failed to remove container {}: {e}", short_id(&id)),
        Err(_) => warn!("Removing container {} timed out", short_id(&id)),
    }
}

/// Last `max` bytes of `s`, cut on a character boundary.
fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}
