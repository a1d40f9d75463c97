use tracing::{info, warn};

use crate::config::ExecutionConfig;
use crate::error::Result;
use crate::sandbox::{ExecutionSupervisor, SandboxBackend};
use crate::skills::{SkillInput, SkillManifest, SkillOutput};

/// Entry point for running skills.
///
/// Holds only the default configuration and the supervisor, neither of which
/// changes after construction, so one runner can be shared (`Arc`) between
/// any number of concurrent callers.
pub struct SkillRunner {
    defaults: ExecutionConfig,
    supervisor: ExecutionSupervisor,
}

impl SkillRunner {
    pub fn new(defaults: ExecutionConfig, backend: SandboxBackend) -> Self {
        Self {
            defaults,
            supervisor: ExecutionSupervisor::new(backend),
        }
    }

    /// A runner backed by the local Docker daemon.
    pub fn docker(defaults: ExecutionConfig) -> Self {
        Self::new(defaults, SandboxBackend::docker())
    }

    /// Runs one skill invocation.
    ///
    /// `config` is merged onto the runner's defaults, call-scoped values
    /// winning. The manifest is read from disk on every call, so edits to a
    /// skill apply to the next invocation.
    pub async fn execute(
        &self,
        input: &SkillInput,
        config: Option<&ExecutionConfig>,
    ) -> Result<SkillOutput> {
        let result = self.run(input, config).await;
        if let Err(ref e) = result {
            warn!(
                "Skill at {} failed [{}]: {e}",
                input.skill_dir.display(),
                e.code()
            );
        }
        result
    }

    async fn run(
        &self,
        input: &SkillInput,
        config: Option<&ExecutionConfig>,
    ) -> Result<SkillOutput> {
        let resolved = ExecutionConfig::merge(&self.defaults, config)?;
        let manifest = SkillManifest::load(&input.skill_dir).await?;

        info!(
            "Executing skill {} v{} (risk {:?}, egress {:?})",
            manifest.name, manifest.version, manifest.risk_level, resolved.egress
        );

        self.supervisor
            .run_container(&manifest, &input.data, &input.skill_dir, &resolved)
            .await
    }
}
