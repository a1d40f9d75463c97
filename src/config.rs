use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Result, SkillError};

pub const DEFAULT_MEMORY_MB: u64 = 256;
pub const DEFAULT_CPU: f64 = 0.5;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_IMAGE_PREFIX: &str = "skill-runner/";

/// How a sandbox may reach the outside world.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EgressMode {
    /// No egress at all, regardless of what the manifest declares.
    None,
    /// Only the manifest's declared domains, resolved per invocation.
    #[default]
    Allowlist,
}

/// Partial execution settings. Unset fields fall through to the defaults
/// they are merged onto.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct ExecutionConfig {
    pub memory_mb: Option<u64>,
    pub cpu: Option<f64>,
    pub timeout_secs: Option<u64>,
    pub image_prefix: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub egress: Option<EgressMode>,
}

/// Fully populated settings for a single invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub memory_mb: u64,
    pub cpu: f64,
    pub timeout_secs: u64,
    pub image_prefix: String,
    pub env: BTreeMap<String, String>,
    pub egress: EgressMode,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            memory_mb: DEFAULT_MEMORY_MB,
            cpu: DEFAULT_CPU,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            image_prefix: DEFAULT_IMAGE_PREFIX.to_string(),
            env: BTreeMap::new(),
            egress: EgressMode::default(),
        }
    }
}

impl ExecutionConfig {
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_egress(mut self, mode: EgressMode) -> Self {
        self.egress = Some(mode);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Merges `call` onto `defaults` field by field, call-scoped values
    /// winning. `env` is merged per key. Built-in defaults fill whatever
    /// neither side sets.
    pub fn merge(defaults: &ExecutionConfig, call: Option<&ExecutionConfig>) -> Result<ResolvedConfig> {
        let empty = ExecutionConfig::default();
        let call = call.unwrap_or(&empty);
        let base = ResolvedConfig::default();

        let mut env = defaults.env.clone();
        env.extend(call.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let resolved = ResolvedConfig {
            memory_mb: call.memory_mb.or(defaults.memory_mb).unwrap_or(base.memory_mb),
            cpu: call.cpu.or(defaults.cpu).unwrap_or(base.cpu),
            timeout_secs: call
                .timeout_secs
                .or(defaults.timeout_secs)
                .unwrap_or(base.timeout_secs),
            image_prefix: call
                .image_prefix
                .clone()
                .or_else(|| defaults.image_prefix.clone())
                .unwrap_or(base.image_prefix),
            env,
            egress: call.egress.or(defaults.egress).unwrap_or(base.egress),
        };

        resolved.validate()?;
        Ok(resolved)
    }
}

impl ResolvedConfig {
    fn validate(&self) -> Result<()> {
        if self.memory_mb == 0 {
            return Err(SkillError::config("memory limit must be greater than 0 MB"));
        }
        if !(self.cpu.is_finite() && self.cpu > 0.0) {
            return Err(SkillError::config(format!(
                "CPU fraction must be a positive number (got {})",
                self.cpu
            )));
        }
        if self.timeout_secs == 0 {
            return Err(SkillError::config("timeout must be at least 1 second"));
        }
        if let Some(key) = self.env.keys().find(|k| !is_env_var_name(k)) {
            return Err(SkillError::config(format!(
                "invalid environment variable name '{key}'"
            )));
        }
        Ok(())
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_env_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// On-disk runner configuration (`skill-runner.toml`).
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RunnerConfig {
    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl RunnerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${GITHUB_TOKEN}
        let expanded = shellexpand::env(&content)?;
        let config: RunnerConfig = toml::from_str(&expanded)?;
        Ok(config)
    }
}
