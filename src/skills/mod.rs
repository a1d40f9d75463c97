pub mod manifest;
pub mod protocol;

use std::path::PathBuf;

use serde::Serialize;
use serde_json::{Map, Value};

pub use manifest::{EgressRule, RiskLevel, SkillManifest};
pub use protocol::{parse_skill_output, OUTPUT_END, OUTPUT_START};

/// One invocation request: which skill to run and the data to feed it.
///
/// `data` is serialized as a single JSON document and written to the
/// sandbox's stdin.
#[derive(Debug, Clone)]
pub struct SkillInput {
    pub skill_dir: PathBuf,
    pub data: Map<String, Value>,
}

impl SkillInput {
    pub fn new(skill_dir: impl Into<PathBuf>, data: Map<String, Value>) -> Self {
        Self {
            skill_dir: skill_dir.into(),
            data,
        }
    }
}

/// Result of a successful invocation.
///
/// Only produced after the output protocol parsed cleanly; every other
/// outcome is a [`crate::SkillError`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SkillOutput {
    pub success: bool,
    pub data: Map<String, Value>,
    pub metadata: ExecutionMetadata,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetadata {
    pub skill_name: String,
    pub skill_version: String,
    /// Short form of the sandbox id (first 12 characters).
    pub container_id: String,
    pub duration_ms: u64,
    pub exit_code: i64,
}

/// Shortens a container id the way `docker ps` does.
pub fn short_id(id: &str) -> String {
    id.chars().take(12).collect()
}
