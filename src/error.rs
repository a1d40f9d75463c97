//! Error taxonomy for skill execution.
//!
//! Every failure of an invocation surfaces as one [`SkillError`]. Callers
//! dispatch on [`SkillError::code`], a stable machine-readable string, rather
//! than on the variant itself when the error crosses a process boundary.

use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SkillError {
    /// A manifest field is missing or malformed.
    #[error("Invalid manifest field '{field}': {message}")]
    ManifestValidation { field: String, message: String },

    /// Execution configuration is unusable (missing required env var, bad limit).
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A declared egress domain did not resolve.
    #[error("Failed to resolve egress domain '{domain}': {reason}")]
    DnsResolution { domain: String, reason: String },

    #[error("Failed to build image for skill '{skill}': {reason}")]
    ImageBuild { skill: String, reason: String },

    /// The skill exited with a non-zero code.
    #[error("Skill container exited with code {exit_code}")]
    Container { exit_code: i64, stderr: String },

    #[error("Skill container {container_id} timed out after {timeout_secs}s")]
    ContainerTimeout { timeout_secs: u64, container_id: String },

    #[error("Invalid skill output: {reason}")]
    OutputParse { reason: String },

    /// Network scope provisioning failed for a reason other than DNS.
    #[error("Network error: {reason}")]
    Network { reason: String },

    /// The container runtime itself failed (binary missing, create/start refused).
    #[error("Container runtime error: {reason}")]
    Runtime { reason: String },
}

impl SkillError {
    /// Stable discriminant code, suitable for logs and wire documents.
    pub fn code(&self) -> &'static str {
        match self {
            SkillError::ManifestValidation { .. } => "MANIFEST_VALIDATION_ERROR",
            SkillError::Config { .. } => "CONFIG_ERROR",
            SkillError::DnsResolution { .. } => "DNS_RESOLUTION_ERROR",
            SkillError::ImageBuild { .. } => "IMAGE_BUILD_ERROR",
            SkillError::Container { .. } => "CONTAINER_ERROR",
            SkillError::ContainerTimeout { .. } => "CONTAINER_TIMEOUT",
            SkillError::OutputParse { .. } => "OUTPUT_PARSE_ERROR",
            SkillError::Network { .. } => "NETWORK_ERROR",
            SkillError::Runtime { .. } => "RUNTIME_ERROR",
        }
    }

    pub fn manifest(field: impl Into<String>, message: impl Into<String>) -> Self {
        SkillError::ManifestValidation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        SkillError::Config {
            message: message.into(),
        }
    }

    pub fn parse(reason: impl Into<String>) -> Self {
        SkillError::OutputParse {
            reason: reason.into(),
        }
    }

    pub fn network(reason: impl Into<String>) -> Self {
        SkillError::Network {
            reason: reason.into(),
        }
    }

    pub fn runtime(reason: impl Into<String>) -> Self {
        SkillError::Runtime {
            reason: reason.into(),
        }
    }

    /// Renders the error as `{"code": ..., "message": ...}`. A container
    /// failure also carries the captured stderr tail under `stderr`.
    pub fn to_json(&self) -> Value {
        let mut doc = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        if let SkillError::Container { stderr, .. } = self {
            if !stderr.is_empty() {
                doc["stderr"] = Value::String(stderr.clone());
            }
        }
        doc
    }
}

pub type Result<T> = std::result::Result<T, SkillError>;
