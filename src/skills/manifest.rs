//! Skill manifest loading and validation.
//!
//! A skill directory carries a `manifest.json` declaring the skill's identity
//! and the permissions it needs. The manifest is validated structurally
//! before anything else happens, and every failure names the offending field
//! by its dotted path (e.g. `permissions.network.egress[1].domain`).

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::is_env_var_name;
use crate::error::{Result, SkillError};

/// File name of the manifest inside a skill directory.
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SkillManifest {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub capabilities: Vec<String>,
    #[serde(alias = "journeyStages")]
    pub journey_stages: Vec<String>,
    pub permissions: Permissions,
    #[serde(alias = "riskLevel")]
    pub risk_level: RiskLevel,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Permissions {
    pub network: NetworkPermissions,
    pub filesystem: FilesystemPermissions,
    pub env_vars: EnvVarPermissions,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NetworkPermissions {
    pub egress: Vec<EgressRule>,
}

/// A domain the skill wants to reach, with the author's justification.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EgressRule {
    pub domain: String,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FilesystemPermissions {
    pub read: Vec<String>,
    pub write: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EnvVarPermissions {
    pub required: Vec<String>,
    pub optional: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl SkillManifest {
    /// Reads and validates `<skill_dir>/manifest.json`.
    ///
    /// No caching: every call reads the file again, so edits to a skill are
    /// picked up by the next invocation.
    pub async fn load(skill_dir: &Path) -> Result<Self> {
        let path = skill_dir.join(MANIFEST_FILE);
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            SkillError::manifest(
                MANIFEST_FILE,
                format!("cannot read {}: {e}", path.display()),
            )
        })?;
        let manifest = Self::from_json(&content)?;
        debug!(
            "Loaded manifest {} v{} ({} egress rules)",
            manifest.name,
            manifest.version,
            manifest.permissions.network.egress.len()
        );
        Ok(manifest)
    }

    /// Parses and validates a manifest document.
    pub fn from_json(content: &str) -> Result<Self> {
        let doc: Value = serde_json::from_str(content)
            .map_err(|e| SkillError::manifest(MANIFEST_FILE, format!("invalid JSON: {e}")))?;
        validate(&doc)?;
        serde_json::from_value(doc).map_err(|e| SkillError::manifest(MANIFEST_FILE, e.to_string()))
    }

    /// Domains declared for egress, in declaration order, without duplicates.
    pub fn egress_domains(&self) -> Vec<&str> {
        let mut domains: Vec<&str> = Vec::new();
        for rule in &self.permissions.network.egress {
            if !domains.contains(&rule.domain.as_str()) {
                domains.push(&rule.domain);
            }
        }
        domains
    }
}

// ── Structural validation ────────────────────────────────

fn validate(doc: &Value) -> Result<()> {
    let root = doc
        .as_object()
        .ok_or_else(|| SkillError::manifest("$", "manifest must be a JSON object"))?;

    let name = require_str(root, "name", &["name"])?;
    if name.trim().is_empty() {
        return Err(SkillError::manifest("name", "must not be empty"));
    }
    if !is_image_component(name) {
        return Err(SkillError::manifest(
            "name",
            "must be ASCII letters and digits, optionally joined by single '.', \
             '_' or '__', or runs of '-'",
        ));
    }
    require_str(root, "version", &["version"])?;
    require_str(root, "description", &["description"])?;
    require_str(root, "author", &["author"])?;
    require_str_array(root, "capabilities", &["capabilities"])?;
    require_str_array(root, "journey_stages", &["journey_stages", "journeyStages"])?;

    let risk = require_str(root, "risk_level", &["risk_level", "riskLevel"])?;
    if !matches!(risk, "low" | "medium" | "high") {
        return Err(SkillError::manifest(
            "risk_level",
            format!("must be one of low, medium, high (got '{risk}')"),
        ));
    }

    let permissions = require_object(root, "permissions", &["permissions"])?;

    let network = require_object(permissions, "permissions.network", &["network"])?;
    let egress = require_array(network, "permissions.network.egress", &["egress"])?;
    for (i, rule) in egress.iter().enumerate() {
        let path = format!("permissions.network.egress[{i}]");
        let rule = rule
            .as_object()
            .ok_or_else(|| SkillError::manifest(&path, "must be an object"))?;
        let domain = require_str(rule, &format!("{path}.domain"), &["domain"])?;
        validate_domain(domain).map_err(|msg| SkillError::manifest(format!("{path}.domain"), msg))?;
        require_str(rule, &format!("{path}.reason"), &["reason"])?;
    }

    let filesystem = require_object(permissions, "permissions.filesystem", &["filesystem"])?;
    require_str_array(filesystem, "permissions.filesystem.read", &["read"])?;
    require_str_array(filesystem, "permissions.filesystem.write", &["write"])?;

    let env_vars = require_object(permissions, "permissions.env_vars", &["env_vars"])?;
    for key in ["required", "optional"] {
        let path = format!("permissions.env_vars.{key}");
        for (i, var) in require_str_array(env_vars, &path, &[key])?.into_iter().enumerate() {
            if !is_env_var_name(var) {
                return Err(SkillError::manifest(
                    format!("{path}[{i}]"),
                    format!("'{var}' is not a valid environment variable name"),
                ));
            }
        }
    }

    Ok(())
}

/// Looks up the first present, non-null key among `keys`.
fn field<'a>(obj: &'a Map<String, Value>, path: &str, keys: &[&str]) -> Result<&'a Value> {
    keys.iter()
        .find_map(|k| obj.get(*k).filter(|v| !v.is_null()))
        .ok_or_else(|| SkillError::manifest(path, "is required"))
}

fn require_str<'a>(obj: &'a Map<String, Value>, path: &str, keys: &[&str]) -> Result<&'a str> {
    field(obj, path, keys)?
        .as_str()
        .ok_or_else(|| SkillError::manifest(path, "must be a string"))
}

fn require_object<'a>(
    obj: &'a Map<String, Value>,
    path: &str,
    keys: &[&str],
) -> Result<&'a Map<String, Value>> {
    field(obj, path, keys)?
        .as_object()
        .ok_or_else(|| SkillError::manifest(path, "must be an object"))
}

fn require_array<'a>(obj: &'a Map<String, Value>, path: &str, keys: &[&str]) -> Result<&'a Vec<Value>> {
    field(obj, path, keys)?
        .as_array()
        .ok_or_else(|| SkillError::manifest(path, "must be an array"))
}

fn require_str_array<'a>(
    obj: &'a Map<String, Value>,
    path: &str,
    keys: &[&str],
) -> Result<Vec<&'a str>> {
    require_array(obj, path, keys)?
        .iter()
        .enumerate()
        .map(|(i, v)| {
            v.as_str()
                .ok_or_else(|| SkillError::manifest(format!("{path}[{i}]"), "must be a string"))
        })
        .collect()
}

/// Docker's image path-component grammar, case-insensitively:
/// `[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*`.
fn is_image_component(name: &str) -> bool {
    let separator_ok =
        |sep: &str| matches!(sep, "." | "_" | "__") || sep.chars().all(|c| c == '-');

    let mut separator = String::new();
    let mut seen_alnum = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if !separator.is_empty() {
                if !seen_alnum || !separator_ok(&separator) {
                    return false;
                }
                separator.clear();
            }
            seen_alnum = true;
        } else if matches!(c, '.' | '_' | '-') {
            separator.push(c);
        } else {
            return false;
        }
    }
    seen_alnum && separator.is_empty()
}

/// Accepts plain DNS host names only: no IP literals, URLs, ports or wildcards.
fn validate_domain(domain: &str) -> std::result::Result<(), String> {
    if domain.contains('*') {
        return Err(format!("wildcard domains are not supported ('{domain}')"));
    }
    match url::Host::parse(domain) {
        Ok(url::Host::Domain(_)) => {}
        Ok(_) => return Err(format!("IP literals are not allowed ('{domain}'), declare a domain")),
        Err(e) => return Err(format!("'{domain}' is not a valid host name: {e}")),
    }
    if domain.len() > 253 {
        return Err("host name exceeds 253 characters".to_string());
    }
    let labels_ok = domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    if !labels_ok {
        return Err(format!("'{domain}' is not a valid host name"));
    }
    Ok(())
}
