use std::path::Path;
use std::sync::Arc;

use tracing::info;

use super::ImageStore;
use crate::error::{Result, SkillError};
use crate::skills::SkillManifest;

/// Deterministic image name for a skill: `<prefix><skill-name>`, lowercased,
/// with characters an image reference cannot carry replaced by `-`.
pub fn image_name(skill_name: &str, prefix: &str) -> String {
    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| {
                let c = c.to_ascii_lowercase();
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':') {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    };
    // The skill part never introduces a tag or extra path component
    let name: String = sanitize(skill_name).replace(['/', ':'], "-");
    format!("{}{}", sanitize(prefix), name)
}

/// Makes sure a runnable image exists for a skill, building on demand.
///
/// The image store is the only state shared between invocations. Builds are
/// idempotent, so two invocations racing on a first build both end up with
/// the same image and no locking is needed.
pub struct ImageResolver {
    store: Arc<dyn ImageStore>,
}

impl ImageResolver {
    pub fn new(store: Arc<dyn ImageStore>) -> Self {
        Self { store }
    }

    pub async fn image_exists(&self, name: &str) -> Result<bool> {
        self.store.exists(name).await
    }

    /// Builds `name` from `skill_dir`. Failures carry the skill name and are
    /// not retried.
    pub async fn build_image(&self, skill_dir: &Path, name: &str, skill: &str) -> Result<()> {
        info!("Building image {name} for skill {skill} from {}", skill_dir.display());
        self.store
            .build(skill_dir, name)
            .await
            .map_err(|e| SkillError::ImageBuild {
                skill: skill.to_string(),
                reason: e.to_string(),
            })?;
        info!("Image {name} ready");
        Ok(())
    }

    /// Returns the skill's image name, building the image first if needed.
    pub async fn ensure_image(
        &self,
        manifest: &SkillManifest,
        skill_dir: &Path,
        prefix: &str,
    ) -> Result<String> {
        let name = image_name(&manifest.name, prefix);
        if self.image_exists(&name).await? {
            return Ok(name);
        }
        self.build_image(skill_dir, &name, &manifest.name).await?;
        Ok(name)
    }
}
