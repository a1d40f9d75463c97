//! Sandboxed execution of declaratively-permissioned skills.
//!
//! A skill is a directory holding a `manifest.json` and a `Dockerfile`. Each
//! invocation runs the skill once, in a fresh container on a fresh network
//! that can reach only the domains the manifest declares, then tears both
//! down and returns the JSON object the skill printed between
//! [`OUTPUT_START`] and [`OUTPUT_END`].
//!
//! ```no_run
//! # async fn demo() -> skill_runner::Result<()> {
//! use skill_runner::{ExecutionConfig, SkillInput, SkillRunner};
//!
//! let runner = SkillRunner::docker(ExecutionConfig::default());
//! let input = SkillInput::new("demos/echo", serde_json::Map::new());
//! let output = runner.execute(&input, None).await?;
//! println!("{}", serde_json::to_string(&output.data).unwrap_or_default());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod runner;
pub mod sandbox;
pub mod skills;

pub use config::{EgressMode, ExecutionConfig, ResolvedConfig, RunnerConfig};
pub use error::{Result, SkillError};
pub use runner::SkillRunner;
pub use sandbox::SandboxBackend;
pub use skills::{SkillInput, SkillManifest, SkillOutput, OUTPUT_END, OUTPUT_START};
