//! In-memory fakes for the sandbox capability traits.
//!
//! Each fake counts its calls and appends to a shared event log so tests
//! can check both how often and in which order primitives were used.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{
    ContainerExit, ContainerRuntime, ContainerSpec, DomainResolver, EgressScope, ImageStore,
    NetworkHandle, NetworkProvider, SandboxBackend,
};
use crate::error::{Result, SkillError};
use crate::skills::manifest::{
    EnvVarPermissions, FilesystemPermissions, NetworkPermissions, Permissions,
};
use crate::skills::protocol::wrap_skill_output;
use crate::skills::{EgressRule, RiskLevel, SkillManifest};

type EventLog = Arc<Mutex<Vec<String>>>;

fn record(log: &EventLog, event: &str) {
    log.lock().unwrap().push(event.to_string());
}

/// A minimal valid manifest.
pub fn test_manifest(name: &str, domains: &[&str], required_env: &[&str]) -> SkillManifest {
    SkillManifest {
        name: name.to_string(),
        version: "1.0.0".to_string(),
        description: format!("{name} test skill"),
        author: "tests".to_string(),
        capabilities: vec![],
        journey_stages: vec![],
        permissions: Permissions {
            network: NetworkPermissions {
                egress: domains
                    .iter()
                    .map(|d| EgressRule {
                        domain: d.to_string(),
                        reason: "test".to_string(),
                    })
                    .collect(),
            },
            filesystem: FilesystemPermissions {
                read: vec![],
                write: vec![],
            },
            env_vars: EnvVarPermissions {
                required: required_env.iter().map(|s| s.to_string()).collect(),
                optional: vec![],
            },
        },
        risk_level: RiskLevel::Low,
    }
}

/// Writes `manifest` as `manifest.json` into `dir`.
pub fn write_manifest(dir: &Path, manifest: &SkillManifest) {
    let doc = serde_json::to_string_pretty(manifest).unwrap();
    std::fs::write(dir.join(crate::skills::manifest::MANIFEST_FILE), doc).unwrap();
}

// ── Resolver ─────────────────────────────────────────────

#[derive(Default)]
pub struct FakeResolver {
    answers: HashMap<String, Vec<IpAddr>>,
    lookups: AtomicUsize,
}

impl FakeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, domain: &str, addrs: Vec<IpAddr>) -> Self {
        self.answers.insert(domain.to_string(), addrs);
        self
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DomainResolver for FakeResolver {
    async fn resolve(&self, domain: &str) -> std::io::Result<Vec<IpAddr>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.answers.get(domain).cloned().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no such host")
        })
    }
}

// ── Networks ─────────────────────────────────────────────

#[derive(Default)]
pub struct FakeNetworks {
    log: EventLog,
    fail_create: bool,
    fail_remove: bool,
    created: AtomicUsize,
    removed: AtomicUsize,
    removed_names: Mutex<Vec<String>>,
    last: Mutex<Option<NetworkHandle>>,
}

impl FakeNetworks {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_log(log: EventLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn failing_remove(mut self) -> Self {
        self.fail_remove = true;
        self
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    /// Names of the networks passed to `remove`, in call order.
    pub fn removed_names(&self) -> Vec<String> {
        self.removed_names.lock().unwrap().clone()
    }

    pub fn last_name(&self) -> Option<String> {
        self.last.lock().unwrap().as_ref().map(|h| h.name.clone())
    }

    pub fn last_internal(&self) -> Option<bool> {
        self.last.lock().unwrap().as_ref().map(|h| h.internal)
    }
}

#[async_trait]
impl NetworkProvider for FakeNetworks {
    async fn create(&self, name: &str, scope: &EgressScope) -> Result<NetworkHandle> {
        if self.fail_create {
            return Err(SkillError::network("create refused"));
        }
        record(&self.log, "network.create");
        self.created.fetch_add(1, Ordering::SeqCst);
        let handle = NetworkHandle {
            name: name.to_string(),
            id: format!("net-{name}"),
            bridge: None,
            internal: scope.is_isolated(),
            admitted: scope.addresses(),
        };
        *self.last.lock().unwrap() = Some(handle.clone());
        Ok(handle)
    }

    async fn remove(&self, handle: &NetworkHandle) -> Result<()> {
        record(&self.log, "network.remove");
        self.removed.fetch_add(1, Ordering::SeqCst);
        self.removed_names.lock().unwrap().push(handle.name.clone());
        if self.fail_remove {
            return Err(SkillError::network("remove refused"));
        }
        Ok(())
    }
}

// ── Images ───────────────────────────────────────────────

#[derive(Default)]
pub struct FakeImages {
    log: EventLog,
    images: Mutex<HashSet<String>>,
    fail_build: bool,
    builds: AtomicUsize,
    built_names: Mutex<Vec<String>>,
}

impl FakeImages {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_log(log: EventLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    pub fn with_existing(self, image: &str) -> Self {
        self.images.lock().unwrap().insert(image.to_string());
        self
    }

    pub fn failing_build(mut self) -> Self {
        self.fail_build = true;
        self
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn built_names(&self) -> Vec<String> {
        self.built_names.lock().unwrap().clone()
    }

    pub fn contains(&self, image: &str) -> bool {
        self.images.lock().unwrap().contains(image)
    }
}

#[async_trait]
impl ImageStore for FakeImages {
    async fn exists(&self, image: &str) -> Result<bool> {
        Ok(self.contains(image))
    }

    async fn build(&self, _context_dir: &Path, image: &str) -> Result<()> {
        record(&self.log, "image.build");
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.built_names.lock().unwrap().push(image.to_string());
        // Give concurrent invocations a chance to race on the same build
        tokio::time::sleep(Duration::from_millis(20)).await;
        if self.fail_build {
            return Err(SkillError::runtime("docker build exited with 1"));
        }
        self.images.lock().unwrap().insert(image.to_string());
        Ok(())
    }
}

// ── Containers ───────────────────────────────────────────

/// What a fake container does when started.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Prints `{"echo": <stdin>}` between output markers and exits 0.
    Echo,
    /// Prints the given streams and exits with `code`.
    Exit {
        code: i64,
        stdout: String,
        stderr: String,
    },
    /// Sleeps, then behaves like `Echo`.
    Sleep(Duration),
    /// The runtime refuses to start the container.
    StartFails,
}

pub struct FakeContainers {
    log: EventLog,
    behavior: Behavior,
    created: AtomicUsize,
    killed: AtomicUsize,
    removed: AtomicUsize,
    specs: Mutex<Vec<ContainerSpec>>,
}

impl FakeContainers {
    fn with_log(log: EventLog, behavior: Behavior) -> Self {
        Self {
            log,
            behavior,
            created: AtomicUsize::new(0),
            killed: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
            specs: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn killed(&self) -> usize {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn last_spec(&self) -> Option<ContainerSpec> {
        self.specs.lock().unwrap().last().cloned()
    }
}

fn echo(stdin: &[u8]) -> ContainerExit {
    let input: Value = serde_json::from_slice(stdin).unwrap_or(Value::Null);
    ContainerExit {
        exit_code: 0,
        stdout: format!(
            "starting echo\n{}bye\n",
            wrap_skill_output(&json!({ "echo": input }))
        ),
        stderr: "debug: echo skill done".to_string(),
    }
}

#[async_trait]
impl ContainerRuntime for FakeContainers {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        record(&self.log, "container.create");
        self.created.fetch_add(1, Ordering::SeqCst);
        self.specs.lock().unwrap().push(spec.clone());
        Ok(format!("{}{}", uuid::Uuid::new_v4().simple(), uuid::Uuid::new_v4().simple()))
    }

    async fn start(&self, _id: &str, stdin: Vec<u8>) -> Result<ContainerExit> {
        record(&self.log, "container.start");
        match &self.behavior {
            Behavior::Echo => Ok(echo(&stdin)),
            Behavior::Exit {
                code,
                stdout,
                stderr,
            } => Ok(ContainerExit {
                exit_code: *code,
                stdout: stdout.clone(),
                stderr: stderr.clone(),
            }),
            Behavior::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(echo(&stdin))
            }
            Behavior::StartFails => Err(SkillError::runtime("docker start failed")),
        }
    }

    async fn kill(&self, _id: &str) -> Result<()> {
        record(&self.log, "container.kill");
        self.killed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, _id: &str) -> Result<()> {
        record(&self.log, "container.remove");
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Backend ──────────────────────────────────────────────

/// A full fake backend sharing one event log.
pub struct FakeBackend {
    log: EventLog,
    pub resolver: Arc<FakeResolver>,
    pub networks: Arc<FakeNetworks>,
    pub images: Arc<FakeImages>,
    pub containers: Arc<FakeContainers>,
}

impl FakeBackend {
    pub fn new(behavior: Behavior) -> Self {
        let log: EventLog = Arc::default();
        Self {
            resolver: Arc::new(FakeResolver::new()),
            networks: Arc::new(FakeNetworks::with_log(log.clone())),
            images: Arc::new(FakeImages::with_log(log.clone())),
            containers: Arc::new(FakeContainers::with_log(log.clone(), behavior)),
            log,
        }
    }

    /// Makes `domain` resolvable.
    pub fn with_domain(self, domain: &str, addrs: Vec<IpAddr>) -> Self {
        let resolver = Arc::try_unwrap(self.resolver)
            .unwrap_or_else(|_| panic!("resolver already shared"))
            .with(domain, addrs);
        Self {
            resolver: Arc::new(resolver),
            ..self
        }
    }

    pub fn with_failing_build(self) -> Self {
        let images = FakeImages::with_log(self.log.clone()).failing_build();
        Self {
            images: Arc::new(images),
            ..self
        }
    }

    pub fn backend(&self) -> SandboxBackend {
        SandboxBackend {
            resolver: self.resolver.clone(),
            networks: self.networks.clone(),
            images: self.images.clone(),
            containers: self.containers.clone(),
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}
