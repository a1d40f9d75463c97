//! Docker CLI backend.
//!
//! Drives `docker` (and `iptables` for allowlisted networks) through
//! `tokio::process`. Every child is spawned with `kill_on_drop`, so a
//! cancelled call never leaves a CLI process behind.
//!
//! # Network enforcement
//!
//! - A scope with nothing admitted gets an `--internal` bridge network: no
//!   route off the host, so any connection attempt fails immediately with
//!   "network unreachable".
//! - A scope with admitted addresses gets a routed bridge with a fixed
//!   interface name, plus `DOCKER-USER` rules that accept return traffic and
//!   the admitted IPv4 addresses and drop everything else from that bridge.
//!   An `INPUT` rule drops traffic from the bridge to the host itself.
//!   IPv6 answers are not admitted.
//! - Containers get an unreachable resolver (`--dns 127.0.0.1`). Admitted
//!   domains are pinned with `--add-host`, so no lookup leaves the sandbox.
//!
//! Firewall rules outlive the network: they are only deleted once
//! `docker network rm` succeeded, so a container that could not be removed
//! stays behind the `DROP` rules.

use std::net::IpAddr;
use std::path::Path;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{
    ContainerExit, ContainerRuntime, ContainerSpec, EgressScope, ImageStore, NetworkHandle,
    NetworkProvider,
};
use crate::error::{Result, SkillError};

/// Label put on every network and container this crate creates.
pub const MANAGED_LABEL: &str = "skill-runner.managed=true";

/// Firewall chain Docker reserves for user rules on forwarded traffic.
const FORWARD_CHAIN: &str = "DOCKER-USER";

/// Chain for traffic addressed to the host.
const HOST_CHAIN: &str = "INPUT";

/// Resolver handed to containers. Nothing listens there.
const SANDBOX_DNS: &str = "127.0.0.1";

/// An iptables rule: its chain and its match/target arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub chain: &'static str,
    pub args: Vec<String>,
}

impl FirewallRule {
    fn new(chain: &'static str, parts: &[&str]) -> Self {
        Self {
            chain,
            args: parts.iter().map(|s| s.to_string()).collect(),
        }
    }
}

pub struct DockerCli {
    docker: String,
    iptables: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker", "iptables")
    }
}

impl DockerCli {
    pub fn new(docker: &str, iptables: &str) -> Self {
        Self {
            docker: docker.to_string(),
            iptables: iptables.to_string(),
        }
    }

    async fn docker(&self, args: &[String]) -> Result<Output> {
        run(&self.docker, args).await
    }

    /// Runs docker and fails unless it exits 0. Returns trimmed stdout.
    async fn docker_ok(&self, args: &[String]) -> Result<String> {
        let output = self.docker(args).await?;
        if !output.status.success() {
            return Err(SkillError::runtime(format!(
                "docker {} failed: {}",
                subcommand(args),
                stderr_of(&output)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn firewall(&self, action: &str, rule: &FirewallRule) -> Result<()> {
        // -w waits for the xtables lock instead of failing on contention
        let mut args = vec!["-w".to_string(), action.to_string(), rule.chain.to_string()];
        if action == "-I" {
            args.push("1".to_string());
        }
        args.extend(rule.args.iter().cloned());

        let output = run(&self.iptables, &args).await?;
        if !output.status.success() {
            return Err(SkillError::network(format!(
                "{} {} failed: {}",
                self.iptables,
                args.join(" "),
                stderr_of(&output)
            )));
        }
        Ok(())
    }

    /// Inserts `rules` so that each chain ends up in the given top-to-bottom
    /// order. On failure, removes whatever was already inserted.
    async fn install_rules(&self, rules: &[FirewallRule]) -> Result<()> {
        let mut installed: Vec<&FirewallRule> = Vec::new();
        for rule in rules.iter().rev() {
            if let Err(e) = self.firewall("-I", rule).await {
                self.delete_rules(installed.into_iter()).await;
                return Err(e);
            }
            installed.push(rule);
        }
        Ok(())
    }

    async fn delete_rules<'a>(&self, rules: impl Iterator<Item = &'a FirewallRule>) -> usize {
        let mut failures = 0;
        for rule in rules {
            if let Err(e) = self.firewall("-D", rule).await {
                warn!("Failed to delete firewall rule: {e}");
                failures += 1;
            }
        }
        failures
    }
}

async fn run(program: &str, args: &[String]) -> Result<Output> {
    debug!("exec: {program} {}", args.join(" "));
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| SkillError::runtime(format!("cannot run {program}: {e}")))
}

/// `network rm`, `image inspect`, or just `build` for error messages.
fn subcommand(args: &[String]) -> String {
    match args.first().map(String::as_str) {
        Some(group @ ("network" | "image")) => match args.get(1) {
            Some(action) => format!("{group} {action}"),
            None => group.to_string(),
        },
        Some(cmd) => cmd.to_string(),
        None => String::new(),
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Interface name for a network's bridge (15 characters at most).
pub fn bridge_name(network_name: &str) -> String {
    let alnum: Vec<char> = network_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    let start = alnum.len().saturating_sub(12);
    format!("sr-{}", alnum[start..].iter().collect::<String>())
}

/// `docker network create` arguments.
pub fn network_create_args(name: &str, bridge: &str, internal: bool) -> Vec<String> {
    let mut args: Vec<String> = [
        "network",
        "create",
        "--driver",
        "bridge",
        "--label",
        MANAGED_LABEL,
        "--opt",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(format!("com.docker.network.bridge.name={bridge}"));
    if internal {
        args.push("--internal".to_string());
    }
    args.push(name.to_string());
    args
}

/// Firewall rules for an allowlisted bridge, top to bottom within each chain.
pub fn allowlist_rules(bridge: &str, admitted: &[IpAddr]) -> Vec<FirewallRule> {
    let mut rules = vec![FirewallRule::new(
        FORWARD_CHAIN,
        &[
            "-o",
            bridge,
            "-m",
            "conntrack",
            "--ctstate",
            "ESTABLISHED,RELATED",
            "-j",
            "ACCEPT",
        ],
    )];
    for ip in admitted {
        let ip = ip.to_string();
        rules.push(FirewallRule::new(
            FORWARD_CHAIN,
            &["-i", bridge, "-d", &ip, "-j", "ACCEPT"],
        ));
    }
    rules.push(FirewallRule::new(FORWARD_CHAIN, &["-i", bridge, "-j", "DROP"]));
    rules.push(FirewallRule::new(HOST_CHAIN, &["-i", bridge, "-j", "DROP"]));
    rules
}

/// `docker create` arguments for a sandbox container.
pub fn container_create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "create".into(),
        "--interactive".into(),
        "--name".into(),
        spec.name.clone(),
        "--network".into(),
        spec.network.clone(),
        "--memory".into(),
        format!("{}m", spec.memory_mb),
        "--memory-swap".into(),
        format!("{}m", spec.memory_mb),
        "--cpus".into(),
        spec.cpu.to_string(),
        "--security-opt".into(),
        "no-new-privileges".into(),
        "--dns".into(),
        SANDBOX_DNS.into(),
        "--label".into(),
        MANAGED_LABEL.into(),
    ];
    for (key, value) in &spec.env {
        args.push("--env".into());
        args.push(format!("{key}={value}"));
    }
    for (domain, ip) in &spec.extra_hosts {
        args.push("--add-host".into());
        args.push(format!("{domain}:{ip}"));
    }
    args.push(spec.image.clone());
    args
}

#[async_trait]
impl NetworkProvider for DockerCli {
    async fn create(&self, name: &str, scope: &EgressScope) -> Result<NetworkHandle> {
        let admitted: Vec<IpAddr> = scope.addresses().into_iter().filter(IpAddr::is_ipv4).collect();
        let internal = admitted.is_empty();
        let bridge = bridge_name(name);

        let id = self
            .docker_ok(&network_create_args(name, &bridge, internal))
            .await
            .map_err(|e| SkillError::network(format!("cannot create network {name}: {e}")))?;

        if !internal {
            if let Err(e) = self.install_rules(&allowlist_rules(&bridge, &admitted)).await {
                let rm = ["network".to_string(), "rm".to_string(), name.to_string()];
                if let Err(rm_err) = self.docker_ok(&rm).await {
                    warn!("Failed to remove network {name} after firewall error: {rm_err}");
                }
                return Err(e);
            }
        }

        Ok(NetworkHandle {
            name: name.to_string(),
            id,
            bridge: Some(bridge),
            internal,
            admitted,
        })
    }

    async fn remove(&self, handle: &NetworkHandle) -> Result<()> {
        let rm = ["network".to_string(), "rm".to_string(), handle.name.clone()];
        if let Err(e) = self.docker_ok(&rm).await {
            if !handle.internal {
                warn!(
                    "Network {} still exists, keeping its firewall rules in place",
                    handle.name
                );
            }
            return Err(SkillError::network(format!(
                "cannot remove network {}: {e}",
                handle.name
            )));
        }

        let mut failed_rules = 0;
        if let (false, Some(bridge)) = (handle.internal, &handle.bridge) {
            let rules = allowlist_rules(bridge, &handle.admitted);
            failed_rules = self.delete_rules(rules.iter()).await;
        }

        if failed_rules > 0 {
            return Err(SkillError::network(format!(
                "{failed_rules} firewall rule(s) for {} could not be deleted",
                handle.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ImageStore for DockerCli {
    async fn exists(&self, image: &str) -> Result<bool> {
        let args = ["image".to_string(), "inspect".to_string(), image.to_string()];
        Ok(self.docker(&args).await?.status.success())
    }

    async fn build(&self, context_dir: &Path, image: &str) -> Result<()> {
        let args = [
            "build".to_string(),
            "--label".to_string(),
            MANAGED_LABEL.to_string(),
            "--tag".to_string(),
            image.to_string(),
            context_dir.display().to_string(),
        ];
        self.docker_ok(&args).await.map(|_| ())
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        self.docker_ok(&container_create_args(spec)).await
    }

    async fn start(&self, id: &str, stdin: Vec<u8>) -> Result<ContainerExit> {
        let mut child = Command::new(&self.docker)
            .args(["start", "--attach", "--interactive", id])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SkillError::runtime(format!("cannot run {}: {e}", self.docker)))?;

        // Feed stdin concurrently with draining the output pipes, so neither
        // side can block the other on a full pipe.
        if let Some(mut pipe) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&stdin).await {
                    debug!("Writing skill input failed: {e}");
                }
                // Dropping the pipe closes the container's stdin
            });
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SkillError::runtime(format!("waiting for container failed: {e}")))?;

        Ok(ContainerExit {
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn kill(&self, id: &str) -> Result<()> {
        let args = ["kill".to_string(), id.to_string()];
        self.docker_ok(&args).await.map(|_| ())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let args = ["rm".to_string(), "--force".to_string(), id.to_string()];
        self.docker_ok(&args).await.map(|_| ())
    }
}
