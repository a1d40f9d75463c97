//! Egress resolution.
//!
//! Turns the manifest's declared domains into concrete addresses for one
//! invocation. Resolution is fail-closed: if any declared domain does not
//! resolve, no allowlist is produced at all and the sandbox never starts.
//! Nothing is cached, so every invocation sees the addresses the domains
//! point at right now.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::Serialize;
use tracing::{debug, info};

use super::DomainResolver;
use crate::config::EgressMode;
use crate::error::{Result, SkillError};
use crate::skills::{EgressRule, SkillManifest};

/// Upper bound on a single domain lookup.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// A declared domain and what it resolved to for this invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedEgress {
    pub domain: String,
    pub addresses: Vec<IpAddr>,
    pub resolved_at: DateTime<Utc>,
}

/// Network reachability granted to one sandbox.
#[derive(Debug, Clone, PartialEq)]
pub enum EgressScope {
    /// No route out at all.
    Isolated,
    /// Only the listed endpoints. May be empty.
    Allowlist(Vec<ResolvedEgress>),
}

impl EgressScope {
    pub fn entries(&self) -> &[ResolvedEgress] {
        match self {
            EgressScope::Isolated => &[],
            EgressScope::Allowlist(entries) => entries,
        }
    }

    /// True when nothing outside the sandbox is reachable.
    pub fn is_isolated(&self) -> bool {
        self.entries().is_empty()
    }

    /// Every admitted address, deduplicated.
    pub fn addresses(&self) -> Vec<IpAddr> {
        let mut addrs: Vec<IpAddr> = self
            .entries()
            .iter()
            .flat_map(|e| e.addresses.iter().copied())
            .collect();
        addrs.sort();
        addrs.dedup();
        addrs
    }

    /// `(domain, address)` pairs to pin inside the sandbox.
    pub fn host_entries(&self) -> Vec<(String, IpAddr)> {
        self.entries()
            .iter()
            .flat_map(|e| e.addresses.iter().map(|ip| (e.domain.clone(), *ip)))
            .collect()
    }
}

/// Resolves every rule's domain. One entry per distinct domain, in
/// declaration order. Fails with the first domain that does not resolve.
pub async fn resolve_egress_domains(
    resolver: &dyn DomainResolver,
    rules: &[EgressRule],
) -> Result<Vec<ResolvedEgress>> {
    let mut domains: Vec<&str> = Vec::new();
    for rule in rules {
        if !domains.contains(&rule.domain.as_str()) {
            domains.push(&rule.domain);
        }
    }

    try_join_all(domains.into_iter().map(|domain| resolve_one(resolver, domain))).await
}

async fn resolve_one(resolver: &dyn DomainResolver, domain: &str) -> Result<ResolvedEgress> {
    let dns_error = |reason: String| SkillError::DnsResolution {
        domain: domain.to_string(),
        reason,
    };

    let mut addresses = tokio::time::timeout(RESOLVE_TIMEOUT, resolver.resolve(domain))
        .await
        .map_err(|_| dns_error(format!("lookup timed out after {}s", RESOLVE_TIMEOUT.as_secs())))?
        .map_err(|e| dns_error(e.to_string()))?;

    addresses.sort();
    addresses.dedup();
    if addresses.is_empty() {
        return Err(dns_error("no addresses returned".to_string()));
    }

    debug!("Resolved {domain} → {addresses:?}");
    Ok(ResolvedEgress {
        domain: domain.to_string(),
        addresses,
        resolved_at: Utc::now(),
    })
}

/// Computes the egress scope for an invocation.
///
/// `EgressMode::None` short-circuits without any lookups, whatever the
/// manifest declares.
pub async fn plan_egress(
    resolver: &dyn DomainResolver,
    mode: EgressMode,
    manifest: &SkillManifest,
) -> Result<EgressScope> {
    match mode {
        EgressMode::None => {
            debug!("Egress disabled for {}, skipping resolution", manifest.name);
            Ok(EgressScope::Isolated)
        }
        EgressMode::Allowlist => {
            let resolved =
                resolve_egress_domains(resolver, &manifest.permissions.network.egress).await?;
            info!(
                "Egress allowlist for {}: {} domain(s)",
                manifest.name,
                resolved.len()
            );
            Ok(EgressScope::Allowlist(resolved))
        }
    }
}

/// System name resolution via `getaddrinfo`.
pub struct SystemResolver;

#[async_trait]
impl DomainResolver for SystemResolver {
    async fn resolve(&self, domain: &str) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((domain, 443)).await?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testing::{test_manifest, FakeResolver};
    use std::net::Ipv4Addr;

    fn rule(domain: &str) -> EgressRule {
        EgressRule {
            domain: domain.to_string(),
            reason: "test".to_string(),
        }
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, last))
    }

    // ── resolve_egress_domains ───────────────────────────

    #[tokio::test]
    async fn test_one_entry_per_domain() {
        let resolver = FakeResolver::new()
            .with("a.example", vec![ip(1)])
            .with("b.example", vec![ip(2), ip(3)]);

        let resolved = resolve_egress_domains(&resolver, &[rule("a.example"), rule("b.example")])
            .await
            .unwrap();

        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].domain, "a.example");
        assert_eq!(resolved[0].addresses, vec![ip(1)]);
        assert_eq!(resolved[1].domain, "b.example");
        assert_eq!(resolved[1].addresses, vec![ip(2), ip(3)]);
    }

    #[tokio::test]
    async fn test_duplicate_rules_resolved_once() {
        let resolver = FakeResolver::new().with("a.example", vec![ip(1)]);
        let resolved = resolve_egress_domains(&resolver, &[rule("a.example"), rule("a.example")])
            .await
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolver.lookups(), 1);
    }

    #[tokio::test]
    async fn test_one_failure_fails_everything() {
        let resolver = FakeResolver::new()
            .with("a.example", vec![ip(1)])
            .with("c.example", vec![ip(3)]);

        let err = resolve_egress_domains(
            &resolver,
            &[rule("a.example"), rule("missing.example"), rule("c.example")],
        )
        .await
        .unwrap_err();

        match err {
            SkillError::DnsResolution { domain, .. } => assert_eq!(domain, "missing.example"),
            other => panic!("Expected DnsResolution, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_answer_is_a_failure() {
        let resolver = FakeResolver::new().with("empty.example", vec![]);
        let err = resolve_egress_domains(&resolver, &[rule("empty.example")])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DNS_RESOLUTION_ERROR");
    }

    #[tokio::test]
    async fn test_no_rules_resolves_to_empty() {
        let resolver = FakeResolver::new();
        let resolved = resolve_egress_domains(&resolver, &[]).await.unwrap();
        assert!(resolved.is_empty());
        assert_eq!(resolver.lookups(), 0);
    }

    #[tokio::test]
    async fn test_addresses_deduplicated() {
        let resolver = FakeResolver::new().with("a.example", vec![ip(2), ip(1), ip(2)]);
        let resolved = resolve_egress_domains(&resolver, &[rule("a.example")])
            .await
            .unwrap();
        assert_eq!(resolved[0].addresses, vec![ip(1), ip(2)]);
    }

    // ── plan_egress ──────────────────────────────────────

    #[tokio::test]
    async fn test_mode_none_skips_resolution() {
        let resolver = FakeResolver::new();
        let manifest = test_manifest("net-skill", &["a.example", "b.example"], &[]);

        let scope = plan_egress(&resolver, EgressMode::None, &manifest).await.unwrap();

        assert_eq!(scope, EgressScope::Isolated);
        assert!(scope.is_isolated());
        assert_eq!(resolver.lookups(), 0);
    }

    #[tokio::test]
    async fn test_allowlist_with_no_domains_is_valid_and_empty() {
        let resolver = FakeResolver::new();
        let manifest = test_manifest("offline", &[], &[]);

        let scope = plan_egress(&resolver, EgressMode::Allowlist, &manifest)
            .await
            .unwrap();

        assert_eq!(scope, EgressScope::Allowlist(vec![]));
        assert!(scope.is_isolated());
    }

    #[tokio::test]
    async fn test_allowlist_scope_entries() {
        let resolver = FakeResolver::new()
            .with("a.example", vec![ip(1)])
            .with("b.example", vec![ip(1), ip(2)]);
        let manifest = test_manifest("net-skill", &["a.example", "b.example"], &[]);

        let scope = plan_egress(&resolver, EgressMode::Allowlist, &manifest)
            .await
            .unwrap();

        assert!(!scope.is_isolated());
        assert_eq!(scope.addresses(), vec![ip(1), ip(2)]);
        assert_eq!(
            scope.host_entries(),
            vec![
                ("a.example".to_string(), ip(1)),
                ("b.example".to_string(), ip(1)),
                ("b.example".to_string(), ip(2)),
            ]
        );
    }

    #[tokio::test]
    async fn test_system_resolver_localhost() {
        let addrs = SystemResolver.resolve("localhost").await.unwrap();
        assert!(addrs.iter().all(|a| a.is_loopback()));
        assert!(!addrs.is_empty());
    }
}
