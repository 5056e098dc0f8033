use super::{classifier_for, ping, target_dependencies, Discoverer, EntityRecord};
use crate::classifier::{ProbeOutcome, ReachabilityClassifier};
use crate::command::CommandRunner;
use crate::config::{DnsConfig, RoutesConfig};
use crate::entity::{DnsAttrs, EntityKey, LayerAttributes, OsiLayer, ReachabilityAttrs};
use crate::error::MonitorError;
use crate::severity::SeverityLevel;
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::lookup_host;
use tokio::time;
use tracing::{debug, warn};

/// Resolver reachability plus an end-to-end name resolution check.
pub struct DnsDiscoverer {
    runner: Arc<dyn CommandRunner>,
    ping_program: String,
    cfg: DnsConfig,
    routes: RoutesConfig,
    classifier: ReachabilityClassifier,
}

impl DnsDiscoverer {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        ping_program: String,
        cfg: DnsConfig,
        routes: RoutesConfig,
    ) -> Result<Self, MonitorError> {
        let classifier = classifier_for("dns.resolver_probe", cfg.resolver_probe.thresholds())?;
        Ok(Self {
            runner,
            ping_program,
            cfg,
            routes,
            classifier,
        })
    }

    async fn resolver_record(&self, resolver: IpAddr) -> Result<EntityRecord, MonitorError> {
        let address = resolver.to_string();
        let key = resolver_key(resolver);
        let deps = target_dependencies(Vec::new(), &address, &self.routes);

        if !self.cfg.probe_resolvers {
            return Ok(EntityRecord::new(key, SeverityLevel::Normal, "listed in resolv.conf")
                .depends_on(deps));
        }

        let outcome = ping::probe(
            self.runner.as_ref(),
            &self.ping_program,
            &address,
            &self.cfg.resolver_probe,
        )
        .await;
        let classification = self.classifier.classify_outcome(&outcome)?;
        let (sent, received, avg_rtt_ms) = match &outcome {
            ProbeOutcome::Completed(r) => {
                (r.sent, r.received, r.average_rtt_ms())
            }
            _ => (0, 0, None),
        };
        Ok(
            EntityRecord::new(key, classification.severity, classification.annotation)
                .with_attributes(LayerAttributes::Reachability(ReachabilityAttrs {
                    address,
                    sent,
                    received,
                    avg_rtt_ms,
                }))
                .depends_on(deps),
        )
    }

    async fn resolve_names(&self) -> u32 {
        let budget = Duration::from_millis(self.cfg.timeout_ms);
        let mut resolved = 0;
        for name in &self.cfg.names {
            match time::timeout(budget, lookup_host((name.as_str(), 0))).await {
                Ok(Ok(mut addrs)) => {
                    if addrs.next().is_some() {
                        resolved += 1;
                    } else {
                        debug!(name = %name, "name resolved to no addresses");
                    }
                }
                Ok(Err(err)) => debug!(name = %name, error = %err, "name resolution failed"),
                Err(_) => debug!(name = %name, "name resolution timed out"),
            }
        }
        resolved
    }
}

pub fn resolver_key(resolver: IpAddr) -> EntityKey {
    EntityKey::new(OsiLayer::Network, format!("resolver:{resolver}"))
}

/// `nameserver` entries of a resolv.conf, in file order. IPv6 zone suffixes
/// are dropped and duplicates skipped.
pub fn parse_resolv_conf(text: &str) -> Vec<IpAddr> {
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut parts = line.split_whitespace();
        if parts.next() != Some("nameserver") {
            continue;
        }
        let Some(raw) = parts.next() else {
            continue;
        };
        let addr = raw.split('%').next().unwrap_or(raw);
        match addr.parse::<IpAddr>() {
            Ok(ip) if !out.contains(&ip) => out.push(ip),
            Ok(_) => {}
            Err(_) => debug!(entry = raw, "ignoring unparseable nameserver"),
        }
    }
    out
}

#[async_trait]
impl Discoverer for DnsDiscoverer {
    fn name(&self) -> &str {
        "dns"
    }

    async fn discover(&self) -> Result<Vec<EntityRecord>, MonitorError> {
        let text = tokio::fs::read_to_string(&self.cfg.resolv_conf)
            .await
            .map_err(|source| MonitorError::Command {
                program: format!("read {}", self.cfg.resolv_conf),
                source,
            })?;
        let resolvers = parse_resolv_conf(&text);

        let mut records = Vec::with_capacity(resolvers.len() + 1);
        for resolver in &resolvers {
            let record = match self.resolver_record(*resolver).await {
                Ok(record) => record,
                Err(err) => {
                    warn!(resolver = %resolver, error = %err, "resolver check failed");
                    let address = resolver.to_string();
                    EntityRecord::unknown(resolver_key(*resolver), &err)
                        .depends_on(target_dependencies(Vec::new(), &address, &self.routes))
                }
            };
            records.push(record);
        }

        let total = self.cfg.names.len() as u32;
        let resolved = self.resolve_names().await;
        let (severity, annotation) = if resolvers.is_empty() {
            (SeverityLevel::Down, "no resolvers configured".to_string())
        } else if total == 0 {
            (
                SeverityLevel::Normal,
                format!("{} resolvers, no names to check", resolvers.len()),
            )
        } else if resolved == total {
            (SeverityLevel::Normal, format!("{resolved}/{total} names resolved"))
        } else if resolved > 0 {
            (SeverityLevel::Degraded, format!("{resolved}/{total} names resolved"))
        } else {
            (SeverityLevel::Down, format!("0/{total} names resolved"))
        };

        records.push(
            EntityRecord::new(EntityKey::new(OsiLayer::Application, "dns"), severity, annotation)
                .with_attributes(LayerAttributes::Dns(DnsAttrs {
                    names_total: total,
                    names_resolved: resolved,
                    resolvers: resolvers.len() as u32,
                }))
                .depends_on(resolvers.iter().map(|r| resolver_key(*r))),
        );
        Ok(records)
    }
}
