pub mod checks;
pub mod dns;
pub mod link;
pub mod ping;
pub mod route;

use crate::classifier::{AddressFamily, ClassifierThresholds, ReachabilityClassifier};
use crate::command::CommandRunner;
use crate::config::{parse_depends_on, Config, RoutesConfig};
use crate::entity::{EntityKey, LayerAttributes, OsiLayer};
use crate::error::MonitorError;
use crate::severity::SeverityLevel;
use async_trait::async_trait;
use reqwest::Client;
use std::net::IpAddr;
use std::sync::Arc;

/// One entity as seen by a single discovery pass.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub key: EntityKey,
    pub severity: SeverityLevel,
    pub annotation: String,
    pub attributes: LayerAttributes,
    pub depends_on: Vec<EntityKey>,
}

impl EntityRecord {
    pub fn new(key: EntityKey, severity: SeverityLevel, annotation: impl Into<String>) -> Self {
        Self {
            key,
            severity,
            annotation: annotation.into(),
            attributes: LayerAttributes::None,
            depends_on: Vec::new(),
        }
    }

    /// Stand-in for an entity whose own check failed while the rest of the
    /// pass succeeded.
    pub fn unknown(key: EntityKey, err: &MonitorError) -> Self {
        Self::new(key, SeverityLevel::Unknown, err.to_string())
    }

    pub fn with_attributes(mut self, attributes: LayerAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn depends_on(mut self, deps: impl IntoIterator<Item = EntityKey>) -> Self {
        self.depends_on.extend(deps);
        self
    }
}

/// A source of entities. Each call returns the complete current view of the
/// entities the discoverer owns.
#[async_trait]
pub trait Discoverer: Send + Sync {
    fn name(&self) -> &str;

    async fn discover(&self) -> Result<Vec<EntityRecord>, MonitorError>;
}

pub fn route_table_key(family: AddressFamily) -> EntityKey {
    EntityKey::new(OsiLayer::Network, family.route_table_id())
}

/// Dependencies for a probe target: the explicit list, or the route table
/// of the target's address family when that table is monitored. Host names
/// are assumed to travel over IPv4 when it is monitored.
pub fn target_dependencies(
    explicit: Vec<EntityKey>,
    address: &str,
    routes: &RoutesConfig,
) -> Vec<EntityKey> {
    if !explicit.is_empty() {
        return explicit;
    }
    let family = match address.parse::<IpAddr>() {
        Ok(ip) => Some(AddressFamily::of(&ip)),
        Err(_) if routes.ipv4 => Some(AddressFamily::V4),
        Err(_) if routes.ipv6 => Some(AddressFamily::V6),
        Err(_) => None,
    };
    match family {
        Some(AddressFamily::V4) if routes.ipv4 => vec![route_table_key(AddressFamily::V4)],
        Some(AddressFamily::V6) if routes.ipv6 => vec![route_table_key(AddressFamily::V6)],
        _ => Vec::new(),
    }
}

pub(crate) fn classifier_for(
    owner: &str,
    thresholds: ClassifierThresholds,
) -> Result<ReachabilityClassifier, MonitorError> {
    ReachabilityClassifier::new(thresholds)
        .map_err(|err| MonitorError::invalid(format!("{owner}: {err}")))
}

/// Builds every discoverer enabled by `cfg`.
pub fn build_discoverers(
    cfg: &Config,
    runner: Arc<dyn CommandRunner>,
    client: Client,
) -> Result<Vec<Arc<dyn Discoverer>>, MonitorError> {
    let mut out: Vec<Arc<dyn Discoverer>> = Vec::new();

    if cfg.links.enabled {
        out.push(Arc::new(link::LinkDiscoverer::new(
            runner.clone(),
            cfg.commands.ip.clone(),
            cfg.links.include_loopback,
        )));
    }

    let families: Vec<AddressFamily> = [
        (cfg.routes.ipv4, AddressFamily::V4),
        (cfg.routes.ipv6, AddressFamily::V6),
    ]
    .into_iter()
    .filter_map(|(on, family)| on.then_some(family))
    .collect();
    if !families.is_empty() {
        out.push(Arc::new(route::RouteDiscoverer::new(
            runner.clone(),
            cfg.commands.ip.clone(),
            families,
            cfg.links.enabled,
        )));
    }

    if !cfg.ping_targets.is_empty() {
        let mut targets = Vec::with_capacity(cfg.ping_targets.len());
        for t in &cfg.ping_targets {
            let explicit = parse_depends_on(&t.name, &t.depends_on)
                .map_err(|err| MonitorError::invalid(err.to_string()))?;
            targets.push(ping::PingTarget {
                key: t.key(),
                address: t.address.clone(),
                settings: t.probe,
                classifier: classifier_for(&t.name, t.probe.thresholds())?,
                depends_on: target_dependencies(explicit, &t.address, &cfg.routes),
            });
        }
        out.push(Arc::new(ping::PingDiscoverer::new(
            runner.clone(),
            cfg.commands.ping.clone(),
            targets,
        )));
    }

    if !cfg.tcp_checks.is_empty() {
        let mut checks = Vec::with_capacity(cfg.tcp_checks.len());
        for c in &cfg.tcp_checks {
            let explicit = parse_depends_on(&c.name, &c.depends_on)
                .map_err(|err| MonitorError::invalid(err.to_string()))?;
            checks.push(checks::TcpTarget {
                key: c.key(),
                host: c.host.clone(),
                port: c.port,
                timeout_ms: c.timeout_ms,
                slow_threshold_ms: c.slow_threshold_ms,
                depends_on: target_dependencies(explicit, &c.host, &cfg.routes),
            });
        }
        out.push(Arc::new(checks::TransportDiscoverer::new(checks)));
    }

    if !cfg.http_checks.is_empty() {
        let mut checks = Vec::with_capacity(cfg.http_checks.len());
        for c in &cfg.http_checks {
            let explicit = parse_depends_on(&c.name, &c.depends_on)
                .map_err(|err| MonitorError::invalid(err.to_string()))?;
            let host = reqwest::Url::parse(&c.url)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.trim_matches(['[', ']']).to_string()))
                .unwrap_or_default();
            checks.push(checks::HttpTarget {
                key: c.key(),
                url: c.url.clone(),
                timeout_ms: c.timeout_ms,
                expected_status: c.expected_status,
                slow_threshold_ms: c.slow_threshold_ms,
                depends_on: target_dependencies(explicit, &host, &cfg.routes),
            });
        }
        out.push(Arc::new(checks::HttpDiscoverer::new(client, checks)));
    }

    if cfg.dns.enabled {
        out.push(Arc::new(dns::DnsDiscoverer::new(
            runner,
            cfg.commands.ping.clone(),
            cfg.dns.clone(),
            cfg.routes.clone(),
        )?));
    }

    Ok(out)
}
