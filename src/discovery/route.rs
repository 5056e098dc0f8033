use super::{route_table_key, Discoverer, EntityRecord};
use crate::classifier::{classify_routes, AddressFamily, Cidr, Route, RoutingTable};
use crate::command::CommandRunner;
use crate::entity::{EntityKey, LayerAttributes, OsiLayer, RouteTableAttrs};
use crate::error::MonitorError;
use async_trait::async_trait;
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const IP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct IpRoute {
    dst: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    gateway: Option<IpAddr>,
    #[serde(default)]
    dev: Option<String>,
    #[serde(default)]
    metric: Option<u32>,
    #[serde(default)]
    flags: Vec<String>,
}

pub struct RouteDiscoverer {
    runner: Arc<dyn CommandRunner>,
    program: String,
    families: Vec<AddressFamily>,
    link_dependencies: bool,
}

impl RouteDiscoverer {
    /// `link_dependencies` ties each table to the datalink entities carrying
    /// its default routes; only useful when links are discovered too.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        program: String,
        families: Vec<AddressFamily>,
        link_dependencies: bool,
    ) -> Self {
        Self {
            runner,
            program,
            families,
            link_dependencies,
        }
    }

    async fn table(&self, family: AddressFamily) -> Result<RoutingTable, MonitorError> {
        let flag = match family {
            AddressFamily::V4 => "-4",
            AddressFamily::V6 => "-6",
        };
        let argv: Vec<String> = [self.program.as_str(), "-j", flag, "route", "show"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let output = self.runner.run(&argv, IP_TIMEOUT).await?;
        if !output.success() {
            return Err(MonitorError::parse(
                "ip route",
                format!("exit {}: {}", output.exit_code, output.stderr_text().trim()),
            ));
        }
        parse_routes(family, &output.stdout_text())
    }

    fn record(&self, table: &RoutingTable) -> Result<EntityRecord, MonitorError> {
        let classification = classify_routes(table)?;
        let chosen = table.chosen_default();
        let attrs = RouteTableAttrs {
            family: table.family,
            route_count: table.routes.len() as u32,
            default_routes: table.default_routes().count() as u32,
            default_gateway: chosen.and_then(|r| r.gateway),
            default_device: chosen.map(|r| r.device.clone()).filter(|d| !d.is_empty()),
        };

        let mut devices: Vec<&str> = table
            .default_routes()
            .map(|r| r.device.as_str())
            .filter(|d| !d.is_empty())
            .collect();
        devices.sort_unstable();
        devices.dedup();
        let deps = if self.link_dependencies {
            devices
                .into_iter()
                .map(|d| EntityKey::new(OsiLayer::Datalink, d))
                .collect()
        } else {
            Vec::new()
        };

        Ok(EntityRecord::new(
            route_table_key(table.family),
            classification.severity,
            classification.annotation,
        )
        .with_attributes(LayerAttributes::RouteTable(attrs))
        .depends_on(deps))
    }
}

#[async_trait]
impl Discoverer for RouteDiscoverer {
    fn name(&self) -> &str {
        "route"
    }

    async fn discover(&self) -> Result<Vec<EntityRecord>, MonitorError> {
        let mut records = Vec::with_capacity(self.families.len());
        for family in &self.families {
            let record = self
                .table(*family)
                .await
                .and_then(|table| self.record(&table));
            records.push(record.unwrap_or_else(|err| {
                warn!(family = ?family, error = %err, "route table discovery failed");
                EntityRecord::unknown(route_table_key(*family), &err)
            }));
        }
        Ok(records)
    }
}

fn parse_routes(family: AddressFamily, text: &str) -> Result<RoutingTable, MonitorError> {
    let raw: Vec<IpRoute> = if text.trim().is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(text).map_err(|err| MonitorError::parse("ip route", err.to_string()))?
    };

    let mut routes = Vec::with_capacity(raw.len());
    // Unreachable/blackhole/prohibit entries never forward traffic.
    for r in raw.into_iter().filter(|r| r.kind.as_deref().map_or(true, |k| k == "unicast")) {
        let destination = if r.dst == "default" {
            Cidr::default_for(family)
        } else {
            r.dst
                .parse::<Cidr>()
                .map_err(|err| MonitorError::parse("ip route", format!("{}: {err}", r.dst)))?
        };
        routes.push(Route {
            is_default: destination.is_default(),
            destination,
            gateway: r.gateway,
            device: r.dev.unwrap_or_default(),
            metric: r.metric.unwrap_or(0),
            link_down: r.flags.iter().any(|f| f == "linkdown"),
        });
    }
    Ok(RoutingTable { family, routes })
}
