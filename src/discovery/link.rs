use super::{Discoverer, EntityRecord};
use crate::command::CommandRunner;
use crate::entity::{EntityKey, InterfaceAttrs, LayerAttributes, LinkAttrs, OsiLayer};
use crate::error::MonitorError;
use crate::severity::SeverityLevel;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const IP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct IpLink {
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    mtu: u32,
    #[serde(default)]
    operstate: String,
    #[serde(default)]
    link_type: String,
    #[serde(default)]
    address: Option<String>,
    #[serde(default, alias = "stats")]
    stats64: Option<IpLinkStats>,
}

#[derive(Debug, Default, Deserialize)]
struct IpLinkStats {
    #[serde(default)]
    rx: IpCounters,
    #[serde(default)]
    tx: IpCounters,
}

#[derive(Debug, Default, Deserialize)]
struct IpCounters {
    #[serde(default)]
    bytes: u64,
    #[serde(default)]
    errors: u64,
    #[serde(default)]
    dropped: u64,
}

impl IpLink {
    fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    fn is_loopback(&self) -> bool {
        self.link_type == "loopback" || self.has_flag("LOOPBACK")
    }
}

/// Physical and datalink entities for every interface `ip link` reports.
pub struct LinkDiscoverer {
    runner: Arc<dyn CommandRunner>,
    program: String,
    include_loopback: bool,
    last_errors: Mutex<HashMap<String, u64>>,
}

impl LinkDiscoverer {
    pub fn new(runner: Arc<dyn CommandRunner>, program: String, include_loopback: bool) -> Self {
        Self {
            runner,
            program,
            include_loopback,
            last_errors: Mutex::new(HashMap::new()),
        }
    }

    fn records_for(&self, link: &IpLink) -> [EntityRecord; 2] {
        let admin_up = link.has_flag("UP");
        let carrier = link.has_flag("LOWER_UP");
        let physical_key = EntityKey::new(OsiLayer::Physical, &link.ifname);

        let (phys_level, phys_note) = if !admin_up {
            (SeverityLevel::DownAcknowledged, "administratively down".to_string())
        } else if carrier {
            (SeverityLevel::Normal, "carrier up".to_string())
        } else {
            (SeverityLevel::Down, "no carrier".to_string())
        };
        let physical = EntityRecord::new(physical_key.clone(), phys_level, phys_note)
            .with_attributes(LayerAttributes::Link(LinkAttrs {
                admin_up,
                carrier,
                mtu: link.mtu,
            }));

        let stats = link.stats64.as_ref();
        let rx = stats.map(|s| &s.rx);
        let tx = stats.map(|s| &s.tx);
        let attrs = InterfaceAttrs {
            operstate: link.operstate.clone(),
            mac: link.address.clone().filter(|m| !m.is_empty()),
            rx_bytes: rx.map_or(0, |c| c.bytes),
            tx_bytes: tx.map_or(0, |c| c.bytes),
            rx_errors: rx.map_or(0, |c| c.errors),
            tx_errors: tx.map_or(0, |c| c.errors),
            rx_dropped: rx.map_or(0, |c| c.dropped),
            tx_dropped: tx.map_or(0, |c| c.dropped),
        };

        let errors = attrs.rx_errors + attrs.tx_errors;
        let previous = {
            let mut last = self
                .last_errors
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            last.insert(link.ifname.clone(), errors)
        };
        let rising = previous.is_some_and(|prev| errors > prev);

        let (level, note) = match link.operstate.as_str() {
            _ if !admin_up => (SeverityLevel::DownAcknowledged, "administratively down".to_string()),
            "UP" | "UNKNOWN" if rising => (
                SeverityLevel::Degraded,
                format!(
                    "{} new interface errors",
                    errors - previous.unwrap_or_default()
                ),
            ),
            "UP" | "UNKNOWN" => (SeverityLevel::Normal, format!("operstate {}", link.operstate)),
            "DOWN" | "LOWERLAYERDOWN" if carrier => (
                SeverityLevel::Down,
                format!("operstate {} with carrier present", link.operstate),
            ),
            // No carrier: the physical entity carries the verdict.
            "DOWN" | "LOWERLAYERDOWN" => (
                SeverityLevel::Unknown,
                format!("operstate {}", link.operstate),
            ),
            other => (SeverityLevel::Other, format!("operstate {other}")),
        };
        let datalink = EntityRecord::new(EntityKey::new(OsiLayer::Datalink, &link.ifname), level, note)
            .with_attributes(LayerAttributes::Interface(attrs))
            .depends_on([physical_key]);

        [physical, datalink]
    }
}

#[async_trait]
impl Discoverer for LinkDiscoverer {
    fn name(&self) -> &str {
        "link"
    }

    async fn discover(&self) -> Result<Vec<EntityRecord>, MonitorError> {
        let argv: Vec<String> = [self.program.as_str(), "-j", "-s", "link", "show"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let output = self.runner.run(&argv, IP_TIMEOUT).await?;
        if !output.success() {
            return Err(MonitorError::parse(
                "ip link",
                format!("exit {}: {}", output.exit_code, output.stderr_text().trim()),
            ));
        }
        let links = parse_links(&output.stdout_text())?;
        Ok(links
            .iter()
            .filter(|l| self.include_loopback || !l.is_loopback())
            .flat_map(|l| self.records_for(l))
            .collect())
    }
}

fn parse_links(text: &str) -> Result<Vec<IpLink>, MonitorError> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(text).map_err(|err| MonitorError::parse("ip link", err.to_string()))
}
