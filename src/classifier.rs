use crate::error::MonitorError;
use crate::severity::SeverityLevel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    #[serde(rename = "ipv4")]
    V4,
    #[serde(rename = "ipv6")]
    V6,
}

impl AddressFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            AddressFamily::V4 => "ipv4",
            AddressFamily::V6 => "ipv6",
        }
    }

    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    /// Id of the route-table entity for this family.
    pub fn route_table_id(self) -> &'static str {
        match self {
            AddressFamily::V4 => "routes-v4",
            AddressFamily::V6 => "routes-v6",
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cidr {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl Cidr {
    pub fn default_for(family: AddressFamily) -> Self {
        let addr = match family {
            AddressFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        Self {
            addr,
            prefix_len: 0,
        }
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.addr)
    }

    pub fn is_default(&self) -> bool {
        self.prefix_len == 0
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.trim().split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s.trim(), None),
        };
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| format!("invalid address in '{s}'"))?;
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix_len = match prefix {
            Some(p) => p
                .parse::<u8>()
                .map_err(|_| format!("invalid prefix length in '{s}'"))?,
            None => max,
        };
        if prefix_len > max {
            return Err(format!("prefix length {prefix_len} too long in '{s}'"));
        }
        Ok(Self { addr, prefix_len })
    }
}

impl TryFrom<String> for Cidr {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cidr> for String {
    fn from(value: Cidr) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub destination: Cidr,
    pub gateway: Option<IpAddr>,
    pub device: String,
    pub metric: u32,
    pub is_default: bool,
    pub link_down: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingTable {
    pub family: AddressFamily,
    pub routes: Vec<Route>,
}

impl RoutingTable {
    pub fn default_routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter().filter(|r| r.is_default)
    }

    /// The default route the kernel would pick: lowest metric wins.
    pub fn chosen_default(&self) -> Option<&Route> {
        self.default_routes().min_by_key(|r| r.metric)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub target: String,
    pub sent: u32,
    pub received: u32,
    pub rtt_samples: Vec<f64>,
}

impl ProbeResult {
    pub fn loss_ratio(&self) -> f64 {
        if self.sent == 0 {
            return 1.0;
        }
        1.0 - f64::from(self.received) / f64::from(self.sent)
    }

    pub fn average_rtt_ms(&self) -> Option<f64> {
        if self.rtt_samples.is_empty() {
            return None;
        }
        Some(self.rtt_samples.iter().sum::<f64>() / self.rtt_samples.len() as f64)
    }
}

/// What happened when a probe was attempted.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Completed(ProbeResult),
    NameResolutionFailed { target: String, detail: String },
    TimedOut { target: String },
    Cancelled { target: String },
    Failed { target: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassifierThresholds {
    pub min_received_for_good: u32,
    pub slow_threshold_ms: f64,
}

impl ClassifierThresholds {
    pub fn validate(&self) -> Result<(), MonitorError> {
        if self.min_received_for_good == 0 {
            return Err(MonitorError::invalid("min_received_for_good must be > 0"));
        }
        if !self.slow_threshold_ms.is_finite() || self.slow_threshold_ms <= 0.0 {
            return Err(MonitorError::invalid(format!(
                "slow_threshold_ms must be finite and > 0, got {}",
                self.slow_threshold_ms
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub severity: SeverityLevel,
    pub annotation: String,
}

impl Classification {
    fn new(severity: SeverityLevel, annotation: impl Into<String>) -> Self {
        Self {
            severity,
            annotation: annotation.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReachabilityClassifier {
    thresholds: ClassifierThresholds,
}

impl ReachabilityClassifier {
    pub fn new(thresholds: ClassifierThresholds) -> Result<Self, MonitorError> {
        thresholds.validate()?;
        Ok(Self { thresholds })
    }

    pub fn thresholds(&self) -> &ClassifierThresholds {
        &self.thresholds
    }

    pub fn classify(&self, probe: &ProbeResult) -> Result<Classification, MonitorError> {
        if probe.sent == 0 {
            return Err(MonitorError::invalid(format!(
                "probe of {} sent no packets",
                probe.target
            )));
        }
        if probe.received > probe.sent {
            return Err(MonitorError::invalid(format!(
                "probe of {} received {} of {} packets",
                probe.target, probe.received, probe.sent
            )));
        }
        if probe.rtt_samples.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(MonitorError::invalid(format!(
                "probe of {} has invalid rtt samples",
                probe.target
            )));
        }

        let mut severity = if probe.sent == probe.received {
            SeverityLevel::Normal
        } else if probe.received >= self.thresholds.min_received_for_good {
            SeverityLevel::Degraded
        } else {
            SeverityLevel::Down
        };

        let avg = probe.average_rtt_ms();
        // Loss outranks latency: only a clean probe is downgraded to SLOW.
        if severity == SeverityLevel::Normal
            && avg.is_some_and(|ms| ms > self.thresholds.slow_threshold_ms)
        {
            severity = SeverityLevel::Slow;
        }

        let rtt = avg
            .map(|ms| format!(", avg rtt {ms:.1} ms"))
            .unwrap_or_default();
        Ok(Classification::new(
            severity,
            format!(
                "{}/{} replies from {} ({:.0}% loss{rtt})",
                probe.received,
                probe.sent,
                probe.target,
                probe.loss_ratio() * 100.0
            ),
        ))
    }

    pub fn classify_outcome(&self, outcome: &ProbeOutcome) -> Result<Classification, MonitorError> {
        match outcome {
            ProbeOutcome::Completed(probe) => self.classify(probe),
            ProbeOutcome::NameResolutionFailed { target, detail } => Ok(Classification::new(
                SeverityLevel::DownDependency,
                format!("cannot resolve {target}: {detail}"),
            )),
            ProbeOutcome::TimedOut { target } => Ok(Classification::new(
                SeverityLevel::Down,
                format!("probe of {target} timed out"),
            )),
            ProbeOutcome::Cancelled { target } => Ok(Classification::new(
                SeverityLevel::Unknown,
                format!("probe of {target} cancelled"),
            )),
            ProbeOutcome::Failed { target, reason } => Ok(Classification::new(
                SeverityLevel::Unknown,
                format!("probe of {target} failed: {reason}"),
            )),
        }
    }
}

/// Default-route health of one address family's routing table.
pub fn classify_routes(table: &RoutingTable) -> Result<Classification, MonitorError> {
    if let Some(stray) = table
        .routes
        .iter()
        .find(|r| r.destination.family() != table.family)
    {
        return Err(MonitorError::invalid(format!(
            "{} route {} in {} table",
            stray.destination.family(),
            stray.destination,
            table.family
        )));
    }

    let defaults = table.default_routes().count();
    let Some(chosen) = table.chosen_default() else {
        return Ok(Classification::new(
            SeverityLevel::Down,
            format!("no {} default route", table.family),
        ));
    };

    let via = chosen
        .gateway
        .map(|gw| format!(" via {gw}"))
        .unwrap_or_default();
    if chosen.link_down {
        return Ok(Classification::new(
            SeverityLevel::Down,
            format!("default route{via} dev {} is linkdown", chosen.device),
        ));
    }
    if defaults > 1 {
        return Ok(Classification::new(
            SeverityLevel::Other,
            format!("{defaults} {} default routes", table.family),
        ));
    }
    Ok(Classification::new(
        SeverityLevel::Normal,
        format!("default route{via} dev {}", chosen.device),
    ))
}
