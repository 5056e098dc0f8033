use crate::classifier::AddressFamily;
use crate::error::MonitorError;
use crate::severity::SeverityLevel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsiLayer {
    Physical,
    Datalink,
    Network,
    Transport,
    Session,
    Presentation,
    Application,
}

impl OsiLayer {
    pub const ALL: [OsiLayer; 7] = [
        OsiLayer::Physical,
        OsiLayer::Datalink,
        OsiLayer::Network,
        OsiLayer::Transport,
        OsiLayer::Session,
        OsiLayer::Presentation,
        OsiLayer::Application,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OsiLayer::Physical => "physical",
            OsiLayer::Datalink => "datalink",
            OsiLayer::Network => "network",
            OsiLayer::Transport => "transport",
            OsiLayer::Session => "session",
            OsiLayer::Presentation => "presentation",
            OsiLayer::Application => "application",
        }
    }
}

impl fmt::Display for OsiLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OsiLayer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['_', '-'], "").as_str() {
            "physical" => Ok(OsiLayer::Physical),
            "datalink" => Ok(OsiLayer::Datalink),
            "network" => Ok(OsiLayer::Network),
            "transport" => Ok(OsiLayer::Transport),
            "session" => Ok(OsiLayer::Session),
            "presentation" => Ok(OsiLayer::Presentation),
            "application" => Ok(OsiLayer::Application),
            _ => Err(format!("unknown OSI layer '{s}'")),
        }
    }
}

/// Identity of an entity: unique id within its layer. Renders as `layer:id`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityKey {
    pub layer: OsiLayer,
    pub id: String,
}

impl EntityKey {
    pub fn new(layer: OsiLayer, id: impl Into<String>) -> Self {
        Self {
            layer,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.layer, self.id)
    }
}

impl FromStr for EntityKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (layer, id) = s
            .split_once(':')
            .ok_or_else(|| format!("entity key '{s}' must look like layer:id"))?;
        if id.trim().is_empty() {
            return Err(format!("entity key '{s}' has an empty id"));
        }
        Ok(Self::new(layer.parse()?, id.trim()))
    }
}

impl TryFrom<String> for EntityKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntityKey> for String {
    fn from(value: EntityKey) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub at_unix_ms: i64,
    pub severity: SeverityLevel,
    pub annotation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttrValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            AttrValue::Bool(_) => "bool",
            AttrValue::Int(_) => "int",
            AttrValue::Float(_) => "float",
            AttrValue::Text(_) => "text",
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(v) => write!(f, "{v}"),
            AttrValue::Int(v) => write!(f, "{v}"),
            AttrValue::Float(v) => write!(f, "{v:.3}"),
            AttrValue::Text(v) => f.write_str(v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkAttrs {
    pub admin_up: bool,
    pub carrier: bool,
    pub mtu: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceAttrs {
    pub operstate: String,
    pub mac: Option<String>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteTableAttrs {
    pub family: AddressFamily,
    pub route_count: u32,
    pub default_routes: u32,
    pub default_gateway: Option<IpAddr>,
    pub default_device: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReachabilityAttrs {
    pub address: String,
    pub sent: u32,
    pub received: u32,
    pub avg_rtt_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportAttrs {
    pub address: String,
    pub connected: bool,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpAttrs {
    pub url: String,
    pub status_code: u16,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsAttrs {
    pub names_total: u32,
    pub names_resolved: u32,
    pub resolvers: u32,
}

/// Discoverer payload attached to an entity, one variant per record shape.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerAttributes {
    #[default]
    None,
    Link(LinkAttrs),
    Interface(InterfaceAttrs),
    RouteTable(RouteTableAttrs),
    Reachability(ReachabilityAttrs),
    Transport(TransportAttrs),
    Http(HttpAttrs),
    Dns(DnsAttrs),
}

fn int(v: u64) -> AttrValue {
    AttrValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
}

fn text(v: impl Into<String>) -> AttrValue {
    AttrValue::Text(v.into())
}

impl LayerAttributes {
    /// Declared attribute names and values, in a stable order.
    pub fn fields(&self) -> Vec<(&'static str, AttrValue)> {
        match self {
            LayerAttributes::None => Vec::new(),
            LayerAttributes::Link(a) => vec![
                ("admin_up", AttrValue::Bool(a.admin_up)),
                ("carrier", AttrValue::Bool(a.carrier)),
                ("mtu", int(a.mtu.into())),
            ],
            LayerAttributes::Interface(a) => {
                let mut out = vec![("operstate", text(a.operstate.clone()))];
                if let Some(mac) = &a.mac {
                    out.push(("mac", text(mac.clone())));
                }
                out.extend([
                    ("rx_bytes", int(a.rx_bytes)),
                    ("tx_bytes", int(a.tx_bytes)),
                    ("rx_errors", int(a.rx_errors)),
                    ("tx_errors", int(a.tx_errors)),
                    ("rx_dropped", int(a.rx_dropped)),
                    ("tx_dropped", int(a.tx_dropped)),
                ]);
                out
            }
            LayerAttributes::RouteTable(a) => {
                let mut out = vec![
                    ("family", text(a.family.as_str())),
                    ("route_count", int(a.route_count.into())),
                    ("default_routes", int(a.default_routes.into())),
                ];
                if let Some(gw) = a.default_gateway {
                    out.push(("default_gateway", text(gw.to_string())));
                }
                if let Some(dev) = &a.default_device {
                    out.push(("default_device", text(dev.clone())));
                }
                out
            }
            LayerAttributes::Reachability(a) => {
                let mut out = vec![
                    ("address", text(a.address.clone())),
                    ("sent", int(a.sent.into())),
                    ("received", int(a.received.into())),
                ];
                if let Some(rtt) = a.avg_rtt_ms {
                    out.push(("avg_rtt_ms", AttrValue::Float(rtt)));
                }
                out
            }
            LayerAttributes::Transport(a) => vec![
                ("address", text(a.address.clone())),
                ("connected", AttrValue::Bool(a.connected)),
                ("latency_ms", int(a.latency_ms)),
            ],
            LayerAttributes::Http(a) => vec![
                ("url", text(a.url.clone())),
                ("status_code", int(a.status_code.into())),
                ("latency_ms", AttrValue::Float(a.latency_ms)),
            ],
            LayerAttributes::Dns(a) => vec![
                ("names_total", int(a.names_total.into())),
                ("names_resolved", int(a.names_resolved.into())),
                ("resolvers", int(a.resolvers.into())),
            ],
        }
    }

    fn identity_fields(&self) -> Vec<(&'static str, String)> {
        match self {
            LayerAttributes::Interface(a) => a.mac.iter().map(|m| ("mac", m.clone())).collect(),
            LayerAttributes::RouteTable(a) => a
                .default_gateway
                .iter()
                .map(|gw| ("default_gateway", gw.to_string()))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Describes identity-preserving drift between two observations of the
    /// same resource, e.g. a NIC whose hardware address changed.
    pub fn identity_drift(&self, next: &LayerAttributes) -> Option<String> {
        let before: BTreeMap<_, _> = self.identity_fields().into_iter().collect();
        let changes: Vec<String> = next
            .identity_fields()
            .into_iter()
            .filter_map(|(name, value)| match before.get(name) {
                Some(prev) if *prev != value => Some(format!("{name} {prev} -> {value}")),
                _ => None,
            })
            .collect();
        if changes.is_empty() {
            None
        } else {
            Some(changes.join(", "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrDelta {
    Int(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityDelta {
    pub elapsed_ms: Option<i64>,
    pub fields: BTreeMap<String, AttrDelta>,
}

impl EntityDelta {
    /// Per-second rate of a numeric attribute over the elapsed window.
    pub fn rate_per_sec(&self, name: &str) -> Option<f64> {
        let elapsed = self.elapsed_ms.filter(|ms| *ms > 0)? as f64 / 1000.0;
        match self.fields.get(name)? {
            AttrDelta::Int(v) => Some(*v as f64 / elapsed),
            AttrDelta::Float(v) => Some(v / elapsed),
            AttrDelta::Text(_) => None,
        }
    }
}

/// A monitored resource and its run-length encoded severity history.
///
/// `observed` holds the last self-observation; `history` holds what the
/// entity actually reported, which may be a dependency-derived state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    key: EntityKey,
    observed: SeverityLevel,
    observed_note: String,
    history: Vec<Transition>,
    attributes: LayerAttributes,
}

impl Entity {
    pub fn new(key: EntityKey) -> Self {
        Self {
            key,
            observed: SeverityLevel::Unknown,
            observed_note: String::new(),
            history: Vec::new(),
            attributes: LayerAttributes::None,
        }
    }

    pub fn with_attributes(key: EntityKey, attributes: LayerAttributes) -> Self {
        Self {
            attributes,
            ..Self::new(key)
        }
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn layer(&self) -> OsiLayer {
        self.key.layer
    }

    pub fn id(&self) -> &str {
        &self.key.id
    }

    pub fn current_severity(&self) -> SeverityLevel {
        self.history
            .last()
            .map(|t| t.severity)
            .unwrap_or(SeverityLevel::Unknown)
    }

    pub fn observed_severity(&self) -> SeverityLevel {
        self.observed
    }

    pub fn observed_annotation(&self) -> &str {
        &self.observed_note
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    pub fn last_transition(&self) -> Option<&Transition> {
        self.history.last()
    }

    pub fn attributes(&self) -> &LayerAttributes {
        &self.attributes
    }

    /// Replaces the attribute payload, returning identity drift if any.
    pub fn set_attributes(&mut self, attributes: LayerAttributes) -> Option<String> {
        let drift = self.attributes.identity_drift(&attributes);
        self.attributes = attributes;
        drift
    }

    pub fn record_observation(&mut self, level: SeverityLevel, annotation: impl Into<String>) -> bool {
        self.record_observation_at(now_unix_ms(), level, annotation)
    }

    /// Stores a self-observation and appends a transition when it differs
    /// from the current severity. Returns whether history grew.
    pub fn record_observation_at(
        &mut self,
        at_unix_ms: i64,
        level: SeverityLevel,
        annotation: impl Into<String>,
    ) -> bool {
        let annotation = annotation.into();
        self.observed = level;
        self.observed_note = annotation.clone();
        self.push_transition(at_unix_ms, level, annotation)
    }

    /// Stores a self-observation without touching history; the next
    /// dependency pass decides what the entity reports.
    pub fn observe(&mut self, level: SeverityLevel, annotation: impl Into<String>) {
        self.observed = level;
        self.observed_note = annotation.into();
    }

    pub(crate) fn record_derived_at(
        &mut self,
        at_unix_ms: i64,
        level: SeverityLevel,
        annotation: impl Into<String>,
    ) -> bool {
        self.push_transition(at_unix_ms, level, annotation.into())
    }

    fn push_transition(&mut self, at_unix_ms: i64, level: SeverityLevel, annotation: String) -> bool {
        if !self.history.is_empty() && level == self.current_severity() {
            return false;
        }
        if self.history.is_empty() && level == SeverityLevel::Unknown {
            return false;
        }
        self.history.push(Transition {
            at_unix_ms,
            severity: level,
            annotation,
        });
        true
    }

    /// Difference of `self` relative to an earlier observation `other` of the
    /// same resource.
    pub fn diff_against(&self, other: &Entity) -> Result<EntityDelta, MonitorError> {
        if self.key != other.key {
            return Err(MonitorError::IdentityMismatch {
                left: self.key.clone(),
                right: other.key.clone(),
            });
        }

        let elapsed_ms = match (self.last_transition(), other.last_transition()) {
            (Some(a), Some(b)) => Some(a.at_unix_ms - b.at_unix_ms),
            _ => None,
        };

        let theirs: BTreeMap<_, _> = other.attributes.fields().into_iter().collect();
        let mut fields = BTreeMap::new();
        for (name, mine) in self.attributes.fields() {
            let Some(prev) = theirs.get(name) else {
                continue;
            };
            let delta = match (&mine, prev) {
                (AttrValue::Int(a), AttrValue::Int(b)) => AttrDelta::Int(a.saturating_sub(*b)),
                (AttrValue::Float(a), AttrValue::Float(b)) => AttrDelta::Float(a - b),
                (AttrValue::Bool(a), AttrValue::Bool(b)) => AttrDelta::Int(i64::from(*a) - i64::from(*b)),
                (AttrValue::Text(a), AttrValue::Text(b)) => AttrDelta::Text(format!("{b} -> {a}")),
                _ => {
                    return Err(MonitorError::TypeMismatch {
                        name: name.to_string(),
                        left: mine.type_name(),
                        right: prev.type_name(),
                    })
                }
            };
            fields.insert(name.to_string(), delta);
        }

        Ok(EntityDelta { elapsed_ms, fields })
    }

    /// Rebuilds an entity from persisted state: one transition at `since`.
    pub fn restore(
        key: EntityKey,
        severity: SeverityLevel,
        annotation: impl Into<String>,
        since_unix_ms: i64,
        attributes: LayerAttributes,
    ) -> Self {
        let mut entity = Self::with_attributes(key, attributes);
        entity.record_observation_at(since_unix_ms, severity, annotation);
        entity
    }
}

/// Every known entity, ordered by layer then id.
pub type EntityMap = BTreeMap<EntityKey, Entity>;

pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use SeverityLevel::*;

    fn key(layer: OsiLayer, id: &str) -> EntityKey {
        EntityKey::new(layer, id)
    }

    fn iface(mac: &str, rx_errors: u64) -> LayerAttributes {
        LayerAttributes::Interface(InterfaceAttrs {
            operstate: "UP".to_string(),
            mac: Some(mac.to_string()),
            rx_bytes: 1_000,
            tx_bytes: 500,
            rx_errors,
            tx_errors: 0,
            rx_dropped: 0,
            tx_dropped: 0,
        })
    }

    #[test]
    fn history_never_repeats_consecutive_severity() {
        let mut e = Entity::new(key(OsiLayer::Network, "gw"));
        let seq = [Normal, Normal, Slow, Slow, Down, Normal, Normal, Degraded];
        for (i, level) in seq.iter().enumerate() {
            e.record_observation_at(i as i64, *level, "");
        }
        let severities: Vec<_> = e.history().iter().map(|t| t.severity).collect();
        assert_eq!(severities, vec![Normal, Slow, Down, Normal, Degraded]);
        for pair in e.history().windows(2) {
            assert_ne!(pair[0].severity, pair[1].severity);
        }
        assert_eq!(e.current_severity(), Degraded);
    }

    #[test]
    fn empty_history_reads_unknown() {
        let mut e = Entity::new(key(OsiLayer::Physical, "eth0"));
        assert_eq!(e.current_severity(), Unknown);
        assert!(!e.record_observation_at(1, Unknown, "nothing yet"));
        assert!(e.history().is_empty());
        assert!(e.record_observation_at(2, Normal, "up"));
        assert_eq!(e.current_severity(), e.history().last().unwrap().severity);
    }

    #[test]
    fn observe_does_not_touch_history() {
        let mut e = Entity::new(key(OsiLayer::Datalink, "eth0"));
        e.observe(Down, "no carrier");
        assert_eq!(e.observed_severity(), Down);
        assert_eq!(e.current_severity(), Unknown);
        assert!(e.history().is_empty());
    }

    #[test]
    fn diff_requires_same_identity() {
        let a = Entity::new(key(OsiLayer::Datalink, "eth0"));
        let b = Entity::new(key(OsiLayer::Physical, "eth0"));
        let err = a.diff_against(&b).unwrap_err();
        assert!(matches!(err, MonitorError::IdentityMismatch { .. }));
    }

    #[test]
    fn diff_computes_counters_and_elapsed() {
        let k = key(OsiLayer::Datalink, "eth0");
        let mut before = Entity::with_attributes(k.clone(), iface("aa:bb", 3));
        before.record_observation_at(1_000, Normal, "");
        let mut after = Entity::with_attributes(k, iface("aa:cc", 13));
        after.record_observation_at(6_000, Degraded, "");

        let delta = after.diff_against(&before).unwrap();
        assert_eq!(delta.elapsed_ms, Some(5_000));
        assert_eq!(delta.fields.get("rx_errors"), Some(&AttrDelta::Int(10)));
        assert_eq!(
            delta.fields.get("mac"),
            Some(&AttrDelta::Text("aa:bb -> aa:cc".to_string()))
        );
        assert_eq!(delta.rate_per_sec("rx_errors"), Some(2.0));
    }

    #[test]
    fn diff_rejects_incompatible_attribute_types() {
        let k = key(OsiLayer::Application, "api");
        let tcp = Entity::with_attributes(
            k.clone(),
            LayerAttributes::Transport(TransportAttrs {
                address: "10.0.0.1:443".to_string(),
                connected: true,
                latency_ms: 5,
            }),
        );
        let http = Entity::with_attributes(
            k,
            LayerAttributes::Http(HttpAttrs {
                url: "https://10.0.0.1/".to_string(),
                status_code: 200,
                latency_ms: 7.5,
            }),
        );
        match http.diff_against(&tcp).unwrap_err() {
            MonitorError::TypeMismatch { name, left, right } => {
                assert_eq!(name, "latency_ms");
                assert_eq!(left, "float");
                assert_eq!(right, "int");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn diff_skips_attributes_present_on_one_side() {
        let k = key(OsiLayer::Network, "routes-v4");
        let table = |gw: Option<&str>, count: u32| {
            LayerAttributes::RouteTable(RouteTableAttrs {
                family: AddressFamily::V4,
                route_count: count,
                default_routes: 1,
                default_gateway: gw.map(|g| g.parse().unwrap()),
                default_device: None,
            })
        };
        let before = Entity::with_attributes(k.clone(), table(None, 3));
        let after = Entity::with_attributes(k, table(Some("192.168.1.1"), 5));
        let delta = after.diff_against(&before).unwrap();
        assert_eq!(delta.elapsed_ms, None);
        assert_eq!(delta.fields.get("route_count"), Some(&AttrDelta::Int(2)));
        assert!(!delta.fields.contains_key("default_gateway"));
        assert_eq!(delta.rate_per_sec("route_count"), None);
    }

    #[test]
    fn identity_drift_detects_mac_change() {
        let mut e = Entity::with_attributes(key(OsiLayer::Datalink, "eth0"), iface("aa:bb", 0));
        assert_eq!(e.set_attributes(iface("aa:bb", 4)), None);
        let drift = e.set_attributes(iface("de:ad", 4)).unwrap();
        assert_eq!(drift, "mac aa:bb -> de:ad");
    }

    #[test]
    fn key_round_trips_through_string() {
        let k: EntityKey = "network:routes-v4".parse().unwrap();
        assert_eq!(k, key(OsiLayer::Network, "routes-v4"));
        assert_eq!(k.to_string(), "network:routes-v4");
        assert_eq!("data_link:eth0".parse::<EntityKey>().unwrap().layer, OsiLayer::Datalink);
        assert!("nowhere:eth0".parse::<EntityKey>().is_err());
        assert!("network:".parse::<EntityKey>().is_err());
        // ids may contain ':' (IPv6 resolvers)
        let v6: EntityKey = "network:resolver:fe80::1".parse().unwrap();
        assert_eq!(v6.id, "resolver:fe80::1");
    }

    #[test]
    fn layers_follow_dependency_direction() {
        assert!(OsiLayer::Physical < OsiLayer::Datalink);
        assert!(OsiLayer::Presentation < OsiLayer::Application);
    }
}
