use crate::classifier::ClassifierThresholds;
use crate::entity::{EntityKey, OsiLayer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    pub interval_secs: u64,
    #[serde(default)]
    pub system_name: Option<String>,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    #[serde(default)]
    pub commands: CommandPaths,
    #[serde(default)]
    pub links: LinksConfig,
    #[serde(default)]
    pub routes: RoutesConfig,
    #[serde(default)]
    pub ping_targets: Vec<PingTargetConfig>,
    #[serde(default)]
    pub tcp_checks: Vec<TcpCheckConfig>,
    #[serde(default)]
    pub http_checks: Vec<HttpCheckConfig>,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub snapshots: SnapshotsConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandPaths {
    #[serde(default = "default_ip_command")]
    pub ip: String,
    #[serde(default = "default_ping_command")]
    pub ping: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LinksConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub include_loopback: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutesConfig {
    #[serde(default = "default_true")]
    pub ipv4: bool,
    #[serde(default = "default_true")]
    pub ipv6: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct ProbeSettings {
    #[serde(default = "default_probe_count")]
    pub count: u32,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_min_received_for_good")]
    pub min_received_for_good: u32,
    #[serde(default = "default_ping_slow_threshold_ms")]
    pub slow_threshold_ms: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PingTargetConfig {
    pub name: String,
    pub address: String,
    #[serde(default = "default_ping_layer")]
    pub layer: OsiLayer,
    #[serde(flatten)]
    pub probe: ProbeSettings,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub alert: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TcpCheckConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub timeout_ms: u64,
    #[serde(default = "default_tcp_slow_threshold_ms")]
    pub slow_threshold_ms: f64,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub alert: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpCheckConfig {
    pub name: String,
    pub url: String,
    pub timeout_ms: u64,
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
    #[serde(default = "default_http_slow_threshold_ms")]
    pub slow_threshold_ms: f64,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub alert: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_resolv_conf")]
    pub resolv_conf: String,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_true")]
    pub probe_resolvers: bool,
    #[serde(default)]
    pub resolver_probe: ProbeSettings,
    #[serde(default)]
    pub alert: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SnapshotsConfig {
    #[serde(default)]
    pub nominal_path: Option<String>,
    #[serde(default)]
    pub current_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub chat_ids: Vec<i64>,
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
}

impl Default for CommandPaths {
    fn default() -> Self {
        Self {
            ip: default_ip_command(),
            ping: default_ping_command(),
        }
    }
}

impl Default for LinksConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            include_loopback: false,
        }
    }
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            ipv4: true,
            ipv6: true,
        }
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            count: default_probe_count(),
            timeout_ms: default_probe_timeout_ms(),
            min_received_for_good: default_min_received_for_good(),
            slow_threshold_ms: default_ping_slow_threshold_ms(),
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            resolv_conf: default_resolv_conf(),
            names: Vec::new(),
            timeout_ms: default_probe_timeout_ms(),
            probe_resolvers: true,
            resolver_probe: ProbeSettings::default(),
            alert: false,
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token_env: default_bot_token_env(),
            bot_token: None,
            chat_ids: Vec::new(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
        }
    }
}

impl ProbeSettings {
    pub fn thresholds(&self) -> ClassifierThresholds {
        ClassifierThresholds {
            min_received_for_good: self.min_received_for_good,
            slow_threshold_ms: self.slow_threshold_ms,
        }
    }
}

impl PingTargetConfig {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.layer, &self.name)
    }
}

impl TcpCheckConfig {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(OsiLayer::Transport, &self.name)
    }
}

impl HttpCheckConfig {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(OsiLayer::Application, &self.name)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }
        if self.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "interval_secs must be >= 1".to_string(),
            ));
        }
        if self.discovery_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "discovery_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.commands.ip.trim().is_empty() || self.commands.ping.trim().is_empty() {
            return Err(ConfigError::Validation(
                "commands.ip and commands.ping must not be empty".to_string(),
            ));
        }

        validate_ping_targets(&self.ping_targets)?;
        validate_tcp_checks(&self.tcp_checks)?;
        validate_http_checks(&self.http_checks)?;
        validate_dns(&self.dns)?;
        validate_telegram(&self.telegram)?;
        self.validate_entity_keys()?;

        Ok(())
    }

    /// Configured entities must not share a key with each other or with an
    /// entity the built-in discoverers create.
    fn validate_entity_keys(&self) -> Result<(), ConfigError> {
        let built_in = [
            EntityKey::new(OsiLayer::Network, "routes-v4"),
            EntityKey::new(OsiLayer::Network, "routes-v6"),
            EntityKey::new(OsiLayer::Application, "dns"),
        ];
        let configured = self
            .ping_targets
            .iter()
            .map(PingTargetConfig::key)
            .chain(self.tcp_checks.iter().map(TcpCheckConfig::key))
            .chain(self.http_checks.iter().map(HttpCheckConfig::key));

        let mut seen = HashSet::new();
        for key in configured {
            if built_in.contains(&key) {
                return Err(ConfigError::Validation(format!(
                    "entity '{key}' is reserved"
                )));
            }
            if !seen.insert(key.clone()) {
                return Err(ConfigError::Validation(format!(
                    "entity '{key}' is configured more than once"
                )));
            }
        }
        Ok(())
    }

    /// Entities whose DOWN transitions should raise an alert.
    pub fn alert_keys(&self) -> BTreeSet<EntityKey> {
        let mut keys: BTreeSet<EntityKey> = self
            .ping_targets
            .iter()
            .filter(|t| t.alert)
            .map(PingTargetConfig::key)
            .collect();
        keys.extend(self.tcp_checks.iter().filter(|c| c.alert).map(TcpCheckConfig::key));
        keys.extend(self.http_checks.iter().filter(|c| c.alert).map(HttpCheckConfig::key));
        if self.dns.enabled && self.dns.alert {
            keys.insert(EntityKey::new(OsiLayer::Application, "dns"));
        }
        keys
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

pub fn parse_depends_on(owner: &str, raw: &[String]) -> Result<Vec<EntityKey>, ConfigError> {
    raw.iter()
        .map(|s| {
            s.parse::<EntityKey>()
                .map_err(|err| ConfigError::Validation(format!("'{owner}' depends_on: {err}")))
        })
        .collect()
}

fn validate_probe(owner: &str, probe: &ProbeSettings) -> Result<(), ConfigError> {
    if probe.count == 0 {
        return Err(ConfigError::Validation(format!(
            "'{owner}' count must be > 0"
        )));
    }
    if probe.timeout_ms == 0 {
        return Err(ConfigError::Validation(format!(
            "'{owner}' timeout_ms must be > 0"
        )));
    }
    if probe.min_received_for_good == 0 || probe.min_received_for_good > probe.count {
        return Err(ConfigError::Validation(format!(
            "'{owner}' min_received_for_good must be in 1..={}",
            probe.count
        )));
    }
    validate_slow_threshold(owner, probe.slow_threshold_ms)
}

fn validate_slow_threshold(owner: &str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::Validation(format!(
            "'{owner}' slow_threshold_ms must be finite and > 0"
        )));
    }
    Ok(())
}

fn validate_name(kind: &str, name: &str, names: &mut HashSet<String>) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(ConfigError::Validation(format!(
            "{kind}[*].name must not be empty"
        )));
    }
    if name.contains(':') {
        return Err(ConfigError::Validation(format!(
            "{kind} name '{name}' must not contain ':'"
        )));
    }
    if !names.insert(name.to_string()) {
        return Err(ConfigError::Validation(format!(
            "{kind} name '{name}' must be unique"
        )));
    }
    Ok(())
}

fn validate_ping_targets(targets: &[PingTargetConfig]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for target in targets {
        validate_name("ping_targets", &target.name, &mut names)?;
        if target.address.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "ping_targets '{}' address must not be empty",
                target.name
            )));
        }
        validate_probe(&target.name, &target.probe)?;
        parse_depends_on(&target.name, &target.depends_on)?;
    }
    Ok(())
}

fn validate_tcp_checks(checks: &[TcpCheckConfig]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for check in checks {
        validate_name("tcp_checks", &check.name, &mut names)?;
        if check.host.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "tcp_checks '{}' host must not be empty",
                check.name
            )));
        }
        if check.port == 0 {
            return Err(ConfigError::Validation(format!(
                "tcp_checks '{}' port must be in 1..65535",
                check.name
            )));
        }
        if check.timeout_ms == 0 {
            return Err(ConfigError::Validation(format!(
                "tcp_checks '{}' timeout_ms must be > 0",
                check.name
            )));
        }
        validate_slow_threshold(&check.name, check.slow_threshold_ms)?;
        parse_depends_on(&check.name, &check.depends_on)?;
    }
    Ok(())
}

fn validate_http_checks(checks: &[HttpCheckConfig]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for check in checks {
        validate_name("http_checks", &check.name, &mut names)?;
        if check.timeout_ms == 0 {
            return Err(ConfigError::Validation(format!(
                "http_checks '{}' timeout_ms must be > 0",
                check.name
            )));
        }
        if check.url.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "http_checks '{}' url must not be empty",
                check.name
            )));
        }
        validate_slow_threshold(&check.name, check.slow_threshold_ms)?;
        parse_depends_on(&check.name, &check.depends_on)?;
    }
    Ok(())
}

fn validate_dns(cfg: &DnsConfig) -> Result<(), ConfigError> {
    if !cfg.enabled {
        return Ok(());
    }
    if cfg.timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "dns.timeout_ms must be > 0".to_string(),
        ));
    }
    if cfg.names.iter().any(|n| n.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "dns.names must not contain empty names".to_string(),
        ));
    }
    validate_probe("dns.resolver_probe", &cfg.resolver_probe)
}

fn validate_telegram(cfg: &TelegramConfig) -> Result<(), ConfigError> {
    if cfg.rate_limit_per_minute < 1 {
        return Err(ConfigError::Validation(
            "telegram.rate_limit_per_minute must be >= 1".to_string(),
        ));
    }
    Ok(())
}

const fn default_true() -> bool {
    true
}

const fn default_discovery_timeout_ms() -> u64 {
    15_000
}

fn default_ip_command() -> String {
    "ip".to_string()
}

fn default_ping_command() -> String {
    "ping".to_string()
}

const fn default_probe_count() -> u32 {
    4
}

const fn default_probe_timeout_ms() -> u64 {
    2_000
}

const fn default_min_received_for_good() -> u32 {
    2
}

const fn default_ping_slow_threshold_ms() -> f64 {
    200.0
}

const fn default_tcp_slow_threshold_ms() -> f64 {
    500.0
}

const fn default_http_slow_threshold_ms() -> f64 {
    1_000.0
}

const fn default_ping_layer() -> OsiLayer {
    OsiLayer::Network
}

const fn default_expected_status() -> u16 {
    200
}

fn default_resolv_conf() -> String {
    "/etc/resolv.conf".to_string()
}

fn default_bot_token_env() -> String {
    "TELEGRAM_BOT_TOKEN".to_string()
}

const fn default_rate_limit_per_minute() -> u32 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            listen: "127.0.0.1:9108".to_string(),
            interval_secs: 5,
            system_name: None,
            discovery_timeout_ms: 10_000,
            commands: CommandPaths::default(),
            links: LinksConfig::default(),
            routes: RoutesConfig::default(),
            ping_targets: vec![PingTargetConfig {
                name: "gateway".to_string(),
                address: "192.168.1.1".to_string(),
                layer: OsiLayer::Network,
                probe: ProbeSettings::default(),
                depends_on: vec!["network:routes-v4".to_string()],
                alert: true,
            }],
            tcp_checks: vec![],
            http_checks: vec![],
            dns: DnsConfig::default(),
            snapshots: SnapshotsConfig::default(),
            telegram: TelegramConfig::default(),
        }
    }

    #[test]
    fn example_config_parses_and_validates() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml()).expect("example parses");
        cfg.validate().expect("example validates");
        assert!(!cfg.ping_targets.is_empty());
    }

    #[test]
    fn valid_config_passes() {
        valid_config().validate().expect("valid config");
    }

    #[test]
    fn min_received_above_count_is_rejected() {
        let mut cfg = valid_config();
        cfg.ping_targets[0].probe.min_received_for_good = 9;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn non_finite_slow_threshold_is_rejected() {
        let mut cfg = valid_config();
        cfg.ping_targets[0].probe.slow_threshold_ms = f64::NAN;
        assert!(cfg.validate().is_err());
        cfg.ping_targets[0].probe.slow_threshold_ms = -1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn malformed_dependency_key_is_rejected() {
        let mut cfg = valid_config();
        cfg.ping_targets[0].depends_on = vec!["routes-v4".to_string()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut cfg = valid_config();
        let dup = cfg.ping_targets[0].clone();
        cfg.ping_targets.push(dup);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn colliding_entity_keys_are_rejected() {
        let mut cfg = valid_config();
        let mut db = cfg.ping_targets[0].clone();
        db.name = "db".to_string();
        db.layer = OsiLayer::Transport;
        cfg.ping_targets.push(db);
        cfg.tcp_checks = vec![TcpCheckConfig {
            name: "db".to_string(),
            host: "10.0.0.5".to_string(),
            port: 5432,
            timeout_ms: 1_000,
            slow_threshold_ms: 250.0,
            depends_on: Vec::new(),
            alert: false,
        }];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("transport:db"));

        cfg.tcp_checks[0].name = "postgres".to_string();
        cfg.validate().unwrap();
    }

    #[test]
    fn built_in_entity_ids_are_reserved() {
        for (layer, name) in [
            (OsiLayer::Network, "routes-v4"),
            (OsiLayer::Network, "routes-v6"),
            (OsiLayer::Application, "dns"),
        ] {
            let mut cfg = valid_config();
            cfg.ping_targets[0].name = name.to_string();
            cfg.ping_targets[0].layer = layer;
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("reserved"), "{name}: {err}");
        }

        let mut cfg = valid_config();
        cfg.ping_targets[0].name = "routes-v4".to_string();
        cfg.ping_targets[0].layer = OsiLayer::Transport;
        cfg.validate().unwrap();
    }

    #[test]
    fn flattened_probe_settings_use_defaults() {
        let yaml = r#"
listen: "127.0.0.1:9108"
interval_secs: 10
ping_targets:
  - name: upstream
    address: 1.1.1.1
    count: 5
    alert: true
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        cfg.validate().unwrap();
        let t = &cfg.ping_targets[0];
        assert_eq!(t.probe.count, 5);
        assert_eq!(t.probe.timeout_ms, 2_000);
        assert_eq!(t.layer, OsiLayer::Network);
        assert!(cfg
            .alert_keys()
            .contains(&EntityKey::new(OsiLayer::Network, "upstream")));
    }
}
