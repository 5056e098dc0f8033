use crate::entity::EntityMap;
use crate::severity::SeverityLevel;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub netmon_entity_severity_rank: GaugeVec,
    pub netmon_entities: GaugeVec,
    pub netmon_cycle_duration_seconds: Gauge,
    pub netmon_cycles_total: Counter,
    pub netmon_discover_errors_total: CounterVec,
    pub netmon_transitions_total: CounterVec,
    pub netmon_report_errors_total: CounterVec,
    pub netmon_nominal_drift_entries: Gauge,
    pub netmon_scrape_count_total: Counter,
    pub netmon_last_cycle_timestamp_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let netmon_entity_severity_rank = GaugeVec::new(
            opts!(
                "netmon_entity_severity_rank",
                "Current severity rank per entity (-1 unknown, 0 normal .. 7 down acknowledged)"
            ),
            &["layer", "id"],
        )?;
        let netmon_entities = GaugeVec::new(
            opts!("netmon_entities", "Number of entities per current severity"),
            &["severity"],
        )?;
        let netmon_cycle_duration_seconds = Gauge::with_opts(opts!(
            "netmon_cycle_duration_seconds",
            "Wall time of the last discovery cycle in seconds"
        ))?;
        let netmon_cycles_total = Counter::with_opts(opts!(
            "netmon_cycles_total",
            "Discovery cycles completed since start"
        ))?;
        let netmon_discover_errors_total = CounterVec::new(
            opts!(
                "netmon_discover_errors_total",
                "Discoverer failures by discoverer and kind (timeout, error, cancelled)"
            ),
            &["discoverer", "kind"],
        )?;
        let netmon_transitions_total = CounterVec::new(
            opts!(
                "netmon_transitions_total",
                "Severity transitions recorded, by the severity entered"
            ),
            &["severity"],
        )?;
        let netmon_report_errors_total = CounterVec::new(
            opts!(
                "netmon_report_errors_total",
                "Failed deliveries of transition reports by reporter"
            ),
            &["reporter"],
        )?;
        let netmon_nominal_drift_entries = Gauge::with_opts(opts!(
            "netmon_nominal_drift_entries",
            "Entries differing between the nominal and the last snapshot"
        ))?;
        let netmon_scrape_count_total = Counter::with_opts(opts!(
            "netmon_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let netmon_last_cycle_timestamp_seconds = Gauge::with_opts(opts!(
            "netmon_last_cycle_timestamp_seconds",
            "Unix timestamp of the last completed cycle"
        ))?;

        register(&registry, &netmon_entity_severity_rank)?;
        register(&registry, &netmon_entities)?;
        register(&registry, &netmon_cycle_duration_seconds)?;
        register(&registry, &netmon_cycles_total)?;
        register(&registry, &netmon_discover_errors_total)?;
        register(&registry, &netmon_transitions_total)?;
        register(&registry, &netmon_report_errors_total)?;
        register(&registry, &netmon_nominal_drift_entries)?;
        register(&registry, &netmon_scrape_count_total)?;
        register(&registry, &netmon_last_cycle_timestamp_seconds)?;

        Ok(Arc::new(Self {
            registry,
            netmon_entity_severity_rank,
            netmon_entities,
            netmon_cycle_duration_seconds,
            netmon_cycles_total,
            netmon_discover_errors_total,
            netmon_transitions_total,
            netmon_report_errors_total,
            netmon_nominal_drift_entries,
            netmon_scrape_count_total,
            netmon_last_cycle_timestamp_seconds,
        }))
    }

    pub fn update_from_entities(&self, entities: &EntityMap) {
        self.netmon_entity_severity_rank.reset();
        for level in SeverityLevel::ALL {
            self.netmon_entities
                .with_label_values(&[level.as_str()])
                .set(0.0);
        }

        for entity in entities.values() {
            let level = entity.current_severity();
            self.netmon_entity_severity_rank
                .with_label_values(&[entity.layer().as_str(), entity.id()])
                .set(f64::from(level.rank()));
            self.netmon_entities
                .with_label_values(&[level.as_str()])
                .inc();
        }
    }

    pub fn observe_cycle(&self, elapsed: Duration, finished_at_unix_ms: i64, drift_entries: usize) {
        self.netmon_cycles_total.inc();
        self.netmon_cycle_duration_seconds.set(elapsed.as_secs_f64());
        self.netmon_last_cycle_timestamp_seconds
            .set(finished_at_unix_ms as f64 / 1000.0);
        self.netmon_nominal_drift_entries.set(drift_entries as f64);
    }

    pub fn inc_transition(&self, level: SeverityLevel) {
        self.netmon_transitions_total
            .with_label_values(&[level.as_str()])
            .inc();
    }

    pub fn inc_discover_error(&self, discoverer: &str, kind: &str) {
        self.netmon_discover_errors_total
            .with_label_values(&[discoverer, kind])
            .inc();
    }

    pub fn inc_report_error(&self, reporter: &str) {
        self.netmon_report_errors_total
            .with_label_values(&[reporter])
            .inc();
    }

    pub fn inc_scrape_count(&self) {
        self.netmon_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, EntityKey, OsiLayer};

    #[test]
    fn entity_gauges_follow_current_severity() {
        let metrics = Metrics::new().unwrap();
        let mut entities = EntityMap::new();
        for (id, level) in [("eth0", SeverityLevel::Down), ("wlan0", SeverityLevel::Normal)] {
            let key = EntityKey::new(OsiLayer::Physical, id);
            let mut e = Entity::new(key.clone());
            e.record_observation_at(1, level, "");
            entities.insert(key, e);
        }
        metrics.update_from_entities(&entities);

        assert_eq!(
            metrics
                .netmon_entity_severity_rank
                .with_label_values(&["physical", "eth0"])
                .get(),
            f64::from(SeverityLevel::Down.rank())
        );
        assert_eq!(metrics.netmon_entities.with_label_values(&["DOWN"]).get(), 1.0);
        assert_eq!(metrics.netmon_entities.with_label_values(&["SLOW"]).get(), 0.0);

        entities.clear();
        metrics.update_from_entities(&entities);
        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(!text.contains("id=\"eth0\""));
    }

    #[test]
    fn cycle_counters_are_encoded() {
        let metrics = Metrics::new().unwrap();
        metrics.observe_cycle(Duration::from_millis(1500), 1_700_000_000_000, 3);
        metrics.inc_discover_error("ping", "timeout");
        metrics.inc_transition(SeverityLevel::Down);
        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("netmon_cycles_total 1"));
        assert!(text.contains("netmon_cycle_duration_seconds 1.5"));
        assert!(text.contains("netmon_nominal_drift_entries 3"));
        assert!(text.contains("netmon_discover_errors_total{discoverer=\"ping\",kind=\"timeout\"} 1"));
    }
}
