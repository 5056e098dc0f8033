//! The discovery cycle: run every discoverer, fold the results into the
//! entity map, propagate dependency state, snapshot and report.

use crate::discovery::{Discoverer, EntityRecord};
use crate::entity::{now_unix_ms, Entity, EntityKey, EntityMap};
use crate::graph::DependencyGraph;
use crate::metrics::Metrics;
use crate::persist::SnapshotStore;
use crate::report::{Reporter, TransitionReport};
use crate::severity::{worse_of, SeverityLevel};
use crate::snapshot::{self, Snapshot, SnapshotDiff};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::task::{self, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct MonitorState {
    pub system_name: String,
    pub started_at_unix_ms: i64,
    pub cycles: u64,
    pub entities: EntityMap,
    pub graph: DependencyGraph,
    /// Keys each discoverer reported on its last successful pass.
    pub owners: BTreeMap<String, BTreeSet<EntityKey>>,
    /// Entities no discoverer reports any more. They keep their history and
    /// edges but are left out of snapshots.
    pub vanished: BTreeSet<EntityKey>,
    pub nominal: Option<Snapshot>,
    pub last_snapshot: Option<Snapshot>,
    pub last_diff: Option<SnapshotDiff>,
}

impl MonitorState {
    pub fn new(system_name: impl Into<String>, started_at_unix_ms: i64) -> Self {
        Self {
            system_name: system_name.into(),
            started_at_unix_ms,
            cycles: 0,
            entities: EntityMap::new(),
            graph: DependencyGraph::new(),
            owners: BTreeMap::new(),
            vanished: BTreeSet::new(),
            nominal: None,
            last_snapshot: None,
            last_diff: None,
        }
    }

    pub fn with_nominal(mut self, nominal: Option<Snapshot>) -> Self {
        self.nominal = nominal;
        self
    }

    fn apply_records(&mut self, discoverer: &str, records: Vec<EntityRecord>) {
        let keys: BTreeSet<EntityKey> = records.iter().map(|r| r.key.clone()).collect();
        if let Some(previous) = self.owners.get(discoverer) {
            for gone in previous.difference(&keys) {
                let reported_elsewhere = self
                    .owners
                    .iter()
                    .any(|(name, owned)| name != discoverer && owned.contains(gone));
                if reported_elsewhere {
                    continue;
                }
                debug!(discoverer, entity = %gone, "entity no longer reported");
                if let Some(entity) = self.entities.get_mut(gone) {
                    entity.observe(SeverityLevel::Down, "no longer reported");
                }
                self.vanished.insert(gone.clone());
            }
        }

        for record in records {
            self.vanished.remove(&record.key);
            let entity = self
                .entities
                .entry(record.key.clone())
                .or_insert_with(|| Entity::new(record.key.clone()));
            match entity.set_attributes(record.attributes) {
                Some(drift) => {
                    info!(entity = %record.key, drift = %drift, "entity identity changed");
                    let note = if record.annotation.is_empty() {
                        drift
                    } else {
                        format!("{drift}; {}", record.annotation)
                    };
                    entity.observe(worse_of(record.severity, SeverityLevel::Changed), note);
                }
                None => entity.observe(record.severity, record.annotation),
            }

            self.graph.clear_dependencies(&record.key);
            for dep in &record.depends_on {
                if let Err(err) = self.graph.add_dependency(&record.key, dep) {
                    warn!(discoverer, error = %err, "dependency refused");
                }
            }
        }
        self.owners.insert(discoverer.to_string(), keys);
    }

    /// Marks everything `discoverer` owns with `level`; used when a pass
    /// produced no records.
    fn mark_owned(&mut self, discoverer: &str, level: SeverityLevel, annotation: &str) {
        let Some(keys) = self.owners.get(discoverer) else {
            return;
        };
        for key in keys {
            if let Some(entity) = self.entities.get_mut(key) {
                entity.observe(level, annotation);
            }
        }
    }
}

#[derive(Debug)]
enum PassOutcome {
    Records(Vec<EntityRecord>),
    TimedOut(Duration),
    Failed(String),
    Cancelled,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub transitions: Vec<TransitionReport>,
    pub discover_errors: usize,
    pub cancelled: bool,
    pub nominal_diff: Option<SnapshotDiff>,
}

pub struct Monitor {
    state: Arc<RwLock<MonitorState>>,
    discoverers: Vec<Arc<dyn Discoverer>>,
    reporters: Vec<Arc<dyn Reporter>>,
    metrics: Arc<Metrics>,
    discovery_timeout: Duration,
    alert_keys: BTreeSet<EntityKey>,
    current_store: Option<Arc<dyn SnapshotStore>>,
}

impl Monitor {
    pub fn new(
        state: Arc<RwLock<MonitorState>>,
        discoverers: Vec<Arc<dyn Discoverer>>,
        metrics: Arc<Metrics>,
        discovery_timeout: Duration,
    ) -> Self {
        Self {
            state,
            discoverers,
            reporters: Vec::new(),
            metrics,
            discovery_timeout,
            alert_keys: BTreeSet::new(),
            current_store: None,
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    pub fn with_alert_keys(mut self, keys: BTreeSet<EntityKey>) -> Self {
        self.alert_keys = keys;
        self
    }

    /// Saves every cycle's snapshot to `store`.
    pub fn with_current_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.current_store = Some(store);
        self
    }

    pub fn state(&self) -> Arc<RwLock<MonitorState>> {
        self.state.clone()
    }

    /// Runs cycles every `interval` until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("shutdown signal received, stopping discovery loop");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.run_cycle(&mut shutdown).await;
                    if report.cancelled {
                        break;
                    }
                }
            }
        }
    }

    pub async fn run_cycle(&self, shutdown: &mut watch::Receiver<bool>) -> CycleReport {
        let started = Instant::now();
        let outcomes = self.discover_all(shutdown).await;
        let cancelled = outcomes
            .iter()
            .any(|(_, outcome)| matches!(outcome, PassOutcome::Cancelled));

        let mut discover_errors = 0;
        let now = now_unix_ms();
        let (transitions, snapshot, nominal_diff, entity_count) = {
            let mut state = self.state.write().await;
            let before: BTreeMap<EntityKey, SeverityLevel> = state
                .entities
                .iter()
                .map(|(k, e)| (k.clone(), e.current_severity()))
                .collect();

            for (name, outcome) in outcomes {
                let failure = match outcome {
                    PassOutcome::Records(records) => {
                        state.apply_records(&name, records);
                        None
                    }
                    PassOutcome::TimedOut(after) => {
                        warn!(discoverer = %name, after = ?after, "discoverer timed out");
                        state.mark_owned(&name, SeverityLevel::Down, "probe timeout");
                        Some("timeout")
                    }
                    PassOutcome::Failed(reason) => {
                        warn!(discoverer = %name, error = %reason, "discoverer failed");
                        state.mark_owned(&name, SeverityLevel::Unknown, &reason);
                        Some("error")
                    }
                    PassOutcome::Cancelled => {
                        state.mark_owned(&name, SeverityLevel::Unknown, "cancelled");
                        Some("cancelled")
                    }
                };
                if let Some(kind) = failure {
                    discover_errors += 1;
                    self.metrics.inc_discover_error(&name, kind);
                }
            }

            let MonitorState {
                entities, graph, ..
            } = &mut *state;
            let changed = graph.recompute_all(entities, now);

            let transitions: Vec<TransitionReport> = changed
                .iter()
                .filter_map(|key| {
                    let entity = state.entities.get(key)?;
                    let last = entity.last_transition()?;
                    Some(TransitionReport {
                        key: key.clone(),
                        severity: last.severity,
                        previous: before.get(key).copied().unwrap_or(SeverityLevel::Unknown),
                        annotation: last.annotation.clone(),
                        at_unix_ms: last.at_unix_ms,
                        alert: self.alert_keys.contains(key),
                    })
                })
                .collect();

            let snap = snapshot::capture(
                &state.system_name,
                state
                    .entities
                    .values()
                    .filter(|e| !state.vanished.contains(e.key())),
                now,
            );
            let nominal_diff = state.nominal.as_ref().map(|n| snapshot::diff(n, &snap));
            state.cycles += 1;
            state.last_snapshot = Some(snap.clone());
            state.last_diff = nominal_diff.clone();
            self.metrics.update_from_entities(&state.entities);
            (transitions, snap, nominal_diff, state.entities.len())
        };

        for t in &transitions {
            self.metrics.inc_transition(t.severity);
        }
        let drift = nominal_diff.as_ref().map_or(0, SnapshotDiff::len);
        self.metrics
            .observe_cycle(started.elapsed(), now_unix_ms(), drift);
        debug!(
            entities = entity_count,
            transitions = transitions.len(),
            drift,
            elapsed = %humantime::format_duration(Duration::from_millis(started.elapsed().as_millis() as u64)),
            "cycle complete"
        );

        if !transitions.is_empty() {
            for reporter in &self.reporters {
                if let Err(err) = reporter.report(&transitions).await {
                    warn!(reporter = reporter.name(), error = %err, "reporter failed");
                    self.metrics.inc_report_error(reporter.name());
                }
            }
        }

        if let Some(store) = &self.current_store {
            let store = store.clone();
            match task::spawn_blocking(move || store.save(&snapshot)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "failed to persist current snapshot"),
                Err(err) => warn!(error = %err, "snapshot persist task failed"),
            }
        }

        CycleReport {
            transitions,
            discover_errors,
            cancelled,
            nominal_diff,
        }
    }

    async fn discover_all(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Vec<(String, PassOutcome)> {
        let names: Vec<String> = self.discoverers.iter().map(|d| d.name().to_string()).collect();
        if *shutdown.borrow() {
            return names.into_iter().map(|n| (n, PassOutcome::Cancelled)).collect();
        }

        let mut set = JoinSet::new();
        for discoverer in &self.discoverers {
            let discoverer = discoverer.clone();
            let budget = self.discovery_timeout;
            set.spawn(async move {
                let name = discoverer.name().to_string();
                let outcome = match time::timeout(budget, discoverer.discover()).await {
                    Ok(Ok(records)) => PassOutcome::Records(records),
                    Ok(Err(err)) => PassOutcome::Failed(err.to_string()),
                    Err(_) => PassOutcome::TimedOut(budget),
                };
                (name, outcome)
            });
        }

        let mut finished: BTreeMap<String, PassOutcome> = BTreeMap::new();
        let mut cancelled = false;
        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    Some(Ok((name, outcome))) => {
                        finished.insert(name, outcome);
                    }
                    Some(Err(err)) => warn!(error = %err, "discoverer task failed"),
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        cancelled = true;
                        set.abort_all();
                        break;
                    }
                }
            }
        }

        names
            .into_iter()
            .map(|name| {
                let outcome = finished.remove(&name).unwrap_or_else(|| {
                    if cancelled {
                        PassOutcome::Cancelled
                    } else {
                        PassOutcome::Failed("discoverer task failed".to_string())
                    }
                });
                (name, outcome)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{InterfaceAttrs, LayerAttributes, OsiLayer};
    use crate::error::MonitorError;
    use crate::persist::JsonSnapshotFile;
    use crate::report::ReportError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replays one scripted batch of records per call; the last batch repeats.
    struct Scripted {
        name: &'static str,
        batches: Mutex<Vec<Result<Vec<EntityRecord>, String>>>,
        hang: bool,
    }

    impl Scripted {
        fn new(name: &'static str, batches: Vec<Result<Vec<EntityRecord>, String>>) -> Self {
            Self {
                name,
                batches: Mutex::new(batches),
                hang: false,
            }
        }

        fn hanging(name: &'static str) -> Self {
            Self {
                name,
                batches: Mutex::new(Vec::new()),
                hang: true,
            }
        }
    }

    #[async_trait]
    impl Discoverer for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn discover(&self) -> Result<Vec<EntityRecord>, MonitorError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            let next = {
                let mut batches = self.batches.lock().unwrap();
                if batches.len() > 1 {
                    batches.remove(0)
                } else {
                    batches[0].clone()
                }
            };
            next.map_err(|reason| MonitorError::parse(self.name, reason))
        }
    }

    #[derive(Default)]
    struct Collecting {
        seen: tokio::sync::Mutex<Vec<TransitionReport>>,
    }

    #[async_trait]
    impl Reporter for Collecting {
        fn name(&self) -> &str {
            "collecting"
        }

        async fn report(&self, reports: &[TransitionReport]) -> Result<(), ReportError> {
            self.seen.lock().await.extend_from_slice(reports);
            Ok(())
        }
    }

    fn key(layer: OsiLayer, id: &str) -> EntityKey {
        EntityKey::new(layer, id)
    }

    fn rec(layer: OsiLayer, id: &str, level: SeverityLevel, deps: &[EntityKey]) -> EntityRecord {
        EntityRecord::new(key(layer, id), level, format!("{id} observed"))
            .depends_on(deps.iter().cloned())
    }

    fn topology(physical: SeverityLevel) -> Vec<EntityRecord> {
        let phys = key(OsiLayer::Physical, "eth0");
        let link = key(OsiLayer::Datalink, "eth0");
        let routes = key(OsiLayer::Network, "routes-v4");
        vec![
            rec(OsiLayer::Physical, "eth0", physical, &[]),
            rec(OsiLayer::Datalink, "eth0", SeverityLevel::Normal, &[phys]),
            rec(OsiLayer::Network, "routes-v4", SeverityLevel::Normal, &[link]),
            rec(OsiLayer::Network, "gateway", SeverityLevel::Normal, &[routes]),
        ]
    }

    fn monitor(discoverers: Vec<Arc<dyn Discoverer>>, timeout: Duration) -> Monitor {
        let state = Arc::new(RwLock::new(MonitorState::new("host-a", 0)));
        Monitor::new(state, discoverers, Metrics::new().unwrap(), timeout)
    }

    async fn severity(m: &Monitor, k: &EntityKey) -> SeverityLevel {
        m.state.read().await.entities[k].current_severity()
    }

    #[tokio::test]
    async fn carrier_loss_propagates_and_recovers() {
        let links = Scripted::new(
            "links",
            vec![
                Ok(topology(SeverityLevel::Normal)),
                Ok(topology(SeverityLevel::Down)),
                Ok(topology(SeverityLevel::Normal)),
            ],
        );
        let reporter = Arc::new(Collecting::default());
        let gateway = key(OsiLayer::Network, "gateway");
        let m = monitor(vec![Arc::new(links)], Duration::from_secs(5))
            .with_reporter(reporter.clone())
            .with_alert_keys([gateway.clone()].into_iter().collect());
        let (_tx, mut rx) = watch::channel(false);

        let first = m.run_cycle(&mut rx).await;
        assert_eq!(first.transitions.len(), 4);
        assert_eq!(severity(&m, &gateway).await, SeverityLevel::Normal);

        let second = m.run_cycle(&mut rx).await;
        assert_eq!(severity(&m, &key(OsiLayer::Physical, "eth0")).await, SeverityLevel::Down);
        assert_eq!(severity(&m, &gateway).await, SeverityLevel::DownDependency);
        let gw = second
            .transitions
            .iter()
            .find(|t| t.key == gateway)
            .expect("gateway transition");
        assert!(gw.alert);
        assert_eq!(gw.previous, SeverityLevel::Normal);

        m.run_cycle(&mut rx).await;
        assert_eq!(severity(&m, &gateway).await, SeverityLevel::Normal);
        let state = m.state.read().await;
        let hist: Vec<SeverityLevel> = state.entities[&gateway]
            .history()
            .iter()
            .map(|t| t.severity)
            .collect();
        assert_eq!(
            hist,
            vec![SeverityLevel::Normal, SeverityLevel::DownDependency, SeverityLevel::Normal]
        );
        assert_eq!(state.cycles, 3);
        assert_eq!(reporter.seen.lock().await.len(), 4 + 4 + 4);
    }

    #[tokio::test]
    async fn steady_state_produces_no_transitions() {
        let m = monitor(
            vec![Arc::new(Scripted::new("links", vec![Ok(topology(SeverityLevel::Normal))]))],
            Duration::from_secs(5),
        );
        let (_tx, mut rx) = watch::channel(false);
        m.run_cycle(&mut rx).await;
        let again = m.run_cycle(&mut rx).await;
        assert!(again.transitions.is_empty());
        assert_eq!(again.discover_errors, 0);
    }

    #[tokio::test]
    async fn failing_discoverer_marks_owned_entities_unknown() {
        let m = monitor(
            vec![Arc::new(Scripted::new(
                "links",
                vec![Ok(topology(SeverityLevel::Normal)), Err("boom".to_string())],
            ))],
            Duration::from_secs(5),
        );
        let (_tx, mut rx) = watch::channel(false);
        m.run_cycle(&mut rx).await;
        let report = m.run_cycle(&mut rx).await;
        assert_eq!(report.discover_errors, 1);
        let phys = key(OsiLayer::Physical, "eth0");
        assert_eq!(severity(&m, &phys).await, SeverityLevel::Unknown);
        let state = m.state.read().await;
        assert!(state.entities[&phys]
            .last_transition()
            .unwrap()
            .annotation
            .contains("boom"));
    }

    #[tokio::test]
    async fn timeout_marks_owned_entities_down() {
        let fast = Scripted::new("ping", vec![Ok(vec![rec(
            OsiLayer::Network,
            "gateway",
            SeverityLevel::Normal,
            &[],
        )])]);
        let m = monitor(vec![Arc::new(fast)], Duration::from_millis(200));
        let (_tx, mut rx) = watch::channel(false);
        m.run_cycle(&mut rx).await;

        // Same owner name, now hanging past the budget.
        let state = m.state();
        let m = Monitor::new(
            state,
            vec![Arc::new(Scripted::hanging("ping"))],
            Metrics::new().unwrap(),
            Duration::from_millis(50),
        );
        let report = m.run_cycle(&mut rx).await;
        assert_eq!(report.discover_errors, 1);
        let gw = key(OsiLayer::Network, "gateway");
        assert_eq!(severity(&m, &gw).await, SeverityLevel::Down);
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_discovery() {
        let m = monitor(
            vec![Arc::new(Scripted::hanging("slow"))],
            Duration::from_secs(60),
        );
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
        });
        let report = time::timeout(Duration::from_secs(5), m.run_cycle(&mut rx))
            .await
            .expect("cycle returns after shutdown");
        assert!(report.cancelled);
        assert_eq!(report.discover_errors, 1);
    }

    #[tokio::test]
    async fn identity_drift_reports_changed() {
        let iface = |mac: &str| {
            LayerAttributes::Interface(InterfaceAttrs {
                operstate: "UP".to_string(),
                mac: Some(mac.to_string()),
                rx_bytes: 0,
                tx_bytes: 0,
                rx_errors: 0,
                tx_errors: 0,
                rx_dropped: 0,
                tx_dropped: 0,
            })
        };
        let batch = |mac: &str| {
            Ok(vec![rec(OsiLayer::Datalink, "eth0", SeverityLevel::Normal, &[])
                .with_attributes(iface(mac))])
        };
        let m = monitor(
            vec![Arc::new(Scripted::new(
                "links",
                vec![batch("aa:aa:aa:aa:aa:aa"), batch("bb:bb:bb:bb:bb:bb")],
            ))],
            Duration::from_secs(5),
        );
        let (_tx, mut rx) = watch::channel(false);
        m.run_cycle(&mut rx).await;
        let report = m.run_cycle(&mut rx).await;
        assert_eq!(report.transitions.len(), 1);
        assert_eq!(report.transitions[0].severity, SeverityLevel::Changed);
        assert!(report.transitions[0].annotation.starts_with("mac "));
    }

    #[tokio::test]
    async fn current_snapshot_is_persisted_each_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonSnapshotFile::new(dir.path().join("current.json")));
        let m = monitor(
            vec![Arc::new(Scripted::new("links", vec![Ok(topology(SeverityLevel::Down))]))],
            Duration::from_secs(5),
        )
        .with_current_store(store.clone());
        let (_tx, mut rx) = watch::channel(false);
        m.run_cycle(&mut rx).await;

        let saved = store.load().unwrap().expect("snapshot written");
        assert_eq!(Some(&saved), m.state.read().await.last_snapshot.as_ref());
        assert_eq!(
            saved.severity_of(&key(OsiLayer::Network, "gateway")),
            Some(SeverityLevel::DownDependency)
        );
    }

    #[tokio::test]
    async fn vanished_entities_are_kept_down_and_diffed_against_nominal() {
        let full = topology(SeverityLevel::Normal);
        let mut partial = topology(SeverityLevel::Normal);
        partial.pop();
        let m = monitor(
            vec![Arc::new(Scripted::new(
                "links",
                vec![Ok(full.clone()), Ok(partial), Ok(full)],
            ))],
            Duration::from_secs(5),
        );
        let (_tx, mut rx) = watch::channel(false);
        m.run_cycle(&mut rx).await;
        {
            let mut state = m.state.write().await;
            state.nominal = state.last_snapshot.clone();
        }
        let gateway = key(OsiLayer::Network, "gateway");
        let report = m.run_cycle(&mut rx).await;
        let diff = report.nominal_diff.expect("nominal configured");
        assert_eq!(
            diff.removed.into_iter().collect::<Vec<_>>(),
            vec![gateway.clone()]
        );
        {
            let state = m.state.read().await;
            let gw = &state.entities[&gateway];
            assert_eq!(gw.current_severity(), SeverityLevel::Down);
            assert_eq!(gw.last_transition().unwrap().annotation, "no longer reported");
            assert_eq!(gw.history().len(), 2);
            assert!(state.graph.has_dependency(&gateway, &key(OsiLayer::Network, "routes-v4")));
            assert!(!state.last_snapshot.as_ref().unwrap().entries.contains_key(&gateway));
        }

        let back = m.run_cycle(&mut rx).await;
        assert!(back.nominal_diff.expect("nominal configured").is_empty());
        assert_eq!(severity(&m, &gateway).await, SeverityLevel::Normal);
        assert!(m.state.read().await.vanished.is_empty());
    }

    #[tokio::test]
    async fn vanished_interface_pulls_dependents_down() {
        let full = topology(SeverityLevel::Normal);
        let upper = full[2..].to_vec();
        let m = monitor(
            vec![Arc::new(Scripted::new("links", vec![Ok(full), Ok(upper)]))],
            Duration::from_secs(5),
        );
        let (_tx, mut rx) = watch::channel(false);
        m.run_cycle(&mut rx).await;
        m.run_cycle(&mut rx).await;

        let phys = key(OsiLayer::Physical, "eth0");
        let link = key(OsiLayer::Datalink, "eth0");
        let gateway = key(OsiLayer::Network, "gateway");
        assert_eq!(severity(&m, &phys).await, SeverityLevel::Down);
        assert_eq!(severity(&m, &link).await, SeverityLevel::Down);
        assert_eq!(
            severity(&m, &key(OsiLayer::Network, "routes-v4")).await,
            SeverityLevel::DownDependency
        );
        assert_eq!(severity(&m, &gateway).await, SeverityLevel::DownDependency);
        let state = m.state.read().await;
        assert_eq!(state.vanished, [link, phys].into_iter().collect::<BTreeSet<_>>());
    }
}
