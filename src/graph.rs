use crate::entity::{EntityKey, EntityMap};
use crate::error::MonitorError;
use crate::severity::{escalate_for_dependency, worse_of, SeverityLevel};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

/// Acyclic "depends on" relation between entities. Edges point from the
/// dependent to its dependency.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DependencyGraph {
    edges: BTreeMap<EntityKey, BTreeSet<EntityKey>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `dependent -> dependency`. Refuses, leaving the graph untouched,
    /// if the edge would close a cycle. Returns whether the edge is new.
    pub fn add_dependency(
        &mut self,
        dependent: &EntityKey,
        dependency: &EntityKey,
    ) -> Result<bool, MonitorError> {
        if dependent == dependency || self.reaches(dependency, dependent) {
            return Err(MonitorError::CycleDetected {
                dependent: dependent.clone(),
                dependency: dependency.clone(),
            });
        }
        Ok(self
            .edges
            .entry(dependent.clone())
            .or_default()
            .insert(dependency.clone()))
    }

    /// Drops every outgoing edge of `dependent`; returns how many were removed.
    pub fn clear_dependencies(&mut self, dependent: &EntityKey) -> usize {
        self.edges.remove(dependent).map_or(0, |deps| deps.len())
    }

    pub fn dependencies_of(&self, key: &EntityKey) -> impl Iterator<Item = &EntityKey> {
        self.edges.get(key).into_iter().flatten()
    }

    pub fn has_dependency(&self, dependent: &EntityKey, dependency: &EntityKey) -> bool {
        self.edges
            .get(dependent)
            .is_some_and(|deps| deps.contains(dependency))
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum()
    }

    fn reaches(&self, from: &EntityKey, to: &EntityKey) -> bool {
        let mut seen = BTreeSet::new();
        let mut stack = vec![from];
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if !seen.insert(node) {
                continue;
            }
            stack.extend(self.dependencies_of(node));
        }
        false
    }

    /// Severity `key` should report given its own observation and the
    /// current state of its direct dependencies.
    pub fn recompute_derived(&self, entities: &EntityMap, key: &EntityKey) -> SeverityLevel {
        self.derive(entities, key).0
    }

    fn derive<'a>(
        &'a self,
        entities: &EntityMap,
        key: &EntityKey,
    ) -> (SeverityLevel, Option<(&'a EntityKey, SeverityLevel)>) {
        let own = entities
            .get(key)
            .map(|e| e.observed_severity())
            .unwrap_or(SeverityLevel::Unknown);

        let mut worst: Option<(&EntityKey, SeverityLevel)> = None;
        for dep in self.dependencies_of(key) {
            // Never-seen dependencies count as unknown.
            let level = entities
                .get(dep)
                .map_or(SeverityLevel::Unknown, |e| e.current_severity());
            let current = worst.map(|(_, l)| l).unwrap_or(SeverityLevel::Unknown);
            if worse_of(current, level) != current || worst.is_none() {
                worst = Some((dep, level));
            }
        }

        let dependency = worst.map(|(_, l)| l).unwrap_or(SeverityLevel::Unknown);
        (escalate_for_dependency(own, dependency), worst)
    }

    /// Dependencies before dependents. Includes every entity and every
    /// graph node; ties are broken by key order.
    pub fn topological_order(&self, entities: &EntityMap) -> Vec<EntityKey> {
        let mut nodes: BTreeSet<&EntityKey> = entities.keys().collect();
        for (dependent, deps) in &self.edges {
            nodes.insert(dependent);
            nodes.extend(deps);
        }

        let mut pending: BTreeMap<&EntityKey, usize> = nodes
            .iter()
            .map(|k| (*k, self.edges.get(*k).map_or(0, BTreeSet::len)))
            .collect();
        let mut dependents: BTreeMap<&EntityKey, Vec<&EntityKey>> = BTreeMap::new();
        for (dependent, deps) in &self.edges {
            for dep in deps {
                dependents.entry(dep).or_default().push(dependent);
            }
        }

        let mut ready: VecDeque<&EntityKey> = pending
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut order = Vec::with_capacity(nodes.len());
        while let Some(key) = ready.pop_front() {
            order.push(key.clone());
            for dependent in dependents.get(key).into_iter().flatten() {
                if let Some(n) = pending.get_mut(dependent) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push_back(*dependent);
                    }
                }
            }
        }
        order
    }

    /// One propagation pass over every entity, in dependency order, so each
    /// dependent sees its dependencies' freshly derived state. Returns the
    /// keys whose history grew.
    pub fn recompute_all(&self, entities: &mut EntityMap, at_unix_ms: i64) -> Vec<EntityKey> {
        let mut changed = Vec::new();
        for key in self.topological_order(entities) {
            let (level, cause) = self.derive(entities, &key);
            let Some(entity) = entities.get_mut(&key) else {
                debug!(entity = %key, "dependency has no entity yet");
                continue;
            };

            let own = entity.observed_severity();
            let annotation = match cause {
                Some((dep, dep_level)) if level != own => {
                    let note = entity.observed_annotation();
                    if note.is_empty() {
                        format!("{dep} is {dep_level}")
                    } else {
                        format!("{note}; {dep} is {dep_level}")
                    }
                }
                _ => entity.observed_annotation().to_string(),
            };
            if entity.record_derived_at(at_unix_ms, level, annotation) {
                changed.push(key);
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, OsiLayer};
    use SeverityLevel::*;

    fn key(layer: OsiLayer, id: &str) -> EntityKey {
        EntityKey::new(layer, id)
    }

    fn chain() -> (DependencyGraph, EntityMap, [EntityKey; 3]) {
        let a = key(OsiLayer::Physical, "eth0");
        let b = key(OsiLayer::Datalink, "eth0");
        let c = key(OsiLayer::Network, "routes-v4");
        let mut graph = DependencyGraph::new();
        graph.add_dependency(&b, &a).unwrap();
        graph.add_dependency(&c, &b).unwrap();

        let mut entities = EntityMap::new();
        for k in [&a, &b, &c] {
            let mut e = Entity::new(k.clone());
            e.record_observation_at(0, Normal, "ok");
            entities.insert(k.clone(), e);
        }
        (graph, entities, [a, b, c])
    }

    #[test]
    fn down_propagates_as_dependency_failure() {
        let (graph, mut entities, [a, b, c]) = chain();
        entities.get_mut(&a).unwrap().record_observation_at(10, Down, "no carrier");
        let changed = graph.recompute_all(&mut entities, 10);

        assert_eq!(entities[&a].current_severity(), Down);
        assert_eq!(entities[&b].current_severity(), DownDependency);
        assert_eq!(entities[&c].current_severity(), DownDependency);
        assert_eq!(changed, vec![b.clone(), c.clone()]);
        assert_eq!(
            entities[&b].last_transition().unwrap().annotation,
            "ok; physical:eth0 is DOWN"
        );
    }

    #[test]
    fn recovery_clears_dependency_state() {
        let (graph, mut entities, [a, b, c]) = chain();
        entities.get_mut(&a).unwrap().record_observation_at(10, Down, "no carrier");
        graph.recompute_all(&mut entities, 10);
        entities.get_mut(&a).unwrap().record_observation_at(20, Normal, "carrier");
        graph.recompute_all(&mut entities, 20);

        for k in [&a, &b, &c] {
            assert_eq!(entities[k].current_severity(), Normal);
        }
        let b_hist: Vec<_> = entities[&b].history().iter().map(|t| t.severity).collect();
        assert_eq!(b_hist, vec![Normal, DownDependency, Normal]);
    }

    #[test]
    fn repeated_passes_are_stable() {
        let (graph, mut entities, [a, ..]) = chain();
        entities.get_mut(&a).unwrap().record_observation_at(10, Down, "x");
        graph.recompute_all(&mut entities, 10);
        let before = entities.clone();
        assert!(graph.recompute_all(&mut entities, 11).is_empty());
        assert_eq!(before, entities);
    }

    #[test]
    fn cycle_is_refused_without_partial_insert() {
        let (mut graph, _, [a, b, c]) = chain();
        let edges = graph.edge_count();
        let err = graph.add_dependency(&a, &c).unwrap_err();
        assert!(matches!(err, MonitorError::CycleDetected { .. }));
        assert_eq!(graph.edge_count(), edges);
        assert!(!graph.has_dependency(&a, &c));
        assert!(graph.add_dependency(&b, &b).is_err());
    }

    #[test]
    fn cleared_edges_allow_reversal() {
        let (mut graph, _, [a, b, _]) = chain();
        assert_eq!(graph.clear_dependencies(&b), 1);
        assert!(graph.add_dependency(&a, &b).unwrap());
    }

    #[test]
    fn duplicate_edge_is_not_new() {
        let (mut graph, _, [a, b, _]) = chain();
        assert!(!graph.add_dependency(&b, &a).unwrap());
    }

    #[test]
    fn derived_uses_worst_dependency() {
        let dns = key(OsiLayer::Application, "dns");
        let r1 = key(OsiLayer::Network, "resolver:10.0.0.53");
        let r2 = key(OsiLayer::Network, "resolver:10.0.1.53");
        let mut graph = DependencyGraph::new();
        graph.add_dependency(&dns, &r1).unwrap();
        graph.add_dependency(&dns, &r2).unwrap();

        let mut entities = EntityMap::new();
        let mut e = Entity::new(dns.clone());
        e.record_observation_at(0, Normal, "");
        entities.insert(dns.clone(), e);
        let mut e = Entity::new(r1.clone());
        e.record_observation_at(0, Slow, "");
        entities.insert(r1, e);
        let mut e = Entity::new(r2.clone());
        e.record_observation_at(0, Down, "");
        entities.insert(r2, e);

        assert_eq!(graph.recompute_derived(&entities, &dns), DownDependency);
    }

    #[test]
    fn topological_order_puts_dependencies_first() {
        let (graph, entities, [a, b, c]) = chain();
        let order = graph.topological_order(&entities);
        let pos = |k: &EntityKey| order.iter().position(|o| o == k).unwrap();
        assert!(pos(&a) < pos(&b));
        assert!(pos(&b) < pos(&c));
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn missing_dependency_counts_as_unknown() {
        let (mut graph, mut entities, [a, _, c]) = chain();
        let ghost = key(OsiLayer::Datalink, "wlan0");
        graph.add_dependency(&c, &ghost).unwrap();
        assert_eq!(graph.recompute_derived(&entities, &c), Normal);
        graph.recompute_all(&mut entities, 5);
        assert_eq!(entities[&c].current_severity(), Normal);
        assert!(!entities.contains_key(&ghost));

        entities.get_mut(&a).unwrap().record_observation_at(6, Down, "carrier lost");
        graph.recompute_all(&mut entities, 6);
        assert_eq!(entities[&c].current_severity(), DownDependency);
    }
}
