//! Dependency ordering of resources
//!
//! Produces a deterministic topological order: whenever several resources
//! are ready at once, the smallest `(kind, id)` goes first, so identical
//! input always yields the identical plan.

use crate::error::{CloudError, Result};
use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use pveflow_core::{DesiredStateModel, ResourceId, ResourceKind, ResourceSpec};
use std::collections::{BTreeMap, BTreeSet};

/// Reconciliation phase of a resource kind (network, management node, fleet).
///
/// A resource may only depend on resources of an earlier or the same phase.
pub fn phase_of(kind: ResourceKind) -> u8 {
    match kind {
        ResourceKind::Zone | ResourceKind::VNet | ResourceKind::Subnet => 0,
        ResourceKind::Container => 1,
        ResourceKind::Vm => 2,
    }
}

/// Topologically ordered resource graph.
///
/// Edges point from a dependency to its dependent.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<ResourceId, ()>,
    index: BTreeMap<ResourceId, NodeIndex>,
    order: Vec<ResourceId>,
}

impl DependencyGraph {
    /// Order every resource of `model`
    pub fn build(model: &DesiredStateModel) -> Result<Self> {
        Self::from_specs(model.resources())
    }

    /// Order an arbitrary set of specs.
    ///
    /// Fails on dependencies outside the set, on dependencies pointing to a
    /// later phase, and on cycles.
    pub fn from_specs<'a>(specs: impl IntoIterator<Item = &'a ResourceSpec>) -> Result<Self> {
        let specs: Vec<&ResourceSpec> = specs.into_iter().collect();
        let mut graph = DiGraph::new();
        let mut index = BTreeMap::new();
        for spec in &specs {
            index
                .entry(spec.id.clone())
                .or_insert_with(|| graph.add_node(spec.id.clone()));
        }

        for spec in &specs {
            let node = index[&spec.id];
            for dep in &spec.depends_on {
                let Some(&target) = index.get(dep) else {
                    return Err(CloudError::UnknownDependency {
                        resource: spec.id.clone(),
                        target: dep.clone(),
                    });
                };
                if phase_of(dep.kind) > phase_of(spec.id.kind) {
                    return Err(CloudError::PhaseViolation {
                        resource: spec.id.clone(),
                        target: dep.clone(),
                    });
                }
                graph.update_edge(target, node, ());
            }
        }

        let mut cycle: Vec<ResourceId> = tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
            .flatten()
            .map(|node| graph[node].clone())
            .collect();
        if !cycle.is_empty() {
            cycle.sort();
            return Err(CloudError::Cycle(cycle));
        }

        let order = kahn_order(&graph);
        Ok(Self {
            graph,
            index,
            order,
        })
    }

    /// Apply order
    pub fn order(&self) -> &[ResourceId] {
        &self.order
    }

    /// Teardown order: the element-wise reverse of [`Self::order`]
    pub fn teardown_order(&self) -> Vec<ResourceId> {
        reverse(&self.order)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Direct dependencies of `id`, smallest first
    pub fn dependencies<'a>(
        &'a self,
        id: &ResourceId,
    ) -> impl Iterator<Item = &'a ResourceId> + use<'a> {
        self.neighbors(id, Direction::Incoming).into_iter()
    }

    /// Resources that directly depend on `id`, smallest first
    pub fn dependents<'a>(
        &'a self,
        id: &ResourceId,
    ) -> impl Iterator<Item = &'a ResourceId> + use<'a> {
        self.neighbors(id, Direction::Outgoing).into_iter()
    }

    fn neighbors(&self, id: &ResourceId, direction: Direction) -> Vec<&ResourceId> {
        let mut ids: Vec<&ResourceId> = self
            .index
            .get(id)
            .into_iter()
            .flat_map(|&node| self.graph.neighbors_directed(node, direction))
            .map(|node| &self.graph[node])
            .collect();
        ids.sort();
        ids
    }
}

/// Kahn's algorithm over an acyclic graph; among ready nodes the smallest
/// id goes first.
fn kahn_order(graph: &DiGraph<ResourceId, ()>) -> Vec<ResourceId> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|node| graph.neighbors_directed(node, Direction::Incoming).count())
        .collect();
    let mut ready: BTreeSet<(&ResourceId, NodeIndex)> = graph
        .node_indices()
        .filter(|node| in_degree[node.index()] == 0)
        .map(|node| (&graph[node], node))
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some((id, node)) = ready.pop_first() {
        order.push(id.clone());
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            in_degree[next.index()] -= 1;
            if in_degree[next.index()] == 0 {
                ready.insert((&graph[next], next));
            }
        }
    }
    order
}

/// Exact inverse of `order`
pub fn reverse(order: &[ResourceId]) -> Vec<ResourceId> {
    order.iter().rev().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_model;
    use proptest::prelude::*;

    fn position(order: &[ResourceId], id: &ResourceId) -> usize {
        order.iter().position(|i| i == id).unwrap()
    }

    #[test]
    fn test_every_resource_after_its_dependencies() {
        let model = sample_model();
        let graph = DependencyGraph::build(&model).unwrap();
        assert_eq!(graph.len(), model.len());

        for spec in model.resources() {
            let at = position(graph.order(), &spec.id);
            for dep in &spec.depends_on {
                assert!(
                    position(graph.order(), dep) < at,
                    "{} must come after {}",
                    spec.id,
                    dep
                );
            }
        }
    }

    #[test]
    fn test_order_is_deterministic_with_kind_tie_break() {
        let model = sample_model();
        let first = DependencyGraph::build(&model).unwrap();
        let second = DependencyGraph::build(&model).unwrap();
        assert_eq!(first.order(), second.order());

        let rendered: Vec<String> = first.order().iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "zone/labzone",
                "vnet/vnetapps",
                "vnet/vnetmgmt",
                "subnet/10.100.1.0/24",
                "subnet/10.100.2.0/24",
                "container/200",
                "vm/301",
                "vm/302",
            ]
        );
    }

    #[test]
    fn test_reverse_is_exact_mirror() {
        let graph = DependencyGraph::build(&sample_model()).unwrap();
        let order = graph.order();
        let reversed = graph.teardown_order();
        let n = order.len();
        assert_eq!(reversed.len(), n);
        for i in 0..n {
            assert_eq!(reversed[i], order[n - 1 - i]);
        }
        assert!(reverse(&[]).is_empty());
    }

    #[test]
    fn test_cycle_detected() {
        let a = ResourceSpec::new(ResourceId::vm(301)).depends_on(ResourceId::vm(302));
        let b = ResourceSpec::new(ResourceId::vm(302)).depends_on(ResourceId::vm(301));
        let c = ResourceSpec::new(ResourceId::vm(303));

        match DependencyGraph::from_specs([&a, &b, &c]) {
            Err(CloudError::Cycle(ids)) => {
                assert_eq!(ids, vec![ResourceId::vm(301), ResourceId::vm(302)]);
            }
            other => panic!("expected cycle, got {:?}", other.map(|g| g.order().to_vec())),
        }
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let a = ResourceSpec::new(ResourceId::vm(301)).depends_on(ResourceId::container(200));
        assert!(matches!(
            DependencyGraph::from_specs([&a]),
            Err(CloudError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_dependency_on_later_phase_rejected() {
        let vm = ResourceSpec::new(ResourceId::vm(301));
        let ct = ResourceSpec::new(ResourceId::container(200)).depends_on(ResourceId::vm(301));
        assert!(matches!(
            DependencyGraph::from_specs([&vm, &ct]),
            Err(CloudError::PhaseViolation { .. })
        ));
    }

    #[test]
    fn test_direct_neighbors_are_sorted() {
        let graph = DependencyGraph::build(&sample_model()).unwrap();
        let dependents: Vec<&ResourceId> = graph.dependents(&ResourceId::vnet("vnetmgmt")).collect();
        assert_eq!(dependents, vec![&ResourceId::subnet("10.100.1.0/24")]);

        let deps: Vec<&ResourceId> = graph.dependencies(&ResourceId::vm(301)).collect();
        assert!(deps.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(deps.contains(&&ResourceId::container(200)));
        assert_eq!(graph.dependencies(&ResourceId::vm(999)).count(), 0);
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let a = ResourceSpec::new(ResourceId::vm(301)).depends_on(ResourceId::vm(301));
        match DependencyGraph::from_specs([&a]) {
            Err(CloudError::Cycle(ids)) => assert_eq!(ids, vec![ResourceId::vm(301)]),
            other => panic!("expected cycle, got {:?}", other.map(|g| g.order().to_vec())),
        }
    }

    #[test]
    fn test_cycle_excludes_downstream_resources() {
        let a = ResourceSpec::new(ResourceId::vm(301)).depends_on(ResourceId::vm(302));
        let b = ResourceSpec::new(ResourceId::vm(302)).depends_on(ResourceId::vm(301));
        let c = ResourceSpec::new(ResourceId::vm(303)).depends_on(ResourceId::vm(302));

        match DependencyGraph::from_specs([&c, &b, &a]) {
            Err(CloudError::Cycle(ids)) => {
                assert_eq!(ids, vec![ResourceId::vm(301), ResourceId::vm(302)]);
            }
            other => panic!("expected cycle, got {:?}", other.map(|g| g.order().to_vec())),
        }
    }

    /// VMs whose dependencies only point to earlier slots; vmids are permuted
    /// so the dependency direction is unrelated to id order.
    fn acyclic_fleet() -> impl Strategy<Value = Vec<ResourceSpec>> {
        (1usize..12).prop_flat_map(|n| {
            (
                Just((0..n as u32).collect::<Vec<_>>()).prop_shuffle(),
                proptest::collection::vec(any::<bool>(), n * n),
            )
                .prop_map(move |(vmids, edges)| {
                    (0..n)
                        .map(|i| {
                            let mut spec = ResourceSpec::new(ResourceId::vm(300 + vmids[i]));
                            for j in (0..i).filter(|j| edges[i * n + j]) {
                                spec = spec.depends_on(ResourceId::vm(300 + vmids[j]));
                            }
                            spec
                        })
                        .collect::<Vec<_>>()
                })
        })
    }

    proptest! {
        #[test]
        fn prop_order_respects_dependencies(specs in acyclic_fleet()) {
            let graph = DependencyGraph::from_specs(&specs).unwrap();
            let order = graph.order();
            prop_assert_eq!(order.len(), specs.len());

            for spec in &specs {
                let at = position(order, &spec.id);
                for dep in &spec.depends_on {
                    prop_assert!(position(order, dep) < at);
                }
            }

            let reversed = graph.teardown_order();
            let n = order.len();
            for i in 0..n {
                prop_assert_eq!(&reversed[i], &order[n - 1 - i]);
            }
        }

        #[test]
        fn prop_order_ignores_input_order(specs in acyclic_fleet()) {
            let forward = DependencyGraph::from_specs(&specs).unwrap();
            let backward = DependencyGraph::from_specs(specs.iter().rev()).unwrap();
            prop_assert_eq!(forward.order(), backward.order());
        }

        #[test]
        fn prop_ring_is_reported_as_cycle(
            ring_len in 2u32..8,
            fleet in acyclic_fleet(),
            downstream in any::<bool>(),
        ) {
            let ring: Vec<ResourceId> = (0..ring_len).map(|i| ResourceId::vm(400 + i)).collect();
            let mut specs = fleet;
            for (i, id) in ring.iter().enumerate() {
                let next = ring[(i + 1) % ring.len()].clone();
                specs.push(ResourceSpec::new(id.clone()).depends_on(next));
            }
            if downstream {
                specs.push(ResourceSpec::new(ResourceId::vm(500)).depends_on(ring[0].clone()));
            }

            match DependencyGraph::from_specs(&specs) {
                Err(CloudError::Cycle(ids)) => prop_assert_eq!(ids, ring),
                Err(other) => prop_assert!(false, "unexpected error {}", other),
                Ok(graph) => prop_assert!(false, "cycle accepted: {:?}", graph.order()),
            }
        }
    }
}
