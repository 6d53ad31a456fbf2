use crate::errors::CycleError;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Result of a successful topological sort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layering {
    /// Every node, dependencies before dependents, ties broken by id.
    pub order: Vec<String>,
    /// Longest distance from a root; roots are layer 0.
    pub layers: BTreeMap<String, u32>,
    pub total_layers: u32,
}

/// Kahn's algorithm over `nodes` and directed `(from, to)` edges. Edges naming
/// a node outside `nodes` are ignored.
pub fn topological_layers<'a, N, E>(nodes: N, edges: E) -> Result<Layering, CycleError>
where
    N: IntoIterator<Item = &'a str>,
    E: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut in_degree: BTreeMap<&str, usize> = nodes.into_iter().map(|id| (id, 0)).collect();
    let mut downstream: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut upstream: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

    for (from, to) in edges {
        if !in_degree.contains_key(from) || !in_degree.contains_key(to) {
            continue;
        }
        if downstream.entry(from).or_default().insert(to) {
            upstream.entry(to).or_default().insert(from);
            if let Some(degree) = in_degree.get_mut(to) {
                *degree += 1;
            }
        }
    }

    let mut layers: BTreeMap<String, u32> = BTreeMap::new();
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter_map(|(id, degree)| (*degree == 0).then_some(*id))
        .collect();
    let mut order = Vec::with_capacity(in_degree.len());

    while let Some(id) = queue.pop_front() {
        let layer = upstream
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|parent| layers.get(*parent))
            .map(|parent_layer| parent_layer + 1)
            .max()
            .unwrap_or(0);
        layers.insert(id.to_string(), layer);
        order.push(id.to_string());

        for child in downstream.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(child) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*child);
                }
            }
        }
    }

    if order.len() != in_degree.len() {
        let stuck: BTreeSet<&str> = in_degree
            .iter()
            .filter_map(|(id, degree)| (*degree > 0).then_some(*id))
            .collect();
        return Err(CycleError {
            cycle: find_cycle(&stuck, &upstream),
        });
    }

    let total_layers = layers.values().max().map_or(0, |max| max + 1);
    Ok(Layering {
        order,
        layers,
        total_layers,
    })
}

/// Every node left with a positive in-degree has a predecessor that is also
/// stuck, so walking predecessors must revisit a node.
fn find_cycle(stuck: &BTreeSet<&str>, upstream: &BTreeMap<&str, BTreeSet<&str>>) -> Vec<String> {
    let Some(&start) = stuck.first() else {
        return Vec::new();
    };

    let mut path: Vec<&str> = vec![start];
    let mut current = start;
    loop {
        let Some(&parent) = upstream
            .get(current)
            .into_iter()
            .flatten()
            .find(|parent| stuck.contains(*parent))
        else {
            return Vec::new();
        };
        if let Some(pos) = path.iter().position(|seen| *seen == parent) {
            // path runs against the edges; flip it and start at the smallest id
            let mut cycle: Vec<&str> = path[pos..].iter().rev().copied().collect();
            let min_at = cycle
                .iter()
                .enumerate()
                .min_by_key(|(_, id)| **id)
                .map_or(0, |(idx, _)| idx);
            cycle.rotate_left(min_at);
            let mut cycle: Vec<String> = cycle.into_iter().map(str::to_string).collect();
            if let Some(first) = cycle.first().cloned() {
                cycle.push(first);
            }
            return cycle;
        }
        path.push(parent);
        current = parent;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layering(
        nodes: &[&'static str],
        edges: &[(&'static str, &'static str)],
    ) -> Result<Layering, CycleError> {
        topological_layers(nodes.iter().copied(), edges.iter().copied())
    }

    #[test]
    fn assigns_layers_for_linear_chain() {
        let result = layering(&["a", "b", "c"], &[("a", "b"), ("b", "c")]).expect("layers");
        assert_eq!(result.total_layers, 3);
        assert_eq!(result.order, vec!["a", "b", "c"]);
        assert_eq!(result.layers["c"], 2);
    }

    #[test]
    fn assigns_layers_for_diamond() {
        let result = layering(
            &["d", "c", "b", "a"],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        )
        .expect("layers");
        assert_eq!(result.total_layers, 3);
        assert_eq!(result.order, vec!["a", "b", "c", "d"]);
        assert_eq!(result.layers["b"], 1);
        assert_eq!(result.layers["c"], 1);
        assert_eq!(result.layers["d"], 2);
    }

    #[test]
    fn max_parent_rule_applies() {
        let result = layering(
            &["a", "b", "c", "d", "e"],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "e"), ("d", "e")],
        )
        .expect("layers");
        assert_eq!(result.total_layers, 4);
        assert_eq!(result.layers["e"], 3);
    }

    #[test]
    fn duplicate_edges_count_once() {
        let result = layering(&["a", "b"], &[("a", "b"), ("a", "b")]).expect("layers");
        assert_eq!(result.layers["b"], 1);
    }

    #[test]
    fn empty_graph_has_no_layers() {
        let result = layering(&[], &[]).expect("layers");
        assert_eq!(result.total_layers, 0);
        assert!(result.order.is_empty());
    }

    #[test]
    fn cycle_is_reported_in_edge_order() {
        let err = layering(
            &["a", "b", "c", "root"],
            &[("root", "a"), ("a", "b"), ("b", "c"), ("c", "a")],
        )
        .expect_err("cycle");
        assert_eq!(err.cycle, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn cycle_excludes_nodes_merely_downstream_of_it() {
        let err = layering(
            &["x", "y", "tail"],
            &[("x", "y"), ("y", "x"), ("y", "tail")],
        )
        .expect_err("cycle");
        assert_eq!(err.cycle, vec!["x", "y", "x"]);
    }
}
