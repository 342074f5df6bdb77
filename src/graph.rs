//! Dependency graph construction and layering
//!
//! Uses petgraph to build a DAG over the closure of the requested tasks.
//! Nodes carry registry ids; edges go from dependency to dependent. The graph
//! is rebuilt for every run and never mutated afterwards.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::error::{FlowError, Result};
use crate::registry::{TaskId, TaskRegistry};

/// Read-only dependency view of a task closure
#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraph<TaskId, ()>,
    index_of: HashMap<TaskId, NodeIndex>,
}

impl DependencyGraph {
    /// Build the graph for `requested` and everything it transitively depends on
    ///
    /// Fails with `UnknownTask` for any missing name and with
    /// `CyclicDependency` if a task inside the closure depends on itself.
    pub fn resolve<S: AsRef<str>>(registry: &TaskRegistry, requested: &[S]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut index_of = HashMap::new();
        let mut queue = VecDeque::new();

        for name in requested {
            let id = registry
                .id_of(name.as_ref())
                .ok_or_else(|| registry.unknown(name.as_ref()))?;
            queue.push_back(id);
        }

        // Collect the closure breadth first
        let mut closure = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !closure.insert(id) {
                continue;
            }
            for dep in &registry.task(id).depends {
                let dep_id = registry.id_of(dep).ok_or_else(|| registry.unknown(dep))?;
                queue.push_back(dep_id);
            }
        }

        // Add nodes in registration order so node order is the tie-break
        let mut ids: Vec<TaskId> = closure.into_iter().collect();
        ids.sort();
        for id in &ids {
            index_of.insert(*id, graph.add_node(*id));
        }

        for id in &ids {
            for dep in &registry.task(*id).depends {
                if let Some(dep_id) = registry.id_of(dep) {
                    // Edge goes from dependency TO dependent (dep must run first)
                    graph.add_edge(index_of[&dep_id], index_of[id], ());
                }
            }
        }

        let resolved = Self { graph, index_of };

        let cycle = resolved.find_cycle();
        if !cycle.is_empty() {
            let cycle = cycle
                .into_iter()
                .map(|id| registry.task(id).name.clone())
                .collect();
            return Err(FlowError::CyclicDependency { cycle });
        }

        Ok(resolved)
    }

    /// Group tasks into layers: layer n only depends on layers before n
    ///
    /// Tasks inside a layer are ordered by registration.
    pub fn layers(&self) -> Vec<Vec<TaskId>> {
        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        let order = match toposort(&self.graph, None) {
            Ok(order) => order,
            // Cycles are rejected in `resolve`
            Err(_) => return Vec::new(),
        };

        for node in order {
            let d = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .map(|dep| depth[&dep] + 1)
                .max()
                .unwrap_or(0);
            depth.insert(node, d);
        }

        let mut layers: Vec<Vec<TaskId>> = Vec::new();
        for (node, d) in depth {
            while layers.len() <= d {
                layers.push(Vec::new());
            }
            layers[d].push(self.graph[node]);
        }
        for layer in &mut layers {
            layer.sort();
        }
        layers
    }

    /// Direct dependencies of a task inside the closure
    pub fn dependencies(&self, id: TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that directly depend on `id`
    pub fn dependents(&self, id: TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Every task in the closure, in registration order
    pub fn tasks(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.graph.node_weights().copied().collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.index_of.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    fn neighbors(&self, id: TaskId, dir: Direction) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = match self.index_of.get(&id) {
            Some(&idx) => self
                .graph
                .neighbors_directed(idx, dir)
                .map(|n| self.graph[n])
                .collect(),
            None => Vec::new(),
        };
        ids.sort();
        ids
    }

    /// Find one cycle, returned as a closed path in dependency order
    ///
    /// `a -> b -> a` means `a` depends on `b` which depends on `a`.
    fn find_cycle(&self) -> Vec<TaskId> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        fn visit(
            graph: &DiGraph<TaskId, ()>,
            node: NodeIndex,
            marks: &mut [Mark],
            stack: &mut Vec<NodeIndex>,
        ) -> Option<Vec<NodeIndex>> {
            marks[node.index()] = Mark::OnStack;
            stack.push(node);

            let mut deps: Vec<NodeIndex> =
                graph.neighbors_directed(node, Direction::Incoming).collect();
            deps.sort();

            for dep in deps {
                match marks[dep.index()] {
                    Mark::OnStack => {
                        let start = stack.iter().position(|&n| n == dep).unwrap_or(0);
                        let mut cycle = stack[start..].to_vec();
                        cycle.push(dep);
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        if let Some(cycle) = visit(graph, dep, marks, stack) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }

            stack.pop();
            marks[node.index()] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];
        let mut stack = Vec::new();

        for node in self.graph.node_indices() {
            if marks[node.index()] == Mark::Unvisited {
                if let Some(cycle) = visit(&self.graph, node, &mut marks, &mut stack) {
                    return cycle.into_iter().map(|n| self.graph[n]).collect();
                }
            }
        }

        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::noop;

    fn make_test_registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.register("a", Vec::<String>::new(), noop()).unwrap();
        registry.register("b", ["a"], noop()).unwrap();
        registry.register("c", ["a"], noop()).unwrap();
        registry.register("d", ["b", "c"], noop()).unwrap();
        registry.register("unrelated", Vec::<String>::new(), noop()).unwrap();
        registry
    }

    fn names(registry: &TaskRegistry, layers: &[Vec<TaskId>]) -> Vec<Vec<String>> {
        layers
            .iter()
            .map(|l| l.iter().map(|id| registry.task(*id).name.clone()).collect())
            .collect()
    }

    #[test]
    fn test_closure_and_layers() {
        let registry = make_test_registry();
        let graph = DependencyGraph::resolve(&registry, &["d"]).unwrap();

        assert_eq!(graph.len(), 4);
        assert!(!graph.contains(registry.id_of("unrelated").unwrap()));
        assert_eq!(
            names(&registry, &graph.layers()),
            vec![vec!["a"], vec!["b", "c"], vec!["d"]]
        );
    }

    #[test]
    fn test_layer_uses_longest_path() {
        let mut registry = TaskRegistry::new();
        registry.register("top", ["leaf", "mid"], noop()).unwrap();
        registry.register("mid", ["leaf"], noop()).unwrap();
        registry.register("leaf", Vec::<String>::new(), noop()).unwrap();

        let graph = DependencyGraph::resolve(&registry, &["top"]).unwrap();
        assert_eq!(
            names(&registry, &graph.layers()),
            vec![vec!["leaf"], vec!["mid"], vec!["top"]]
        );
    }

    #[test]
    fn test_registration_order_breaks_ties() {
        let mut registry = TaskRegistry::new();
        registry.register("group", ["zz", "aa"], noop()).unwrap();
        registry.register("zz", Vec::<String>::new(), noop()).unwrap();
        registry.register("aa", Vec::<String>::new(), noop()).unwrap();

        let graph = DependencyGraph::resolve(&registry, &["group"]).unwrap();
        assert_eq!(graph.layers()[0].len(), 2);
        assert_eq!(names(&registry, &graph.layers())[0], vec!["zz", "aa"]);
    }

    #[test]
    fn test_cycle_detection_reports_path() {
        let mut registry = TaskRegistry::new();
        registry.register("a", ["b"], noop()).unwrap();
        registry.register("b", ["c"], noop()).unwrap();
        registry.register("c", ["a"], noop()).unwrap();

        match DependencyGraph::resolve(&registry, &["a"]) {
            Err(FlowError::CyclicDependency { cycle }) => {
                assert_eq!(cycle, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let mut registry = TaskRegistry::new();
        registry.register("loop", ["loop"], noop()).unwrap();

        let err = DependencyGraph::resolve(&registry, &["loop"]).unwrap_err();
        assert!(matches!(err, FlowError::CyclicDependency { cycle } if cycle == vec!["loop", "loop"]));
    }

    #[test]
    fn test_cycle_outside_closure_is_ignored() {
        let mut registry = TaskRegistry::new();
        registry.register("x", ["y"], noop()).unwrap();
        registry.register("y", ["x"], noop()).unwrap();
        registry.register("ok", Vec::<String>::new(), noop()).unwrap();

        assert!(DependencyGraph::resolve(&registry, &["ok"]).is_ok());
    }

    #[test]
    fn test_unknown_dependency() {
        let mut registry = TaskRegistry::new();
        registry.register("bundle", ["lint"], noop()).unwrap();

        let err = DependencyGraph::resolve(&registry, &["bundle"]).unwrap_err();
        assert!(matches!(err, FlowError::UnknownTask { name, .. } if name == "lint"));

        let err = DependencyGraph::resolve(&registry, &["missing"]).unwrap_err();
        assert!(matches!(err, FlowError::UnknownTask { name, .. } if name == "missing"));
    }

    #[test]
    fn test_dependencies_and_dependents() {
        let registry = make_test_registry();
        let graph = DependencyGraph::resolve(&registry, &["d"]).unwrap();
        let id = |n: &str| registry.id_of(n).unwrap();

        assert_eq!(graph.dependencies(id("d")), vec![id("b"), id("c")]);
        assert_eq!(graph.dependents(id("a")), vec![id("b"), id("c")]);
        assert_eq!(graph.tasks(), vec![id("a"), id("b"), id("c"), id("d")]);
    }
}
