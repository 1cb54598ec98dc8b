//! Dependency resolution for formula builds.
//!
//! Turns the dependency lists of one or more requested formulas into a
//! total installation order, failing fast on cycles and on unmet platform
//! requirements. No network or filesystem side effect happens during
//! resolution: a graph that fails to resolve never triggers a fetch or a
//! build.
//!
//! Dependency kinds are filtered here: build and runtime edges always
//! participate, optional and recommended edges only when the caller enables
//! them. A dependency edge carrying a platform gate the host fails is
//! treated as absent. A formula whose own `min_platform` the host fails is
//! a fatal [`UnsupportedPlatform`](MaltError::UnsupportedPlatform).

use anyhow::Result;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::core::MaltError;
use crate::formula::{DependencyKind, FormulaLibrary, FormulaSpec};
use crate::platform::HostPlatform;

/// Caller-controlled switches for which dependency kinds participate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Include `optional` dependency edges
    pub include_optional: bool,
    /// Include `recommended` dependency edges
    pub include_recommended: bool,
}

impl ResolveOptions {
    fn wants(&self, kind: DependencyKind) -> bool {
        match kind {
            DependencyKind::Build | DependencyKind::Runtime => true,
            DependencyKind::Optional => self.include_optional,
            DependencyKind::Recommended => self.include_recommended,
        }
    }
}

/// Color states for cycle detection using DFS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    /// Node has not been visited.
    White,
    /// Node is currently being visited (in the DFS stack).
    Gray,
    /// Node has been fully visited.
    Black,
}

/// The outcome of resolution: a total install order plus the filtered
/// per-formula dependency edges the orchestrator schedules against.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// All transitively required formulas, dependencies first.
    pub order: Vec<Arc<FormulaSpec>>,
    /// Direct (filtered, gate-applied) dependencies per formula.
    deps: HashMap<String, Vec<(String, DependencyKind)>>,
}

impl Resolution {
    /// Direct dependency names of a formula, all kinds that survived
    /// filtering.
    pub fn direct_deps(&self, name: &str) -> Vec<&str> {
        self.deps
            .get(name)
            .map(|d| d.iter().map(|(n, _)| n.as_str()).collect())
            .unwrap_or_default()
    }

    /// The runtime dependency closure of a formula: transitive dependencies
    /// reachable without traversing a build-only edge from `name` itself.
    ///
    /// Build-only dependencies participate in the install order but are not
    /// part of what the installed formula needs at runtime.
    pub fn runtime_closure(&self, name: &str) -> HashSet<String> {
        let mut closure = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();

        if let Some(direct) = self.deps.get(name) {
            for (dep, kind) in direct {
                if *kind != DependencyKind::Build {
                    queue.push_back(dep);
                }
            }
        }

        while let Some(current) = queue.pop_front() {
            if !closure.insert(current.to_string()) {
                continue;
            }
            if let Some(direct) = self.deps.get(current) {
                for (dep, kind) in direct {
                    // Build deps of a runtime dep are that dep's build
                    // concern, not part of this formula's runtime closure.
                    if *kind != DependencyKind::Build {
                        queue.push_back(dep);
                    }
                }
            }
        }

        closure
    }

    /// The full transitive dependency set of a formula, every kind that
    /// survived filtering. This is the set the build-artifact cache key
    /// hashes over: a change anywhere in it invalidates the cached keg.
    pub fn full_closure(&self, name: &str) -> HashSet<String> {
        let mut closure = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(name);

        while let Some(current) = queue.pop_front() {
            if let Some(direct) = self.deps.get(current) {
                for (dep, _) in direct {
                    if closure.insert(dep.clone()) {
                        queue.push_back(dep);
                    }
                }
            }
        }

        closure
    }

    /// Render the dependency tree rooted at `name` for `malt deps --tree`.
    pub fn tree_string(&self, name: &str) -> String {
        let mut result = format!("{name}\n");
        let mut visited = HashSet::new();
        visited.insert(name.to_string());
        self.build_tree_string(name, &mut result, "", &mut visited);
        result
    }

    fn build_tree_string(
        &self,
        name: &str,
        result: &mut String,
        prefix: &str,
        visited: &mut HashSet<String>,
    ) {
        let deps = self.deps.get(name).cloned().unwrap_or_default();
        for (i, (dep, kind)) in deps.iter().enumerate() {
            let is_last = i == deps.len() - 1;
            let connector = if is_last { "└── " } else { "├── " };
            let annotation = match kind {
                DependencyKind::Runtime => String::new(),
                other => format!(" [{other}]"),
            };
            result.push_str(&format!("{prefix}{connector}{dep}{annotation}\n"));

            let child_prefix = if is_last {
                format!("{prefix}    ")
            } else {
                format!("{prefix}│   ")
            };
            if visited.insert(dep.clone()) {
                self.build_tree_string(dep, result, &child_prefix, visited);
            }
        }
    }
}

/// Resolves formula dependency graphs into installation orders.
pub struct DependencyResolver<'a> {
    library: &'a FormulaLibrary,
    host: &'a HostPlatform,
    options: ResolveOptions,
}

impl<'a> DependencyResolver<'a> {
    /// Create a resolver over a loaded formula library.
    pub fn new(library: &'a FormulaLibrary, host: &'a HostPlatform, options: ResolveOptions) -> Self {
        Self {
            library,
            host,
            options,
        }
    }

    /// Resolve the given root formulas into a total install order.
    ///
    /// Fails with [`MaltError::UnsupportedPlatform`] if any reached formula
    /// declares a minimum platform the host does not satisfy, and with
    /// [`MaltError::DependencyCycle`] (naming the cycle) if the build+runtime
    /// graph is cyclic. Both are raised before any fetch or build step runs.
    pub fn resolve(&self, roots: &[&str]) -> Result<Resolution> {
        let mut specs: HashMap<String, Arc<FormulaSpec>> = HashMap::new();
        let mut deps: HashMap<String, Vec<(String, DependencyKind)>> = HashMap::new();
        let mut queue: VecDeque<String> = roots.iter().map(|r| (*r).to_string()).collect();

        while let Some(name) = queue.pop_front() {
            if specs.contains_key(&name) {
                continue;
            }
            let spec = self.library.get(&name)?;

            if let Some(ref requirement) = spec.min_platform
                && !requirement.satisfied_by(self.host)
            {
                return Err(MaltError::UnsupportedPlatform {
                    formula: name,
                    requirement: requirement.to_string(),
                    host: self.host.describe(),
                }
                .into());
            }

            let mut filtered = Vec::new();
            for dep in &spec.dependencies {
                if !self.options.wants(dep.kind) {
                    continue;
                }
                // A gated edge the host fails is simply not wanted here.
                if !dep.gate.satisfied_by(self.host) {
                    tracing::debug!(
                        formula = %name,
                        dependency = %dep.name,
                        gate = %dep.gate,
                        "Skipping platform-gated dependency"
                    );
                    continue;
                }
                filtered.push((dep.name.clone(), dep.kind));
                queue.push_back(dep.name.clone());
            }

            deps.insert(name.clone(), filtered);
            specs.insert(name, spec);
        }

        let order = self.install_order(&specs, &deps)?;
        Ok(Resolution { order, deps })
    }

    /// Build the petgraph graph, reject cycles, and produce a
    /// dependencies-first order.
    fn install_order(
        &self,
        specs: &HashMap<String, Arc<FormulaSpec>>,
        deps: &HashMap<String, Vec<(String, DependencyKind)>>,
    ) -> Result<Vec<Arc<FormulaSpec>>> {
        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut node_map: HashMap<String, NodeIndex> = HashMap::new();

        let mut names: Vec<&String> = specs.keys().collect();
        names.sort_unstable();
        for name in names {
            let idx = graph.add_node(name.clone());
            node_map.insert(name.clone(), idx);
        }
        for (name, direct) in deps {
            let from = node_map[name];
            for (dep, _) in direct {
                let to = node_map[dep];
                if !graph.contains_edge(from, to) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        self.detect_cycles(&graph)?;

        match toposort(&graph, None) {
            Ok(indices) => {
                // Reverse so dependencies come first.
                Ok(indices.into_iter().rev().map(|idx| specs[&graph[idx]].clone()).collect())
            }
            Err(_) => Err(MaltError::DependencyCycle {
                chain: "unknown".to_string(),
            }
            .into()),
        }
    }

    /// Detect cycles using DFS with colors, naming the full cycle path.
    fn detect_cycles(&self, graph: &DiGraph<String, ()>) -> Result<()> {
        let mut colors: HashMap<NodeIndex, Color> = HashMap::new();
        let mut path: Vec<String> = Vec::new();

        for node in graph.node_indices() {
            colors.insert(node, Color::White);
        }

        for node in graph.node_indices() {
            if matches!(colors.get(&node), Some(Color::White))
                && let Some(cycle) = Self::dfs_visit(graph, node, &mut colors, &mut path)
            {
                return Err(MaltError::DependencyCycle {
                    chain: cycle.join(" -> "),
                }
                .into());
            }
        }

        Ok(())
    }

    fn dfs_visit(
        graph: &DiGraph<String, ()>,
        node: NodeIndex,
        colors: &mut HashMap<NodeIndex, Color>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        colors.insert(node, Color::Gray);
        path.push(graph[node].clone());

        for neighbor in graph.neighbors(node) {
            match colors.get(&neighbor) {
                Some(Color::Gray) => {
                    // Found a cycle - slice the path from where it starts.
                    let cycle_start = path.iter().position(|n| *n == graph[neighbor])?;
                    let mut cycle = path[cycle_start..].to_vec();
                    cycle.push(graph[neighbor].clone());
                    return Some(cycle);
                }
                Some(Color::White) => {
                    if let Some(cycle) = Self::dfs_visit(graph, neighbor, colors, path) {
                        return Some(cycle);
                    }
                }
                _ => {}
            }
        }

        path.pop();
        colors.insert(node, Color::Black);
        None
    }
}
