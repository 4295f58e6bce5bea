//! Dependency graph and topological ordering
//!
//! Nodes are validated descriptors in discovery order. Ordering uses Kahn's
//! algorithm with a min-heap over discovery indices, so independent plugins keep
//! their discovery order and the result is identical across runs. When Kahn's
//! algorithm stalls, a DFS over the remaining nodes recovers an actual cycle path.

use crate::descriptor::PluginDescriptor;
use crate::{PluginError, PluginResult};
use semver::{Version, VersionReq};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tracing::warn;

/// A dependency edge: `from` depends on `to`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
    pub optional: bool,
}

/// Directed dependency graph over a batch of descriptors
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<PluginDescriptor>,
    index: HashMap<String, usize>,
    /// Node -> nodes it depends on, within the batch
    dependencies: Vec<Vec<usize>>,
    /// Node -> nodes depending on it
    dependents: Vec<Vec<usize>>,
    edges: Vec<DependencyEdge>,
}

impl DependencyGraph {
    /// Build a graph where every dependency must be inside the batch
    pub fn build(descriptors: &[PluginDescriptor]) -> PluginResult<Self> {
        Self::build_with_resident(descriptors, &HashMap::new())
    }

    /// Build a graph; `resident` maps ids of already running plugins to their versions
    ///
    /// Fails with `DuplicatePlugin`, `DependencyMissing` or
    /// `DependencyVersionMismatch`. Cycles are reported by [`Self::topological_order`].
    pub fn build_with_resident(
        descriptors: &[PluginDescriptor],
        resident: &HashMap<String, String>,
    ) -> PluginResult<Self> {
        let mut index = HashMap::with_capacity(descriptors.len());
        for (i, descriptor) in descriptors.iter().enumerate() {
            if index.insert(descriptor.id.clone(), i).is_some() {
                return Err(PluginError::DuplicatePlugin(descriptor.id.clone()));
            }
        }

        let mut dependencies = vec![Vec::new(); descriptors.len()];
        let mut dependents = vec![Vec::new(); descriptors.len()];
        let mut edges = Vec::new();

        for (i, descriptor) in descriptors.iter().enumerate() {
            for dep in &descriptor.dependencies {
                let found_version = match index.get(&dep.plugin_id) {
                    Some(&j) => Some(descriptors[j].version.as_str()),
                    None => resident.get(&dep.plugin_id).map(String::as_str),
                };

                let Some(found_version) = found_version else {
                    if dep.optional {
                        continue;
                    }
                    return Err(PluginError::DependencyMissing {
                        plugin_id: descriptor.id.clone(),
                        dependency: dep.plugin_id.clone(),
                    });
                };

                if let Some(req) = &dep.version_req {
                    if !version_satisfies(req, found_version) {
                        if dep.optional {
                            warn!(
                                plugin_id = %descriptor.id,
                                dependency = %dep.plugin_id,
                                required = %req,
                                found = %found_version,
                                "Ignoring optional dependency with incompatible version"
                            );
                            continue;
                        }
                        return Err(PluginError::DependencyVersionMismatch {
                            plugin_id: descriptor.id.clone(),
                            dependency: dep.plugin_id.clone(),
                            required: req.clone(),
                            found: found_version.to_string(),
                        });
                    }
                }

                edges.push(DependencyEdge {
                    from: descriptor.id.clone(),
                    to: dep.plugin_id.clone(),
                    optional: dep.optional,
                });

                if let Some(&j) = index.get(&dep.plugin_id) {
                    if !dependencies[i].contains(&j) {
                        dependencies[i].push(j);
                        dependents[j].push(i);
                    }
                }
            }
        }

        Ok(Self {
            nodes: descriptors.to_vec(),
            index,
            dependencies,
            dependents,
            edges,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    pub fn descriptor(&self, id: &str) -> Option<&PluginDescriptor> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Ids depending directly on `id`, in discovery order
    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        let Some(&i) = self.index.get(id) else {
            return Vec::new();
        };
        let mut dependents = self.dependents[i].clone();
        dependents.sort_unstable();
        dependents
            .into_iter()
            .map(|j| self.nodes[j].id.as_str())
            .collect()
    }

    /// Dependencies first; ties broken by discovery order
    pub fn topological_order(&self) -> PluginResult<Vec<String>> {
        Ok(self
            .sorted_indices()?
            .into_iter()
            .map(|i| self.nodes[i].id.clone())
            .collect())
    }

    /// Reverse of the topological order, used for shutdown
    pub fn shutdown_order(&self) -> PluginResult<Vec<String>> {
        let mut order = self.topological_order()?;
        order.reverse();
        Ok(order)
    }

    /// Groups of mutually independent plugins by dependency depth
    ///
    /// Every plugin in wave `n` depends only on plugins in waves `< n` (or on
    /// resident plugins outside the graph).
    pub fn load_waves(&self) -> PluginResult<Vec<Vec<String>>> {
        let order = self.sorted_indices()?;
        let mut depth = vec![0usize; self.nodes.len()];
        for &i in &order {
            depth[i] = self.dependencies[i]
                .iter()
                .map(|&j| depth[j] + 1)
                .max()
                .unwrap_or(0);
        }

        let wave_count = depth.iter().copied().max().map_or(0, |d| d + 1);
        let mut waves = vec![Vec::new(); wave_count];
        for &i in &order {
            waves[depth[i]].push(self.nodes[i].id.clone());
        }
        Ok(waves)
    }

    fn sorted_indices(&self) -> PluginResult<Vec<usize>> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(i);
            for &dependent in &self.dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        if order.len() == self.nodes.len() {
            return Ok(order);
        }

        let remaining: Vec<bool> = in_degree.iter().map(|&d| d > 0).collect();
        Err(PluginError::CycleDetected {
            cycle: self.find_cycle(&remaining),
        })
    }

    /// Walk dependency edges among unsorted nodes until a node repeats
    fn find_cycle(&self, remaining: &[bool]) -> Vec<String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnPath,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut path: Vec<usize> = Vec::new();

        for start in (0..self.nodes.len()).filter(|&i| remaining[i]) {
            if marks[start] != Mark::Unvisited {
                continue;
            }
            // Iterative DFS: (node, next dependency position)
            let mut stack = vec![(start, 0usize)];
            marks[start] = Mark::OnPath;
            path.push(start);

            while let Some(&(node, cursor)) = stack.last() {
                let deps = &self.dependencies[node];
                let next = deps[cursor..].iter().position(|&dep| remaining[dep]);
                match next {
                    Some(offset) => {
                        let dep = deps[cursor + offset];
                        if let Some(top) = stack.last_mut() {
                            top.1 = cursor + offset + 1;
                        }
                        match marks[dep] {
                            Mark::OnPath => {
                                let begin = path.iter().position(|&p| p == dep).unwrap_or(0);
                                let mut cycle: Vec<String> = path[begin..]
                                    .iter()
                                    .map(|&i| self.nodes[i].id.clone())
                                    .collect();
                                cycle.push(self.nodes[dep].id.clone());
                                return cycle;
                            }
                            Mark::Unvisited => {
                                marks[dep] = Mark::OnPath;
                                path.push(dep);
                                stack.push((dep, 0));
                            }
                            Mark::Done => {}
                        }
                    }
                    None => {
                        marks[node] = Mark::Done;
                        path.pop();
                        stack.pop();
                    }
                }
            }
        }

        // Unreachable when Kahn's algorithm stalled, kept for a total function
        (0..self.nodes.len())
            .filter(|&i| remaining[i])
            .map(|i| self.nodes[i].id.clone())
            .collect()
    }
}

pub(crate) fn version_satisfies(req: &str, version: &str) -> bool {
    match (VersionReq::parse(req), Version::parse(version)) {
        (Ok(req), Ok(version)) => req.matches(&version),
        _ => false,
    }
}
