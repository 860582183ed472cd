//! Result objects: a named build target with its sources, dependencies on
//! other results, a chroot group set, an environment, and a build script —
//! plus the acyclic-graph validation and deterministic topological ordering
//! the build pipeline runs results in.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result, bail};
use drydock_chroot::ChrootGroupRegistry;
use drydock_environment::Environment;
use drydock_source::SourceRegistry;
use serde::{Deserialize, Serialize};

pub use drydock_hash::Digest;

pub type ResultId = Digest;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultDef {
    pub name: String,
    pub sources: Vec<String>,
    pub depends: Vec<String>,
    pub chroot_groups: Vec<String>,
    #[serde(skip)]
    pub env: Environment,
    pub build_script: String,
    /// Whether this result is assembled into the standalone project
    /// reproduction during the pipeline's `collect_project` step. Not part
    /// of `result_id`: it selects pipeline behavior, it does not change
    /// what this result builds.
    #[serde(default)]
    pub collect_project: bool,
}

impl ResultDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sources: Vec::new(),
            depends: Vec::new(),
            chroot_groups: Vec::new(),
            env: Environment::new(),
            build_script: String::new(),
            collect_project: false,
        }
    }

    /// Compute this result's ResultID from its own declared inputs: name,
    /// each source name (ordered), each chroot group name (ordered), its
    /// EnvID, and the build script's digest. `depends` is deliberately
    /// excluded here — a result's own identity does not change just because
    /// its dependents change; it is the BuildID (computed one layer up,
    /// where source/chroot/env content is actually resolved) that
    /// ultimately captures the whole transitive input set.
    pub fn result_id(&self) -> ResultId {
        let mut hasher = drydock_hash::Hasher::new();
        hasher.hash_line(&self.name);
        for source in &self.sources {
            hasher.hash_line(source);
        }
        for group in &self.chroot_groups {
            hasher.hash_line(group);
        }
        hasher.hash_line(&self.env.env_id().to_string());
        hasher.hash_line(&self.build_script);
        hasher.finish()
    }

    /// Confirm every source and chroot group this result names is actually
    /// registered, before it ever reaches the pipeline.
    pub fn validate_against(
        &self,
        sources: &SourceRegistry,
        chroot_groups: &ChrootGroupRegistry,
    ) -> Result<()> {
        for name in &self.sources {
            sources
                .get(name)
                .with_context(|| format!("result {} references unknown source {name}", self.name))?;
        }
        chroot_groups
            .resolve(&self.chroot_groups)
            .with_context(|| format!("result {} references an unknown chroot group", self.name))?;
        Ok(())
    }
}

/// A set of results plus their `depends` edges, validated acyclic and
/// ordered topologically.
#[derive(Debug, Clone, Default)]
pub struct ResultGraph {
    results: BTreeMap<String, ResultDef>,
}

impl ResultGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, result: ResultDef) -> Result<()> {
        if self.results.contains_key(&result.name) {
            bail!("duplicate result name: {}", result.name);
        }
        self.results.insert(result.name.clone(), result);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ResultDef> {
        self.results.get(name)
    }

    /// Deterministic topological order (ties broken by name), failing with
    /// the shortest cyclic path if the dependency graph is not acyclic.
    pub fn topo_sort(&self) -> Result<Vec<String>> {
        for result in self.results.values() {
            for dep in &result.depends {
                if !self.results.contains_key(dep) {
                    bail!(
                        "result {} depends on unknown result {}",
                        result.name,
                        dep
                    );
                }
            }
        }

        let mut in_degree: BTreeMap<&str, usize> = self
            .results
            .keys()
            .map(|name| (name.as_str(), 0usize))
            .collect();
        let mut dependents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

        for result in self.results.values() {
            for dep in &result.depends {
                *in_degree.get_mut(result.name.as_str()).unwrap() += 1;
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .insert(result.name.as_str());
            }
        }

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut order = Vec::new();
        while let Some(&name) = ready.iter().next() {
            ready.remove(name);
            order.push(name.to_string());
            if let Some(deps) = dependents.get(name) {
                for &dependent in deps {
                    let deg = in_degree.get_mut(dependent).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if order.len() != self.results.len() {
            let remaining: BTreeSet<&str> = in_degree
                .iter()
                .filter(|(name, _)| !order.iter().any(|o| o == *name))
                .map(|(name, _)| *name)
                .collect();
            let path = shortest_cycle_path(&self.results, &remaining);
            bail!("dependency cycle detected among results: {}", path.join(" -> "));
        }

        Ok(order)
    }
}

/// Find and render the shortest cyclic path among the results still stuck
/// in `remaining` after Kahn's algorithm has removed every acyclic prefix.
fn shortest_cycle_path(
    results: &BTreeMap<String, ResultDef>,
    remaining: &BTreeSet<&str>,
) -> Vec<String> {
    let mut best: Option<Vec<String>> = None;
    for &start in remaining {
        let mut path: Vec<String> = vec![start.to_string()];
        let mut current: String = start.to_string();
        let mut visited: BTreeSet<String> = BTreeSet::new();
        visited.insert(current.clone());
        loop {
            let next: Option<String> = results.get(&current).and_then(|r| {
                r.depends
                    .iter()
                    .find(|d| remaining.contains(d.as_str()))
                    .cloned()
            });
            let Some(next) = next else { break };
            if next == start {
                path.push(next);
                break;
            }
            if !visited.insert(next.clone()) {
                break;
            }
            path.push(next.clone());
            current = next;
        }
        if path.last().map(String::as_str) == Some(start) && path.len() > 1 {
            if best.as_ref().is_none_or(|b| path.len() < b.len()) {
                best = Some(path);
            }
        }
    }
    best.unwrap_or_else(|| remaining.iter().map(|s| s.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, depends: &[&str]) -> ResultDef {
        let mut r = ResultDef::new(name);
        r.depends = depends.iter().map(|s| s.to_string()).collect();
        r
    }

    #[test]
    fn topo_sort_orders_dependencies_before_dependents() {
        let mut graph = ResultGraph::new();
        graph.insert(result("a", &[])).unwrap();
        graph.insert(result("b", &["a"])).unwrap();
        graph.insert(result("c", &["b"])).unwrap();

        let order = graph.topo_sort().unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn topo_sort_is_deterministic_for_independent_results() {
        let mut graph = ResultGraph::new();
        graph.insert(result("z", &[])).unwrap();
        graph.insert(result("a", &[])).unwrap();
        graph.insert(result("m", &[])).unwrap();

        assert_eq!(graph.topo_sort().unwrap(), vec!["a", "m", "z"]);
    }

    #[test]
    fn topo_sort_detects_a_direct_cycle() {
        let mut graph = ResultGraph::new();
        graph.insert(result("a", &["b"])).unwrap();
        graph.insert(result("b", &["a"])).unwrap();

        let err = graph.topo_sort().unwrap_err();
        assert!(err.to_string().contains("dependency cycle detected"));
    }

    #[test]
    fn topo_sort_rejects_dependency_on_unknown_result() {
        let mut graph = ResultGraph::new();
        graph.insert(result("a", &["missing"])).unwrap();
        assert!(graph.topo_sort().is_err());
    }

    #[test]
    fn result_id_depends_on_declared_inputs_not_depends() {
        let mut a = ResultDef::new("r");
        a.sources.push("src".to_string());
        let mut b = a.clone();
        b.depends.push("other".to_string());
        assert_eq!(a.result_id(), b.result_id());
    }

    #[test]
    fn validate_against_rejects_unknown_source() {
        let mut r = ResultDef::new("r");
        r.sources.push("missing".to_string());
        let sources = SourceRegistry::with_builtins();
        let groups = ChrootGroupRegistry::new();
        assert!(r.validate_against(&sources, &groups).is_err());
    }

    #[test]
    fn validate_against_accepts_registered_source() {
        let mut r = ResultDef::new("r");
        r.sources.push("files1".to_string());
        let mut sources = SourceRegistry::with_builtins();
        sources.load("files", "files1", &BTreeMap::new()).unwrap();
        let groups = ChrootGroupRegistry::new();
        assert!(r.validate_against(&sources, &groups).is_ok());
    }

    #[test]
    fn result_id_changes_with_build_script() {
        let mut a = ResultDef::new("r");
        a.build_script = "echo a".to_string();
        let mut b = ResultDef::new("r");
        b.build_script = "echo b".to_string();
        assert_ne!(a.result_id(), b.result_id());
    }
}
