//! Module dependency graph (DAG) construction and traversal
//!
//! Builds forward and reverse requirement edges between modules for impact
//! analysis (which installed modules an upgrade touches).

use std::collections::{HashMap, HashSet, VecDeque};

/// Dependency graph with forward and reverse edges
#[derive(Debug, Clone, Default)]
pub struct ModuleGraph {
    /// Forward edges: module -> modules it requires (parents)
    parents: HashMap<String, Vec<String>>,

    /// Reverse edges: module -> modules that require it (children)
    children: HashMap<String, Vec<String>>,

    /// All modules in insertion order
    nodes: Vec<String>,
}

impl ModuleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module and its direct requirements
    ///
    /// Requirements that are not yet nodes are added as nodes too.
    pub fn add_module(&mut self, name: &str, requires: &[String]) {
        self.ensure_node(name);
        for dep in requires {
            self.ensure_node(dep);

            let parents = self.parents.entry(name.to_string()).or_default();
            if !parents.contains(dep) {
                parents.push(dep.clone());
            }

            let children = self.children.entry(dep.clone()).or_default();
            if !children.iter().any(|c| c == name) {
                children.push(name.to_string());
            }
        }
    }

    fn ensure_node(&mut self, name: &str) {
        if !self.nodes.iter().any(|n| n == name) {
            self.nodes.push(name.to_string());
        }
    }

    /// All modules in insertion order
    pub fn all_nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.iter().any(|n| n == name)
    }

    /// Get immediate parents (requirements) of a module
    pub fn parents(&self, name: &str) -> Vec<&String> {
        self.parents
            .get(name)
            .map(|deps| deps.iter().collect())
            .unwrap_or_default()
    }

    /// Get immediate children (dependents) of a module
    pub fn children(&self, name: &str) -> Vec<&String> {
        self.children
            .get(name)
            .map(|deps| deps.iter().collect())
            .unwrap_or_default()
    }

    /// All modules that transitively require `name`
    pub fn downstream(&self, name: &str) -> Vec<String> {
        Self::walk(&self.children, name)
    }

    /// All modules `name` transitively requires
    pub fn upstream(&self, name: &str) -> Vec<String> {
        Self::walk(&self.parents, name)
    }

    fn walk(edges: &HashMap<String, Vec<String>>, start: &str) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut queue: VecDeque<String> = edges.get(start).cloned().unwrap_or_default().into();
        let mut result = Vec::new();

        // BFS over the chosen edge direction
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }
            result.push(current.clone());

            if let Some(next) = edges.get(&current) {
                for n in next {
                    if !visited.contains(n) {
                        queue.push_back(n.clone());
                    }
                }
            }
        }

        result
    }

    /// Check if `dependent` transitively requires `dependency`
    pub fn has_path(&self, dependent: &str, dependency: &str) -> bool {
        self.upstream(dependent).iter().any(|m| m == dependency)
    }

    /// Topological order with requirements first; `None` if the graph has a cycle
    ///
    /// Ties are broken by insertion order so the result is deterministic.
    pub fn topological_sort(&self) -> Option<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.as_str(), self.parents.get(n).map(Vec::len).unwrap_or(0)))
            .collect();

        let mut queue: VecDeque<&str> = self
            .nodes
            .iter()
            .map(String::as_str)
            .filter(|n| in_degree[n] == 0)
            .collect();
        let mut result = Vec::with_capacity(self.nodes.len());

        // Kahn's algorithm
        while let Some(node) = queue.pop_front() {
            result.push(node.to_string());

            if let Some(children) = self.children.get(node) {
                for child in children {
                    if let Some(degree) = in_degree.get_mut(child.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(child.as_str());
                        }
                    }
                }
            }
        }

        if result.len() == self.nodes.len() {
            Some(result)
        } else {
            None // Graph has cycles
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn totp_graph() -> ModuleGraph {
        let mut graph = ModuleGraph::new();
        graph.add_module("totp", &["base32".to_string(), "verify".to_string()]);
        graph.add_module("base32", &[]);
        graph.add_module("verify", &["utils".to_string()]);
        graph
    }

    #[test]
    fn edges_both_directions() {
        let graph = totp_graph();
        assert_eq!(graph.parents("totp").len(), 2);
        assert_eq!(graph.children("utils"), vec![&"verify".to_string()]);
        assert!(graph.contains("utils"));
    }

    #[test]
    fn downstream_impact() {
        let graph = totp_graph();
        assert_eq!(graph.downstream("utils"), vec!["verify".to_string(), "totp".to_string()]);
        assert!(graph.downstream("totp").is_empty());
        assert!(graph.has_path("totp", "utils"));
        assert!(!graph.has_path("utils", "totp"));
    }

    #[test]
    fn topological_sort_puts_requirements_first() {
        let graph = totp_graph();
        let order = graph.topological_sort().unwrap();
        let pos = |n: &str| order.iter().position(|m| m == n).unwrap();

        assert!(pos("base32") < pos("totp"));
        assert!(pos("verify") < pos("totp"));
        assert!(pos("utils") < pos("verify"));
    }

    #[test]
    fn cycle_has_no_topological_order() {
        let mut graph = ModuleGraph::new();
        graph.add_module("a", &["b".to_string()]);
        graph.add_module("b", &["a".to_string()]);
        assert!(graph.topological_sort().is_none());
    }
}
