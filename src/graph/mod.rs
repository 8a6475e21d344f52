//! Resource dependency graph
//!
//! Nodes are resource names, edges point from a resource to the resources
//! it depends on. The execution order is a topological sort that breaks
//! ties by declaration order, so the same stack always runs the same way.

pub mod trigger;

pub use trigger::{Freshness, TriggerToken};

use std::collections::{BTreeSet, HashMap};

use crate::DeployError;

#[derive(Debug, Clone)]
struct Node {
    name: String,
    dependencies: Vec<String>,
}

/// Declared resources and their "depends on" edges
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a resource and the resources it depends on
    pub fn add(&mut self, name: &str, dependencies: &[String]) -> Result<(), DeployError> {
        if self.index.contains_key(name) {
            return Err(DeployError::Graph(format!(
                "resource '{name}' is declared twice"
            )));
        }
        self.index.insert(name.to_string(), self.nodes.len());
        self.nodes.push(Node {
            name: name.to_string(),
            dependencies: dependencies.to_vec(),
        });
        Ok(())
    }

    /// Direct dependencies of `name`
    pub fn dependencies(&self, name: &str) -> Option<BTreeSet<&str>> {
        self.index.get(name).map(|&i| {
            self.nodes[i]
                .dependencies
                .iter()
                .map(String::as_str)
                .collect()
        })
    }

    /// Every resource `name` transitively depends on
    pub fn ancestors(&self, name: &str) -> Option<BTreeSet<&str>> {
        let start = *self.index.get(name)?;
        let mut seen = BTreeSet::new();
        let mut stack = vec![start];

        while let Some(i) = stack.pop() {
            for dep in &self.nodes[i].dependencies {
                if let Some(&j) = self.index.get(dep) {
                    if seen.insert(self.nodes[j].name.as_str()) {
                        stack.push(j);
                    }
                }
            }
        }

        Some(seen)
    }

    /// Execution order: every resource after all of its dependencies
    pub fn topological_order(&self) -> Result<Vec<String>, DeployError> {
        let mut remaining_deps = Vec::with_capacity(self.nodes.len());
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];

        for (i, node) in self.nodes.iter().enumerate() {
            let mut unique = BTreeSet::new();
            for dep in &node.dependencies {
                let j = *self.index.get(dep).ok_or_else(|| {
                    DeployError::Graph(format!(
                        "resource '{}' depends on undeclared resource '{}'",
                        node.name, dep
                    ))
                })?;
                if j == i {
                    return Err(DeployError::Graph(format!(
                        "resource '{}' depends on itself",
                        node.name
                    )));
                }
                unique.insert(j);
            }
            for &j in &unique {
                dependents[j].push(i);
            }
            remaining_deps.push(unique.len());
        }

        // Ready set keyed by declaration index keeps the order stable.
        let mut ready: BTreeSet<usize> = remaining_deps
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(i) = ready.pop_first() {
            order.push(self.nodes[i].name.clone());
            for &d in &dependents[i] {
                remaining_deps[d] -= 1;
                if remaining_deps[d] == 0 {
                    ready.insert(d);
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck: Vec<&str> = self
                .nodes
                .iter()
                .enumerate()
                .filter(|(i, _)| remaining_deps[*i] > 0)
                .map(|(_, n)| n.name.as_str())
                .collect();
            return Err(DeployError::Graph(format!(
                "dependency cycle among: {}",
                stuck.join(", ")
            )));
        }

        Ok(order)
    }
}
