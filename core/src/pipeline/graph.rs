//! Pipeline graph
//!
//! The `graph` field of a definition is a list of S-expressions over
//! element names: `(A B C)` is a linear chain, `(A (B D) (C D))` fans out
//! from A to B and C, both rejoining at D. A name appearing more than once
//! always refers to the same node. The combined graph must be acyclic.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::pipeline::definition::{ElementDefinition, PipelineDefinition};
use crate::sexpr::{self, SValue};
use crate::{Error, Result};

/// Directed acyclic graph over element names
#[derive(Debug, Clone, Default)]
pub struct PipelineGraph {
    /// Nodes in first-appearance order
    nodes: Vec<String>,
    /// node → successor nodes
    successors: HashMap<String, Vec<String>>,
    /// node → predecessor nodes
    predecessors: HashMap<String, Vec<String>>,
}

impl PipelineGraph {
    /// Build the combined graph from the definition's graph expressions
    pub fn from_expressions(expressions: &[String]) -> Result<Self> {
        let mut graph = Self::default();
        for expression in expressions {
            let parsed = sexpr::parse(expression)?;
            let SValue::List(terms) = parsed else {
                return Err(Error::Invariant(format!(
                    "graph expression is not a list: {}",
                    expression
                )));
            };
            graph.walk(&terms, None)?;
        }
        Ok(graph)
    }

    /// Walk one chain: symbols chain from the previous symbol, nested
    /// lists branch from it
    fn walk(&mut self, terms: &[SValue], entry: Option<&str>) -> Result<()> {
        let mut anchor: Option<String> = entry.map(str::to_string);
        for term in terms {
            match term {
                SValue::Symbol(name) => {
                    self.add_node(name);
                    if let Some(from) = &anchor {
                        self.add_edge(from, name);
                    }
                    anchor = Some(name.clone());
                }
                SValue::List(nested) => {
                    self.walk(nested, anchor.as_deref())?;
                }
                other => {
                    return Err(Error::Invariant(format!(
                        "graph expression term is not an element name: {}",
                        other
                    )));
                }
            }
        }
        Ok(())
    }

    fn add_node(&mut self, name: &str) {
        if !self.successors.contains_key(name) {
            self.nodes.push(name.to_string());
            self.successors.insert(name.to_string(), Vec::new());
            self.predecessors.insert(name.to_string(), Vec::new());
        }
    }

    fn add_edge(&mut self, from: &str, to: &str) {
        let successors = self.successors.entry(from.to_string()).or_default();
        if successors.iter().any(|s| s == to) {
            return;
        }
        successors.push(to.to_string());
        self.predecessors
            .entry(to.to_string())
            .or_default()
            .push(from.to_string());
    }

    /// Nodes in first-appearance order
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    /// Successors of a node
    pub fn successors(&self, name: &str) -> &[String] {
        self.successors.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Predecessors of a node
    pub fn predecessors(&self, name: &str) -> &[String] {
        self.predecessors
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Nodes with no inbound edges
    pub fn heads(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|name| self.predecessors(name).is_empty())
            .map(String::as_str)
            .collect()
    }

    /// Topological order (Kahn); first-appearance order breaks ties.
    /// A cycle is an invariant violation.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|name| (name.as_str(), self.predecessors(name).len()))
            .collect();
        let mut queue: VecDeque<&str> = self
            .nodes
            .iter()
            .filter(|name| in_degree[name.as_str()] == 0)
            .map(String::as_str)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(name) = queue.pop_front() {
            order.push(name.to_string());
            for successor in self.successors(name) {
                let degree = in_degree.get_mut(successor.as_str()).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(successor.as_str());
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck: Vec<&String> = self
                .nodes
                .iter()
                .filter(|name| !order.contains(*name))
                .collect();
            return Err(Error::Invariant(format!(
                "graph cycle involving {:?}",
                stuck
            )));
        }
        Ok(order)
    }

    /// Check the graph against the element definitions: every node
    /// defined, at most one head, port names across each edge line up.
    /// Port mismatches warn; they are not fatal.
    pub fn validate(&self, definition: &PipelineDefinition) -> Result<()> {
        let defined: HashSet<&str> = definition.elements.iter().map(|e| e.name.as_str()).collect();
        for name in &self.nodes {
            if !defined.contains(name.as_str()) {
                return Err(Error::Invariant(format!(
                    "graph references undefined element: {}",
                    name
                )));
            }
        }

        let heads = self.heads();
        if heads.len() > 1 {
            return Err(Error::Invariant(format!(
                "graph has more than one head: {:?}",
                heads
            )));
        }

        self.topological_order()?;

        for from in &self.nodes {
            let Some(from_def) = element(definition, from) else {
                continue;
            };
            for to in self.successors(from) {
                let Some(to_def) = element(definition, to) else {
                    continue;
                };
                self.check_ports(from_def, to_def);
            }
        }
        Ok(())
    }

    fn check_ports(&self, from: &ElementDefinition, to: &ElementDefinition) {
        let provided: Vec<_> = from.output.iter().collect();
        let bound = to
            .input
            .iter()
            .any(|input| provided.iter().any(|output| output.name == input.name));
        if !bound && !to.input.is_empty() {
            tracing::warn!(
                from = %from.name,
                to = %to.name,
                "no output port of {} matches an input port of {}",
                from.name,
                to.name
            );
        }
        for input in &to.input {
            if let Some(output) = provided.iter().find(|o| o.name == input.name) {
                if output.type_name != input.type_name {
                    tracing::warn!(
                        from = %from.name,
                        to = %to.name,
                        port = %input.name,
                        "port type mismatch: {} vs {}",
                        output.type_name,
                        input.type_name
                    );
                }
            }
        }
    }
}

fn element<'a>(
    definition: &'a PipelineDefinition,
    name: &str,
) -> Option<&'a ElementDefinition> {
    definition.elements.iter().find(|e| e.name == name)
}
