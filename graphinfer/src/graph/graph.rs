//! Typed DAG of tensor operations.
//!
//! Nodes live in an arena addressed by stable indices; removal leaves a
//! tombstone so indices held elsewhere stay valid. All cross-references are
//! value names or node indices, never pointers. After any mutation the graph
//! must be re-resolved before it is consumed downstream.

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tensor::{DType, Tensor};

use super::attr::Attributes;
use super::node::{Node, OpKind};
use super::shape;

/// Optional type and shape metadata for a named value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueInfo {
    pub name: String,
    pub dtype: Option<DType>,
    pub shape: Option<Vec<usize>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Graph {
    pub name: String,
    nodes: Vec<Option<Node>>,
    initializers: HashMap<String, Tensor>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    values: HashMap<String, ValueInfo>,
    /// Names this graph may read from an enclosing scope (subgraphs only).
    #[serde(default)]
    outer_scope: Vec<String>,

    // Resolve products.
    #[serde(skip)]
    topo: Vec<usize>,
    #[serde(skip)]
    producers: HashMap<String, usize>,
    #[serde(skip)]
    in_edges: Vec<usize>,
    #[serde(skip)]
    succ: Vec<Vec<usize>>,
    #[serde(skip)]
    implicit: Vec<String>,
    #[serde(skip)]
    resolved: bool,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Graph {
            name: name.into(),
            ..Graph::default()
        }
    }

    // ---- declaration ----

    /// Declare a graph input with optional metadata.
    pub fn add_input(&mut self, name: impl Into<String>, dtype: DType, shape: Option<Vec<usize>>) {
        let name = name.into();
        self.values.insert(
            name.clone(),
            ValueInfo {
                name: name.clone(),
                dtype: Some(dtype),
                shape,
            },
        );
        self.inputs.push(name);
        self.resolved = false;
    }

    pub fn add_output(&mut self, name: impl Into<String>) {
        self.outputs.push(name.into());
        self.resolved = false;
    }

    pub fn declare_value(&mut self, name: impl Into<String>, dtype: Option<DType>, shape: Option<Vec<usize>>) {
        let name = name.into();
        self.values.insert(
            name.clone(),
            ValueInfo { name, dtype, shape },
        );
    }

    pub fn set_outer_scope(&mut self, names: Vec<String>) {
        self.outer_scope = names;
        self.resolved = false;
    }

    // ---- nodes ----

    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        op: OpKind,
        inputs: Vec<String>,
        outputs: Vec<String>,
        attrs: Attributes,
    ) -> usize {
        let index = self.nodes.len();
        self.nodes.push(Some(Node {
            index,
            uuid: Uuid::new_v4(),
            name: name.into(),
            op,
            since_version: op.since_version(),
            inputs,
            outputs,
            attrs,
            provider: Default::default(),
        }));
        self.resolved = false;
        index
    }

    pub fn node(&self, index: usize) -> Result<&Node> {
        self.nodes
            .get(index)
            .and_then(|slot| slot.as_ref())
            .ok_or_else(|| anyhow!("no node at index {}", index))
    }

    pub fn node_mut(&mut self, index: usize) -> Result<&mut Node> {
        self.resolved = false;
        self.nodes
            .get_mut(index)
            .and_then(|slot| slot.as_mut())
            .ok_or_else(|| anyhow!("no node at index {}", index))
    }

    pub fn try_node(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index).and_then(|slot| slot.as_ref())
    }

    /// Live nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter_map(|slot| slot.as_ref())
    }

    pub fn node_indices(&self) -> Vec<usize> {
        self.nodes().map(|node| node.index).collect()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes().count()
    }

    /// Upper bound on node indices (dead slots included).
    pub fn max_node_index(&self) -> usize {
        self.nodes.len()
    }

    pub fn remove_node(&mut self, index: usize) -> Result<Node> {
        let node = self
            .nodes
            .get_mut(index)
            .and_then(|slot| slot.take())
            .ok_or_else(|| anyhow!("no node at index {}", index))?;
        self.resolved = false;
        Ok(node)
    }

    /// Rewrite value references on one node according to `map`.
    pub fn replace_defs(&mut self, index: usize, map: &HashMap<String, String>) -> Result<()> {
        let node = self.node_mut(index)?;
        for input in &mut node.inputs {
            if let Some(replacement) = map.get(input) {
                *input = replacement.clone();
            }
        }
        for output in &mut node.outputs {
            if let Some(replacement) = map.get(output) {
                *output = replacement.clone();
            }
        }
        Ok(())
    }

    // ---- initializers ----

    pub fn add_initializer(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.initializers.insert(name.into(), tensor);
        self.resolved = false;
    }

    pub fn initializer(&self, name: &str) -> Option<&Tensor> {
        self.initializers.get(name)
    }

    pub fn is_initializer(&self, name: &str) -> bool {
        self.initializers.contains_key(name)
    }

    pub fn remove_initializer(&mut self, name: &str) -> Result<Tensor> {
        self.resolved = false;
        self.initializers
            .remove(name)
            .ok_or_else(|| anyhow!("no initializer named {}", name))
    }

    pub fn initializers(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.initializers.iter()
    }

    // ---- queries ----

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    /// Graph inputs that are not covered by an initializer and therefore must
    /// be fed by the caller.
    pub fn required_inputs(&self) -> Vec<&String> {
        self.inputs
            .iter()
            .filter(|name| !self.initializers.contains_key(*name))
            .collect()
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn is_graph_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|out| out == name)
    }

    pub fn value_info(&self, name: &str) -> Option<&ValueInfo> {
        self.values.get(name)
    }

    /// Consumer node indices of `name`, one entry per consuming input slot.
    pub fn consumers(&self, name: &str) -> Vec<usize> {
        let mut out = Vec::new();
        for node in self.nodes() {
            for input in node.present_inputs() {
                if input == name {
                    out.push(node.index);
                }
            }
        }
        out
    }

    /// Total consumer references to any output of the node.
    pub fn output_edges_count(&self, index: usize) -> Result<usize> {
        let node = self.node(index)?;
        let mut count = 0;
        for output in node.present_outputs() {
            count += self.consumers(output).len();
        }
        Ok(count)
    }

    /// Number of this node's input slots fed by another node's output.
    pub fn input_edges_count(&self, index: usize) -> Result<usize> {
        let node = self.node(index)?;
        let mut count = 0;
        for input in node.present_inputs() {
            if self.find_producer(input).is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    fn find_producer(&self, name: &str) -> Option<usize> {
        if self.resolved {
            return self.producers.get(name).copied();
        }
        self.nodes()
            .find(|node| node.present_outputs().any(|out| out == name))
            .map(|node| node.index)
    }

    /// True when any of the node's outputs is a graph output.
    pub fn node_outputs_in_graph_outputs(&self, index: usize) -> Result<bool> {
        let node = self.node(index)?;
        Ok(node.present_outputs().any(|out| self.is_graph_output(out)))
    }

    /// The single consumer of the node's outputs, when exactly one edge
    /// leaves the node.
    pub fn single_consumer(&self, index: usize) -> Result<Option<usize>> {
        let node = self.node(index)?;
        let mut consumer = None;
        let mut edges = 0;
        for output in node.present_outputs() {
            for idx in self.consumers(output) {
                edges += 1;
                consumer = Some(idx);
            }
        }
        Ok(if edges == 1 { consumer } else { None })
    }

    /// Number of occurrences of each op type; used by transform tests.
    pub fn count_ops(&self) -> HashMap<OpKind, usize> {
        let mut out = HashMap::new();
        for node in self.nodes() {
            *out.entry(node.op).or_insert(0) += 1;
        }
        out
    }

    // ---- resolve ----

    /// Re-derive topological order, producer map, and edge counts; validate
    /// value references and propagate type/shape metadata.
    ///
    /// Any reference that is neither produced locally, an initializer, a
    /// graph input, nor already-declared metadata is recorded as an implicit
    /// (outer-scope) input; the session rejects those for the main graph.
    pub fn resolve(&mut self) -> Result<()> {
        let live: Vec<usize> = self.node_indices();

        // Deserialized nodes may omit the operator-set version.
        for &idx in &live {
            if let Some(node) = self.nodes[idx].as_mut() {
                if node.since_version == 0 {
                    node.since_version = node.op.since_version();
                }
            }
        }

        // Drop initializers nothing references anymore (rewrites orphan
        // them). Nested graphs may reach outer initializers implicitly, so
        // their references count too.
        let mut referenced: HashSet<String> = HashSet::new();
        for &idx in &live {
            collect_input_refs(self.node(idx)?, &mut referenced);
        }
        referenced.extend(self.inputs.iter().cloned());
        referenced.extend(self.outputs.iter().cloned());
        self.initializers.retain(|name, _| referenced.contains(name));

        // Producer map; output names must be unique.
        let mut producers: HashMap<String, usize> = HashMap::new();
        for &idx in &live {
            let node = self.node(idx)?;
            for output in node.present_outputs() {
                if producers.insert(output.clone(), idx).is_some() {
                    return Err(anyhow!("duplicate output definition {}", output));
                }
            }
        }

        // Classify every input reference.
        let mut implicit = Vec::new();
        for &idx in &live {
            let node = self.node(idx)?;
            for input in node.present_inputs() {
                if producers.contains_key(input)
                    || self.initializers.contains_key(input)
                    || self.inputs.contains(input)
                {
                    continue;
                }
                if !implicit.contains(input) {
                    implicit.push(input.clone());
                }
            }
        }

        // A subgraph that declares its outer scope may only reach through it.
        if !self.outer_scope.is_empty() {
            for name in &implicit {
                if !self.outer_scope.contains(name) {
                    return Err(anyhow!(
                        "value {} is not declared in the outer scope of graph {}",
                        name,
                        self.name
                    ));
                }
            }
        }

        // Graph outputs must exist somewhere.
        for output in &self.outputs {
            if !producers.contains_key(output)
                && !self.initializers.contains_key(output)
                && !self.inputs.contains(output)
            {
                return Err(anyhow!("graph output {} is not produced", output));
            }
        }

        // Edges: one per input slot fed by another node.
        let len = self.nodes.len();
        let mut in_edges = vec![0usize; len];
        let mut succ: Vec<Vec<usize>> = vec![Vec::new(); len];
        for &idx in &live {
            let node = self.node(idx)?;
            for input in node.present_inputs() {
                if let Some(&producer) = producers.get(input) {
                    in_edges[idx] += 1;
                    succ[producer].push(idx);
                }
            }
        }

        // Kahn topological sort over live nodes.
        let mut degree = in_edges.clone();
        let mut queue: VecDeque<usize> = live
            .iter()
            .copied()
            .filter(|&idx| degree[idx] == 0)
            .collect();
        let mut topo = Vec::with_capacity(live.len());
        while let Some(idx) = queue.pop_front() {
            topo.push(idx);
            for &next in &succ[idx] {
                degree[next] -= 1;
                if degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }
        if topo.len() != live.len() {
            return Err(anyhow!("graph contains a cycle"));
        }

        self.producers = producers;
        self.in_edges = in_edges;
        self.succ = succ;
        self.implicit = implicit;
        self.topo = topo;
        self.resolved = true;

        self.propagate_shapes()?;
        Ok(())
    }

    fn propagate_shapes(&mut self) -> Result<()> {
        let order = self.topo.clone();
        for idx in order {
            let node = self.node(idx)?.clone();
            let inferred = shape::infer_node(self, &node)?;
            for (output, info) in node.present_outputs().zip(inferred) {
                if let Some((dtype, dims)) = info {
                    self.values.insert(
                        output.clone(),
                        ValueInfo {
                            name: output.clone(),
                            dtype: Some(dtype),
                            shape: Some(dims),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Best-known dtype and shape for a value, from initializers or metadata.
    pub(crate) fn known_value(&self, name: &str) -> Option<(DType, Vec<usize>)> {
        if let Some(tensor) = self.initializers.get(name) {
            return Some((tensor.dtype(), tensor.shape().to_vec()));
        }
        match self.values.get(name) {
            Some(ValueInfo {
                dtype: Some(dtype),
                shape: Some(dims),
                ..
            }) => Some((*dtype, dims.clone())),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    fn require_resolved(&self) -> Result<()> {
        if !self.resolved {
            return Err(anyhow!("graph {} has not been resolved", self.name));
        }
        Ok(())
    }

    /// Node indices in a valid execution order.
    pub fn topo_order(&self) -> Result<&[usize]> {
        self.require_resolved()?;
        Ok(&self.topo)
    }

    /// In-edge count computed by the last resolve.
    pub fn in_edge_count(&self, index: usize) -> Result<usize> {
        self.require_resolved()?;
        self.in_edges
            .get(index)
            .copied()
            .ok_or_else(|| anyhow!("no node at index {}", index))
    }

    /// Successor node indices, one entry per consuming input slot.
    pub fn successors(&self, index: usize) -> Result<&[usize]> {
        self.require_resolved()?;
        self.succ
            .get(index)
            .map(|v| v.as_slice())
            .ok_or_else(|| anyhow!("no node at index {}", index))
    }

    pub fn producer_of(&self, name: &str) -> Result<Option<usize>> {
        self.require_resolved()?;
        Ok(self.producers.get(name).copied())
    }

    /// Values this graph reads from the enclosing scope, per the last
    /// resolve. Empty for a well-formed main graph.
    pub fn implicit_inputs(&self) -> Result<&[String]> {
        self.require_resolved()?;
        Ok(&self.implicit)
    }
}

/// Every value name a node reads, including reads made by its nested
/// graphs (which may reach into this scope).
fn collect_input_refs(node: &Node, into: &mut HashSet<String>) {
    for input in node.present_inputs() {
        into.insert(input.clone());
    }
    for attr_name in node.attrs.graph_attr_names() {
        if let Some(nested) = node.attrs.get_graph(&attr_name) {
            for nested_node in nested.nodes() {
                collect_input_refs(nested_node, into);
            }
        }
    }
}
