//! Allocation plan derived from a resolved graph: dense value indices,
//! per-value locations, lifetime intervals, and the scheduling skeleton the
//! executors consume.

use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::graph::Graph;
use crate::tensor::MemoryInfo;

/// How a value comes into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Fed by the caller (graph input or outer-scope implicit input).
    GraphInput,
    /// Constant tensor owned by the graph.
    Initializer,
    /// Produced by a node during the run.
    Computed,
}

/// Lifetime endpoint for values that must survive the whole run.
pub const LIFETIME_END: usize = usize::MAX;

#[derive(Debug)]
pub struct SequentialPlan {
    /// Value name -> dense index.
    pub index_map: HashMap<String, usize>,
    /// Dense index -> value name.
    pub names: Vec<String>,
    pub kinds: Vec<ValueKind>,
    pub locations: Vec<MemoryInfo>,
    /// (first-use, last-use) in topological positions. Graph outputs are
    /// pinned to `LIFETIME_END`.
    pub lifetimes: Vec<(usize, usize)>,
    /// Number of consuming input slots per value; drives early release.
    pub consumer_counts: Vec<usize>,
    /// Node indices in execution order.
    pub topo: Vec<usize>,
    /// Node index -> position in `topo`.
    pub node_positions: HashMap<usize, usize>,
    /// Per node index: successor node indices, one per consuming slot.
    pub successors: Vec<Vec<usize>>,
    /// Per node index: in-edge count, the initial ready refcount.
    pub initial_refs: Vec<usize>,
    /// Nodes with no in-edges; the executor's starting set.
    pub roots: Vec<usize>,
}

impl SequentialPlan {
    pub fn num_values(&self) -> usize {
        self.names.len()
    }

    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.index_map
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("unknown value name {}", name))
    }
}

/// Build the allocation plan for a resolved graph. Values named in `pinned`
/// (outer-scope inputs of nested graphs) keep end-of-run lifetimes;
/// `extra_inputs` are names nested graphs need that this scope itself must
/// receive from an enclosing one.
pub fn build_plan(
    graph: &Graph,
    pinned: &std::collections::HashSet<String>,
    extra_inputs: &[String],
) -> Result<SequentialPlan> {
    let topo = graph.topo_order()?.to_vec();
    let mut node_positions = HashMap::new();
    for (pos, &idx) in topo.iter().enumerate() {
        node_positions.insert(idx, pos);
    }

    let mut index_map: HashMap<String, usize> = HashMap::new();
    let mut names = Vec::new();
    let mut kinds = Vec::new();
    let mut intern = |name: &str, kind: ValueKind, names: &mut Vec<String>, kinds: &mut Vec<ValueKind>| {
        if let Some(&idx) = index_map.get(name) {
            return idx;
        }
        let idx = names.len();
        index_map.insert(name.to_string(), idx);
        names.push(name.to_string());
        kinds.push(kind);
        idx
    };

    // Initializers take precedence over same-named graph inputs.
    let mut initializer_names: Vec<&String> = graph.initializers().map(|(name, _)| name).collect();
    initializer_names.sort();
    for name in initializer_names {
        intern(name, ValueKind::Initializer, &mut names, &mut kinds);
    }
    for name in graph.inputs() {
        intern(name, ValueKind::GraphInput, &mut names, &mut kinds);
    }
    for name in graph.implicit_inputs()? {
        intern(name, ValueKind::GraphInput, &mut names, &mut kinds);
    }
    for name in extra_inputs {
        intern(name, ValueKind::GraphInput, &mut names, &mut kinds);
    }
    for &idx in &topo {
        let node = graph.node(idx)?;
        for output in node.present_outputs() {
            intern(output, ValueKind::Computed, &mut names, &mut kinds);
        }
    }
    // Inputs of nodes must all be known by now; anything else is a planning bug.
    for &idx in &topo {
        let node = graph.node(idx)?;
        for input in node.present_inputs() {
            if !index_map.contains_key(input) {
                return Err(anyhow!("value {} missing from allocation plan", input));
            }
        }
    }

    let num_values = names.len();
    let mut locations = vec![MemoryInfo::cpu_default(); num_values];
    for output in graph.outputs() {
        if let Some(&idx) = index_map.get(output) {
            locations[idx] = MemoryInfo::cpu_output();
        }
    }

    // Lifetimes and consumer counts.
    let mut lifetimes = vec![(0usize, 0usize); num_values];
    let mut consumer_counts = vec![0usize; num_values];
    for (value_idx, name) in names.iter().enumerate() {
        let first = match kinds[value_idx] {
            ValueKind::Computed => graph
                .producer_of(name)?
                .and_then(|node| node_positions.get(&node).copied())
                .unwrap_or(0),
            _ => 0,
        };
        let mut last = first;
        let consumers = graph.consumers(name);
        consumer_counts[value_idx] = consumers.len();
        for consumer in consumers {
            if let Some(&pos) = node_positions.get(&consumer) {
                last = last.max(pos);
            }
        }
        if graph.is_graph_output(name) || pinned.contains(name) {
            last = LIFETIME_END;
        }
        lifetimes[value_idx] = (first, last);
    }

    let max_index = graph.max_node_index();
    let mut successors = vec![Vec::new(); max_index];
    let mut initial_refs = vec![0usize; max_index];
    let mut roots = Vec::new();
    for &idx in &topo {
        successors[idx] = graph.successors(idx)?.to_vec();
        initial_refs[idx] = graph.in_edge_count(idx)?;
        if initial_refs[idx] == 0 {
            roots.push(idx);
        }
    }

    Ok(SequentialPlan {
        index_map,
        names,
        kinds,
        locations,
        lifetimes,
        consumer_counts,
        topo,
        node_positions,
        successors,
        initial_refs,
        roots,
    })
}
