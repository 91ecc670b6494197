use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::exec::sequential::execute_subgraph;
use crate::exec::{CpuExecutionProvider, ExecutionProviders};
use crate::graph::{Graph, OpKind};
use crate::ops;
use crate::session::build_session_state;
use crate::tensor::Tensor;

use super::{OpTarget, RewriteRule};

/// Evaluate nodes whose inputs are all initializers by invoking the kernel
/// offline, replacing the node with initializers holding its outputs.
///
/// Only all-initializer nodes are folded; the pass does not propagate
/// through shape-changing ops beyond what repeated fixed-point passes give
/// for free.
pub struct ConstantFolding;

impl RewriteRule for ConstantFolding {
    fn name(&self) -> &'static str {
        "constant_folding"
    }

    fn targets(&self) -> Option<&'static [OpTarget]> {
        // Any op with a kernel is a candidate.
        None
    }

    fn satisfied(&self, graph: &Graph, node_index: usize) -> Result<bool> {
        let node = graph.node(node_index)?;
        // Subgraph-carrying ops are not folded.
        if node.op == OpKind::If {
            return Ok(false);
        }
        if node.inputs.is_empty() || node.present_outputs().count() == 0 {
            return Ok(false);
        }
        if graph.input_edges_count(node_index)? > 0 {
            return Ok(false);
        }
        for input in node.present_inputs() {
            if !graph.is_initializer(input) {
                return Ok(false);
            }
        }
        Ok(ops::lookup_kernel(node.provider, node.op).is_ok())
    }

    fn apply(&self, graph: &mut Graph, node_index: usize, modified: &mut bool) -> Result<()> {
        // Evaluate first; the graph is only touched once the kernel ran.
        let folded = run_node_offline(graph, node_index)?;
        for (name, tensor) in folded {
            graph.add_initializer(name, tensor);
        }
        graph.remove_node(node_index)?;
        *modified = true;
        Ok(())
    }
}

/// Run a single node against its initializer inputs in a throwaway
/// single-node session.
fn run_node_offline(graph: &Graph, node_index: usize) -> Result<Vec<(String, Tensor)>> {
    let node = graph.node(node_index)?;

    let mut mini = Graph::new("constant_folding");
    for input in node.present_inputs() {
        let tensor = graph
            .initializer(input)
            .ok_or_else(|| anyhow!("constant folding expects initializer {}", input))?
            .clone();
        mini.add_initializer(input.clone(), tensor);
    }
    mini.add_node(
        node.name.clone(),
        node.op,
        node.inputs.clone(),
        node.outputs.clone(),
        node.attrs.clone(),
    );
    let output_names: Vec<String> = node.present_outputs().cloned().collect();
    for output in &output_names {
        mini.add_output(output.clone());
    }
    mini.resolve()?;

    let mut providers = ExecutionProviders::new();
    providers.add(Arc::new(CpuExecutionProvider::new(false)));
    let state = build_session_state(mini, providers, None, false, "constant_folding".to_string())?;

    let results = execute_subgraph(&state, &HashMap::new(), &AtomicBool::new(false))?;
    let mut folded = Vec::with_capacity(results.len());
    for (name, value) in output_names.into_iter().zip(results) {
        folded.push((name, value.to_tensor()?));
    }
    Ok(folded)
}
