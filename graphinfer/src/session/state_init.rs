//! Builds the immutable per-session execution state from a loaded graph:
//! rewrite pipeline, provider assignment, allocation plan, kernel
//! resolution, and nested subgraph states.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::error::EngineError;
use crate::exec::{plan, ExecutionProviders, SessionState};
use crate::graph::Graph;
use crate::ops;
use crate::rewrite::TransformerManager;
use crate::tensor::CPU_PROVIDER;

pub(crate) fn build_session_state(
    mut graph: Graph,
    providers: ExecutionProviders,
    transformers: Option<&TransformerManager>,
    enable_mem_pattern: bool,
    logid: String,
) -> Result<Arc<SessionState>> {
    if let Some(manager) = transformers {
        manager.apply_all(&mut graph)?;
    }
    if !graph.is_resolved() {
        graph.resolve()?;
    }

    // Single-provider placement: every node runs on the CPU provider. A
    // graph partitioner would assign providers per node here.
    for index in graph.node_indices() {
        graph.node_mut(index)?.provider = CPU_PROVIDER;
    }
    graph.resolve()?;

    // Nested graphs get their own session state; the node records which
    // outer-scope values it must pass through to them.
    let mut subgraphs = HashMap::new();
    let mut node_implicit_inputs: HashMap<usize, Vec<String>> = HashMap::new();
    for index in graph.node_indices() {
        let node = graph.node(index)?;
        for attr_name in node.attrs.graph_attr_names() {
            let Some(nested) = node.attrs.get_graph(&attr_name).cloned() else {
                continue;
            };
            let nested_logid = format!("{}/{}:{}", logid, node.name, attr_name);
            let nested_state = build_session_state(
                nested,
                providers.clone(),
                transformers,
                false,
                nested_logid,
            )?;

            let implicit = node_implicit_inputs.entry(index).or_default();
            for name in nested_state.external_inputs() {
                if !implicit.contains(name) {
                    implicit.push(name.clone());
                }
            }
            subgraphs.insert((index, attr_name), nested_state);
        }
    }

    // Values nested graphs read implicitly must survive the whole run.
    // Reads this scope cannot satisfy itself chain up to the next one.
    let mut pinned: HashSet<String> = HashSet::new();
    let mut external_inputs: Vec<String> = graph.implicit_inputs()?.to_vec();
    for names in node_implicit_inputs.values() {
        for name in names {
            pinned.insert(name.clone());
            let local = graph.is_initializer(name)
                || graph.inputs().contains(name)
                || graph.producer_of(name)?.is_some();
            if !local && !external_inputs.contains(name) {
                external_inputs.push(name.clone());
            }
        }
    }

    let plan = Arc::new(plan::build_plan(&graph, &pinned, &external_inputs)?);

    let mut kernels = HashMap::new();
    let mut queues = HashMap::new();
    for index in graph.node_indices() {
        let node = graph.node(index)?;
        let registration = ops::lookup_kernel(node.provider, node.op)?;
        if let Some(input) = node.present_inputs().next() {
            if let Some((dtype, _)) = graph.known_value(input) {
                if !registration.def.dtypes.contains(&dtype) {
                    return Err(EngineError::not_implemented(format!(
                        "kernel for {} does not support {} inputs",
                        node.op, dtype
                    )));
                }
            }
        }
        let kernel = (registration.factory)(node)
            .with_context(|| format!("creating kernel for node {}", node.name))?;
        kernels.insert(index, kernel);
        queues.insert(index, registration.def.exec_queue_id);
    }

    let mut initializer_values = HashMap::new();
    for (name, tensor) in graph.initializers() {
        let index = plan.index_of(name)?;
        initializer_values.insert(index, Arc::new(Mutex::new(tensor.clone())));
    }

    Ok(Arc::new(SessionState {
        graph,
        plan,
        kernels,
        queues,
        providers,
        initializer_values,
        node_implicit_inputs,
        external_inputs,
        subgraphs,
        enable_mem_pattern,
        pattern_cache: Mutex::new(HashMap::new()),
        logid,
    }))
}
