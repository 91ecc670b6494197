use std::collections::HashMap;

use anyhow::Result;

use crate::graph::{Graph, OpKind};

use super::{OpTarget, RewriteRule};

/// Remove Identity nodes, rewiring every consumer of the identity's output
/// to read the identity's input directly.
pub struct EliminateIdentity;

static TARGETS: [OpTarget; 1] = [OpTarget::new(OpKind::Identity, 1)];

impl RewriteRule for EliminateIdentity {
    fn name(&self) -> &'static str {
        "eliminate_identity"
    }

    fn targets(&self) -> Option<&'static [OpTarget]> {
        Some(&TARGETS)
    }

    fn satisfied(&self, graph: &Graph, node: usize) -> Result<bool> {
        // Rewiring would lose the output name if it were a graph output.
        Ok(!graph.node_outputs_in_graph_outputs(node)?)
    }

    fn apply(&self, graph: &mut Graph, node: usize, modified: &mut bool) -> Result<()> {
        let (input, output) = {
            let node = graph.node(node)?;
            (node.inputs[0].clone(), node.outputs[0].clone())
        };

        let mut replacement = HashMap::new();
        replacement.insert(output.clone(), input);

        let mut consumers = graph.consumers(&output);
        consumers.dedup();
        for consumer in consumers {
            graph.replace_defs(consumer, &replacement)?;
        }

        graph.remove_node(node)?;
        *modified = true;
        Ok(())
    }
}
