use anyhow::{anyhow, Result};

use crate::graph::shape::unsqueeze_shape;
use crate::graph::{Graph, OpKind};

use super::{OpTarget, RewriteRule};

/// Fold Unsqueeze of an initializer into the initializer itself: the
/// constant is re-registered under the node's output name with size-1
/// dimensions inserted at the attribute axes.
///
/// Runs before the Conv fusions so per-channel factors expressed through an
/// Unsqueeze look scalar-broadcast-compatible to them.
pub struct UnsqueezeElimination;

static TARGETS: [OpTarget; 1] = [OpTarget::new(OpKind::Unsqueeze, 1)];

impl RewriteRule for UnsqueezeElimination {
    fn name(&self) -> &'static str {
        "unsqueeze_elimination"
    }

    fn targets(&self) -> Option<&'static [OpTarget]> {
        Some(&TARGETS)
    }

    fn satisfied(&self, graph: &Graph, node_index: usize) -> Result<bool> {
        let node = graph.node(node_index)?;
        if node.attrs.get_ints("axes").is_none() {
            return Ok(false);
        }
        let input = &node.inputs[0];
        // The constant must have no other readers: it changes shape.
        Ok(graph.is_initializer(input) && graph.consumers(input).len() == 1)
    }

    fn apply(&self, graph: &mut Graph, node_index: usize, modified: &mut bool) -> Result<()> {
        let (input, output, axes) = {
            let node = graph.node(node_index)?;
            let axes = node
                .attrs
                .get_ints("axes")
                .ok_or_else(|| anyhow!("Unsqueeze requires axes"))?
                .to_vec();
            (node.inputs[0].clone(), node.outputs[0].clone(), axes)
        };

        let mut tensor = graph.remove_initializer(&input)?;
        let new_shape = unsqueeze_shape(&axes, tensor.shape())?;
        tensor.reshape(&new_shape)?;
        graph.add_initializer(output, tensor);

        graph.remove_node(node_index)?;
        *modified = true;
        Ok(())
    }
}
