use std::collections::HashMap;

use anyhow::Result;

use crate::graph::{Graph, OpKind};

use super::{OpTarget, RewriteRule};

/// Remove Slice nodes whose bounds select the whole input: starts all zero
/// and ends at or past the end of every sliced axis (`i64::MAX`, the
/// negative to-end sentinel, or at least the axis size when it is known).
pub struct EliminateSlice;

static TARGETS: [OpTarget; 1] = [OpTarget::new(OpKind::Slice, 1)];

impl RewriteRule for EliminateSlice {
    fn name(&self) -> &'static str {
        "eliminate_slice"
    }

    fn targets(&self) -> Option<&'static [OpTarget]> {
        Some(&TARGETS)
    }

    fn satisfied(&self, graph: &Graph, node_index: usize) -> Result<bool> {
        let node = graph.node(node_index)?;
        if node.inputs.len() != 1 || node.outputs.len() != 1 {
            return Ok(false);
        }
        if graph.node_outputs_in_graph_outputs(node_index)? {
            return Ok(false);
        }

        let Some(starts) = node.attrs.get_ints("starts") else { return Ok(false) };
        let Some(ends) = node.attrs.get_ints("ends") else { return Ok(false) };
        if starts.len() != ends.len() {
            return Ok(false);
        }
        let axes: Vec<i64> = match node.attrs.get_ints("axes") {
            Some(axes) => {
                if axes.len() != starts.len() {
                    return Ok(false);
                }
                axes.to_vec()
            }
            None => (0..starts.len() as i64).collect(),
        };

        let input_shape = graph.known_value(&node.inputs[0]).map(|(_, dims)| dims);
        for (i, &axis) in axes.iter().enumerate() {
            if starts[i] != 0 {
                return Ok(false);
            }
            let end = ends[i];
            let covers_axis = end == i64::MAX
                || end == -1
                || input_shape
                    .as_ref()
                    .and_then(|dims| dims.get(axis as usize))
                    .map(|&dim| end >= dim as i64)
                    .unwrap_or(false);
            if !covers_axis {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn apply(&self, graph: &mut Graph, node_index: usize, modified: &mut bool) -> Result<()> {
        let (input, output) = {
            let node = graph.node(node_index)?;
            (node.inputs[0].clone(), node.outputs[0].clone())
        };

        let mut replacement = HashMap::new();
        replacement.insert(output.clone(), input);

        let mut consumers = graph.consumers(&output);
        consumers.dedup();
        for consumer in consumers {
            graph.replace_defs(consumer, &replacement)?;
        }

        graph.remove_node(node_index)?;
        *modified = true;
        Ok(())
    }
}
