use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::graph::{Graph, OpKind};
use crate::tensor::Tensor;

use super::conv_bn::initializer_or_fail;
use super::{OpTarget, RewriteRule};

/// Fold a per-channel (or scalar) constant Mul into the preceding Conv by
/// scaling the weight along the output-channel axis, and the bias with it.
pub struct ConvMulFusion;

static TARGETS: [OpTarget; 1] = [OpTarget::new(OpKind::Conv, 1)];

/// Scalar factor, or one factor per output channel with size-1 in every
/// other dimension.
fn channel_broadcastable(factor: &Tensor, weight: &Tensor) -> bool {
    if factor.numel() == 1 {
        return true;
    }
    factor.shape().len() == weight.shape().len() - 1
        && factor.shape()[0] == weight.shape()[0]
        && factor.shape()[1..].iter().all(|&dim| dim == 1)
}

impl RewriteRule for ConvMulFusion {
    fn name(&self) -> &'static str {
        "conv_mul_fusion"
    }

    fn targets(&self) -> Option<&'static [OpTarget]> {
        Some(&TARGETS)
    }

    fn satisfied(&self, graph: &Graph, conv_index: usize) -> Result<bool> {
        let conv = graph.node(conv_index)?;
        if graph.output_edges_count(conv_index)? != 1 {
            return Ok(false);
        }
        let Some(mul_index) = graph.single_consumer(conv_index)? else {
            return Ok(false);
        };
        let mul = graph.node(mul_index)?;
        if !mul.is_op_version(OpKind::Mul, 7)
            || graph.input_edges_count(mul_index)? != 1
            || graph.node_outputs_in_graph_outputs(mul_index)?
        {
            return Ok(false);
        }
        if conv.inputs.len() < 2 || mul.inputs.len() != 2 {
            return Ok(false);
        }

        let Some(weight) = graph.initializer(&conv.inputs[1]) else {
            return Ok(false);
        };
        let Some(factor) = graph.initializer(&mul.inputs[1]) else {
            return Ok(false);
        };
        if !weight.dtype().is_float()
            || factor.dtype() != weight.dtype()
            || weight.shape().len() < 4
            || !channel_broadcastable(factor, weight)
        {
            return Ok(false);
        }

        if conv.inputs.len() == 3 && !conv.inputs[2].is_empty() {
            let Some(bias) = graph.initializer(&conv.inputs[2]) else {
                return Ok(false);
            };
            if bias.dtype() != factor.dtype()
                || bias.shape().len() != 1
                || (factor.numel() != 1 && bias.shape()[0] != factor.shape()[0])
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn apply(&self, graph: &mut Graph, conv_index: usize, modified: &mut bool) -> Result<()> {
        let mul_index = graph
            .single_consumer(conv_index)?
            .ok_or_else(|| anyhow!("conv consumer vanished"))?;
        let conv = graph.node(conv_index)?.clone();
        let mul = graph.node(mul_index)?.clone();

        let mut weight = initializer_or_fail(graph, &conv.inputs[1])?;
        let factor = initializer_or_fail(graph, &mul.inputs[1])?;

        weight.scale_by_channel(&factor)?;
        graph.remove_initializer(&conv.inputs[1])?;
        graph.add_initializer(conv.inputs[1].clone(), weight);

        if conv.inputs.len() == 3 && !conv.inputs[2].is_empty() {
            let mut bias = initializer_or_fail(graph, &conv.inputs[2])?;
            bias.mul_assign(&factor)?;
            graph.remove_initializer(&conv.inputs[2])?;
            graph.add_initializer(conv.inputs[2].clone(), bias);
        }

        let mut replacement = HashMap::new();
        replacement.insert(mul.outputs[0].clone(), conv.outputs[0].clone());
        let mut consumers = graph.consumers(&mul.outputs[0]);
        consumers.dedup();
        for consumer in consumers {
            graph.replace_defs(consumer, &replacement)?;
        }

        graph.remove_node(mul_index)?;
        *modified = true;
        Ok(())
    }
}
