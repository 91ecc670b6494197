use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::graph::{Graph, OpKind};
use crate::tensor::{DType, Tensor};

use super::conv_bn::initializer_or_fail;
use super::{OpTarget, RewriteRule};

/// Fold a per-channel (or scalar) constant Add into the preceding Conv's
/// bias, synthesizing a bias when the Conv had none.
pub struct ConvAddFusion;

static TARGETS: [OpTarget; 1] = [OpTarget::new(OpKind::Conv, 1)];

fn channel_broadcastable(addend: &Tensor, weight: &Tensor) -> bool {
    if addend.numel() == 1 {
        return true;
    }
    addend.shape().len() == weight.shape().len() - 1
        && addend.shape()[0] == weight.shape()[0]
        && addend.shape()[1..].iter().all(|&dim| dim == 1)
}

impl RewriteRule for ConvAddFusion {
    fn name(&self) -> &'static str {
        "conv_add_fusion"
    }

    fn targets(&self) -> Option<&'static [OpTarget]> {
        Some(&TARGETS)
    }

    fn satisfied(&self, graph: &Graph, conv_index: usize) -> Result<bool> {
        let conv = graph.node(conv_index)?;
        if graph.output_edges_count(conv_index)? != 1 {
            return Ok(false);
        }
        let Some(add_index) = graph.single_consumer(conv_index)? else {
            return Ok(false);
        };
        let add = graph.node(add_index)?;
        if !add.is_op_version(OpKind::Add, 7)
            || graph.input_edges_count(add_index)? != 1
            || graph.node_outputs_in_graph_outputs(add_index)?
        {
            return Ok(false);
        }
        if conv.inputs.len() < 2 || add.inputs.len() != 2 {
            return Ok(false);
        }

        let Some(weight) = graph.initializer(&conv.inputs[1]) else {
            return Ok(false);
        };
        let Some(addend) = graph.initializer(&add.inputs[1]) else {
            return Ok(false);
        };
        if !weight.dtype().is_float()
            || addend.dtype() != weight.dtype()
            || weight.shape().len() < 4
            || !channel_broadcastable(addend, weight)
        {
            return Ok(false);
        }

        if conv.inputs.len() == 3 && !conv.inputs[2].is_empty() {
            let Some(bias) = graph.initializer(&conv.inputs[2]) else {
                return Ok(false);
            };
            if bias.dtype() != addend.dtype()
                || bias.shape().len() != 1
                || bias.shape()[0] != weight.shape()[0]
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn apply(&self, graph: &mut Graph, conv_index: usize, modified: &mut bool) -> Result<()> {
        let add_index = graph
            .single_consumer(conv_index)?
            .ok_or_else(|| anyhow!("conv consumer vanished"))?;
        let conv = graph.node(conv_index)?.clone();
        let add = graph.node(add_index)?.clone();

        let weight = initializer_or_fail(graph, &conv.inputs[1])?;
        let addend = initializer_or_fail(graph, &add.inputs[1])?;
        let channels = weight.shape()[0];

        if conv.inputs.len() == 3 && !conv.inputs[2].is_empty() {
            let mut bias = initializer_or_fail(graph, &conv.inputs[2])?;
            bias.add_assign(&addend)?;
            graph.remove_initializer(&conv.inputs[2])?;
            graph.add_initializer(conv.inputs[2].clone(), bias);
        } else {
            // Synthesize a [C] bias under the Add constant's definition.
            let bias = broadcast_to_channels(&addend, channels)?;
            let bias_name = add.inputs[1].clone();
            graph.remove_initializer(&bias_name)?;
            graph.add_initializer(bias_name.clone(), bias);
            graph.node_mut(conv_index)?.inputs.push(bias_name);
        }

        let mut replacement = HashMap::new();
        replacement.insert(add.outputs[0].clone(), conv.outputs[0].clone());
        let mut consumers = graph.consumers(&add.outputs[0]);
        consumers.dedup();
        for consumer in consumers {
            graph.replace_defs(consumer, &replacement)?;
        }

        graph.remove_node(add_index)?;
        *modified = true;
        Ok(())
    }
}

fn broadcast_to_channels(addend: &Tensor, channels: usize) -> Result<Tensor> {
    if addend.numel() == channels {
        let mut bias = addend.clone();
        bias.reshape(&[channels])?;
        return Ok(bias);
    }
    match addend.dtype() {
        DType::F32 => {
            let value = addend.as_slice::<f32>()?[0];
            Tensor::from_vec(vec![value; channels], &[channels])
        }
        DType::F64 => {
            let value = addend.as_slice::<f64>()?[0];
            Tensor::from_vec(vec![value; channels], &[channels])
        }
        dtype => Err(anyhow!("unsupported Conv/Add fusion over {}", dtype)),
    }
}
