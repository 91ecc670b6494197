use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::graph::{Graph, OpKind};
use crate::tensor::Tensor;

use super::{OpTarget, RewriteRule};

/// Fold BatchNormalization into the preceding Conv using the
/// epsilon-stable closed form: with `s = scale / sqrt(var + epsilon)`, the
/// weight is scaled by `s` along the output-channel axis and the bias
/// becomes `(b - mean) * s + B` (synthesized from `B - mean * s` when the
/// Conv had none).
pub struct ConvBnFusion;

static TARGETS: [OpTarget; 1] = [OpTarget::new(OpKind::Conv, 1)];

pub(super) fn initializer_or_fail(graph: &Graph, name: &str) -> Result<Tensor> {
    graph
        .initializer(name)
        .cloned()
        .ok_or_else(|| anyhow!("initializer {} disappeared mid-rewrite", name))
}

fn float_vector(tensor: Option<&Tensor>) -> Option<&Tensor> {
    tensor.filter(|t| t.dtype().is_float() && t.shape().len() == 1)
}

impl RewriteRule for ConvBnFusion {
    fn name(&self) -> &'static str {
        "conv_bn_fusion"
    }

    fn targets(&self) -> Option<&'static [OpTarget]> {
        Some(&TARGETS)
    }

    fn satisfied(&self, graph: &Graph, conv_index: usize) -> Result<bool> {
        let conv = graph.node(conv_index)?;
        if graph.output_edges_count(conv_index)? != 1 {
            return Ok(false);
        }
        let Some(bn_index) = graph.single_consumer(conv_index)? else {
            return Ok(false);
        };
        let bn = graph.node(bn_index)?;
        if !bn.is_op_version(OpKind::BatchNormalization, 7)
            || graph.input_edges_count(bn_index)? != 1
            || graph.node_outputs_in_graph_outputs(bn_index)?
        {
            return Ok(false);
        }
        if conv.attrs.get_int("group").map(|g| g != 1).unwrap_or(false) {
            return Ok(false);
        }
        if bn.inputs.len() != 5 || conv.inputs.len() < 2 {
            return Ok(false);
        }

        let Some(scale) = float_vector(graph.initializer(&bn.inputs[1])) else {
            return Ok(false);
        };
        let Some(bn_b) = float_vector(graph.initializer(&bn.inputs[2])) else {
            return Ok(false);
        };
        let Some(mean) = float_vector(graph.initializer(&bn.inputs[3])) else {
            return Ok(false);
        };
        let Some(var) = float_vector(graph.initializer(&bn.inputs[4])) else {
            return Ok(false);
        };
        let Some(weight) = graph.initializer(&conv.inputs[1]) else {
            return Ok(false);
        };

        let channels = scale.shape()[0];
        let params_agree = [bn_b, mean, var]
            .iter()
            .all(|t| t.shape()[0] == channels && t.dtype() == scale.dtype());
        if !params_agree
            || weight.dtype() != scale.dtype()
            || weight.shape().len() <= 2
            || weight.shape()[0] != channels
        {
            return Ok(false);
        }

        if conv.inputs.len() == 3 && !conv.inputs[2].is_empty() {
            let Some(bias) = float_vector(graph.initializer(&conv.inputs[2])) else {
                return Ok(false);
            };
            if bias.shape()[0] != channels || bias.dtype() != bn_b.dtype() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn apply(&self, graph: &mut Graph, conv_index: usize, modified: &mut bool) -> Result<()> {
        let bn_index = graph
            .single_consumer(conv_index)?
            .ok_or_else(|| anyhow!("conv consumer vanished"))?;
        let conv = graph.node(conv_index)?.clone();
        let bn = graph.node(bn_index)?.clone();

        let epsilon = bn.attrs.get_float("epsilon").unwrap_or(1e-5) as f64;
        let mut scale = initializer_or_fail(graph, &bn.inputs[1])?;
        let mut bn_b = initializer_or_fail(graph, &bn.inputs[2])?;
        let mut mean = initializer_or_fail(graph, &bn.inputs[3])?;
        let mut var = initializer_or_fail(graph, &bn.inputs[4])?;
        let mut weight = initializer_or_fail(graph, &conv.inputs[1])?;

        // s = scale / sqrt(var + epsilon)
        var.add_scalar(epsilon)?;
        var.sqrt_inplace()?;
        scale.div_assign(&var)?;
        weight.scale_by_channel(&scale)?;

        let has_bias = conv.inputs.len() == 3 && !conv.inputs[2].is_empty();
        if has_bias {
            let mut bias = initializer_or_fail(graph, &conv.inputs[2])?;
            bias.sub_assign(&mean)?;
            bias.mul_assign(&scale)?;
            bias.add_assign(&bn_b)?;
            graph.remove_initializer(&conv.inputs[2])?;
            graph.add_initializer(conv.inputs[2].clone(), bias);
        } else {
            // Synthesize the bias under BN's B definition and hand it to Conv.
            mean.mul_assign(&scale)?;
            bn_b.sub_assign(&mean)?;
            let bias_name = bn.inputs[2].clone();
            graph.remove_initializer(&bias_name)?;
            graph.add_initializer(bias_name.clone(), bn_b);
            graph.node_mut(conv_index)?.inputs.push(bias_name);
        }

        graph.remove_initializer(&conv.inputs[1])?;
        graph.add_initializer(conv.inputs[1].clone(), weight);

        let mut replacement = HashMap::new();
        replacement.insert(bn.outputs[0].clone(), conv.outputs[0].clone());
        let mut consumers = graph.consumers(&bn.outputs[0]);
        consumers.dedup();
        for consumer in consumers {
            graph.replace_defs(consumer, &replacement)?;
        }

        graph.remove_node(bn_index)?;
        *modified = true;
        Ok(())
    }
}
