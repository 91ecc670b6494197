//! Conditional subgraph execution.

use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::error::EngineError;
use crate::exec::sequential::execute_subgraph;
use crate::graph::{Node, OpKind};
use crate::ops::{lock_tensor, KernelContext, KernelRegistration, OpKernel};

pub(crate) fn register(map: &mut HashMap<OpKind, KernelRegistration>) {
    map.insert(
        OpKind::If,
        KernelRegistration::cpu(OpKind::If, super::NUMERIC_TYPES, If::create),
    );
}

struct If;

impl If {
    fn create(node: &Node) -> Result<Box<dyn OpKernel>> {
        for branch in ["then_branch", "else_branch"] {
            if node.attrs.get_graph(branch).is_none() {
                return Err(EngineError::invalid_argument(format!(
                    "If node {} is missing subgraph attribute {}",
                    node.name, branch
                )));
            }
        }
        Ok(Box::new(If))
    }
}

impl OpKernel for If {
    fn compute(&self, ctx: &KernelContext) -> Result<()> {
        let cond = ctx.input(0)?;
        let cond = lock_tensor(&cond)?.scalar_i64()? != 0;
        let branch = if cond { "then_branch" } else { "else_branch" };

        let state = ctx.subgraph_state(branch).ok_or_else(|| {
            anyhow!(
                "no session state prepared for subgraph {} of node {}",
                branch,
                ctx.node().name
            )
        })?;

        // The nested graph sees outer-scope values through implicit inputs.
        let mut feeds = HashMap::new();
        for name in state.external_inputs() {
            feeds.insert(name.clone(), ctx.implicit_input(name)?);
        }

        let results = execute_subgraph(&state, &feeds, ctx.terminate_flag())?;
        for (index, value) in results.iter().enumerate() {
            let tensor = value.to_tensor()?;
            let out = ctx.output(index, tensor.dtype(), tensor.shape())?;
            let mut out = lock_tensor(&out)?;
            out.as_bytes_mut().copy_from_slice(tensor.as_bytes());
        }
        Ok(())
    }
}
