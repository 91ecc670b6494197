//! ReverseSequence: reverse the first `seq_lengths[b]` positions along the
//! sequence axis for every batch entry, leaving the tail unchanged.

use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::error::EngineError;
use crate::graph::{Node, OpKind};
use crate::ops::{lock_tensor, KernelContext, KernelRegistration, OpKernel};
use crate::tensor::DType;

use super::{next_index, offset_for, NUMERIC_TYPES};

pub(crate) fn register(map: &mut HashMap<OpKind, KernelRegistration>) {
    map.insert(
        OpKind::ReverseSequence,
        KernelRegistration::cpu(OpKind::ReverseSequence, NUMERIC_TYPES, ReverseSequence::create),
    );
}

struct ReverseSequence {
    batch_axis: i64,
    seq_axis: i64,
}

impl ReverseSequence {
    fn create(node: &Node) -> Result<Box<dyn OpKernel>> {
        let seq_axis = node
            .attrs
            .get_int("seq_axis")
            .ok_or_else(|| EngineError::invalid_argument("ReverseSequence requires seq_axis"))?;
        let batch_axis = node.attrs.get_int("batch_axis").unwrap_or(0);
        if seq_axis < 0 || batch_axis < 0 || seq_axis == batch_axis {
            return Err(EngineError::invalid_argument(format!(
                "seq_axis and batch_axis should be non-negative and distinct, got seq_axis={} batch_axis={}",
                seq_axis, batch_axis
            )));
        }
        Ok(Box::new(ReverseSequence {
            batch_axis,
            seq_axis,
        }))
    }
}

impl OpKernel for ReverseSequence {
    fn compute(&self, ctx: &KernelContext) -> Result<()> {
        // Read the lengths out before locking the data tensor.
        let lengths = lock_tensor(&ctx.input(1)?)?.clone();
        let input = ctx.input(0)?;
        let input = lock_tensor(&input)?;

        let shape = input.shape().to_vec();
        let batch_axis = self.batch_axis as usize;
        let seq_axis = self.seq_axis as usize;
        if batch_axis >= shape.len() || seq_axis >= shape.len() {
            return Err(EngineError::invalid_argument(format!(
                "ReverseSequence axes out of range for rank {}",
                shape.len()
            )));
        }
        let batch = shape[batch_axis];
        let seq = shape[seq_axis];

        let lengths: Vec<i64> = match lengths.dtype() {
            DType::I32 => lengths.to_vec::<i32>()?.iter().map(|&v| v as i64).collect(),
            DType::I64 => lengths.to_vec::<i64>()?,
            dtype => {
                return Err(EngineError::invalid_argument(format!(
                    "seq_lengths must be int32 or int64, got {}",
                    dtype
                )))
            }
        };
        if lengths.len() != batch {
            return Err(EngineError::invalid_argument(format!(
                "seq_lengths has {} entries for batch size {}",
                lengths.len(),
                batch
            )));
        }
        for &len in &lengths {
            if len < 1 || len > seq as i64 {
                return Err(EngineError::invalid_argument(format!(
                    "seq_lengths entry {} outside [1, {}]",
                    len, seq
                )));
            }
        }

        let out = ctx.output(0, input.dtype(), &shape)?;
        let mut out = lock_tensor(&out)?;
        if out.numel() == 0 {
            return Ok(());
        }

        let elem = input.dtype().size();
        let in_bytes = input.as_bytes();
        let out_bytes = out.as_bytes_mut();
        let mut coords = vec![0usize; shape.len()];
        let mut write = 0usize;
        loop {
            let len = lengths[coords[batch_axis]] as usize;
            let s = coords[seq_axis];
            let mut src = coords.clone();
            if s < len {
                src[seq_axis] = len - 1 - s;
            }
            let read = offset_for(&src, &shape) * elem;
            out_bytes[write..write + elem].copy_from_slice(&in_bytes[read..read + elem]);
            write += elem;
            if !next_index(&mut coords, &shape) {
                break;
            }
        }
        Ok(())
    }
}
