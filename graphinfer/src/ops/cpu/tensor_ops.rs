//! Shape-manipulating and generator kernels: Slice, Unsqueeze, EyeLike,
//! ConstantFill. Data movement is dtype-agnostic byte copying.

use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::graph::shape::{slice_bounds, unsqueeze_shape};
use crate::graph::{Node, OpKind};
use crate::ops::{lock_tensor, KernelContext, KernelRegistration, OpKernel};
use crate::tensor::{DType, Tensor};

use super::{next_index, offset_for, NUMERIC_TYPES};

pub(crate) fn register(map: &mut HashMap<OpKind, KernelRegistration>) {
    map.insert(
        OpKind::Slice,
        KernelRegistration::cpu(OpKind::Slice, NUMERIC_TYPES, Slice::create),
    );
    map.insert(
        OpKind::Unsqueeze,
        KernelRegistration::cpu(OpKind::Unsqueeze, NUMERIC_TYPES, Unsqueeze::create),
    );
    map.insert(
        OpKind::EyeLike,
        KernelRegistration::cpu(OpKind::EyeLike, NUMERIC_TYPES, EyeLike::create),
    );
    map.insert(
        OpKind::ConstantFill,
        KernelRegistration::cpu(OpKind::ConstantFill, NUMERIC_TYPES, ConstantFill::create),
    );
}

struct Slice {
    starts: Vec<i64>,
    ends: Vec<i64>,
    axes: Option<Vec<i64>>,
}

impl Slice {
    fn create(node: &Node) -> Result<Box<dyn OpKernel>> {
        let starts = node
            .attrs
            .get_ints("starts")
            .ok_or_else(|| anyhow!("Slice requires starts"))?
            .to_vec();
        let ends = node
            .attrs
            .get_ints("ends")
            .ok_or_else(|| anyhow!("Slice requires ends"))?
            .to_vec();
        if starts.len() != ends.len() {
            return Err(anyhow!("Slice starts/ends lengths disagree"));
        }
        Ok(Box::new(Slice {
            starts,
            ends,
            axes: node.attrs.get_ints("axes").map(<[i64]>::to_vec),
        }))
    }
}

impl OpKernel for Slice {
    fn compute(&self, ctx: &KernelContext) -> Result<()> {
        let input = ctx.input(0)?;
        let input = lock_tensor(&input)?;
        let in_shape = input.shape().to_vec();

        let default_axes: Vec<i64> = (0..self.starts.len() as i64).collect();
        let axes = self.axes.as_deref().unwrap_or(&default_axes);
        let bounds = slice_bounds(&self.starts, &self.ends, axes, &in_shape)?;

        let mut out_shape = in_shape.clone();
        let mut start_per_axis = vec![0usize; in_shape.len()];
        for (axis, start, end) in bounds {
            out_shape[axis] = end - start;
            start_per_axis[axis] = start;
        }

        let out = ctx.output(0, input.dtype(), &out_shape)?;
        let mut out = lock_tensor(&out)?;
        if out.numel() == 0 {
            return Ok(());
        }

        let elem = input.dtype().size();
        let in_bytes = input.as_bytes();
        let out_bytes = out.as_bytes_mut();
        let mut coords = vec![0usize; out_shape.len()];
        let mut write = 0usize;
        loop {
            let src: Vec<usize> = coords
                .iter()
                .zip(&start_per_axis)
                .map(|(c, s)| c + s)
                .collect();
            let read = offset_for(&src, &in_shape) * elem;
            out_bytes[write..write + elem].copy_from_slice(&in_bytes[read..read + elem]);
            write += elem;
            if !next_index(&mut coords, &out_shape) {
                break;
            }
        }
        Ok(())
    }
}

struct Unsqueeze {
    axes: Vec<i64>,
}

impl Unsqueeze {
    fn create(node: &Node) -> Result<Box<dyn OpKernel>> {
        Ok(Box::new(Unsqueeze {
            axes: node
                .attrs
                .get_ints("axes")
                .ok_or_else(|| anyhow!("Unsqueeze requires axes"))?
                .to_vec(),
        }))
    }
}

impl OpKernel for Unsqueeze {
    fn compute(&self, ctx: &KernelContext) -> Result<()> {
        let input = ctx.input(0)?;
        let input = lock_tensor(&input)?;
        let out_shape = unsqueeze_shape(&self.axes, input.shape())?;
        let out = ctx.output(0, input.dtype(), &out_shape)?;
        let mut out = lock_tensor(&out)?;
        out.as_bytes_mut().copy_from_slice(input.as_bytes());
        Ok(())
    }
}

struct EyeLike {
    k: i64,
}

impl EyeLike {
    fn create(node: &Node) -> Result<Box<dyn OpKernel>> {
        Ok(Box::new(EyeLike {
            k: node.attrs.get_int("k").unwrap_or(0),
        }))
    }
}

impl OpKernel for EyeLike {
    fn compute(&self, ctx: &KernelContext) -> Result<()> {
        let input = ctx.input(0)?;
        let input = lock_tensor(&input)?;
        if input.shape().len() != 2 {
            return Err(anyhow!(
                "EyeLike expects a rank-2 input, got {:?}",
                input.shape()
            ));
        }
        let (rows, cols) = (input.shape()[0], input.shape()[1]);
        let out = ctx.output(0, input.dtype(), &[rows, cols])?;
        let mut out = lock_tensor(&out)?;
        write_eye(&mut out, rows, cols, self.k)
    }
}

fn write_eye(out: &mut Tensor, rows: usize, cols: usize, k: i64) -> Result<()> {
    out.as_bytes_mut().fill(0);
    for i in 0..rows as i64 {
        let j = i + k;
        if j < 0 || j >= cols as i64 {
            continue;
        }
        let at = (i as usize) * cols + j as usize;
        match out.dtype() {
            DType::F32 => out.as_slice_mut::<f32>()?[at] = 1.0,
            DType::F64 => out.as_slice_mut::<f64>()?[at] = 1.0,
            DType::I32 => out.as_slice_mut::<i32>()?[at] = 1,
            DType::I64 => out.as_slice_mut::<i64>()?[at] = 1,
        }
    }
    Ok(())
}

struct ConstantFill {
    value: f32,
    shape: Option<Vec<i64>>,
    input_as_shape: bool,
}

impl ConstantFill {
    fn create(node: &Node) -> Result<Box<dyn OpKernel>> {
        Ok(Box::new(ConstantFill {
            value: node.attrs.get_float("value").unwrap_or(0.0),
            shape: node.attrs.get_ints("shape").map(<[i64]>::to_vec),
            input_as_shape: node.attrs.get_int("input_as_shape").unwrap_or(0) != 0,
        }))
    }
}

impl OpKernel for ConstantFill {
    fn compute(&self, ctx: &KernelContext) -> Result<()> {
        let out_shape: Vec<usize> = if let Some(dims) = &self.shape {
            dims.iter().map(|&d| d as usize).collect()
        } else if self.input_as_shape {
            // The input's values, not its shape, give the output dims.
            let input = ctx.input(0)?;
            let input = lock_tensor(&input)?;
            let dims = input.to_vec::<i64>()?;
            dims.iter().map(|&d| d as usize).collect()
        } else {
            let input = ctx.input(0)?;
            let input = lock_tensor(&input)?;
            input.shape().to_vec()
        };

        let out = ctx.output(0, DType::F32, &out_shape)?;
        let mut out = lock_tensor(&out)?;
        out.as_slice_mut::<f32>()?.fill(self.value);
        Ok(())
    }
}
