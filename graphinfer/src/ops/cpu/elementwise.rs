//! Elementwise kernels with numpy-style broadcasting.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::graph::shape::broadcast_shapes;
use crate::graph::OpKind;
use crate::ops::{lock_tensor, KernelContext, KernelRegistration, OpKernel};
use crate::tensor::{DType, Element, Tensor};

use super::{FLOAT_TYPES, NUMERIC_TYPES};

pub(crate) fn register(map: &mut HashMap<OpKind, KernelRegistration>) {
    map.insert(
        OpKind::Add,
        KernelRegistration::cpu(OpKind::Add, NUMERIC_TYPES, |_| {
            Ok(Box::new(Binary { op: OpKind::Add }))
        }),
    );
    map.insert(
        OpKind::Sub,
        KernelRegistration::cpu(OpKind::Sub, NUMERIC_TYPES, |_| {
            Ok(Box::new(Binary { op: OpKind::Sub }))
        }),
    );
    map.insert(
        OpKind::Mul,
        KernelRegistration::cpu(OpKind::Mul, NUMERIC_TYPES, |_| {
            Ok(Box::new(Binary { op: OpKind::Mul }))
        }),
    );
    map.insert(
        OpKind::Div,
        KernelRegistration::cpu(OpKind::Div, NUMERIC_TYPES, |_| {
            Ok(Box::new(Binary { op: OpKind::Div }))
        }),
    );
    map.insert(
        OpKind::Max,
        KernelRegistration::cpu(OpKind::Max, NUMERIC_TYPES, |_| Ok(Box::new(MaxN))),
    );
    map.insert(
        OpKind::Abs,
        KernelRegistration::cpu(OpKind::Abs, NUMERIC_TYPES, |_| Ok(Box::new(Abs))),
    );
    map.insert(
        OpKind::Relu,
        KernelRegistration::cpu(OpKind::Relu, FLOAT_TYPES, |_| Ok(Box::new(Relu))),
    );
    map.insert(
        OpKind::Identity,
        KernelRegistration::cpu(OpKind::Identity, NUMERIC_TYPES, |_| Ok(Box::new(Identity))),
    );
}

/// Element offset in `in_shape` for a flat position of `out_shape`, with
/// size-1 input dimensions broadcast.
pub(crate) fn broadcast_offset(flat: usize, out_shape: &[usize], in_shape: &[usize]) -> usize {
    let rank = out_shape.len();
    let pad = rank - in_shape.len();
    let mut rem = flat;
    let mut offset = 0;
    let mut stride = 1;
    for axis in (0..rank).rev() {
        let coord = rem % out_shape[axis];
        rem /= out_shape[axis];
        if axis >= pad {
            let dim = in_shape[axis - pad];
            if dim != 1 {
                offset += coord * stride;
            }
            stride *= dim;
        }
    }
    offset
}

fn run_binary<T: Element>(
    a: &Tensor,
    b: &Tensor,
    out: &mut Tensor,
    out_shape: &[usize],
    f: impl Fn(T, T) -> T,
) -> Result<()> {
    let a_data = a.as_slice::<T>()?;
    let b_data = b.as_slice::<T>()?;
    let a_shape = a.shape().to_vec();
    let b_shape = b.shape().to_vec();
    let out_data = out.as_slice_mut::<T>()?;
    for (flat, slot) in out_data.iter_mut().enumerate() {
        let lhs = a_data[broadcast_offset(flat, out_shape, &a_shape)];
        let rhs = b_data[broadcast_offset(flat, out_shape, &b_shape)];
        *slot = f(lhs, rhs);
    }
    Ok(())
}

struct Binary {
    op: OpKind,
}

impl OpKernel for Binary {
    fn compute(&self, ctx: &KernelContext) -> Result<()> {
        let a_shared = ctx.input(0)?;
        let b_shared = ctx.input(1)?;
        // Both inputs may name the same value (lock once), and concurrent
        // nodes may share both operands (lock in address order).
        let (a, b_guard) = if Arc::ptr_eq(&a_shared, &b_shared) {
            (lock_tensor(&a_shared)?, None)
        } else if (Arc::as_ptr(&a_shared) as usize) < (Arc::as_ptr(&b_shared) as usize) {
            let a = lock_tensor(&a_shared)?;
            let b = lock_tensor(&b_shared)?;
            (a, Some(b))
        } else {
            let b = lock_tensor(&b_shared)?;
            let a = lock_tensor(&a_shared)?;
            (a, Some(b))
        };
        let b: &Tensor = match &b_guard {
            Some(guard) => guard,
            None => &a,
        };
        if a.dtype() != b.dtype() {
            return Err(anyhow!(
                "{} input dtypes disagree: {} vs {}",
                self.op,
                a.dtype(),
                b.dtype()
            ));
        }
        let out_shape = broadcast_shapes(a.shape(), b.shape())?;
        let out = ctx.output(0, a.dtype(), &out_shape)?;
        let mut out = lock_tensor(&out)?;
        match (self.op, a.dtype()) {
            (OpKind::Add, DType::F32) => run_binary::<f32>(&a, b, &mut out, &out_shape, |x, y| x + y),
            (OpKind::Add, DType::F64) => run_binary::<f64>(&a, b, &mut out, &out_shape, |x, y| x + y),
            (OpKind::Add, DType::I32) => run_binary::<i32>(&a, b, &mut out, &out_shape, |x, y| x + y),
            (OpKind::Add, DType::I64) => run_binary::<i64>(&a, b, &mut out, &out_shape, |x, y| x + y),
            (OpKind::Sub, DType::F32) => run_binary::<f32>(&a, b, &mut out, &out_shape, |x, y| x - y),
            (OpKind::Sub, DType::F64) => run_binary::<f64>(&a, b, &mut out, &out_shape, |x, y| x - y),
            (OpKind::Sub, DType::I32) => run_binary::<i32>(&a, b, &mut out, &out_shape, |x, y| x - y),
            (OpKind::Sub, DType::I64) => run_binary::<i64>(&a, b, &mut out, &out_shape, |x, y| x - y),
            (OpKind::Mul, DType::F32) => run_binary::<f32>(&a, b, &mut out, &out_shape, |x, y| x * y),
            (OpKind::Mul, DType::F64) => run_binary::<f64>(&a, b, &mut out, &out_shape, |x, y| x * y),
            (OpKind::Mul, DType::I32) => run_binary::<i32>(&a, b, &mut out, &out_shape, |x, y| x * y),
            (OpKind::Mul, DType::I64) => run_binary::<i64>(&a, b, &mut out, &out_shape, |x, y| x * y),
            (OpKind::Div, DType::F32) => run_binary::<f32>(&a, b, &mut out, &out_shape, |x, y| x / y),
            (OpKind::Div, DType::F64) => run_binary::<f64>(&a, b, &mut out, &out_shape, |x, y| x / y),
            (OpKind::Div, DType::I32) => run_binary::<i32>(&a, b, &mut out, &out_shape, |x, y| x / y),
            (OpKind::Div, DType::I64) => run_binary::<i64>(&a, b, &mut out, &out_shape, |x, y| x / y),
            (op, dtype) => Err(anyhow!("unsupported {} over {}", op, dtype)),
        }
    }
}

struct MaxN;

impl OpKernel for MaxN {
    fn compute(&self, ctx: &KernelContext) -> Result<()> {
        if ctx.input_count() == 0 {
            return Err(anyhow!("Max requires at least one input"));
        }
        // Fold the variadic inputs pairwise into an accumulator.
        let first = ctx.input(0)?;
        let mut acc = lock_tensor(&first)?.clone();
        for index in 1..ctx.input_count() {
            let next = ctx.input(index)?;
            let next = lock_tensor(&next)?;
            if acc.dtype() != next.dtype() {
                return Err(anyhow!(
                    "Max input dtypes disagree: {} vs {}",
                    acc.dtype(),
                    next.dtype()
                ));
            }
            let out_shape = broadcast_shapes(acc.shape(), next.shape())?;
            let mut folded = Tensor::zeros(acc.dtype(), &out_shape);
            match acc.dtype() {
                DType::F32 => run_binary::<f32>(&acc, &next, &mut folded, &out_shape, f32::max)?,
                DType::F64 => run_binary::<f64>(&acc, &next, &mut folded, &out_shape, f64::max)?,
                DType::I32 => run_binary::<i32>(&acc, &next, &mut folded, &out_shape, i32::max)?,
                DType::I64 => run_binary::<i64>(&acc, &next, &mut folded, &out_shape, i64::max)?,
            }
            acc = folded;
        }
        let out = ctx.output(0, acc.dtype(), acc.shape())?;
        let mut out = lock_tensor(&out)?;
        out.as_bytes_mut().copy_from_slice(acc.as_bytes());
        Ok(())
    }
}

struct Abs;

impl OpKernel for Abs {
    fn compute(&self, ctx: &KernelContext) -> Result<()> {
        let input = ctx.input(0)?;
        let input = lock_tensor(&input)?;
        let out = ctx.output(0, input.dtype(), input.shape())?;
        let mut out = lock_tensor(&out)?;
        match input.dtype() {
            DType::F32 => map_unary::<f32>(&input, &mut out, f32::abs)?,
            DType::F64 => map_unary::<f64>(&input, &mut out, f64::abs)?,
            DType::I32 => map_unary::<i32>(&input, &mut out, i32::abs)?,
            DType::I64 => map_unary::<i64>(&input, &mut out, i64::abs)?,
        }
        Ok(())
    }
}

struct Relu;

impl OpKernel for Relu {
    fn compute(&self, ctx: &KernelContext) -> Result<()> {
        let input = ctx.input(0)?;
        let input = lock_tensor(&input)?;
        let out = ctx.output(0, input.dtype(), input.shape())?;
        let mut out = lock_tensor(&out)?;
        match input.dtype() {
            DType::F32 => map_unary::<f32>(&input, &mut out, |v| v.max(0.0))?,
            DType::F64 => map_unary::<f64>(&input, &mut out, |v| v.max(0.0))?,
            dtype => return Err(anyhow!("unsupported Relu over {}", dtype)),
        }
        Ok(())
    }
}

struct Identity;

impl OpKernel for Identity {
    fn compute(&self, ctx: &KernelContext) -> Result<()> {
        let input = ctx.input(0)?;
        let input = lock_tensor(&input)?;
        let out = ctx.output(0, input.dtype(), input.shape())?;
        let mut out = lock_tensor(&out)?;
        out.as_bytes_mut().copy_from_slice(input.as_bytes());
        Ok(())
    }
}

fn map_unary<T: Element>(input: &Tensor, out: &mut Tensor, f: impl Fn(T) -> T) -> Result<()> {
    let data = input.as_slice::<T>()?;
    let out_data = out.as_slice_mut::<T>()?;
    for (slot, v) in out_data.iter_mut().zip(data) {
        *slot = f(*v);
    }
    Ok(())
}
