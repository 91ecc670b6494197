//! General matrix multiply: Y = alpha * op(A) * op(B) + beta * C.

use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::graph::{Node, OpKind};
use crate::ops::{lock_tensor, KernelContext, KernelRegistration, OpKernel};
use crate::tensor::{DType, Tensor};

use super::elementwise::broadcast_offset;
use super::{FloatElement, FLOAT_TYPES};

pub(crate) fn register(map: &mut HashMap<OpKind, KernelRegistration>) {
    map.insert(
        OpKind::Gemm,
        KernelRegistration::cpu(OpKind::Gemm, FLOAT_TYPES, Gemm::create),
    );
}

struct Gemm {
    alpha: f64,
    beta: f64,
    trans_a: bool,
    trans_b: bool,
}

impl Gemm {
    fn create(node: &Node) -> Result<Box<dyn OpKernel>> {
        Ok(Box::new(Gemm {
            alpha: node.attrs.get_float("alpha").unwrap_or(1.0) as f64,
            beta: node.attrs.get_float("beta").unwrap_or(1.0) as f64,
            trans_a: node.attrs.get_int("transA").unwrap_or(0) != 0,
            trans_b: node.attrs.get_int("transB").unwrap_or(0) != 0,
        }))
    }
}

impl OpKernel for Gemm {
    fn compute(&self, ctx: &KernelContext) -> Result<()> {
        let a_shared = ctx.input(0)?;
        let b_shared = ctx.input(1)?;
        // One lock at a time; aliased inputs must not deadlock the worker.
        let b = lock_tensor(&b_shared)?.clone();
        let c = match ctx.opt_input(2) {
            Some(shared) => Some(lock_tensor(&shared)?.clone()),
            None => None,
        };
        let a = lock_tensor(&a_shared)?;

        if a.shape().len() != 2 || b.shape().len() != 2 {
            return Err(anyhow!(
                "Gemm expects rank-2 inputs, got {:?} and {:?}",
                a.shape(),
                b.shape()
            ));
        }
        if a.dtype() != b.dtype() {
            return Err(anyhow!("Gemm input dtypes disagree"));
        }
        let (m, ka) = if self.trans_a {
            (a.shape()[1], a.shape()[0])
        } else {
            (a.shape()[0], a.shape()[1])
        };
        let (kb, n) = if self.trans_b {
            (b.shape()[1], b.shape()[0])
        } else {
            (b.shape()[0], b.shape()[1])
        };
        if ka != kb {
            return Err(anyhow!("Gemm inner dimensions disagree: {} vs {}", ka, kb));
        }

        let out = ctx.output(0, a.dtype(), &[m, n])?;
        let mut out = lock_tensor(&out)?;
        match a.dtype() {
            DType::F32 => self.matmul::<f32>(&a, &b, c.as_ref(), &mut out, m, n, ka),
            DType::F64 => self.matmul::<f64>(&a, &b, c.as_ref(), &mut out, m, n, ka),
            dtype => Err(anyhow!("unsupported Gemm over {}", dtype)),
        }
    }
}

impl Gemm {
    #[allow(clippy::too_many_arguments)]
    fn matmul<T: FloatElement>(
        &self,
        a: &Tensor,
        b: &Tensor,
        c: Option<&Tensor>,
        out: &mut Tensor,
        m: usize,
        n: usize,
        k: usize,
    ) -> Result<()> {
        let a_data = a.as_slice::<T>()?;
        let b_data = b.as_slice::<T>()?;
        let c_data = c.map(|t| t.as_slice::<T>()).transpose()?;
        let c_shape = c.map(|t| t.shape().to_vec());
        let a_cols = a.shape()[1];
        let b_cols = b.shape()[1];
        let out_data = out.as_slice_mut::<T>()?;

        for i in 0..m {
            for j in 0..n {
                let mut acc = 0.0f64;
                for p in 0..k {
                    let av = if self.trans_a {
                        a_data[p * a_cols + i]
                    } else {
                        a_data[i * a_cols + p]
                    };
                    let bv = if self.trans_b {
                        b_data[j * b_cols + p]
                    } else {
                        b_data[p * b_cols + j]
                    };
                    acc += av.to_f64() * bv.to_f64();
                }
                let mut value = self.alpha * acc;
                if let (Some(c_data), Some(c_shape)) = (c_data, c_shape.as_ref()) {
                    let offset = broadcast_offset(i * n + j, &[m, n], c_shape);
                    value += self.beta * c_data[offset].to_f64();
                }
                out_data[i * n + j] = T::from_f64(value);
            }
        }
        Ok(())
    }
}
