//! Spatial BatchNormalization in inference form.

use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::graph::{Node, OpKind};
use crate::ops::{lock_tensor, KernelContext, KernelRegistration, OpKernel};
use crate::tensor::{DType, Tensor};

use super::{FloatElement, FLOAT_TYPES};

pub(crate) fn register(map: &mut HashMap<OpKind, KernelRegistration>) {
    map.insert(
        OpKind::BatchNormalization,
        KernelRegistration::cpu(OpKind::BatchNormalization, FLOAT_TYPES, BatchNorm::create),
    );
}

struct BatchNorm {
    epsilon: f64,
}

impl BatchNorm {
    fn create(node: &Node) -> Result<Box<dyn OpKernel>> {
        Ok(Box::new(BatchNorm {
            epsilon: node.attrs.get_float("epsilon").unwrap_or(1e-5) as f64,
        }))
    }
}

impl OpKernel for BatchNorm {
    fn compute(&self, ctx: &KernelContext) -> Result<()> {
        // Per-channel parameters are small; clone them out one lock at a
        // time so aliased inputs cannot deadlock the worker.
        let scale = lock_tensor(&ctx.input(1)?)?.clone();
        let b = lock_tensor(&ctx.input(2)?)?.clone();
        let mean = lock_tensor(&ctx.input(3)?)?.clone();
        let var = lock_tensor(&ctx.input(4)?)?.clone();
        let x_shared = ctx.input(0)?;
        let x = lock_tensor(&x_shared)?;

        if x.shape().len() < 2 {
            return Err(anyhow!(
                "BatchNormalization expects rank >= 2, got {:?}",
                x.shape()
            ));
        }
        let channels = x.shape()[1];
        for (name, param) in [("scale", &scale), ("B", &b), ("mean", &mean), ("var", &var)] {
            if param.shape() != [channels] {
                return Err(anyhow!(
                    "BatchNormalization {} expects shape [{}], got {:?}",
                    name,
                    channels,
                    param.shape()
                ));
            }
            if param.dtype() != x.dtype() {
                return Err(anyhow!("BatchNormalization parameter dtype mismatch"));
            }
        }

        let out = ctx.output(0, x.dtype(), x.shape())?;
        let mut out = lock_tensor(&out)?;
        match x.dtype() {
            DType::F32 => normalize::<f32>(&x, &scale, &b, &mean, &var, self.epsilon, &mut out),
            DType::F64 => normalize::<f64>(&x, &scale, &b, &mean, &var, self.epsilon, &mut out),
            dtype => Err(anyhow!("unsupported BatchNormalization over {}", dtype)),
        }
    }
}

fn normalize<T: FloatElement>(
    x: &Tensor,
    scale: &Tensor,
    b: &Tensor,
    mean: &Tensor,
    var: &Tensor,
    epsilon: f64,
    out: &mut Tensor,
) -> Result<()> {
    let channels = x.shape()[1];
    let batch = x.shape()[0];
    let block: usize = x.shape()[2..].iter().product();

    let x_data = x.as_slice::<T>()?;
    let scale_data = scale.as_slice::<T>()?;
    let b_data = b.as_slice::<T>()?;
    let mean_data = mean.as_slice::<T>()?;
    let var_data = var.as_slice::<T>()?;
    let out_data = out.as_slice_mut::<T>()?;

    for n in 0..batch {
        for c in 0..channels {
            let scale_c = scale_data[c].to_f64();
            let mean_c = mean_data[c].to_f64();
            let var_c = var_data[c].to_f64();
            let b_c = b_data[c].to_f64();
            let inv = scale_c / (var_c + epsilon).sqrt();
            let base = (n * channels + c) * block;
            for i in 0..block {
                let v = x_data[base + i].to_f64();
                out_data[base + i] = T::from_f64((v - mean_c) * inv + b_c);
            }
        }
    }
    Ok(())
}
