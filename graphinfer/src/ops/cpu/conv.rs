//! Direct NCHW convolution over any spatial rank.

use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::error::EngineError;
use crate::graph::{Node, OpKind};
use crate::ops::{lock_tensor, KernelContext, KernelRegistration, OpKernel};
use crate::tensor::{DType, Element, Tensor};

use super::{next_index, offset_for, FLOAT_TYPES};

pub(crate) fn register(map: &mut HashMap<OpKind, KernelRegistration>) {
    map.insert(
        OpKind::Conv,
        KernelRegistration::cpu(OpKind::Conv, FLOAT_TYPES, Conv::create),
    );
}

struct Conv {
    strides: Option<Vec<i64>>,
    pads: Option<Vec<i64>>,
    dilations: Option<Vec<i64>>,
}

impl Conv {
    fn create(node: &Node) -> Result<Box<dyn OpKernel>> {
        let group = node.attrs.get_int("group").unwrap_or(1);
        if group != 1 {
            return Err(EngineError::not_implemented(format!(
                "Conv with group {} is not supported",
                group
            )));
        }
        Ok(Box::new(Conv {
            strides: node.attrs.get_ints("strides").map(<[i64]>::to_vec),
            pads: node.attrs.get_ints("pads").map(<[i64]>::to_vec),
            dilations: node.attrs.get_ints("dilations").map(<[i64]>::to_vec),
        }))
    }

    fn attr_or(&self, attr: &Option<Vec<i64>>, len: usize, fill: i64) -> Result<Vec<i64>> {
        match attr {
            Some(values) => {
                if values.len() != len {
                    return Err(anyhow!(
                        "Conv attribute length {} does not match spatial rank {}",
                        values.len(),
                        len
                    ));
                }
                Ok(values.clone())
            }
            None => Ok(vec![fill; len]),
        }
    }
}

impl OpKernel for Conv {
    fn compute(&self, ctx: &KernelContext) -> Result<()> {
        let x_shared = ctx.input(0)?;
        let w_shared = ctx.input(1)?;
        // Parameters are cloned out one lock at a time so aliased inputs
        // cannot deadlock the worker.
        let w = lock_tensor(&w_shared)?.clone();
        let bias = match ctx.opt_input(2) {
            Some(shared) => Some(lock_tensor(&shared)?.clone()),
            None => None,
        };
        let x = lock_tensor(&x_shared)?;

        if x.shape().len() < 3 || w.shape().len() != x.shape().len() {
            return Err(anyhow!(
                "Conv expects matching input/weight ranks >= 3, got {:?} and {:?}",
                x.shape(),
                w.shape()
            ));
        }
        if x.dtype() != w.dtype() {
            return Err(anyhow!("Conv input/weight dtype mismatch"));
        }
        let spatial = x.shape().len() - 2;
        let strides = self.attr_or(&self.strides, spatial, 1)?;
        let dilations = self.attr_or(&self.dilations, spatial, 1)?;
        let pads = self.attr_or(&self.pads, 2 * spatial, 0)?;

        let batch = x.shape()[0];
        let channels = x.shape()[1];
        if w.shape()[1] != channels {
            return Err(anyhow!(
                "Conv weight expects {} input channels, got {}",
                channels,
                w.shape()[1]
            ));
        }
        let filters = w.shape()[0];

        let mut out_shape = vec![batch, filters];
        for i in 0..spatial {
            let effective = dilations[i] * (w.shape()[2 + i] as i64 - 1) + 1;
            let span = x.shape()[2 + i] as i64 + pads[i] + pads[spatial + i] - effective;
            if span < 0 {
                return Err(anyhow!("Conv kernel does not fit input {:?}", x.shape()));
            }
            out_shape.push((span / strides[i] + 1) as usize);
        }

        let out = ctx.output(0, x.dtype(), &out_shape)?;
        let mut out = lock_tensor(&out)?;

        match x.dtype() {
            DType::F32 => direct_conv::<f32>(
                &x, &w, bias.as_ref(), &mut out, &out_shape, &strides, &pads, &dilations,
            ),
            DType::F64 => direct_conv::<f64>(
                &x, &w, bias.as_ref(), &mut out, &out_shape, &strides, &pads, &dilations,
            ),
            dtype => Err(anyhow!("unsupported Conv over {}", dtype)),
        }
    }
}

trait ConvElement: Element + Copy + std::ops::Add<Output = Self> + std::ops::Mul<Output = Self> {
    fn zero() -> Self;
}

impl ConvElement for f32 {
    fn zero() -> Self {
        0.0
    }
}

impl ConvElement for f64 {
    fn zero() -> Self {
        0.0
    }
}

#[allow(clippy::too_many_arguments)]
fn direct_conv<T: ConvElement>(
    x: &Tensor,
    w: &Tensor,
    bias: Option<&Tensor>,
    out: &mut Tensor,
    out_shape: &[usize],
    strides: &[i64],
    pads: &[i64],
    dilations: &[i64],
) -> Result<()> {
    let x_shape = x.shape().to_vec();
    let w_shape = w.shape().to_vec();
    let x_data = x.as_slice::<T>()?;
    let w_data = w.as_slice::<T>()?;
    let bias_data = bias.map(|b| b.as_slice::<T>()).transpose()?;
    let out_data = out.as_slice_mut::<T>()?;

    let spatial = out_shape.len() - 2;
    let channels = x_shape[1];
    let kernel_dims = &w_shape[2..];
    let out_spatial = &out_shape[2..];

    let mut out_pos = vec![0usize; spatial];
    let mut write = 0usize;
    for n in 0..out_shape[0] {
        for m in 0..out_shape[1] {
            out_pos.iter_mut().for_each(|p| *p = 0);
            loop {
                let mut acc = bias_data.map(|b| b[m]).unwrap_or_else(T::zero);
                let mut kernel_pos = vec![0usize; spatial];
                'kernel: loop {
                    for c in 0..channels {
                        let mut x_coords = Vec::with_capacity(spatial + 2);
                        x_coords.push(n);
                        x_coords.push(c);
                        let mut in_range = true;
                        for i in 0..spatial {
                            let coord = out_pos[i] as i64 * strides[i]
                                + kernel_pos[i] as i64 * dilations[i]
                                - pads[i];
                            if coord < 0 || coord >= x_shape[2 + i] as i64 {
                                in_range = false;
                                break;
                            }
                            x_coords.push(coord as usize);
                        }
                        if !in_range {
                            continue;
                        }
                        let mut w_coords = Vec::with_capacity(spatial + 2);
                        w_coords.push(m);
                        w_coords.push(c);
                        w_coords.extend_from_slice(&kernel_pos);
                        acc = acc
                            + x_data[offset_for(&x_coords, &x_shape)]
                                * w_data[offset_for(&w_coords, &w_shape)];
                    }
                    if !next_index(&mut kernel_pos, kernel_dims) {
                        break 'kernel;
                    }
                }
                out_data[write] = acc;
                write += 1;
                if !next_index(&mut out_pos, out_spatial) {
                    break;
                }
            }
        }
    }
    Ok(())
}
