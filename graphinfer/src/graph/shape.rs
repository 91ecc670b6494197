//! Per-op type and shape propagation used by `Graph::resolve`.
//!
//! Propagation is best-effort: an output stays unknown when its inputs are
//! unknown, but hard inconsistencies between known shapes are rejected.

use anyhow::{anyhow, Result};

use crate::tensor::DType;

use super::graph::Graph;
use super::node::{Node, OpKind};

type Known = Option<(DType, Vec<usize>)>;

/// Numpy-style broadcast of two shapes, aligned at the trailing dimension.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0usize; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = if da == db || db == 1 {
            da
        } else if da == 1 {
            db
        } else {
            return Err(anyhow!("shapes {:?} and {:?} are not broadcastable", a, b));
        };
    }
    Ok(out)
}

fn elementwise(inputs: &[Known]) -> Result<Known> {
    let mut acc: Option<(DType, Vec<usize>)> = None;
    for input in inputs {
        let Some((dtype, dims)) = input else { return Ok(None) };
        acc = Some(match acc {
            None => (*dtype, dims.clone()),
            Some((prev_dtype, prev_dims)) => {
                if prev_dtype != *dtype {
                    return Err(anyhow!(
                        "elementwise dtype mismatch: {} vs {}",
                        prev_dtype,
                        dtype
                    ));
                }
                (prev_dtype, broadcast_shapes(&prev_dims, dims)?)
            }
        });
    }
    Ok(acc)
}

fn conv_output(node: &Node, x: &[usize], w: &[usize]) -> Result<Vec<usize>> {
    if x.len() < 3 || w.len() != x.len() {
        return Err(anyhow!(
            "Conv expects matching input/weight ranks >= 3, got {:?} and {:?}",
            x,
            w
        ));
    }
    let spatial = x.len() - 2;
    let ones = vec![1i64; spatial];
    let zeros = vec![0i64; 2 * spatial];
    let strides = node.attrs.get_ints("strides").unwrap_or(&ones);
    let dilations = node.attrs.get_ints("dilations").unwrap_or(&ones);
    let pads = node.attrs.get_ints("pads").unwrap_or(&zeros);
    if strides.len() != spatial || dilations.len() != spatial || pads.len() != 2 * spatial {
        return Err(anyhow!("Conv attribute rank mismatch for node {}", node.name));
    }
    let mut out = vec![x[0], w[0]];
    for i in 0..spatial {
        let effective = dilations[i] * (w[2 + i] as i64 - 1) + 1;
        let span = x[2 + i] as i64 + pads[i] + pads[spatial + i] - effective;
        if span < 0 {
            return Err(anyhow!("Conv kernel does not fit input {:?}", x));
        }
        out.push((span / strides[i] + 1) as usize);
    }
    Ok(out)
}

fn gemm_output(node: &Node, a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    if a.len() != 2 || b.len() != 2 {
        return Err(anyhow!("Gemm expects rank-2 inputs, got {:?} and {:?}", a, b));
    }
    let trans_a = node.attrs.get_int("transA").unwrap_or(0) != 0;
    let trans_b = node.attrs.get_int("transB").unwrap_or(0) != 0;
    let (m, ka) = if trans_a { (a[1], a[0]) } else { (a[0], a[1]) };
    let (kb, n) = if trans_b { (b[1], b[0]) } else { (b[0], b[1]) };
    if ka != kb {
        return Err(anyhow!("Gemm inner dimensions disagree: {} vs {}", ka, kb));
    }
    Ok(vec![m, n])
}

pub(crate) fn slice_bounds(
    starts: &[i64],
    ends: &[i64],
    axes: &[i64],
    shape: &[usize],
) -> Result<Vec<(usize, usize, usize)>> {
    if starts.len() != ends.len() || axes.len() != starts.len() {
        return Err(anyhow!("Slice starts/ends/axes lengths disagree"));
    }
    let mut out = Vec::with_capacity(axes.len());
    for (i, &axis) in axes.iter().enumerate() {
        if axis < 0 {
            return Err(anyhow!("negative Slice axis {}", axis));
        }
        let axis = axis as usize;
        if axis >= shape.len() {
            return Err(anyhow!("Slice axis {} out of rank {}", axis, shape.len()));
        }
        let dim = shape[axis] as i64;
        let norm = |v: i64| -> i64 {
            let v = if v < 0 { v + dim } else { v };
            v.clamp(0, dim)
        };
        let start = norm(starts[i]);
        let end = norm(ends[i].min(dim));
        let end = end.max(start);
        out.push((axis, start as usize, end as usize));
    }
    Ok(out)
}

fn slice_output(node: &Node, x: &[usize]) -> Result<Vec<usize>> {
    let starts = node
        .attrs
        .get_ints("starts")
        .ok_or_else(|| anyhow!("Slice requires starts"))?;
    let ends = node
        .attrs
        .get_ints("ends")
        .ok_or_else(|| anyhow!("Slice requires ends"))?;
    let default_axes: Vec<i64> = (0..starts.len() as i64).collect();
    let axes = node.attrs.get_ints("axes").unwrap_or(&default_axes);
    let mut out = x.to_vec();
    for (axis, start, end) in slice_bounds(starts, ends, axes, x)? {
        out[axis] = end - start;
    }
    Ok(out)
}

pub(crate) fn unsqueeze_shape(axes: &[i64], input: &[usize]) -> Result<Vec<usize>> {
    let rank = input.len() + axes.len();
    let mut sorted: Vec<i64> = axes.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    if sorted.len() != axes.len() {
        return Err(anyhow!("Unsqueeze axes contain duplicates"));
    }
    let mut out = Vec::with_capacity(rank);
    let mut src = input.iter();
    for i in 0..rank as i64 {
        if sorted.binary_search(&i).is_ok() {
            out.push(1);
        } else {
            out.push(*src.next().ok_or_else(|| anyhow!("Unsqueeze axis {} out of range", i))?);
        }
    }
    Ok(out)
}

/// Infer dtype/shape for each output of `node`. Unknowable entries are None.
pub fn infer_node(graph: &Graph, node: &Node) -> Result<Vec<Known>> {
    let known: Vec<Known> = node
        .inputs
        .iter()
        .map(|name| {
            if name.is_empty() {
                None
            } else {
                graph.known_value(name)
            }
        })
        .collect();

    let single = |value: Known| -> Vec<Known> { vec![value] };

    Ok(match node.op {
        OpKind::Abs | OpKind::Relu | OpKind::Identity | OpKind::ReverseSequence => {
            single(known.first().cloned().flatten())
        }
        OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => {
            single(elementwise(&known[..2.min(known.len())])?)
        }
        OpKind::Max => single(elementwise(&known)?),
        OpKind::BatchNormalization => single(known.first().cloned().flatten()),
        OpKind::Conv => match (&known.first().cloned().flatten(), &known.get(1).cloned().flatten()) {
            (Some((dtype, x)), Some((w_dtype, w))) => {
                if dtype != w_dtype {
                    return Err(anyhow!("Conv input/weight dtype mismatch"));
                }
                single(Some((*dtype, conv_output(node, x, w)?)))
            }
            _ => single(None),
        },
        OpKind::Gemm => match (&known.first().cloned().flatten(), &known.get(1).cloned().flatten()) {
            (Some((dtype, a)), Some((_, b))) => single(Some((*dtype, gemm_output(node, a, b)?))),
            _ => single(None),
        },
        OpKind::Slice => match known.first().cloned().flatten() {
            Some((dtype, x)) => single(Some((dtype, slice_output(node, &x)?))),
            None => single(None),
        },
        OpKind::Unsqueeze => match known.first().cloned().flatten() {
            Some((dtype, x)) => {
                let axes = node
                    .attrs
                    .get_ints("axes")
                    .ok_or_else(|| anyhow!("Unsqueeze requires axes"))?;
                single(Some((dtype, unsqueeze_shape(axes, &x)?)))
            }
            None => single(None),
        },
        OpKind::EyeLike => single(known.first().cloned().flatten()),
        OpKind::ConstantFill => {
            let shape_attr = node.attrs.get_ints("shape");
            let dtype = DType::F32;
            match (shape_attr, known.first().cloned().flatten()) {
                (Some(dims), _) => single(Some((
                    dtype,
                    dims.iter().map(|&d| d as usize).collect(),
                ))),
                (None, Some((_, x))) => single(Some((dtype, x))),
                _ => single(None),
            }
        }
        // Subgraph outputs are planned by the nested session.
        OpKind::If => node.outputs.iter().map(|_| None).collect(),
    })
}
