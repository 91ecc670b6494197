mod batch_norm;
mod control_flow;
mod conv;
mod elementwise;
mod gemm;
mod reverse_sequence;
mod tensor_ops;

use std::collections::HashMap;

use crate::graph::OpKind;

use super::registry::KernelRegistration;

pub(crate) fn register_all(map: &mut HashMap<OpKind, KernelRegistration>) {
    elementwise::register(map);
    conv::register(map);
    batch_norm::register(map);
    gemm::register(map);
    tensor_ops::register(map);
    reverse_sequence::register(map);
    control_flow::register(map);
}

pub(crate) const FLOAT_TYPES: &[crate::tensor::DType] =
    &[crate::tensor::DType::F32, crate::tensor::DType::F64];

pub(crate) const NUMERIC_TYPES: &[crate::tensor::DType] = &[
    crate::tensor::DType::F32,
    crate::tensor::DType::F64,
    crate::tensor::DType::I32,
    crate::tensor::DType::I64,
];

/// Float element with exact f64 round-tripping for parameter math.
pub(crate) trait FloatElement: crate::tensor::Element {
    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;
}

impl FloatElement for f32 {
    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl FloatElement for f64 {
    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(v: f64) -> Self {
        v
    }
}

/// Row-major linear offset of `coords` within `shape`.
pub(crate) fn offset_for(coords: &[usize], shape: &[usize]) -> usize {
    let mut offset = 0;
    for (coord, dim) in coords.iter().zip(shape) {
        offset = offset * dim + coord;
    }
    offset
}

/// Advance a multi-index odometer; returns false after the last position.
pub(crate) fn next_index(coords: &mut [usize], shape: &[usize]) -> bool {
    for axis in (0..shape.len()).rev() {
        coords[axis] += 1;
        if coords[axis] < shape[axis] {
            return true;
        }
        coords[axis] = 0;
    }
    false
}
