use anyhow::{anyhow, Result};
use graphinfer::{Attributes, DType, Graph, MlValue, OpKind, Tensor};

#[derive(Clone, Copy)]
struct FloatTol {
    abs: f64,
    rel: f64,
}

impl FloatTol {
    fn for_dtype(dtype: DType) -> Option<Self> {
        match dtype {
            DType::F32 => Some(Self { abs: 1e-5, rel: 1e-5 }),
            DType::F64 => Some(Self { abs: 1e-9, rel: 1e-9 }),
            _ => None,
        }
    }
}

pub fn feed_f32(data: Vec<f32>, shape: &[usize]) -> Result<MlValue> {
    Ok(MlValue::from_tensor(Tensor::from_vec(data, shape)?))
}

pub fn feed_i32(data: Vec<i32>, shape: &[usize]) -> Result<MlValue> {
    Ok(MlValue::from_tensor(Tensor::from_vec(data, shape)?))
}

pub fn feed_i64(data: Vec<i64>, shape: &[usize]) -> Result<MlValue> {
    Ok(MlValue::from_tensor(Tensor::from_vec(data, shape)?))
}

pub fn fetched_tensor(value: &MlValue) -> Result<Tensor> {
    value.to_tensor()
}

pub fn fetched_f32(value: &MlValue) -> Result<Vec<f32>> {
    value.to_tensor()?.to_vec::<f32>()
}

pub fn fetched_i32(value: &MlValue) -> Result<Vec<i32>> {
    value.to_tensor()?.to_vec::<i32>()
}

pub fn assert_tensor_close(actual: &Tensor, expected: &Tensor) -> Result<()> {
    if actual.dtype() != expected.dtype() {
        return Err(anyhow!(
            "dtype mismatch: actual {:?} expected {:?}",
            actual.dtype(),
            expected.dtype()
        ));
    }
    if actual.shape() != expected.shape() {
        return Err(anyhow!(
            "shape mismatch: actual {:?} expected {:?}",
            actual.shape(),
            expected.shape()
        ));
    }

    match FloatTol::for_dtype(actual.dtype()) {
        Some(tol) => {
            for idx in 0..actual.numel() {
                let a = actual.value_f64(idx)?;
                let b = expected.value_f64(idx)?;
                if a.is_nan() && b.is_nan() {
                    continue;
                }
                let diff = (a - b).abs();
                if diff <= tol.abs {
                    continue;
                }
                let scale = a.abs().max(b.abs());
                if diff > tol.rel * scale {
                    return Err(anyhow!(
                        "value mismatch at index {}: {} vs {} (abs {}, rel {})",
                        idx,
                        a,
                        b,
                        tol.abs,
                        tol.rel
                    ));
                }
            }
            Ok(())
        }
        None => {
            if actual.as_bytes() == expected.as_bytes() {
                Ok(())
            } else {
                Err(anyhow!("tensor values differ"))
            }
        }
    }
}

pub fn op_count(graph: &Graph, op: OpKind) -> usize {
    graph.count_ops().get(&op).copied().unwrap_or(0)
}

/// Conv → BatchNormalization graph used by the fusion tests: 1x1 Conv with
/// unit weight and no bias, followed by BN with scale=2, B=1, mean=0,
/// var=3. The BN output feeds an Identity so it is not a graph output.
pub fn conv_bn_graph() -> Result<Graph> {
    let mut graph = Graph::new("conv_bn");
    graph.add_input("x", DType::F32, Some(vec![1, 1, 1, 1]));
    graph.add_initializer("w", Tensor::from_vec(vec![1.0f32], &[1, 1, 1, 1])?);
    graph.add_initializer("bn_scale", Tensor::from_vec(vec![2.0f32], &[1])?);
    graph.add_initializer("bn_b", Tensor::from_vec(vec![1.0f32], &[1])?);
    graph.add_initializer("bn_mean", Tensor::from_vec(vec![0.0f32], &[1])?);
    graph.add_initializer("bn_var", Tensor::from_vec(vec![3.0f32], &[1])?);
    graph.add_node(
        "conv0",
        OpKind::Conv,
        vec!["x".into(), "w".into()],
        vec!["conv_out".into()],
        Attributes::none(),
    );
    graph.add_node(
        "bn0",
        OpKind::BatchNormalization,
        vec![
            "conv_out".into(),
            "bn_scale".into(),
            "bn_b".into(),
            "bn_mean".into(),
            "bn_var".into(),
        ],
        vec!["bn_out".into()],
        Attributes::none().with("epsilon", graphinfer::AttrValue::Float(1e-5)),
    );
    graph.add_node(
        "out0",
        OpKind::Identity,
        vec!["bn_out".into()],
        vec!["y".into()],
        Attributes::none(),
    );
    graph.add_output("y");
    Ok(graph)
}
