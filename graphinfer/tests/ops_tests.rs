mod common;

use std::collections::HashMap;

use anyhow::Result;
use graphinfer::{
    AttrValue, Attributes, DType, Graph, Model, OpKind, Session, SessionOptions, Tensor,
};

fn run_single_node(
    graph: Graph,
    feeds: HashMap<String, graphinfer::MlValue>,
    output: &str,
) -> Result<graphinfer::MlValue> {
    let options = SessionOptions {
        enable_default_transformers: false,
        ..SessionOptions::default()
    };
    let mut session = Session::new(options)?;
    session.load(Model::new(graph))?;
    session.initialize()?;
    let mut fetched = session.run(&feeds, &[output.to_string()])?;
    Ok(fetched.remove(0))
}

#[test]
fn reverse_sequence_reverses_prefixes_per_batch() -> Result<()> {
    let mut graph = Graph::new("reverse_sequence");
    graph.add_input("input", DType::I32, Some(vec![4, 5, 2]));
    graph.add_input("seq_lengths", DType::I32, Some(vec![4]));
    graph.add_node(
        "reverse0",
        OpKind::ReverseSequence,
        vec!["input".into(), "seq_lengths".into()],
        vec!["Y".into()],
        Attributes::none()
            .with("batch_axis", AttrValue::Int(0))
            .with("seq_axis", AttrValue::Int(1)),
    );
    graph.add_output("Y");

    #[rustfmt::skip]
    let input: Vec<i32> = vec![
        111, 112,   0,   0,   0,   0,   0,   0,   0,   0,
        211, 212, 221, 222, 231, 232,   0,   0,   0,   0,
        311, 312, 321, 322, 331, 332, 341, 342, 351, 352,
        411, 412, 421, 422, 431, 432, 441, 442,   0,   0,
    ];
    #[rustfmt::skip]
    let expected: Vec<i32> = vec![
        111, 112,   0,   0,   0,   0,   0,   0,   0,   0,
        231, 232, 221, 222, 211, 212,   0,   0,   0,   0,
        351, 352, 341, 342, 331, 332, 321, 322, 311, 312,
        441, 442, 431, 432, 421, 422, 411, 412,   0,   0,
    ];

    let mut feeds = HashMap::new();
    feeds.insert("input".to_string(), common::feed_i32(input, &[4, 5, 2])?);
    feeds.insert(
        "seq_lengths".to_string(),
        common::feed_i32(vec![1, 3, 5, 4], &[4])?,
    );
    let fetched = run_single_node(graph, feeds, "Y")?;
    assert_eq!(common::fetched_i32(&fetched)?, expected);
    Ok(())
}

#[test]
fn elementwise_add_broadcasts_rows() -> Result<()> {
    let mut graph = Graph::new("broadcast_add");
    graph.add_input("a", DType::F32, Some(vec![2, 3]));
    graph.add_input("b", DType::F32, Some(vec![3]));
    graph.add_node(
        "add0",
        OpKind::Add,
        vec!["a".into(), "b".into()],
        vec!["y".into()],
        Attributes::none(),
    );
    graph.add_output("y");

    let mut feeds = HashMap::new();
    feeds.insert(
        "a".to_string(),
        common::feed_f32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3])?,
    );
    feeds.insert("b".to_string(), common::feed_f32(vec![10.0, 20.0, 30.0], &[3])?);
    let fetched = run_single_node(graph, feeds, "y")?;
    assert_eq!(
        common::fetched_f32(&fetched)?,
        vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]
    );
    Ok(())
}

#[test]
fn gemm_applies_alpha_beta_and_transpose() -> Result<()> {
    let mut graph = Graph::new("gemm");
    graph.add_input("a", DType::F32, Some(vec![2, 2]));
    graph.add_initializer("b", Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], &[2, 2])?);
    graph.add_initializer("c", Tensor::from_vec(vec![1.0f32, 1.0], &[2])?);
    graph.add_node(
        "gemm0",
        OpKind::Gemm,
        vec!["a".into(), "b".into(), "c".into()],
        vec!["y".into()],
        Attributes::none()
            .with("alpha", AttrValue::Float(2.0))
            .with("beta", AttrValue::Float(0.5))
            .with("transB", AttrValue::Int(1)),
    );
    graph.add_output("y");

    let mut feeds = HashMap::new();
    feeds.insert(
        "a".to_string(),
        common::feed_f32(vec![1.0, 0.0, 0.0, 1.0], &[2, 2])?,
    );
    let fetched = run_single_node(graph, feeds, "y")?;
    // 2 * I * B^T + 0.5 * [1, 1]
    assert_eq!(
        common::fetched_f32(&fetched)?,
        vec![2.5, 6.5, 4.5, 8.5]
    );
    Ok(())
}

#[test]
fn conv_computes_a_padded_3x3_window() -> Result<()> {
    let mut graph = Graph::new("conv");
    graph.add_input("x", DType::F32, Some(vec![1, 1, 3, 3]));
    graph.add_initializer("w", Tensor::from_vec(vec![1.0f32; 9], &[1, 1, 3, 3])?);
    graph.add_node(
        "conv0",
        OpKind::Conv,
        vec!["x".into(), "w".into()],
        vec!["y".into()],
        Attributes::none().with("pads", AttrValue::Ints(vec![1, 1, 1, 1])),
    );
    graph.add_output("y");

    let mut feeds = HashMap::new();
    feeds.insert(
        "x".to_string(),
        common::feed_f32((1..=9).map(|v| v as f32).collect(), &[1, 1, 3, 3])?,
    );
    let fetched = run_single_node(graph, feeds, "y")?;
    // Sliding 3x3 sums over the zero-padded input.
    assert_eq!(
        common::fetched_f32(&fetched)?,
        vec![12.0, 21.0, 16.0, 27.0, 45.0, 33.0, 24.0, 39.0, 28.0]
    );
    Ok(())
}

#[test]
fn slice_extracts_interior_rows() -> Result<()> {
    let mut graph = Graph::new("slice");
    graph.add_input("x", DType::F32, Some(vec![3, 2]));
    graph.add_node(
        "slice0",
        OpKind::Slice,
        vec!["x".into()],
        vec!["y".into()],
        Attributes::none()
            .with("starts", AttrValue::Ints(vec![1]))
            .with("ends", AttrValue::Ints(vec![3]))
            .with("axes", AttrValue::Ints(vec![0])),
    );
    graph.add_output("y");

    let mut feeds = HashMap::new();
    feeds.insert(
        "x".to_string(),
        common::feed_f32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2])?,
    );
    let fetched = run_single_node(graph, feeds, "y")?;
    let result = common::fetched_tensor(&fetched)?;
    assert_eq!(result.shape(), &[2, 2]);
    assert_eq!(result.to_vec::<f32>()?, vec![3.0, 4.0, 5.0, 6.0]);
    Ok(())
}

#[test]
fn eye_like_writes_the_shifted_diagonal() -> Result<()> {
    let mut graph = Graph::new("eye_like");
    graph.add_input("x", DType::F32, Some(vec![3, 3]));
    graph.add_node(
        "eye0",
        OpKind::EyeLike,
        vec!["x".into()],
        vec!["y".into()],
        Attributes::none().with("k", AttrValue::Int(1)),
    );
    graph.add_output("y");

    let mut feeds = HashMap::new();
    feeds.insert("x".to_string(), common::feed_f32(vec![7.0; 9], &[3, 3])?);
    let fetched = run_single_node(graph, feeds, "y")?;
    assert_eq!(
        common::fetched_f32(&fetched)?,
        vec![0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]
    );
    Ok(())
}

#[test]
fn constant_fill_uses_the_shape_attribute() -> Result<()> {
    let mut graph = Graph::new("constant_fill");
    // ConstantFill takes no inputs here; keep a dummy input so the graph
    // has something to feed.
    graph.add_input("x", DType::F32, Some(vec![1]));
    graph.add_node(
        "fill0",
        OpKind::ConstantFill,
        vec![],
        vec!["filled".into()],
        Attributes::none()
            .with("shape", AttrValue::Ints(vec![2, 2]))
            .with("value", AttrValue::Float(0.25)),
    );
    graph.add_node(
        "mul0",
        OpKind::Mul,
        vec!["filled".into(), "x".into()],
        vec!["y".into()],
        Attributes::none(),
    );
    graph.add_output("y");

    let mut feeds = HashMap::new();
    feeds.insert("x".to_string(), common::feed_f32(vec![4.0], &[1])?);
    let fetched = run_single_node(graph, feeds, "y")?;
    assert_eq!(common::fetched_f32(&fetched)?, vec![1.0; 4]);
    Ok(())
}

#[test]
fn max_folds_variadic_inputs() -> Result<()> {
    let mut graph = Graph::new("max");
    graph.add_input("a", DType::F32, Some(vec![3]));
    graph.add_input("b", DType::F32, Some(vec![3]));
    graph.add_input("c", DType::F32, Some(vec![3]));
    graph.add_node(
        "max0",
        OpKind::Max,
        vec!["a".into(), "b".into(), "c".into()],
        vec!["y".into()],
        Attributes::none(),
    );
    graph.add_output("y");

    let mut feeds = HashMap::new();
    feeds.insert("a".to_string(), common::feed_f32(vec![1.0, 5.0, 3.0], &[3])?);
    feeds.insert("b".to_string(), common::feed_f32(vec![4.0, 2.0, 6.0], &[3])?);
    feeds.insert("c".to_string(), common::feed_f32(vec![0.0, 0.0, 9.0], &[3])?);
    let fetched = run_single_node(graph, feeds, "y")?;
    assert_eq!(common::fetched_f32(&fetched)?, vec![4.0, 5.0, 9.0]);
    Ok(())
}

#[test]
fn int64_arithmetic_stays_exact() -> Result<()> {
    let mut graph = Graph::new("int_sub");
    graph.add_input("a", DType::I64, Some(vec![3]));
    graph.add_input("b", DType::I64, Some(vec![3]));
    graph.add_node(
        "sub0",
        OpKind::Sub,
        vec!["a".into(), "b".into()],
        vec!["y".into()],
        Attributes::none(),
    );
    graph.add_output("y");

    let mut feeds = HashMap::new();
    feeds.insert(
        "a".to_string(),
        common::feed_i64(vec![1_000_000_000_000, 5, -7], &[3])?,
    );
    feeds.insert("b".to_string(), common::feed_i64(vec![1, 10, -7], &[3])?);
    let fetched = run_single_node(graph, feeds, "y")?;
    assert_eq!(
        common::fetched_tensor(&fetched)?.to_vec::<i64>()?,
        vec![999_999_999_999, -5, 0]
    );
    Ok(())
}
