mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use graphinfer::{
    AttrValue, Attributes, DType, Graph, GraphTransformer, Model, OpKind, Session, SessionOptions,
    Tensor, TransformerManager,
};

fn make_session(graph: Graph, enable_default_transformers: bool) -> Result<Session> {
    let options = SessionOptions {
        enable_default_transformers,
        ..SessionOptions::default()
    };
    let mut session = Session::new(options)?;
    session.load(Model::new(graph))?;
    session.initialize()?;
    Ok(session)
}

#[test]
fn identity_elimination_removes_node_and_preserves_output() -> Result<()> {
    let mut graph = Graph::new("abs_id_max");
    graph.add_input("x", DType::F32, Some(vec![3]));
    graph.add_node(
        "abs0",
        OpKind::Abs,
        vec!["x".into()],
        vec!["abs_out".into()],
        Attributes::none(),
    );
    graph.add_node(
        "id0",
        OpKind::Identity,
        vec!["abs_out".into()],
        vec!["id_out".into()],
        Attributes::none(),
    );
    graph.add_node(
        "max0",
        OpKind::Max,
        vec!["id_out".into()],
        vec!["y".into()],
        Attributes::none(),
    );
    graph.add_output("y");

    let session = make_session(graph, true)?;
    let state = session.state().expect("initialized");
    assert_eq!(common::op_count(state.graph(), OpKind::Identity), 0);

    let mut feeds = HashMap::new();
    feeds.insert("x".to_string(), common::feed_f32(vec![-3.0, 0.0, 2.0], &[3])?);
    let fetched = session.run(&feeds, &["y".to_string()])?;
    assert_eq!(common::fetched_f32(&fetched[0])?, vec![3.0, 0.0, 2.0]);
    Ok(())
}

#[test]
fn conv_bn_fusion_matches_closed_form() -> Result<()> {
    let session = make_session(common::conv_bn_graph()?, true)?;
    let state = session.state().expect("initialized");
    let graph = state.graph();

    assert_eq!(common::op_count(graph, OpKind::BatchNormalization), 0);
    assert_eq!(common::op_count(graph, OpKind::Conv), 1);

    // s = 2 / sqrt(3 + 1e-5)
    let fused_w = graph.initializer("w").expect("fused weight");
    let w_value = fused_w.to_vec::<f32>()?[0];
    assert!((w_value - 1.154_700_4).abs() < 1e-5, "W' was {}", w_value);

    let fused_bias = graph.initializer("bn_b").expect("synthesized bias");
    assert!((fused_bias.to_vec::<f32>()?[0] - 1.0).abs() < 1e-6);

    // BN parameters the fusion consumed are gone.
    assert!(graph.initializer("bn_scale").is_none());
    assert!(graph.initializer("bn_mean").is_none());
    assert!(graph.initializer("bn_var").is_none());

    let mut feeds = HashMap::new();
    feeds.insert("x".to_string(), common::feed_f32(vec![1.0], &[1, 1, 1, 1])?);
    let fetched = session.run(&feeds, &["y".to_string()])?;
    let result = common::fetched_f32(&fetched[0])?[0];
    assert!((result - 2.154_700_4).abs() < 1e-5, "fused run was {}", result);
    Ok(())
}

#[test]
fn conv_bn_fusion_is_equivalent_to_unfused_graph() -> Result<()> {
    let fused = make_session(common::conv_bn_graph()?, true)?;
    let baseline = make_session(common::conv_bn_graph()?, false)?;

    let mut feeds = HashMap::new();
    feeds.insert("x".to_string(), common::feed_f32(vec![1.0], &[1, 1, 1, 1])?);
    let from_fused = fused.run(&feeds, &["y".to_string()])?;
    let from_baseline = baseline.run(&feeds, &["y".to_string()])?;

    common::assert_tensor_close(
        &common::fetched_tensor(&from_fused[0])?,
        &common::fetched_tensor(&from_baseline[0])?,
    )
}

#[test]
fn conv_bn_mul_add_chain_collapses_into_one_conv() -> Result<()> {
    let build = || -> Result<Graph> {
        let mut graph = Graph::new("conv_bn_mul_add");
        graph.add_input("x", DType::F32, Some(vec![1, 1, 1, 1]));
        graph.add_initializer("w", Tensor::from_vec(vec![1.0f32], &[1, 1, 1, 1])?);
        graph.add_initializer("bn_scale", Tensor::from_vec(vec![2.0f32], &[1])?);
        graph.add_initializer("bn_b", Tensor::from_vec(vec![1.0f32], &[1])?);
        graph.add_initializer("bn_mean", Tensor::from_vec(vec![0.0f32], &[1])?);
        graph.add_initializer("bn_var", Tensor::from_vec(vec![3.0f32], &[1])?);
        graph.add_initializer("mul_c", Tensor::from_vec(vec![3.0f32], &[1, 1, 1])?);
        graph.add_initializer("add_c", Tensor::from_vec(vec![0.5f32], &[1, 1, 1])?);
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
            Attributes::none().with("epsilon", AttrValue::Float(1e-5)),
        );
        graph.add_node(
            "mul0",
            OpKind::Mul,
            vec!["bn_out".into(), "mul_c".into()],
            vec!["mul_out".into()],
            Attributes::none(),
        );
        graph.add_node(
            "add0",
            OpKind::Add,
            vec!["mul_out".into(), "add_c".into()],
            vec!["add_out".into()],
            Attributes::none(),
        );
        graph.add_node(
            "out0",
            OpKind::Identity,
            vec!["add_out".into()],
            vec!["y".into()],
            Attributes::none(),
        );
        graph.add_output("y");
        Ok(graph)
    };

    let fused = make_session(build()?, true)?;
    let graph = fused.state().expect("initialized").graph();
    assert_eq!(common::op_count(graph, OpKind::BatchNormalization), 0);
    assert_eq!(common::op_count(graph, OpKind::Mul), 0);
    assert_eq!(common::op_count(graph, OpKind::Add), 0);
    assert_eq!(common::op_count(graph, OpKind::Conv), 1);

    let baseline = make_session(build()?, false)?;
    let mut feeds = HashMap::new();
    feeds.insert("x".to_string(), common::feed_f32(vec![1.0], &[1, 1, 1, 1])?);
    let from_fused = fused.run(&feeds, &["y".to_string()])?;
    let from_baseline = baseline.run(&feeds, &["y".to_string()])?;
    common::assert_tensor_close(
        &common::fetched_tensor(&from_fused[0])?,
        &common::fetched_tensor(&from_baseline[0])?,
    )?;

    // ((2 / sqrt(3 + eps)) + 1) * 3 + 0.5
    let value = common::fetched_f32(&from_fused[0])?[0];
    assert!((value - 6.964_101).abs() < 1e-4, "fused chain was {}", value);
    Ok(())
}

#[test]
fn trivial_slice_is_eliminated() -> Result<()> {
    let mut graph = Graph::new("slice_noop");
    graph.add_input("x", DType::F32, Some(vec![2, 4]));
    graph.add_node(
        "slice0",
        OpKind::Slice,
        vec!["x".into()],
        vec!["slice_out".into()],
        Attributes::none()
            .with("starts", AttrValue::Ints(vec![0, 0]))
            .with("ends", AttrValue::Ints(vec![i64::MAX, i64::MAX]))
            .with("axes", AttrValue::Ints(vec![0, 1])),
    );
    graph.add_node(
        "abs0",
        OpKind::Abs,
        vec!["slice_out".into()],
        vec!["y".into()],
        Attributes::none(),
    );
    graph.add_output("y");

    let session = make_session(graph, true)?;
    assert_eq!(
        common::op_count(session.state().expect("initialized").graph(), OpKind::Slice),
        0
    );

    let input: Vec<f32> = (1..=8).map(|v| v as f32).collect();
    let mut feeds = HashMap::new();
    feeds.insert("x".to_string(), common::feed_f32(input.clone(), &[2, 4])?);
    let fetched = session.run(&feeds, &["y".to_string()])?;
    assert_eq!(common::fetched_f32(&fetched[0])?, input);
    Ok(())
}

#[test]
fn constant_inputs_are_folded_offline() -> Result<()> {
    let mut graph = Graph::new("const_fold");
    graph.add_input("x", DType::F32, Some(vec![2]));
    graph.add_initializer("c1", Tensor::from_vec(vec![1.0f32, 2.0], &[2])?);
    graph.add_initializer("c2", Tensor::from_vec(vec![10.0f32, 20.0], &[2])?);
    graph.add_node(
        "add0",
        OpKind::Add,
        vec!["c1".into(), "c2".into()],
        vec!["sum".into()],
        Attributes::none(),
    );
    graph.add_node(
        "mul0",
        OpKind::Mul,
        vec!["x".into(), "sum".into()],
        vec!["y".into()],
        Attributes::none(),
    );
    graph.add_output("y");

    let session = make_session(graph, true)?;
    let state = session.state().expect("initialized");
    assert_eq!(common::op_count(state.graph(), OpKind::Add), 0);
    let folded = state.graph().initializer("sum").expect("folded constant");
    assert_eq!(folded.to_vec::<f32>()?, vec![11.0, 22.0]);

    let mut feeds = HashMap::new();
    feeds.insert("x".to_string(), common::feed_f32(vec![2.0, 3.0], &[2])?);
    let fetched = session.run(&feeds, &["y".to_string()])?;
    assert_eq!(common::fetched_f32(&fetched[0])?, vec![22.0, 66.0]);
    Ok(())
}

#[test]
fn unsqueeze_of_initializer_is_folded_into_its_shape() -> Result<()> {
    let mut graph = Graph::new("unsqueeze_elim");
    graph.add_input("x", DType::F32, Some(vec![1, 3]));
    graph.add_initializer("c", Tensor::from_vec(vec![1.0f32, 2.0, 3.0], &[3])?);
    graph.add_node(
        "unsqueeze0",
        OpKind::Unsqueeze,
        vec!["c".into()],
        vec!["c_row".into()],
        Attributes::none().with("axes", AttrValue::Ints(vec![0])),
    );
    graph.add_node(
        "add0",
        OpKind::Add,
        vec!["x".into(), "c_row".into()],
        vec!["y".into()],
        Attributes::none(),
    );
    graph.add_output("y");

    let session = make_session(graph, true)?;
    let state = session.state().expect("initialized");
    assert_eq!(common::op_count(state.graph(), OpKind::Unsqueeze), 0);
    let reshaped = state.graph().initializer("c_row").expect("moved constant");
    assert_eq!(reshaped.shape(), &[1, 3]);

    let mut feeds = HashMap::new();
    feeds.insert("x".to_string(), common::feed_f32(vec![1.0, 1.0, 1.0], &[1, 3])?);
    let fetched = session.run(&feeds, &["y".to_string()])?;
    assert_eq!(common::fetched_f32(&fetched[0])?, vec![2.0, 3.0, 4.0]);
    Ok(())
}

#[test]
fn rewritten_graph_resolves_cleanly() -> Result<()> {
    let session = make_session(common::conv_bn_graph()?, true)?;
    let graph = session.state().expect("initialized").graph();
    assert!(graph.is_resolved());
    // Every remaining node input resolves to something live.
    for node in graph.nodes() {
        for input in node.present_inputs() {
            let known = graph.is_initializer(input)
                || graph.inputs().contains(input)
                || graph.producer_of(input)?.is_some();
            assert!(known, "dangling input {}", input);
        }
    }
    Ok(())
}

struct AlwaysModifies {
    passes: std::sync::Arc<AtomicUsize>,
}

impl GraphTransformer for AlwaysModifies {
    fn name(&self) -> &str {
        "always_modifies"
    }

    fn apply(&self, _graph: &mut Graph, modified: &mut bool) -> anyhow::Result<()> {
        self.passes.fetch_add(1, Ordering::Relaxed);
        *modified = true;
        Ok(())
    }
}

#[test]
fn step_cap_bounds_an_oscillating_transformer() -> Result<()> {
    let mut graph = Graph::new("cap");
    graph.add_input("x", DType::F32, Some(vec![1]));
    graph.add_node(
        "abs0",
        OpKind::Abs,
        vec!["x".into()],
        vec!["y".into()],
        Attributes::none(),
    );
    graph.add_output("y");

    let passes = std::sync::Arc::new(AtomicUsize::new(0));
    let mut manager = TransformerManager::new(3);
    manager.register(Box::new(AlwaysModifies {
        passes: std::sync::Arc::clone(&passes),
    }));
    manager.apply_all(&mut graph)?;

    // The transformer claims a modification every pass, so only the cap
    // stops the loop.
    assert_eq!(passes.load(Ordering::Relaxed), 3);
    Ok(())
}
