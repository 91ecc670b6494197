mod common;

use std::collections::HashMap;

use anyhow::Result;
use graphinfer::{
    AttrValue, Attributes, DType, EngineError, Graph, Model, OpKind, Session, SessionOptions,
};

fn simple_graph() -> Graph {
    let mut graph = Graph::new("simple");
    graph.add_input("x", DType::F32, Some(vec![2]));
    graph.add_node(
        "abs0",
        OpKind::Abs,
        vec!["x".into()],
        vec!["y".into()],
        Attributes::none(),
    );
    graph.add_output("y");
    graph
}

#[test]
fn loading_twice_reports_model_already_loaded() -> Result<()> {
    let mut session = Session::new(SessionOptions::default())?;
    session.load(Model::new(simple_graph()))?;
    let err = session
        .load(Model::new(simple_graph()))
        .expect_err("second load must fail");
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::ModelAlreadyLoaded)
    ));
    Ok(())
}

#[test]
fn malformed_model_text_is_an_invalid_model() -> Result<()> {
    let mut session = Session::new(SessionOptions::default())?;
    let err = session
        .load_from_json("{ not json }")
        .expect_err("parse must fail");
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::InvalidModel(_))
    ));
    Ok(())
}

#[test]
fn model_round_trips_through_json() -> Result<()> {
    let model = Model::new(simple_graph());
    let text = model.to_json()?;

    let mut session = Session::new(SessionOptions::default())?;
    session.load_from_json(&text)?;
    session.initialize()?;

    let mut feeds = HashMap::new();
    feeds.insert("x".to_string(), common::feed_f32(vec![-2.0, 4.0], &[2])?);
    let fetched = session.run(&feeds, &["y".to_string()])?;
    assert_eq!(common::fetched_f32(&fetched[0])?, vec![2.0, 4.0]);
    Ok(())
}

#[test]
fn missing_feed_is_rejected_before_execution() -> Result<()> {
    let mut session = Session::new(SessionOptions::default())?;
    session.load(Model::new(simple_graph()))?;
    session.initialize()?;

    let feeds = HashMap::new();
    let err = session
        .run(&feeds, &["y".to_string()])
        .expect_err("missing feed must fail");
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::InvalidArgument(_))
    ));
    Ok(())
}

#[test]
fn unknown_feed_name_is_rejected() -> Result<()> {
    let mut session = Session::new(SessionOptions::default())?;
    session.load(Model::new(simple_graph()))?;
    session.initialize()?;

    let mut feeds = HashMap::new();
    feeds.insert("x".to_string(), common::feed_f32(vec![1.0, 2.0], &[2])?);
    feeds.insert("bogus".to_string(), common::feed_f32(vec![1.0], &[1])?);
    let err = session
        .run(&feeds, &["y".to_string()])
        .expect_err("unknown feed must fail");
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::InvalidArgument(_))
    ));
    Ok(())
}

#[test]
fn feed_with_wrong_dtype_is_rejected() -> Result<()> {
    let mut session = Session::new(SessionOptions::default())?;
    session.load(Model::new(simple_graph()))?;
    session.initialize()?;

    let mut feeds = HashMap::new();
    feeds.insert("x".to_string(), common::feed_i32(vec![1, 2], &[2])?);
    let err = session
        .run(&feeds, &["y".to_string()])
        .expect_err("dtype mismatch must fail");
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::InvalidArgument(_))
    ));
    Ok(())
}

#[test]
fn invalid_output_name_is_rejected() -> Result<()> {
    let mut session = Session::new(SessionOptions::default())?;
    session.load(Model::new(simple_graph()))?;
    session.initialize()?;

    let mut feeds = HashMap::new();
    feeds.insert("x".to_string(), common::feed_f32(vec![1.0, 2.0], &[2])?);
    let err = session
        .run(&feeds, &["nope".to_string()])
        .expect_err("invalid output must fail");
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::InvalidArgument(_))
    ));
    Ok(())
}

#[test]
fn empty_output_list_is_rejected() -> Result<()> {
    let mut session = Session::new(SessionOptions::default())?;
    session.load(Model::new(simple_graph()))?;
    session.initialize()?;

    let mut feeds = HashMap::new();
    feeds.insert("x".to_string(), common::feed_f32(vec![1.0, 2.0], &[2])?);
    let err = session.run(&feeds, &[]).expect_err("no outputs requested");
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::InvalidArgument(_))
    ));
    Ok(())
}

#[test]
fn run_before_initialize_fails_cleanly() -> Result<()> {
    let mut session = Session::new(SessionOptions::default())?;
    session.load(Model::new(simple_graph()))?;

    let mut feeds = HashMap::new();
    feeds.insert("x".to_string(), common::feed_f32(vec![1.0, 2.0], &[2])?);
    assert!(session.run(&feeds, &["y".to_string()]).is_err());
    Ok(())
}

#[test]
fn session_stays_usable_after_a_failed_run() -> Result<()> {
    let mut session = Session::new(SessionOptions::default())?;
    session.load(Model::new(simple_graph()))?;
    session.initialize()?;

    let bad = HashMap::new();
    assert!(session.run(&bad, &["y".to_string()]).is_err());

    let mut feeds = HashMap::new();
    feeds.insert("x".to_string(), common::feed_f32(vec![-1.0, 1.0], &[2])?);
    let fetched = session.run(&feeds, &["y".to_string()])?;
    assert_eq!(common::fetched_f32(&fetched[0])?, vec![1.0, 1.0]);
    Ok(())
}

fn branch_graph(op: OpKind, output: &str) -> Graph {
    let mut branch = Graph::new(format!("branch_{}", output));
    branch.add_node(
        format!("{}_node", output),
        op,
        vec!["x".into()],
        vec![output.to_string()],
        Attributes::none(),
    );
    branch.add_output(output.to_string());
    branch
}

#[test]
fn if_node_runs_the_selected_subgraph_with_outer_inputs() -> Result<()> {
    // then: |x|, else: relu(x); both read the outer value x implicitly.
    let mut graph = Graph::new("conditional");
    graph.add_input("cond", DType::I64, Some(vec![1]));
    graph.add_input("x", DType::F32, Some(vec![3]));
    graph.add_node(
        "if0",
        OpKind::If,
        vec!["cond".into()],
        vec!["y".into()],
        Attributes::none()
            .with(
                "then_branch",
                AttrValue::Graph(branch_graph(OpKind::Abs, "then_out")),
            )
            .with(
                "else_branch",
                AttrValue::Graph(branch_graph(OpKind::Relu, "else_out")),
            ),
    );
    graph.add_output("y");

    let mut session = Session::new(SessionOptions::default())?;
    session.load(Model::new(graph))?;
    session.initialize()?;

    let mut feeds = HashMap::new();
    feeds.insert("x".to_string(), common::feed_f32(vec![-2.0, 0.0, 3.0], &[3])?);

    feeds.insert("cond".to_string(), common::feed_i64(vec![1], &[1])?);
    let fetched = session.run(&feeds, &["y".to_string()])?;
    assert_eq!(common::fetched_f32(&fetched[0])?, vec![2.0, 0.0, 3.0]);

    feeds.insert("cond".to_string(), common::feed_i64(vec![0], &[1])?);
    let fetched = session.run(&feeds, &["y".to_string()])?;
    assert_eq!(common::fetched_f32(&fetched[0])?, vec![0.0, 0.0, 3.0]);
    Ok(())
}

#[test]
fn profiling_writes_a_json_file() -> Result<()> {
    let prefix = std::env::temp_dir().join("graphinfer_profile_test");
    let options = SessionOptions {
        enable_profiling: true,
        profile_file_prefix: prefix.to_string_lossy().to_string(),
        ..SessionOptions::default()
    };
    let mut session = Session::new(options)?;
    session.load(Model::new(simple_graph()))?;
    session.initialize()?;

    let mut feeds = HashMap::new();
    feeds.insert("x".to_string(), common::feed_f32(vec![1.0, -1.0], &[2])?);
    session.run(&feeds, &["y".to_string()])?;

    let path = session.end_profiling().expect("profile file");
    let body = std::fs::read_to_string(&path)?;
    assert!(body.contains("model_run"));
    std::fs::remove_file(&path).ok();
    Ok(())
}
