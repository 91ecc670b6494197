mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use graphinfer::{
    Attributes, DType, EngineError, ExecutionFrame, Graph, Model, OpKind, ParallelExecutor,
    RunOptions, Session, SessionOptions, Tensor,
};

fn diamond_graph() -> Graph {
    // x -> {Abs, Relu} -> Add -> y
    let mut graph = Graph::new("diamond");
    graph.add_input("x", DType::F32, Some(vec![4]));
    graph.add_node(
        "a",
        OpKind::Abs,
        vec!["x".into()],
        vec!["a_out".into()],
        Attributes::none(),
    );
    graph.add_node(
        "b",
        OpKind::Relu,
        vec!["x".into()],
        vec!["b_out".into()],
        Attributes::none(),
    );
    graph.add_node(
        "c",
        OpKind::Add,
        vec!["a_out".into(), "b_out".into()],
        vec!["y".into()],
        Attributes::none(),
    );
    graph.add_output("y");
    graph
}

fn sequential_session(graph: Graph) -> Result<Session> {
    let mut session = Session::new(SessionOptions::default())?;
    session.load(Model::new(graph))?;
    session.initialize()?;
    Ok(session)
}

fn parallel_session(graph: Graph) -> Result<Session> {
    let options = SessionOptions {
        enable_sequential_execution: false,
        session_thread_pool_size: 4,
        ..SessionOptions::default()
    };
    let mut session = Session::new(options)?;
    session.load(Model::new(graph))?;
    session.initialize()?;
    Ok(session)
}

#[test]
fn parallel_and_sequential_executions_agree() -> Result<()> {
    let sequential = sequential_session(diamond_graph())?;
    let parallel = parallel_session(diamond_graph())?;

    let mut feeds = HashMap::new();
    feeds.insert(
        "x".to_string(),
        common::feed_f32(vec![-1.0, 2.0, -3.0, 4.0], &[4])?,
    );

    let from_sequential = sequential.run(&feeds, &["y".to_string()])?;
    let from_parallel = parallel.run(&feeds, &["y".to_string()])?;

    let expected = vec![1.0, 4.0, 3.0, 8.0];
    assert_eq!(common::fetched_f32(&from_sequential[0])?, expected);
    assert_eq!(common::fetched_f32(&from_parallel[0])?, expected);
    Ok(())
}

#[test]
fn parallel_executor_drains_outstanding_work() -> Result<()> {
    let session = parallel_session(diamond_graph())?;
    let state = session.state().expect("initialized");

    let mut feeds = HashMap::new();
    feeds.insert(
        "x".to_string(),
        common::feed_f32(vec![-1.0, 2.0, -3.0, 4.0], &[4])?,
    );
    let outputs = vec!["y".to_string()];
    let frame = ExecutionFrame::new(state, &feeds, &outputs, None)?;

    let pool = Arc::new(rayon::ThreadPoolBuilder::new().num_threads(2).build()?);
    let executor = ParallelExecutor::new(pool, Arc::new(AtomicBool::new(false)));
    let fetched = executor.execute(state, &frame, &outputs)?;

    assert_eq!(executor.outstanding(), 0);
    assert_eq!(common::fetched_f32(&fetched[0])?, vec![1.0, 4.0, 3.0, 8.0]);
    Ok(())
}

#[test]
fn values_are_created_at_most_once_per_run() -> Result<()> {
    let session = sequential_session(diamond_graph())?;
    let state = session.state().expect("initialized");

    let mut feeds = HashMap::new();
    feeds.insert(
        "x".to_string(),
        common::feed_f32(vec![1.0, 2.0, 3.0, 4.0], &[4])?,
    );
    let outputs = vec!["y".to_string()];
    let frame = ExecutionFrame::new(state, &feeds, &outputs, None)?;

    let index = frame.index_of("a_out")?;
    let first = frame.get_or_create(index, DType::F32, &[4])?;
    let second = frame.get_or_create(index, DType::F32, &[4])?;
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(frame.creation_count(), 1);
    Ok(())
}

#[test]
fn releasing_values_is_idempotent_and_spares_fetches() -> Result<()> {
    let session = sequential_session(diamond_graph())?;
    let state = session.state().expect("initialized");

    let mut feeds = HashMap::new();
    feeds.insert(
        "x".to_string(),
        common::feed_f32(vec![1.0, 2.0, 3.0, 4.0], &[4])?,
    );
    let outputs = vec!["y".to_string()];
    let frame = ExecutionFrame::new(state, &feeds, &outputs, None)?;

    let intermediate = frame.index_of("a_out")?;
    frame.get_or_create(intermediate, DType::F32, &[4])?;
    frame.release_value(intermediate)?;
    frame.release_value(intermediate)?;
    assert!(!frame.value(intermediate)?.is_allocated());

    let fetched = frame.index_of("y")?;
    frame.get_or_create(fetched, DType::F32, &[4])?;
    frame.release_value(fetched)?;
    assert!(frame.value(fetched)?.is_allocated());
    Ok(())
}

#[test]
fn pattern_cache_hits_after_first_run_with_same_shapes() -> Result<()> {
    let session = sequential_session(diamond_graph())?;
    let state = session.state().expect("initialized");

    let mut feeds = HashMap::new();
    feeds.insert(
        "x".to_string(),
        common::feed_f32(vec![1.0, -2.0, 3.0, -4.0], &[4])?,
    );
    let outputs = vec!["y".to_string()];

    session.run(&feeds, &outputs)?;
    assert_eq!(state.cached_pattern_count(), 1);
    session.run(&feeds, &outputs)?;
    // Same shape tuple: still a single cached template.
    assert_eq!(state.cached_pattern_count(), 1);

    // A hit realizes exactly one arena allocation per device.
    let key = vec![vec![4usize]];
    let pattern = state.cached_pattern(&key).expect("cached pattern");
    let frame = ExecutionFrame::new(state, &feeds, &outputs, Some(pattern))?;
    assert_eq!(frame.arena_allocation_count(), 1);
    Ok(())
}

#[test]
fn preset_terminate_flag_cancels_before_any_node() -> Result<()> {
    let session = sequential_session(diamond_graph())?;

    let mut feeds = HashMap::new();
    feeds.insert(
        "x".to_string(),
        common::feed_f32(vec![1.0, 2.0, 3.0, 4.0], &[4])?,
    );

    let run_options = RunOptions {
        terminate: Some(Arc::new(AtomicBool::new(true))),
        ..RunOptions::default()
    };
    let mut fetches = Vec::new();
    let err = session
        .run_with_options(&run_options, &feeds, &["y".to_string()], &mut fetches)
        .expect_err("terminated run must fail");
    assert!(EngineError::is_terminated(&err), "got {:#}", err);
    Ok(())
}

#[test]
fn terminate_mid_run_aborts_a_long_chain() -> Result<()> {
    // A chain of convolutions big enough to outlive the flag flip.
    let mut graph = Graph::new("slow_chain");
    graph.add_input("x", DType::F32, Some(vec![1, 8, 48, 48]));
    graph.add_initializer(
        "w",
        Tensor::from_vec(vec![0.01f32; 8 * 8 * 3 * 3], &[8, 8, 3, 3])?,
    );
    let mut previous = "x".to_string();
    for i in 0..100 {
        let output = format!("conv_{}", i);
        graph.add_node(
            format!("node_{}", i),
            OpKind::Conv,
            vec![previous.clone(), "w".into()],
            vec![output.clone()],
            Attributes::none().with("pads", graphinfer::AttrValue::Ints(vec![1, 1, 1, 1])),
        );
        previous = output;
    }
    graph.add_output(previous.clone());

    let options = SessionOptions {
        enable_sequential_execution: false,
        session_thread_pool_size: 2,
        enable_default_transformers: false,
        ..SessionOptions::default()
    };
    let mut session = Session::new(options)?;
    session.load(Model::new(graph))?;
    session.initialize()?;

    let mut feeds = HashMap::new();
    feeds.insert(
        "x".to_string(),
        common::feed_f32(vec![1.0; 8 * 48 * 48], &[1, 8, 48, 48])?,
    );

    let terminate = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&terminate);
    let killer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        flag.store(true, Ordering::Relaxed);
    });

    let run_options = RunOptions {
        terminate: Some(terminate),
        ..RunOptions::default()
    };
    let mut fetches = Vec::new();
    let err = session
        .run_with_options(&run_options, &feeds, &[previous], &mut fetches)
        .expect_err("terminated run must fail");
    killer.join().expect("killer thread");
    assert!(EngineError::is_terminated(&err), "got {:#}", err);
    Ok(())
}
